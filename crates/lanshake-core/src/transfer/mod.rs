//! Transfer group negotiation and data phase.
//!
//! A [`TransferGroup`] is one negotiated transfer between this device and a
//! peer. Its lifecycle:
//!
//! ```text
//! CREATED ─▶ INDEX_SENT ─▶ ACCEPTED ─▶ IN_PROGRESS ─▶ COMPLETED
//!    │           │   └────▶ REJECTED        │
//!    └───────────┴──────────────────────────┴──▶ FAILED | CANCELLED
//! ```
//!
//! - a restricted counterpart is rejected while still `CREATED`
//! - no decision within the response timeout ends in `FAILED` (`Timeout`)
//! - cancelling drops the in-flight socket and surfaces `Interrupted`
//! - an I/O failure while `IN_PROGRESS` records `skippedBytes`; there is no resume
//!
//! Incoming groups start at `CREATED` once their index is received and move
//! straight to `ACCEPTED` or `REJECTED` on the local decision.

mod data;
pub mod ports;

pub use ports::{PortAllocator, PortLease};

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{configure_tcp_keepalive, ConnectionHandler};
use crate::error::{Error, Result};
use crate::protocol::{self, keys, ErrorKind, FileIndexEntry, Message};
use crate::registry::DeviceRegistry;
use crate::sequence::SequenceGenerator;
use crate::store::Store;

/// Transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    /// Index assembled, nothing sent yet
    Created,
    /// Index sent, awaiting the decision
    IndexSent,
    /// Peer accepted; data port allocated
    Accepted,
    /// Peer or local policy refused
    Rejected,
    /// Entries are moving
    InProgress,
    /// All entries stored and acknowledged
    Completed,
    /// Ended by an error
    Failed,
    /// Ended by the user
    Cancelled,
}

impl TransferState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Completed | Self::Failed | Self::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use TransferState::{
            Accepted, Cancelled, Completed, Created, Failed, InProgress, IndexSent, Rejected,
        };
        match (self, next) {
            (Created, IndexSent | Accepted | Rejected)
            | (IndexSent, Accepted | Rejected)
            | (Accepted, InProgress)
            | (InProgress, Completed) => true,
            (from, Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::IndexSent => "INDEX_SENT",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// This device sends
    Outgoing,
    /// This device receives
    Incoming,
}

/// One negotiated transfer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferGroup {
    /// Generated group id
    pub group_id: u64,
    /// Counterpart device
    pub device_id: String,
    /// Who sends
    pub direction: TransferDirection,
    entries: Vec<FileIndexEntry>,
    socket_port: Option<u16>,
    state: TransferState,
    skipped_bytes: u64,
    failure: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TransferGroup {
    fn new(
        group_id: u64,
        device_id: impl Into<String>,
        direction: TransferDirection,
        entries: Vec<FileIndexEntry>,
    ) -> Self {
        let now = crate::now_millis();
        Self {
            group_id,
            device_id: device_id.into(),
            direction,
            entries,
            socket_port: None,
            state: TransferState::Created,
            skipped_bytes: 0,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A group this device will send.
    pub fn outgoing(group_id: u64, device_id: impl Into<String>, entries: Vec<FileIndexEntry>) -> Self {
        Self::new(group_id, device_id, TransferDirection::Outgoing, entries)
    }

    /// A group offered by a peer.
    pub fn incoming(group_id: u64, device_id: impl Into<String>, entries: Vec<FileIndexEntry>) -> Self {
        Self::new(group_id, device_id, TransferDirection::Incoming, entries)
    }

    /// The file index; fixed for the lifetime of the group.
    #[must_use]
    pub fn entries(&self) -> &[FileIndexEntry] {
        &self.entries
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Data-phase port, once allocated.
    #[must_use]
    pub fn socket_port(&self) -> Option<u16> {
        self.socket_port
    }

    /// Bytes of the failing entry already moved.
    #[must_use]
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes
    }

    /// Why the group failed or was rejected.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Creation time, milliseconds since the Unix epoch.
    #[must_use]
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Last state change, milliseconds since the Unix epoch.
    #[must_use]
    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    /// Total bytes of file entries.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        crate::index::total_size(&self.entries)
    }

    /// Move to `next`, failing on an illegal transition.
    pub fn transition(&mut self, next: TransferState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidState {
                group_id: self.group_id,
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.updated_at = crate::now_millis();
        Ok(())
    }
}

/// Progress information for a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    /// Group id
    pub group_id: u64,
    /// Current state
    pub state: TransferState,
    /// Index of the entry being moved
    pub current_entry: usize,
    /// Number of entries
    pub total_entries: usize,
    /// Bytes of the current entry moved so far
    pub entry_bytes: u64,
    /// Bytes moved across all entries
    pub bytes_transferred: u64,
    /// Total bytes across all entries
    pub total_bytes: u64,
}

impl TransferProgress {
    fn for_group(group: &TransferGroup) -> Self {
        Self {
            group_id: group.group_id,
            state: group.state,
            current_entry: 0,
            total_entries: group.entries.len(),
            entry_bytes: 0,
            bytes_transferred: 0,
            total_bytes: group.total_size(),
        }
    }

    /// Overall progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// A group being driven, with its persisted row and progress channel.
pub(crate) struct Session {
    group: TransferGroup,
    store: Arc<dyn Store>,
    progress: watch::Sender<TransferProgress>,
    entry_bytes: u64,
}

impl Session {
    fn new(group: TransferGroup, store: Arc<dyn Store>) -> (Self, watch::Receiver<TransferProgress>) {
        let (progress, rx) = watch::channel(TransferProgress::for_group(&group));
        (
            Self {
                group,
                store,
                progress,
                entry_bytes: 0,
            },
            rx,
        )
    }

    fn set_state(&mut self, next: TransferState) -> Result<()> {
        let from = self.group.state;
        self.group.transition(next)?;
        self.store.put_group(&self.group)?;
        self.progress.send_modify(|p| p.state = next);
        info!(group_id = self.group.group_id, %from, to = %next, "transfer state changed");
        Ok(())
    }

    fn set_socket_port(&mut self, port: u16) -> Result<()> {
        self.group.socket_port = Some(port);
        self.store.put_group(&self.group)
    }

    pub(crate) fn begin_entry(&mut self, index: usize) {
        self.entry_bytes = 0;
        self.progress.send_modify(|p| {
            p.current_entry = index;
            p.entry_bytes = 0;
        });
    }

    pub(crate) fn advance(&mut self, bytes: u64) {
        self.entry_bytes += bytes;
        let entry_bytes = self.entry_bytes;
        self.progress.send_modify(|p| {
            p.entry_bytes = entry_bytes;
            p.bytes_transferred += bytes;
        });
    }

    /// Settle a non-terminal group after an error.
    fn settle_error(&mut self, err: &Error) {
        if self.group.state.is_terminal() {
            return;
        }
        let next = match err {
            Error::Unauthorized(_) | Error::TransferRejected => TransferState::Rejected,
            Error::Interrupted => TransferState::Cancelled,
            _ => TransferState::Failed,
        };
        let next = if self.group.state.can_transition_to(next) {
            next
        } else {
            TransferState::Failed
        };
        if self.group.state == TransferState::InProgress {
            self.group.skipped_bytes = self.entry_bytes;
        }
        self.group.failure = Some(err.to_string());
        if let Err(e) = self.set_state(next) {
            warn!(group_id = self.group.group_id, error = %e, "failed to record transfer outcome");
        }
    }

    fn finish(self) -> TransferGroup {
        self.group
    }
}

/// Tunables of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    /// Wait for the accept/reject decision
    pub response_timeout: Duration,
    /// Read timeout on the data socket
    pub read_timeout: Duration,
    /// Chunk size for the data phase
    pub chunk_size: usize,
}

impl From<&Config> for TransferSettings {
    fn from(config: &Config) -> Self {
        Self {
            response_timeout: config.transfer.response_timeout,
            read_timeout: config.network.read_timeout,
            chunk_size: config.transfer.chunk_size,
        }
    }
}

/// A send running on its own task.
#[derive(Debug)]
pub struct TransferHandle {
    /// Group id
    pub group_id: u64,
    /// Progress updates
    pub progress: watch::Receiver<TransferProgress>,
    /// The worker; resolves to the final group
    pub task: JoinHandle<Result<TransferGroup>>,
}

#[derive(Debug)]
struct ActiveTransfer {
    cancel: CancellationToken,
    progress: watch::Receiver<TransferProgress>,
}

/// Owner of the transfer group lifecycle.
#[derive(Debug)]
pub struct TransferCoordinator {
    registry: Arc<DeviceRegistry>,
    handler: ConnectionHandler,
    sequence: SequenceGenerator,
    ports: PortAllocator,
    settings: TransferSettings,
    active: Mutex<HashMap<u64, ActiveTransfer>>,
}

impl TransferCoordinator {
    /// Create a coordinator.
    pub fn new(
        handler: ConnectionHandler,
        sequence: SequenceGenerator,
        ports: PortAllocator,
        settings: TransferSettings,
    ) -> Self {
        Self {
            registry: Arc::clone(handler.registry()),
            handler,
            sequence,
            ports,
            settings,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn store(&self) -> &Arc<dyn Store> {
        self.registry.store()
    }

    /// Assemble a new outgoing group for a known device.
    pub fn create_group(&self, device_id: &str, entries: Vec<FileIndexEntry>) -> Result<TransferGroup> {
        self.registry.get(device_id)?;
        if entries.is_empty() {
            return Err(Error::InvalidInput("nothing to send".to_string()));
        }
        let group = TransferGroup::outgoing(self.sequence.next_id(), device_id, entries);
        self.store().put_group(&group)?;
        info!(group_id = group.group_id, %device_id, entries = group.entries.len(), "created transfer group");
        Ok(group)
    }

    /// Address of a device's most recently verified connection.
    pub fn peer_address(&self, device_id: &str) -> Result<SocketAddr> {
        let connection = self
            .registry
            .connections_for(device_id)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("address of {device_id}")))?;
        Ok(SocketAddr::new(
            connection.ip_address,
            self.handler.settings().port,
        ))
    }

    /// Look up a group.
    pub fn group(&self, group_id: u64) -> Result<Option<TransferGroup>> {
        self.store().group(group_id)
    }

    /// All groups.
    pub fn groups(&self) -> Result<Vec<TransferGroup>> {
        self.store().groups()
    }

    /// Current state, live for running groups.
    pub fn state(&self, group_id: u64) -> Result<Option<TransferState>> {
        if let Some(progress) = self.progress(group_id) {
            return Ok(Some(progress.borrow().state));
        }
        Ok(self.group(group_id)?.map(|g| g.state))
    }

    /// Progress channel of a running group.
    pub fn progress(&self, group_id: u64) -> Option<watch::Receiver<TransferProgress>> {
        self.active
            .lock()
            .ok()
            .and_then(|active| active.get(&group_id).map(|a| a.progress.clone()))
    }

    /// Cancel a group. Returns whether anything was cancelled.
    pub fn cancel(&self, group_id: u64) -> Result<bool> {
        if let Some(token) = self.active_token(group_id) {
            info!(group_id, "cancelling transfer");
            token.cancel();
            return Ok(true);
        }

        match self.group(group_id)? {
            Some(mut group) if !group.state.is_terminal() => {
                group.transition(TransferState::Cancelled)?;
                self.store().put_group(&group)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Cancel if running, then delete the group.
    pub fn remove_group(&self, group_id: u64) -> Result<bool> {
        if let Some(token) = self.active_token(group_id) {
            token.cancel();
        }
        self.store().remove_group(group_id)
    }

    /// Delete finished groups last touched longer than `max_age` ago.
    pub fn expire_groups(&self, max_age: Duration) -> Result<usize> {
        let max_age = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = crate::now_millis().saturating_sub(max_age);
        let mut expired = 0;
        for group in self.store().groups()? {
            if group.state.is_terminal()
                && group.updated_at < cutoff
                && self.active_token(group.group_id).is_none()
                && self.store().remove_group(group.group_id)?
            {
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "expired transfer groups");
        }
        Ok(expired)
    }

    fn active_token(&self, group_id: u64) -> Option<CancellationToken> {
        self.active
            .lock()
            .ok()
            .and_then(|active| active.get(&group_id).map(|a| a.cancel.clone()))
    }

    fn begin(&self, group_id: u64, expected: &[TransferState]) -> Result<(Session, CancellationToken)> {
        let group = self
            .group(group_id)?
            .ok_or_else(|| Error::NotFound(format!("transfer group {group_id}")))?;
        if !expected.contains(&group.state) {
            return Err(Error::InvalidState {
                group_id,
                from: group.state.to_string(),
                to: "running".to_string(),
            });
        }

        let mut active = self
            .active
            .lock()
            .map_err(|_| Error::Internal("transfer table poisoned".to_string()))?;
        if active.contains_key(&group_id) {
            return Err(Error::InvalidState {
                group_id,
                from: group.state.to_string(),
                to: "running".to_string(),
            });
        }

        let (session, progress) = Session::new(group, Arc::clone(self.store()));
        let cancel = CancellationToken::new();
        active.insert(
            group_id,
            ActiveTransfer {
                cancel: cancel.clone(),
                progress,
            },
        );
        Ok((session, cancel))
    }

    fn end(&self, group_id: u64) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&group_id);
        }
    }

    /// Send a group to `addr` and wait for the outcome.
    pub async fn send(&self, group_id: u64, addr: SocketAddr) -> Result<TransferGroup> {
        let (session, cancel) = self.begin(group_id, &[TransferState::Created])?;
        let result = self.drive_send(session, cancel, addr).await;
        self.end(group_id);
        result
    }

    /// Send a group on its own task.
    pub fn spawn_send(self: &Arc<Self>, group_id: u64, addr: SocketAddr) -> Result<TransferHandle> {
        let (session, cancel) = self.begin(group_id, &[TransferState::Created])?;
        let progress = session.progress.subscribe();
        let coordinator = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = coordinator.drive_send(session, cancel, addr).await;
            coordinator.end(group_id);
            result
        });
        Ok(TransferHandle {
            group_id,
            progress,
            task,
        })
    }

    async fn drive_send(
        &self,
        mut session: Session,
        cancel: CancellationToken,
        addr: SocketAddr,
    ) -> Result<TransferGroup> {
        let outcome = {
            let work = self.run_send(&mut session, addr);
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(Error::Interrupted),
                result = work => result,
            }
        };

        match outcome {
            Ok(()) => Ok(session.finish()),
            Err(e) => {
                warn!(group_id = session.group.group_id, error = %e, "outgoing transfer ended");
                session.settle_error(&e);
                Err(e)
            }
        }
    }

    async fn run_send(&self, session: &mut Session, addr: SocketAddr) -> Result<()> {
        let group_id = session.group.group_id;
        let device = self.registry.get(&session.group.device_id)?;
        if device.is_restricted {
            return Err(Error::Unauthorized(device.device_id));
        }

        let mut channel = self.handler.open_channel(addr).await?;
        let mut request = Message::new()
            .with(keys::REQUEST, keys::REQUEST_TRANSFER)
            .with(keys::GROUP_ID, group_id)
            .with(keys::FILES_INDEX, protocol::encode_index(session.group.entries())?);
        self.handler.identity().payload().write_into(&mut request);

        channel.send(&request).await?;
        session.set_state(TransferState::IndexSent)?;

        let reply = channel
            .receive_within(self.settings.response_timeout)
            .await?;
        if !reply.result() {
            if reply.error_kind() == Some(ErrorKind::NotAllowed) {
                return Err(Error::Unauthorized(device.device_id));
            }
            if reply.opt_str(keys::FLAG) == Some(keys::FLAG_GROUP_EXISTS) {
                return Err(Error::GroupExists(group_id));
            }
            return Err(Error::ProtocolViolation(format!(
                "transfer request refused: {}",
                reply.opt_str(keys::ERROR).unwrap_or("no reason")
            )));
        }
        if !reply.require_bool(keys::IS_ACCEPTED)? {
            return Err(Error::TransferRejected);
        }
        session.set_state(TransferState::Accepted)?;

        let (listener, lease) = self.ports.bind(addr.ip()).await?;
        session.set_socket_port(lease.port())?;
        channel
            .send(
                &Message::new()
                    .with(keys::GROUP_ID, group_id)
                    .with(keys::SOCKET_PORT, lease.port()),
            )
            .await?;

        let mut stream = self.accept_data(&listener, addr).await?;
        drop(listener);
        session.set_state(TransferState::InProgress)?;

        let entries = session.group.entries.clone();
        data::send_entries(
            &mut stream,
            &entries,
            self.settings.chunk_size,
            self.settings.read_timeout,
            session,
        )
        .await?;

        session.set_state(TransferState::Completed)?;
        drop(lease);
        Ok(())
    }

    async fn accept_data(&self, listener: &TcpListener, peer: SocketAddr) -> Result<TcpStream> {
        let wait = self.settings.read_timeout;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let (stream, from) = tokio::time::timeout_at(deadline, listener.accept())
                .await
                .map_err(|_| Error::Timeout(protocol::millis(wait)))??;
            if from.ip().to_canonical() == peer.ip().to_canonical() {
                configure_tcp_keepalive(&stream)?;
                return Ok(stream);
            }
            debug!(%from, expected = %peer, "ignoring data connection from unexpected peer");
        }
    }

    /// Record a group offered by a peer.
    pub fn register_incoming(
        &self,
        group_id: u64,
        device_id: &str,
        entries: Vec<FileIndexEntry>,
    ) -> Result<TransferGroup> {
        let group = TransferGroup::incoming(group_id, device_id, entries);
        if !self.store().insert_group(&group)? {
            return Err(Error::GroupExists(group_id));
        }
        info!(group_id, %device_id, entries = group.entries.len(), "received transfer request");
        Ok(group)
    }

    /// Apply the local decision on an incoming group.
    pub fn decide_incoming(&self, group_id: u64, accepted: bool) -> Result<TransferGroup> {
        let mut group = self
            .group(group_id)?
            .ok_or_else(|| Error::NotFound(format!("transfer group {group_id}")))?;
        group.transition(if accepted {
            TransferState::Accepted
        } else {
            TransferState::Rejected
        })?;
        self.store().put_group(&group)?;
        info!(group_id, accepted, "decided incoming transfer");
        Ok(group)
    }

    /// Fail an incoming group that never reached its data phase.
    pub fn fail_incoming(&self, group_id: u64, err: &Error) -> Result<TransferGroup> {
        let mut group = self
            .group(group_id)?
            .ok_or_else(|| Error::NotFound(format!("transfer group {group_id}")))?;
        if group.state.is_terminal() {
            return Ok(group);
        }
        group.failure = Some(err.to_string());
        group.transition(TransferState::Failed)?;
        self.store().put_group(&group)?;
        warn!(group_id, error = %err, "incoming transfer failed before its data phase");
        Ok(group)
    }

    /// Receive an accepted incoming group from the sender's data port.
    pub async fn receive(
        &self,
        group_id: u64,
        data_addr: SocketAddr,
        output_dir: &Path,
    ) -> Result<TransferGroup> {
        let (mut session, cancel) = self.begin(group_id, &[TransferState::Accepted])?;
        let outcome = {
            let work = self.run_receive(&mut session, data_addr, output_dir);
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(Error::Interrupted),
                result = work => result,
            }
        };
        self.end(group_id);

        match outcome {
            Ok(()) => Ok(session.finish()),
            Err(e) => {
                warn!(group_id, error = %e, "incoming transfer ended");
                session.settle_error(&e);
                Err(e)
            }
        }
    }

    async fn run_receive(
        &self,
        session: &mut Session,
        data_addr: SocketAddr,
        output_dir: &Path,
    ) -> Result<()> {
        session.set_socket_port(data_addr.port())?;
        let connect = self.handler.settings().connect_timeout;
        let mut stream = tokio::time::timeout(connect, TcpStream::connect(data_addr))
            .await
            .map_err(|_| Error::ConnectFailure {
                addr: data_addr,
                reason: format!("timed out after {} ms", protocol::millis(connect)),
            })?
            .map_err(|e| Error::ConnectFailure {
                addr: data_addr,
                reason: e.to_string(),
            })?;
        configure_tcp_keepalive(&stream)?;
        session.set_state(TransferState::InProgress)?;

        tokio::fs::create_dir_all(output_dir).await?;
        let entries = session.group.entries.clone();
        data::receive_entries(
            &mut stream,
            &entries,
            output_dir,
            self.settings.chunk_size,
            self.settings.read_timeout,
            session,
        )
        .await?;

        session.set_state(TransferState::Completed)
    }

    /// Push clipboard text to a device.
    pub async fn send_clipboard(&self, device_id: &str, addr: SocketAddr, text: &str) -> Result<()> {
        let device = self.registry.get(device_id)?;
        if device.is_restricted {
            return Err(Error::Unauthorized(device.device_id));
        }

        let mut channel = self.handler.open_channel(addr).await?;
        let mut request = Message::new()
            .with(keys::REQUEST, keys::REQUEST_CLIPBOARD)
            .with(keys::CLIPBOARD_TEXT, text);
        self.handler.identity().payload().write_into(&mut request);

        let reply = channel.request(&request).await?;
        if reply.result() {
            info!(%device_id, chars = text.chars().count(), "clipboard delivered");
            return Ok(());
        }
        match reply.error_kind() {
            Some(ErrorKind::NotAllowed) => Err(Error::Unauthorized(device.device_id)),
            _ => Err(Error::ProtocolViolation(format!(
                "clipboard refused: {}",
                reply.opt_str(keys::ERROR).unwrap_or("no reason")
            ))),
        }
    }
}
