//! Inbound request handling.
//!
//! The communication server accepts one request per connection:
//!
//! | Request | Reply |
//! |---------|-------|
//! | empty | local `deviceInfo` + `appInfo` |
//! | `requestTransfer` | `{result, request: requestResponse, groupId, isAccepted}` |
//! | `requestClipboard` | `{result: true}` |
//! | anything else | `{result: false, error: notFound}` |
//!
//! Restricted requesters get `{result: false, error: notAllowed}`; a group id
//! that is already known gets `{result: false, flag: flagGroupExists}`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Channel, ConnectionHandler};
use crate::error::{Error, Result};
use crate::protocol::{self, keys, ErrorKind, HandshakePayload, Message};
use crate::registry::{Device, Registration};
use crate::transfer::{TransferCoordinator, TransferGroup};

/// The application's answer to an incoming transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Receive into this directory
    Accept(PathBuf),
    /// Refuse
    Reject,
}

/// A transfer offered by a peer, waiting for a decision.
#[derive(Debug)]
pub struct IncomingTransfer {
    /// The requester
    pub device: Device,
    /// The offered group
    pub group: TransferGroup,
    decision: oneshot::Sender<Decision>,
}

impl IncomingTransfer {
    /// Accept and receive into `output_dir`.
    pub fn accept(self, output_dir: impl Into<PathBuf>) {
        let _ = self.decision.send(Decision::Accept(output_dir.into()));
    }

    /// Refuse the transfer.
    pub fn reject(self) {
        let _ = self.decision.send(Decision::Reject);
    }
}

/// Something the application may want to react to.
#[derive(Debug)]
pub enum ServerEvent {
    /// A requester was reconciled into the registry
    DeviceRegistered(Registration),
    /// A peer offers a transfer
    TransferRequested(IncomingTransfer),
    /// A peer pushed clipboard text
    ClipboardReceived {
        /// The sender
        device: Device,
        /// The text
        text: String,
    },
    /// An accepted incoming transfer ended
    TransferFinished(TransferGroup),
}

impl ServerEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeviceRegistered(_) => "device_registered",
            Self::TransferRequested(_) => "transfer_requested",
            Self::ClipboardReceived { .. } => "clipboard_received",
            Self::TransferFinished(_) => "transfer_finished",
        }
    }
}

/// Server policy.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Accept transfers from trusted devices without asking
    pub auto_accept_trusted: bool,
    /// Where auto-accepted transfers land
    pub output_dir: PathBuf,
    /// How long to wait for the application's decision
    pub decision_timeout: Duration,
}

struct ServerContext {
    handler: ConnectionHandler,
    coordinator: Arc<TransferCoordinator>,
    events: mpsc::Sender<ServerEvent>,
    settings: ServerSettings,
}

/// Listener for inbound requests.
pub struct CommunicationServer {
    listener: TcpListener,
    context: Arc<ServerContext>,
}

impl std::fmt::Debug for CommunicationServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicationServer")
            .field("listener", &self.listener)
            .field("settings", &self.context.settings)
            .finish_non_exhaustive()
    }
}

impl CommunicationServer {
    /// Bind the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        handler: ConnectionHandler,
        coordinator: Arc<TransferCoordinator>,
        settings: ServerSettings,
        events: mpsc::Sender<ServerEvent>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "communication server listening");
        Ok(Self {
            listener,
            context: Arc::new(ServerContext {
                handler,
                coordinator,
                events,
                settings,
            }),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let context = Arc::clone(&self.context);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let read_timeout = context.handler.settings().read_timeout;
                let result = async {
                    let channel = Channel::from_stream(stream, read_timeout)?;
                    tokio::select! {
                        () = shutdown.cancelled() => Err(Error::Interrupted),
                        result = serve(&context, channel) => result,
                    }
                }
                .await;
                if let Err(e) = result {
                    debug!(%peer, error = %e, "request ended with error");
                }
            });
        }

        info!("communication server stopped");
        Ok(())
    }

    /// Serve on a spawned task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(shutdown))
    }
}

fn refusal(kind: ErrorKind) -> Message {
    Message::new()
        .with(keys::RESULT, false)
        .with(keys::ERROR, kind.as_str())
}

async fn serve(context: &ServerContext, mut channel: Channel) -> Result<()> {
    let request = channel.receive().await?;

    match request.request() {
        None => {
            debug!(peer = %channel.peer(), "answering handshake");
            channel
                .send(&context.handler.identity().payload().to_message())
                .await
        }
        Some(keys::REQUEST_TRANSFER) => handle_transfer(context, &mut channel, &request).await,
        Some(keys::REQUEST_CLIPBOARD) => handle_clipboard(context, &mut channel, &request).await,
        Some(other) => {
            debug!(peer = %channel.peer(), request = other, "unknown request");
            channel.send(&refusal(ErrorKind::NotFound)).await
        }
    }
}

/// Reconcile the requester, refusing self-requests and restricted devices.
async fn admit(
    context: &ServerContext,
    channel: &mut Channel,
    request: &Message,
) -> Result<Option<Device>> {
    let identity = match HandshakePayload::from_message(request) {
        Ok(identity) => identity,
        Err(e) => {
            channel.send(&Message::new().with(keys::RESULT, false)).await?;
            return Err(Error::ProtocolViolation(format!("request without identity: {e}")));
        }
    };

    let Some(registration) = context.handler.reconcile(&identity, channel.peer_ip())? else {
        channel.send(&refusal(ErrorKind::NotAllowed)).await?;
        return Ok(None);
    };
    let device = registration.device.clone();
    notify(context, ServerEvent::DeviceRegistered(registration));

    if device.is_restricted {
        info!(device_id = %device.device_id, "refusing restricted device");
        channel.send(&refusal(ErrorKind::NotAllowed)).await?;
        return Ok(None);
    }
    Ok(Some(device))
}

/// Deliver an informational event without waiting on the application.
fn notify(context: &ServerContext, event: ServerEvent) {
    match context.events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            warn!(event = event.kind(), "event queue full, dropping event");
        }
        Err(TrySendError::Closed(_)) => debug!("no event listener"),
    }
}

async fn handle_transfer(
    context: &ServerContext,
    channel: &mut Channel,
    request: &Message,
) -> Result<()> {
    let Some(device) = admit(context, channel, request).await? else {
        return Ok(());
    };

    let group_id = request.require_u64(keys::GROUP_ID)?;
    let entries = protocol::decode_index(request)?;

    let group = match context
        .coordinator
        .register_incoming(group_id, &device.device_id, entries)
    {
        Ok(group) => group,
        Err(Error::GroupExists(_)) => {
            return channel
                .send(
                    &Message::new()
                        .with(keys::RESULT, false)
                        .with(keys::FLAG, keys::FLAG_GROUP_EXISTS),
                )
                .await;
        }
        Err(e) => return Err(e),
    };

    let decision = decide(context, &device, group).await;
    let accepted = matches!(decision, Decision::Accept(_));
    context.coordinator.decide_incoming(group_id, accepted)?;

    let Decision::Accept(output_dir) = decision else {
        return channel.send(&decision_reply(group_id, false)).await;
    };

    let data_addr = match await_data_port(channel, group_id).await {
        Ok(addr) => addr,
        Err(e) => {
            let group = context.coordinator.fail_incoming(group_id, &e)?;
            notify(context, ServerEvent::TransferFinished(group));
            return Err(e);
        }
    };

    let result = context
        .coordinator
        .receive(group_id, data_addr, &output_dir)
        .await;
    if let Some(group) = context.coordinator.group(group_id)? {
        notify(context, ServerEvent::TransferFinished(group));
    }
    result.map(|_| ())
}

fn decision_reply(group_id: u64, accepted: bool) -> Message {
    Message::new()
        .with(keys::RESULT, true)
        .with(keys::REQUEST, keys::REQUEST_RESPONSE)
        .with(keys::GROUP_ID, group_id)
        .with(keys::IS_ACCEPTED, accepted)
}

/// Confirm acceptance and read the sender's data port.
async fn await_data_port(channel: &mut Channel, group_id: u64) -> Result<SocketAddr> {
    channel.send(&decision_reply(group_id, true)).await?;

    let start = channel.receive().await?;
    if start.require_u64(keys::GROUP_ID)? != group_id {
        return Err(Error::ProtocolViolation("data phase for another group".to_string()));
    }
    let port = u16::try_from(start.require_u64(keys::SOCKET_PORT)?)
        .map_err(|_| Error::ProtocolViolation("socket port out of range".to_string()))?;
    Ok(SocketAddr::new(channel.peer_ip(), port))
}

async fn decide(context: &ServerContext, device: &Device, group: TransferGroup) -> Decision {
    if context.settings.auto_accept_trusted && device.is_trusted {
        info!(device_id = %device.device_id, group_id = group.group_id, "auto-accepting trusted device");
        return Decision::Accept(context.settings.output_dir.clone());
    }

    let (tx, rx) = oneshot::channel();
    let event = ServerEvent::TransferRequested(IncomingTransfer {
        device: device.clone(),
        group,
        decision: tx,
    });
    let deadline = tokio::time::Instant::now() + context.settings.decision_timeout;
    match tokio::time::timeout_at(deadline, context.events.send(event)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            debug!("no listener for transfer requests, rejecting");
            return Decision::Reject;
        }
        Err(_) => {
            warn!(device_id = %device.device_id, "event queue stayed full, rejecting");
            return Decision::Reject;
        }
    }

    match tokio::time::timeout_at(deadline, rx).await {
        Ok(Ok(decision)) => decision,
        Ok(Err(_)) => Decision::Reject,
        Err(_) => {
            info!(device_id = %device.device_id, "no decision in time, rejecting");
            Decision::Reject
        }
    }
}

async fn handle_clipboard(
    context: &ServerContext,
    channel: &mut Channel,
    request: &Message,
) -> Result<()> {
    let Some(device) = admit(context, channel, request).await? else {
        return Ok(());
    };

    let text = request.require_str(keys::CLIPBOARD_TEXT)?.to_string();
    info!(device_id = %device.device_id, chars = text.chars().count(), "clipboard received");
    notify(context, ServerEvent::ClipboardReceived { device, text });
    channel.send(&Message::new().with(keys::RESULT, true)).await
}
