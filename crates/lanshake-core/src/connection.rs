//! Outbound handshakes and the request transport.
//!
//! A [`Channel`] is one TCP connection carrying framed [`Message`]s with a
//! bounded read timeout. The [`ConnectionHandler`] uses it to run exactly one
//! handshake per invocation:
//!
//! 1. connect within the connect timeout, else `ConnectFailure`
//! 2. send an empty request
//! 3. read `deviceInfo` + `appInfo`; anything missing is a `ProtocolViolation`
//! 4. reconcile the peer in the registry (nickname cap, merge, adapter match)
//!
//! Failures are reported once and never retried here.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::identity::LocalIdentity;
use crate::interfaces::{resolve_adapter, InterfaceEnumerator};
use crate::protocol::{self, HandshakePayload, Message};
use crate::registry::{DeviceRegistry, Registration};

/// Configure TCP keep-alive on a socket.
///
/// Probing starts after 10 seconds of idle time and repeats every 5 seconds.
pub(crate) fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    Ok(())
}

/// Socket settings shared by every outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Peer communication port
    pub port: u16,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Read timeout
    pub read_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_COMMUNICATION_PORT,
            connect_timeout: Duration::from_millis(crate::DEFAULT_SOCKET_TIMEOUT_MS),
            read_timeout: Duration::from_millis(crate::DEFAULT_SOCKET_TIMEOUT_MS),
        }
    }
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            port: config.network.communication_port,
            connect_timeout: config.network.connect_timeout,
            read_timeout: config.network.read_timeout,
        }
    }
}

/// One framed request/response connection.
#[derive(Debug)]
pub struct Channel {
    stream: TcpStream,
    peer: SocketAddr,
    read_timeout: Duration,
}

impl Channel {
    /// Connect to `addr` within `connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConnectFailure` if the peer cannot be reached in time.
    pub async fn open(addr: SocketAddr, connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectFailure {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(Error::ConnectFailure {
                    addr,
                    reason: format!("timed out after {} ms", protocol::millis(connect_timeout)),
                })
            }
        };
        Self::from_stream(stream, read_timeout)
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, read_timeout: Duration) -> Result<Self> {
        configure_tcp_keepalive(&stream)?;
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream,
            peer,
            read_timeout,
        })
    }

    /// Remote address.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Remote IP with IPv4-mapped IPv6 addresses unwrapped.
    #[must_use]
    pub fn peer_ip(&self) -> IpAddr {
        self.peer.ip().to_canonical()
    }

    /// Send one message.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        protocol::write_message_with_timeout(&mut self.stream, message, self.read_timeout).await
    }

    /// Read one message within the read timeout.
    pub async fn receive(&mut self) -> Result<Message> {
        self.receive_within(self.read_timeout).await
    }

    /// Read one message within `duration`.
    pub async fn receive_within(&mut self, duration: Duration) -> Result<Message> {
        protocol::read_message_with_timeout(&mut self.stream, duration).await
    }

    /// Send a message and wait for the reply.
    pub async fn request(&mut self, message: &Message) -> Result<Message> {
        self.send(message).await?;
        self.receive().await
    }

    /// The underlying stream, for raw data.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// Result of one handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// A peer was reconciled
    Registered(Registration),
    /// The address answered with this device's own identity
    SelfConnection,
}

/// Runs outbound handshakes and reconciles peers into the registry.
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    registry: Arc<DeviceRegistry>,
    interfaces: Arc<dyn InterfaceEnumerator>,
    identity: Arc<LocalIdentity>,
    settings: ConnectionSettings,
}

impl ConnectionHandler {
    /// Create a handler.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        interfaces: Arc<dyn InterfaceEnumerator>,
        identity: Arc<LocalIdentity>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            registry,
            interfaces,
            identity,
            settings,
        }
    }

    /// Socket settings in use.
    #[must_use]
    pub fn settings(&self) -> ConnectionSettings {
        self.settings
    }

    /// The local identity announced in requests.
    #[must_use]
    pub fn identity(&self) -> &Arc<LocalIdentity> {
        &self.identity
    }

    /// The registry peers are reconciled into.
    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Open a channel to a peer's communication port.
    pub async fn open_channel(&self, addr: SocketAddr) -> Result<Channel> {
        Channel::open(addr, self.settings.connect_timeout, self.settings.read_timeout).await
    }

    /// Handshake with `ip` on the configured communication port.
    pub async fn connect(&self, ip: IpAddr) -> Result<HandshakeOutcome> {
        self.connect_to(SocketAddr::new(ip, self.settings.port)).await
    }

    /// Handshake with an explicit address.
    pub async fn connect_to(&self, addr: SocketAddr) -> Result<HandshakeOutcome> {
        debug!(%addr, "starting handshake");
        let mut channel = self.open_channel(addr).await?;
        let reply = channel.request(&Message::new()).await?;
        let identity = HandshakePayload::from_message(&reply).map_err(|e| match e {
            Error::MissingField(field) => {
                Error::ProtocolViolation(format!("handshake reply without '{field}'"))
            }
            other => other,
        })?;

        match self.reconcile(&identity, channel.peer_ip())? {
            Some(registration) => Ok(HandshakeOutcome::Registered(registration)),
            None => Ok(HandshakeOutcome::SelfConnection),
        }
    }

    /// Handshake on a spawned task; the result is delivered through `events`
    /// unless the peer turned out to be this device.
    pub fn spawn_connect(
        &self,
        addr: SocketAddr,
        events: mpsc::Sender<Result<Registration>>,
    ) -> JoinHandle<()> {
        let handler = self.clone();
        tokio::spawn(async move {
            let event = match handler.connect_to(addr).await {
                Ok(HandshakeOutcome::Registered(registration)) => Ok(registration),
                Ok(HandshakeOutcome::SelfConnection) => return,
                Err(e) => {
                    warn!(%addr, error = %e, "handshake failed");
                    Err(e)
                }
            };
            if events.send(event).await.is_err() {
                debug!(%addr, "handshake listener went away");
            }
        })
    }

    /// Record a peer seen at `ip`. Returns `None` for this device's own identity.
    pub fn reconcile(&self, identity: &HandshakePayload, ip: IpAddr) -> Result<Option<Registration>> {
        let adapter = resolve_adapter(ip, &self.interfaces.interfaces());
        self.registry
            .register_remote(identity, ip, adapter, crate::now_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticPlatform;
    use crate::interfaces::{InterfaceAddress, StaticInterfaces};
    use crate::protocol::keys;
    use crate::store::MemoryStore;
    use tokio::net::TcpListener;

    fn handler() -> ConnectionHandler {
        let identity = Arc::new(LocalIdentity::new(&StaticPlatform::new("local"), Some("Me"), 32));
        let registry = Arc::new(
            DeviceRegistry::new(Arc::new(MemoryStore::new()), identity.device().clone(), 32)
                .unwrap(),
        );
        let interfaces = Arc::new(StaticInterfaces(vec![InterfaceAddress::new(
            "lo-test",
            "127.0.0.1".parse().unwrap(),
        )]));
        let settings = ConnectionSettings {
            port: 0,
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(300),
        };
        ConnectionHandler::new(registry, interfaces, identity, settings)
    }

    async fn one_shot_peer(reply: Message) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = protocol::read_message(&mut stream).await.unwrap();
            assert!(request.is_empty());
            protocol::write_message(&mut stream, &reply).await.unwrap();
        });
        addr
    }

    fn peer_identity(id: &str, nickname: &str) -> HandshakePayload {
        let mut payload = LocalIdentity::new(&StaticPlatform::new(id), Some(nickname), 64)
            .payload()
            .clone();
        payload.device.nickname = nickname.to_string();
        payload
    }

    #[tokio::test]
    async fn test_handshake_registers_peer() {
        let handler = handler();
        let addr = one_shot_peer(peer_identity("peer", &"p".repeat(40)).to_message()).await;

        let outcome = handler.connect_to(addr).await.unwrap();
        let HandshakeOutcome::Registered(reg) = outcome else {
            panic!("expected registration");
        };
        assert_eq!(reg.device.device_id, "peer");
        assert_eq!(reg.device.nickname.chars().count(), 31);
        assert_eq!(reg.connection.adapter_name, "lo-test");
        assert!(handler.registry().find("peer").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_app_info_is_violation() {
        let handler = handler();
        let mut reply = Message::new();
        reply.insert(
            keys::DEVICE_INFO,
            peer_identity("peer", "p").to_message().require_message(keys::DEVICE_INFO).unwrap(),
        );
        let addr = one_shot_peer(reply).await;

        let err = handler.connect_to(addr).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert!(!err.is_recoverable());
        assert!(handler.registry().find("peer").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_self_connection_not_reported() {
        let handler = handler();
        let addr = one_shot_peer(handler.identity().payload().to_message()).await;

        let (tx, mut rx) = mpsc::channel(1);
        handler.spawn_connect(addr, tx).await.unwrap();

        assert!(rx.recv().await.is_none());
        assert_eq!(handler.registry().devices().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let handler = handler();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::channel(1);
        handler.spawn_connect(addr, tx);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Err(Error::ConnectFailure { .. })));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let handler = handler();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let err = handler.connect_to(addr).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(300)));
    }
}
