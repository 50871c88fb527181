//! A running peer: registry, handshakes, transfers and the communication server.
//!
//! ## Example
//!
//! ```rust,ignore
//! use lanshake_core::{config::Config, node::Node, server::ServerEvent};
//!
//! let (node, mut events) = Node::start(Config::load()?).await?;
//! while let Some(event) = events.recv().await {
//!     if let ServerEvent::TransferRequested(offer) = event {
//!         offer.accept(node.config().output_dir());
//!     }
//! }
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::connection::{ConnectionHandler, ConnectionSettings};
use crate::error::{Error, Result};
use crate::hotspot::{self, HotspotControl};
use crate::identity::{HostPlatform, LocalIdentity, PlatformInfo};
use crate::interfaces::{InterfaceEnumerator, LocalInterfaces};
use crate::registry::DeviceRegistry;
use crate::sequence::SequenceGenerator;
use crate::server::{CommunicationServer, ServerEvent, ServerSettings};
use crate::store::{JsonStore, Store};
use crate::transfer::{PortAllocator, TransferCoordinator, TransferSettings};

/// Capacity of the server event channel.
const EVENT_BUFFER: usize = 64;

/// Builder for a [`Node`], with injectable platform seams.
pub struct NodeBuilder {
    config: Config,
    store: Option<Arc<dyn Store>>,
    platform: Option<Arc<dyn PlatformInfo>>,
    interfaces: Option<Arc<dyn InterfaceEnumerator>>,
    hotspot: Option<Arc<dyn HotspotControl>>,
    bind_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for NodeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBuilder")
            .field("config", &self.config)
            .field("bind_addr", &self.bind_addr)
            .finish_non_exhaustive()
    }
}

impl NodeBuilder {
    /// Start from a configuration; everything else uses platform defaults.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            platform: None,
            interfaces: None,
            hotspot: None,
            bind_addr: None,
        }
    }

    /// Use this store instead of the JSON file in the data directory.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use these platform facts instead of the host's.
    #[must_use]
    pub fn platform(mut self, platform: Arc<dyn PlatformInfo>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Use this interface list instead of the host's adapters.
    #[must_use]
    pub fn interfaces(mut self, interfaces: Arc<dyn InterfaceEnumerator>) -> Self {
        self.interfaces = Some(interfaces);
        self
    }

    /// Attach an access point controller.
    #[must_use]
    pub fn hotspot(mut self, hotspot: Arc<dyn HotspotControl>) -> Self {
        self.hotspot = Some(hotspot);
        self
    }

    /// Listen here instead of `0.0.0.0:<communication_port>`.
    #[must_use]
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Wire the components and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory, the store or the listener
    /// cannot be set up.
    pub async fn start(self) -> Result<(Node, mpsc::Receiver<ServerEvent>)> {
        let config = self.config;
        let data_dir = config.data_dir();

        let platform: Arc<dyn PlatformInfo> = match self.platform {
            Some(platform) => platform,
            None => Arc::new(HostPlatform::load(&data_dir)?),
        };
        let store: Arc<dyn Store> = match self.store {
            Some(store) => store,
            None => Arc::new(JsonStore::open(data_dir.join("registry.json"))?),
        };
        let interfaces: Arc<dyn InterfaceEnumerator> = match self.interfaces {
            Some(interfaces) => interfaces,
            None => Arc::new(LocalInterfaces::new(config.network.disabled_interfaces.clone())),
        };

        let max_nickname = config.general.nickname_max_length;
        let identity = Arc::new(LocalIdentity::new(
            platform.as_ref(),
            Some(config.general.device_name.as_str()),
            max_nickname,
        ));
        let registry = Arc::new(DeviceRegistry::new(
            store,
            identity.device().clone(),
            max_nickname,
        )?);

        let handler = ConnectionHandler::new(
            Arc::clone(&registry),
            interfaces,
            Arc::clone(&identity),
            ConnectionSettings::from(&config),
        );
        let coordinator = Arc::new(TransferCoordinator::new(
            handler.clone(),
            SequenceGenerator::new(),
            PortAllocator::new(config.network.transfer_port_range),
            TransferSettings::from(&config),
        ));

        if let Err(e) = coordinator.expire_groups(config.transfer.group_expiry) {
            warn!(error = %e, "failed to expire old transfer groups");
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let bind_addr = self.bind_addr.unwrap_or_else(|| {
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                config.network.communication_port,
            )
        });
        let server = CommunicationServer::bind(
            bind_addr,
            handler.clone(),
            Arc::clone(&coordinator),
            ServerSettings {
                auto_accept_trusted: config.trust.auto_accept_trusted,
                output_dir: config.output_dir(),
                decision_timeout: config.transfer.response_timeout,
            },
            events_tx,
        )
        .await?;
        let local_addr = server.local_addr()?;

        let shutdown = CancellationToken::new();
        let server_task = server.spawn(shutdown.clone());

        info!(
            device_id = %identity.device_id(),
            nickname = %identity.device().nickname,
            %local_addr,
            "node started"
        );

        let node = Node {
            config,
            identity,
            registry,
            handler,
            coordinator,
            hotspot: self.hotspot,
            local_addr,
            shutdown,
            server_task,
        };
        Ok((node, events_rx))
    }
}

/// A started peer.
pub struct Node {
    config: Config,
    identity: Arc<LocalIdentity>,
    registry: Arc<DeviceRegistry>,
    handler: ConnectionHandler,
    coordinator: Arc<TransferCoordinator>,
    hotspot: Option<Arc<dyn HotspotControl>>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    server_task: JoinHandle<Result<()>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("device_id", &self.identity.device_id())
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Start a node with platform defaults.
    ///
    /// # Errors
    ///
    /// See [`NodeBuilder::start`].
    pub async fn start(config: Config) -> Result<(Self, mpsc::Receiver<ServerEvent>)> {
        NodeBuilder::new(config).start().await
    }

    /// Configuration the node was started with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// This device's identity.
    pub fn identity(&self) -> &Arc<LocalIdentity> {
        &self.identity
    }

    /// Device registry.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Outbound handshakes.
    pub fn handler(&self) -> &ConnectionHandler {
        &self.handler
    }

    /// Transfer groups.
    pub fn coordinator(&self) -> &Arc<TransferCoordinator> {
        &self.coordinator
    }

    /// Address the communication server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Access point controller, when the platform has one.
    pub fn hotspot(&self) -> Option<&Arc<dyn HotspotControl>> {
        self.hotspot.as_ref()
    }

    /// Bring up the access point named after this device.
    ///
    /// # Errors
    ///
    /// Returns an error if no controller is attached or it fails.
    pub fn enable_hotspot(&self, passphrase: Option<&str>) -> Result<String> {
        let control = self
            .hotspot
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("no access point control on this platform".to_string()))?;
        let name = hotspot::hotspot_name(&self.identity.device().nickname);
        control.enable_configured(&name, passphrase)?;
        info!(ssid = %name, open = passphrase.is_none(), "access point enabled");
        Ok(name)
    }

    /// Where received entries go when the application does not choose.
    pub fn default_output_dir(&self) -> PathBuf {
        self.config.output_dir()
    }

    /// Stop the server and wait for it to exit.
    ///
    /// # Errors
    ///
    /// Returns the server's error, if it failed.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        match self.server_task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("server task failed: {e}"))),
        }
    }
}
