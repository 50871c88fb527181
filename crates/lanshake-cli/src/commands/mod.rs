//! CLI command definitions and handlers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use lanshake_core::config::Config;
use lanshake_core::node::{Node, NodeBuilder};
use lanshake_core::registry::{Device, DeviceRegistry};
use lanshake_core::server::ServerEvent;
use tokio::sync::mpsc;

/// Load configuration with graceful fallback to defaults.
///
/// If the config file doesn't exist or can't be parsed, it falls back to defaults.
pub fn load_config() -> Config {
    Config::load().unwrap_or_default()
}

/// Start a node for a one-off command.
///
/// It listens on an ephemeral port so it can run next to `lanshake serve`.
pub async fn start_client_node(config: Config) -> Result<(Node, mpsc::Receiver<ServerEvent>)> {
    NodeBuilder::new(config)
        .bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
        .start()
        .await
        .context("Failed to start local node")
}

/// Find a known device by id, or by a unique case-insensitive nickname.
pub fn resolve_device(registry: &DeviceRegistry, query: &str) -> Result<Device> {
    if let Some(device) = registry.find(query)? {
        return Ok(device);
    }

    let matches: Vec<Device> = registry
        .devices()?
        .into_iter()
        .filter(|d| !d.is_local_address && d.nickname.eq_ignore_ascii_case(query))
        .collect();

    match matches.len() {
        0 => bail!("Device '{}' not found. Run 'lanshake connect <ip>' first.", query),
        1 => Ok(matches.into_iter().next().context("device vanished")?),
        n => bail!(
            "{} devices are named '{}'; use the device id instead.",
            n,
            query
        ),
    }
}

pub mod clipboard;
pub mod completions;
pub mod config;
pub mod connect;
pub mod devices;
pub mod send;
pub mod serve;

/// Lanshake - Local network device handshake and transfer
#[derive(Parser)]
#[command(name = "lanshake")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Detailed logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Listen for handshakes, transfers and clipboard pushes
    Serve(ServeArgs),

    /// Handshake with a peer and remember it
    Connect(ConnectArgs),

    /// Send files to a known device
    Send(SendArgs),

    /// Push text to a known device's clipboard
    Clipboard(ClipboardArgs),

    /// Manage known devices
    Devices(DevicesArgs),

    /// Manage configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// Arguments for the serve command
#[derive(Parser)]
pub struct ServeArgs {
    /// Port to listen on (defaults to the configured communication port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Output directory for received files
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Accept every transfer without asking
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Custom device name for this session
    #[arg(long)]
    pub name: Option<String>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the connect command
#[derive(Parser)]
pub struct ConnectArgs {
    /// Peer IP address
    pub address: IpAddr,

    /// Peer communication port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the send command
#[derive(Parser)]
pub struct SendArgs {
    /// Device id or nickname
    pub device: String,

    /// Files and folders to send
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Peer communication port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the clipboard command
#[derive(Parser)]
pub struct ClipboardArgs {
    /// Device id or nickname
    pub device: String,

    /// Text to send; read from stdin when omitted or `-`
    pub text: Option<String>,

    /// Peer communication port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the devices command
#[derive(Parser)]
pub struct DevicesArgs {
    /// Devices subcommand
    #[command(subcommand)]
    pub action: DevicesAction,
}

/// Devices subcommands
#[derive(Subcommand)]
pub enum DevicesAction {
    /// List known devices
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Trust a device
    Trust {
        /// Device id or nickname
        device: String,
    },

    /// Stop trusting a device
    Untrust {
        /// Device id or nickname
        device: String,
    },

    /// Block a device from transferring
    Restrict {
        /// Device id or nickname
        device: String,
    },

    /// Lift a restriction
    Unrestrict {
        /// Device id or nickname
        device: String,
    },

    /// Change a device's nickname
    Rename {
        /// Device id or nickname
        device: String,

        /// New nickname
        nickname: String,
    },

    /// Forget a device, its connections and its transfers
    Remove {
        /// Device id or nickname
        device: String,
    },
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show all configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Reset to defaults
    Reset,
}

/// Arguments for the completions command
#[derive(Parser)]
pub struct CompletionsArgs {
    /// Completions subcommand
    #[command(subcommand)]
    pub action: CompletionsAction,
}

/// Completions subcommands
#[derive(Subcommand, Clone, Copy)]
pub enum CompletionsAction {
    /// Install shell completions (auto-detects shell)
    Install {
        /// Override shell detection
        #[arg(long, value_enum)]
        shell: Option<ShellType>,
    },

    /// Uninstall shell completions
    Uninstall {
        /// Override shell detection
        #[arg(long, value_enum)]
        shell: Option<ShellType>,
    },

    /// Generate completions and print to stdout (for manual installation)
    Generate {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: ShellType,
    },
}

/// Supported shell types for completions
#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum ShellType {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    #[value(name = "powershell")]
    PowerShell,
    /// Elvish shell
    Elvish,
}
