//! Lanshake CLI - Local network device handshake and transfer
//!
//! Lanshake lets two machines on the same network introduce themselves,
//! remember each other, and agree on a transfer before any bytes move.
//!
//! ## Quick Start
//!
//! ```bash
//! # Listen for peers
//! lanshake serve
//!
//! # Introduce yourself to a peer (on another device)
//! lanshake connect 192.168.1.42
//!
//! # Send files to it
//! lanshake send laptop ./document.pdf
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Serve(args) => commands::serve::run(args).await,
        Command::Connect(args) => commands::connect::run(args).await,
        Command::Send(args) => commands::send::run(args).await,
        Command::Clipboard(args) => commands::clipboard::run(args).await,
        Command::Devices(args) => commands::devices::run(args),
        Command::Config(args) => commands::config::run(args),
        Command::Completions(args) => commands::completions::run(args.action),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "info,lanshake=debug,lanshake_core=debug"
    } else {
        "warn,lanshake=info,lanshake_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
