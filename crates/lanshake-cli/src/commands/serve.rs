//! Serve command implementation.
//!
//! Runs the communication server in the foreground and reacts to peers:
//! handshakes are answered automatically, transfer offers are confirmed on
//! the terminal (or accepted with `--yes`) and clipboard pushes are printed.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use lanshake_core::index::format_size;
use lanshake_core::node::Node;
use lanshake_core::server::{IncomingTransfer, ServerEvent};
use lanshake_core::transfer::TransferState;

use super::ServeArgs;
use crate::ui::preview;

/// Run the serve command.
pub async fn run(args: ServeArgs) -> Result<()> {
    let mut config = super::load_config();
    if let Some(port) = args.port {
        config.network.communication_port = port;
    }
    if let Some(name) = &args.name {
        config.general.device_name.clone_from(name);
    }
    let output_dir = args.output.clone().unwrap_or_else(|| config.output_dir());
    let decision_wait = config.transfer.response_timeout;

    let (node, mut events) = Node::start(config)
        .await
        .context("Failed to start the communication server")?;

    if !args.quiet {
        let device = node.identity().device();
        println!();
        println!("Lanshake v{}", lanshake_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!("  Device:    {} ({})", device.nickname, device.device_id);
        println!("  Listening: {}", node.local_addr());
        println!("  Saving to: {}", output_dir.display());
        println!();
        println!("  Press Ctrl+C to stop.");
        println!();
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                handle_event(event, &args, &output_dir, decision_wait, &mut stdin).await;
            }
        }
    }

    if !args.quiet {
        println!();
        println!("  Stopping.");
    }
    node.shutdown().await?;
    Ok(())
}

async fn handle_event<R>(
    event: ServerEvent,
    args: &ServeArgs,
    output_dir: &Path,
    decision_wait: Duration,
    stdin: &mut tokio::io::Lines<R>,
) where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match event {
        ServerEvent::DeviceRegistered(registration) => {
            tracing::debug!(
                device_id = %registration.device.device_id,
                ip = %registration.connection.ip_address,
                "peer reconciled"
            );
        }
        ServerEvent::TransferRequested(offer) => {
            let accepted = args.yes || confirm(&offer, decision_wait, stdin).await;
            if accepted {
                if !args.quiet {
                    println!("  Receiving into {}", output_dir.display());
                }
                offer.accept(PathBuf::from(output_dir));
            } else {
                if !args.quiet {
                    println!("  Declined.");
                }
                offer.reject();
            }
        }
        ServerEvent::ClipboardReceived { device, text } => {
            if args.quiet {
                println!("{text}");
            } else {
                println!("  Clipboard from {}: {}", device.nickname, preview(&text, 60));
            }
        }
        ServerEvent::TransferFinished(group) => {
            if args.quiet {
                return;
            }
            match group.state() {
                TransferState::Completed => println!(
                    "  Transfer {} complete: {} items ({})",
                    group.group_id,
                    group.entries().len(),
                    format_size(group.total_size())
                ),
                state => eprintln!(
                    "  Transfer {} ended {}: {}",
                    group.group_id,
                    state,
                    group.failure().unwrap_or("no reason given")
                ),
            }
            println!();
        }
    }
}

async fn confirm<R>(
    offer: &IncomingTransfer,
    wait: Duration,
    stdin: &mut tokio::io::Lines<R>,
) -> bool
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    println!(
        "  {} wants to send {} items ({})",
        offer.device.nickname,
        offer.group.entries().len(),
        format_size(offer.group.total_size())
    );
    for entry in offer.group.entries().iter().take(10) {
        let marker = if entry.is_directory { "/" } else { "" };
        println!("    {}{}", entry.name, marker);
    }
    if offer.group.entries().len() > 10 {
        println!("    ... and {} more", offer.group.entries().len() - 10);
    }
    print!("  Accept? [y/N] ");
    let _ = io::stdout().flush();

    let answer = read_answer(stdin, wait).await;
    if answer.is_none() {
        println!();
        println!("  No answer within {}s.", wait.as_secs());
    }
    answer.unwrap_or(false)
}

/// Read a yes/no answer. `None` when nothing arrives within `wait`.
async fn read_answer<R>(stdin: &mut tokio::io::Lines<R>, wait: Duration) -> Option<bool>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match tokio::time::timeout(wait, stdin.next_line()).await {
        Ok(Ok(Some(line))) => Some(matches!(line.trim().to_lowercase().as_str(), "y" | "yes")),
        Ok(_) => Some(false),
        Err(_) => None,
    }
}
