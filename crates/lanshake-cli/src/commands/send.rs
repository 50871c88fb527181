//! Send command implementation.
//!
//! Sends files to a device already in the registry, using its most recently
//! verified address.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::watch;

use lanshake_core::index::{build_index, format_size, total_size};
use lanshake_core::transfer::{TransferProgress, TransferState};

use super::SendArgs;
use crate::ui::progress_line;

/// Run the send command.
pub async fn run(args: SendArgs) -> Result<()> {
    let mut config = super::load_config();
    if let Some(port) = args.port {
        config.network.communication_port = port;
    }

    let entries = build_index(&args.paths).context("Failed to read the files to send")?;

    let (node, _events) = super::start_client_node(config).await?;
    let device = super::resolve_device(node.registry(), &args.device)?;
    let coordinator = Arc::clone(node.coordinator());
    let addr = coordinator.peer_address(&device.device_id)?;

    let count = entries.len();
    let bytes = total_size(&entries);
    let group = coordinator.create_group(&device.device_id, entries)?;

    if !args.quiet && !args.json {
        println!();
        println!(
            "  Sending {} items ({}) to {} at {}",
            count,
            format_size(bytes),
            device.nickname,
            addr
        );
        println!("  Waiting for {} to accept...", device.nickname);
    }

    let started = Instant::now();
    let handle = coordinator.spawn_send(group.group_id, addr)?;
    let progress_task = if args.quiet || args.json {
        None
    } else {
        Some(tokio::spawn(display_progress(handle.progress.clone())))
    };

    let result = handle.task.await.context("transfer task failed")?;
    if let Some(task) = progress_task {
        task.abort();
    }
    let final_state = coordinator
        .state(group.group_id)?
        .unwrap_or(TransferState::Failed);
    node.shutdown().await?;

    if args.json {
        let output = serde_json::json!({
            "groupId": group.group_id,
            "device": device.device_id,
            "state": final_state.to_string(),
            "items": count,
            "bytes": bytes,
            "seconds": started.elapsed().as_secs_f64(),
            "error": result.as_ref().err().map(ToString::to_string),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !args.quiet {
        println!();
        match &result {
            Ok(_) => println!(
                "  Transfer complete in {:.1}s",
                started.elapsed().as_secs_f64()
            ),
            Err(e) => eprintln!("  Transfer {}: {}", final_state, e),
        }
        println!();
    }

    result.map(|_| ()).map_err(Into::into)
}

async fn display_progress(mut progress: watch::Receiver<TransferProgress>) {
    while progress.changed().await.is_ok() {
        let snapshot = progress.borrow_and_update().clone();
        if snapshot.state == TransferState::InProgress {
            print!("\r  {}", progress_line(&snapshot));
            let _ = io::stdout().flush();
        }
    }
}
