//! Clipboard push command implementation.

use anyhow::{bail, Context, Result};
use tokio::io::AsyncReadExt;

use super::ClipboardArgs;
use crate::ui::preview;

/// Run the clipboard command.
pub async fn run(args: ClipboardArgs) -> Result<()> {
    let text = match args.text.as_deref() {
        Some(text) if text != "-" => text.to_string(),
        _ => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("Failed to read text from stdin")?;
            buf
        }
    };
    if text.is_empty() {
        bail!("Nothing to send");
    }

    let mut config = super::load_config();
    if let Some(port) = args.port {
        config.network.communication_port = port;
    }

    let (node, _events) = super::start_client_node(config).await?;
    let device = super::resolve_device(node.registry(), &args.device)?;
    let addr = node.coordinator().peer_address(&device.device_id)?;
    let result = node
        .coordinator()
        .send_clipboard(&device.device_id, addr, &text)
        .await;
    node.shutdown().await?;
    result?;

    if !args.quiet {
        println!("  Sent to {}: {}", device.nickname, preview(&text, 60));
    }
    Ok(())
}
