//! Connect command implementation.

use std::net::SocketAddr;

use anyhow::{bail, Result};

use lanshake_core::connection::HandshakeOutcome;

use super::ConnectArgs;

/// Run the connect command.
pub async fn run(args: ConnectArgs) -> Result<()> {
    let mut config = super::load_config();
    if let Some(port) = args.port {
        config.network.communication_port = port;
    }
    let addr = SocketAddr::new(args.address, config.network.communication_port);

    let (node, _events) = super::start_client_node(config).await?;
    let outcome = node.handler().connect_to(addr).await;
    node.shutdown().await?;

    match outcome? {
        HandshakeOutcome::Registered(registration) => {
            let device = &registration.device;
            if args.json {
                let output = serde_json::json!({
                    "status": "registered",
                    "device": device,
                    "connection": registration.connection,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!();
                println!("  Connected to {} ({})", device.nickname, device.device_id);
                println!("  {} {} running {}", device.brand, device.model, device.version_name);
                println!(
                    "  Reached via {} on {}",
                    registration.connection.ip_address, registration.connection.adapter_name
                );
                if device.is_restricted {
                    println!("  Note: this device is restricted.");
                }
                println!();
            }
            Ok(())
        }
        HandshakeOutcome::SelfConnection => {
            bail!("{} is this device", addr);
        }
    }
}
