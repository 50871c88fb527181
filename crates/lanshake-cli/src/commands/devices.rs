//! Device registry commands.
//!
//! These work on the stored registry directly and never touch the network.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use lanshake_core::identity::{HostPlatform, LocalIdentity};
use lanshake_core::registry::{Device, DeviceRegistry};
use lanshake_core::store::JsonStore;

use super::{DevicesAction, DevicesArgs};
use crate::ui::format_timestamp;

/// Run the devices command.
pub fn run(args: DevicesArgs) -> Result<()> {
    let registry = open_registry()?;

    match args.action {
        DevicesAction::List { json } => list(&registry, json),
        DevicesAction::Trust { device } => {
            update(&registry, &device, |r, id| r.set_trusted(id, true), "trusted")
        }
        DevicesAction::Untrust { device } => {
            update(&registry, &device, |r, id| r.set_trusted(id, false), "no longer trusted")
        }
        DevicesAction::Restrict { device } => {
            update(&registry, &device, |r, id| r.set_restricted(id, true), "restricted")
        }
        DevicesAction::Unrestrict { device } => update(
            &registry,
            &device,
            |r, id| r.set_restricted(id, false),
            "no longer restricted",
        ),
        DevicesAction::Rename { device, nickname } => {
            update(&registry, &device, |r, id| r.rename(id, &nickname), "renamed")
        }
        DevicesAction::Remove { device } => {
            let device = super::resolve_device(&registry, &device)?;
            if !registry.delete(&device.device_id)? {
                bail!("Device '{}' was already gone", device.device_id);
            }
            println!("  Removed {} ({})", device.nickname, device.device_id);
            Ok(())
        }
    }
}

fn open_registry() -> Result<DeviceRegistry> {
    let config = super::load_config();
    let data_dir = config.data_dir();
    let platform = HostPlatform::load(&data_dir).context("Failed to load the device id")?;
    let identity = LocalIdentity::new(
        &platform,
        Some(config.general.device_name.as_str()),
        config.general.nickname_max_length,
    );
    let store = JsonStore::open(data_dir.join("registry.json"))
        .context("Failed to open the device registry")?;
    DeviceRegistry::new(
        Arc::new(store),
        identity.device().clone(),
        config.general.nickname_max_length,
    )
    .context("Failed to open the device registry")
}

fn update(
    registry: &DeviceRegistry,
    query: &str,
    apply: impl FnOnce(&DeviceRegistry, &str) -> lanshake_core::Result<Device>,
    what: &str,
) -> Result<()> {
    let device = super::resolve_device(registry, query)?;
    if device.is_local_address {
        bail!("That is this device");
    }
    let device = apply(registry, &device.device_id)?;
    println!("  {} ({}) {}", device.nickname, device.device_id, what);
    Ok(())
}

fn list(registry: &DeviceRegistry, json: bool) -> Result<()> {
    let devices: Vec<Device> = registry
        .devices()?
        .into_iter()
        .filter(|d| !d.is_local_address)
        .collect();

    if json {
        let output: Vec<_> = devices
            .iter()
            .map(|d| {
                let connections = registry.connections_for(&d.device_id).unwrap_or_default();
                serde_json::json!({ "device": d, "connections": connections })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("  No known devices. Run 'lanshake connect <ip>' to add one.");
        return Ok(());
    }

    println!();
    for device in &devices {
        let mut flags = Vec::new();
        if device.is_trusted {
            flags.push("trusted");
        }
        if device.is_restricted {
            flags.push("restricted");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };

        println!("  {}{}", device.nickname, flags);
        println!("    id:        {}", device.device_id);
        println!(
            "    device:    {} {} ({})",
            device.brand, device.model, device.version_name
        );
        println!("    last seen: {}", format_timestamp(device.last_usage_time));
        for connection in registry.connections_for(&device.device_id)? {
            println!(
                "    via:       {} on {} (checked {})",
                connection.ip_address,
                connection.adapter_name,
                format_timestamp(connection.last_checked_date)
            );
        }
        println!();
    }
    Ok(())
}
