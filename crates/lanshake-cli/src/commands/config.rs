//! Configuration commands.

use anyhow::{Context, Result};

use lanshake_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub fn run(args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let rendered = super::load_config()
                .to_toml()
                .context("Failed to render the configuration")?;
            println!("{rendered}");
        }
        ConfigAction::Path => {
            println!("{}", Config::config_path().display());
        }
        ConfigAction::Reset => {
            let path = Config::config_path();
            Config::default()
                .save_to(&path)
                .context("Failed to write the default configuration")?;
            println!("  Reset configuration at {}", path.display());
        }
    }
    Ok(())
}
