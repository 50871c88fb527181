//! Shell completions.

use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::CommandFactory;
use clap_complete::{generate, Shell};

use super::{Cli, CompletionsAction, ShellType};

const BIN_NAME: &str = "lanshake";

impl From<ShellType> for Shell {
    fn from(shell: ShellType) -> Self {
        match shell {
            ShellType::Bash => Self::Bash,
            ShellType::Zsh => Self::Zsh,
            ShellType::Fish => Self::Fish,
            ShellType::PowerShell => Self::PowerShell,
            ShellType::Elvish => Self::Elvish,
        }
    }
}

/// Run the completions command.
pub fn run(action: CompletionsAction) -> Result<()> {
    match action {
        CompletionsAction::Generate { shell } => {
            generate(Shell::from(shell), &mut Cli::command(), BIN_NAME, &mut io::stdout());
            Ok(())
        }
        CompletionsAction::Install { shell } => {
            let shell = shell.map_or_else(shell_from_env, Ok)?;
            let path = install_path(shell)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::write(&path, render(shell))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("  Installed {shell:?} completions to {}", path.display());
            println!("  Open a new shell to use them.");
            Ok(())
        }
        CompletionsAction::Uninstall { shell } => {
            let shell = shell.map_or_else(shell_from_env, Ok)?;
            let path = install_path(shell)?;
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                println!("  Removed {}", path.display());
            } else {
                println!("  Nothing installed at {}", path.display());
            }
            Ok(())
        }
    }
}

fn render(shell: ShellType) -> String {
    let mut buf = Vec::new();
    generate(Shell::from(shell), &mut Cli::command(), BIN_NAME, &mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

fn shell_from_env() -> Result<ShellType> {
    let shell = env::var("SHELL").context("$SHELL is not set; pass --shell")?;
    let name = shell.rsplit('/').next().unwrap_or(&shell).to_lowercase();
    Ok(match name.as_str() {
        "bash" => ShellType::Bash,
        "zsh" => ShellType::Zsh,
        "fish" => ShellType::Fish,
        "pwsh" | "powershell" => ShellType::PowerShell,
        "elvish" => ShellType::Elvish,
        other => bail!("Unsupported shell '{other}'; pass --shell"),
    })
}

fn install_path(shell: ShellType) -> Result<PathBuf> {
    let home = env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .context("Could not determine home directory")?;
    let data = env::var_os("XDG_DATA_HOME").map_or_else(|| home.join(".local/share"), PathBuf::from);
    let config = env::var_os("XDG_CONFIG_HOME").map_or_else(|| home.join(".config"), PathBuf::from);

    Ok(match shell {
        ShellType::Bash => data.join("bash-completion/completions").join(BIN_NAME),
        ShellType::Zsh => data.join("zsh/site-functions").join(format!("_{BIN_NAME}")),
        ShellType::Fish => config.join("fish/completions").join(format!("{BIN_NAME}.fish")),
        ShellType::PowerShell => config
            .join("powershell/completions")
            .join(format!("{BIN_NAME}.ps1")),
        ShellType::Elvish => home.join(".elvish/lib").join(format!("{BIN_NAME}.elv")),
    })
}
