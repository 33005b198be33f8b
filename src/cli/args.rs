// file: src/cli/args.rs
// version: 2.0.0
// guid: f6g7h8i9-j0k1-2345-6789-012345fghijk

//! Command line argument definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(name = "k8sinit")]
#[command(about = "Init process for storage backed cluster appliances")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Settings file (TOML)
    #[arg(short, long, global = true, env = "K8SINIT_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Boot the appliance (default)
    Run,

    /// Ask the running init to reboot
    Reboot,

    /// Ask the running init to power off
    Poweroff,
}

impl Cli {
    /// Parse arguments. As PID 1 the kernel may pass arguments we do not
    /// know; those fall back to a plain `run`.
    pub fn parse_for_init(is_init: bool) -> Self {
        if is_init {
            Self::try_parse().unwrap_or_default()
        } else {
            Self::parse()
        }
    }

    pub fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Run)
    }
}

/// Command implied by the name the binary was invoked as
pub fn command_from_program_name(argv0: &str) -> Option<Commands> {
    let name = std::path::Path::new(argv0).file_name()?.to_str()?;
    match name {
        "reboot" => Some(Commands::Reboot),
        "poweroff" => Some(Commands::Poweroff),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::try_parse_from(["k8sinit"]).unwrap();
        assert_eq!(cli.command(), Commands::Run);

        let cli = Cli::try_parse_from(["k8sinit", "--json-logs", "poweroff"]).unwrap();
        assert!(cli.json_logs);
        assert_eq!(cli.command(), Commands::Poweroff);
    }

    #[test]
    fn test_program_name_aliases() {
        assert_eq!(command_from_program_name("/sbin/reboot"), Some(Commands::Reboot));
        assert_eq!(command_from_program_name("poweroff"), Some(Commands::Poweroff));
        assert_eq!(command_from_program_name("/init"), None);
    }
}
