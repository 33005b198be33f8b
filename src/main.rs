// file: src/main.rs
// version: 2.0.0
// guid: h8i9j0k1-l2m3-4567-8901-234567hijklm

//! k8sinit - main entry point

use k8sinit::{
    cli::{self, Cli, Commands},
    logging::logger,
    system::power::PowerIntent,
    Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Invoked through the /sbin/reboot or /sbin/poweroff links
    let argv0 = std::env::args().next().unwrap_or_default();
    let alias = cli::command_from_program_name(&argv0);

    let cli = match alias {
        Some(_) => Cli::default(),
        None => Cli::parse_for_init(std::process::id() == 1),
    };

    if cli.json_logs {
        logger::init_json_logger()?;
    } else {
        logger::init_logger(cli.verbose, cli.quiet)?;
    }

    match alias.unwrap_or_else(|| cli.command()) {
        Commands::Run => cli::run_command(cli.config.as_deref()).await,
        Commands::Reboot => cli::power_command(PowerIntent::Reboot).await,
        Commands::Poweroff => cli::power_command(PowerIntent::Poweroff).await,
    }
}
