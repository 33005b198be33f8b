// file: src/cli/commands.rs
// version: 2.0.0
// guid: g7h8i9j0-k1l2-3456-7890-123456ghijkl

//! Command implementations for the CLI

use crate::{
    app::AppContext,
    config::InitSettings,
    console::Console,
    system::{
        boot::BootSequencer,
        power::{send_intent_to_init, PowerIntent},
    },
    Result,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const IDLE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Boot the appliance, hand over to the console and idle forever when
/// either finishes
pub async fn run_command(config: Option<&Path>) -> Result<()> {
    info!("hello from k8sinit {}", crate::VERSION);

    let settings = InitSettings::load(config)?;
    let ctx = Arc::new(AppContext::local(settings)?);

    let boot_ctx = Arc::clone(&ctx);
    let booted = tokio::spawn(async move {
        let outcome = BootSequencer::new(&boot_ctx).run().await;
        match outcome {
            Ok(outcome) => {
                if outcome.is_degraded() {
                    warn!("running degraded: {}", outcome.degraded.join(", "));
                }
                Console::new(&boot_ctx).run().await;
            }
            Err(e) => error!("cannot load system: {}", e),
        }
    })
    .await;
    if let Err(e) = booted {
        error!("boot task failed: {}", e);
    }

    idle().await
}

/// Keep PID 1 alive; power signals are still handled by the listener
async fn idle() -> Result<()> {
    loop {
        info!("Sleeping...");
        tokio::time::sleep(IDLE_INTERVAL).await;
    }
}

/// Forward a reboot or poweroff request to PID 1
pub async fn power_command(intent: PowerIntent) -> Result<()> {
    info!("requesting {}", intent);
    send_intent_to_init(intent)
}
