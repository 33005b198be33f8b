// file: src/console.rs
// version: 1.0.0
// guid: 5e6f7a8b-9c0d-4e1f-8a2b-3c4d5e6f7a8b

//! One-key operator menu on the system console

use crate::app::AppContext;
use crate::error::K8sInitError;
use crate::network::setup::LOOPBACK;
use crate::network::NetworkBringUp;
use crate::system::power::PowerIntent;
use crate::Result;
use colored::Colorize;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal;
use std::io::Write;
use std::time::Duration;
use tracing::{error, info, warn};

pub const SHELL: &str = "/bin/sh";
const UNKNOWN_PAUSE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Shell,
    Poweroff,
    Reboot,
    Unknown(char),
}

pub fn parse_command(key: char) -> ConsoleCommand {
    match key.to_ascii_uppercase() {
        'C' => ConsoleCommand::Shell,
        'P' => ConsoleCommand::Poweroff,
        'R' => ConsoleCommand::Reboot,
        _ => ConsoleCommand::Unknown(key),
    }
}

/// Menu text, addresses first
pub fn render_menu(addresses: &[String]) -> String {
    let mut out = String::new();
    out.push_str(&format!("\n    {}\n\n", "k8sinit".bold()));
    if !addresses.is_empty() {
        out.push_str(&format!("Ip Addresses: {}\n\n", addresses.join(",")));
    }
    out.push_str("For Console press   C\n");
    out.push_str("For Poweroff press  P\n");
    out.push_str("For Reboot press    R\n");
    out
}

pub struct Console<'a> {
    ctx: &'a AppContext,
}

impl<'a> Console<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    /// Serve the menu until a power command ends the process
    pub async fn run(&self) {
        info!("entering ui");
        loop {
            self.draw().await;
            let key = match read_key().await {
                Ok(key) => key,
                Err(e) => {
                    error!("cannot get command: {}", e);
                    tokio::time::sleep(UNKNOWN_PAUSE).await;
                    continue;
                }
            };

            match parse_command(key) {
                ConsoleCommand::Shell => {
                    if let Err(e) = open_shell().await {
                        error!("shell failed: {}", e);
                    }
                }
                ConsoleCommand::Poweroff => self.ctx.power.execute(PowerIntent::Poweroff).await,
                ConsoleCommand::Reboot => self.ctx.power.execute(PowerIntent::Reboot).await,
                ConsoleCommand::Unknown(_) => {
                    info!("Unknown command...");
                    tokio::time::sleep(UNKNOWN_PAUSE).await;
                }
            }
        }
    }

    async fn draw(&self) {
        let addresses = self.addresses().await;
        let mut stdout = std::io::stdout();
        // Clear scrollback, home, clear screen
        let _ = write!(stdout, "\x1b[3;J\x1b[H\x1b[2J{}", render_menu(&addresses));
        let _ = stdout.flush();
    }

    async fn addresses(&self) -> Vec<String> {
        let net = NetworkBringUp::new(self.ctx.executor.as_ref());
        let links = match net.list_links().await {
            Ok(links) => links,
            Err(e) => {
                warn!("cannot list links: {}", e);
                return Vec::new();
            }
        };
        let mut addresses = Vec::new();
        for link in links.iter().filter(|l| l.ifname != LOOPBACK) {
            if let Ok(Some(cidr)) = net.interface_ipv4(&link.ifname).await {
                addresses.push(cidr.to_string());
            }
        }
        addresses
    }
}

/// Wait for a single key press in raw mode
async fn read_key() -> Result<char> {
    tokio::task::spawn_blocking(|| -> Result<char> {
        terminal::enable_raw_mode()?;
        let key = loop {
            match event::read() {
                Ok(Event::Key(KeyEvent {
                    code: KeyCode::Char(c),
                    kind: KeyEventKind::Press,
                    ..
                })) => break Ok(c),
                Ok(_) => continue,
                Err(e) => break Err(e),
            }
        };
        let _ = terminal::disable_raw_mode();
        Ok(key?)
    })
    .await
    .map_err(|e| K8sInitError::system(format!("console reader failed: {}", e)))?
}

async fn open_shell() -> Result<()> {
    info!("starting {}", SHELL);
    let status = tokio::process::Command::new(SHELL).status().await?;
    info!("{} exited with {}", SHELL, status);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command('C'), ConsoleCommand::Shell);
        assert_eq!(parse_command('p'), ConsoleCommand::Poweroff);
        assert_eq!(parse_command('R'), ConsoleCommand::Reboot);
        assert_eq!(parse_command('x'), ConsoleCommand::Unknown('x'));
    }

    #[test]
    fn test_render_menu() {
        colored::control::set_override(false);
        let menu = render_menu(&["10.0.0.1/24".to_string(), "192.168.1.5/24".to_string()]);
        assert!(menu.contains("Ip Addresses: 10.0.0.1/24,192.168.1.5/24"));
        assert!(menu.contains("For Reboot press    R"));

        let bare = render_menu(&[]);
        assert!(!bare.contains("Ip Addresses"));
    }
}
