// file: src/system/executor.rs
// version: 1.0.0
// guid: 8a1f3c2e-6d4b-4f0a-9e7c-1b2d3e4f5a6b

//! Command execution trait used by every component that shells out

use crate::error::K8sInitError;
use crate::Result;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error};

/// Captured result of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Combined stdout and stderr, the way an operator would see them
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

fn command_line(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Trait for executing external programs
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a program and capture its output, whatever the exit status
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run a program and fail on a non-zero exit status
    async fn execute(&self, program: &str, args: &[&str]) -> Result<()> {
        self.execute_with_output(program, args).await.map(|_| ())
    }

    /// Run a program, fail on a non-zero exit status, return stdout
    async fn execute_with_output(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = self.run(program, args).await?;
        if !output.success() {
            let command = command_line(program, args);
            error!("Command failed with exit code {:?}: {}", output.status, command);
            if !output.stderr.trim().is_empty() {
                error!("STDERR: {}", output.stderr.trim());
            }
            return Err(K8sInitError::Process {
                command,
                exit_code: output.status,
                stderr: if output.stderr.is_empty() {
                    output.stdout
                } else {
                    output.stderr
                },
            });
        }
        Ok(output.stdout)
    }

    /// Run a program intended as a boolean check without emitting error logs
    async fn check_silent(&self, program: &str, args: &[&str]) -> Result<bool> {
        Ok(self.run(program, args).await?.success())
    }
}

/// Executes programs on the local machine
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl CommandExecutor for LocalExecutor {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!("Executing local command: {}", command_line(program, args));

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| K8sInitError::Process {
                command: command_line(program, args),
                exit_code: None,
                stderr: format!("Failed to execute command: {}", e),
            })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Test executor that records every command line and replies with
    /// canned outputs matched by command line prefix
    #[derive(Default)]
    pub(crate) struct ScriptedExecutor {
        calls: Mutex<Vec<String>>,
        responses: Mutex<Vec<(String, VecDeque<CommandOutput>)>>,
    }

    impl ScriptedExecutor {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Queue a successful reply for commands starting with `prefix`.
        /// The last queued reply for a prefix is reused once the queue drains.
        pub(crate) fn on(&self, prefix: &str, stdout: &str) -> &Self {
            self.respond(
                prefix,
                CommandOutput {
                    status: Some(0),
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                },
            )
        }

        pub(crate) fn fail(&self, prefix: &str, stderr: &str) -> &Self {
            self.respond(
                prefix,
                CommandOutput {
                    status: Some(1),
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                },
            )
        }

        pub(crate) fn respond(&self, prefix: &str, output: CommandOutput) -> &Self {
            let mut responses = self.responses.lock().unwrap();
            match responses.iter_mut().find(|(p, _)| p == prefix) {
                Some((_, queue)) => queue.push_back(output),
                None => responses.push((prefix.to_string(), VecDeque::from([output]))),
            }
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn called(&self, prefix: &str) -> bool {
            self.calls().iter().any(|c| c.starts_with(prefix))
        }

        pub(crate) fn position(&self, prefix: &str) -> Option<usize> {
            self.calls().iter().position(|c| c.starts_with(prefix))
        }
    }

    #[async_trait::async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
            let line = command_line(program, args);
            self.calls.lock().unwrap().push(line.clone());

            let mut responses = self.responses.lock().unwrap();
            // Longest matching prefix wins
            let entry = responses
                .iter_mut()
                .filter(|(p, _)| line.starts_with(p.as_str()))
                .max_by_key(|(p, _)| p.len());
            Ok(match entry {
                Some((_, queue)) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
                Some((_, queue)) => queue.front().cloned().unwrap_or_default(),
                None => CommandOutput {
                    status: Some(0),
                    ..Default::default()
                },
            })
        }
    }
}
