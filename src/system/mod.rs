// file: src/system/mod.rs
// version: 1.0.0
// guid: 0f1a2b3c-4d5e-4f6a-9b7c-8d9e0f1a2b3c

//! Host level operations: command execution, storage, kernel modules,
//! mounts, entropy, packages, power and the boot sequence

pub mod boot;
pub mod disk;
pub mod entropy;
pub mod executor;
pub mod modules;
pub mod packages;
pub mod power;
pub mod vfs;
pub mod zfs;

pub use boot::{BootOutcome, BootSequencer, StepPolicy};
pub use executor::{CommandExecutor, CommandOutput, LocalExecutor};
pub use power::{PowerIntent, PowerStateMachine};
