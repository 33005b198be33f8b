// file: src/logging/mod.rs
// version: 1.0.0
// guid: dd770006-d5fe-4e8d-b40c-48d052349558

//! Logging system for k8sinit

pub mod logger;

pub use logger::{init_json_logger, init_logger, with_async_operation_span};
