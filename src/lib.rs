//! # Botlink Core Library
//!
//! Drives a small robot over Bluetooth with timed motion-command sequences:
//! - Classic Bluetooth serial modules (HC-05/HC-06 style SPP links)
//! - Bluetooth Low Energy peripherals (first writable GATT characteristic)
//!
//! ## Features
//!
//! - Concurrent discovery across both link types
//! - One active connection at a time, with status events
//! - Deterministic command encoding (`F142`, `L28`, `S`, ...)
//! - Sequence execution with per-step timing, cancellation and a final stop
//! - In-memory virtual robot for dry runs
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use botlink_core::{Command, ConnectionManager, Endpoint, SequenceExecutor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = botlink_core::AppConfig::load()?;
//!     let connection = Arc::new(ConnectionManager::with_hardware(&config));
//!     connection.select_endpoint(Endpoint::serial("/dev/rfcomm0", "HC-05"));
//!     connection.connect().await?;
//!
//!     let executor = SequenceExecutor::with_settings(connection, &config.execution);
//!     let run = executor.run(vec![Command::forward(2), Command::turn_left(90)])?;
//!     let outcome = run.wait().await;
//!     println!("{:?}", outcome.phase);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;
pub mod utils;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::{AppConfig, ConfigError, LineEnding};
pub use crate::core::command::{
    Action, Command, CommandSequence, EncodedStep, Encoder, Frame, ParseCommandError, SpeedScale,
    TurnAngle,
};
pub use crate::core::connection::{
    ConnectError, ConnectionEvent, ConnectionManager, ConnectionStatus, Delivery,
};
pub use crate::core::executor::{
    ExecutionEvent, ExecutionPhase, RunHandle, RunOutcome, SequenceError, SequenceExecutor,
};
pub use crate::core::registry::{DeviceRegistry, DiscoveryOptions, RegistryEvent};
pub use crate::core::transport::{
    DiscoveryError, Endpoint, EndpointKind, TransportError, TransportErrorKind, TransportTrait,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
