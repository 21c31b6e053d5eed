//! Shared interfaces for the Scope monitor.
//!
//! The plugin runtime (`scope-scripting`) consumes the rest of the Monitor
//! exclusively through the seams defined here: the [`Transport`] trait for
//! the active serial/RTT/BLE interface, the [`Logger`] sink feeding the TUI
//! log, and the [`RuntimeConfig`] knobs the Monitor resolves at startup.

pub mod config;
pub mod error;
pub mod log;
pub mod logging;
pub mod transport;

pub use config::RuntimeConfig;
pub use error::TransportError;
pub use log::{LogLevel, LogMessage, Logger};
pub use transport::{LoopbackTransport, Transport, TransportKind, TransportState};
