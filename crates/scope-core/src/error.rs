//! Error types shared across the Monitor's seams.

use thiserror::Error;

/// Failures surfaced by a transport driver.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request requires an interface kind that is not currently active.
    #[error("no matching interface is active")]
    NotActive,

    /// The driver rejected the request parameters (port name, baud rate,
    /// memory range, ...).
    #[error("interface rejected request: {0}")]
    Rejected(String),

    /// The underlying device I/O failed.
    #[error("interface I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// The in-band status string carried on host replies for this error.
    pub fn status(&self) -> &'static str {
        match self {
            Self::NotActive => "not-active",
            Self::Rejected(_) => "invalid-argument",
            Self::Io(_) => "io-error",
        }
    }
}
