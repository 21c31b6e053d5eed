//! User-visible log sink.
//!
//! Plugin output and runtime notices reach the TUI through a cloneable
//! [`Logger`] handle. The channel guarantees per-line atomicity; the TUI
//! side drains the paired receiver and renders lines with level colors.
//! Host-internal diagnostics use `tracing` instead (see [`crate::logging`]).

use chrono::{DateTime, Local};
use std::sync::mpsc::{Receiver, Sender, channel};

/// Severity of a user-visible log line, ordered most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warning,
    Success,
    Info,
    Debug,
}

impl LogLevel {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Success => "success",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

/// One rendered log line.
#[derive(Debug, Clone)]
pub struct LogMessage {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    /// Originating component or plugin name.
    pub source: String,
    /// Optional sub-context, e.g. the callback a plugin line came from.
    pub context: Option<String>,
    pub text: String,
}

impl LogMessage {
    /// `[source:context] text` — the prefix shown in the TUI log.
    pub fn display_prefix(&self) -> String {
        match &self.context {
            Some(ctx) => format!("[{}:{}]", self.source, ctx),
            None => format!("[{}]", self.source),
        }
    }
}

/// Cloneable handle writing to the user-visible log.
#[derive(Clone)]
pub struct Logger {
    sender: Sender<LogMessage>,
    source: String,
    context: Option<String>,
}

impl Logger {
    /// Create a logger and the receiver the TUI drains.
    pub fn channel(source: impl Into<String>) -> (Self, Receiver<LogMessage>) {
        let (sender, receiver) = channel();
        (
            Self {
                sender,
                source: source.into(),
                context: None,
            },
            receiver,
        )
    }

    /// A handle attributing lines to a different source (e.g. a plugin name).
    pub fn with_source(&self, source: impl Into<String>) -> Self {
        Self {
            sender: self.sender.clone(),
            source: source.into(),
            context: None,
        }
    }

    /// A handle carrying an extra context tag (e.g. a callback name).
    pub fn with_context(&self, context: impl Into<String>) -> Self {
        Self {
            sender: self.sender.clone(),
            source: self.source.clone(),
            context: Some(context.into()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Emit one line. Dropped receivers are ignored: a plugin must not fail
    /// because the TUI went away during shutdown.
    pub fn write(&self, level: LogLevel, text: impl Into<String>) {
        let _ = self.sender.send(LogMessage {
            timestamp: Local::now(),
            level,
            source: self.source.clone(),
            context: self.context.clone(),
            text: text.into(),
        });
    }

    pub fn error(&self, text: impl Into<String>) {
        self.write(LogLevel::Error, text);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.write(LogLevel::Warning, text);
    }

    pub fn success(&self, text: impl Into<String>) {
        self.write(LogLevel::Success, text);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.write(LogLevel::Info, text);
    }

    pub fn debug(&self, text: impl Into<String>) {
        self.write(LogLevel::Debug, text);
    }
}
