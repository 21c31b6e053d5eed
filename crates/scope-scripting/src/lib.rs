//! Plugin runtime for the Scope monitor.
//!
//! Scripts are Lua tables of callbacks (`on_serial_recv`, `on_load`, user
//! commands, …). The runtime wraps every invocation in a fresh coroutine on
//! a single script thread, interprets each yielded host request, and resumes
//! the coroutine with the reply — see [`dispatcher`] for the scheduler and
//! [`proto`] for the wire protocol.
//!
//! ```ignore
//! use scope_core::{Logger, LoopbackTransport, RuntimeConfig, TransportState};
//! use scope_scripting::PluginRuntime;
//! use std::sync::Arc;
//!
//! let (logger, log_rx) = Logger::channel("plugins");
//! let transport = Arc::new(LoopbackTransport::new(TransportState::serial("COM3", 115_200)));
//! let runtime = PluginRuntime::spawn(RuntimeConfig::default(), transport, logger)?;
//!
//! runtime.load_plugin("plugins/echo.lua");
//! runtime.serial_rx(b"1\n".to_vec());
//! ```

pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod host;
pub mod invoke;
pub mod patterns;
pub mod plugin;
pub mod proto;
pub mod shell;

pub use dispatcher::{PluginRuntime, RuntimeHandle};
pub use events::{Event, EventKind, EventQueue};
pub use host::{Frame, HostServices, PluginResources};
pub use invoke::{Invocation, InvokeError, parse_invocation, tokenize};
pub use plugin::{Plugin, PluginEntries, PluginEntry, PluginState};
pub use proto::{HostReply, HostRequest, ReplyValue};
pub use shell::{ShellRegistry, ShellSession};
