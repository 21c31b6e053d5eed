//! Runtime configuration.
//!
//! The Monitor resolves these knobs at startup (CLI flags and its own config
//! file live outside this workspace) and hands the result to the plugin
//! runtime.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bound of the dispatcher's event queue. On overflow the oldest
    /// non-lifecycle event is dropped with a warning.
    pub event_queue_capacity: usize,

    /// Default deadline for `shell:run` when the script passes no
    /// `timeout_ms`.
    pub shell_timeout_ms: u64,

    /// Longest a script may park in `serial.recv`/`rtt.recv`. Script
    /// timeouts are clamped to this cap, and an omitted `timeout_ms` waits
    /// the cap, not forever. `rtt.read` is bounded by the same cap.
    pub recv_timeout_cap_ms: u64,

    /// How long `on_unload` may run before the plugin is declared dead.
    pub unload_grace_ms: u64,

    /// Idle latency of the script thread in microseconds; 0 yields to the
    /// scheduler without sleeping.
    pub idle_latency_us: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: 256,
            shell_timeout_ms: 10_000,
            recv_timeout_cap_ms: 60_000,
            unload_grace_ms: 1_000,
            idle_latency_us: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert!(config.event_queue_capacity >= 64);
        assert!(config.shell_timeout_ms >= 1_000);
        assert!(config.recv_timeout_cap_ms >= config.shell_timeout_ms);
    }

    #[test]
    fn partial_deserialization_fills_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"event_queue_capacity": 32}"#).unwrap();
        assert_eq!(config.event_queue_capacity, 32);
        assert_eq!(config.shell_timeout_ms, RuntimeConfig::default().shell_timeout_ms);
    }
}
