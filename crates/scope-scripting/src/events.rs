//! Events and the dispatcher's bounded intake queue.
//!
//! Off-thread producers (transport readers, the TUI input bar, the Monitor
//! main) post [`Event`]s; the script thread drains them in arrival order.
//! The queue is bounded: on overflow the oldest droppable (traffic) event is
//! discarded with a warning, while control events are never lost.

use chrono::{DateTime, Local};
use scope_core::LogLevel;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// What happened, with its payload.
#[derive(Debug, Clone)]
pub enum EventKind {
    // Traffic, droppable under back-pressure.
    SerialRx(Vec<u8>),
    SerialTx(Vec<u8>),
    RttRx(Vec<u8>),
    RttTx(Vec<u8>),
    BleRead {
        service: String,
        characteristic: String,
        value: Vec<u8>,
    },
    BleWrite {
        service: String,
        characteristic: String,
        value: Vec<u8>,
    },
    BleWriteNowait {
        service: String,
        characteristic: String,
        value: Vec<u8>,
    },
    BleNotify {
        service: String,
        characteristic: String,
        value: Vec<u8>,
    },
    BleIndicate {
        service: String,
        characteristic: String,
        value: Vec<u8>,
    },

    // Interface transitions, never dropped.
    SerialConnected {
        port: String,
        baud: u32,
    },
    SerialDisconnected {
        port: String,
        baud: u32,
    },
    RttConnected {
        target: String,
        channel: usize,
    },
    RttDisconnected {
        target: String,
        channel: usize,
    },
    BleConnected {
        device: String,
    },
    BleDisconnected {
        device: String,
    },
    MtuChanged {
        device: String,
        mtu: u32,
    },

    // Control, never dropped.
    Load {
        path: PathBuf,
    },
    Unload {
        name: String,
    },
    Reload {
        name: String,
    },
    Command {
        plugin: String,
        command: String,
        args: Vec<String>,
    },
    SetLogLevel {
        plugin: String,
        level: LogLevel,
    },
    Shutdown,
}

impl EventKind {
    /// Traffic may be shed under back-pressure; transitions and control
    /// keep their ordering guarantees by never being dropped.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            Self::SerialRx(_)
                | Self::SerialTx(_)
                | Self::RttRx(_)
                | Self::RttTx(_)
                | Self::BleRead { .. }
                | Self::BleWrite { .. }
                | Self::BleWriteNowait { .. }
                | Self::BleNotify { .. }
                | Self::BleIndicate { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::SerialRx(_) => "serial-rx",
            Self::SerialTx(_) => "serial-tx",
            Self::RttRx(_) => "rtt-rx",
            Self::RttTx(_) => "rtt-tx",
            Self::BleRead { .. } => "ble-read",
            Self::BleWrite { .. } => "ble-write",
            Self::BleWriteNowait { .. } => "ble-write-nowait",
            Self::BleNotify { .. } => "ble-notify",
            Self::BleIndicate { .. } => "ble-indicate",
            Self::SerialConnected { .. } => "serial-connected",
            Self::SerialDisconnected { .. } => "serial-disconnected",
            Self::RttConnected { .. } => "rtt-connected",
            Self::RttDisconnected { .. } => "rtt-disconnected",
            Self::BleConnected { .. } => "ble-connected",
            Self::BleDisconnected { .. } => "ble-disconnected",
            Self::MtuChanged { .. } => "mtu-changed",
            Self::Load { .. } => "load",
            Self::Unload { .. } => "unload",
            Self::Reload { .. } => "reload",
            Self::Command { .. } => "command",
            Self::SetLogLevel { .. } => "set-log-level",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A queued event with its arrival metadata.
#[derive(Debug, Clone)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Local>,
    pub kind: EventKind,
}

/// Bounded MPSC intake with drop-oldest-droppable overflow.
pub struct EventQueue {
    inner: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
    next_seq: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Post from any thread. Returns the assigned sequence number.
    pub fn post(&self, kind: EventKind) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let event = Event {
            seq,
            timestamp: Local::now(),
            kind,
        };

        {
            let mut queue = self.inner.lock().expect("event queue lock poisoned");
            if queue.len() >= self.capacity {
                if let Some(victim) = queue.iter().position(|event| event.kind.is_droppable()) {
                    let dropped = queue.remove(victim).expect("victim index in range");
                    tracing::warn!(
                        seq = dropped.seq,
                        kind = dropped.kind.label(),
                        "event queue full, dropping oldest traffic event"
                    );
                }
                // All control: exceed capacity rather than lose ordering.
            }
            queue.push_back(event);
        }

        self.notify.notify_one();
        seq
    }

    /// Await the next event in arrival order. Script-thread only.
    pub async fn next(&self) -> Event {
        loop {
            if let Some(event) = self.inner.lock().expect("event queue lock poisoned").pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("event queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_assigns_monotonic_sequence_numbers() {
        let queue = EventQueue::new(8);
        let first = queue.post(EventKind::SerialRx(vec![1]));
        let second = queue.post(EventKind::SerialRx(vec![2]));
        assert!(second > first);
    }

    #[test]
    fn overflow_drops_the_oldest_traffic_event() {
        let queue = EventQueue::new(2);
        queue.post(EventKind::SerialRx(vec![1]));
        queue.post(EventKind::SerialRx(vec![2]));
        queue.post(EventKind::SerialRx(vec![3]));

        assert_eq!(queue.len(), 2);
        let mut queue_inner = queue.inner.lock().unwrap();
        let payloads: Vec<_> = queue_inner
            .drain(..)
            .map(|event| match event.kind {
                EventKind::SerialRx(bytes) => bytes[0],
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(payloads, vec![2, 3]);
    }

    #[test]
    fn overflow_never_drops_control_events() {
        let queue = EventQueue::new(2);
        queue.post(EventKind::Shutdown);
        queue.post(EventKind::Unload {
            name: "echo".to_string(),
        });
        queue.post(EventKind::SerialRx(vec![9]));
        // Queue exceeds capacity instead of shedding control events.
        assert_eq!(queue.len(), 3);

        let queue = EventQueue::new(2);
        queue.post(EventKind::SerialRx(vec![1]));
        queue.post(EventKind::Shutdown);
        queue.post(EventKind::SerialRx(vec![2]));
        let kinds: Vec<_> = queue
            .inner
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.kind.label())
            .collect();
        assert_eq!(kinds, vec!["shutdown", "serial-rx"]);
    }

    #[tokio::test]
    async fn next_wakes_on_post() {
        let queue = std::sync::Arc::new(EventQueue::new(4));
        let producer = queue.clone();
        let handle = tokio::spawn(async move {
            producer.post(EventKind::SerialRx(vec![42]));
        });

        let event = queue.next().await;
        assert!(matches!(event.kind, EventKind::SerialRx(ref bytes) if bytes == &[42]));
        handle.await.unwrap();
    }
}
