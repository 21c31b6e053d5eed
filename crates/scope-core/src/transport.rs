//! Transport seam between the Monitor's interface drivers and the plugin
//! runtime.
//!
//! Drivers (serial, RTT, BLE) live outside this workspace. The runtime only
//! sees them through [`Transport`]: synchronous sends and control calls plus
//! a readable [`TransportState`] snapshot. Incoming bytes never flow through
//! this trait; the driver's reader thread posts them to the runtime's event
//! queue instead.

use crate::error::TransportError;
use std::sync::{Mutex, RwLock};

/// Which interface is currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    None,
    Serial,
    Rtt,
    Ble,
}

impl TransportKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Serial => "serial",
            Self::Rtt => "rtt",
            Self::Ble => "ble",
        }
    }
}

/// Snapshot of the active interface, written by drivers, read by the runtime.
#[derive(Debug, Clone, Default)]
pub struct TransportState {
    pub kind: TransportKind,
    /// Serial port name, empty when not serial.
    pub port: String,
    /// Serial baud rate, 0 when not serial.
    pub baud: u32,
    /// RTT target chip, empty when not RTT.
    pub target: String,
    /// RTT up-channel index, 0 when not RTT.
    pub channel: usize,
}

impl TransportState {
    pub fn serial(port: impl Into<String>, baud: u32) -> Self {
        Self {
            kind: TransportKind::Serial,
            port: port.into(),
            baud,
            ..Self::default()
        }
    }

    pub fn rtt(target: impl Into<String>, channel: usize) -> Self {
        Self {
            kind: TransportKind::Rtt,
            target: target.into(),
            channel,
            ..Self::default()
        }
    }
}

/// The runtime's view of the active interface.
///
/// `send`, `connect`, `disconnect` and `rtt_read` may block on device I/O;
/// the runtime calls `rtt_read` from the blocking pool for that reason.
pub trait Transport: Send + Sync {
    fn state(&self) -> TransportState;

    fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;

    fn connect(&self, port: &str, baud: u32) -> Result<(), TransportError>;

    fn disconnect(&self) -> Result<(), TransportError>;

    /// Read `size` bytes of target memory at `address` over RTT.
    fn rtt_read(&self, address: u64, size: usize) -> Result<Vec<u8>, TransportError>;
}

/// In-process transport used by the test suites and the `--loopback` demo
/// mode: sends are captured, RTT reads are served from a preset memory image.
#[derive(Default)]
pub struct LoopbackTransport {
    state: RwLock<TransportState>,
    sent: Mutex<Vec<Vec<u8>>>,
    /// `(base_address, image)` served by `rtt_read`.
    memory: Mutex<(u64, Vec<u8>)>,
}

impl LoopbackTransport {
    pub fn new(state: TransportState) -> Self {
        Self {
            state: RwLock::new(state),
            ..Self::default()
        }
    }

    pub fn set_state(&self, state: TransportState) {
        *self.state.write().expect("transport state lock poisoned") = state;
    }

    pub fn set_memory(&self, base: u64, image: Vec<u8>) {
        *self.memory.lock().expect("memory lock poisoned") = (base, image);
    }

    /// Everything sent so far, in send order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().expect("sent lock poisoned").clone()
    }
}

impl Transport for LoopbackTransport {
    fn state(&self) -> TransportState {
        self.state.read().expect("transport state lock poisoned").clone()
    }

    fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.state().kind == TransportKind::None {
            return Err(TransportError::NotActive);
        }
        self.sent
            .lock()
            .expect("sent lock poisoned")
            .push(bytes.to_vec());
        Ok(())
    }

    fn connect(&self, port: &str, baud: u32) -> Result<(), TransportError> {
        self.set_state(TransportState::serial(port, baud));
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.set_state(TransportState::default());
        Ok(())
    }

    fn rtt_read(&self, address: u64, size: usize) -> Result<Vec<u8>, TransportError> {
        if self.state().kind != TransportKind::Rtt {
            return Err(TransportError::NotActive);
        }

        let memory = self.memory.lock().expect("memory lock poisoned");
        let (base, image) = (&memory.0, &memory.1);
        let start = address
            .checked_sub(*base)
            .ok_or_else(|| TransportError::Rejected(format!("address {address:#x} below image base")))?
            as usize;
        let end = start
            .checked_add(size)
            .filter(|end| *end <= image.len())
            .ok_or_else(|| TransportError::Rejected(format!("read of {size} bytes out of range")))?;

        Ok(image[start..end].to_vec())
    }
}
