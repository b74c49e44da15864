//! Channel fabric abstraction and latched command channels.
//!
//! The site messaging fabric publishes named scalar channels with latched
//! (last-value) semantics and no delivery queue. [`ChannelBus`] is the
//! black-box contract the controller consumes; [`InProcessBus`] is the
//! in-process implementation used by the binaries and the test benches.
//!
//! Because the transport has no queue, command channels use a destructive
//! read: the consumer atomically takes the value and writes the empty
//! sentinel back, so one write produces exactly one command. String channels
//! use `""` as the empty sentinel; numeric request channels use
//! [`RESET_VAL`]. [`LatchedString`] and [`LatchedDouble`] are the only
//! places the sentinels appear.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

/// Sentinel marking a numeric request channel as "unset" [mm, nominally].
///
/// Distinguishes "no request" from "request zero"; consumers write it back
/// after a destructive read.
pub const RESET_VAL: f64 = -999.9;

/// Channel fabric error.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The named endpoint did not respond.
    #[error("channel {0} has disconnected")]
    Disconnected(String),
    /// The endpoint responded with the wrong scalar type.
    #[error("channel {0} holds a different value type")]
    TypeMismatch(String),
}

/// Black-box scalar pub/sub transport.
///
/// All channels are latched: a read returns the last written value. Any
/// operation can fail `Disconnected` when the endpoint is unreachable.
/// Serving a channel (registering it under this process) is idempotent.
pub trait ChannelBus: Send + Sync {
    /// Serve a string channel from this process.
    fn register_string(&self, name: &str, initial: &str);
    /// Serve a double channel from this process.
    fn register_double(&self, name: &str, initial: f64);
    /// Read a string channel.
    fn read_string(&self, name: &str) -> Result<String, ChannelError>;
    /// Write a string channel.
    fn write_string(&self, name: &str, value: &str) -> Result<(), ChannelError>;
    /// Read a double channel.
    fn read_double(&self, name: &str) -> Result<f64, ChannelError>;
    /// Write a double channel.
    fn write_double(&self, name: &str, value: f64) -> Result<(), ChannelError>;
    /// Probe whether the endpoint currently responds.
    fn connected(&self, name: &str) -> bool;
}

// ─── In-Process Implementation ──────────────────────────────────────

#[derive(Debug, Clone)]
enum Scalar {
    Str(String),
    Num(f64),
}

#[derive(Debug)]
struct Slot {
    value: Scalar,
    connected: bool,
}

/// In-process channel registry guarded by a read-write lock.
///
/// Channels must be registered before use; reading or writing an
/// unregistered or severed channel reports `Disconnected`, matching the
/// fabric's behavior for an absent endpoint. `sever`/`restore` let tests
/// simulate fabric loss.
#[derive(Debug, Default)]
pub struct InProcessBus {
    slots: RwLock<HashMap<String, Slot>>,
}

impl InProcessBus {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a channel unreachable (test hook).
    pub fn sever(&self, name: &str) {
        if let Some(slot) = self.slots.write().get_mut(name) {
            slot.connected = false;
        }
    }

    /// Reconnect a severed channel (test hook).
    pub fn restore(&self, name: &str) {
        if let Some(slot) = self.slots.write().get_mut(name) {
            slot.connected = true;
        }
    }
}

impl ChannelBus for InProcessBus {
    fn register_string(&self, name: &str, initial: &str) {
        self.slots.write().entry(name.to_string()).or_insert(Slot {
            value: Scalar::Str(initial.to_string()),
            connected: true,
        });
    }

    fn register_double(&self, name: &str, initial: f64) {
        self.slots.write().entry(name.to_string()).or_insert(Slot {
            value: Scalar::Num(initial),
            connected: true,
        });
    }

    fn read_string(&self, name: &str) -> Result<String, ChannelError> {
        let slots = self.slots.read();
        match slots.get(name) {
            Some(slot) if slot.connected => match &slot.value {
                Scalar::Str(s) => Ok(s.clone()),
                Scalar::Num(_) => Err(ChannelError::TypeMismatch(name.to_string())),
            },
            _ => Err(ChannelError::Disconnected(name.to_string())),
        }
    }

    fn write_string(&self, name: &str, value: &str) -> Result<(), ChannelError> {
        let mut slots = self.slots.write();
        match slots.get_mut(name) {
            Some(slot) if slot.connected => match slot.value {
                Scalar::Str(_) => {
                    slot.value = Scalar::Str(value.to_string());
                    Ok(())
                }
                Scalar::Num(_) => Err(ChannelError::TypeMismatch(name.to_string())),
            },
            _ => Err(ChannelError::Disconnected(name.to_string())),
        }
    }

    fn read_double(&self, name: &str) -> Result<f64, ChannelError> {
        let slots = self.slots.read();
        match slots.get(name) {
            Some(slot) if slot.connected => match slot.value {
                Scalar::Num(v) => Ok(v),
                Scalar::Str(_) => Err(ChannelError::TypeMismatch(name.to_string())),
            },
            _ => Err(ChannelError::Disconnected(name.to_string())),
        }
    }

    fn write_double(&self, name: &str, value: f64) -> Result<(), ChannelError> {
        let mut slots = self.slots.write();
        match slots.get_mut(name) {
            Some(slot) if slot.connected => match slot.value {
                Scalar::Num(_) => {
                    slot.value = Scalar::Num(value);
                    Ok(())
                }
                Scalar::Str(_) => Err(ChannelError::TypeMismatch(name.to_string())),
            },
            _ => Err(ChannelError::Disconnected(name.to_string())),
        }
    }

    fn connected(&self, name: &str) -> bool {
        self.slots
            .read()
            .get(name)
            .map(|slot| slot.connected)
            .unwrap_or(false)
    }
}

// ─── Typed Handles ──────────────────────────────────────────────────

/// Handle binding a bus to one string channel.
#[derive(Clone)]
pub struct StringChannel {
    bus: Arc<dyn ChannelBus>,
    name: String,
}

impl StringChannel {
    /// Bind to a channel by full name.
    pub fn new(bus: Arc<dyn ChannelBus>, name: impl Into<String>) -> Self {
        Self {
            bus,
            name: name.into(),
        }
    }

    /// Full channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latched value.
    pub fn get(&self) -> Result<String, ChannelError> {
        self.bus.read_string(&self.name)
    }

    /// Publish a value.
    pub fn set(&self, value: &str) -> Result<(), ChannelError> {
        self.bus.write_string(&self.name, value)
    }
}

/// Handle binding a bus to one double channel.
#[derive(Clone)]
pub struct DoubleChannel {
    bus: Arc<dyn ChannelBus>,
    name: String,
}

impl DoubleChannel {
    /// Bind to a channel by full name.
    pub fn new(bus: Arc<dyn ChannelBus>, name: impl Into<String>) -> Self {
        Self {
            bus,
            name: name.into(),
        }
    }

    /// Full channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latched value.
    pub fn get(&self) -> Result<f64, ChannelError> {
        self.bus.read_double(&self.name)
    }

    /// Publish a value.
    pub fn set(&self, value: f64) -> Result<(), ChannelError> {
        self.bus.write_double(&self.name, value)
    }
}

// ─── Latched Command Channels ───────────────────────────────────────

/// String command channel with destructive-read semantics.
pub struct LatchedString(StringChannel);

impl LatchedString {
    /// Bind to a command channel by full name.
    pub fn new(bus: Arc<dyn ChannelBus>, name: impl Into<String>) -> Self {
        Self(StringChannel::new(bus, name))
    }

    /// Full channel name.
    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// Consume the pending command, if any.
    ///
    /// A non-empty value is replaced with `""` before it is returned, so a
    /// single client write is interpreted exactly once.
    pub fn take(&self) -> Result<Option<String>, ChannelError> {
        let value = self.0.get()?;
        if value.is_empty() {
            return Ok(None);
        }
        self.0.set("")?;
        Ok(Some(value))
    }
}

/// Numeric request channel with destructive-read semantics.
pub struct LatchedDouble(DoubleChannel);

impl LatchedDouble {
    /// Bind to a request channel by full name.
    pub fn new(bus: Arc<dyn ChannelBus>, name: impl Into<String>) -> Self {
        Self(DoubleChannel::new(bus, name))
    }

    /// Full channel name.
    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// Consume the pending request, if any.
    ///
    /// Returns `Some(v)` for a non-sentinel value after writing
    /// [`RESET_VAL`] back; a channel holding the sentinel yields `None`.
    pub fn take(&self) -> Result<Option<f64>, ChannelError> {
        let value = self.0.get()?;
        if value == RESET_VAL {
            return Ok(None);
        }
        self.0.set(RESET_VAL)?;
        Ok(Some(value))
    }
}
