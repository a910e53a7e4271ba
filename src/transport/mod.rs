//! Channel-access transport abstraction.
//!
//! The wire protocol itself lives outside this crate; everything above it
//! talks to a [`ChannelTransport`] trait object. The contract is three
//! operations (`get`, `set`, `exists`), each bounded by a per-call timeout,
//! plus two adapter behaviours the rest of the layer relies on:
//!
//! - channels whose native kind is enum, character or string always read
//!   back as text, and enum reads return the state label, never the ordinal;
//! - textual writes to enum channels are matched case-insensitively against
//!   the label list and written as ordinals, with a failed match surfacing
//!   the full valid set.
//!
//! Concrete adapters are expected to cache connected channels by name, since
//! every block access makes one or two transport calls and reconnect
//! overhead dominates interactive latency. [`RetryingTransport`] adds the
//! retry-before-surfacing policy shared by all operations.

pub mod memory;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::error::{CtlError, CtlResult};

pub use memory::MemoryTransport;

/// A value carried on one channel.
#[derive(Clone, Debug, PartialEq)]
pub enum PvValue {
    Float(f64),
    Int(i64),
    Str(String),
    FloatArray(Vec<f64>),
    IntArray(Vec<i64>),
}

impl PvValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Float(f) => Some(*f),
            PvValue::Int(i) => Some(*i as f64),
            PvValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PvValue::Int(i) => Some(*i),
            PvValue::Float(f) => Some(*f as i64),
            PvValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PvValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Float(v) => write!(f, "{}", v),
            PvValue::Int(v) => write!(f, "{}", v),
            PvValue::Str(v) => write!(f, "{}", v),
            PvValue::FloatArray(v) => write!(f, "{:?}", v),
            PvValue::IntArray(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<f64> for PvValue {
    fn from(value: f64) -> Self {
        PvValue::Float(value)
    }
}

impl From<i64> for PvValue {
    fn from(value: i64) -> Self {
        PvValue::Int(value)
    }
}

impl From<&str> for PvValue {
    fn from(value: &str) -> Self {
        PvValue::Str(value.to_string())
    }
}

impl From<String> for PvValue {
    fn from(value: String) -> Self {
        PvValue::Str(value)
    }
}

impl From<Vec<f64>> for PvValue {
    fn from(value: Vec<f64>) -> Self {
        PvValue::FloatArray(value)
    }
}

impl From<Vec<i64>> for PvValue {
    fn from(value: Vec<i64>) -> Self {
        PvValue::IntArray(value)
    }
}

/// Contract for the channel-access adapter.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Read a channel value.
    ///
    /// Fails with [`CtlError::NotConnected`] when the initial connect
    /// exceeds the timeout and [`CtlError::NoReadAccess`] when the channel
    /// refuses reads.
    async fn get(&self, name: &str, timeout: Duration) -> CtlResult<PvValue>;

    /// Read a channel value, formatted as text.
    async fn get_as_string(&self, name: &str, timeout: Duration) -> CtlResult<String> {
        Ok(self.get(name, timeout).await?.to_string())
    }

    /// Write a channel value.
    ///
    /// When `wait` is true the call blocks until the server acknowledges the
    /// write (callback completion); otherwise it returns once the value is
    /// flushed. Fails with [`CtlError::NotConnected`],
    /// [`CtlError::NoWriteAccess`] or [`CtlError::InvalidEnumString`].
    async fn set(&self, name: &str, value: PvValue, wait: bool, timeout: Duration)
        -> CtlResult<()>;

    /// True iff a channel with this name can be connected within the timeout.
    async fn exists(&self, name: &str, timeout: Duration) -> CtlResult<bool>;
}

#[async_trait]
impl<T: ChannelTransport + ?Sized> ChannelTransport for std::sync::Arc<T> {
    async fn get(&self, name: &str, timeout: Duration) -> CtlResult<PvValue> {
        (**self).get(name, timeout).await
    }

    async fn get_as_string(&self, name: &str, timeout: Duration) -> CtlResult<String> {
        (**self).get_as_string(name, timeout).await
    }

    async fn set(
        &self,
        name: &str,
        value: PvValue,
        wait: bool,
        timeout: Duration,
    ) -> CtlResult<()> {
        (**self).set(name, value, wait, timeout).await
    }

    async fn exists(&self, name: &str, timeout: Duration) -> CtlResult<bool> {
        (**self).exists(name, timeout).await
    }
}

/// How often an operation is attempted before its error surfaces.
const ATTEMPTS: u32 = 3;

/// Decorator applying the shared retry policy to any transport.
///
/// Retries do not distinguish connect failures from protocol errors; each
/// failed attempt is logged at debug level.
pub struct RetryingTransport<T> {
    inner: T,
}

impl<T: ChannelTransport> RetryingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: ChannelTransport> ChannelTransport for RetryingTransport<T> {
    async fn get(&self, name: &str, timeout: Duration) -> CtlResult<PvValue> {
        let mut last = None;
        for attempt in 1..=ATTEMPTS {
            match self.inner.get(name, timeout).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    log::debug!("get {} attempt {}/{} failed: {}", name, attempt, ATTEMPTS, e);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| CtlError::NotConnected(name.to_string())))
    }

    async fn set(
        &self,
        name: &str,
        value: PvValue,
        wait: bool,
        timeout: Duration,
    ) -> CtlResult<()> {
        let mut last = None;
        for attempt in 1..=ATTEMPTS {
            match self.inner.set(name, value.clone(), wait, timeout).await {
                Ok(()) => return Ok(()),
                // A bad enum label will not get better on retry.
                Err(e @ CtlError::InvalidEnumString { .. }) => return Err(e),
                Err(e) => {
                    log::debug!("set {} attempt {}/{} failed: {}", name, attempt, ATTEMPTS, e);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| CtlError::NotConnected(name.to_string())))
    }

    async fn exists(&self, name: &str, timeout: Duration) -> CtlResult<bool> {
        self.inner.exists(name, timeout).await
    }
}
