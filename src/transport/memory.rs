//! In-memory transport.
//!
//! A typed channel table behind the [`ChannelTransport`] contract. This is
//! the substrate for tests and for the offline simulation backend: channels
//! are seeded up front, values can be mutated out-of-band (e.g. by a task
//! that plays the role of the DAE), and enum channels carry their label
//! lists so the adapter-level label/ordinal translation is exercised for
//! real.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{ChannelTransport, PvValue};
use crate::error::{CtlError, CtlResult};

#[derive(Clone, Debug)]
struct Channel {
    value: PvValue,
    /// State labels; present only on discriminated-enumeration channels.
    labels: Option<Vec<String>>,
    /// Canned server reply: a write stores this instead of the written
    /// value, the way a block-server key answers on its own channel.
    reply: Option<PvValue>,
    read: bool,
    write: bool,
}

/// Shared in-memory channel table. Cloning shares the table.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    channels: Arc<RwLock<HashMap<String, Channel>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed (or replace) a plain channel.
    pub async fn insert(&self, name: &str, value: impl Into<PvValue>) {
        self.channels.write().await.insert(
            name.to_string(),
            Channel {
                value: value.into(),
                labels: None,
                reply: None,
                read: true,
                write: true,
            },
        );
    }

    /// Seed an enum channel with its state labels and initial ordinal.
    pub async fn insert_enum(&self, name: &str, labels: &[&str], ordinal: i64) {
        self.channels.write().await.insert(
            name.to_string(),
            Channel {
                value: PvValue::Int(ordinal),
                labels: Some(labels.iter().map(|s| s.to_string()).collect()),
                reply: None,
                read: true,
                write: true,
            },
        );
    }

    /// Mark a channel read-only or write-only (for permission tests).
    pub async fn set_access(&self, name: &str, read: bool, write: bool) {
        if let Some(ch) = self.channels.write().await.get_mut(name) {
            ch.read = read;
            ch.write = write;
        }
    }

    pub async fn remove(&self, name: &str) {
        self.channels.write().await.remove(name);
    }

    /// Arrange for writes to this channel to be answered with a canned
    /// reply, the way a block-server key responds on its own channel.
    pub async fn auto_reply(&self, name: &str, reply: impl Into<PvValue>) {
        if let Some(ch) = self.channels.write().await.get_mut(name) {
            ch.reply = Some(reply.into());
        }
    }

    /// Mutate a value bypassing access checks (the "instrument side").
    pub async fn poke(&self, name: &str, value: impl Into<PvValue>) {
        if let Some(ch) = self.channels.write().await.get_mut(name) {
            ch.value = value.into();
        }
    }

    /// Read the stored value bypassing label translation (the raw ordinal
    /// for enum channels).
    pub async fn raw(&self, name: &str) -> Option<PvValue> {
        self.channels.read().await.get(name).map(|c| c.value.clone())
    }
}

fn enum_label(ch: &Channel) -> Option<String> {
    let labels = ch.labels.as_ref()?;
    let ordinal = ch.value.as_i64()?;
    labels.get(ordinal as usize).cloned()
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
    async fn get(&self, name: &str, _timeout: Duration) -> CtlResult<PvValue> {
        let channels = self.channels.read().await;
        let ch = channels
            .get(name)
            .ok_or_else(|| CtlError::NotConnected(name.to_string()))?;
        if !ch.read {
            return Err(CtlError::NoReadAccess(name.to_string()));
        }
        // Enum channels read back as their state label.
        if ch.labels.is_some() {
            return enum_label(ch)
                .map(PvValue::Str)
                .ok_or_else(|| CtlError::NoReadAccess(name.to_string()));
        }
        Ok(ch.value.clone())
    }

    async fn set(
        &self,
        name: &str,
        value: PvValue,
        _wait: bool,
        _timeout: Duration,
    ) -> CtlResult<()> {
        let mut channels = self.channels.write().await;
        let ch = channels
            .get_mut(name)
            .ok_or_else(|| CtlError::NotConnected(name.to_string()))?;
        if !ch.write {
            return Err(CtlError::NoWriteAccess(name.to_string()));
        }
        if let Some(labels) = &ch.labels {
            // Textual writes are translated to the ordinal of the matching
            // state label, case-insensitively.
            let ordinal = match &value {
                PvValue::Str(text) => labels
                    .iter()
                    .position(|l| l.eq_ignore_ascii_case(text))
                    .ok_or_else(|| CtlError::InvalidEnumString {
                        channel: name.to_string(),
                        value: text.clone(),
                        choices: labels.clone(),
                    })?,
                other => other.as_i64().ok_or_else(|| CtlError::InvalidEnumString {
                    channel: name.to_string(),
                    value: other.to_string(),
                    choices: labels.clone(),
                })? as usize,
            };
            ch.value = PvValue::Int(ordinal as i64);
            return Ok(());
        }
        ch.value = match &ch.reply {
            Some(reply) => reply.clone(),
            None => value,
        };
        Ok(())
    }

    async fn exists(&self, name: &str, _timeout: Duration) -> CtlResult<bool> {
        Ok(self.channels.read().await.contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_get_set_round_trip() {
        let t = MemoryTransport::new();
        t.insert("IN:X:DAE:TITLE", "old").await;
        t.set("IN:X:DAE:TITLE", "new".into(), true, T).await.unwrap();
        assert_eq!(
            t.get("IN:X:DAE:TITLE", T).await.unwrap(),
            PvValue::Str("new".into())
        );
    }

    #[tokio::test]
    async fn test_missing_channel_is_not_connected() {
        let t = MemoryTransport::new();
        assert!(matches!(
            t.get("NOPE", T).await,
            Err(CtlError::NotConnected(_))
        ));
        assert!(!t.exists("NOPE", T).await.unwrap());
    }

    #[tokio::test]
    async fn test_enum_reads_label_never_ordinal() {
        let t = MemoryTransport::new();
        t.insert_enum("VETO", &["Disabled", "Enabled"], 1).await;
        assert_eq!(
            t.get("VETO", T).await.unwrap(),
            PvValue::Str("Enabled".into())
        );
    }

    #[tokio::test]
    async fn test_enum_write_by_label_case_insensitive() {
        let t = MemoryTransport::new();
        t.insert_enum("VETO", &["Disabled", "Enabled"], 0).await;

        t.set("VETO", "Enabled".into(), true, T).await.unwrap();
        assert_eq!(t.raw("VETO").await, Some(PvValue::Int(1)));

        t.set("VETO", "DISABLED".into(), true, T).await.unwrap();
        assert_eq!(t.raw("VETO").await, Some(PvValue::Int(0)));
    }

    #[tokio::test]
    async fn test_enum_write_bad_label_lists_choices() {
        let t = MemoryTransport::new();
        t.insert_enum("VETO", &["Disabled", "Enabled"], 0).await;
        match t.set("VETO", "maybe".into(), true, T).await {
            Err(CtlError::InvalidEnumString { choices, .. }) => {
                assert_eq!(choices, vec!["Disabled", "Enabled"]);
            }
            other => panic!("expected InvalidEnumString, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_access_flags() {
        let t = MemoryTransport::new();
        t.insert("X", 1.0).await;
        t.set_access("X", false, false).await;
        assert!(matches!(t.get("X", T).await, Err(CtlError::NoReadAccess(_))));
        assert!(matches!(
            t.set("X", 2.0.into(), false, T).await,
            Err(CtlError::NoWriteAccess(_))
        ));
        // exists() still answers: connectivity, not permission.
        assert!(t.exists("X", T).await.unwrap());
    }
}
