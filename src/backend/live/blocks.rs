//! Live block service.
//!
//! Blocks are aliases published by the block server; the canonical name
//! list (and the other introspection payloads) arrive as hex-encoded
//! zlib-compressed JSON on `CS:BLOCKSERVER:*` channels. Lookup is
//! case-insensitive but user output always shows the canonical casing.

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::waits::wait_for_band;
use super::Channels;
use crate::backend::{AlarmLists, BlockBackend, RunControl, SetBlockOptions};
use crate::codec::{compress_and_hex, decode_char_waveform, dehex_and_decompress_to_string};
use crate::dae::channels as ch;
use crate::error::{CtlError, CtlResult};
use crate::transport::PvValue;

pub struct LiveBlocks {
    ch: Channels,
}

impl LiveBlocks {
    pub(crate) fn new(ch: Channels) -> Self {
        Self { ch }
    }

    async fn read_blob(&self, key: &str) -> CtlResult<serde_json::Value> {
        let blob = self.ch.get_string(&ch::blockserver(key)).await?;
        let text = dehex_and_decompress_to_string(&blob)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Parameter payloads map names to values; C-string waveforms are
    /// decoded to text, everything else passes through.
    async fn read_pars(&self, key: &str) -> CtlResult<BTreeMap<String, serde_json::Value>> {
        let payload = self.read_blob(key).await?;
        let object = payload
            .as_object()
            .ok_or_else(|| CtlError::BlobDecode(format!("{key} payload is not an object")))?;
        let mut out = BTreeMap::new();
        for (name, value) in object {
            let decoded = match as_int_array(value) {
                Some(codes) => serde_json::Value::String(decode_char_waveform(&codes)?),
                None => value.clone(),
            };
            out.insert(name.clone(), decoded);
        }
        Ok(out)
    }

    /// Send a payload to a mutating block-server key. The server replies
    /// "OK" or an error string on the same channel.
    pub async fn write_blockserver(&self, key: &str, payload: &serde_json::Value) -> CtlResult<()> {
        let channel = ch::blockserver(key);
        let encoded = compress_and_hex(payload.to_string().as_bytes());
        self.ch.set(&channel, encoded).await?;
        let reply = self.ch.get_string(&channel).await?;
        let text = dehex_and_decompress_to_string(&reply).unwrap_or(reply);
        if text.trim() != "OK" {
            return Err(CtlError::UnexpectedReply {
                channel,
                reply: text,
            });
        }
        Ok(())
    }

    pub(crate) async fn canonical(&self, name: &str) -> CtlResult<String> {
        let trimmed = name.trim();
        self.names()
            .await?
            .into_iter()
            .find(|n| n.eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| CtlError::UnknownBlock(trimmed.to_string()))
    }

    /// Channel the value write should land on: the setpoint when one
    /// exists, the block itself otherwise. A dot-field suffix on the
    /// caller's name is stripped and the setpoint tried on the bare block.
    async fn write_target(&self, name: &str) -> CtlResult<String> {
        let base = name.split('.').next().unwrap_or(name);
        let canonical = self.canonical(base).await?;
        let value_channel = ch::block(&canonical);
        let setpoint = ch::block_setpoint(&value_channel);
        if self.ch.exists(&setpoint).await? {
            Ok(setpoint)
        } else {
            Ok(value_channel)
        }
    }
}

fn as_int_array(value: &serde_json::Value) -> Option<Vec<i64>> {
    let array = value.as_array()?;
    if array.is_empty() {
        return None;
    }
    array.iter().map(|v| v.as_i64()).collect()
}

#[async_trait]
impl BlockBackend for LiveBlocks {
    async fn names(&self) -> CtlResult<Vec<String>> {
        let payload = self.read_blob(ch::BS_BLOCKNAMES).await?;
        let names = payload
            .as_array()
            .ok_or_else(|| CtlError::BlobDecode("BLOCKNAMES payload is not a list".into()))?;
        names
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| CtlError::BlobDecode("block name is not a string".into()))
            })
            .collect()
    }

    async fn exists(&self, name: &str) -> CtlResult<bool> {
        Ok(self.canonical(name).await.is_ok())
    }

    async fn resolve(&self, name: &str, add_prefix: bool) -> CtlResult<String> {
        let canonical = self.canonical(name).await?;
        if add_prefix {
            Ok(self.ch.prefix().apply(&ch::block(&canonical)))
        } else {
            Ok(canonical)
        }
    }

    async fn get(&self, name: &str) -> CtlResult<PvValue> {
        let canonical = self.canonical(name).await?;
        self.ch.get(&ch::block(&canonical)).await
    }

    async fn set(&self, name: &str, value: PvValue, opts: &SetBlockOptions) -> CtlResult<()> {
        if opts.wait && opts.runcontrol.is_some() {
            return Err(CtlError::WaitWithRunControl);
        }

        // Swapped limits are auto-corrected, not an error.
        let (low, high) = match (opts.low, opts.high) {
            (Some(lo), Some(hi)) if lo > hi => (Some(hi), Some(lo)),
            other => other,
        };

        let target = self.write_target(name).await?;
        self.ch.set(&target, value.clone()).await?;

        if let Some(enabled) = opts.runcontrol {
            let canonical = self.canonical(name.split('.').next().unwrap_or(name)).await?;
            let value_channel = ch::block(&canonical);
            self.ch
                .set(&ch::block_rc_enable(&value_channel), enabled as i64)
                .await?;
            if let Some(lo) = low {
                self.ch.set(&ch::block_rc_low(&value_channel), lo).await?;
            }
            if let Some(hi) = high {
                self.ch.set(&ch::block_rc_high(&value_channel), hi).await?;
            }
        }

        if opts.wait {
            let canonical = self.canonical(name.split('.').next().unwrap_or(name)).await?;
            let value_channel = ch::block(&canonical);
            let (band_low, band_high) = match (low, high) {
                (None, None) => {
                    let v = value.as_f64().ok_or_else(|| CtlError::NotNumeric {
                        name: canonical.clone(),
                        value: value.to_string(),
                    })?;
                    (Some(v), Some(v))
                }
                other => other,
            };
            wait_for_band(&self.ch, &value_channel, band_low, band_high, None).await?;
        }
        Ok(())
    }

    async fn set_multiple(&self, pairs: &[(String, PvValue)]) -> CtlResult<()> {
        for (name, value) in pairs {
            self.set(name, value.clone(), &SetBlockOptions::default())
                .await?;
        }
        Ok(())
    }

    async fn runcontrol(&self, name: &str) -> CtlResult<RunControl> {
        let canonical = self.canonical(name).await?;
        let value_channel = ch::block(&canonical);
        let enabled = self
            .ch
            .get(&ch::block_rc_enable(&value_channel))
            .await
            .ok()
            .and_then(|v| v.as_i64())
            .map(|v| v != 0);
        let low = self
            .ch
            .get(&ch::block_rc_low(&value_channel))
            .await
            .ok()
            .and_then(|v| v.as_f64());
        let high = self
            .ch
            .get(&ch::block_rc_high(&value_channel))
            .await
            .ok()
            .and_then(|v| v.as_f64());
        Ok(RunControl { enabled, low, high })
    }

    async fn check_alarms(&self, names: &[String]) -> CtlResult<AlarmLists> {
        let mut lists = AlarmLists::default();
        for name in names {
            let canonical = match self.canonical(name).await {
                Ok(c) => c,
                Err(_) => {
                    println!("Block {} could not be checked for alarms", name);
                    continue;
                }
            };
            let severity_channel = ch::severity(&ch::block(&canonical));
            match self.ch.get_string(&severity_channel).await {
                Ok(severity) => match severity.trim() {
                    ch::SEVR_MINOR => lists.minor.push(canonical),
                    ch::SEVR_MAJOR => lists.major.push(canonical),
                    _ => {}
                },
                Err(_) => println!("Block {} could not be checked for alarms", canonical),
            }
        }
        Ok(lists)
    }

    async fn check_limit_violations(&self, names: &[String]) -> CtlResult<Vec<String>> {
        let mut violating = Vec::new();
        for name in names {
            let canonical = match self.canonical(name).await {
                Ok(c) => c,
                Err(_) => {
                    println!("Block {} could not be checked for limit violations", name);
                    continue;
                }
            };
            let lvio_channel = ch::limit_violation(&ch::block(&canonical));
            match self.ch.get(&lvio_channel).await {
                Ok(v) if v.as_i64().unwrap_or(0) != 0 => violating.push(canonical),
                Ok(_) => {}
                Err(_) => {
                    println!("Block {} could not be checked for limit violations", canonical)
                }
            }
        }
        Ok(violating)
    }

    async fn groups(&self) -> CtlResult<BTreeMap<String, Vec<String>>> {
        let payload = self.read_blob(ch::BS_GROUPS).await?;
        let groups = payload
            .get("groups")
            .and_then(|g| g.as_array())
            .ok_or_else(|| CtlError::BlobDecode("GROUPS payload has no group list".into()))?;
        let mut out = BTreeMap::new();
        for group in groups {
            let name = group
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("NONE")
                .to_string();
            let blocks = group
                .get("blocks")
                .and_then(|b| b.as_array())
                .map(|list| {
                    list.iter()
                        .filter_map(|b| b.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            out.insert(name, blocks);
        }
        Ok(out)
    }

    async fn iocs(&self) -> CtlResult<Vec<String>> {
        let payload = self.read_blob(ch::BS_IOCS).await?;
        let object = payload
            .as_object()
            .ok_or_else(|| CtlError::BlobDecode("IOCS payload is not an object".into()))?;
        Ok(object.keys().cloned().collect())
    }

    async fn sample_pars(&self) -> CtlResult<BTreeMap<String, serde_json::Value>> {
        self.read_pars(ch::BS_SAMPLE_PARS).await
    }

    async fn beamline_pars(&self) -> CtlResult<BTreeMap<String, serde_json::Value>> {
        self.read_pars(ch::BS_BEAMLINE_PARS).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::identity::PvPrefix;
    use crate::transport::MemoryTransport;
    use std::sync::Arc;

    fn blocks_over(transport: &MemoryTransport) -> LiveBlocks {
        let shared: Arc<dyn crate::transport::ChannelTransport> = Arc::new(transport.clone());
        LiveBlocks::new(Channels::new(
            shared,
            PvPrefix::none(),
            &Settings::default(),
        ))
    }

    #[tokio::test]
    async fn test_blockserver_write_accepts_ok_reply() {
        let transport = MemoryTransport::new();
        transport.insert("CS:BLOCKSERVER:ADD_BLOCKS", "").await;
        transport
            .auto_reply("CS:BLOCKSERVER:ADD_BLOCKS", compress_and_hex(b"OK"))
            .await;
        let blocks = blocks_over(&transport);
        blocks
            .write_blockserver("ADD_BLOCKS", &serde_json::json!(["NewBlock"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_blockserver_error_reply_surfaces() {
        let transport = MemoryTransport::new();
        transport.insert("CS:BLOCKSERVER:REMOVE_BLOCKS", "").await;
        transport
            .auto_reply(
                "CS:BLOCKSERVER:REMOVE_BLOCKS",
                compress_and_hex(b"no such block"),
            )
            .await;
        let blocks = blocks_over(&transport);
        match blocks
            .write_blockserver("REMOVE_BLOCKS", &serde_json::json!(["Ghost"]))
            .await
        {
            Err(CtlError::UnexpectedReply { reply, .. }) => {
                assert_eq!(reply, "no such block");
            }
            other => panic!("expected UnexpectedReply, got {:?}", other.err()),
        }
    }
}
