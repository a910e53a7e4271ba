//! Live backend: the three backend traits implemented over a channel-access
//! transport.

mod blocks;
mod dae;
mod waits;

pub use blocks::LiveBlocks;
pub use dae::LiveDae;
pub use waits::LiveWaits;

use std::sync::Arc;
use std::time::Duration;

use super::Backend;
use crate::config::Settings;
use crate::error::CtlResult;
use crate::identity::PvPrefix;
use crate::transport::{ChannelTransport, PvValue};

/// Transport handle shared by the live components: applies the instrument
/// prefix and the configured timeouts to every call.
#[derive(Clone)]
pub(crate) struct Channels {
    transport: Arc<dyn ChannelTransport>,
    prefix: PvPrefix,
    io_timeout: Duration,
    connect_timeout: Duration,
}

impl Channels {
    pub(crate) fn new(
        transport: Arc<dyn ChannelTransport>,
        prefix: PvPrefix,
        settings: &Settings,
    ) -> Self {
        Self {
            transport,
            prefix,
            io_timeout: settings.io_timeout(),
            connect_timeout: settings.connect_timeout(),
        }
    }

    pub(crate) fn prefix(&self) -> &PvPrefix {
        &self.prefix
    }

    pub(crate) async fn get(&self, relative: &str) -> CtlResult<PvValue> {
        self.transport
            .get(&self.prefix.apply(relative), self.io_timeout)
            .await
    }

    pub(crate) async fn get_string(&self, relative: &str) -> CtlResult<String> {
        self.transport
            .get_as_string(&self.prefix.apply(relative), self.io_timeout)
            .await
    }

    pub(crate) async fn set(&self, relative: &str, value: impl Into<PvValue>) -> CtlResult<()> {
        self.transport
            .set(&self.prefix.apply(relative), value.into(), true, self.io_timeout)
            .await
    }

    pub(crate) async fn exists(&self, relative: &str) -> CtlResult<bool> {
        self.transport
            .exists(&self.prefix.apply(relative), self.connect_timeout)
            .await
    }
}

/// Wire a complete live [`Backend`] over one transport.
pub fn live_backend(
    transport: Arc<dyn ChannelTransport>,
    prefix: PvPrefix,
    settings: &Settings,
) -> Backend {
    let ch = Channels::new(transport, prefix, settings);
    let blocks = Arc::new(LiveBlocks::new(ch.clone()));
    Backend {
        dae: Arc::new(LiveDae::new(ch.clone())),
        waits: Arc::new(LiveWaits::new(ch, blocks.clone())),
        blocks,
    }
}
