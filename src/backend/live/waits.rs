//! Live wait engine.
//!
//! All waits are polling loops punctuated by short sleeps, keeping the
//! single-threaded cooperative model: a keyboard interrupt lands between
//! polls. Timeouts are printed notes, not errors; a wait that gives up
//! returns normally so the enclosing script can carry on.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use super::{Channels, LiveBlocks};
use crate::backend::{AlarmLists, BlockBackend, WaitBackend, WaitSpec};
use crate::dae::channels as ch;
use crate::dae::RunState;
use crate::error::{CtlError, CtlResult};

/// Poll period for composable waits.
const WAIT_POLL: Duration = Duration::from_millis(500);

/// Poll period for run-state waits.
const RUNSTATE_POLL: Duration = Duration::from_millis(300);

/// Poll period for motion waits.
const MOVE_POLL: Duration = Duration::from_millis(100);

/// Settling delay before the first motion poll, against the race where a
/// freshly commanded motor has not yet raised its moving flag.
const MOVE_PRE_DELAY: Duration = Duration::from_millis(10);

pub struct LiveWaits {
    ch: Channels,
    blocks: Arc<LiveBlocks>,
}

impl LiveWaits {
    pub(crate) fn new(ch: Channels, blocks: Arc<LiveBlocks>) -> Self {
        Self { ch, blocks }
    }
}

/// Block until a channel's value sits inside [low, high] (either side
/// optional), or `maxwait` expires with a printed note.
pub(crate) async fn wait_for_band(
    channels: &Channels,
    channel: &str,
    low: Option<f64>,
    high: Option<f64>,
    maxwait: Option<Duration>,
) -> CtlResult<()> {
    let deadline = maxwait.map(|m| Instant::now() + m);
    loop {
        if band_met(channels, channel, low, high).await? {
            return Ok(());
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                println!("Wait for {} timed out", channel);
                return Ok(());
            }
        }
        sleep(WAIT_POLL).await;
    }
}

async fn band_met(
    channels: &Channels,
    channel: &str,
    low: Option<f64>,
    high: Option<f64>,
) -> CtlResult<bool> {
    let value = channels.get(channel).await?;
    let current = match value.as_f64() {
        Some(v) => v,
        None => return Ok(false),
    };
    Ok(low.map_or(true, |l| current >= l) && high.map_or(true, |h| current <= h))
}

/// Parse "HH:MM:SS" into seconds.
fn parse_clock(text: &str) -> CtlResult<f64> {
    let parts: Vec<&str> = text.split(':').collect();
    let [h, m, s] = parts.as_slice() else {
        return Err(CtlError::NotNumeric {
            name: "time (HH:MM:SS)".into(),
            value: text.into(),
        });
    };
    let parse = |p: &str| -> CtlResult<f64> {
        p.trim().parse().map_err(|_| CtlError::NotNumeric {
            name: "time (HH:MM:SS)".into(),
            value: text.into(),
        })
    };
    Ok(parse(h)? * 3600.0 + parse(m)? * 60.0 + parse(s)?)
}

/// The armed clauses of one wait, normalised and validated.
struct ArmedClauses {
    band: Option<(String, Option<f64>, Option<f64>)>,
    duration: Option<Duration>,
    frames: Option<i64>,
    uamps: Option<f64>,
}

impl ArmedClauses {
    fn none_armed(&self) -> bool {
        self.band.is_none()
            && self.duration.is_none()
            && self.frames.is_none()
            && self.uamps.is_none()
    }
}

impl LiveWaits {
    async fn arm(&self, spec: &WaitSpec) -> CtlResult<ArmedClauses> {
        let band = match &spec.block {
            Some(block) => {
                let canonical = self.blocks.canonical(block).await?;
                let (mut low, mut high) = match (spec.value, spec.low, spec.high) {
                    (Some(v), None, None) => (Some(v), Some(v)),
                    (None, None, None) => return Err(CtlError::BandWithoutLimits),
                    (_, lo, hi) => (lo, hi),
                };
                if let (Some(l), Some(h)) = (low, high) {
                    if l > h {
                        (low, high) = (Some(h), Some(l));
                    }
                }
                Some((ch::block(&canonical), low, high))
            }
            None => None,
        };

        let seconds = match &spec.time {
            Some(clock) => Some(parse_clock(clock)?),
            None => {
                let total = spec.seconds.unwrap_or(0.0)
                    + spec.minutes.unwrap_or(0.0) * 60.0
                    + spec.hours.unwrap_or(0.0) * 3600.0;
                (spec.seconds.is_some() || spec.minutes.is_some() || spec.hours.is_some())
                    .then_some(total)
            }
        };

        Ok(ArmedClauses {
            band,
            duration: seconds.map(Duration::from_secs_f64),
            frames: spec.frames,
            uamps: spec.uamps,
        })
    }

    async fn clause_states(&self, armed: &ArmedClauses, started: Instant) -> CtlResult<Vec<bool>> {
        let mut met = Vec::new();
        if let Some((channel, low, high)) = &armed.band {
            met.push(band_met(&self.ch, channel, *low, *high).await?);
        }
        if let Some(duration) = armed.duration {
            met.push(started.elapsed() >= duration);
        }
        if let Some(frames) = armed.frames {
            let current = self.ch.get(ch::GOOD_FRAMES).await?.as_i64().unwrap_or(0);
            met.push(current >= frames);
        }
        if let Some(uamps) = armed.uamps {
            let current = self.ch.get(ch::GOOD_UAH).await?.as_f64().unwrap_or(0.0);
            met.push(current >= uamps);
        }
        Ok(met)
    }
}

#[async_trait]
impl WaitBackend for LiveWaits {
    async fn start_waiting(&self, spec: &WaitSpec) -> CtlResult<()> {
        let armed = self.arm(spec).await?;
        if armed.none_armed() {
            return Err(CtlError::NothingToWaitFor);
        }

        let started = Instant::now();
        let deadline = spec.maxwait.map(|m| started + m);
        loop {
            let met = self.clause_states(&armed, started).await?;
            let satisfied = if spec.wait_all {
                met.iter().all(|m| *m)
            } else {
                met.iter().any(|m| *m)
            };
            if satisfied {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    println!(
                        "waitfor timed out after {:.1} s",
                        spec.maxwait.unwrap_or_default().as_secs_f64()
                    );
                    return Ok(());
                }
            }
            sleep(WAIT_POLL).await;
        }
    }

    async fn wait_for_runstate(
        &self,
        state: RunState,
        maxwait: Duration,
        onexit: bool,
    ) -> CtlResult<()> {
        let deadline = Instant::now() + maxwait;
        loop {
            let current: RunState = self
                .ch
                .get_string(ch::RUNSTATE)
                .await?
                .parse()
                .map_err(CtlError::Dae)?;
            if onexit {
                let transitioning =
                    self.ch.get(ch::RUNSTATE_TRANS).await?.as_i64().unwrap_or(0) != 0;
                if current != state && !transitioning {
                    return Ok(());
                }
            } else if current == state {
                return Ok(());
            }
            if Instant::now() >= deadline {
                println!(
                    "waitfor_runstate({}) timed out after {:.0} s",
                    state,
                    maxwait.as_secs_f64()
                );
                return Ok(());
            }
            sleep(RUNSTATE_POLL).await;
        }
    }

    async fn wait_for_move(
        &self,
        blocks: Option<&[String]>,
        start_timeout: Duration,
        move_timeout: Option<Duration>,
    ) -> CtlResult<AlarmLists> {
        sleep(MOVE_PRE_DELAY).await;

        match blocks {
            None => {
                self.wait_global_move(start_timeout, move_timeout).await?;
                Ok(AlarmLists::default())
            }
            Some(names) => {
                // Missing blocks are recorded and skipped, not fatal.
                let mut watched = Vec::new();
                for name in names {
                    match self.blocks.canonical(name).await {
                        Ok(canonical) => watched.push(canonical),
                        Err(_) => println!("Block {} not found, not waiting for it", name),
                    }
                }
                self.wait_block_moves(&watched, start_timeout, move_timeout)
                    .await?;
                self.blocks.check_alarms(&watched).await
            }
        }
    }
}

impl LiveWaits {
    async fn moving_count(&self) -> CtlResult<i64> {
        Ok(self.ch.get(ch::MOTION_MOVING).await?.as_i64().unwrap_or(0))
    }

    /// DMOV is 0 while an axis moves; unreadable fields count as idle.
    async fn any_block_moving(&self, dmov_channels: &[String]) -> bool {
        for channel in dmov_channels {
            if let Ok(v) = self.ch.get(channel).await {
                if v.as_i64().unwrap_or(1) == 0 {
                    return true;
                }
            }
        }
        false
    }

    async fn wait_global_move(
        &self,
        start_timeout: Duration,
        move_timeout: Option<Duration>,
    ) -> CtlResult<()> {
        let start_deadline = Instant::now() + start_timeout;
        while self.moving_count().await? == 0 {
            if Instant::now() >= start_deadline {
                return Ok(());
            }
            sleep(MOVE_POLL).await;
        }

        let deadline = move_timeout.map(|m| Instant::now() + m);
        while self.moving_count().await? > 0 {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    println!("Motion still in progress after move timeout");
                    return Ok(());
                }
            }
            sleep(MOVE_POLL).await;
        }
        Ok(())
    }

    async fn wait_block_moves(
        &self,
        watched: &[String],
        start_timeout: Duration,
        move_timeout: Option<Duration>,
    ) -> CtlResult<()> {
        if watched.is_empty() {
            return Ok(());
        }
        let dmov_channels: Vec<String> = watched
            .iter()
            .map(|name| ch::done_moving(&ch::block(name)))
            .collect();

        let start_deadline = Instant::now() + start_timeout;
        while !self.any_block_moving(&dmov_channels).await {
            if Instant::now() >= start_deadline {
                return Ok(());
            }
            sleep(MOVE_POLL).await;
        }

        let deadline = move_timeout.map(|m| Instant::now() + m);
        while self.any_block_moving(&dmov_channels).await {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    println!("Motion still in progress after move timeout");
                    return Ok(());
                }
            }
            sleep(MOVE_POLL).await;
        }
        Ok(())
    }
}
