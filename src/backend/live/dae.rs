//! Live DAE run-state controller.
//!
//! Transition verbs write a trigger channel, check the trigger's alarm
//! severity afterwards (raising with the DAE's own error text on failure),
//! and wait for the transient state to clear. Reconfiguration goes through
//! the change-session cache and is flushed to the three settings documents
//! in one `change_finish`.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::Channels;
use crate::backend::{
    format_users, BeginOptions, DaeBackend, HardPeriodSetup, VetoSettings,
};
use crate::codec::{compress_and_hex, dehex_and_decompress_to_string};
use crate::dae::changecache::{parse_settings_xml, serialize_settings_xml};
use crate::dae::channels as ch;
use crate::dae::{
    ChangeCache, PeriodDefinition, PeriodMode, PeriodSource, RunState, Spectrum, SpectrumMode,
    SyncSource, TcbMode, TcbRow,
};
use crate::error::{CtlError, CtlResult};
use crate::transport::PvValue;

/// Poll period while waiting a transition out.
const TRANSITION_POLL: Duration = Duration::from_millis(300);

/// Bound on any single transition settling.
const TRANSITION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Default)]
struct ChangeSession {
    open: bool,
    cache: ChangeCache,
}

pub struct LiveDae {
    ch: Channels,
    session: Mutex<ChangeSession>,
}

impl LiveDae {
    pub(crate) fn new(ch: Channels) -> Self {
        Self {
            ch,
            session: Mutex::new(ChangeSession::default()),
        }
    }

    async fn state(&self) -> CtlResult<RunState> {
        let text = self.ch.get_string(ch::RUNSTATE).await?;
        text.parse().map_err(CtlError::Dae)
    }

    async fn transitioning(&self) -> CtlResult<bool> {
        let value = self.ch.get(ch::RUNSTATE_TRANS).await?;
        Ok(value.as_i64().unwrap_or(0) != 0)
    }

    /// Check the trigger channel's alarm severity; surface the DAE's error
    /// text when the transition was refused.
    async fn post_check(&self, trigger: &str, verb: &str, verbose: bool) -> CtlResult<()> {
        let severity = self.ch.get_string(&ch::severity(trigger)).await?;
        if severity.trim() != ch::SEVR_NONE {
            let message = self
                .ch
                .get_string(ch::ERROR_MESSAGE)
                .await
                .unwrap_or_else(|_| format!("{verb} refused ({severity})"));
            return Err(CtlError::Dae(message));
        }
        if verbose {
            if let Ok(messages) = self.ch.get_string(ch::ALL_MESSAGES).await {
                for line in messages.lines().filter(|l| !l.trim().is_empty()) {
                    println!("{}", line);
                }
            }
        }
        Ok(())
    }

    /// Wait until the run state has left `from` and the transient cleared.
    async fn wait_exit(&self, from: RunState) -> CtlResult<()> {
        let deadline = tokio::time::Instant::now() + TRANSITION_TIMEOUT;
        loop {
            let state = self.state().await?;
            if state != from && !self.transitioning().await? && !state.is_transitional() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CtlError::Timeout {
                    channel: ch::RUNSTATE.to_string(),
                    waited: TRANSITION_TIMEOUT,
                });
            }
            sleep(TRANSITION_POLL).await;
        }
    }

    /// Wait until the DAE is back in a stable state (for the transient
    /// verbs that return to where they started: update, store, snapshot).
    async fn wait_settle(&self) -> CtlResult<()> {
        let deadline = tokio::time::Instant::now() + TRANSITION_TIMEOUT;
        // Give the transient a moment to assert itself first.
        sleep(TRANSITION_POLL).await;
        loop {
            let state = self.state().await?;
            if !state.is_transitional() && !self.transitioning().await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CtlError::Timeout {
                    channel: ch::RUNSTATE.to_string(),
                    waited: TRANSITION_TIMEOUT,
                });
            }
            sleep(TRANSITION_POLL).await;
        }
    }

    /// Require one of the given states before a transition verb.
    async fn require(&self, verb: &str, allowed: &[RunState]) -> CtlResult<RunState> {
        let state = self.state().await?;
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(CtlError::WrongRunState {
                verb: verb.to_string(),
                state: state.to_string(),
            })
        }
    }

    /// Trigger-write + post-check + settle for the simple transitions.
    async fn transition(
        &self,
        verb: &str,
        trigger: &str,
        allowed: &[RunState],
        verbose: bool,
    ) -> CtlResult<()> {
        let from = self.require(verb, allowed).await?;
        self.ch.set(trigger, 1_i64).await?;
        self.post_check(trigger, verb, verbose).await?;
        self.wait_exit(from).await
    }

    /// Run a staging edit inside the open session, or inside a fresh
    /// single-edit session when none is open (auto-transaction).
    async fn stage<F>(&self, edit: F) -> CtlResult<()>
    where
        F: FnOnce(&mut ChangeCache) -> CtlResult<()> + Send,
    {
        let was_open = self.session.lock().await.open;
        if !was_open {
            self.change_start().await?;
        }
        let staged = {
            let mut session = self.session.lock().await;
            edit(&mut session.cache)
        };
        if let Err(e) = staged {
            if !was_open {
                let mut session = self.session.lock().await;
                session.open = false;
                session.cache = ChangeCache::new();
            }
            return Err(e);
        }
        if !was_open {
            self.change_finish(false).await?;
        }
        Ok(())
    }

    /// Read, mutate and write back one settings document.
    async fn flush_document(
        &self,
        read_channel: &str,
        write_channel: &str,
        apply: impl Fn(&ChangeCache, &mut xmltree::Element) -> CtlResult<bool>,
        cache: &ChangeCache,
    ) -> CtlResult<()> {
        let blob = self.ch.get_string(read_channel).await?;
        let text = dehex_and_decompress_to_string(&blob)?;
        let mut doc = parse_settings_xml(&text)?;
        if apply(cache, &mut doc)? {
            let serialized = serialize_settings_xml(&doc)?;
            self.ch
                .set(write_channel, compress_and_hex(serialized.as_bytes()))
                .await?;
        }
        Ok(())
    }

    async fn set_optional(&self, channel: &str, value: &Option<String>) -> CtlResult<()> {
        if let Some(v) = value {
            if self.ch.exists(channel).await? {
                self.ch.set(channel, v.as_str()).await?;
            } else {
                log::debug!("channel {} absent, skipping", channel);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DaeBackend for LiveDae {
    async fn run_state(&self) -> CtlResult<RunState> {
        self.state().await
    }

    async fn in_transition(&self) -> CtlResult<bool> {
        self.transitioning().await
    }

    // -- transitions ---------------------------------------------------------

    async fn begin(&self, opts: &BeginOptions) -> CtlResult<()> {
        self.require("begin", &[RunState::Setup]).await?;

        if let Some(period) = opts.period {
            self.set_period(period).await?;
        }
        self.set_optional(ch::MEASUREMENT_ID, &opts.meas_id).await?;
        self.set_optional(ch::MEASUREMENT_TYPE, &opts.meas_type).await?;
        self.set_optional(ch::MEASUREMENT_LABEL, &opts.meas_label).await?;
        self.set_optional(ch::MEASUREMENT_SUBID, &opts.meas_subid).await?;
        self.set_optional(ch::SAMPLE_ID, &opts.sample_id).await?;

        // paused is bit 0, delayed is bit 1
        let options = (opts.paused as i64) | ((opts.delayed as i64) << 1);
        self.ch.set(ch::BEGINRUN, options).await?;
        self.post_check(ch::BEGINRUN, "begin", opts.verbose).await?;
        self.wait_exit(RunState::Setup).await
    }

    async fn pause(&self, verbose: bool) -> CtlResult<()> {
        self.transition("pause", ch::PAUSERUN, &[RunState::Running], verbose)
            .await
    }

    async fn resume(&self, verbose: bool) -> CtlResult<()> {
        self.transition("resume", ch::RESUMERUN, &[RunState::Paused], verbose)
            .await
    }

    async fn end(&self, verbose: bool) -> CtlResult<()> {
        self.transition(
            "end",
            ch::ENDRUN,
            &[RunState::Running, RunState::Paused],
            verbose,
        )
        .await
    }

    async fn abort(&self, verbose: bool) -> CtlResult<()> {
        self.transition(
            "abort",
            ch::ABORTRUN,
            &[RunState::Running, RunState::Paused],
            verbose,
        )
        .await
    }

    async fn recover(&self, verbose: bool) -> CtlResult<()> {
        // Recovers the checkpointed run; must precede the next begin.
        self.transition("recover", ch::RECOVERRUN, &[RunState::Setup], verbose)
            .await
    }

    async fn update(&self, verbose: bool) -> CtlResult<()> {
        self.require("update", &[RunState::Running, RunState::Paused])
            .await?;
        self.ch.set(ch::UPDATERUN, 1_i64).await?;
        self.post_check(ch::UPDATERUN, "update", verbose).await?;
        self.wait_settle().await
    }

    async fn store(&self, verbose: bool) -> CtlResult<()> {
        self.require("store", &[RunState::Running, RunState::Paused])
            .await?;
        self.ch.set(ch::STORERUN, 1_i64).await?;
        self.post_check(ch::STORERUN, "store", verbose).await?;
        self.wait_settle().await
    }

    async fn update_store(&self, verbose: bool) -> CtlResult<()> {
        self.require("update_store", &[RunState::Running, RunState::Paused])
            .await?;
        self.ch.set(ch::SAVERUN, 1_i64).await?;
        self.post_check(ch::SAVERUN, "update_store", verbose).await?;
        self.wait_settle().await
    }

    async fn snapshot_crpt(&self, path: &str, verbose: bool) -> CtlResult<()> {
        self.ch.set(ch::SNAPSHOT, path).await?;
        self.post_check(ch::SNAPSHOT, "snapshot_crpt", verbose).await?;
        self.wait_settle().await
    }

    // -- readouts ------------------------------------------------------------

    async fn run_number(&self) -> CtlResult<String> {
        self.ch.get_string(ch::RUN_NUMBER).await
    }

    async fn period(&self) -> CtlResult<i64> {
        let v = self.ch.get(ch::PERIOD).await?;
        v.as_i64().ok_or_else(|| CtlError::NotNumeric {
            name: ch::PERIOD.into(),
            value: v.to_string(),
        })
    }

    async fn num_periods(&self) -> CtlResult<i64> {
        let v = self.ch.get(ch::NUM_PERIODS).await?;
        v.as_i64().ok_or_else(|| CtlError::NotNumeric {
            name: ch::NUM_PERIODS.into(),
            value: v.to_string(),
        })
    }

    async fn period_type(&self) -> CtlResult<String> {
        self.ch.get_string(ch::PERIOD_TYPE).await
    }

    async fn period_seq(&self) -> CtlResult<i64> {
        Ok(self.ch.get(ch::PERIOD_SEQ).await?.as_i64().unwrap_or(0))
    }

    async fn set_period(&self, period: i64) -> CtlResult<()> {
        let max = self.num_periods().await?;
        if !(1..=max).contains(&period) {
            return Err(CtlError::InvalidPeriod { period, max });
        }
        self.ch.set(ch::PERIOD_SP, period).await
    }

    async fn uamps(&self, period: bool) -> CtlResult<f64> {
        let channel = if period { ch::GOOD_UAH_PERIOD } else { ch::GOOD_UAH };
        Ok(self.ch.get(channel).await?.as_f64().unwrap_or(0.0))
    }

    async fn good_frames(&self, period: bool) -> CtlResult<i64> {
        let channel = if period {
            ch::GOOD_FRAMES_PERIOD
        } else {
            ch::GOOD_FRAMES
        };
        Ok(self.ch.get(channel).await?.as_i64().unwrap_or(0))
    }

    async fn raw_frames(&self, period: bool) -> CtlResult<i64> {
        let channel = if period {
            ch::RAW_FRAMES_PERIOD
        } else {
            ch::RAW_FRAMES
        };
        Ok(self.ch.get(channel).await?.as_i64().unwrap_or(0))
    }

    async fn num_spectra(&self) -> CtlResult<i64> {
        Ok(self.ch.get(ch::NUM_SPECTRA).await?.as_i64().unwrap_or(0))
    }

    async fn monitor_counts(&self) -> CtlResult<i64> {
        Ok(self.ch.get(ch::MONITOR_COUNTS).await?.as_i64().unwrap_or(0))
    }

    async fn title(&self) -> CtlResult<String> {
        self.ch.get_string(ch::TITLE).await
    }

    async fn set_title(&self, title: &str) -> CtlResult<()> {
        self.ch.set(ch::TITLE_SP, title).await
    }

    async fn rb_number(&self) -> CtlResult<String> {
        self.ch.get_string(ch::RB_NUMBER).await
    }

    async fn users(&self) -> CtlResult<String> {
        Ok(format_users(&self.ch.get_string(ch::USERS).await?))
    }

    async fn set_users(&self, users: &str) -> CtlResult<()> {
        self.ch.set(ch::USERS_SP, users).await
    }

    async fn start_time(&self) -> CtlResult<String> {
        self.ch.get_string(ch::START_TIME).await
    }

    async fn timing_source(&self) -> CtlResult<String> {
        self.ch.get_string(ch::TIMING_SOURCE).await
    }

    async fn mevents(&self) -> CtlResult<f64> {
        Ok(self.ch.get(ch::MEVENTS).await?.as_f64().unwrap_or(0.0))
    }

    async fn total_counts(&self) -> CtlResult<i64> {
        Ok(self.ch.get(ch::TOTAL_COUNTS).await?.as_i64().unwrap_or(0))
    }

    async fn count_rate(&self) -> CtlResult<f64> {
        Ok(self.ch.get(ch::COUNT_RATE).await?.as_f64().unwrap_or(0.0))
    }

    async fn event_mode_fraction(&self) -> CtlResult<f64> {
        Ok(self
            .ch
            .get(ch::EVENT_MODE_FRACTION)
            .await?
            .as_f64()
            .unwrap_or(0.0))
    }

    async fn beam_current(&self) -> CtlResult<f64> {
        Ok(self.ch.get(ch::BEAM_CURRENT).await?.as_f64().unwrap_or(0.0))
    }

    async fn total_uamps(&self) -> CtlResult<f64> {
        Ok(self.ch.get(ch::TOTAL_UAMPS).await?.as_f64().unwrap_or(0.0))
    }

    async fn memory_used(&self) -> CtlResult<f64> {
        Ok(self.ch.get(ch::MEMORY_USED).await?.as_f64().unwrap_or(0.0))
    }

    // -- change session ------------------------------------------------------

    async fn change_start(&self) -> CtlResult<()> {
        self.require("change_start", &[RunState::Setup]).await?;
        let mut session = self.session.lock().await;
        if session.open {
            println!("Change session already open; keeping staged changes");
            return Ok(());
        }
        session.open = true;
        Ok(())
    }

    async fn change_finish(&self, verbose: bool) -> CtlResult<()> {
        self.require("change_finish", &[RunState::Setup]).await?;
        let cache = {
            let mut session = self.session.lock().await;
            let cache = std::mem::take(&mut session.cache);
            session.open = false;
            cache
        };
        if cache.is_empty() {
            return Ok(());
        }
        self.flush_document(
            ch::DAE_SETTINGS,
            ch::DAE_SETTINGS_SP,
            ChangeCache::change_dae_settings,
            &cache,
        )
        .await?;
        self.flush_document(
            ch::TCB_SETTINGS,
            ch::TCB_SETTINGS_SP,
            ChangeCache::change_tcb_settings,
            &cache,
        )
        .await?;
        self.flush_document(
            ch::PERIOD_SETTINGS,
            ch::PERIOD_SETTINGS_SP,
            ChangeCache::change_period_settings,
            &cache,
        )
        .await?;
        if verbose {
            println!("DAE settings updated");
        }
        Ok(())
    }

    async fn change_tables(
        &self,
        wiring: Option<String>,
        detector: Option<String>,
        spectra: Option<String>,
    ) -> CtlResult<()> {
        self.stage(move |cache| {
            if wiring.is_some() {
                cache.wiring = wiring;
            }
            if detector.is_some() {
                cache.detector = detector;
            }
            if spectra.is_some() {
                cache.spectra = spectra;
            }
            Ok(())
        })
        .await
    }

    async fn change_monitor(&self, spectrum: i64, low: f64, high: f64) -> CtlResult<()> {
        self.stage(move |cache| {
            cache.set_monitor(spectrum, low, high);
            Ok(())
        })
        .await
    }

    async fn change_sync(&self, source: &str) -> CtlResult<()> {
        let sync = SyncSource::parse(source)?;
        self.stage(move |cache| {
            cache.dae_sync = Some(sync);
            Ok(())
        })
        .await
    }

    async fn change_tcb_file(&self, file: &str) -> CtlResult<()> {
        if !std::path::Path::new(file).exists() {
            return Err(CtlError::FileNotFound(file.into()));
        }
        let file = file.to_string();
        self.stage(move |cache| {
            cache.tcb_file = Some(file);
            Ok(())
        })
        .await
    }

    async fn change_tcb(
        &self,
        low: Option<f64>,
        high: Option<f64>,
        step: Option<f64>,
        trange: i64,
        log: bool,
        regime: i64,
    ) -> CtlResult<()> {
        let row = TcbRow {
            regime,
            trange,
            low,
            high,
            step,
            mode: Some(if log { TcbMode::Log } else { TcbMode::Linear }),
        };
        self.stage(move |cache| cache.add_tcb_row(row)).await
    }

    async fn change_vetos(&self, vetos: &VetoSettings) -> CtlResult<()> {
        // fifo is effective immediately, even while running; everything
        // else is staged.
        if let Some(fifo) = vetos.fifo {
            let trigger = if fifo {
                ch::VETO_FIFO_ENABLE
            } else {
                ch::VETO_FIFO_DISABLE
            };
            self.ch.set(trigger, 1_i64).await?;
            if !fifo && self.state().await? == RunState::Setup {
                println!("FIFO veto disabled; the next begin will re-enable it");
            }
        }

        let staged = vetos.clearall
            || vetos.smp.is_some()
            || vetos.ts2.is_some()
            || vetos.hz50.is_some()
            || vetos.ext0.is_some()
            || vetos.ext1.is_some()
            || vetos.ext2.is_some()
            || vetos.ext3.is_some();
        if !staged {
            return Ok(());
        }

        let vetos = vetos.clone();
        self.stage(move |cache| {
            if vetos.clearall {
                cache.clear_vetos();
            }
            if let Some(v) = vetos.smp {
                cache.smp_veto = Some(v as i64);
            }
            if let Some(v) = vetos.ts2 {
                cache.ts2_veto = Some(v as i64);
            }
            if let Some(v) = vetos.hz50 {
                cache.hz50_veto = Some(v as i64);
            }
            if let Some(v) = vetos.ext0 {
                cache.ext0_veto = Some(v as i64);
            }
            if let Some(v) = vetos.ext1 {
                cache.ext1_veto = Some(v as i64);
            }
            if let Some(v) = vetos.ext2 {
                cache.ext2_veto = Some(v as i64);
            }
            if let Some(v) = vetos.ext3 {
                cache.ext3_veto = Some(v as i64);
            }
            Ok(())
        })
        .await
    }

    async fn set_fermi_veto(&self, enable: bool, delay: f64, width: f64) -> CtlResult<()> {
        self.stage(move |cache| {
            cache.set_fermi(enable, delay, width);
            Ok(())
        })
        .await
    }

    async fn set_num_soft_periods(&self, count: i64) -> CtlResult<()> {
        self.stage(move |cache| {
            cache.soft_periods = Some(count);
            Ok(())
        })
        .await
    }

    async fn set_period_mode(&self, mode: &str) -> CtlResult<()> {
        let mode = PeriodMode::parse(mode)?;
        self.stage(move |cache| {
            cache.period_mode = Some(mode);
            Ok(())
        })
        .await
    }

    async fn configure_hard_periods(&self, mode: &str, setup: &HardPeriodSetup) -> CtlResult<()> {
        let mode = PeriodMode::parse(mode)?;
        if mode == PeriodMode::Soft {
            return Err(CtlError::InvalidLabel {
                name: "hardware period mode (int/ext)".into(),
                value: "soft".into(),
            });
        }
        let setup = setup.clone();
        self.stage(move |cache| {
            cache.period_mode = Some(mode);
            match &setup.from_file {
                Some(file) => {
                    cache.period_src = Some(PeriodSource::File);
                    cache.period_file = Some(file.clone());
                }
                None => cache.period_src = Some(PeriodSource::Parameters),
            }
            if setup.sequences.is_some() {
                cache.period_seq = setup.sequences;
            }
            if setup.output_delay.is_some() {
                cache.period_delay = setup.output_delay;
            }
            if let Some(def) = setup.definition {
                cache.define_period(setup.period, def)?;
            }
            Ok(())
        })
        .await
    }

    async fn configure_internal_periods(&self, setup: &HardPeriodSetup) -> CtlResult<()> {
        self.configure_hard_periods("int", setup).await
    }

    async fn define_hard_period(
        &self,
        period: Option<i64>,
        definition: PeriodDefinition,
    ) -> CtlResult<()> {
        self.stage(move |cache| cache.define_period(period, definition))
            .await
    }

    // -- spectra -------------------------------------------------------------

    async fn get_spectrum(&self, spectrum: i64, period: i64, dist: bool) -> CtlResult<Spectrum> {
        let _ = dist; // only distribution mode is served
        let x_channel = ch::spectrum_x(period, spectrum);
        let y_channel = ch::spectrum_y(period, spectrum);

        let time = read_truncated(&self.ch, &x_channel).await?;
        let signal = read_truncated(&self.ch, &y_channel).await?;

        Ok(Spectrum {
            time,
            signal,
            sum: None,
            mode: SpectrumMode::Distribution,
        })
    }
}

/// Read an array channel truncated to its companion `.NORD` length.
async fn read_truncated(channels: &Channels, channel: &str) -> CtlResult<Vec<f64>> {
    let raw = channels.get(channel).await?;
    let mut values = match raw {
        PvValue::FloatArray(v) => v,
        PvValue::IntArray(v) => v.into_iter().map(|i| i as f64).collect(),
        other => {
            return Err(CtlError::NotNumeric {
                name: channel.to_string(),
                value: other.to_string(),
            })
        }
    };
    let filled = channels
        .get(&ch::nord(channel))
        .await?
        .as_i64()
        .unwrap_or(values.len() as i64) as usize;
    values.truncate(filled);
    Ok(values)
}
