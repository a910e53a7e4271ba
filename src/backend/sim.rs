//! Simulation backend.
//!
//! A second implementation of the backend contract against in-memory state,
//! so user scripts run offline with the full verb surface. The DAE state
//! machine honours the same transition rules as the live controller;
//! counters accumulate in wall-clock time while the run is RUNNING, which
//! keeps frame/current waits meaningful.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use super::{
    AlarmLists, Backend, BeginOptions, BlockBackend, DaeBackend, HardPeriodSetup, RunControl,
    SetBlockOptions, VetoSettings, WaitBackend, WaitSpec,
};
use crate::backend::format_users;
use crate::dae::{
    ChangeCache, PeriodDefinition, PeriodMode, RunState, Spectrum, SpectrumMode, SyncSource,
    TcbMode, TcbRow,
};
use crate::error::{CtlError, CtlResult};
use crate::transport::PvValue;

/// Simulation polls faster than the live engine; nothing real is waiting.
const SIM_POLL: Duration = Duration::from_millis(50);

/// Good frames accumulated per second while RUNNING.
const FRAME_RATE: f64 = 100.0;

/// Micro-amp-hours accumulated per second while RUNNING.
const UAMP_RATE: f64 = 0.05;

#[derive(Clone, Debug)]
struct SimBlock {
    value: PvValue,
    runcontrol: RunControl,
    alarm: &'static str,
}

struct SimState {
    state: RunState,
    run_number: u64,
    period: i64,
    num_periods: i64,
    title: String,
    rb_number: String,
    users: String,
    start_time: String,
    frames: f64,
    raw_frames: f64,
    uamps: f64,
    period_frames: f64,
    period_uamps: f64,
    last_tick: Instant,
    monitor_spectrum: i64,
    sync: SyncSource,
    blocks: BTreeMap<String, SimBlock>,
    session_open: bool,
    cache: ChangeCache,
}

impl SimState {
    fn new() -> Self {
        Self {
            state: RunState::Setup,
            run_number: 1_000_000,
            period: 1,
            num_periods: 1,
            title: String::new(),
            rb_number: "0".into(),
            users: String::new(),
            start_time: String::new(),
            frames: 0.0,
            raw_frames: 0.0,
            uamps: 0.0,
            period_frames: 0.0,
            period_uamps: 0.0,
            last_tick: Instant::now(),
            monitor_spectrum: 1,
            sync: SyncSource::Isis,
            blocks: BTreeMap::new(),
            session_open: false,
            cache: ChangeCache::new(),
        }
    }

    /// Advance the counters by the wall-clock time since the last tick.
    fn tick(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;
        if self.state == RunState::Running {
            self.frames += dt * FRAME_RATE;
            self.raw_frames += dt * FRAME_RATE * 1.1;
            self.uamps += dt * UAMP_RATE;
            self.period_frames += dt * FRAME_RATE;
            self.period_uamps += dt * UAMP_RATE;
        }
    }

    fn require(&self, verb: &str, allowed: &[RunState]) -> CtlResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(CtlError::WrongRunState {
                verb: verb.to_string(),
                state: self.state.to_string(),
            })
        }
    }

    fn canonical(&self, name: &str) -> CtlResult<String> {
        let trimmed = name.trim();
        let base = trimmed.split('.').next().unwrap_or(trimmed);
        self.blocks
            .keys()
            .find(|k| k.eq_ignore_ascii_case(base))
            .cloned()
            .ok_or_else(|| CtlError::UnknownBlock(base.to_string()))
    }
}

/// Handle to the shared simulation. Cloning shares the state; the same
/// object serves all three backend traits.
#[derive(Clone)]
pub struct SimBackend {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    /// Bundle this simulation as a [`Backend`].
    pub fn backend(&self) -> Backend {
        Backend {
            dae: Arc::new(self.clone()),
            blocks: Arc::new(self.clone()),
            waits: Arc::new(self.clone()),
        }
    }

    /// Seed a block (test and demo setup).
    pub async fn add_block(&self, name: &str, value: impl Into<PvValue>) {
        self.state.lock().await.blocks.insert(
            name.to_string(),
            SimBlock {
                value: value.into(),
                runcontrol: RunControl::default(),
                alarm: "NO_ALARM",
            },
        );
    }

    /// Put a seeded block into alarm (test setup).
    pub async fn set_block_alarm(&self, name: &str, severity: &'static str) {
        if let Some(block) = self.state.lock().await.blocks.get_mut(name) {
            block.alarm = severity;
        }
    }

    async fn stage<F>(&self, edit: F) -> CtlResult<()>
    where
        F: FnOnce(&mut ChangeCache) -> CtlResult<()> + Send,
    {
        let mut state = self.state.lock().await;
        let was_open = state.session_open;
        if !was_open {
            state.require("change_start", &[RunState::Setup])?;
        }
        edit(&mut state.cache)?;
        if !was_open {
            apply_cache(&mut state);
        }
        Ok(())
    }
}

/// Flush the staged cache onto the simulated settings.
fn apply_cache(state: &mut SimState) {
    let cache = std::mem::take(&mut state.cache);
    state.session_open = false;
    if let Some(spectrum) = cache.mon_spect {
        state.monitor_spectrum = spectrum;
    }
    if let Some(sync) = cache.dae_sync {
        state.sync = sync;
    }
    if let Some(soft) = cache.soft_periods {
        state.num_periods = soft;
    }
}

#[async_trait]
impl DaeBackend for SimBackend {
    async fn run_state(&self) -> CtlResult<RunState> {
        Ok(self.state.lock().await.state)
    }

    async fn in_transition(&self) -> CtlResult<bool> {
        // Simulated transitions are instantaneous.
        Ok(false)
    }

    async fn begin(&self, opts: &BeginOptions) -> CtlResult<()> {
        let mut state = self.state.lock().await;
        state.require("begin", &[RunState::Setup])?;
        if let Some(period) = opts.period {
            if !(1..=state.num_periods).contains(&period) {
                return Err(CtlError::InvalidPeriod {
                    period,
                    max: state.num_periods,
                });
            }
            state.period = period;
        }
        state.tick();
        state.frames = 0.0;
        state.raw_frames = 0.0;
        state.uamps = 0.0;
        state.period_frames = 0.0;
        state.period_uamps = 0.0;
        state.run_number += 1;
        state.start_time = Utc::now().to_rfc3339();
        state.state = if opts.paused {
            RunState::Paused
        } else {
            RunState::Running
        };
        Ok(())
    }

    async fn pause(&self, _verbose: bool) -> CtlResult<()> {
        let mut state = self.state.lock().await;
        state.require("pause", &[RunState::Running])?;
        state.tick();
        state.state = RunState::Paused;
        Ok(())
    }

    async fn resume(&self, _verbose: bool) -> CtlResult<()> {
        let mut state = self.state.lock().await;
        state.require("resume", &[RunState::Paused])?;
        state.tick();
        state.state = RunState::Running;
        Ok(())
    }

    async fn end(&self, _verbose: bool) -> CtlResult<()> {
        let mut state = self.state.lock().await;
        state.require("end", &[RunState::Running, RunState::Paused])?;
        state.tick();
        state.state = RunState::Setup;
        Ok(())
    }

    async fn abort(&self, _verbose: bool) -> CtlResult<()> {
        let mut state = self.state.lock().await;
        state.require("abort", &[RunState::Running, RunState::Paused])?;
        state.tick();
        state.state = RunState::Setup;
        Ok(())
    }

    async fn recover(&self, _verbose: bool) -> CtlResult<()> {
        let mut state = self.state.lock().await;
        state.require("recover", &[RunState::Setup])?;
        state.state = RunState::Paused;
        Ok(())
    }

    async fn update(&self, _verbose: bool) -> CtlResult<()> {
        self.state
            .lock()
            .await
            .require("update", &[RunState::Running, RunState::Paused])
    }

    async fn store(&self, _verbose: bool) -> CtlResult<()> {
        self.state
            .lock()
            .await
            .require("store", &[RunState::Running, RunState::Paused])
    }

    async fn update_store(&self, _verbose: bool) -> CtlResult<()> {
        self.state
            .lock()
            .await
            .require("update_store", &[RunState::Running, RunState::Paused])
    }

    async fn snapshot_crpt(&self, path: &str, _verbose: bool) -> CtlResult<()> {
        log::info!("simulated CRPT snapshot to {}", path);
        Ok(())
    }

    async fn run_number(&self) -> CtlResult<String> {
        Ok(self.state.lock().await.run_number.to_string())
    }

    async fn period(&self) -> CtlResult<i64> {
        Ok(self.state.lock().await.period)
    }

    async fn num_periods(&self) -> CtlResult<i64> {
        Ok(self.state.lock().await.num_periods)
    }

    async fn period_type(&self) -> CtlResult<String> {
        Ok("SOFTWARE".to_string())
    }

    async fn period_seq(&self) -> CtlResult<i64> {
        Ok(1)
    }

    async fn set_period(&self, period: i64) -> CtlResult<()> {
        let mut state = self.state.lock().await;
        if !(1..=state.num_periods).contains(&period) {
            return Err(CtlError::InvalidPeriod {
                period,
                max: state.num_periods,
            });
        }
        state.period = period;
        Ok(())
    }

    async fn uamps(&self, period: bool) -> CtlResult<f64> {
        let mut state = self.state.lock().await;
        state.tick();
        Ok(if period { state.period_uamps } else { state.uamps })
    }

    async fn good_frames(&self, period: bool) -> CtlResult<i64> {
        let mut state = self.state.lock().await;
        state.tick();
        Ok(if period {
            state.period_frames as i64
        } else {
            state.frames as i64
        })
    }

    async fn raw_frames(&self, _period: bool) -> CtlResult<i64> {
        let mut state = self.state.lock().await;
        state.tick();
        Ok(state.raw_frames as i64)
    }

    async fn num_spectra(&self) -> CtlResult<i64> {
        Ok(8)
    }

    async fn monitor_counts(&self) -> CtlResult<i64> {
        let mut state = self.state.lock().await;
        state.tick();
        Ok((state.frames * 10.0) as i64)
    }

    async fn title(&self) -> CtlResult<String> {
        Ok(self.state.lock().await.title.clone())
    }

    async fn set_title(&self, title: &str) -> CtlResult<()> {
        self.state.lock().await.title = title.to_string();
        Ok(())
    }

    async fn rb_number(&self) -> CtlResult<String> {
        Ok(self.state.lock().await.rb_number.clone())
    }

    async fn users(&self) -> CtlResult<String> {
        Ok(format_users(&self.state.lock().await.users))
    }

    async fn set_users(&self, users: &str) -> CtlResult<()> {
        self.state.lock().await.users = users.to_string();
        Ok(())
    }

    async fn start_time(&self) -> CtlResult<String> {
        Ok(self.state.lock().await.start_time.clone())
    }

    async fn timing_source(&self) -> CtlResult<String> {
        Ok(self.state.lock().await.sync.label().to_string())
    }

    async fn mevents(&self) -> CtlResult<f64> {
        let mut state = self.state.lock().await;
        state.tick();
        Ok(state.frames * 0.001)
    }

    async fn total_counts(&self) -> CtlResult<i64> {
        let mut state = self.state.lock().await;
        state.tick();
        Ok((state.frames * 100.0) as i64)
    }

    async fn count_rate(&self) -> CtlResult<f64> {
        Ok(if self.state.lock().await.state == RunState::Running {
            FRAME_RATE * 100.0
        } else {
            0.0
        })
    }

    async fn event_mode_fraction(&self) -> CtlResult<f64> {
        Ok(1.0)
    }

    async fn beam_current(&self) -> CtlResult<f64> {
        Ok(UAMP_RATE * 3600.0)
    }

    async fn total_uamps(&self) -> CtlResult<f64> {
        self.uamps(false).await
    }

    async fn memory_used(&self) -> CtlResult<f64> {
        Ok(0.0)
    }

    async fn change_start(&self) -> CtlResult<()> {
        let mut state = self.state.lock().await;
        state.require("change_start", &[RunState::Setup])?;
        if state.session_open {
            println!("Change session already open; keeping staged changes");
            return Ok(());
        }
        state.session_open = true;
        Ok(())
    }

    async fn change_finish(&self, _verbose: bool) -> CtlResult<()> {
        let mut state = self.state.lock().await;
        state.require("change_finish", &[RunState::Setup])?;
        apply_cache(&mut state);
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
        if let Some(fifo) = vetos.fifo {
            let state = self.state.lock().await;
            if !fifo && state.state == RunState::Setup {
                println!("FIFO veto disabled; the next begin will re-enable it");
            }
        }
        let vetos = vetos.clone();
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

    async fn get_spectrum(&self, spectrum: i64, _period: i64, _dist: bool) -> CtlResult<Spectrum> {
        // Synthetic time-of-flight histogram with a little noise.
        let mut rng = rand::thread_rng();
        let bins = 100;
        let mut time = Vec::with_capacity(bins);
        let mut signal = Vec::with_capacity(bins);
        for i in 0..bins {
            let t = 100.0 + i as f64 * 190.0;
            let peak = (-((t - 10_000.0) / 3_000.0).powi(2)).exp();
            let noise: f64 = rng.gen_range(0.0..0.05);
            time.push(t);
            signal.push(peak * (spectrum as f64).max(1.0) + noise);
        }
        Ok(Spectrum {
            time,
            signal,
            sum: None,
            mode: SpectrumMode::Distribution,
        })
    }
}

#[async_trait]
impl BlockBackend for SimBackend {
    async fn names(&self) -> CtlResult<Vec<String>> {
        Ok(self.state.lock().await.blocks.keys().cloned().collect())
    }

    async fn exists(&self, name: &str) -> CtlResult<bool> {
        Ok(self.state.lock().await.canonical(name).is_ok())
    }

    async fn resolve(&self, name: &str, add_prefix: bool) -> CtlResult<String> {
        let canonical = self.state.lock().await.canonical(name)?;
        if add_prefix {
            Ok(format!("CS:SB:{}", canonical))
        } else {
            Ok(canonical)
        }
    }

    async fn get(&self, name: &str) -> CtlResult<PvValue> {
        let state = self.state.lock().await;
        let canonical = state.canonical(name)?;
        Ok(state.blocks[&canonical].value.clone())
    }

    async fn set(&self, name: &str, value: PvValue, opts: &SetBlockOptions) -> CtlResult<()> {
        if opts.wait && opts.runcontrol.is_some() {
            return Err(CtlError::WaitWithRunControl);
        }
        let (low, high) = match (opts.low, opts.high) {
            (Some(lo), Some(hi)) if lo > hi => (Some(hi), Some(lo)),
            other => other,
        };
        let mut state = self.state.lock().await;
        let canonical = state.canonical(name)?;
        let block = state
            .blocks
            .get_mut(&canonical)
            .ok_or_else(|| CtlError::UnknownBlock(canonical.clone()))?;
        block.value = value;
        if let Some(enabled) = opts.runcontrol {
            block.runcontrol.enabled = Some(enabled);
            if low.is_some() {
                block.runcontrol.low = low;
            }
            if high.is_some() {
                block.runcontrol.high = high;
            }
        }
        // The simulated write is immediate, so a wait is already satisfied.
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
        let state = self.state.lock().await;
        let canonical = state.canonical(name)?;
        Ok(state.blocks[&canonical].runcontrol.clone())
    }

    async fn check_alarms(&self, names: &[String]) -> CtlResult<AlarmLists> {
        let state = self.state.lock().await;
        let mut lists = AlarmLists::default();
        for name in names {
            match state.canonical(name) {
                Ok(canonical) => match state.blocks[&canonical].alarm {
                    "MINOR" => lists.minor.push(canonical),
                    "MAJOR" => lists.major.push(canonical),
                    _ => {}
                },
                Err(_) => println!("Block {} could not be checked for alarms", name),
            }
        }
        Ok(lists)
    }

    async fn check_limit_violations(&self, _names: &[String]) -> CtlResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn groups(&self) -> CtlResult<BTreeMap<String, Vec<String>>> {
        let mut out = BTreeMap::new();
        out.insert("NONE".to_string(), self.names().await?);
        Ok(out)
    }

    async fn iocs(&self) -> CtlResult<Vec<String>> {
        Ok(vec!["SIMDAE".to_string()])
    }

    async fn sample_pars(&self) -> CtlResult<BTreeMap<String, serde_json::Value>> {
        Ok(BTreeMap::new())
    }

    async fn beamline_pars(&self) -> CtlResult<BTreeMap<String, serde_json::Value>> {
        Ok(BTreeMap::new())
    }
}

#[async_trait]
impl WaitBackend for SimBackend {
    async fn start_waiting(&self, spec: &WaitSpec) -> CtlResult<()> {
        // Validate and normalise the clauses up front, as the live engine
        // does.
        let band = match &spec.block {
            Some(block) => {
                let canonical = self.state.lock().await.canonical(block)?;
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
                Some((canonical, low, high))
            }
            None => None,
        };

        let duration = match &spec.time {
            Some(clock) => {
                let parts: Vec<&str> = clock.split(':').collect();
                let [h, m, s] = parts.as_slice() else {
                    return Err(CtlError::NotNumeric {
                        name: "time (HH:MM:SS)".into(),
                        value: clock.clone(),
                    });
                };
                let parse = |p: &str| -> CtlResult<f64> {
                    p.trim().parse().map_err(|_| CtlError::NotNumeric {
                        name: "time (HH:MM:SS)".into(),
                        value: clock.clone(),
                    })
                };
                Some(Duration::from_secs_f64(
                    parse(h)? * 3600.0 + parse(m)? * 60.0 + parse(s)?,
                ))
            }
            None => {
                let total = spec.seconds.unwrap_or(0.0)
                    + spec.minutes.unwrap_or(0.0) * 60.0
                    + spec.hours.unwrap_or(0.0) * 3600.0;
                (spec.seconds.is_some() || spec.minutes.is_some() || spec.hours.is_some())
                    .then(|| Duration::from_secs_f64(total))
            }
        };

        if band.is_none() && duration.is_none() && spec.frames.is_none() && spec.uamps.is_none() {
            return Err(CtlError::NothingToWaitFor);
        }

        let started = Instant::now();
        let deadline = spec.maxwait.map(|m| started + m);
        loop {
            let mut met = Vec::new();
            if let Some((block, low, high)) = &band {
                let state = self.state.lock().await;
                let current = state.blocks[block].value.as_f64();
                met.push(current.map_or(false, |v| {
                    low.map_or(true, |l| v >= l) && high.map_or(true, |h| v <= h)
                }));
            }
            if let Some(duration) = duration {
                met.push(started.elapsed() >= duration);
            }
            if let Some(frames) = spec.frames {
                met.push(self.good_frames(false).await? >= frames);
            }
            if let Some(uamps) = spec.uamps {
                met.push(self.uamps(false).await? >= uamps);
            }
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
            sleep(SIM_POLL).await;
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
            let current = self.state.lock().await.state;
            if onexit {
                if current != state {
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
            sleep(SIM_POLL).await;
        }
    }

    async fn wait_for_move(
        &self,
        blocks: Option<&[String]>,
        _start_timeout: Duration,
        _move_timeout: Option<Duration>,
    ) -> CtlResult<AlarmLists> {
        sleep(Duration::from_millis(10)).await;
        match blocks {
            None => Ok(AlarmLists::default()),
            Some(names) => {
                let mut watched = Vec::new();
                {
                    let state = self.state.lock().await;
                    for name in names {
                        match state.canonical(name) {
                            Ok(canonical) => watched.push(canonical),
                            Err(_) => println!("Block {} not found, not waiting for it", name),
                        }
                    }
                }
                self.check_alarms(&watched).await
            }
        }
    }
}
