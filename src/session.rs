//! The user-facing verb layer.
//!
//! A [`Session`] is constructed once at startup and threaded through
//! everything: it owns the resolved instrument prefix, the chosen backend
//! (live or simulated), the hook registry, the command log and the sticky
//! flags. Every verb is a thin shell around a backend call: log the
//! invocation, run the pre-hook, delegate, run the post-hook, and catch any
//! error at the edge — printed as a single `ERROR:` line (red on a
//! terminal) and re-raised only when `exceptions_raised` is set.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::backend::live::live_backend;
use crate::backend::sim::SimBackend;
use crate::backend::{
    Backend, BeginOptions, HardPeriodSetup, RunControl, SetBlockOptions, VetoSettings, WaitSpec,
};
use crate::cmdlog::CommandLog;
use crate::config::Settings;
use crate::dae::{PeriodDefinition, RunState, Spectrum};
use crate::error::{CtlError, CtlResult};
use crate::hooks::{HookContext, HookRegistry};
use crate::identity::{default_identifier, PvPrefix};
use crate::transport::{ChannelTransport, MemoryTransport, PvValue, RetryingTransport};

/// The exported verb vocabulary, as seen by the script checker.
pub const VERBS: &[&str] = &[
    "begin",
    "end",
    "pause",
    "resume",
    "abort",
    "recover",
    "update",
    "store",
    "update_store",
    "snapshot_crpt",
    "cset",
    "cget",
    "cshow",
    "waitfor",
    "waitfor_runstate",
    "waitfor_move",
    "change",
    "change_start",
    "change_finish",
    "change_tables",
    "change_monitor",
    "change_sync",
    "change_tcb_file",
    "change_tcb",
    "change_vetos",
    "set_fermi_veto",
    "set_num_soft_periods",
    "set_period_mode",
    "configure_hard_periods",
    "configure_internal_periods",
    "define_hard_period",
    "set_pv",
    "get_pv",
    "plot_spectrum",
    "load_script",
    "set_instrument",
    "change_script_dir",
];

/// One `cset` invocation: one or more block/value pairs plus the
/// single-block-only options.
#[derive(Clone, Debug, Default)]
pub struct CsetRequest {
    pub pairs: Vec<(String, PvValue)>,
    pub runcontrol: Option<bool>,
    pub low: Option<f64>,
    pub high: Option<f64>,
    pub wait: bool,
}

/// What `cget` reports about one block.
#[derive(Clone, Debug)]
pub struct BlockSnapshot {
    pub name: String,
    pub value: PvValue,
    pub runcontrol: RunControl,
}

pub struct Session {
    backend: RwLock<Backend>,
    transport: Arc<dyn ChannelTransport>,
    prefix: RwLock<PvPrefix>,
    settings: Settings,
    scripts_dir: RwLock<PathBuf>,
    hooks: RwLock<HookRegistry>,
    log: CommandLog,
    exceptions_raised: AtomicBool,
    verbose: AtomicBool,
    simulated: bool,
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Session {
    /// Wire a live session over a channel-access transport. The shared
    /// retry policy is applied here, once, for every operation.
    pub fn live(transport: Arc<dyn ChannelTransport>, settings: Settings) -> Self {
        let transport: Arc<dyn ChannelTransport> = Arc::new(RetryingTransport::new(transport));
        let prefix = Self::initial_prefix(&settings);
        let backend = live_backend(transport.clone(), prefix.clone(), &settings);
        Self::assemble(backend, transport, prefix, settings, false)
    }

    /// Wire an offline session against the in-memory simulation. The
    /// returned handle seeds blocks and inspects state in tests.
    pub fn simulated(settings: Settings) -> (Self, SimBackend) {
        let sim = SimBackend::new();
        let prefix = Self::initial_prefix(&settings);
        let transport: Arc<dyn ChannelTransport> = Arc::new(MemoryTransport::new());
        let session = Self::assemble(sim.backend(), transport, prefix, settings, true);
        (session, sim)
    }

    fn initial_prefix(settings: &Settings) -> PvPrefix {
        match settings.instrument.clone().or_else(default_identifier) {
            Some(identifier) => PvPrefix::resolve(&identifier),
            None => PvPrefix::none(),
        }
    }

    fn assemble(
        backend: Backend,
        transport: Arc<dyn ChannelTransport>,
        prefix: PvPrefix,
        settings: Settings,
        simulated: bool,
    ) -> Self {
        Self {
            backend: RwLock::new(backend),
            transport,
            prefix: RwLock::new(prefix),
            scripts_dir: RwLock::new(settings.scripts_dir.clone()),
            log: CommandLog::new(settings.log_dir.clone()),
            settings,
            hooks: RwLock::new(HookRegistry::new()),
            exceptions_raised: AtomicBool::new(false),
            verbose: AtomicBool::new(false),
            simulated,
        }
    }

    // -- session state -------------------------------------------------------

    pub fn prefix(&self) -> PvPrefix {
        read_lock(&self.prefix).clone()
    }

    pub fn scripts_dir(&self) -> PathBuf {
        read_lock(&self.scripts_dir).clone()
    }

    pub fn hooks(&self) -> RwLockWriteGuard<'_, HookRegistry> {
        write_lock(&self.hooks)
    }

    /// Script authors set this so verb failures abort the script.
    pub fn set_exceptions_raised(&self, raised: bool) {
        self.exceptions_raised.store(raised, Ordering::SeqCst);
    }

    /// Sticky DAE verbosity: transitions drain and print the message buffer.
    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::SeqCst);
    }

    fn verbose_flag(&self) -> bool {
        self.verbose.load(Ordering::SeqCst)
    }

    fn backend(&self) -> Backend {
        read_lock(&self.backend).clone()
    }

    // -- verb plumbing -------------------------------------------------------

    fn report_error(&self, error: &CtlError) {
        let message = format!("ERROR: {}", error);
        if std::io::stderr().is_terminal() {
            eprintln!("\x1b[31m{}\x1b[0m", message);
        } else {
            eprintln!("{}", message);
        }
        self.log.command(&message);
    }

    /// The shell every verb runs in: log, pre-hook, delegate, post-hook,
    /// catch. Returns `Ok(None)` when an error was swallowed or a vetoing
    /// pre-hook skipped the verb.
    async fn verb<T, F>(&self, name: &str, detail: String, action: F) -> CtlResult<Option<T>>
    where
        F: Future<Output = CtlResult<T>>,
    {
        self.log.command(&format!("{}({})", name, detail));
        let context = HookContext {
            verb: name.to_string(),
            detail,
        };
        let allowed = read_lock(&self.hooks).run_pre(&context);
        if !allowed && name == "cset" {
            println!("cset vetoed by pre-hook; value not written");
            return Ok(None);
        }
        let result = action.await;
        read_lock(&self.hooks).run_post(&context);
        match result {
            Ok(value) => Ok(Some(value)),
            Err(error) => {
                self.report_error(&error);
                if self.exceptions_raised.load(Ordering::SeqCst) {
                    Err(error)
                } else {
                    Ok(None)
                }
            }
        }
    }

    // -- run transitions -----------------------------------------------------

    pub async fn begin(&self, mut opts: BeginOptions) -> CtlResult<Option<()>> {
        opts.verbose = opts.verbose || self.verbose_flag();
        let backend = self.backend();
        let quiet = opts.quiet;
        self.verb("begin", render_begin(&opts), async move {
            backend.dae.begin(&opts).await?;
            if !quiet {
                let run = backend.dae.run_number().await.unwrap_or_default();
                println!("** Beginning run {} **", run);
            }
            Ok(())
        })
        .await
    }

    pub async fn end(&self) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let verbose = self.verbose_flag();
        self.verb("end", String::new(), async move {
            let run = backend.dae.run_number().await.unwrap_or_default();
            backend.dae.end(verbose).await?;
            println!("** Ending run {} **", run);
            Ok(())
        })
        .await
    }

    pub async fn pause(&self) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let verbose = self.verbose_flag();
        self.verb("pause", String::new(), backend.dae.pause(verbose))
            .await
    }

    pub async fn resume(&self) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let verbose = self.verbose_flag();
        self.verb("resume", String::new(), backend.dae.resume(verbose))
            .await
    }

    pub async fn abort(&self) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let verbose = self.verbose_flag();
        self.verb("abort", String::new(), backend.dae.abort(verbose))
            .await
    }

    pub async fn recover(&self) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let verbose = self.verbose_flag();
        self.verb("recover", String::new(), backend.dae.recover(verbose))
            .await
    }

    pub async fn update(&self) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let verbose = self.verbose_flag();
        self.verb("update", String::new(), backend.dae.update(verbose))
            .await
    }

    pub async fn store(&self) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let verbose = self.verbose_flag();
        self.verb("store", String::new(), backend.dae.store(verbose))
            .await
    }

    pub async fn update_store(&self) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let verbose = self.verbose_flag();
        self.verb("update_store", String::new(), backend.dae.update_store(verbose))
            .await
    }

    pub async fn snapshot_crpt(&self, path: &str) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let verbose = self.verbose_flag();
        let path = path.to_string();
        self.verb("snapshot_crpt", path.clone(), async move {
            backend.dae.snapshot_crpt(&path, verbose).await
        })
        .await
    }

    // -- blocks --------------------------------------------------------------

    pub async fn cset(&self, request: CsetRequest) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let detail = request
            .pairs
            .iter()
            .map(|(n, v)| format!("{}={}", n, v))
            .collect::<Vec<_>>()
            .join(", ");
        self.verb("cset", detail, async move {
            if request.pairs.is_empty() {
                return Err(CtlError::UnknownBlock(String::new()));
            }
            let single_options = request.runcontrol.is_some()
                || request.low.is_some()
                || request.high.is_some()
                || request.wait;
            if request.pairs.len() > 1 {
                if single_options {
                    return Err(CtlError::OptionsWithMultipleBlocks);
                }
                return backend.blocks.set_multiple(&request.pairs).await;
            }
            let (name, value) = &request.pairs[0];
            let opts = SetBlockOptions {
                runcontrol: request.runcontrol,
                low: request.low,
                high: request.high,
                wait: request.wait,
            };
            backend.blocks.set(name, value.clone(), &opts).await
        })
        .await
    }

    pub async fn cget(&self, name: &str) -> CtlResult<Option<BlockSnapshot>> {
        let backend = self.backend();
        let name = name.to_string();
        self.verb("cget", name.clone(), async move {
            let canonical = backend.blocks.resolve(&name, false).await?;
            let value = backend.blocks.get(&canonical).await?;
            let runcontrol = backend.blocks.runcontrol(&canonical).await?;
            Ok(BlockSnapshot {
                name: canonical,
                value,
                runcontrol,
            })
        })
        .await
    }

    pub async fn cshow(&self, name: Option<&str>) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let detail = name.unwrap_or("").to_string();
        let name = name.map(str::to_string);
        self.verb("cshow", detail, async move {
            let names = match name {
                Some(one) => vec![backend.blocks.resolve(&one, false).await?],
                None => backend.blocks.names().await?,
            };
            for block in names {
                let value = backend.blocks.get(&block).await?;
                let rc = backend.blocks.runcontrol(&block).await?;
                println!(
                    "{} = {} (runcontrol = {}, low = {}, high = {})",
                    block,
                    value,
                    rc.enabled.map_or("NO".into(), |e| if e {
                        "YES".to_string()
                    } else {
                        "NO".to_string()
                    }),
                    rc.low.map_or("NONE".into(), |v| v.to_string()),
                    rc.high.map_or("NONE".into(), |v| v.to_string()),
                );
            }
            Ok(())
        })
        .await
    }

    // -- waits ---------------------------------------------------------------

    pub async fn waitfor(&self, spec: WaitSpec) -> CtlResult<Option<()>> {
        let backend = self.backend();
        self.verb("waitfor", render_wait(&spec), async move {
            backend.waits.start_waiting(&spec).await
        })
        .await
    }

    pub async fn waitfor_runstate(
        &self,
        state: &str,
        maxwaitsecs: f64,
        onexit: bool,
    ) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let detail = format!("{}, maxwaitsecs={}, onexit={}", state, maxwaitsecs, onexit);
        let wanted: Result<RunState, _> = state.parse();
        self.verb("waitfor_runstate", detail, async move {
            let wanted = wanted.map_err(CtlError::Dae)?;
            backend
                .waits
                .wait_for_runstate(wanted, Duration::from_secs_f64(maxwaitsecs), onexit)
                .await
        })
        .await
    }

    pub async fn waitfor_move(
        &self,
        blocks: Option<Vec<String>>,
        start_timeout: Duration,
        move_timeout: Option<Duration>,
    ) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let detail = blocks
            .as_ref()
            .map(|b| b.join(", "))
            .unwrap_or_default();
        self.verb("waitfor_move", detail, async move {
            let alarms = backend
                .waits
                .wait_for_move(blocks.as_deref(), start_timeout, move_timeout)
                .await?;
            for block in &alarms.minor {
                println!("Block {} is in MINOR alarm", block);
            }
            for block in &alarms.major {
                println!("Block {} is in MAJOR alarm", block);
            }
            Ok(())
        })
        .await
    }

    // -- DAE reconfiguration -------------------------------------------------

    pub async fn change_start(&self) -> CtlResult<Option<()>> {
        let backend = self.backend();
        self.verb("change_start", String::new(), backend.dae.change_start())
            .await
    }

    pub async fn change_finish(&self) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let verbose = self.verbose_flag();
        self.verb("change_finish", String::new(), backend.dae.change_finish(verbose))
            .await
    }

    pub async fn change_tables(
        &self,
        wiring: Option<String>,
        detector: Option<String>,
        spectra: Option<String>,
    ) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let detail = [("wiring", &wiring), ("detector", &detector), ("spectra", &spectra)]
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| format!("{}={}", k, v)))
            .collect::<Vec<_>>()
            .join(", ");
        self.verb("change_tables", detail, async move {
            backend.dae.change_tables(wiring, detector, spectra).await
        })
        .await
    }

    pub async fn change_monitor(&self, spectrum: i64, low: f64, high: f64) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let detail = format!("{}, {}, {}", spectrum, low, high);
        self.verb("change_monitor", detail, async move {
            backend.dae.change_monitor(spectrum, low, high).await
        })
        .await
    }

    pub async fn change_sync(&self, source: &str) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let source = source.to_string();
        self.verb("change_sync", source.clone(), async move {
            backend.dae.change_sync(&source).await
        })
        .await
    }

    pub async fn change_tcb_file(&self, file: &str) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let file = file.to_string();
        self.verb("change_tcb_file", file.clone(), async move {
            backend.dae.change_tcb_file(&file).await
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn change_tcb(
        &self,
        low: Option<f64>,
        high: Option<f64>,
        step: Option<f64>,
        trange: i64,
        log: bool,
        regime: i64,
    ) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let detail = format!(
            "low={:?}, high={:?}, step={:?}, trange={}, log={}, regime={}",
            low, high, step, trange, log, regime
        );
        self.verb("change_tcb", detail, async move {
            backend
                .dae
                .change_tcb(low, high, step, trange, log, regime)
                .await
        })
        .await
    }

    pub async fn change_vetos(&self, vetos: VetoSettings) -> CtlResult<Option<()>> {
        let backend = self.backend();
        self.verb("change_vetos", format!("{:?}", vetos), async move {
            backend.dae.change_vetos(&vetos).await
        })
        .await
    }

    pub async fn set_fermi_veto(&self, enable: bool, delay: f64, width: f64) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let detail = format!("{}, {}, {}", enable, delay, width);
        self.verb("set_fermi_veto", detail, async move {
            backend.dae.set_fermi_veto(enable, delay, width).await
        })
        .await
    }

    pub async fn set_num_soft_periods(&self, count: i64) -> CtlResult<Option<()>> {
        let backend = self.backend();
        self.verb("set_num_soft_periods", count.to_string(), async move {
            backend.dae.set_num_soft_periods(count).await
        })
        .await
    }

    pub async fn set_period_mode(&self, mode: &str) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let mode = mode.to_string();
        self.verb("set_period_mode", mode.clone(), async move {
            backend.dae.set_period_mode(&mode).await
        })
        .await
    }

    pub async fn configure_hard_periods(
        &self,
        mode: &str,
        setup: HardPeriodSetup,
    ) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let mode = mode.to_string();
        let detail = format!("{}, {:?}", mode, setup);
        self.verb("configure_hard_periods", detail, async move {
            backend.dae.configure_hard_periods(&mode, &setup).await
        })
        .await
    }

    pub async fn configure_internal_periods(&self, setup: HardPeriodSetup) -> CtlResult<Option<()>> {
        let backend = self.backend();
        self.verb("configure_internal_periods", format!("{:?}", setup), async move {
            backend.dae.configure_internal_periods(&setup).await
        })
        .await
    }

    pub async fn define_hard_period(
        &self,
        period: Option<i64>,
        definition: PeriodDefinition,
    ) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let detail = format!("period={:?}, {:?}", period, definition);
        self.verb("define_hard_period", detail, async move {
            backend.dae.define_hard_period(period, definition).await
        })
        .await
    }

    /// Route recognised keys to their setters; unknown keys are dropped
    /// without comment.
    pub async fn change(&self, opts: BTreeMap<String, serde_json::Value>) -> CtlResult<Option<()>> {
        let backend = self.backend();
        let detail = opts
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        self.verb("change", detail, async move {
            for (key, value) in &opts {
                match key.as_str() {
                    "title" => {
                        let title = value.as_str().unwrap_or_default();
                        backend.dae.set_title(title).await?;
                    }
                    "period" => {
                        let period = value.as_i64().ok_or_else(|| CtlError::NotNumeric {
                            name: "period".into(),
                            value: value.to_string(),
                        })?;
                        backend.dae.set_period(period).await?;
                    }
                    "nperiods" => {
                        let count = value.as_i64().ok_or_else(|| CtlError::NotNumeric {
                            name: "nperiods".into(),
                            value: value.to_string(),
                        })?;
                        backend.dae.set_num_soft_periods(count).await?;
                    }
                    "user" | "users" => {
                        let users = value.as_str().unwrap_or_default();
                        backend.dae.set_users(users).await?;
                    }
                    _ => {}
                }
            }
            Ok(())
        })
        .await
    }

    // -- raw channel access --------------------------------------------------

    pub async fn set_pv(
        &self,
        name: &str,
        value: PvValue,
        is_local: bool,
        wait: bool,
    ) -> CtlResult<Option<()>> {
        let channel = if is_local {
            self.prefix().apply(name)
        } else {
            name.to_string()
        };
        let transport = self.transport.clone();
        let timeout = self.settings.io_timeout();
        let detail = format!("{}={}", channel, value);
        self.verb("set_pv", detail, async move {
            transport.set(&channel, value, wait, timeout).await
        })
        .await
    }

    pub async fn get_pv(&self, name: &str, is_local: bool) -> CtlResult<Option<PvValue>> {
        let channel = if is_local {
            self.prefix().apply(name)
        } else {
            name.to_string()
        };
        let transport = self.transport.clone();
        let timeout = self.settings.io_timeout();
        self.verb("get_pv", channel.clone(), async move {
            transport.get(&channel, timeout).await
        })
        .await
    }

    // -- spectra -------------------------------------------------------------

    pub async fn plot_spectrum(
        &self,
        spectrum: i64,
        period: i64,
        dist: bool,
    ) -> CtlResult<Option<Spectrum>> {
        let backend = self.backend();
        let detail = format!("{}, period={}, dist={}", spectrum, period, dist);
        self.verb("plot_spectrum", detail, async move {
            if std::env::var("SCISOFT_RPC_PORT").is_ok() {
                log::info!("plot routed to the external plot server");
            }
            let data = backend.dae.get_spectrum(spectrum, period, dist).await?;
            let peak = data.signal.iter().cloned().fold(f64::MIN, f64::max);
            println!(
                "Spectrum {} (period {}): {} points, peak {:.3}",
                spectrum,
                period,
                data.time.len(),
                peak
            );
            Ok(data)
        })
        .await
    }

    // -- session management --------------------------------------------------

    /// Re-derive the instrument prefix and re-wire the live backend onto the
    /// new namespace. Simulated sessions keep their in-memory state.
    pub async fn set_instrument(&self, identifier: &str) -> CtlResult<Option<()>> {
        let detail = identifier.to_string();
        let resolved = PvPrefix::resolve(identifier);
        self.verb("set_instrument", detail, async {
            *write_lock(&self.prefix) = resolved.clone();
            if !self.simulated {
                let rebuilt = live_backend(self.transport.clone(), resolved, &self.settings);
                *write_lock(&self.backend) = rebuilt;
            }
            println!("Instrument prefix is now {}", self.prefix());
            Ok(())
        })
        .await
    }

    /// Replace the scripts directory after checking it exists.
    pub async fn change_script_dir(&self, dir: &str) -> CtlResult<Option<()>> {
        let detail = dir.to_string();
        self.verb("change_script_dir", detail.clone(), async {
            let path = PathBuf::from(&detail);
            if !path.is_dir() {
                return Err(CtlError::FileNotFound(path));
            }
            *write_lock(&self.scripts_dir) = path;
            Ok(())
        })
        .await
    }
}

fn render_begin(opts: &BeginOptions) -> String {
    let mut parts = Vec::new();
    if let Some(period) = opts.period {
        parts.push(format!("period={}", period));
    }
    if opts.delayed {
        parts.push("delayed=true".into());
    }
    if opts.paused {
        parts.push("paused=true".into());
    }
    parts.join(", ")
}

fn render_wait(spec: &WaitSpec) -> String {
    let mut parts = Vec::new();
    if let Some(block) = &spec.block {
        parts.push(format!("block={}", block));
    }
    if let Some(value) = spec.value {
        parts.push(format!("value={}", value));
    }
    if let Some(low) = spec.low {
        parts.push(format!("lowlimit={}", low));
    }
    if let Some(high) = spec.high {
        parts.push(format!("highlimit={}", high));
    }
    if let Some(seconds) = spec.seconds {
        parts.push(format!("seconds={}", seconds));
    }
    if let Some(minutes) = spec.minutes {
        parts.push(format!("minutes={}", minutes));
    }
    if let Some(hours) = spec.hours {
        parts.push(format!("hours={}", hours));
    }
    if let Some(time) = &spec.time {
        parts.push(format!("time={}", time));
    }
    if let Some(frames) = spec.frames {
        parts.push(format!("frames={}", frames));
    }
    if let Some(uamps) = spec.uamps {
        parts.push(format!("uamps={}", uamps));
    }
    if spec.wait_all {
        parts.push("wait_all=true".into());
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_settings() -> Settings {
        Settings {
            instrument: Some("LARMOR".into()),
            log_dir: std::env::temp_dir(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_begin_end_cycle_through_session() {
        let (session, sim) = Session::simulated(offline_settings());
        session.begin(BeginOptions::default()).await.unwrap();
        assert_eq!(
            sim.backend().dae.run_state().await.unwrap(),
            RunState::Running
        );
        session.end().await.unwrap();
        assert_eq!(
            sim.backend().dae.run_state().await.unwrap(),
            RunState::Setup
        );
    }

    #[tokio::test]
    async fn test_swallowed_error_by_default() {
        let (session, _sim) = Session::simulated(offline_settings());
        // end() outside a run: error is printed and swallowed.
        let result = session.end().await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_exceptions_raised_flag() {
        let (session, _sim) = Session::simulated(offline_settings());
        session.set_exceptions_raised(true);
        assert!(session.end().await.is_err());
    }

    #[tokio::test]
    async fn test_cset_wait_with_runcontrol_rejected() {
        let (session, sim) = Session::simulated(offline_settings());
        sim.add_block("temp", 300.0).await;
        session.set_exceptions_raised(true);
        let request = CsetRequest {
            pairs: vec![("temp".into(), 300.0.into())],
            runcontrol: Some(true),
            wait: true,
            ..Default::default()
        };
        assert!(matches!(
            session.cset(request).await,
            Err(CtlError::WaitWithRunControl)
        ));
    }

    #[tokio::test]
    async fn test_cset_multi_block_forbids_options() {
        let (session, sim) = Session::simulated(offline_settings());
        sim.add_block("a", 1.0).await;
        sim.add_block("b", 2.0).await;
        session.set_exceptions_raised(true);
        let request = CsetRequest {
            pairs: vec![("a".into(), 5.0.into()), ("b".into(), 6.0.into())],
            runcontrol: Some(true),
            ..Default::default()
        };
        assert!(matches!(
            session.cset(request).await,
            Err(CtlError::OptionsWithMultipleBlocks)
        ));
    }

    #[tokio::test]
    async fn test_cset_pre_hook_veto_skips_write() {
        let (session, sim) = Session::simulated(offline_settings());
        sim.add_block("temp", 1.0).await;
        session.hooks().set_pre("cset", Box::new(|_| false));
        session
            .cset(CsetRequest {
                pairs: vec![("temp".into(), 9.0.into())],
                ..Default::default()
            })
            .await
            .unwrap();
        let value = sim.backend().blocks.get("temp").await.unwrap();
        assert_eq!(value.as_f64(), Some(1.0));
    }

    #[tokio::test]
    async fn test_change_routes_known_keys_and_ignores_unknown() {
        let (session, sim) = Session::simulated(offline_settings());
        let mut opts = BTreeMap::new();
        opts.insert("title".to_string(), serde_json::json!("my experiment"));
        opts.insert("definitely_unknown".to_string(), serde_json::json!(1));
        session.change(opts).await.unwrap();
        assert_eq!(sim.backend().dae.title().await.unwrap(), "my experiment");
    }

    #[tokio::test]
    async fn test_cget_reports_runcontrol() {
        let (session, sim) = Session::simulated(offline_settings());
        sim.add_block("Field", 1.5).await;
        session
            .cset(CsetRequest {
                pairs: vec![("field".into(), 2.5.into())],
                runcontrol: Some(true),
                low: Some(2.0),
                high: Some(3.0),
                ..Default::default()
            })
            .await
            .unwrap();
        let snapshot = session.cget("FIELD").await.unwrap().unwrap();
        assert_eq!(snapshot.name, "Field");
        assert_eq!(snapshot.value.as_f64(), Some(2.5));
        assert_eq!(snapshot.runcontrol.enabled, Some(true));
        assert_eq!(snapshot.runcontrol.low, Some(2.0));
        assert_eq!(snapshot.runcontrol.high, Some(3.0));
    }
}
