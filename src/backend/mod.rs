//! Backend contract between the verb layer and the control system.
//!
//! The verb layer depends only on the three traits here; a session is wired
//! at construction with either the live channel-access implementation
//! ([`live`]) or the in-memory simulation ([`sim`]), so user scripts run
//! unchanged offline.

pub mod live;
pub mod sim;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::dae::{PeriodDefinition, RunState, Spectrum};
use crate::error::CtlResult;
use crate::transport::PvValue;

/// Options for `begin`.
#[derive(Clone, Debug, Default)]
pub struct BeginOptions {
    /// Period to start in, when not the current one.
    pub period: Option<i64>,
    /// Start the run in the delayed state.
    pub delayed: bool,
    /// Start the run paused.
    pub paused: bool,
    /// Suppress the banner line.
    pub quiet: bool,
    pub meas_id: Option<String>,
    pub meas_type: Option<String>,
    pub meas_label: Option<String>,
    pub meas_subid: Option<String>,
    pub sample_id: Option<String>,
    /// Drain and print the DAE message buffer after the transition.
    pub verbose: bool,
}

/// Veto edits accepted by `change_vetos`. `fifo` is a runtime write, the
/// rest are staged in the change session.
#[derive(Clone, Debug, Default)]
pub struct VetoSettings {
    /// Stage all seven external vetos to 0 first.
    pub clearall: bool,
    pub smp: Option<bool>,
    pub ts2: Option<bool>,
    pub hz50: Option<bool>,
    pub ext0: Option<bool>,
    pub ext1: Option<bool>,
    pub ext2: Option<bool>,
    pub ext3: Option<bool>,
    pub fifo: Option<bool>,
}

/// Settings staged by `configure_hard_periods` and friends.
#[derive(Clone, Debug, Default)]
pub struct HardPeriodSetup {
    /// Take settings from staged parameters or from a file.
    pub from_file: Option<String>,
    pub sequences: Option<i64>,
    pub output_delay: Option<i64>,
    /// Optional single period definition applied alongside.
    pub period: Option<i64>,
    pub definition: Option<PeriodDefinition>,
}

/// Runcontrol state of one block, as shown by `cshow`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunControl {
    pub enabled: Option<bool>,
    pub low: Option<f64>,
    pub high: Option<f64>,
}

/// Options for a single-block `cset`.
#[derive(Clone, Debug, Default)]
pub struct SetBlockOptions {
    pub runcontrol: Option<bool>,
    pub low: Option<f64>,
    pub high: Option<f64>,
    pub wait: bool,
}

/// Alarm partition returned by `check_alarms`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AlarmLists {
    pub minor: Vec<String>,
    pub major: Vec<String>,
}

/// A clause-based wait specification; see the wait engine for semantics.
#[derive(Clone, Debug, Default)]
pub struct WaitSpec {
    pub block: Option<String>,
    pub value: Option<f64>,
    pub low: Option<f64>,
    pub high: Option<f64>,
    pub seconds: Option<f64>,
    pub minutes: Option<f64>,
    pub hours: Option<f64>,
    /// "HH:MM:SS"; overrides the three scalars.
    pub time: Option<String>,
    pub frames: Option<i64>,
    pub uamps: Option<f64>,
    /// Conjunction (true) or disjunction (false) of the armed clauses.
    pub wait_all: bool,
    /// Bound on the whole wait; expiry is a printed note, not an error.
    pub maxwait: Option<Duration>,
}

/// DAE run-state controller, reconfiguration and readouts.
#[async_trait]
pub trait DaeBackend: Send + Sync {
    // -- state ---------------------------------------------------------------
    async fn run_state(&self) -> CtlResult<RunState>;
    async fn in_transition(&self) -> CtlResult<bool>;

    // -- transitions ---------------------------------------------------------
    async fn begin(&self, opts: &BeginOptions) -> CtlResult<()>;
    async fn pause(&self, verbose: bool) -> CtlResult<()>;
    async fn resume(&self, verbose: bool) -> CtlResult<()>;
    async fn end(&self, verbose: bool) -> CtlResult<()>;
    async fn abort(&self, verbose: bool) -> CtlResult<()>;
    async fn recover(&self, verbose: bool) -> CtlResult<()>;
    async fn update(&self, verbose: bool) -> CtlResult<()>;
    async fn store(&self, verbose: bool) -> CtlResult<()>;
    async fn update_store(&self, verbose: bool) -> CtlResult<()>;
    async fn snapshot_crpt(&self, path: &str, verbose: bool) -> CtlResult<()>;

    // -- readouts ------------------------------------------------------------
    async fn run_number(&self) -> CtlResult<String>;
    async fn period(&self) -> CtlResult<i64>;
    async fn num_periods(&self) -> CtlResult<i64>;
    async fn period_type(&self) -> CtlResult<String>;
    async fn period_seq(&self) -> CtlResult<i64>;
    async fn set_period(&self, period: i64) -> CtlResult<()>;
    async fn uamps(&self, period: bool) -> CtlResult<f64>;
    async fn good_frames(&self, period: bool) -> CtlResult<i64>;
    async fn raw_frames(&self, period: bool) -> CtlResult<i64>;
    async fn num_spectra(&self) -> CtlResult<i64>;
    async fn monitor_counts(&self) -> CtlResult<i64>;
    async fn title(&self) -> CtlResult<String>;
    async fn set_title(&self, title: &str) -> CtlResult<()>;
    async fn rb_number(&self) -> CtlResult<String>;
    async fn users(&self) -> CtlResult<String>;
    async fn set_users(&self, users: &str) -> CtlResult<()>;
    async fn start_time(&self) -> CtlResult<String>;
    async fn timing_source(&self) -> CtlResult<String>;
    async fn mevents(&self) -> CtlResult<f64>;
    async fn total_counts(&self) -> CtlResult<i64>;
    async fn count_rate(&self) -> CtlResult<f64>;
    async fn event_mode_fraction(&self) -> CtlResult<f64>;
    async fn beam_current(&self) -> CtlResult<f64>;
    async fn total_uamps(&self) -> CtlResult<f64>;
    async fn memory_used(&self) -> CtlResult<f64>;

    // -- change session ------------------------------------------------------
    async fn change_start(&self) -> CtlResult<()>;
    async fn change_finish(&self, verbose: bool) -> CtlResult<()>;
    async fn change_tables(
        &self,
        wiring: Option<String>,
        detector: Option<String>,
        spectra: Option<String>,
    ) -> CtlResult<()>;
    async fn change_monitor(&self, spectrum: i64, low: f64, high: f64) -> CtlResult<()>;
    async fn change_sync(&self, source: &str) -> CtlResult<()>;
    async fn change_tcb_file(&self, file: &str) -> CtlResult<()>;
    async fn change_tcb(
        &self,
        low: Option<f64>,
        high: Option<f64>,
        step: Option<f64>,
        trange: i64,
        log: bool,
        regime: i64,
    ) -> CtlResult<()>;
    async fn change_vetos(&self, vetos: &VetoSettings) -> CtlResult<()>;
    async fn set_fermi_veto(&self, enable: bool, delay: f64, width: f64) -> CtlResult<()>;
    async fn set_num_soft_periods(&self, count: i64) -> CtlResult<()>;
    async fn set_period_mode(&self, mode: &str) -> CtlResult<()>;
    async fn configure_hard_periods(&self, mode: &str, setup: &HardPeriodSetup) -> CtlResult<()>;
    async fn configure_internal_periods(&self, setup: &HardPeriodSetup) -> CtlResult<()>;
    async fn define_hard_period(
        &self,
        period: Option<i64>,
        definition: PeriodDefinition,
    ) -> CtlResult<()>;

    // -- spectra -------------------------------------------------------------
    async fn get_spectrum(&self, spectrum: i64, period: i64, dist: bool) -> CtlResult<Spectrum>;
}

/// Named block access.
#[async_trait]
pub trait BlockBackend: Send + Sync {
    /// Canonical block names, original casing.
    async fn names(&self) -> CtlResult<Vec<String>>;
    /// Case-insensitive existence check.
    async fn exists(&self, name: &str) -> CtlResult<bool>;
    /// Restore canonical casing; optionally prepend the full namespace.
    async fn resolve(&self, name: &str, add_prefix: bool) -> CtlResult<String>;
    async fn get(&self, name: &str) -> CtlResult<PvValue>;
    async fn set(&self, name: &str, value: PvValue, opts: &SetBlockOptions) -> CtlResult<()>;
    async fn set_multiple(&self, pairs: &[(String, PvValue)]) -> CtlResult<()>;
    /// Runcontrol settings of one block, for display.
    async fn runcontrol(&self, name: &str) -> CtlResult<RunControl>;
    async fn check_alarms(&self, names: &[String]) -> CtlResult<AlarmLists>;
    async fn check_limit_violations(&self, names: &[String]) -> CtlResult<Vec<String>>;

    // -- block-server introspection blobs -------------------------------------
    async fn groups(&self) -> CtlResult<BTreeMap<String, Vec<String>>>;
    async fn iocs(&self) -> CtlResult<Vec<String>>;
    async fn sample_pars(&self) -> CtlResult<BTreeMap<String, serde_json::Value>>;
    async fn beamline_pars(&self) -> CtlResult<BTreeMap<String, serde_json::Value>>;
}

/// Composable waits.
#[async_trait]
pub trait WaitBackend: Send + Sync {
    async fn start_waiting(&self, spec: &WaitSpec) -> CtlResult<()>;
    async fn wait_for_runstate(
        &self,
        state: RunState,
        maxwait: Duration,
        onexit: bool,
    ) -> CtlResult<()>;
    /// Wait for motion to finish; `blocks = None` watches the global motor
    /// count, otherwise each named block's done-moving field. Returns the
    /// blocks found in MINOR/MAJOR alarm afterwards.
    async fn wait_for_move(
        &self,
        blocks: Option<&[String]>,
        start_timeout: Duration,
        move_timeout: Option<Duration>,
    ) -> CtlResult<AlarmLists>;
}

/// The bundle a session is wired with.
#[derive(Clone)]
pub struct Backend {
    pub dae: Arc<dyn DaeBackend>,
    pub blocks: Arc<dyn BlockBackend>,
    pub waits: Arc<dyn WaitBackend>,
}

/// Format a comma-separated user list as "A, B and C".
pub fn format_users(raw: &str) -> String {
    let users: Vec<&str> = raw
        .split(',')
        .map(|u| u.trim())
        .filter(|u| !u.is_empty())
        .collect();
    match users.as_slice() {
        [] => String::new(),
        [one] => (*one).to_string(),
        [head @ .., last] => format!("{} and {}", head.join(", "), last),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_users() {
        assert_eq!(format_users(""), "");
        assert_eq!(format_users("Alice"), "Alice");
        assert_eq!(format_users("Alice, Bob"), "Alice and Bob");
        assert_eq!(format_users("Alice,Bob,Carol"), "Alice, Bob and Carol");
        assert_eq!(format_users(" Alice , , Bob "), "Alice and Bob");
    }
}
