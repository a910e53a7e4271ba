//! Relative channel names.
//!
//! Every name here is relative; the session's instrument prefix is prepended
//! before it reaches the transport.

// -- run-state machine -------------------------------------------------------

pub const RUNSTATE: &str = "DAE:RUNSTATE";
/// Non-zero while the DAE is between stable states.
pub const RUNSTATE_TRANS: &str = "DAE:STATE:TRANS";

// Transition triggers. BEGINRUN takes the {paused, delayed} bitfield.
pub const BEGINRUN: &str = "DAE:BEGINRUNEX";
pub const PAUSERUN: &str = "DAE:PAUSERUN";
pub const RESUMERUN: &str = "DAE:RESUMERUN";
pub const ENDRUN: &str = "DAE:ENDRUN";
pub const ABORTRUN: &str = "DAE:ABORTRUN";
pub const RECOVERRUN: &str = "DAE:RECOVERRUN";
pub const UPDATERUN: &str = "DAE:UPDATERUN";
pub const STORERUN: &str = "DAE:STORERUN";
pub const SAVERUN: &str = "DAE:SAVERUN";
pub const SNAPSHOT: &str = "DAE:SNAPSHOTCRPT";

/// Error text accompanying a failed transition.
pub const ERROR_MESSAGE: &str = "DAE:ERRMSGS";
/// Rolling DAE message buffer, drained when verbose.
pub const ALL_MESSAGES: &str = "DAE:ALLMSGS";

// -- readouts ----------------------------------------------------------------

pub const RUN_NUMBER: &str = "DAE:RUNNUMBER";
pub const PERIOD: &str = "DAE:PERIOD";
pub const PERIOD_SP: &str = "DAE:PERIOD:SP";
pub const NUM_PERIODS: &str = "DAE:NUMPERIODS";
pub const PERIOD_TYPE: &str = "DAE:PERIODTYPE";
pub const PERIOD_SEQ: &str = "DAE:PERIODSEQ";
pub const GOOD_UAH: &str = "DAE:GOODUAH";
pub const GOOD_UAH_PERIOD: &str = "DAE:GOODUAH_PD";
pub const GOOD_FRAMES: &str = "DAE:GOODFRAMES";
pub const GOOD_FRAMES_PERIOD: &str = "DAE:GOODFRAMES_PD";
pub const RAW_FRAMES: &str = "DAE:RAWFRAMES";
pub const RAW_FRAMES_PERIOD: &str = "DAE:RAWFRAMES_PD";
pub const NUM_SPECTRA: &str = "DAE:NUMSPECTRA";
pub const MONITOR_COUNTS: &str = "DAE:MONITORCOUNTS";
pub const MONITOR_SPECTRUM: &str = "DAE:MONITORSPECTRUM";
pub const TITLE: &str = "DAE:TITLE";
pub const TITLE_SP: &str = "DAE:TITLE:SP";
pub const RB_NUMBER: &str = "DAE:RBNUMBER";
pub const RB_NUMBER_SP: &str = "DAE:RBNUMBER:SP";
pub const USERS: &str = "DAE:USERNAME";
pub const USERS_SP: &str = "DAE:USERNAME:SP";
pub const START_TIME: &str = "DAE:STARTTIME";
pub const TIMING_SOURCE: &str = "DAE:DAETIMINGSOURCE";
pub const RUN_DURATION: &str = "DAE:RUNDURATION";
pub const MEVENTS: &str = "DAE:MEVENTS";
pub const TOTAL_COUNTS: &str = "DAE:TOTALCOUNTS";
pub const COUNT_RATE: &str = "DAE:COUNTRATE";
pub const EVENT_MODE_FRACTION: &str = "DAE:EVENTMODEFRACTION";
pub const BEAM_CURRENT: &str = "DAE:BEAMCURRENT";
pub const TOTAL_UAMPS: &str = "DAE:TOTALUAMPS";
pub const MEMORY_USED: &str = "DAE:DAEMEMORYUSED";
pub const MEASUREMENT_ID: &str = "DAE:MEAS:ID:SP";
pub const MEASUREMENT_TYPE: &str = "DAE:MEAS:TYPE:SP";
pub const MEASUREMENT_LABEL: &str = "DAE:MEAS:LABEL:SP";
pub const MEASUREMENT_SUBID: &str = "DAE:MEAS:SUBID:SP";
pub const SAMPLE_ID: &str = "DAE:SAMPLE:ID:SP";

// -- configuration blobs (hex + zlib + XML) ----------------------------------

pub const DAE_SETTINGS: &str = "DAE:DAESETTINGS";
pub const DAE_SETTINGS_SP: &str = "DAE:DAESETTINGS:SP";
pub const TCB_SETTINGS: &str = "DAE:TCBSETTINGS";
pub const TCB_SETTINGS_SP: &str = "DAE:TCBSETTINGS:SP";
pub const PERIOD_SETTINGS: &str = "DAE:HARDWAREPERIODS";
pub const PERIOD_SETTINGS_SP: &str = "DAE:HARDWAREPERIODS:SP";

// -- fifo veto (runtime, not staged) -----------------------------------------

pub const VETO_FIFO_ENABLE: &str = "DAE:VETO:FIFO:ENABLE";
pub const VETO_FIFO_DISABLE: &str = "DAE:VETO:FIFO:DISABLE";

// -- spectra -----------------------------------------------------------------

pub fn spectrum_x(period: i64, spectrum: i64) -> String {
    format!("DAE:SPEC:{}:{}:X", period, spectrum)
}

pub fn spectrum_y(period: i64, spectrum: i64) -> String {
    format!("DAE:SPEC:{}:{}:Y", period, spectrum)
}

/// Companion channel reporting the filled length of an array channel.
pub fn nord(channel: &str) -> String {
    format!("{}.NORD", channel)
}

// -- blocks ------------------------------------------------------------------

pub fn block(name: &str) -> String {
    format!("CS:SB:{}", name)
}

pub fn block_setpoint(resolved: &str) -> String {
    format!("{}:SP", resolved)
}

pub fn block_rc_enable(resolved: &str) -> String {
    format!("{}:RC:ENABLE", resolved)
}

pub fn block_rc_low(resolved: &str) -> String {
    format!("{}:RC:LOW", resolved)
}

pub fn block_rc_high(resolved: &str) -> String {
    format!("{}:RC:HIGH", resolved)
}

pub fn severity(channel: &str) -> String {
    format!("{}.SEVR", channel)
}

pub fn limit_violation(channel: &str) -> String {
    format!("{}.LVIO", channel)
}

pub fn done_moving(channel: &str) -> String {
    format!("{}.DMOV", channel)
}

// -- block-server introspection ----------------------------------------------

pub fn blockserver(key: &str) -> String {
    format!("CS:BLOCKSERVER:{}", key)
}

pub const BS_BLOCKNAMES: &str = "BLOCKNAMES";
pub const BS_GROUPS: &str = "GROUPS";
pub const BS_IOCS: &str = "IOCS";
pub const BS_CONFIG_IOCS: &str = "CONFIG_IOCS";
pub const BS_SAMPLE_PARS: &str = "SAMPLE_PARS";
pub const BS_BEAMLINE_PARS: &str = "BEAMLINE_PARS";
pub const BS_RC_PARS: &str = "GET_RC_PARS";
pub const BS_CONFIG: &str = "CONFIG";
pub const BS_CONFIGS: &str = "CONFIGS";

// -- motion ------------------------------------------------------------------

/// Count of currently moving motors; zero means idle.
pub const MOTION_MOVING: &str = "CS:MOT:MOVING";

// -- alarm severities --------------------------------------------------------

pub const SEVR_NONE: &str = "NO_ALARM";
pub const SEVR_MINOR: &str = "MINOR";
pub const SEVR_MAJOR: &str = "MAJOR";
