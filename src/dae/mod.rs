//! DAE domain types: run states, channel names, and the batched
//! reconfiguration cache.

pub mod changecache;
pub mod channels;
pub mod runstate;

pub use changecache::{
    ChangeCache, PeriodDefinition, PeriodMode, PeriodSource, PeriodType, SyncSource, TcbMode,
    TcbRow,
};
pub use runstate::RunState;

/// A single fetched spectrum.
#[derive(Clone, Debug, PartialEq)]
pub struct Spectrum {
    /// Time-of-flight bin centres.
    pub time: Vec<f64>,
    /// Counts (per-bin, distribution mode).
    pub signal: Vec<f64>,
    /// Integrated counts; not populated in distribution mode.
    pub sum: Option<f64>,
    pub mode: SpectrumMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpectrumMode {
    Distribution,
}
