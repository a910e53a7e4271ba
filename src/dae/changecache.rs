//! Batched DAE reconfiguration cache.
//!
//! A change session stages edits to the three configuration documents (DAE
//! settings, time-channel boundaries, periods) without touching the DAE.
//! `change_finish` fetches each document, applies the staged fields and
//! writes back only the documents that actually changed.
//!
//! The documents are XML trees of typed leaves, each leaf a `Name`/`Val`
//! element pair. The apply routines walk the tree, overwrite the `Val` of
//! every staged leaf, and raise a protocol error when a staged leaf does not
//! exist in the document.

use std::fmt;
use xmltree::{Element, XMLNode};

use crate::error::{CtlError, CtlResult};

// =============================================================================
// Enumerated settings
// =============================================================================

/// DAE synchronisation source. Ordinals are the wire values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncSource {
    Isis = 0,
    Internal = 1,
    Smp = 2,
    MuonCerenkov = 3,
    MuonMs = 4,
    IsisFirstTs1 = 5,
    IsisTs1Only = 6,
}

impl SyncSource {
    pub const ALL: [SyncSource; 7] = [
        SyncSource::Isis,
        SyncSource::Internal,
        SyncSource::Smp,
        SyncSource::MuonCerenkov,
        SyncSource::MuonMs,
        SyncSource::IsisFirstTs1,
        SyncSource::IsisTs1Only,
    ];

    pub fn label(self) -> &'static str {
        match self {
            SyncSource::Isis => "isis",
            SyncSource::Internal => "internal",
            SyncSource::Smp => "smp",
            SyncSource::MuonCerenkov => "muon cerenkov",
            SyncSource::MuonMs => "muon ms",
            SyncSource::IsisFirstTs1 => "isis (first ts1)",
            SyncSource::IsisTs1Only => "isis (ts1 only)",
        }
    }

    /// Parse a label, ignoring case and whitespace.
    pub fn parse(text: &str) -> CtlResult<Self> {
        let wanted = squash(text);
        Self::ALL
            .into_iter()
            .find(|s| squash(s.label()) == wanted)
            .ok_or_else(|| CtlError::UnknownSyncSource {
                value: text.to_string(),
                choices: Self::ALL.iter().map(|s| s.label().to_string()).collect(),
            })
    }

    pub fn ordinal(self) -> i64 {
        self as i64
    }
}

impl fmt::Display for SyncSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn squash(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Time-channel binning mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcbMode {
    Linear = 1,
    Log = 2,
}

impl TcbMode {
    pub fn ordinal(self) -> i64 {
        self as i64
    }
}

/// Period mode: software, or hardware driven internally/externally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeriodMode {
    Soft = 0,
    Int = 1,
    Ext = 2,
}

impl PeriodMode {
    pub fn parse(text: &str) -> CtlResult<Self> {
        match text.trim().to_lowercase().as_str() {
            "soft" => Ok(PeriodMode::Soft),
            "int" => Ok(PeriodMode::Int),
            "ext" => Ok(PeriodMode::Ext),
            other => Err(CtlError::InvalidLabel {
                name: "period mode (soft/int/ext)".into(),
                value: other.into(),
            }),
        }
    }

    pub fn ordinal(self) -> i64 {
        self as i64
    }
}

/// Where hardware period settings come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeriodSource {
    Parameters = 0,
    File = 1,
}

impl PeriodSource {
    pub fn ordinal(self) -> i64 {
        self as i64
    }
}

/// What a hardware period does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeriodType {
    Unused = 0,
    Daq = 1,
    Dwell = 2,
}

impl PeriodType {
    pub fn ordinal(self) -> i64 {
        self as i64
    }
}

// =============================================================================
// Staged rows
// =============================================================================

/// One staged time-channel-boundary edit.
#[derive(Clone, Debug, PartialEq)]
pub struct TcbRow {
    pub regime: i64,
    pub trange: i64,
    pub low: Option<f64>,
    pub high: Option<f64>,
    pub step: Option<f64>,
    pub mode: Option<TcbMode>,
}

impl TcbRow {
    pub fn validate(&self) -> CtlResult<()> {
        if !(1..=6).contains(&self.regime) {
            return Err(CtlError::RegimeOutOfRange(self.regime));
        }
        if !(1..=5).contains(&self.trange) {
            return Err(CtlError::RangeOutOfRange(self.trange));
        }
        Ok(())
    }
}

/// Staged settings for one hardware period.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PeriodDefinition {
    pub ptype: Option<PeriodType>,
    pub frames: Option<i64>,
    pub output: Option<i64>,
    pub label: Option<String>,
}

pub const MAX_PERIODS: i64 = 8;

// =============================================================================
// The cache
// =============================================================================

/// All staged edits of one change session. Every field is optional; the
/// cache is permissive about numeric ranges (those are the caller's fault)
/// but the helpers validate the shapes the spec pins.
#[derive(Clone, Debug, Default)]
pub struct ChangeCache {
    // DAE settings document
    pub wiring: Option<String>,
    pub detector: Option<String>,
    pub spectra: Option<String>,
    pub mon_spect: Option<i64>,
    pub mon_from: Option<f64>,
    pub mon_to: Option<f64>,
    pub dae_sync: Option<SyncSource>,
    pub fermi_veto: Option<i64>,
    pub fermi_delay: Option<f64>,
    pub fermi_width: Option<f64>,
    pub smp_veto: Option<i64>,
    pub ts2_veto: Option<i64>,
    pub hz50_veto: Option<i64>,
    pub ext0_veto: Option<i64>,
    pub ext1_veto: Option<i64>,
    pub ext2_veto: Option<i64>,
    pub ext3_veto: Option<i64>,

    // TCB document
    pub tcb_file: Option<String>,
    pub tcb_tables: Vec<TcbRow>,

    // Periods document
    pub soft_periods: Option<i64>,
    pub period_mode: Option<PeriodMode>,
    pub period_src: Option<PeriodSource>,
    pub period_file: Option<String>,
    pub period_seq: Option<i64>,
    pub period_delay: Option<i64>,
    pub periods: Vec<(i64, PeriodDefinition)>,
}

impl ChangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage the monitor spectrum together with its integration window.
    pub fn set_monitor(&mut self, spectrum: i64, low: f64, high: f64) {
        self.mon_spect = Some(spectrum);
        self.mon_from = Some(low);
        self.mon_to = Some(high);
    }

    /// Stage the Fermi-chopper veto as one unit.
    pub fn set_fermi(&mut self, enable: bool, delay: f64, width: f64) {
        self.fermi_veto = Some(enable as i64);
        self.fermi_delay = Some(delay);
        self.fermi_width = Some(width);
    }

    /// Stage all seven external vetos to 0. The Fermi veto has its own
    /// enable and is not touched.
    pub fn clear_vetos(&mut self) {
        self.smp_veto = Some(0);
        self.ts2_veto = Some(0);
        self.hz50_veto = Some(0);
        self.ext0_veto = Some(0);
        self.ext1_veto = Some(0);
        self.ext2_veto = Some(0);
        self.ext3_veto = Some(0);
    }

    /// Stage a time-channel row after validating its regime/range.
    pub fn add_tcb_row(&mut self, row: TcbRow) -> CtlResult<()> {
        row.validate()?;
        self.tcb_tables.push(row);
        Ok(())
    }

    /// Stage a hardware-period definition. `period = None` applies the edit
    /// to all of periods 1..=8.
    pub fn define_period(&mut self, period: Option<i64>, def: PeriodDefinition) -> CtlResult<()> {
        match period {
            Some(p) => {
                if !(1..=MAX_PERIODS).contains(&p) {
                    return Err(CtlError::PeriodOutOfRange(p));
                }
                self.periods.push((p, def));
            }
            None => {
                for p in 1..=MAX_PERIODS {
                    self.periods.push((p, def.clone()));
                }
            }
        }
        Ok(())
    }

    /// Apply staged DAE-settings fields to the document. Returns whether
    /// anything was staged for this document.
    pub fn change_dae_settings(&self, root: &mut Element) -> CtlResult<bool> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        push_str(&mut pairs, "Wiring Table", &self.wiring);
        push_str(&mut pairs, "Detector Table", &self.detector);
        push_str(&mut pairs, "Spectra Table", &self.spectra);
        push_int(&mut pairs, "Monitor Spectrum", self.mon_spect);
        push_float(&mut pairs, "from", self.mon_from);
        push_float(&mut pairs, "to", self.mon_to);
        if let Some(sync) = self.dae_sync {
            pairs.push(("DAETimingSource".into(), sync.ordinal().to_string()));
        }
        push_int(&mut pairs, "Fermi Chopper Veto", self.fermi_veto);
        push_float(&mut pairs, "FC Delay", self.fermi_delay);
        push_float(&mut pairs, "FC Width", self.fermi_width);
        push_int(&mut pairs, "SMP (Chopper) Veto", self.smp_veto);
        push_int(&mut pairs, "TS2 Pulse Veto", self.ts2_veto);
        push_int(&mut pairs, "ISIS 50Hz Veto", self.hz50_veto);
        push_int(&mut pairs, "Veto 0", self.ext0_veto);
        push_int(&mut pairs, "Veto 1", self.ext1_veto);
        push_int(&mut pairs, "Veto 2", self.ext2_veto);
        push_int(&mut pairs, "Veto 3", self.ext3_veto);
        apply_pairs(root, "DAE", &pairs)
    }

    /// Apply staged time-channel fields to the document.
    pub fn change_tcb_settings(&self, root: &mut Element) -> CtlResult<bool> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        push_str(&mut pairs, "Time Channel File", &self.tcb_file);
        for row in &self.tcb_tables {
            if let Some(low) = row.low {
                pairs.push((format!("TR{} From {}", row.regime, row.trange), fmt_float(low)));
            }
            if let Some(high) = row.high {
                pairs.push((format!("TR{} To {}", row.regime, row.trange), fmt_float(high)));
            }
            if let Some(step) = row.step {
                pairs.push((
                    format!("TR{} Steps {}", row.regime, row.trange),
                    fmt_float(step),
                ));
            }
            if let Some(mode) = row.mode {
                pairs.push((
                    format!("TR{} In Mode {}", row.regime, row.trange),
                    mode.ordinal().to_string(),
                ));
            }
        }
        apply_pairs(root, "TCB", &pairs)
    }

    /// Apply staged period fields to the document.
    pub fn change_period_settings(&self, root: &mut Element) -> CtlResult<bool> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        push_int(&mut pairs, "Number Of Software Periods", self.soft_periods);
        if let Some(mode) = self.period_mode {
            pairs.push(("Period Type".into(), mode.ordinal().to_string()));
        }
        if let Some(src) = self.period_src {
            pairs.push(("Period Setup Source".into(), src.ordinal().to_string()));
        }
        push_str(&mut pairs, "Period File", &self.period_file);
        push_int(&mut pairs, "Hardware Period Sequences", self.period_seq);
        push_int(&mut pairs, "Output Delay (us)", self.period_delay);
        for (period, def) in &self.periods {
            if let Some(ptype) = def.ptype {
                pairs.push((format!("Type {}", period), ptype.ordinal().to_string()));
            }
            if let Some(frames) = def.frames {
                pairs.push((format!("Frames {}", period), frames.to_string()));
            }
            if let Some(output) = def.output {
                pairs.push((format!("Output {}", period), output.to_string()));
            }
            if let Some(label) = &def.label {
                pairs.push((format!("Label {}", period), label.clone()));
            }
        }
        apply_pairs(root, "periods", &pairs)
    }

    /// True when nothing at all is staged.
    pub fn is_empty(&self) -> bool {
        let Self {
            wiring,
            detector,
            spectra,
            mon_spect,
            mon_from,
            mon_to,
            dae_sync,
            fermi_veto,
            fermi_delay,
            fermi_width,
            smp_veto,
            ts2_veto,
            hz50_veto,
            ext0_veto,
            ext1_veto,
            ext2_veto,
            ext3_veto,
            tcb_file,
            tcb_tables,
            soft_periods,
            period_mode,
            period_src,
            period_file,
            period_seq,
            period_delay,
            periods,
        } = self;
        wiring.is_none()
            && detector.is_none()
            && spectra.is_none()
            && mon_spect.is_none()
            && mon_from.is_none()
            && mon_to.is_none()
            && dae_sync.is_none()
            && fermi_veto.is_none()
            && fermi_delay.is_none()
            && fermi_width.is_none()
            && smp_veto.is_none()
            && ts2_veto.is_none()
            && hz50_veto.is_none()
            && ext0_veto.is_none()
            && ext1_veto.is_none()
            && ext2_veto.is_none()
            && ext3_veto.is_none()
            && tcb_file.is_none()
            && tcb_tables.is_empty()
            && soft_periods.is_none()
            && period_mode.is_none()
            && period_src.is_none()
            && period_file.is_none()
            && period_seq.is_none()
            && period_delay.is_none()
            && periods.is_empty()
    }
}

// =============================================================================
// XML document handling
// =============================================================================

/// Parse a settings document. Trailing bytes after the final `>` (padding in
/// the waveform channel) are stripped before the parse.
pub fn parse_settings_xml(text: &str) -> CtlResult<Element> {
    let trimmed = match text.rfind('>') {
        Some(pos) => &text[..=pos],
        None => text,
    };
    Element::parse(trimmed.as_bytes()).map_err(|e| CtlError::Xml(e.to_string()))
}

/// Serialise a settings document back to its wire text.
pub fn serialize_settings_xml(root: &Element) -> CtlResult<String> {
    let mut out = Vec::new();
    root.write(&mut out).map_err(|e| CtlError::Xml(e.to_string()))?;
    String::from_utf8(out).map_err(|e| CtlError::Xml(e.to_string()))
}

/// Overwrite the `Val` of the leaf with the given `Name`, anywhere in the
/// tree. Returns false when no such leaf exists.
fn set_leaf(element: &mut Element, name: &str, value: &str) -> bool {
    let is_match = element
        .get_child("Name")
        .and_then(|n| n.get_text())
        .map(|t| t.trim() == name)
        .unwrap_or(false);
    if is_match {
        if let Some(val) = element.get_mut_child("Val") {
            val.children.clear();
            val.children.push(XMLNode::Text(value.to_string()));
            return true;
        }
    }
    for node in &mut element.children {
        if let XMLNode::Element(child) = node {
            if set_leaf(child, name, value) {
                return true;
            }
        }
    }
    false
}

fn apply_pairs(root: &mut Element, document: &str, pairs: &[(String, String)]) -> CtlResult<bool> {
    if pairs.is_empty() {
        return Ok(false);
    }
    for (name, value) in pairs {
        if !set_leaf(root, name, value) {
            return Err(CtlError::LeafNotFound {
                document: document.to_string(),
                leaf: name.clone(),
            });
        }
    }
    Ok(true)
}

fn push_str(pairs: &mut Vec<(String, String)>, name: &str, value: &Option<String>) {
    if let Some(v) = value {
        pairs.push((name.to_string(), v.clone()));
    }
}

fn push_int(pairs: &mut Vec<(String, String)>, name: &str, value: Option<i64>) {
    if let Some(v) = value {
        pairs.push((name.to_string(), v.to_string()));
    }
}

fn push_float(pairs: &mut Vec<(String, String)>, name: &str, value: Option<f64>) {
    if let Some(v) = value {
        pairs.push((name.to_string(), fmt_float(v)));
    }
}

/// Floats always carry a decimal point on the wire ("1000.0", never "1000").
fn fmt_float(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}
