//! Shared fixture: an in-memory channel table seeded like a real DAE, plus
//! a task that plays the instrument side of the transitions.

#![allow(dead_code)] // Not every test binary uses every helper

use std::sync::Arc;
use std::time::Duration;

use beamctl::backend::live::live_backend;
use beamctl::backend::Backend;
use beamctl::codec::compress_and_hex;
use beamctl::config::Settings;
use beamctl::identity::PvPrefix;
use beamctl::transport::{ChannelTransport, MemoryTransport, PvValue};

pub const PREFIX: &str = "IN:LARMOR:";

/// Trigger channels the fake DAE watches, with the state each lands in.
const TRIGGERS: &[(&str, &str)] = &[
    ("DAE:BEGINRUNEX", "RUNNING"),
    ("DAE:PAUSERUN", "PAUSED"),
    ("DAE:RESUMERUN", "RUNNING"),
    ("DAE:ENDRUN", "SETUP"),
    ("DAE:ABORTRUN", "SETUP"),
    ("DAE:RECOVERRUN", "PAUSED"),
];

/// Transient triggers that leave the run state alone.
const TRANSIENTS: &[&str] = &["DAE:UPDATERUN", "DAE:STORERUN", "DAE:SAVERUN", "DAE:SNAPSHOTCRPT"];

pub fn full(relative: &str) -> String {
    format!("{}{}", PREFIX, relative)
}

pub fn settings() -> Settings {
    Settings {
        instrument: Some("LARMOR".into()),
        log_dir: std::env::temp_dir(),
        connect_timeout_ms: 100,
        io_timeout_ms: 100,
        ..Default::default()
    }
}

pub fn dae_settings_xml() -> String {
    r#"<Cluster>
        <Name>Data Acquisition</Name>
        <String><Name>Wiring Table</Name><Val>wiring.dat</Val></String>
        <String><Name>Detector Table</Name><Val>detector.dat</Val></String>
        <String><Name>Spectra Table</Name><Val>spectra.dat</Val></String>
        <I32><Name>Monitor Spectrum</Name><Val>1</Val></I32>
        <DBL><Name>from</Name><Val>0.0</Val></DBL>
        <DBL><Name>to</Name><Val>0.0</Val></DBL>
        <EW><Name>DAETimingSource</Name><Val>0</Val></EW>
        <EW><Name>SMP (Chopper) Veto</Name><Val>0</Val></EW>
        <EW><Name>TS2 Pulse Veto</Name><Val>0</Val></EW>
        <EW><Name>ISIS 50Hz Veto</Name><Val>0</Val></EW>
        <EW><Name>Veto 0</Name><Val>0</Val></EW>
        <EW><Name>Veto 1</Name><Val>0</Val></EW>
        <EW><Name>Veto 2</Name><Val>0</Val></EW>
        <EW><Name>Veto 3</Name><Val>0</Val></EW>
        <EW><Name>Fermi Chopper Veto</Name><Val>0</Val></EW>
        <DBL><Name>FC Delay</Name><Val>0.0</Val></DBL>
        <DBL><Name>FC Width</Name><Val>0.0</Val></DBL>
    </Cluster>"#
        .to_string()
}

pub fn tcb_settings_xml() -> String {
    r#"<Cluster>
        <Name>Time Channels</Name>
        <String><Name>Time Channel File</Name><Val></Val></String>
        <DBL><Name>TR1 From 1</Name><Val>0.0</Val></DBL>
        <DBL><Name>TR1 To 1</Name><Val>0.0</Val></DBL>
        <DBL><Name>TR1 Steps 1</Name><Val>0.0</Val></DBL>
        <U16><Name>TR1 In Mode 1</Name><Val>1</Val></U16>
    </Cluster>"#
        .to_string()
}

pub fn period_settings_xml() -> String {
    r#"<Cluster>
        <Name>Hardware Periods</Name>
        <I32><Name>Number Of Software Periods</Name><Val>1</Val></I32>
        <EW><Name>Period Type</Name><Val>0</Val></EW>
        <EW><Name>Period Setup Source</Name><Val>0</Val></EW>
        <String><Name>Period File</Name><Val></Val></String>
        <I32><Name>Hardware Period Sequences</Name><Val>0</Val></I32>
        <I32><Name>Output Delay (us)</Name><Val>0</Val></I32>
        <EW><Name>Type 1</Name><Val>1</Val></EW>
        <I32><Name>Frames 1</Name><Val>0</Val></I32>
        <I32><Name>Output 1</Name><Val>0</Val></I32>
        <String><Name>Label 1</Name><Val></Val></String>
        <EW><Name>Type 2</Name><Val>0</Val></EW>
        <I32><Name>Frames 2</Name><Val>0</Val></I32>
        <I32><Name>Output 2</Name><Val>0</Val></I32>
        <String><Name>Label 2</Name><Val></Val></String>
    </Cluster>"#
        .to_string()
}

/// Seed the channel table every test needs: run-state machinery, counters,
/// settings blobs and the block server list.
pub async fn seed_dae(t: &MemoryTransport, blocks: &[(&str, f64)]) {
    t.insert(&full("DAE:RUNSTATE"), "SETUP").await;
    t.insert(&full("DAE:STATE:TRANS"), 0_i64).await;
    t.insert(&full("DAE:ERRMSGS"), "").await;
    t.insert(&full("DAE:ALLMSGS"), "").await;
    t.insert(&full("DAE:RUNNUMBER"), "123456").await;
    t.insert(&full("DAE:PERIOD"), 1_i64).await;
    t.insert(&full("DAE:PERIOD:SP"), 1_i64).await;
    t.insert(&full("DAE:NUMPERIODS"), 4_i64).await;
    t.insert(&full("DAE:GOODUAH"), 0.0).await;
    t.insert(&full("DAE:GOODUAH_PD"), 0.0).await;
    t.insert(&full("DAE:GOODFRAMES"), 0_i64).await;
    t.insert(&full("DAE:GOODFRAMES_PD"), 0_i64).await;
    t.insert(&full("DAE:RAWFRAMES"), 0_i64).await;
    t.insert(&full("DAE:RAWFRAMES_PD"), 0_i64).await;
    t.insert(&full("DAE:TITLE"), "").await;
    t.insert(&full("DAE:TITLE:SP"), "").await;
    t.insert(&full("DAE:USERNAME"), "").await;
    t.insert(&full("DAE:USERNAME:SP"), "").await;
    t.insert(&full("CS:MOT:MOVING"), 0_i64).await;

    for (trigger, _) in TRIGGERS {
        t.insert(&full(trigger), -1_i64).await;
        t.insert(&format!("{}.SEVR", full(trigger)), "NO_ALARM").await;
    }
    for trigger in TRANSIENTS {
        t.insert(&full(trigger), -1_i64).await;
        t.insert(&format!("{}.SEVR", full(trigger)), "NO_ALARM").await;
    }

    t.insert(
        &full("DAE:DAESETTINGS"),
        compress_and_hex(dae_settings_xml().as_bytes()),
    )
    .await;
    t.insert(&full("DAE:DAESETTINGS:SP"), "").await;
    t.insert(
        &full("DAE:TCBSETTINGS"),
        compress_and_hex(tcb_settings_xml().as_bytes()),
    )
    .await;
    t.insert(&full("DAE:TCBSETTINGS:SP"), "").await;
    t.insert(
        &full("DAE:HARDWAREPERIODS"),
        compress_and_hex(period_settings_xml().as_bytes()),
    )
    .await;
    t.insert(&full("DAE:HARDWAREPERIODS:SP"), "").await;

    let names: Vec<&str> = blocks.iter().map(|(n, _)| *n).collect();
    let payload = serde_json::to_string(&names).unwrap();
    t.insert(
        &full("CS:BLOCKSERVER:BLOCKNAMES"),
        compress_and_hex(payload.as_bytes()),
    )
    .await;
    for (name, value) in blocks {
        t.insert(&full(&format!("CS:SB:{}", name)), *value).await;
        t.insert(&format!("{}.SEVR", full(&format!("CS:SB:{}", name))), "NO_ALARM")
            .await;
        t.insert(&format!("{}.LVIO", full(&format!("CS:SB:{}", name))), 0_i64)
            .await;
    }
}

/// Play the DAE: watch trigger channels and move the run state.
pub fn spawn_fake_dae(t: MemoryTransport) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            for (trigger, state) in TRIGGERS {
                let channel = full(trigger);
                if let Some(value) = t.raw(&channel).await {
                    if value.as_i64().unwrap_or(-1) >= 0 {
                        t.poke(&channel, -1_i64).await;
                        t.poke(&full("DAE:RUNSTATE"), *state).await;
                    }
                }
            }
            for trigger in TRANSIENTS {
                let channel = full(trigger);
                if let Some(value) = t.raw(&channel).await {
                    let fired = match value {
                        PvValue::Int(i) => i >= 0,
                        PvValue::Str(ref s) => !s.is_empty(),
                        _ => false,
                    };
                    if fired {
                        t.poke(&channel, -1_i64).await;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
}

/// A live backend over a fresh seeded table with the fake DAE running.
pub async fn live_fixture(blocks: &[(&str, f64)]) -> (Backend, MemoryTransport) {
    let transport = MemoryTransport::new();
    seed_dae(&transport, blocks).await;
    spawn_fake_dae(transport.clone());
    let shared: Arc<dyn ChannelTransport> = Arc::new(transport.clone());
    let backend = live_backend(shared, PvPrefix::resolve("LARMOR"), &settings());
    (backend, transport)
}
