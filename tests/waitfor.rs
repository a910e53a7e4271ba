//! Wait-engine semantics: conjunction vs disjunction, timeouts, run-state
//! and motion waits.

mod common;

use common::{full, live_fixture};
use std::time::Duration;

use beamctl::backend::sim::SimBackend;
use beamctl::backend::{BeginOptions, WaitSpec};
use beamctl::dae::RunState;
use beamctl::error::CtlError;

#[tokio::test]
async fn test_any_clause_returns_at_earliest() {
    // Frames climb 0 -> ~100 over a second; uamps stay far from 100.
    let sim = SimBackend::new();
    let backend = sim.backend();
    backend.dae.begin(&BeginOptions::default()).await.unwrap();

    let started = std::time::Instant::now();
    backend
        .waits
        .start_waiting(&WaitSpec {
            frames: Some(50),
            uamps: Some(100.0),
            wait_all: false,
            ..Default::default()
        })
        .await
        .unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");
}

#[tokio::test]
async fn test_all_clauses_require_every_condition() {
    let sim = SimBackend::new();
    let backend = sim.backend();
    backend.dae.begin(&BeginOptions::default()).await.unwrap();

    // uamps=100 is unreachable in this test; the conjunction only ends at
    // the maxwait bound, which is a printed note and a normal return.
    let started = std::time::Instant::now();
    backend
        .waits
        .start_waiting(&WaitSpec {
            frames: Some(50),
            uamps: Some(100.0),
            wait_all: true,
            maxwait: Some(Duration::from_millis(1200)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(1100));
}

#[tokio::test]
async fn test_wait_without_clauses_is_an_error() {
    let sim = SimBackend::new();
    let backend = sim.backend();
    assert!(matches!(
        backend.waits.start_waiting(&WaitSpec::default()).await,
        Err(CtlError::NothingToWaitFor)
    ));
}

#[tokio::test]
async fn test_block_band_needs_limits() {
    let sim = SimBackend::new();
    sim.add_block("Temp", 10.0).await;
    let backend = sim.backend();
    assert!(matches!(
        backend
            .waits
            .start_waiting(&WaitSpec {
                block: Some("temp".into()),
                ..Default::default()
            })
            .await,
        Err(CtlError::BandWithoutLimits)
    ));
}

#[tokio::test]
async fn test_value_without_limits_pins_band() {
    let sim = SimBackend::new();
    sim.add_block("Temp", 42.0).await;
    let backend = sim.backend();
    // low = high = value, already satisfied.
    backend
        .waits
        .start_waiting(&WaitSpec {
            block: Some("temp".into()),
            value: Some(42.0),
            ..Default::default()
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_swapped_limits_auto_swap() {
    let sim = SimBackend::new();
    sim.add_block("Temp", 50.0).await;
    let backend = sim.backend();
    backend
        .waits
        .start_waiting(&WaitSpec {
            block: Some("temp".into()),
            low: Some(60.0),
            high: Some(40.0),
            ..Default::default()
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_clock_time_overrides_scalars() {
    let sim = SimBackend::new();
    let backend = sim.backend();
    let started = std::time::Instant::now();
    backend
        .waits
        .start_waiting(&WaitSpec {
            // The hour scalar would wait forever; the clock form wins.
            hours: Some(10.0),
            time: Some("00:00:01".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(3000), "{elapsed:?}");
}

#[tokio::test]
async fn test_bad_clock_time_is_an_error() {
    let sim = SimBackend::new();
    let backend = sim.backend();
    assert!(matches!(
        backend
            .waits
            .start_waiting(&WaitSpec {
                time: Some("in a minute".into()),
                ..Default::default()
            })
            .await,
        Err(CtlError::NotNumeric { .. })
    ));
}

#[tokio::test]
async fn test_runstate_wait_entry_and_exit() {
    let (backend, transport) = live_fixture(&[]).await;

    // Entry: already in SETUP, returns immediately.
    backend
        .waits
        .wait_for_runstate(RunState::Setup, Duration::from_secs(5), false)
        .await
        .unwrap();

    // Exit: flips to RUNNING shortly after.
    let flipper = {
        let t = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            t.poke(&full("DAE:RUNSTATE"), "RUNNING").await;
        })
    };
    let started = std::time::Instant::now();
    backend
        .waits
        .wait_for_runstate(RunState::Setup, Duration::from_secs(10), true)
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    flipper.await.unwrap();
}

#[tokio::test]
async fn test_runstate_exit_waits_out_transition() {
    let (backend, transport) = live_fixture(&[]).await;
    transport.poke(&full("DAE:RUNSTATE"), "BEGINNING").await;
    transport.poke(&full("DAE:STATE:TRANS"), 1_i64).await;

    let settler = {
        let t = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            t.poke(&full("DAE:RUNSTATE"), "RUNNING").await;
            t.poke(&full("DAE:STATE:TRANS"), 0_i64).await;
        })
    };
    let started = std::time::Instant::now();
    backend
        .waits
        .wait_for_runstate(RunState::Setup, Duration::from_secs(10), true)
        .await
        .unwrap();
    // Did not return while the transition flag was up.
    assert!(started.elapsed() >= Duration::from_millis(400));
    settler.await.unwrap();
}

#[tokio::test]
async fn test_global_move_wait() {
    let (backend, transport) = live_fixture(&[]).await;
    transport.poke(&full("CS:MOT:MOVING"), 2_i64).await;

    let motors = {
        let t = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            t.poke(&full("CS:MOT:MOVING"), 0_i64).await;
        })
    };
    let started = std::time::Instant::now();
    let alarms = backend
        .waits
        .wait_for_move(None, Duration::from_secs(2), None)
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(alarms.minor.is_empty() && alarms.major.is_empty());
    motors.await.unwrap();
}

#[tokio::test]
async fn test_block_move_wait_collects_alarms_and_skips_missing() {
    let (backend, transport) = live_fixture(&[("Motor1", 0.0), ("Motor2", 0.0)]).await;
    transport
        .insert(&format!("{}.DMOV", full("CS:SB:Motor1")), 0_i64)
        .await;
    transport
        .insert(&format!("{}.DMOV", full("CS:SB:Motor2")), 1_i64)
        .await;
    transport
        .poke(&format!("{}.SEVR", full("CS:SB:Motor2")), "MINOR")
        .await;

    let finisher = {
        let t = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            t.poke(&format!("{}.DMOV", full("CS:SB:Motor1")), 1_i64).await;
        })
    };

    let alarms = backend
        .waits
        .wait_for_move(
            Some(&["motor1".into(), "motor2".into(), "ghost".into()]),
            Duration::from_secs(2),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(alarms.minor, vec!["Motor2"]);
    assert!(alarms.major.is_empty());
    finisher.await.unwrap();
}
