//! Live block service over the in-memory channel table.

mod common;

use common::{full, live_fixture};
use std::time::Duration;

use beamctl::backend::SetBlockOptions;
use beamctl::error::CtlError;
use beamctl::transport::PvValue;

#[tokio::test]
async fn test_resolve_is_case_insensitive_and_idempotent() {
    let (backend, _t) = live_fixture(&[("Temp1", 300.0), ("Field", 0.5)]).await;

    let once = backend.blocks.resolve("tEmP1", false).await.unwrap();
    assert_eq!(once, "Temp1");
    let twice = backend.blocks.resolve(&once, false).await.unwrap();
    assert_eq!(twice, once);

    assert!(backend.blocks.exists("FIELD").await.unwrap());
    assert!(!backend.blocks.exists("nope").await.unwrap());
}

#[tokio::test]
async fn test_resolve_with_prefix() {
    let (backend, _t) = live_fixture(&[("Temp1", 300.0)]).await;
    assert_eq!(
        backend.blocks.resolve("temp1", true).await.unwrap(),
        "IN:LARMOR:CS:SB:Temp1"
    );
}

#[tokio::test]
async fn test_unknown_block_is_argument_error() {
    let (backend, _t) = live_fixture(&[]).await;
    assert!(matches!(
        backend.blocks.get("ghost").await,
        Err(CtlError::UnknownBlock(name)) if name == "ghost"
    ));
}

#[tokio::test]
async fn test_set_prefers_setpoint_channel() {
    let (backend, transport) = live_fixture(&[("Temp", 10.0)]).await;
    transport.insert(&full("CS:SB:Temp:SP"), 0.0).await;

    backend
        .blocks
        .set("temp", 300.0.into(), &SetBlockOptions::default())
        .await
        .unwrap();

    assert_eq!(
        transport.raw(&full("CS:SB:Temp:SP")).await,
        Some(PvValue::Float(300.0))
    );
    // The readback channel was left alone.
    assert_eq!(
        transport.raw(&full("CS:SB:Temp")).await,
        Some(PvValue::Float(10.0))
    );
}

#[tokio::test]
async fn test_set_falls_back_to_block_channel() {
    let (backend, transport) = live_fixture(&[("Temp", 10.0)]).await;
    backend
        .blocks
        .set("temp", 300.0.into(), &SetBlockOptions::default())
        .await
        .unwrap();
    assert_eq!(
        transport.raw(&full("CS:SB:Temp")).await,
        Some(PvValue::Float(300.0))
    );
}

#[tokio::test]
async fn test_set_strips_field_suffix() {
    let (backend, transport) = live_fixture(&[("Temp", 10.0)]).await;
    transport.insert(&full("CS:SB:Temp:SP"), 0.0).await;
    backend
        .blocks
        .set("temp.VAL", 42.0.into(), &SetBlockOptions::default())
        .await
        .unwrap();
    assert_eq!(
        transport.raw(&full("CS:SB:Temp:SP")).await,
        Some(PvValue::Float(42.0))
    );
}

#[tokio::test]
async fn test_wait_and_runcontrol_rejected() {
    let (backend, _t) = live_fixture(&[("Temp", 10.0)]).await;
    let opts = SetBlockOptions {
        runcontrol: Some(true),
        wait: true,
        ..Default::default()
    };
    assert!(matches!(
        backend.blocks.set("temp", 1.0.into(), &opts).await,
        Err(CtlError::WaitWithRunControl)
    ));
}

#[tokio::test]
async fn test_runcontrol_written_with_swapped_limits() {
    let (backend, transport) = live_fixture(&[("Temp", 10.0)]).await;
    transport.insert(&full("CS:SB:Temp:RC:ENABLE"), 0_i64).await;
    transport.insert(&full("CS:SB:Temp:RC:LOW"), 0.0).await;
    transport.insert(&full("CS:SB:Temp:RC:HIGH"), 0.0).await;

    // Limits arrive swapped; they are auto-corrected.
    let opts = SetBlockOptions {
        runcontrol: Some(true),
        low: Some(301.0),
        high: Some(299.0),
        ..Default::default()
    };
    backend.blocks.set("temp", 300.0.into(), &opts).await.unwrap();

    assert_eq!(
        transport.raw(&full("CS:SB:Temp:RC:ENABLE")).await,
        Some(PvValue::Int(1))
    );
    assert_eq!(
        transport.raw(&full("CS:SB:Temp:RC:LOW")).await,
        Some(PvValue::Float(299.0))
    );
    assert_eq!(
        transport.raw(&full("CS:SB:Temp:RC:HIGH")).await,
        Some(PvValue::Float(301.0))
    );
}

#[tokio::test]
async fn test_set_with_wait_blocks_until_in_band() {
    let (backend, transport) = live_fixture(&[("Temp", 0.0)]).await;
    transport.insert(&full("CS:SB:Temp:SP"), 0.0).await;

    // The "instrument" follows the setpoint after a delay.
    let follower = {
        let t = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            t.poke(&full("CS:SB:Temp"), 300.0).await;
        })
    };

    let started = std::time::Instant::now();
    let opts = SetBlockOptions {
        low: Some(299.0),
        high: Some(301.0),
        wait: true,
        ..Default::default()
    };
    backend.blocks.set("temp", 300.0.into(), &opts).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(600));
    follower.await.unwrap();
}

#[tokio::test]
async fn test_set_multiple_writes_each() {
    let (backend, transport) = live_fixture(&[("A", 0.0), ("B", 0.0)]).await;
    backend
        .blocks
        .set_multiple(&[("a".into(), 1.0.into()), ("b".into(), 2.0.into())])
        .await
        .unwrap();
    assert_eq!(transport.raw(&full("CS:SB:A")).await, Some(PvValue::Float(1.0)));
    assert_eq!(transport.raw(&full("CS:SB:B")).await, Some(PvValue::Float(2.0)));
}

#[tokio::test]
async fn test_check_alarms_partitions_and_skips_unreachable() {
    let (backend, transport) = live_fixture(&[("A", 0.0), ("B", 0.0), ("C", 0.0)]).await;
    transport.poke(&format!("{}.SEVR", full("CS:SB:A")), "MINOR").await;
    transport.poke(&format!("{}.SEVR", full("CS:SB:B")), "MAJOR").await;
    transport.remove(&format!("{}.SEVR", full("CS:SB:C"))).await;

    let lists = backend
        .blocks
        .check_alarms(&["a".into(), "b".into(), "c".into(), "ghost".into()])
        .await
        .unwrap();
    assert_eq!(lists.minor, vec!["A"]);
    assert_eq!(lists.major, vec!["B"]);
}

#[tokio::test]
async fn test_check_limit_violations() {
    let (backend, transport) = live_fixture(&[("A", 0.0), ("B", 0.0)]).await;
    transport.poke(&format!("{}.LVIO", full("CS:SB:B")), 1_i64).await;
    let violating = backend
        .blocks
        .check_limit_violations(&["a".into(), "b".into()])
        .await
        .unwrap();
    assert_eq!(violating, vec!["B"]);
}

#[tokio::test]
async fn test_enum_channel_write_by_label() {
    let (backend, transport) = live_fixture(&[]).await;
    transport
        .insert_enum(&full("DAE:VETO:FIFO:ENABLE"), &["Disabled", "Enabled"], 0)
        .await;

    // Write through the raw transport path the way set_pv does.
    use beamctl::transport::ChannelTransport;
    transport
        .set(
            &full("DAE:VETO:FIFO:ENABLE"),
            "ENABLED".into(),
            true,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
    assert_eq!(
        transport.raw(&full("DAE:VETO:FIFO:ENABLE")).await,
        Some(PvValue::Int(1))
    );

    match transport
        .set(
            &full("DAE:VETO:FIFO:ENABLE"),
            "maybe".into(),
            true,
            Duration::from_millis(100),
        )
        .await
    {
        Err(CtlError::InvalidEnumString { choices, .. }) => {
            assert_eq!(choices, vec!["Disabled", "Enabled"]);
        }
        other => panic!("expected InvalidEnumString, got {:?}", other.err()),
    }
    let _ = backend;
}
