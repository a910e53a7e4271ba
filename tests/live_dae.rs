//! Live DAE controller against the in-memory channel table.

mod common;

use common::{full, live_fixture};

use beamctl::backend::BeginOptions;
use beamctl::codec::dehex_and_decompress_to_string;
use beamctl::dae::RunState;
use beamctl::error::CtlError;
use beamctl::transport::PvValue;

#[tokio::test]
async fn test_begin_end_round_trip() {
    let (backend, transport) = live_fixture(&[]).await;

    assert_eq!(backend.dae.run_state().await.unwrap(), RunState::Setup);
    backend.dae.begin(&BeginOptions::default()).await.unwrap();
    assert_eq!(backend.dae.run_state().await.unwrap(), RunState::Running);
    backend.dae.end(false).await.unwrap();
    assert_eq!(backend.dae.run_state().await.unwrap(), RunState::Setup);

    // Both transition triggers were consumed by the DAE.
    assert_eq!(
        transport.raw(&full("DAE:BEGINRUNEX")).await,
        Some(PvValue::Int(-1))
    );
    assert_eq!(
        transport.raw(&full("DAE:ENDRUN")).await,
        Some(PvValue::Int(-1))
    );
}

#[tokio::test]
async fn test_begin_outside_setup_raises() {
    let (backend, _transport) = live_fixture(&[]).await;
    backend.dae.begin(&BeginOptions::default()).await.unwrap();
    match backend.dae.begin(&BeginOptions::default()).await {
        Err(CtlError::WrongRunState { verb, state }) => {
            assert_eq!(verb, "begin");
            assert_eq!(state, "RUNNING");
        }
        other => panic!("expected WrongRunState, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn test_begin_paused_encodes_bitfield() {
    // No fake DAE here: drive the instrument side by hand so the trigger
    // value can be observed before anything consumes it.
    let transport = beamctl::transport::MemoryTransport::new();
    common::seed_dae(&transport, &[]).await;
    let shared: std::sync::Arc<dyn beamctl::transport::ChannelTransport> =
        std::sync::Arc::new(transport.clone());
    let backend = beamctl::backend::live::live_backend(
        shared,
        beamctl::identity::PvPrefix::resolve("LARMOR"),
        &common::settings(),
    );

    let beginner = tokio::spawn(async move {
        backend
            .dae
            .begin(&BeginOptions {
                paused: true,
                delayed: true,
                ..Default::default()
            })
            .await
    });

    // Wait for the trigger write, then play the DAE.
    let value = loop {
        if let Some(PvValue::Int(v)) = transport.raw(&full("DAE:BEGINRUNEX")).await {
            if v >= 0 {
                break v;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    };
    // paused is bit 0, delayed is bit 1
    assert_eq!(value, 3);

    transport.poke(&full("DAE:RUNSTATE"), "PAUSED").await;
    beginner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_transition_surfaces_dae_error() {
    let (backend, transport) = live_fixture(&[]).await;
    transport
        .poke(&format!("{}.SEVR", full("DAE:BEGINRUNEX")), "MAJOR")
        .await;
    transport
        .poke(&full("DAE:ERRMSGS"), "dae refused: tables not loaded")
        .await;

    match backend.dae.begin(&BeginOptions::default()).await {
        Err(CtlError::Dae(message)) => assert!(message.contains("tables not loaded")),
        other => panic!("expected Dae error, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn test_change_monitor_flushes_dae_document_only() {
    let (backend, transport) = live_fixture(&[]).await;

    backend.dae.change_monitor(3, 1000.0, 5000.0).await.unwrap();

    let written = transport
        .raw(&full("DAE:DAESETTINGS:SP"))
        .await
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap();
    let text = dehex_and_decompress_to_string(&written).unwrap();
    assert!(text.contains("<Val>3</Val>"));
    assert!(text.contains("<Val>1000.0</Val>"));
    assert!(text.contains("<Val>5000.0</Val>"));

    // TCB and periods documents were not touched.
    assert_eq!(
        transport.raw(&full("DAE:TCBSETTINGS:SP")).await,
        Some(PvValue::Str(String::new()))
    );
    assert_eq!(
        transport.raw(&full("DAE:HARDWAREPERIODS:SP")).await,
        Some(PvValue::Str(String::new()))
    );
}

#[tokio::test]
async fn test_explicit_change_session_batches_edits() {
    let (backend, transport) = live_fixture(&[]).await;

    backend.dae.change_start().await.unwrap();
    backend.dae.change_monitor(2, 10.0, 90.0).await.unwrap();
    backend.dae.change_sync("smp").await.unwrap();

    // Nothing flushed yet.
    assert_eq!(
        transport.raw(&full("DAE:DAESETTINGS:SP")).await,
        Some(PvValue::Str(String::new()))
    );

    backend.dae.change_finish(false).await.unwrap();
    let written = transport
        .raw(&full("DAE:DAESETTINGS:SP"))
        .await
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap();
    let text = dehex_and_decompress_to_string(&written).unwrap();
    assert!(text.contains("<Val>2</Val>"));
    // smp is ordinal 2 of the sync source enumeration.
    assert!(text.contains("DAETimingSource"));

    // Cache cleared: a second finish writes nothing new.
    transport.poke(&full("DAE:DAESETTINGS:SP"), "").await;
    backend.dae.change_finish(false).await.unwrap();
    assert_eq!(
        transport.raw(&full("DAE:DAESETTINGS:SP")).await,
        Some(PvValue::Str(String::new()))
    );
}

#[tokio::test]
async fn test_change_start_requires_setup() {
    let (backend, _transport) = live_fixture(&[]).await;
    backend.dae.begin(&BeginOptions::default()).await.unwrap();
    assert!(matches!(
        backend.dae.change_start().await,
        Err(CtlError::WrongRunState { .. })
    ));
}

#[tokio::test]
async fn test_change_tcb_writes_tcb_document() {
    let (backend, transport) = live_fixture(&[]).await;

    backend
        .dae
        .change_tcb(Some(5.0), Some(95.0), Some(1.5), 1, true, 1)
        .await
        .unwrap();

    let written = transport
        .raw(&full("DAE:TCBSETTINGS:SP"))
        .await
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap();
    let text = dehex_and_decompress_to_string(&written).unwrap();
    assert!(text.contains("<Val>5.0</Val>"));
    assert!(text.contains("<Val>95.0</Val>"));
    assert!(text.contains("<Val>1.5</Val>"));
    // log mode is ordinal 2
    assert!(text.contains("<Val>2</Val>"));
}

#[tokio::test]
async fn test_define_hard_period_rejects_out_of_range() {
    let (backend, _transport) = live_fixture(&[]).await;
    assert!(matches!(
        backend
            .dae
            .define_hard_period(Some(9), Default::default())
            .await,
        Err(CtlError::PeriodOutOfRange(9))
    ));
}

#[tokio::test]
async fn test_set_period_validates_against_num_periods() {
    let (backend, transport) = live_fixture(&[]).await;
    backend.dae.set_period(3).await.unwrap();
    assert_eq!(
        transport.raw(&full("DAE:PERIOD:SP")).await,
        Some(PvValue::Int(3))
    );
    assert!(matches!(
        backend.dae.set_period(5).await,
        Err(CtlError::InvalidPeriod { period: 5, max: 4 })
    ));
}

#[tokio::test]
async fn test_users_formatted_for_reading() {
    let (backend, transport) = live_fixture(&[]).await;
    transport
        .poke(&full("DAE:USERNAME"), "Alice,Bob,Carol")
        .await;
    assert_eq!(backend.dae.users().await.unwrap(), "Alice, Bob and Carol");
}

#[tokio::test]
async fn test_spectrum_truncated_to_nord() {
    let (backend, transport) = live_fixture(&[]).await;
    transport
        .insert(&full("DAE:SPEC:1:2:X"), vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.0])
        .await;
    transport.insert(&full("DAE:SPEC:1:2:X.NORD"), 4_i64).await;
    transport
        .insert(&full("DAE:SPEC:1:2:Y"), vec![10.0, 20.0, 30.0, 0.0, 0.0, 0.0])
        .await;
    transport.insert(&full("DAE:SPEC:1:2:Y.NORD"), 3_i64).await;

    let spectrum = backend.dae.get_spectrum(2, 1, true).await.unwrap();
    assert_eq!(spectrum.time, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(spectrum.signal, vec![10.0, 20.0, 30.0]);
    assert_eq!(spectrum.sum, None);
}
