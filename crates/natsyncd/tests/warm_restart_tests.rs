//! natsyncd end-to-end tests against the in-memory store and scripted
//! conntrack source.

use pretty_assertions::assert_eq;
use sonic_natsyncd::{NAPT_TABLE, NAT_DEFAULTS, NAT_RESTORE_TABLE, NatSync};
use sonic_syncd_common::event::{ct_status, ip_proto};
use sonic_syncd_common::{
    ConntrackEvent, ConntrackTuple, DbId, DumpKind, EventLoop, KernelEvent, LoopSettings,
    MemoryStore, MockEventSource, NetlinkGroup, ShutdownFlag, StoreOp, SyncError, SyncdConfig,
    field_values,
};
use std::time::Duration;

fn snat(src_port: u16, translated_port: u16) -> KernelEvent {
    KernelEvent::ConntrackNew(ConntrackEvent {
        protocol: ip_proto::UDP,
        orig: ConntrackTuple {
            src: "192.168.1.10".parse().unwrap(),
            dst: "8.8.8.8".parse().unwrap(),
            src_port: Some(src_port),
            dst_port: Some(53),
        },
        reply: ConntrackTuple {
            src: "8.8.8.8".parse().unwrap(),
            dst: "65.55.42.1".parse().unwrap(),
            src_port: Some(53),
            dst_port: Some(translated_port),
        },
        status: ct_status::IPS_SRC_NAT | ct_status::IPS_CONFIRMED,
        id: None,
    })
}

fn napt_fields(translated_port: u16) -> sonic_syncd_common::FieldValues {
    field_values([
        ("translated_ip", "65.55.42.1".to_string()),
        ("translated_l4_port", translated_port.to_string()),
        ("nat_type", "snat".to_string()),
        ("entry_type", "dynamic".to_string()),
    ])
}

fn port_init_done(store: &MemoryStore) {
    store.preload(
        DbId::ApplDb,
        "PORT_TABLE",
        "PortInitDone",
        field_values([("lanes", "0")]),
    );
}

fn enable_warm_restart(store: &MemoryStore) {
    store.preload(
        DbId::StateDb,
        "WARM_RESTART_ENABLE_TABLE",
        "nat",
        field_values([("enable", "true")]),
    );
}

fn event_loop(
    store: &MemoryStore,
    source: &MockEventSource,
    shutdown: &ShutdownFlag,
) -> EventLoop<NatSync<MemoryStore>, MockEventSource> {
    let config = SyncdConfig::default().with_daemon_defaults(NAT_DEFAULTS);
    EventLoop::new(
        NatSync::new(store.clone(), &config),
        source.clone(),
        LoopSettings::from_config(&config),
        shutdown.clone(),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_cold_start_publishes_dump() {
    let store = MemoryStore::new();
    port_init_done(&store);
    let source = MockEventSource::new();
    source.set_kernel_state(vec![snat(5000, 1024)]);
    let shutdown = ShutdownFlag::new();

    let flag = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        flag.set();
    });
    event_loop(&store, &source, &shutdown).run().await.unwrap();

    assert_eq!(
        source.groups(),
        vec![
            NetlinkGroup::ConntrackNew,
            NetlinkGroup::ConntrackUpdate,
            NetlinkGroup::ConntrackDestroy,
        ]
    );
    assert_eq!(source.dumps(), vec![DumpKind::Conntrack]);
    assert_eq!(
        store.record(DbId::ApplDb, NAPT_TABLE, "UDP:192.168.1.10:5000"),
        Some(napt_fields(1024))
    );
}

#[tokio::test(start_paused = true)]
async fn test_warm_restart_reconciles_difference() {
    let store = MemoryStore::new();
    port_init_done(&store);
    enable_warm_restart(&store);
    store.preload(DbId::ApplDb, NAPT_TABLE, "UDP:192.168.1.10:5000", napt_fields(1024));
    store.preload(DbId::ApplDb, NAPT_TABLE, "UDP:192.168.1.10:5001", napt_fields(1025));

    let source = MockEventSource::new();
    source.set_kernel_state(vec![snat(5000, 1024), snat(5002, 1026)]);
    let shutdown = ShutdownFlag::new();

    let writer = store.clone();
    let flag = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        writer.preload(
            DbId::StateDb,
            NAT_RESTORE_TABLE,
            "Flags",
            field_values([("restored", "true")]),
        );
        tokio::time::sleep(Duration::from_secs(60)).await;
        flag.set();
    });

    let mut event_loop = event_loop(&store, &source, &shutdown);
    event_loop.run().await.unwrap();

    assert_eq!(
        store.ops_in(DbId::ApplDb),
        vec![
            StoreOp::Del {
                db: DbId::ApplDb,
                table: NAPT_TABLE.into(),
                key: "UDP:192.168.1.10:5001".into(),
            },
            StoreOp::Set {
                db: DbId::ApplDb,
                table: NAPT_TABLE.into(),
                key: "UDP:192.168.1.10:5002".into(),
                fields: napt_fields(1026),
            },
        ]
    );
    let state = store
        .record(DbId::StateDb, "WARM_RESTART_TABLE", "natsyncd")
        .unwrap();
    assert_eq!(state["state"], "reconciled");
    assert_eq!(state["restore_count"], "1");
}

#[tokio::test(start_paused = true)]
async fn test_restore_timeout_is_fatal_without_writes() {
    let store = MemoryStore::new();
    port_init_done(&store);
    enable_warm_restart(&store);
    store.preload(DbId::ApplDb, NAPT_TABLE, "UDP:192.168.1.10:5000", napt_fields(1024));

    let source = MockEventSource::new();
    source.set_kernel_state(vec![snat(5002, 1026)]);
    let shutdown = ShutdownFlag::new();

    let err = event_loop(&store, &source, &shutdown)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::RestoreTimeout(180)));
    assert!(err.is_fatal());
    assert!(store.ops().is_empty());
    assert!(source.dumps().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_aging_removes_entry_missing_from_conntrack() {
    let store = MemoryStore::new();
    port_init_done(&store);
    let source = MockEventSource::new();
    source.set_kernel_state(vec![snat(5000, 1024), snat(5001, 1025)]);
    let shutdown = ShutdownFlag::new();

    // The destroy notification for 5000 never arrives
    let kernel = source.clone();
    let flag = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        kernel.set_kernel_state(vec![snat(5001, 1025)]);
        tokio::time::sleep(Duration::from_secs(55)).await;
        flag.set();
    });

    event_loop(&store, &source, &shutdown).run().await.unwrap();

    assert_eq!(source.dumps(), vec![DumpKind::Conntrack, DumpKind::Conntrack]);
    assert_eq!(
        store.keys(DbId::ApplDb, NAPT_TABLE),
        vec!["UDP:192.168.1.10:5001"]
    );
    assert_eq!(
        store.ops().last(),
        Some(&StoreOp::Del {
            db: DbId::ApplDb,
            table: NAPT_TABLE.into(),
            key: "UDP:192.168.1.10:5000".into(),
        })
    );
}
