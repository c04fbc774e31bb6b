//! teamsyncd end-to-end tests against the in-memory store and scripted
//! link source.

use pretty_assertions::assert_eq;
use sonic_syncd_common::{
    DbId, DumpKind, EventLoop, KernelEvent, LinkEvent, LoopSettings, MemoryStore,
    MockEventSource, NetlinkGroup, ShutdownFlag, StoreOp, SyncdConfig, field_values,
};
use sonic_teamsyncd::{LAG_MEMBER_TABLE, LAG_TABLE, TEAM_DEFAULTS, TeamSync};
use std::time::Duration;

fn team(ifindex: u32, name: &str) -> LinkEvent {
    LinkEvent {
        kind: Some("team".to_string()),
        admin_up: true,
        oper_up: true,
        mtu: Some(9100),
        ..LinkEvent::new(ifindex, name)
    }
}

fn member(ifindex: u32, name: &str, master: u32) -> LinkEvent {
    LinkEvent {
        master: Some(master),
        admin_up: true,
        oper_up: true,
        ..LinkEvent::new(ifindex, name)
    }
}

fn event_loop(
    store: &MemoryStore,
    source: &MockEventSource,
    shutdown: &ShutdownFlag,
) -> EventLoop<TeamSync<MemoryStore>, MockEventSource> {
    let config = SyncdConfig::default().with_daemon_defaults(TEAM_DEFAULTS);
    EventLoop::new(
        TeamSync::new(store.clone(), &config),
        source.clone(),
        LoopSettings::from_config(&config),
        shutdown.clone(),
    )
    .unwrap()
}

fn stop_after(shutdown: &ShutdownFlag, after: Duration) {
    let flag = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        flag.set();
    });
}

/// Cold start: new, repeated, deleted and re-deleted `eth0`.
#[tokio::test(start_paused = true)]
async fn test_eth0_cold_start_lifecycle() {
    let store = MemoryStore::new();
    let source = MockEventSource::new();
    let shutdown = ShutdownFlag::new();
    let mut event_loop = event_loop(&store, &source, &shutdown);

    let feeder = source.clone();
    let observer = store.clone();
    let flag = shutdown.clone();
    let script = tokio::spawn(async move {
        let step = Duration::from_millis(1500);
        let mut seen = Vec::new();

        feeder.push(KernelEvent::NewLink(team(5, "eth0")));
        tokio::time::sleep(step).await;
        seen.push(observer.ops().len());

        feeder.push(KernelEvent::NewLink(team(5, "eth0")));
        tokio::time::sleep(step).await;
        seen.push(observer.ops().len());

        feeder.push(KernelEvent::DelLink(team(5, "eth0")));
        tokio::time::sleep(step).await;
        seen.push(observer.ops().len());

        feeder.push(KernelEvent::DelLink(team(5, "eth0")));
        tokio::time::sleep(step).await;
        seen.push(observer.ops().len());

        flag.set();
        seen
    });

    event_loop.run().await.unwrap();
    let seen = script.await.unwrap();

    assert_eq!(seen, vec![1, 1, 2, 2]);
    assert_eq!(source.groups(), vec![NetlinkGroup::Link]);
    assert_eq!(source.dumps(), vec![DumpKind::Links]);
    assert!(event_loop.daemon().teams().is_empty());
    assert_eq!(
        store.ops(),
        vec![
            StoreOp::Set {
                db: DbId::ApplDb,
                table: LAG_TABLE.into(),
                key: "eth0".into(),
                fields: field_values([
                    ("admin_status", "up"),
                    ("oper_status", "up"),
                    ("mtu", "9100"),
                ]),
            },
            StoreOp::Del {
                db: DbId::ApplDb,
                table: LAG_TABLE.into(),
                key: "eth0".into(),
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_warm_restart_uses_configured_timer() {
    let store = MemoryStore::new();
    store.preload(
        DbId::StateDb,
        "WARM_RESTART_ENABLE_TABLE",
        "system",
        field_values([("enable", "true")]),
    );
    store.preload(
        DbId::ConfigDb,
        "WARM_RESTART",
        "teamd",
        field_values([("teamsyncd_timer", "10")]),
    );
    let lag = field_values([("admin_status", "up"), ("oper_status", "up"), ("mtu", "9100")]);
    store.preload(DbId::ApplDb, LAG_TABLE, "PortChannel0001", lag.clone());
    store.preload(DbId::ApplDb, LAG_TABLE, "PortChannel0009", lag);
    store.preload(
        DbId::ApplDb,
        LAG_MEMBER_TABLE,
        "PortChannel0001:Ethernet0",
        field_values([("status", "enabled")]),
    );

    let source = MockEventSource::new();
    source.set_kernel_state(vec![
        KernelEvent::NewLink(team(10, "PortChannel0001")),
        KernelEvent::NewLink(member(2, "Ethernet0", 10)),
        KernelEvent::NewLink(member(3, "Ethernet4", 10)),
    ]);
    let shutdown = ShutdownFlag::new();

    let observer = store.clone();
    let early_writes = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(9)).await;
        observer.ops_in(DbId::ApplDb).len()
    });
    stop_after(&shutdown, Duration::from_secs(15));

    let mut event_loop = event_loop(&store, &source, &shutdown);
    event_loop.run().await.unwrap();

    assert_eq!(early_writes.await.unwrap(), 0);
    assert_eq!(
        store.keys(DbId::ApplDb, LAG_TABLE),
        vec!["PortChannel0001"]
    );
    assert_eq!(
        store.keys(DbId::ApplDb, LAG_MEMBER_TABLE),
        vec!["PortChannel0001:Ethernet0", "PortChannel0001:Ethernet4"]
    );
    assert_eq!(
        store
            .record(DbId::StateDb, "WARM_RESTART_TABLE", "teamsyncd")
            .unwrap()["state"],
        "reconciled"
    );
}
