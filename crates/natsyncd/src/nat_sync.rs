//! Conntrack to APPL_DB NAT projection
//!
//! Every conntrack entry carrying `IPS_SRC_NAT` and/or `IPS_DST_NAT` maps to
//! one record in one of four tables:
//!
//! | protocol  | SNAT or DNAT   | SNAT and DNAT       |
//! |-----------|----------------|---------------------|
//! | TCP / UDP | `NAPT_TABLE`   | `NAPT_TWICE_TABLE`  |
//! | ICMP      | `NAT_TABLE`    | `NAT_TWICE_TABLE`   |
//!
//! TCP entries are published only once the connection is assured. A
//! conntrack DELETE removes the record the same entry would have produced.

use async_trait::async_trait;
use sonic_syncd_common::event::{ct_status, ip_proto};
use sonic_syncd_common::{
    ConntrackEvent, DaemonDefaults, DbId, Dispatcher, DumpKind, EventKind, FieldValues,
    KernelEvent, NetlinkGroup, RestoreSignal, Result, ShutdownFlag, StoreClient, SyncDaemon,
    SyncEngine, SyncdConfig, TableKey, WarmRestart, field_values,
};
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

pub const APP_NAME: &str = "natsyncd";
pub const DOCKER_NAME: &str = "nat";

pub const NAPT_TABLE: &str = "NAPT_TABLE";
pub const NAT_TABLE: &str = "NAT_TABLE";
pub const NAPT_TWICE_TABLE: &str = "NAPT_TWICE_TABLE";
pub const NAT_TWICE_TABLE: &str = "NAT_TWICE_TABLE";

/// STATE_DB record set once the kernel conntrack table has been restored.
pub const NAT_RESTORE_TABLE: &str = "NAT_RESTORE_TABLE";
const NAT_RESTORE_KEY: &str = "Flags";

const PORT_TABLE: &str = "PORT_TABLE";
const PORT_INIT_DONE_KEY: &str = "PortInitDone";

/// natsyncd settings used when the config file leaves them unset.
pub const NAT_DEFAULTS: DaemonDefaults = DaemonDefaults {
    reconcile_timer_secs: 30,
    restore_wait_timeout_secs: 180,
    restore_poll_interval_ms: 1000,
    // Idle entries are re-queried from conntrack after a minute.
    aging_periods: 60,
};

/// Record produced by one conntrack entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRecord {
    pub key: TableKey,
    pub fields: FieldValues,
}

fn ipv4_only(event: &ConntrackEvent) -> bool {
    [
        event.orig.src,
        event.orig.dst,
        event.reply.src,
        event.reply.dst,
    ]
    .iter()
    .all(IpAddr::is_ipv4)
}

fn proto_name(protocol: u8) -> Option<&'static str> {
    match protocol {
        ip_proto::TCP => Some("TCP"),
        ip_proto::UDP => Some("UDP"),
        _ => None,
    }
}

fn port(port: Option<u16>) -> Option<String> {
    port.map(|p| p.to_string())
}

/// Project a conntrack entry to its NAT record.
///
/// Returns `None` for entries that are not IPv4, carry no NAT flag, use an
/// unsupported protocol or miss a port.
pub fn project(event: &ConntrackEvent) -> Option<NatRecord> {
    if !ipv4_only(event) {
        return None;
    }

    let (orig, reply) = (&event.orig, &event.reply);
    let record = match (event.is_snat(), event.is_dnat()) {
        (false, false) => return None,
        (snat, dnat) if event.protocol == ip_proto::ICMP => {
            if snat && dnat {
                NatRecord {
                    key: TableKey::new(NAT_TWICE_TABLE, format!("{}:{}", orig.src, orig.dst)),
                    fields: field_values([
                        ("translated_src_ip", reply.dst.to_string()),
                        ("translated_dst_ip", reply.src.to_string()),
                        ("entry_type", "dynamic".to_string()),
                    ]),
                }
            } else if snat {
                NatRecord {
                    key: TableKey::new(NAT_TABLE, orig.src.to_string()),
                    fields: field_values([
                        ("translated_ip", reply.dst.to_string()),
                        ("nat_type", "snat".to_string()),
                        ("entry_type", "dynamic".to_string()),
                    ]),
                }
            } else {
                NatRecord {
                    key: TableKey::new(NAT_TABLE, orig.dst.to_string()),
                    fields: field_values([
                        ("translated_ip", reply.src.to_string()),
                        ("nat_type", "dnat".to_string()),
                        ("entry_type", "dynamic".to_string()),
                    ]),
                }
            }
        }
        (snat, dnat) => {
            let proto = proto_name(event.protocol)?;
            let orig_sport = port(orig.src_port)?;
            let orig_dport = port(orig.dst_port)?;
            let reply_sport = port(reply.src_port)?;
            let reply_dport = port(reply.dst_port)?;

            if snat && dnat {
                NatRecord {
                    key: TableKey::new(
                        NAPT_TWICE_TABLE,
                        format!(
                            "{}:{}:{}:{}:{}",
                            proto, orig.src, orig_sport, orig.dst, orig_dport
                        ),
                    ),
                    fields: field_values([
                        ("translated_src_ip", reply.dst.to_string()),
                        ("translated_src_l4_port", reply_dport),
                        ("translated_dst_ip", reply.src.to_string()),
                        ("translated_dst_l4_port", reply_sport),
                        ("entry_type", "dynamic".to_string()),
                    ]),
                }
            } else if snat {
                NatRecord {
                    key: TableKey::new(
                        NAPT_TABLE,
                        format!("{}:{}:{}", proto, orig.src, orig_sport),
                    ),
                    fields: field_values([
                        ("translated_ip", reply.dst.to_string()),
                        ("translated_l4_port", reply_dport),
                        ("nat_type", "snat".to_string()),
                        ("entry_type", "dynamic".to_string()),
                    ]),
                }
            } else {
                NatRecord {
                    key: TableKey::new(
                        NAPT_TABLE,
                        format!("{}:{}:{}", proto, orig.dst, orig_dport),
                    ),
                    fields: field_values([
                        ("translated_ip", reply.src.to_string()),
                        ("translated_l4_port", reply_sport),
                        ("nat_type", "dnat".to_string()),
                        ("entry_type", "dynamic".to_string()),
                    ]),
                }
            }
        }
    };
    Some(record)
}

/// NAT synchronization daemon state.
pub struct NatSync<S> {
    engine: SyncEngine<S>,
    port_init_timeout: Duration,
    poll_interval: Duration,
}

impl<S: StoreClient> NatSync<S> {
    pub fn new(store: S, config: &SyncdConfig) -> Self {
        Self {
            engine: SyncEngine::new(
                store,
                WarmRestart::new(APP_NAME, DOCKER_NAME),
                &[NAPT_TABLE, NAT_TABLE, NAPT_TWICE_TABLE, NAT_TWICE_TABLE],
                config,
            ),
            port_init_timeout: config.port_init_timeout(),
            poll_interval: config.restore_poll_interval(),
        }
    }

    fn on_conntrack_new(&mut self, event: &KernelEvent) -> Result<()> {
        let KernelEvent::ConntrackNew(ct) = event else {
            return Ok(());
        };
        if ct.protocol == ip_proto::TCP && !ct.has_status(ct_status::IPS_ASSURED) {
            trace!(id = ?ct.id, "TCP connection not assured yet");
            return Ok(());
        }
        match project(ct) {
            Some(record) => {
                debug!(key = %record.key, "NAT entry");
                self.engine.upsert(record.key, record.fields);
            }
            None => debug!(
                protocol = ct.protocol,
                status = ct.status,
                "Ignoring conntrack entry"
            ),
        }
        Ok(())
    }

    fn on_conntrack_delete(&mut self, event: &KernelEvent) -> Result<()> {
        let KernelEvent::ConntrackDelete(ct) = event else {
            return Ok(());
        };
        if let Some(record) = project(ct) {
            debug!(key = %record.key, "NAT entry removed");
            self.engine.remove(&record.key);
        }
        Ok(())
    }

    async fn port_init_done(&mut self) -> bool {
        match self
            .engine
            .store_mut()
            .get(DbId::ApplDb, PORT_TABLE, PORT_INIT_DONE_KEY)
            .await
        {
            Ok(record) => record.is_some(),
            Err(e) => {
                warn!(error = %e, "Failed to read PortInitDone");
                false
            }
        }
    }
}

#[async_trait]
impl<S: StoreClient> SyncDaemon for NatSync<S> {
    type Store = S;

    fn name(&self) -> &str {
        APP_NAME
    }

    fn engine(&self) -> &SyncEngine<S> {
        &self.engine
    }

    fn engine_mut(&mut self) -> &mut SyncEngine<S> {
        &mut self.engine
    }

    fn register_handlers(dispatcher: &mut Dispatcher<Self>) -> Result<()> {
        dispatcher.register(EventKind::ConntrackNew, Self::on_conntrack_new)?;
        dispatcher.register(EventKind::ConntrackDelete, Self::on_conntrack_delete)
    }

    fn groups(&self) -> Vec<NetlinkGroup> {
        vec![
            NetlinkGroup::ConntrackNew,
            NetlinkGroup::ConntrackUpdate,
            NetlinkGroup::ConntrackDestroy,
        ]
    }

    fn dump_kind(&self) -> DumpKind {
        DumpKind::Conntrack
    }

    fn restore_signal(&self) -> RestoreSignal {
        RestoreSignal::store_flag(
            DbId::StateDb,
            NAT_RESTORE_TABLE,
            NAT_RESTORE_KEY,
            "restored",
            "true",
        )
    }

    /// Wait for portsyncd to finish creating the ports. Gives up after the
    /// configured timeout and starts anyway.
    #[instrument(skip_all)]
    async fn before_start(&mut self, shutdown: &ShutdownFlag) -> Result<bool> {
        let deadline = Instant::now() + self.port_init_timeout;
        loop {
            if shutdown.is_set() {
                return Ok(false);
            }
            if self.port_init_done().await {
                info!("Port initialization done");
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    timeout_secs = self.port_init_timeout.as_secs(),
                    "PortInitDone not seen, starting anyway"
                );
                return Ok(true);
            }
            tokio::select! {
                _ = tokio::time::sleep_until((now + self.poll_interval).min(deadline)) => {}
                _ = shutdown.notified() => {}
            }
        }
    }
}
