//! Team link to APPL_DB LAG projection
//!
//! Team netdevs become `LAG_TABLE` records keyed by name. Links enslaved to
//! a known team become `LAG_MEMBER_TABLE` records keyed `<team>:<member>`.
//! Teams are tracked by ifindex since RTM_DELLINK and IFLA_MASTER only
//! carry indexes reliably.

use async_trait::async_trait;
use sonic_syncd_common::{
    DaemonDefaults, Dispatcher, DumpKind, EventKind, FieldValues, KernelEvent, LinkEvent,
    NetlinkGroup, Result, StoreClient, SyncDaemon, SyncEngine, SyncdConfig, TableKey,
    WarmRestart, field_values,
};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

pub const APP_NAME: &str = "teamsyncd";
pub const DOCKER_NAME: &str = "teamd";

pub const LAG_TABLE: &str = "LAG_TABLE";
pub const LAG_MEMBER_TABLE: &str = "LAG_MEMBER_TABLE";

/// teamsyncd settings used when the config file leaves them unset.
pub const TEAM_DEFAULTS: DaemonDefaults = DaemonDefaults {
    reconcile_timer_secs: 70,
    restore_wait_timeout_secs: 180,
    restore_poll_interval_ms: 1000,
    aging_periods: 0,
};

/// Link status values
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Down,
}

impl LinkStatus {
    pub fn from_flag(up: bool) -> Self {
        if up { LinkStatus::Up } else { LinkStatus::Down }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Up => "up",
            LinkStatus::Down => "down",
        }
    }
}

/// `LAG_TABLE` fields of a team link.
pub fn lag_fields(link: &LinkEvent) -> FieldValues {
    let mut fields = field_values([
        ("admin_status", LinkStatus::from_flag(link.admin_up).as_str()),
        ("oper_status", LinkStatus::from_flag(link.oper_up).as_str()),
    ]);
    if let Some(mtu) = link.mtu {
        fields.insert("mtu".to_string(), mtu.to_string());
    }
    fields
}

/// `LAG_MEMBER_TABLE` fields of an enslaved link.
pub fn member_fields(link: &LinkEvent) -> FieldValues {
    let status = if link.oper_up { "enabled" } else { "disabled" };
    field_values([("status", status)])
}

pub fn lag_key(team: &str) -> TableKey {
    TableKey::new(LAG_TABLE, team)
}

pub fn member_key(team: &str, member: &str) -> TableKey {
    TableKey::new(LAG_MEMBER_TABLE, format!("{}:{}", team, member))
}

/// Team synchronization daemon state.
pub struct TeamSync<S> {
    engine: SyncEngine<S>,
    /// ifindex → team name
    teams: HashMap<u32, String>,
    /// ifindex → last seen state of every enslaved link
    enslaved: HashMap<u32, LinkEvent>,
    /// member ifindex → published member key
    members: HashMap<u32, TableKey>,
}

impl<S: StoreClient> TeamSync<S> {
    pub fn new(store: S, config: &SyncdConfig) -> Self {
        Self {
            engine: SyncEngine::new(
                store,
                WarmRestart::new(APP_NAME, DOCKER_NAME),
                &[LAG_TABLE, LAG_MEMBER_TABLE],
                config,
            ),
            teams: HashMap::new(),
            enslaved: HashMap::new(),
            members: HashMap::new(),
        }
    }

    /// Teams currently known, by ifindex.
    pub fn teams(&self) -> &HashMap<u32, String> {
        &self.teams
    }

    fn on_new_link(&mut self, event: &KernelEvent) -> Result<()> {
        let KernelEvent::NewLink(link) = event else {
            return Ok(());
        };

        if link.is_team() {
            self.add_team(link);
        } else {
            self.update_member(link);
        }
        Ok(())
    }

    fn on_del_link(&mut self, event: &KernelEvent) -> Result<()> {
        let KernelEvent::DelLink(link) = event else {
            return Ok(());
        };

        if let Some(team) = self.teams.remove(&link.ifindex) {
            info!(team = %team, "Team removed");
            self.engine.remove(&lag_key(&team));
            let gone: Vec<u32> = self
                .members
                .iter()
                .filter(|(_, key)| key.key.starts_with(&format!("{}:", team)))
                .map(|(ifindex, _)| *ifindex)
                .collect();
            for ifindex in gone {
                self.remove_member(ifindex);
            }
        } else {
            self.enslaved.remove(&link.ifindex);
            self.remove_member(link.ifindex);
        }
        Ok(())
    }

    fn add_team(&mut self, link: &LinkEvent) {
        let renamed = self
            .teams
            .insert(link.ifindex, link.ifname.clone())
            .filter(|old| *old != link.ifname);
        if let Some(old) = renamed {
            warn!(old = %old, new = %link.ifname, "Team renamed");
            self.engine.remove(&lag_key(&old));
        }
        debug!(team = %link.ifname, ifindex = link.ifindex, "Team link");
        self.engine.upsert(lag_key(&link.ifname), lag_fields(link));

        // Members reported before their team.
        let pending: Vec<LinkEvent> = self
            .enslaved
            .values()
            .filter(|member| member.master == Some(link.ifindex))
            .cloned()
            .collect();
        for member in &pending {
            self.update_member(member);
        }
    }

    fn update_member(&mut self, link: &LinkEvent) {
        if link.master.is_some() {
            self.enslaved.insert(link.ifindex, link.clone());
        } else {
            self.enslaved.remove(&link.ifindex);
        }

        let key = link
            .master
            .and_then(|master| self.teams.get(&master))
            .map(|team| member_key(team, &link.ifname));

        if self.members.get(&link.ifindex) != key.as_ref() {
            self.remove_member(link.ifindex);
        }
        if let Some(key) = key {
            debug!(member = %key, "Team member");
            self.engine.upsert(key.clone(), member_fields(link));
            self.members.insert(link.ifindex, key);
        }
    }

    fn remove_member(&mut self, ifindex: u32) {
        if let Some(key) = self.members.remove(&ifindex) {
            debug!(member = %key, "Team member removed");
            self.engine.remove(&key);
        }
    }
}

#[async_trait]
impl<S: StoreClient> SyncDaemon for TeamSync<S> {
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
        dispatcher.register(EventKind::NewLink, Self::on_new_link)?;
        dispatcher.register(EventKind::DelLink, Self::on_del_link)
    }

    fn groups(&self) -> Vec<NetlinkGroup> {
        vec![NetlinkGroup::Link]
    }

    fn dump_kind(&self) -> DumpKind {
        DumpKind::Links
    }

    /// Remove every LAG record unless the next start is a warm restart.
    ///
    /// Stopping before reconciliation leaves the store as the previous run
    /// published it; the held deltas are discarded and the next start
    /// reconciles from there.
    #[instrument(skip_all)]
    async fn on_shutdown(&mut self) -> Result<()> {
        let state = self.engine.restart_state();
        if state.is_buffering() {
            info!(%state, "Stopping before reconciliation, skipping LAG cleanup");
            return Ok(());
        }
        match self.engine.detect_warm_start().await {
            Ok(true) => {
                info!("Warm restart enabled, keeping LAG records");
                Ok(())
            }
            Ok(false) => {
                let removed = self.engine.remove_all();
                info!(removed, "Removing LAG records");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Cannot read warm restart flag, keeping LAG records");
                Ok(())
            }
        }
    }
}
