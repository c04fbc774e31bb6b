//! Warm restart flags in CONFIG_DB and STATE_DB
//!
//! ## Tables
//!
//! | DB        | Key                                  | Field            |
//! |-----------|--------------------------------------|------------------|
//! | STATE_DB  | `WARM_RESTART_ENABLE_TABLE\|system`   | `enable`         |
//! | STATE_DB  | `WARM_RESTART_ENABLE_TABLE\|<docker>` | `enable`         |
//! | STATE_DB  | `WARM_RESTART_TABLE\|<app>`           | `state`, `restore_count`, `timestamp` |
//! | CONFIG_DB | `WARM_RESTART\|<docker>`              | `<app>_timer`    |

use crate::driver::ShutdownFlag;
use crate::error::{Result, SyncError};
use crate::store::StoreClient;
use crate::types::{DbId, FieldValues};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub const WARM_RESTART_ENABLE_TABLE: &str = "WARM_RESTART_ENABLE_TABLE";
pub const WARM_RESTART_TABLE: &str = "WARM_RESTART_TABLE";
pub const WARM_RESTART_CONFIG_TABLE: &str = "WARM_RESTART";

/// Progress marker persisted in STATE_DB for an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmStartState {
    /// Snapshot loaded and kernel state restored.
    Restored,
    /// Buffered deltas flushed; the store matches the kernel.
    Reconciled,
}

impl WarmStartState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarmStartState::Restored => "restored",
            WarmStartState::Reconciled => "reconciled",
        }
    }
}

impl fmt::Display for WarmStartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a daemon learns that the kernel finished restoring its own state
/// after a warm restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSignal {
    /// The kernel state never goes away; reconcile may start at once.
    Immediate,
    /// Wait until `table`/`key` field `field` equals `value`.
    StoreFlag {
        db: DbId,
        table: String,
        key: String,
        field: String,
        value: String,
    },
}

impl RestoreSignal {
    pub fn store_flag(
        db: DbId,
        table: impl Into<String>,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        RestoreSignal::StoreFlag {
            db,
            table: table.into(),
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    /// Check the signal once.
    pub async fn is_restored<S: StoreClient>(&self, store: &mut S) -> Result<bool> {
        match self {
            RestoreSignal::Immediate => Ok(true),
            RestoreSignal::StoreFlag {
                db,
                table,
                key,
                field,
                value,
            } => Ok(store.hget(*db, table, key, field).await?.as_deref() == Some(value.as_str())),
        }
    }
}

/// Outcome of [`WarmRestart::wait_for_restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreWait {
    Restored,
    /// Termination was requested while waiting.
    Interrupted,
}

/// Warm restart flag access for one application in one docker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmRestart {
    app_name: String,
    docker_name: String,
}

impl WarmRestart {
    pub fn new(app_name: impl Into<String>, docker_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            docker_name: docker_name.into(),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn docker_name(&self) -> &str {
        &self.docker_name
    }

    /// True when warm restart is enabled system-wide or for this docker.
    #[instrument(skip(self, store), fields(app = %self.app_name))]
    pub async fn is_enabled<S: StoreClient>(&self, store: &mut S) -> Result<bool> {
        for scope in ["system", self.docker_name.as_str()] {
            let enable = store
                .hget(DbId::StateDb, WARM_RESTART_ENABLE_TABLE, scope, "enable")
                .await?;
            if enable.as_deref() == Some("true") {
                debug!(scope, "Warm restart enabled");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Reconcile timer configured in CONFIG_DB, if any.
    ///
    /// Unreadable or unparsable values are logged and ignored.
    pub async fn configured_timer<S: StoreClient>(&self, store: &mut S) -> Option<Duration> {
        let field = format!("{}_timer", self.app_name);
        let raw = match store
            .hget(DbId::ConfigDb, WARM_RESTART_CONFIG_TABLE, &self.docker_name, &field)
            .await
        {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(field = %field, error = %e, "Failed to read warm restart timer");
                return None;
            }
        };

        match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => {
                info!(app = %self.app_name, secs, "Using configured reconcile timer");
                Some(Duration::from_secs(secs))
            }
            _ => {
                warn!(field = %field, value = %raw, "Invalid warm restart timer, ignoring");
                None
            }
        }
    }

    /// Reconcile timer: CONFIG_DB override, else `default`.
    pub async fn reconcile_timer<S: StoreClient>(&self, store: &mut S, default: Duration) -> Duration {
        self.configured_timer(store).await.unwrap_or(default)
    }

    /// Persist the application's progress in STATE_DB.
    ///
    /// Entering [`WarmStartState::Restored`] also increments `restore_count`.
    #[instrument(skip(self, store), fields(app = %self.app_name))]
    pub async fn set_state<S: StoreClient>(&self, store: &mut S, state: WarmStartState) -> Result<()> {
        let mut fields = FieldValues::new();
        fields.insert("state".to_string(), state.as_str().to_string());
        fields.insert(
            "timestamp".to_string(),
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        );

        if state == WarmStartState::Restored {
            let count = store
                .hget(DbId::StateDb, WARM_RESTART_TABLE, &self.app_name, "restore_count")
                .await?
                .and_then(|c| c.parse::<u64>().ok())
                .unwrap_or(0);
            fields.insert("restore_count".to_string(), (count + 1).to_string());
        }

        store
            .set(DbId::StateDb, WARM_RESTART_TABLE, &self.app_name, &fields)
            .await?;
        info!(%state, "Warm restart state updated");
        Ok(())
    }

    /// Last persisted progress marker.
    pub async fn state<S: StoreClient>(&self, store: &mut S) -> Result<Option<String>> {
        store
            .hget(DbId::StateDb, WARM_RESTART_TABLE, &self.app_name, "state")
            .await
    }

    /// Poll `signal` every `poll` until it reports restored, `timeout`
    /// elapses, or `shutdown` is raised.
    ///
    /// Read failures while polling are logged and retried on the next tick.
    /// Elapsing the timeout is [`SyncError::RestoreTimeout`].
    #[instrument(skip(self, store, signal, shutdown), fields(app = %self.app_name))]
    pub async fn wait_for_restore<S: StoreClient>(
        &self,
        store: &mut S,
        signal: &RestoreSignal,
        timeout: Duration,
        poll: Duration,
        shutdown: &ShutdownFlag,
    ) -> Result<RestoreWait> {
        let deadline = Instant::now() + timeout;
        loop {
            if shutdown.is_set() {
                info!("Shutdown requested while waiting for kernel restore");
                return Ok(RestoreWait::Interrupted);
            }

            match signal.is_restored(store).await {
                Ok(true) => {
                    info!("Kernel state restored");
                    return Ok(RestoreWait::Restored);
                }
                Ok(false) => debug!("Kernel state not restored yet"),
                Err(e) => warn!(error = %e, "Failed to read restore signal"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SyncError::RestoreTimeout(timeout.as_secs()));
            }
            tokio::select! {
                _ = tokio::time::sleep_until((now + poll).min(deadline)) => {}
                _ = shutdown.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::field_values;

    fn enable(store: &MemoryStore, scope: &str) {
        store.preload(
            DbId::StateDb,
            WARM_RESTART_ENABLE_TABLE,
            scope,
            field_values([("enable", "true")]),
        );
    }

    #[tokio::test]
    async fn test_enabled_system_or_docker() {
        let mut store = MemoryStore::new();
        let wr = WarmRestart::new("teamsyncd", "teamd");
        assert!(!wr.is_enabled(&mut store).await.unwrap());

        enable(&store, "teamd");
        assert!(wr.is_enabled(&mut store).await.unwrap());

        let mut other = MemoryStore::new();
        enable(&other, "system");
        assert!(wr.is_enabled(&mut other).await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_flag_value() {
        let mut store = MemoryStore::new();
        store.preload(
            DbId::StateDb,
            WARM_RESTART_ENABLE_TABLE,
            "system",
            field_values([("enable", "false")]),
        );
        let wr = WarmRestart::new("natsyncd", "nat");
        assert!(!wr.is_enabled(&mut store).await.unwrap());
    }

    #[tokio::test]
    async fn test_configured_timer() {
        let mut store = MemoryStore::new();
        let wr = WarmRestart::new("teamsyncd", "teamd");
        let default = Duration::from_secs(70);
        assert_eq!(wr.reconcile_timer(&mut store, default).await, default);

        store.preload(
            DbId::ConfigDb,
            WARM_RESTART_CONFIG_TABLE,
            "teamd",
            field_values([("teamsyncd_timer", "120")]),
        );
        assert_eq!(
            wr.reconcile_timer(&mut store, default).await,
            Duration::from_secs(120)
        );

        store.preload(
            DbId::ConfigDb,
            WARM_RESTART_CONFIG_TABLE,
            "teamd",
            field_values([("teamsyncd_timer", "soon")]),
        );
        assert_eq!(wr.reconcile_timer(&mut store, default).await, default);
    }

    #[tokio::test]
    async fn test_set_state_increments_restore_count() {
        let mut store = MemoryStore::new();
        let wr = WarmRestart::new("natsyncd", "nat");
        wr.set_state(&mut store, WarmStartState::Restored).await.unwrap();
        wr.set_state(&mut store, WarmStartState::Reconciled).await.unwrap();
        wr.set_state(&mut store, WarmStartState::Restored).await.unwrap();

        let record = store
            .record(DbId::StateDb, WARM_RESTART_TABLE, "natsyncd")
            .unwrap();
        assert_eq!(record["state"], "restored");
        assert_eq!(record["restore_count"], "2");
        assert!(record.contains_key("timestamp"));
        assert_eq!(
            wr.state(&mut store).await.unwrap().as_deref(),
            Some("restored")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_restore_flag_appears() {
        let mut store = MemoryStore::new();
        let signal = RestoreSignal::store_flag(
            DbId::StateDb,
            "NAT_RESTORE_TABLE",
            "Flags",
            "restored",
            "true",
        );
        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            writer.preload(
                DbId::StateDb,
                "NAT_RESTORE_TABLE",
                "Flags",
                field_values([("restored", "true")]),
            );
        });

        let wr = WarmRestart::new("natsyncd", "nat");
        let start = Instant::now();
        let outcome = wr
            .wait_for_restore(
                &mut store,
                &signal,
                Duration::from_secs(180),
                Duration::from_secs(1),
                &ShutdownFlag::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, RestoreWait::Restored);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_restore_times_out() {
        let mut store = MemoryStore::new();
        let signal = RestoreSignal::store_flag(
            DbId::StateDb,
            "NAT_RESTORE_TABLE",
            "Flags",
            "restored",
            "true",
        );
        let wr = WarmRestart::new("natsyncd", "nat");
        let err = wr
            .wait_for_restore(
                &mut store,
                &signal,
                Duration::from_secs(3),
                Duration::from_secs(1),
                &ShutdownFlag::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RestoreTimeout(3)));
        assert!(store.ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_restore_interrupted() {
        let mut store = MemoryStore::new();
        let shutdown = ShutdownFlag::new();
        shutdown.set();
        let wr = WarmRestart::new("natsyncd", "nat");
        let signal = RestoreSignal::store_flag(DbId::StateDb, "T", "k", "f", "v");
        let outcome = wr
            .wait_for_restore(
                &mut store,
                &signal,
                Duration::from_secs(3),
                Duration::from_secs(1),
                &shutdown,
            )
            .await
            .unwrap();
        assert_eq!(outcome, RestoreWait::Interrupted);
    }

    #[tokio::test]
    async fn test_immediate_signal() {
        let mut store = MemoryStore::new();
        assert!(RestoreSignal::Immediate.is_restored(&mut store).await.unwrap());
    }
}
