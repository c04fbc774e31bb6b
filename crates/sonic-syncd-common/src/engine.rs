//! Sync engine
//!
//! Ties the cache, the store writer and the reconciler together. Daemon
//! handlers only call [`SyncEngine::upsert`] and [`SyncEngine::remove`];
//! whether the resulting delta is written now or held for reconciliation
//! is decided here.

use crate::cache::SyncCache;
use crate::config::SyncdConfig;
use crate::driver::ShutdownFlag;
use crate::error::{Result, SyncError};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::store::StoreClient;
use crate::types::{DbId, FieldValues, Operation, PublishedEntry, RestartState, TableKey};
use crate::warm_restart::{RestoreSignal, RestoreWait, WarmRestart, WarmStartState};
use crate::writer::{StoreWriter, WriterStats};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// Progress of the kernel re-query issued for idle records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Revalidation {
    Idle,
    /// Records are flagged; the next dump request re-validates them.
    Wanted,
    /// Waiting for the dump `sequence` to complete.
    Pending { sequence: u32, waited: u64 },
}

/// Per-daemon synchronization state.
pub struct SyncEngine<S> {
    tables: Vec<String>,
    cache: SyncCache,
    writer: StoreWriter<S>,
    reconciler: Reconciler,
    warm_restart: WarmRestart,
    aging_periods: u64,
    revalidation: Revalidation,
    /// Keys whose DEL was dropped by the writer.
    tombstones: BTreeSet<TableKey>,
}

impl<S: StoreClient> SyncEngine<S> {
    /// `tables` are the APPL_DB tables this daemon owns; they are read back
    /// at warm start.
    pub fn new(
        store: S,
        warm_restart: WarmRestart,
        tables: &[&str],
        config: &SyncdConfig,
    ) -> Self {
        Self {
            tables: tables.iter().map(|t| t.to_string()).collect(),
            cache: SyncCache::new(),
            writer: StoreWriter::new(store, config.retry_policy()),
            reconciler: Reconciler::cold(),
            warm_restart,
            aging_periods: config.aging_periods(),
            revalidation: Revalidation::Idle,
            tombstones: BTreeSet::new(),
        }
    }

    pub fn cache(&self) -> &SyncCache {
        &self.cache
    }

    pub fn store(&self) -> &S {
        self.writer.store()
    }

    pub fn store_mut(&mut self) -> &mut S {
        self.writer.store_mut()
    }

    pub fn warm_restart(&self) -> &WarmRestart {
        &self.warm_restart
    }

    pub fn restart_state(&self) -> RestartState {
        self.reconciler.state()
    }

    pub fn reconcile_deadline(&self) -> Option<Instant> {
        self.reconciler.deadline()
    }

    pub fn writer_stats(&self) -> WriterStats {
        self.writer.stats()
    }

    /// Deltas not yet written.
    pub fn pending(&self) -> usize {
        self.writer.pending()
    }

    /// Dropped writes waiting for the next periodic pass.
    pub fn awaiting_retry(&self) -> usize {
        self.tombstones.len() + self.cache.records().filter(|r| r.unpublished).count()
    }

    /// Record a new or updated entity.
    pub fn upsert(&mut self, key: TableKey, fields: FieldValues) {
        self.tombstones.remove(&key);
        if let Some(entry) = self.cache.apply_update(key, fields) {
            self.writer.enqueue(entry);
        }
    }

    /// Record the disappearance of an entity.
    pub fn remove(&mut self, key: &TableKey) {
        if let Some(entry) = self.cache.apply_delete(key) {
            self.writer.enqueue(entry);
        }
    }

    /// Remove every published record.
    pub fn remove_all(&mut self) -> usize {
        let dels = self.cache.drain_all();
        let count = dels.len();
        self.writer.enqueue_all(dels);
        count
    }

    /// Write queued deltas. A no-op while a warm restart is buffering.
    ///
    /// Entries the writer gives up on are kept for the next periodic pass
    /// unless a newer delta for the same key already superseded them.
    pub async fn flush(&mut self) -> usize {
        let written = self.writer.flush().await;
        for entry in self.writer.take_dropped() {
            let held = match entry.op {
                Operation::Set => self.cache.mark_unpublished(&entry.key, &entry.fields),
                Operation::Del if !self.cache.contains(&entry.key) => {
                    self.tombstones.insert(entry.key.clone())
                }
                Operation::Del => false,
            };
            if held {
                debug!(op = %entry.op, key = %entry.key, "Dropped write held for retry");
            }
        }
        written
    }

    /// Queue every dropped write again.
    fn retry_dropped(&mut self) {
        let dels: Vec<PublishedEntry> = std::mem::take(&mut self.tombstones)
            .into_iter()
            .map(PublishedEntry::del)
            .collect();
        let sets = self.cache.take_unpublished();
        if dels.is_empty() && sets.is_empty() {
            return;
        }
        info!(dels = dels.len(), sets = sets.len(), "Retrying dropped store writes");
        self.writer.enqueue_all(dels);
        self.writer.enqueue_all(sets);
    }

    /// Whether warm restart is enabled for this daemon.
    pub async fn detect_warm_start(&mut self) -> Result<bool> {
        let warm_restart = self.warm_restart.clone();
        warm_restart.is_enabled(self.writer.store_mut()).await
    }

    /// Enter [`RestartState::WarmInProgress`]: read every owned table back
    /// into the cache and start buffering.
    ///
    /// Failing to read the snapshot is fatal.
    #[instrument(skip(self), fields(app = %self.warm_restart.app_name()))]
    pub async fn begin_warm_start(&mut self) -> Result<usize> {
        let mut snapshot = HashMap::new();
        for table in &self.tables {
            let records = self
                .writer
                .store_mut()
                .get_table(DbId::ApplDb, table)
                .await
                .map_err(|e| SyncError::SnapshotRead {
                    table: table.clone(),
                    reason: e.to_string(),
                })?;
            debug!(table = %table, count = records.len(), "Restored table");
            for (key, fields) in records {
                snapshot.insert(TableKey::new(table.clone(), key), fields);
            }
        }

        let restored = self
            .cache
            .seed_restored(snapshot.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.reconciler = Reconciler::warm(snapshot);
        self.writer.start_buffering();
        Ok(restored)
    }

    /// Wait for the kernel to restore its own state; see
    /// [`WarmRestart::wait_for_restore`].
    pub async fn wait_for_restore(
        &mut self,
        signal: &RestoreSignal,
        timeout: Duration,
        poll: Duration,
        shutdown: &ShutdownFlag,
    ) -> Result<RestoreWait> {
        let warm_restart = self.warm_restart.clone();
        warm_restart
            .wait_for_restore(self.writer.store_mut(), signal, timeout, poll, shutdown)
            .await
    }

    /// Reconcile timer: CONFIG_DB override, else `default`.
    pub async fn resolve_reconcile_timer(&mut self, default: Duration) -> Duration {
        let warm_restart = self.warm_restart.clone();
        warm_restart
            .reconcile_timer(self.writer.store_mut(), default)
            .await
    }

    /// Enter [`RestartState::ReconcileWindowOpen`] with a deadline `timer`
    /// from now, and record the restored state in STATE_DB.
    pub async fn open_reconcile_window(&mut self, timer: Duration) {
        if !self.reconciler.open_window(Instant::now(), timer) {
            return;
        }
        let warm_restart = self.warm_restart.clone();
        if let Err(e) = warm_restart
            .set_state(self.writer.store_mut(), WarmStartState::Restored)
            .await
        {
            warn!(error = %e, "Failed to record restored state");
        }
    }

    /// True once the open window's deadline has passed.
    pub fn reconcile_due(&self) -> bool {
        self.reconciler.is_due(Instant::now())
    }

    /// Bulk catch-up at the end of the reconcile window.
    ///
    /// Restored records the kernel never re-reported are deleted, buffered
    /// deltas the store already reflects are dropped, the rest is written
    /// and the writer stays in pass-through from here on. Write failures are
    /// handled by the writer's retry policy and never abort this.
    #[instrument(skip(self), fields(app = %self.warm_restart.app_name()))]
    pub async fn reconcile(&mut self) -> ReconcileReport {
        if self.reconciler.state() != RestartState::ReconcileWindowOpen {
            warn!(state = %self.reconciler.state(), "Reconcile requested outside the window");
            return ReconcileReport::default();
        }

        let stale = self.cache.take_unobserved();
        for key in &stale {
            debug!(%key, "Restored record no longer in kernel");
            self.writer.enqueue(PublishedEntry::del(key.clone()));
        }

        let buffered = self.writer.take_buffered();
        let (kept, suppressed) = self.reconciler.filter(buffered);

        self.writer.resume_pass_through();
        self.writer.enqueue_all(kept);
        let flushed = self.flush().await;
        self.reconciler.complete();

        let warm_restart = self.warm_restart.clone();
        if let Err(e) = warm_restart
            .set_state(self.writer.store_mut(), WarmStartState::Reconciled)
            .await
        {
            warn!(error = %e, "Failed to record reconciled state");
        }

        let report = ReconcileReport {
            restored: self.reconciler.restored(),
            stale: stale.len(),
            suppressed,
            flushed,
        };
        info!(
            restored = report.restored,
            stale = report.stale,
            suppressed = report.suppressed,
            flushed = report.flushed,
            "Warm restart reconciliation complete"
        );
        report
    }

    /// Periodic pass: retry dropped writes and age idle records.
    ///
    /// Returns true when the kernel should be re-queried, either because
    /// records went idle or because the previous re-query never completed
    /// within `aging_periods` passes. Nothing is removed here; see
    /// [`Self::dump_complete`]. Skipped while a warm restart is in progress.
    pub fn age(&mut self) -> bool {
        if self.reconciler.state().is_buffering() {
            return false;
        }
        self.retry_dropped();

        match self.revalidation {
            Revalidation::Pending { sequence, waited } => {
                self.cache.tick();
                let waited = waited + 1;
                if waited <= self.aging_periods.max(1) {
                    self.revalidation = Revalidation::Pending { sequence, waited };
                    return false;
                }
                warn!(sequence, waited, "Re-validation dump did not complete, requesting again");
                self.revalidation = Revalidation::Wanted;
                true
            }
            Revalidation::Wanted => {
                self.cache.tick();
                true
            }
            Revalidation::Idle => {
                let flagged = self.cache.age(self.aging_periods);
                if flagged.is_empty() {
                    return false;
                }
                debug!(count = flagged.len(), "Records idle, re-validating");
                self.revalidation = Revalidation::Wanted;
                true
            }
        }
    }

    /// A dump was requested with `sequence`. If records are waiting for
    /// re-validation, their fate is decided when this dump completes.
    pub fn dump_requested(&mut self, sequence: u32) {
        if self.revalidation != Revalidation::Idle {
            debug!(sequence, "Re-validating idle records");
            self.revalidation = Revalidation::Pending {
                sequence,
                waited: 0,
            };
        }
    }

    /// The dump request could not be sent; flagged records are kept and
    /// flagged again on a later pass.
    pub fn dump_request_failed(&mut self) {
        if self.revalidation != Revalidation::Idle {
            self.cache.clear_revalidating();
            self.revalidation = Revalidation::Idle;
        }
    }

    /// The dump `sequence` completed. When it is the pending re-validation,
    /// records it did not report are removed and their DELs queued. Returns
    /// the number of records removed.
    pub fn dump_complete(&mut self, sequence: u32) -> usize {
        match self.revalidation {
            Revalidation::Pending { sequence: pending, .. } if pending == sequence => {}
            _ => {
                trace!(sequence, "Dump completed");
                return 0;
            }
        }
        self.revalidation = Revalidation::Idle;

        let expired = self.cache.expire_unconfirmed();
        for entry in &expired {
            info!(key = %entry.key, "Aged out record");
        }
        let count = expired.len();
        self.writer.enqueue_all(expired);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreOp};
    use crate::types::field_values;
    use crate::warm_restart::WARM_RESTART_TABLE;
    use pretty_assertions::assert_eq;

    fn engine(store: &MemoryStore, aging_periods: u64) -> SyncEngine<MemoryStore> {
        let mut config = SyncdConfig::default();
        config.sync.aging_periods = Some(aging_periods);
        SyncEngine::new(
            store.clone(),
            WarmRestart::new("testsyncd", "test"),
            &["TEST_TABLE"],
            &config,
        )
    }

    fn key(k: &str) -> TableKey {
        TableKey::new("TEST_TABLE", k)
    }

    #[tokio::test]
    async fn test_cold_start_first_event_single_set() {
        let store = MemoryStore::new();
        let mut engine = engine(&store, 0);
        engine.upsert(key("eth0"), field_values([("oper", "up")]));
        engine.upsert(key("eth0"), field_values([("oper", "up")]));
        engine.remove(&key("never"));
        assert_eq!(engine.flush().await, 1);

        assert_eq!(
            store.ops(),
            vec![StoreOp::Set {
                db: DbId::ApplDb,
                table: "TEST_TABLE".into(),
                key: "eth0".into(),
                fields: field_values([("oper", "up")]),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_start_reconcile_emits_only_differences() {
        let store = MemoryStore::new();
        store.preload(DbId::ApplDb, "TEST_TABLE", "A", field_values([("f", "1")]));
        store.preload(DbId::ApplDb, "TEST_TABLE", "B", field_values([("f", "2")]));
        let mut engine = engine(&store, 0);

        assert_eq!(engine.begin_warm_start().await.unwrap(), 2);
        assert_eq!(engine.restart_state(), RestartState::WarmInProgress);
        engine.open_reconcile_window(Duration::from_secs(5)).await;
        store.clear_ops();

        engine.upsert(key("A"), field_values([("f", "1")]));
        engine.upsert(key("C"), field_values([("f", "3")]));
        assert_eq!(engine.flush().await, 0);
        assert!(store.ops_in(DbId::ApplDb).is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(engine.reconcile_due());
        let report = engine.reconcile().await;

        assert_eq!(
            store.ops_in(DbId::ApplDb),
            vec![
                StoreOp::Del {
                    db: DbId::ApplDb,
                    table: "TEST_TABLE".into(),
                    key: "B".into(),
                },
                StoreOp::Set {
                    db: DbId::ApplDb,
                    table: "TEST_TABLE".into(),
                    key: "C".into(),
                    fields: field_values([("f", "3")]),
                },
            ]
        );
        assert_eq!(report.stale, 1);
        assert_eq!(report.flushed, 2);
        assert_eq!(engine.restart_state(), RestartState::Complete);
        assert_eq!(
            store
                .record(DbId::StateDb, WARM_RESTART_TABLE, "testsyncd")
                .unwrap()["state"],
            "reconciled"
        );

        // Pass-through from here on
        engine.upsert(key("D"), FieldValues::new());
        assert_eq!(engine.flush().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_read_failure_is_fatal() {
        let store = MemoryStore::new();
        store.fail_reads(true);
        let mut engine = engine(&store, 0);
        let err = engine.begin_warm_start().await.unwrap_err();
        assert!(matches!(err, SyncError::SnapshotRead { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_aging_expires_when_revalidation_dump_completes() {
        let store = MemoryStore::new();
        let mut engine = engine(&store, 1);
        engine.upsert(key("eth0"), FieldValues::new());
        engine.upsert(key("eth1"), FieldValues::new());
        engine.flush().await;
        store.clear_ops();

        assert!(!engine.age());
        assert!(engine.age());
        engine.dump_requested(4);

        // The dump is slow: waiting passes never expire anything
        assert!(!engine.age());
        engine.upsert(key("eth1"), FieldValues::new());
        assert_eq!(engine.dump_complete(3), 0);
        engine.flush().await;
        assert!(store.ops().is_empty());

        assert_eq!(engine.dump_complete(4), 1);
        engine.flush().await;
        assert_eq!(
            store.ops(),
            vec![StoreOp::Del {
                db: DbId::ApplDb,
                table: "TEST_TABLE".into(),
                key: "eth0".into(),
            }]
        );
        assert!(engine.cache().contains(&key("eth1")));
    }

    #[tokio::test]
    async fn test_lost_revalidation_dump_is_requested_again() {
        let store = MemoryStore::new();
        let mut engine = engine(&store, 2);
        engine.upsert(key("eth0"), FieldValues::new());
        engine.flush().await;

        assert!(!engine.age());
        assert!(!engine.age());
        assert!(engine.age());
        engine.dump_requested(1);
        assert!(!engine.age());
        assert!(!engine.age());
        assert!(engine.age());

        // A failed request keeps the record and flags it again
        engine.dump_request_failed();
        assert!(engine.age());
        assert!(engine.cache().contains(&key("eth0")));
        assert_eq!(engine.dump_complete(1), 0);
        assert!(engine.cache().contains(&key("eth0")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_write_repaired_on_next_pass() {
        let store = MemoryStore::new();
        let mut engine = engine(&store, 0);
        let fields = field_values([("oper", "up")]);

        store.fail_next_writes(3);
        engine.upsert(key("eth0"), fields.clone());
        assert_eq!(engine.flush().await, 0);
        assert_eq!(engine.writer_stats().dropped, 1);
        assert_eq!(engine.awaiting_retry(), 1);

        // The kernel keeps reporting the same state
        engine.upsert(key("eth0"), fields.clone());
        engine.upsert(key("eth0"), fields.clone());
        assert_eq!(engine.flush().await, 1);
        assert_eq!(store.record(DbId::ApplDb, "TEST_TABLE", "eth0"), Some(fields.clone()));
        assert_eq!(engine.awaiting_retry(), 0);

        // Without a kernel report the periodic pass re-sends it
        store.fail_next_writes(3);
        engine.upsert(key("eth1"), fields.clone());
        engine.flush().await;
        assert!(!engine.age());
        assert_eq!(engine.flush().await, 1);
        assert_eq!(store.record(DbId::ApplDb, "TEST_TABLE", "eth1"), Some(fields));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_delete_retried_until_written() {
        let store = MemoryStore::new();
        let mut engine = engine(&store, 0);
        engine.upsert(key("eth0"), FieldValues::new());
        engine.flush().await;

        store.fail_next_writes(3);
        engine.remove(&key("eth0"));
        engine.flush().await;
        assert_eq!(store.keys(DbId::ApplDb, "TEST_TABLE"), vec!["eth0"]);
        assert_eq!(engine.awaiting_retry(), 1);

        store.fail_next_writes(3);
        engine.age();
        engine.flush().await;
        assert_eq!(engine.awaiting_retry(), 1);

        engine.age();
        engine.flush().await;
        assert!(store.keys(DbId::ApplDb, "TEST_TABLE").is_empty());
        assert_eq!(engine.awaiting_retry(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_delete_superseded_by_new_set() {
        let store = MemoryStore::new();
        let mut engine = engine(&store, 0);
        engine.upsert(key("eth0"), field_values([("oper", "up")]));
        engine.flush().await;

        store.fail_next_writes(3);
        engine.remove(&key("eth0"));
        engine.flush().await;
        engine.upsert(key("eth0"), field_values([("oper", "down")]));
        engine.flush().await;
        store.clear_ops();

        engine.age();
        engine.flush().await;
        assert!(store.ops().is_empty());
        assert_eq!(
            store.record(DbId::ApplDb, "TEST_TABLE", "eth0"),
            Some(field_values([("oper", "down")]))
        );
    }

    #[tokio::test]
    async fn test_aging_skipped_during_warm_start() {
        let store = MemoryStore::new();
        store.preload(DbId::ApplDb, "TEST_TABLE", "A", FieldValues::new());
        let mut engine = engine(&store, 1);
        engine.begin_warm_start().await.unwrap();
        for _ in 0..5 {
            assert!(!engine.age());
        }
        assert!(engine.cache().contains(&key("A")));
    }

    #[tokio::test]
    async fn test_remove_all() {
        let store = MemoryStore::new();
        let mut engine = engine(&store, 0);
        engine.upsert(key("a"), FieldValues::new());
        engine.upsert(key("b"), FieldValues::new());
        engine.flush().await;
        assert_eq!(engine.remove_all(), 2);
        engine.flush().await;
        assert!(store.keys(DbId::ApplDb, "TEST_TABLE").is_empty());
    }
}
