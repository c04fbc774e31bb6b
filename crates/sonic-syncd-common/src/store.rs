//! Shared key-value store abstraction
//!
//! [`StoreClient`] is the seam between the sync engine and the SWSS
//! databases. [`RedisStore`](crate::redis_store::RedisStore) is the
//! production implementation; [`MemoryStore`] backs tests and dry runs.

use crate::error::{Result, SyncError};
use crate::types::{DbId, FieldValues};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-table record access to the SWSS databases.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoreClient: Send {
    /// Upsert `fields` into `table`/`key`.
    async fn set(&mut self, db: DbId, table: &str, key: &str, fields: &FieldValues)
    -> Result<()>;

    /// Remove `table`/`key`. Removing a missing key succeeds.
    async fn del(&mut self, db: DbId, table: &str, key: &str) -> Result<()>;

    /// Read one record.
    async fn get(&mut self, db: DbId, table: &str, key: &str) -> Result<Option<FieldValues>>;

    /// Read every record of a table as `(key, fields)` pairs.
    async fn get_table(&mut self, db: DbId, table: &str) -> Result<Vec<(String, FieldValues)>>;

    /// Read a single field.
    async fn hget(
        &mut self,
        db: DbId,
        table: &str,
        key: &str,
        field: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .get(db, table, key)
            .await?
            .and_then(|mut fields| fields.remove(field)))
    }
}

/// A write recorded by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Set {
        db: DbId,
        table: String,
        key: String,
        fields: FieldValues,
    },
    Del {
        db: DbId,
        table: String,
        key: String,
    },
}

impl StoreOp {
    /// `"TABLE:key"` of the written record.
    pub fn target(&self) -> String {
        match self {
            StoreOp::Set { table, key, .. } | StoreOp::Del { table, key, .. } => {
                format!("{}:{}", table, key)
            }
        }
    }

    pub fn db(&self) -> DbId {
        match self {
            StoreOp::Set { db, .. } | StoreOp::Del { db, .. } => *db,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    tables: BTreeMap<(DbId, String), BTreeMap<String, FieldValues>>,
    ops: Vec<StoreOp>,
    failing_writes: usize,
    failing_reads: bool,
}

/// In-memory store.
///
/// Clones share the same contents, so a test can keep one handle while the
/// engine owns another. Writes are journaled for assertions.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record without journaling it.
    pub fn preload(&self, db: DbId, table: &str, key: &str, fields: FieldValues) {
        self.inner
            .lock()
            .tables
            .entry((db, table.to_string()))
            .or_default()
            .insert(key.to_string(), fields);
    }

    /// Current contents of a record.
    pub fn record(&self, db: DbId, table: &str, key: &str) -> Option<FieldValues> {
        self.inner
            .lock()
            .tables
            .get(&(db, table.to_string()))
            .and_then(|t| t.get(key).cloned())
    }

    /// Keys currently present in a table, sorted.
    pub fn keys(&self, db: DbId, table: &str) -> Vec<String> {
        self.inner
            .lock()
            .tables
            .get(&(db, table.to_string()))
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// All writes so far, in order.
    pub fn ops(&self) -> Vec<StoreOp> {
        self.inner.lock().ops.clone()
    }

    /// Writes so far that targeted `db`.
    pub fn ops_in(&self, db: DbId) -> Vec<StoreOp> {
        self.inner
            .lock()
            .ops
            .iter()
            .filter(|op| op.db() == db)
            .cloned()
            .collect()
    }

    pub fn clear_ops(&self) {
        self.inner.lock().ops.clear();
    }

    /// Make the next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.lock().failing_writes = count;
    }

    /// Make every read fail until reset.
    pub fn fail_reads(&self, failing: bool) {
        self.inner.lock().failing_reads = failing;
    }

    fn check_write(inner: &mut MemoryInner, table: &str, key: &str) -> Result<()> {
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(SyncError::Store {
                table: table.to_string(),
                key: key.to_string(),
                reason: "injected write failure".to_string(),
            });
        }
        Ok(())
    }

    fn check_read(inner: &MemoryInner) -> Result<()> {
        if inner.failing_reads {
            return Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "injected read failure",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn set(
        &mut self,
        db: DbId,
        table: &str,
        key: &str,
        fields: &FieldValues,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_write(&mut inner, table, key)?;
        let record = inner
            .tables
            .entry((db, table.to_string()))
            .or_default()
            .entry(key.to_string())
            .or_default();
        for (field, value) in fields {
            record.insert(field.clone(), value.clone());
        }
        inner.ops.push(StoreOp::Set {
            db,
            table: table.to_string(),
            key: key.to_string(),
            fields: fields.clone(),
        });
        Ok(())
    }

    async fn del(&mut self, db: DbId, table: &str, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_write(&mut inner, table, key)?;
        if let Some(t) = inner.tables.get_mut(&(db, table.to_string())) {
            t.remove(key);
        }
        inner.ops.push(StoreOp::Del {
            db,
            table: table.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    async fn get(&mut self, db: DbId, table: &str, key: &str) -> Result<Option<FieldValues>> {
        let inner = self.inner.lock();
        Self::check_read(&inner)?;
        Ok(inner
            .tables
            .get(&(db, table.to_string()))
            .and_then(|t| t.get(key).cloned()))
    }

    async fn get_table(&mut self, db: DbId, table: &str) -> Result<Vec<(String, FieldValues)>> {
        let inner = self.inner.lock();
        Self::check_read(&inner)?;
        Ok(inner
            .tables
            .get(&(db, table.to_string()))
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::field_values;

    #[tokio::test]
    async fn test_memory_store_upsert_merges_fields() {
        let mut store = MemoryStore::new();
        store
            .set(DbId::ApplDb, "LAG_TABLE", "PortChannel1", &field_values([("mtu", "9100")]))
            .await
            .unwrap();
        store
            .set(
                DbId::ApplDb,
                "LAG_TABLE",
                "PortChannel1",
                &field_values([("admin_status", "up")]),
            )
            .await
            .unwrap();
        assert_eq!(
            store.record(DbId::ApplDb, "LAG_TABLE", "PortChannel1"),
            Some(field_values([("admin_status", "up"), ("mtu", "9100")]))
        );
        assert_eq!(store.ops().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_del_missing_is_ok() {
        let mut store = MemoryStore::new();
        store.del(DbId::ApplDb, "LAG_TABLE", "nope").await.unwrap();
        assert_eq!(store.ops()[0].target(), "LAG_TABLE:nope");
    }

    #[tokio::test]
    async fn test_memory_store_injected_failures() {
        let mut store = MemoryStore::new();
        store.fail_next_writes(1);
        assert!(
            store
                .set(DbId::ApplDb, "T", "k", &FieldValues::new())
                .await
                .is_err()
        );
        assert!(store.set(DbId::ApplDb, "T", "k", &FieldValues::new()).await.is_ok());

        store.fail_reads(true);
        assert!(store.get_table(DbId::ApplDb, "T").await.is_err());
    }

    #[tokio::test]
    async fn test_hget_default_reads_one_field() {
        let mut store = MemoryStore::new();
        store.preload(
            DbId::StateDb,
            "NAT_RESTORE_TABLE",
            "Flags",
            field_values([("restored", "true")]),
        );
        let value = store
            .hget(DbId::StateDb, "NAT_RESTORE_TABLE", "Flags", "restored")
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("true"));
        assert_eq!(
            store
                .hget(DbId::StateDb, "NAT_RESTORE_TABLE", "Flags", "missing")
                .await
                .unwrap(),
            None
        );
    }
}
