//! Core record types shared by the cache, writer and reconciliation engine

use std::collections::BTreeMap;
use std::fmt;

/// Ordered attribute map of a record.
///
/// Ordering is by field name so that two producers emitting the same fields
/// in a different order compare equal.
pub type FieldValues = BTreeMap<String, String>;

/// Build a [`FieldValues`] from string pairs.
pub fn field_values<I, K, V>(pairs: I) -> FieldValues
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// SONiC database identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DbId {
    /// Application database - destination of synced records
    ApplDb,
    /// Configuration database - warm restart timers
    ConfigDb,
    /// State database - warm restart flags and restore signals
    StateDb,
}

impl DbId {
    /// Returns the database name as used by SONiC.
    pub fn name(&self) -> &'static str {
        match self {
            DbId::ApplDb => "APPL_DB",
            DbId::ConfigDb => "CONFIG_DB",
            DbId::StateDb => "STATE_DB",
        }
    }

    /// Table/key separator used by this database.
    pub fn separator(&self) -> char {
        match self {
            DbId::ApplDb => ':',
            DbId::ConfigDb | DbId::StateDb => '|',
        }
    }
}

/// Natural key of a synced entity, namespaced by its APPL_DB table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableKey {
    pub table: String,
    pub key: String,
}

impl TableKey {
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.key)
    }
}

/// Where the cache learned about a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Seen from the kernel during this process lifetime.
    KernelObserved,
    /// Read back from the store at warm start and not yet re-observed.
    StoreRestored,
}

/// One externally observed entity as last projected to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedRecord {
    pub key: TableKey,
    pub fields: FieldValues,
    pub origin: Origin,
    /// Periodic pass counter value when this record was last refreshed.
    pub last_seen_generation: u64,
    /// Set by the aging pass once a re-query has been requested.
    pub revalidating: bool,
    /// The last write of this record was dropped by the store writer.
    pub unpublished: bool,
}

/// Store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Set,
    Del,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Set => write!(f, "SET"),
            Operation::Del => write!(f, "DEL"),
        }
    }
}

/// Store-side projection of a record change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedEntry {
    pub key: TableKey,
    pub op: Operation,
    pub fields: FieldValues,
}

impl PublishedEntry {
    pub fn set(key: TableKey, fields: FieldValues) -> Self {
        Self {
            key,
            op: Operation::Set,
            fields,
        }
    }

    pub fn del(key: TableKey) -> Self {
        Self {
            key,
            op: Operation::Del,
            fields: FieldValues::new(),
        }
    }
}

/// Restart lifecycle of a daemon. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RestartState {
    /// Cold start: writes pass straight through.
    NotApplicable,
    /// Warm start detected, snapshot loaded, waiting for the kernel restore.
    WarmInProgress,
    /// Kernel restored; dump requested and reconcile deadline armed.
    ReconcileWindowOpen,
    /// Reconciliation done; behaves like a cold start from here on.
    Complete,
}

impl RestartState {
    /// True while store writes must be buffered.
    pub fn is_buffering(&self) -> bool {
        matches!(
            self,
            RestartState::WarmInProgress | RestartState::ReconcileWindowOpen
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: RestartState) -> bool {
        matches!(
            (self, next),
            (RestartState::WarmInProgress, RestartState::ReconcileWindowOpen)
                | (RestartState::ReconcileWindowOpen, RestartState::Complete)
        )
    }
}

impl fmt::Display for RestartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartState::NotApplicable => write!(f, "NotApplicable"),
            RestartState::WarmInProgress => write!(f, "WarmInProgress"),
            RestartState::ReconcileWindowOpen => write!(f, "ReconcileWindowOpen"),
            RestartState::Complete => write!(f, "Complete"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_values_order_insensitive() {
        let a = field_values([("mtu", "9100"), ("admin_status", "up")]);
        let b = field_values([("admin_status", "up"), ("mtu", "9100")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_table_key_display() {
        let key = TableKey::new("NAPT_TABLE", "TCP:10.0.0.1:1024");
        assert_eq!(key.to_string(), "NAPT_TABLE:TCP:10.0.0.1:1024");
    }

    #[test]
    fn test_restart_state_forward_only() {
        use RestartState::*;
        assert!(WarmInProgress.can_advance_to(ReconcileWindowOpen));
        assert!(ReconcileWindowOpen.can_advance_to(Complete));
        assert!(!Complete.can_advance_to(WarmInProgress));
        assert!(!NotApplicable.can_advance_to(ReconcileWindowOpen));
        assert!(!ReconcileWindowOpen.can_advance_to(WarmInProgress));
        assert!(WarmInProgress.is_buffering());
        assert!(!Complete.is_buffering());
    }

    #[test]
    fn test_db_separators() {
        assert_eq!(DbId::ApplDb.separator(), ':');
        assert_eq!(DbId::StateDb.separator(), '|');
        assert_eq!(DbId::ConfigDb.name(), "CONFIG_DB");
    }
}
