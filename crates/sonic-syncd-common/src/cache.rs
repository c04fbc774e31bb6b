//! Synchronization cache
//!
//! In-memory view of every record this daemon has published. It decides
//! whether a kernel event is a change worth writing and drives aging of
//! entries whose delete notification may have been missed.
//!
//! Aging is two-phase. [`SyncCache::age`] flags records idle for too long;
//! the kernel is then re-queried, and only once that dump has completed
//! does [`SyncCache::expire_unconfirmed`] remove the flagged records it did
//! not report.

use crate::types::{FieldValues, Origin, PublishedEntry, SyncedRecord, TableKey};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Mapping from natural key to last known projected record.
#[derive(Debug, Default)]
pub struct SyncCache {
    records: HashMap<TableKey, SyncedRecord>,
    generation: u64,
}

impl SyncCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &TableKey) -> Option<&SyncedRecord> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &TableKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Iterate all records (unordered).
    pub fn records(&self) -> impl Iterator<Item = &SyncedRecord> {
        self.records.values()
    }

    /// Keys of one table, sorted.
    pub fn keys_in_table(&self, table: &str) -> Vec<TableKey> {
        let mut keys: Vec<TableKey> = self
            .records
            .keys()
            .filter(|k| k.table == table)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Apply a kernel new/update notification.
    ///
    /// Returns the SET to publish, or `None` when the fields are unchanged
    /// and already in the store. Either way the record is refreshed and
    /// marked kernel-observed.
    pub fn apply_update(&mut self, key: TableKey, fields: FieldValues) -> Option<PublishedEntry> {
        let generation = self.generation;
        match self.records.get_mut(&key) {
            Some(record) => {
                record.origin = Origin::KernelObserved;
                record.last_seen_generation = generation;
                record.revalidating = false;
                if record.fields == fields {
                    if !record.unpublished {
                        trace!(%key, "Unchanged record, suppressing write");
                        return None;
                    }
                    debug!(%key, "Re-sending record whose last write was dropped");
                } else {
                    debug!(%key, "Record changed");
                    record.fields = fields.clone();
                }
                record.unpublished = false;
                Some(PublishedEntry::set(key, fields))
            }
            None => {
                debug!(%key, "New record");
                self.records.insert(
                    key.clone(),
                    SyncedRecord {
                        key: key.clone(),
                        fields: fields.clone(),
                        origin: Origin::KernelObserved,
                        last_seen_generation: generation,
                        revalidating: false,
                        unpublished: false,
                    },
                );
                Some(PublishedEntry::set(key, fields))
            }
        }
    }

    /// Apply a kernel delete notification.
    ///
    /// Returns the DEL to publish, or `None` if the key was never known.
    pub fn apply_delete(&mut self, key: &TableKey) -> Option<PublishedEntry> {
        match self.records.remove(key) {
            Some(_) => {
                debug!(%key, "Record deleted");
                Some(PublishedEntry::del(key.clone()))
            }
            None => {
                trace!(%key, "Delete for unknown record ignored");
                None
            }
        }
    }

    /// Seed the cache with records read back from the store at warm start.
    pub fn seed_restored<I>(&mut self, entries: I) -> usize
    where
        I: IntoIterator<Item = (TableKey, FieldValues)>,
    {
        let mut count = 0;
        for (key, fields) in entries {
            self.records.insert(
                key.clone(),
                SyncedRecord {
                    key,
                    fields,
                    origin: Origin::StoreRestored,
                    last_seen_generation: self.generation,
                    revalidating: false,
                    unpublished: false,
                },
            );
            count += 1;
        }
        count
    }

    /// Remove and return every record that was restored from the store but
    /// never re-observed from the kernel.
    pub fn take_unobserved(&mut self) -> Vec<TableKey> {
        let mut stale: Vec<TableKey> = self
            .records
            .values()
            .filter(|r| r.origin == Origin::StoreRestored)
            .map(|r| r.key.clone())
            .collect();
        stale.sort();
        for key in &stale {
            self.records.remove(key);
        }
        stale
    }

    /// Note that the SET of `key` with `fields` never reached the store.
    ///
    /// Returns false when the record has since changed or gone, in which
    /// case a newer write already supersedes the dropped one.
    pub fn mark_unpublished(&mut self, key: &TableKey, fields: &FieldValues) -> bool {
        match self.records.get_mut(key) {
            Some(record) if record.fields == *fields => {
                record.unpublished = true;
                true
            }
            _ => false,
        }
    }

    /// SETs for every record whose last write was dropped, clearing the
    /// mark. Sorted by key.
    pub fn take_unpublished(&mut self) -> Vec<PublishedEntry> {
        let mut entries: Vec<PublishedEntry> = self
            .records
            .values_mut()
            .filter(|r| r.unpublished)
            .map(|r| {
                r.unpublished = false;
                PublishedEntry::set(r.key.clone(), r.fields.clone())
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Advance the pass counter without flagging anything.
    pub fn tick(&mut self) {
        self.generation += 1;
    }

    /// Run one aging pass.
    ///
    /// Advances the generation and flags every record idle for more than
    /// `max_idle` passes for re-validation. Returns the newly flagged keys,
    /// sorted; nothing is removed here. `max_idle == 0` only advances the
    /// generation.
    pub fn age(&mut self, max_idle: u64) -> Vec<TableKey> {
        self.tick();
        if max_idle == 0 {
            return Vec::new();
        }

        let generation = self.generation;
        let mut flagged: Vec<TableKey> = self
            .records
            .values_mut()
            .filter(|r| {
                !r.revalidating && generation.saturating_sub(r.last_seen_generation) > max_idle
            })
            .map(|r| {
                r.revalidating = true;
                r.key.clone()
            })
            .collect();
        flagged.sort();
        flagged
    }

    /// Remove every record still flagged after a completed re-validation
    /// dump, returning their DELs sorted by key.
    pub fn expire_unconfirmed(&mut self) -> Vec<PublishedEntry> {
        let mut expired: Vec<TableKey> = self
            .records
            .values()
            .filter(|r| r.revalidating)
            .map(|r| r.key.clone())
            .collect();
        expired.sort();
        for key in &expired {
            self.records.remove(key);
        }
        expired.into_iter().map(PublishedEntry::del).collect()
    }

    /// Drop every re-validation flag, e.g. when the re-query could not be
    /// sent. The records are flagged again on a later pass.
    pub fn clear_revalidating(&mut self) {
        for record in self.records.values_mut() {
            record.revalidating = false;
        }
    }

    /// Remove every record, returning DELs for all of them.
    pub fn drain_all(&mut self) -> Vec<PublishedEntry> {
        let mut keys: Vec<TableKey> = self.records.drain().map(|(k, _)| k).collect();
        keys.sort();
        keys.into_iter().map(PublishedEntry::del).collect()
    }
}
