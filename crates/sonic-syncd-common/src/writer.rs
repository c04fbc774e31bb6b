//! Store writer
//!
//! Turns [`PublishedEntry`] deltas into store operations. In pass-through
//! mode entries are queued in emit order and written on [`StoreWriter::flush`].
//! In buffering mode (warm restart in progress) they are coalesced per key,
//! last operation wins, and held until the reconciliation engine takes them.

use crate::store::StoreClient;
use crate::types::{DbId, Operation, PublishedEntry, TableKey};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Backoff schedule for failed store writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per entry, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from the initial backoff.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Whether writes reach the store immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterMode {
    PassThrough,
    Buffering,
}

/// Counters exposed for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub written: u64,
    pub dropped: u64,
    pub retried: u64,
}

/// Idempotent writer in front of a [`StoreClient`].
pub struct StoreWriter<S> {
    store: S,
    db: DbId,
    mode: WriterMode,
    queue: VecDeque<PublishedEntry>,
    buffer: BTreeMap<TableKey, PublishedEntry>,
    dropped: Vec<PublishedEntry>,
    retry: RetryPolicy,
    stats: WriterStats,
}

impl<S: StoreClient> StoreWriter<S> {
    /// Create a pass-through writer targeting APPL_DB.
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        Self {
            store,
            db: DbId::ApplDb,
            mode: WriterMode::PassThrough,
            queue: VecDeque::new(),
            buffer: BTreeMap::new(),
            dropped: Vec::new(),
            retry,
            stats: WriterStats::default(),
        }
    }

    pub fn mode(&self) -> WriterMode {
        self.mode
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// Entries waiting for the next flush (pass-through) or reconciliation
    /// (buffering).
    pub fn pending(&self) -> usize {
        self.queue.len() + self.buffer.len()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Hold all further emits until [`Self::take_buffered`].
    pub fn start_buffering(&mut self) {
        debug!("Store writer switched to buffering");
        self.mode = WriterMode::Buffering;
    }

    /// Switch back to immediate writes.
    pub fn resume_pass_through(&mut self) {
        debug!(queued = self.queue.len(), "Store writer switched to pass-through");
        self.mode = WriterMode::PassThrough;
    }

    /// Remove and return the coalesced buffered entries, ordered by key.
    pub fn take_buffered(&mut self) -> Vec<PublishedEntry> {
        std::mem::take(&mut self.buffer).into_values().collect()
    }

    /// Remove and return the entries dropped since the last call, in the
    /// order they failed.
    pub fn take_dropped(&mut self) -> Vec<PublishedEntry> {
        std::mem::take(&mut self.dropped)
    }

    /// Queue one delta.
    pub fn enqueue(&mut self, entry: PublishedEntry) {
        match self.mode {
            WriterMode::PassThrough => self.queue.push_back(entry),
            WriterMode::Buffering => {
                self.buffer.insert(entry.key.clone(), entry);
            }
        }
    }

    pub fn enqueue_all<I: IntoIterator<Item = PublishedEntry>>(&mut self, entries: I) {
        for entry in entries {
            self.enqueue(entry);
        }
    }

    /// Write every queued entry in order.
    ///
    /// A no-op while buffering. An entry whose retries are exhausted is
    /// logged and set aside for [`Self::take_dropped`]; the flush continues
    /// with the next one. Returns the number of entries written.
    #[instrument(skip(self), fields(queued = self.queue.len()))]
    pub async fn flush(&mut self) -> usize {
        if self.mode == WriterMode::Buffering {
            return 0;
        }

        let mut written = 0;
        while let Some(entry) = self.queue.pop_front() {
            if self.write_with_retry(&entry).await {
                written += 1;
            } else {
                self.dropped.push(entry);
            }
        }
        written
    }

    async fn write_with_retry(&mut self, entry: &PublishedEntry) -> bool {
        let mut attempt = 1;
        loop {
            let result = match entry.op {
                Operation::Set => {
                    self.store
                        .set(self.db, &entry.key.table, &entry.key.key, &entry.fields)
                        .await
                }
                Operation::Del => {
                    self.store
                        .del(self.db, &entry.key.table, &entry.key.key)
                        .await
                }
            };

            match result {
                Ok(()) => {
                    debug!(op = %entry.op, key = %entry.key, "Published");
                    self.stats.written += 1;
                    return true;
                }
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        op = %entry.op,
                        key = %entry.key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store write failed, retrying"
                    );
                    self.stats.retried += 1;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        op = %entry.op,
                        key = %entry.key,
                        attempts = attempt,
                        error = %e,
                        "Store write failed, dropping entry"
                    );
                    self.stats.dropped += 1;
                    return false;
                }
            }
        }
    }
}
