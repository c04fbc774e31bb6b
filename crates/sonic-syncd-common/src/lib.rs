//! Warm-restart-aware kernel to SWSS database sync engine
//!
//! Shared core of the SONiC `*syncd` daemons that mirror kernel networking
//! state into APPL_DB: `natsyncd` (conntrack NAT entries) and `teamsyncd`
//! (team/LAG links).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌────────────┐    ┌───────────┐    ┌─────────────┐
//! │ Netlink      │───▶│ Dispatcher │───▶│ SyncCache │───▶│ StoreWriter │───▶ APPL_DB
//! │ event source │    │ (per kind) │    │           │    │             │
//! └──────────────┘    └────────────┘    └───────────┘    └─────────────┘
//!        ▲                                                     ▲
//!        │ dump                                                │ buffer / flush
//!  ┌─────┴──────┐                                       ┌──────┴──────┐
//!  │ EventLoop  │──────────── reconcile deadline ──────▶│ Reconciler  │◀── STATE_DB
//!  └────────────┘                                       └─────────────┘    CONFIG_DB
//! ```
//!
//! On a cold start every change is written as it is observed. On a warm
//! start the records previously published are read back, writes are held
//! while the kernel state is re-learned, and only the difference is written
//! when the reconcile timer fires.

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod engine;
pub mod error;
pub mod event;
pub mod logging;
pub mod netlink;
pub mod reconcile;
pub mod redis_store;
pub mod store;
pub mod types;
pub mod warm_restart;
pub mod writer;

pub use cache::SyncCache;
pub use config::{DaemonDefaults, SyncdConfig};
pub use dispatcher::{Dispatcher, Handler};
pub use driver::{EventLoop, LoopSettings, ShutdownFlag, SyncDaemon};
pub use engine::SyncEngine;
pub use error::{ErrorClass, Result, SyncError};
pub use event::{
    ConntrackEvent, ConntrackTuple, DumpKind, EventKind, KernelEvent, LinkEvent, NetlinkGroup,
};
pub use netlink::{KernelEventSource, MockEventSource};
#[cfg(target_os = "linux")]
pub use netlink::{NetlinkEventSource, NetlinkProtocol};
pub use reconcile::{ReconcileReport, Reconciler};
pub use redis_store::RedisStore;
pub use store::{MemoryStore, StoreClient, StoreOp};
pub use types::{
    DbId, FieldValues, Operation, Origin, PublishedEntry, RestartState, SyncedRecord, TableKey,
    field_values,
};
pub use warm_restart::{RestoreSignal, RestoreWait, WarmRestart, WarmStartState};
pub use writer::{RetryPolicy, StoreWriter, WriterMode, WriterStats};
