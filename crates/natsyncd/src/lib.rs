//! NAT Synchronization Daemon
//!
//! Mirrors the kernel's NAT conntrack entries into APPL_DB so that
//! orchagent can program them into hardware.
//!
//! ```text
//! conntrack (NFNLGRP_CONNTRACK_*) ──▶ NatSync ──▶ APPL_DB NAPT_TABLE / NAT_TABLE
//!                                                         NAPT_TWICE_TABLE / NAT_TWICE_TABLE
//! ```
//!
//! On a warm reboot the conntrack table is restored into the kernel by an
//! external service which then sets `NAT_RESTORE_TABLE|Flags` in STATE_DB.
//! The daemon waits for that flag before reconciling.

pub mod nat_sync;

pub use nat_sync::{
    APP_NAME, DOCKER_NAME, NAPT_TABLE, NAPT_TWICE_TABLE, NAT_DEFAULTS, NAT_RESTORE_TABLE,
    NAT_TABLE, NAT_TWICE_TABLE, NatRecord, NatSync, project,
};
