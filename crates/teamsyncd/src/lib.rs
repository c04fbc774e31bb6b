//! Team Synchronization Daemon
//!
//! Mirrors team (LAG) netdevs and their member ports from the kernel into
//! APPL_DB `LAG_TABLE` and `LAG_MEMBER_TABLE`.

pub mod team_sync;

pub use team_sync::{
    APP_NAME, DOCKER_NAME, LAG_MEMBER_TABLE, LAG_TABLE, LinkStatus, TEAM_DEFAULTS, TeamSync,
    lag_fields, lag_key, member_fields, member_key,
};
