//! Team Synchronization Daemon
//!
//! Listens for link netlink events and synchronizes team (LAG) state to
//! SONiC databases.

use anyhow::Context;
use clap::Parser;
use sonic_syncd_common::driver::install_signal_handlers;
use sonic_syncd_common::{EventLoop, LoopSettings, RedisStore, ShutdownFlag, SyncdConfig, logging};
use sonic_teamsyncd::{TEAM_DEFAULTS, TeamSync};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "teamsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long, default_value = "/etc/sonic/teamsyncd.conf")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init("teamsyncd")?;

    info!("teamsyncd: Starting team synchronization daemon");

    match run_daemon(args).await {
        Ok(()) => {
            info!("teamsyncd: Daemon exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "teamsyncd: Daemon exiting with error");
            Err(e)
        }
    }
}

async fn run_daemon(args: Args) -> anyhow::Result<()> {
    let config = SyncdConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?
        .with_daemon_defaults(TEAM_DEFAULTS);
    config.validate()?;

    let shutdown = ShutdownFlag::new();
    install_signal_handlers(&shutdown)?;

    let store = RedisStore::connect(&config.database)
        .await
        .context("connecting to Redis")?;
    let daemon = TeamSync::new(store, &config);

    #[cfg(target_os = "linux")]
    let source = sonic_syncd_common::NetlinkEventSource::new(
        sonic_syncd_common::NetlinkProtocol::Route,
    )
    .context("opening route netlink socket")?;
    #[cfg(not(target_os = "linux"))]
    let source = {
        tracing::warn!("teamsyncd: No netlink on this platform, no kernel events will be seen");
        sonic_syncd_common::MockEventSource::new()
    };

    let mut event_loop = EventLoop::new(daemon, source, LoopSettings::from_config(&config), shutdown)?;
    event_loop.run().await?;
    Ok(())
}
