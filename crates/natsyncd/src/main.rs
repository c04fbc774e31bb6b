//! NAT Synchronization Daemon
//!
//! Listens for conntrack netlink events and synchronizes NAT entries to
//! SONiC databases.

use anyhow::Context;
use clap::Parser;
use sonic_natsyncd::{NAT_DEFAULTS, NatSync};
use sonic_syncd_common::driver::install_signal_handlers;
use sonic_syncd_common::{EventLoop, LoopSettings, RedisStore, ShutdownFlag, SyncdConfig, logging};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "natsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long, default_value = "/etc/sonic/natsyncd.conf")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init("natsyncd")?;

    info!("natsyncd: Starting NAT synchronization daemon");

    match run_daemon(args).await {
        Ok(()) => {
            info!("natsyncd: Daemon exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "natsyncd: Daemon exiting with error");
            Err(e)
        }
    }
}

async fn run_daemon(args: Args) -> anyhow::Result<()> {
    let config = SyncdConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?
        .with_daemon_defaults(NAT_DEFAULTS);
    config.validate()?;

    let shutdown = ShutdownFlag::new();
    install_signal_handlers(&shutdown)?;

    let store = RedisStore::connect(&config.database)
        .await
        .context("connecting to Redis")?;
    let daemon = NatSync::new(store, &config);

    #[cfg(target_os = "linux")]
    let source = sonic_syncd_common::NetlinkEventSource::new(
        sonic_syncd_common::NetlinkProtocol::Netfilter,
    )
    .context("opening conntrack netlink socket")?;
    #[cfg(not(target_os = "linux"))]
    let source = {
        tracing::warn!("natsyncd: No netlink on this platform, no kernel events will be seen");
        sonic_syncd_common::MockEventSource::new()
    };

    let mut event_loop = EventLoop::new(daemon, source, LoopSettings::from_config(&config), shutdown)?;
    event_loop.run().await?;
    Ok(())
}
