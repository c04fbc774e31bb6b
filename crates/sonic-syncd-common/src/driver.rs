//! Event loop driver
//!
//! One cooperative loop per daemon:
//!
//! 1. `before_start` hook, warm start detection, snapshot load and bounded
//!    wait for the kernel restore signal
//! 2. group subscription, full dump, reconcile deadline armed
//! 3. `tokio::select!` over the event source, the reconcile deadline and a
//!    periodic tick until termination is requested; a receive overrun
//!    triggers a fresh dump
//! 4. `on_shutdown` hook

use crate::config::SyncdConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::SyncEngine;
use crate::error::{Result, SyncError};
use crate::event::{DumpKind, KernelEvent, NetlinkGroup};
use crate::netlink::KernelEventSource;
use crate::store::StoreClient;
use crate::warm_restart::{RestoreSignal, RestoreWait};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Default)]
struct ShutdownInner {
    requested: AtomicBool,
    notify: Notify,
}

/// Termination request shared between signal handlers and the loop.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    inner: Arc<ShutdownInner>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolve once [`Self::set`] has been called.
    pub async fn notified(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Raise `shutdown` on SIGTERM or SIGINT.
#[cfg(unix)]
pub fn install_signal_handlers(shutdown: &ShutdownFlag) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let flag = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    info!("Received SIGINT");
                }
            }
        }
        flag.set();
    });
    Ok(())
}

/// Daemon-specific behaviour plugged into the [`EventLoop`].
#[async_trait]
pub trait SyncDaemon: Send + Sized {
    type Store: StoreClient;

    fn name(&self) -> &str;

    fn engine(&self) -> &SyncEngine<Self::Store>;

    fn engine_mut(&mut self) -> &mut SyncEngine<Self::Store>;

    /// Register one handler per event kind the daemon consumes.
    fn register_handlers(dispatcher: &mut Dispatcher<Self>) -> Result<()>;

    /// Multicast groups to join.
    fn groups(&self) -> Vec<NetlinkGroup>;

    /// Kernel table to dump at start and on re-validation.
    fn dump_kind(&self) -> DumpKind;

    fn restore_signal(&self) -> RestoreSignal {
        RestoreSignal::Immediate
    }

    /// Runs before anything else. Returning `Ok(false)` means termination
    /// was requested and the loop should not start.
    async fn before_start(&mut self, _shutdown: &ShutdownFlag) -> Result<bool> {
        Ok(true)
    }

    /// Runs on every periodic tick after the aging pass.
    async fn periodic(&mut self) -> Result<()> {
        Ok(())
    }

    /// Runs once when the loop exits on a termination request.
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Timing knobs of the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub select_timeout: Duration,
    pub reconcile_timer: Duration,
    pub restore_wait_timeout: Duration,
    pub restore_poll_interval: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &SyncdConfig) -> Self {
        Self {
            select_timeout: config.select_timeout(),
            reconcile_timer: config.reconcile_timer(),
            restore_wait_timeout: config.restore_wait_timeout(),
            restore_poll_interval: config.restore_poll_interval(),
        }
    }
}

/// Single-threaded event loop of one daemon.
pub struct EventLoop<D: SyncDaemon, E> {
    daemon: D,
    source: E,
    dispatcher: Dispatcher<D>,
    settings: LoopSettings,
    shutdown: ShutdownFlag,
}

impl<D: SyncDaemon, E: KernelEventSource> EventLoop<D, E> {
    /// Build the loop and register the daemon's handlers. A duplicate
    /// registration fails here.
    pub fn new(daemon: D, source: E, settings: LoopSettings, shutdown: ShutdownFlag) -> Result<Self> {
        let mut dispatcher = Dispatcher::new();
        D::register_handlers(&mut dispatcher)?;
        Ok(Self {
            daemon,
            source,
            dispatcher,
            settings,
            shutdown,
        })
    }

    pub fn daemon(&self) -> &D {
        &self.daemon
    }

    pub fn daemon_mut(&mut self) -> &mut D {
        &mut self.daemon
    }

    pub fn source(&self) -> &E {
        &self.source
    }

    pub fn into_daemon(self) -> D {
        self.daemon
    }

    /// Run until termination is requested or a fatal error occurs.
    #[instrument(skip(self), fields(daemon = %self.daemon.name()))]
    pub async fn run(&mut self) -> Result<()> {
        if self.start().await? {
            self.run_loop().await?;
        }
        self.stop().await;
        Ok(())
    }

    /// Startup sequence. Returns `Ok(false)` if termination was requested
    /// before the loop could start.
    pub async fn start(&mut self) -> Result<bool> {
        if !self.daemon.before_start(&self.shutdown).await? {
            return Ok(false);
        }

        let mut reconcile_timer = None;
        if self.daemon.engine_mut().detect_warm_start().await? {
            info!("Warm restart enabled");
            let restored = self.daemon.engine_mut().begin_warm_start().await?;
            debug!(restored, "Buffering store writes until reconciliation");

            let signal = self.daemon.restore_signal();
            let outcome = self
                .daemon
                .engine_mut()
                .wait_for_restore(
                    &signal,
                    self.settings.restore_wait_timeout,
                    self.settings.restore_poll_interval,
                    &self.shutdown,
                )
                .await?;
            if outcome == RestoreWait::Interrupted {
                return Ok(false);
            }

            reconcile_timer = Some(
                self.daemon
                    .engine_mut()
                    .resolve_reconcile_timer(self.settings.reconcile_timer)
                    .await,
            );
        }

        for group in self.daemon.groups() {
            self.source.register_group(group)?;
        }
        self.source.dump_request(self.daemon.dump_kind())?;

        if let Some(timer) = reconcile_timer {
            self.daemon.engine_mut().open_reconcile_window(timer).await;
        }
        info!(state = %self.daemon.engine().restart_state(), "Listening for kernel events");
        Ok(true)
    }

    async fn run_loop(&mut self) -> Result<()> {
        let period = self.settings.select_timeout;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.shutdown.is_set() {
                break;
            }

            let deadline = self.daemon.engine().reconcile_deadline();
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.daemon.engine_mut().reconcile().await;
                }
                event = self.source.next_event() => match event {
                    Ok(KernelEvent::DumpDone { sequence }) => {
                        self.daemon.engine_mut().dump_complete(sequence);
                    }
                    Ok(event) => self.handle_event(event)?,
                    Err(SyncError::Overrun) => {
                        warn!("Kernel notifications were lost, requesting a full dump");
                        self.request_dump()?;
                    }
                    Err(e) => self.handle_error(e)?,
                },
                _ = ticker.tick() => self.on_tick().await?,
            }

            self.daemon.engine_mut().flush().await;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: KernelEvent) -> Result<()> {
        match self.dispatcher.dispatch(&mut self.daemon, &event) {
            Ok(_) => Ok(()),
            Err(e) => self.handle_error(e),
        }
    }

    /// Request a full dump and hand its sequence number to the engine.
    fn request_dump(&mut self) -> Result<()> {
        let kind = self.daemon.dump_kind();
        match self.source.dump_request(kind) {
            Ok(sequence) => {
                self.daemon.engine_mut().dump_requested(sequence);
                Ok(())
            }
            Err(e) => {
                self.daemon.engine_mut().dump_request_failed();
                self.handle_error(e)
            }
        }
    }

    async fn on_tick(&mut self) -> Result<()> {
        if self.daemon.engine_mut().age() {
            self.request_dump()?;
        }
        if let Err(e) = self.daemon.periodic().await {
            self.handle_error(e)?;
        }
        Ok(())
    }

    /// Log and continue on transient errors; stop on anything else.
    fn handle_error(&self, e: SyncError) -> Result<()> {
        if e.is_fatal() {
            error!(error = %e, class = ?e.class(), "Fatal error, stopping");
            return Err(e);
        }
        warn!(error = %e, "Transient error, continuing");
        Ok(())
    }

    async fn stop(&mut self) {
        info!("Shutting down");
        if let Err(e) = self.daemon.on_shutdown().await {
            warn!(error = %e, "Shutdown hook failed");
        }
        self.daemon.engine_mut().flush().await;
    }
}
