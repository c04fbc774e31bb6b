//! Kernel event source
//!
//! [`KernelEventSource`] is what the event loop reads from. On Linux
//! [`NetlinkEventSource`] subscribes to multicast groups on a netlink
//! socket; [`MockEventSource`] replays scripted events for tests and
//! non-Linux development builds.

pub mod conntrack;
pub mod frame;
#[cfg(target_os = "linux")]
pub mod link;
#[cfg(target_os = "linux")]
mod socket;

#[cfg(target_os = "linux")]
pub use socket::{NetlinkEventSource, NetlinkProtocol};

use crate::error::{Result, SyncError};
use crate::event::{DumpKind, KernelEvent, NetlinkGroup};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Source of decoded kernel notifications.
#[async_trait]
pub trait KernelEventSource: Send {
    /// Subscribe to a multicast group.
    fn register_group(&mut self, group: NetlinkGroup) -> Result<()>;

    /// Ask the kernel to replay its full state of `kind` as ordinary
    /// notifications followed by [`KernelEvent::DumpDone`]. Returns the
    /// request sequence number carried by that closing event.
    fn dump_request(&mut self, kind: DumpKind) -> Result<u32>;

    /// Wait for the next decoded event.
    ///
    /// Must be cancel-safe: it is polled from `tokio::select!`. A receive
    /// buffer overrun is reported as [`SyncError::Overrun`](crate::SyncError::Overrun).
    async fn next_event(&mut self) -> Result<KernelEvent>;
}

#[derive(Debug)]
enum Scripted {
    Event(KernelEvent),
    Overrun,
}

#[derive(Debug, Default)]
struct MockState {
    queue: VecDeque<Scripted>,
    kernel_state: Vec<KernelEvent>,
    groups: Vec<NetlinkGroup>,
    dumps: Vec<DumpKind>,
    sequence: u32,
    hold_dumps: bool,
    held: Vec<Scripted>,
}

#[derive(Debug, Default)]
struct MockShared {
    state: Mutex<MockState>,
    notify: Notify,
}

/// Scripted event source.
///
/// Clones share state: a test keeps one handle to push events or change
/// the simulated kernel table while the event loop owns another. A dump
/// request queues the current kernel table and a closing `DumpDone`. With
/// nothing queued, [`KernelEventSource::next_event`] waits until something
/// is pushed.
#[derive(Debug, Clone, Default)]
pub struct MockEventSource {
    shared: Arc<MockShared>,
}

impl MockEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&self, item: Scripted) {
        self.shared.state.lock().queue.push_back(item);
        self.shared.notify.notify_one();
    }

    /// Queue a notification.
    pub fn push(&self, event: KernelEvent) {
        self.enqueue(Scripted::Event(event));
    }

    /// Queue a receive buffer overrun.
    pub fn push_overrun(&self) {
        self.enqueue(Scripted::Overrun);
    }

    /// Replace the simulated kernel table replayed on dump requests.
    pub fn set_kernel_state(&self, events: Vec<KernelEvent>) {
        self.shared.state.lock().kernel_state = events;
    }

    /// Keep dump replies back until [`Self::release_dumps`], as a kernel
    /// walking a large table would.
    pub fn hold_dumps(&self) {
        self.shared.state.lock().hold_dumps = true;
    }

    /// Deliver every held dump reply and stop holding.
    pub fn release_dumps(&self) {
        let mut state = self.shared.state.lock();
        state.hold_dumps = false;
        let held = std::mem::take(&mut state.held);
        state.queue.extend(held);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Groups registered so far, in order.
    pub fn groups(&self) -> Vec<NetlinkGroup> {
        self.shared.state.lock().groups.clone()
    }

    /// Dump requests issued so far, in order.
    pub fn dumps(&self) -> Vec<DumpKind> {
        self.shared.state.lock().dumps.clone()
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}

#[async_trait]
impl KernelEventSource for MockEventSource {
    fn register_group(&mut self, group: NetlinkGroup) -> Result<()> {
        debug!(?group, "Mock source registered group");
        self.shared.state.lock().groups.push(group);
        Ok(())
    }

    fn dump_request(&mut self, kind: DumpKind) -> Result<u32> {
        let mut state = self.shared.state.lock();
        state.sequence += 1;
        let sequence = state.sequence;
        state.dumps.push(kind);

        let mut reply: Vec<Scripted> = state
            .kernel_state
            .iter()
            .cloned()
            .map(Scripted::Event)
            .collect();
        reply.push(Scripted::Event(KernelEvent::DumpDone { sequence }));
        debug!(?kind, sequence, count = reply.len() - 1, "Mock source replaying kernel state");

        if state.hold_dumps {
            state.held.extend(reply);
        } else {
            state.queue.extend(reply);
        }
        drop(state);
        self.shared.notify.notify_one();
        Ok(sequence)
    }

    async fn next_event(&mut self) -> Result<KernelEvent> {
        loop {
            let notified = self.shared.notify.notified();
            let next = self.shared.state.lock().queue.pop_front();
            match next {
                Some(Scripted::Event(event)) => return Ok(event),
                Some(Scripted::Overrun) => return Err(SyncError::Overrun),
                None => {}
            }
            notified.await;
        }
    }
}
