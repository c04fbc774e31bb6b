//! Event dispatcher
//!
//! Routes each decoded kernel event to exactly one handler, keyed by
//! [`EventKind`]. Handlers receive the daemon context mutably, so the
//! dispatcher never owns daemon state.

use crate::error::{Result, SyncError};
use crate::event::{EventKind, KernelEvent};
use std::collections::HashMap;
use tracing::trace;

/// Handler invoked for one event kind.
pub type Handler<C> = fn(&mut C, &KernelEvent) -> Result<()>;

/// Mapping from event kind to handler.
pub struct Dispatcher<C> {
    handlers: HashMap<EventKind, Handler<C>>,
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for `kind`.
    ///
    /// A kind can only be registered once; a second registration fails
    /// immediately with [`SyncError::DuplicateHandler`].
    pub fn register(&mut self, kind: EventKind, handler: Handler<C>) -> Result<()> {
        if self.handlers.contains_key(&kind) {
            return Err(SyncError::DuplicateHandler(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn is_registered(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Invoke the handler for `event` on the calling thread.
    ///
    /// Returns `Ok(false)` when no handler is registered for the event kind.
    pub fn dispatch(&self, ctx: &mut C, event: &KernelEvent) -> Result<bool> {
        match self.handlers.get(&event.kind()) {
            Some(handler) => {
                handler(ctx, event)?;
                Ok(true)
            }
            None => {
                trace!(kind = ?event.kind(), "No handler registered, ignoring event");
                Ok(false)
            }
        }
    }
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}
