//! Entity listeners, after-load actions and session lifecycle callbacks.

use std::sync::Arc;

use hibernate_core::{EntityPersister, Result, Value};

use crate::instance::EntityRef;

// ============================================================================
// Entity Listeners
// ============================================================================

/// Hooks around the lifecycle of individual entities.
///
/// `pre_load` sees the hydrated column state before any property is set.
/// `post_load` runs once per entity after the whole load has finished, so
/// the graph it observes is complete. Errors from either are logged and
/// counted, never propagated; the load has already succeeded.
///
/// The flush-side hooks run synchronously while the flush plans its
/// statements; an error aborts the flush.
pub trait EntityListener: Send + Sync {
    fn pre_load(&self, entity_name: &str, identifier: &Value, state: &[Value]) -> Result<()> {
        let _ = (entity_name, identifier, state);
        Ok(())
    }

    fn post_load(&self, entity: &EntityRef) -> Result<()> {
        let _ = entity;
        Ok(())
    }

    fn pre_persist(&self, entity: &EntityRef) -> Result<()> {
        let _ = entity;
        Ok(())
    }

    fn pre_update(&self, entity: &EntityRef) -> Result<()> {
        let _ = entity;
        Ok(())
    }

    fn pre_remove(&self, entity: &EntityRef) -> Result<()> {
        let _ = entity;
        Ok(())
    }

    /// After an entity's insert, update or delete was written.
    fn post_flush_entity(&self, entity: &EntityRef) -> Result<()> {
        let _ = entity;
        Ok(())
    }
}

/// Work queued by a load and run after every entity is initialized.
pub trait AfterLoadAction: Send + Sync {
    fn after_load(&self, entity: &EntityRef, persister: &EntityPersister) -> Result<()>;
}

impl<F> AfterLoadAction for F
where
    F: Fn(&EntityRef, &EntityPersister) -> Result<()> + Send + Sync,
{
    fn after_load(&self, entity: &EntityRef, persister: &EntityPersister) -> Result<()> {
        self(entity, persister)
    }
}

pub(crate) type SharedListener = Arc<dyn EntityListener>;
pub(crate) type SharedAfterLoadAction = Arc<dyn AfterLoadAction>;

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Returning `Err` from a `before_*` callback aborts the operation. Errors
/// from `after_*` callbacks are logged and ignored because the work is done.
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    pub fn register(&mut self, event: SessionEvent, callback: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks_mut(event).push(Box::new(callback));
    }

    fn callbacks_mut(&mut self, event: SessionEvent) -> &mut Vec<SessionEventFn> {
        match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        }
    }

    /// Run the callbacks of `event`.
    pub(crate) fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let after = event.is_after();
        for cb in self.callbacks_mut(event).iter_mut() {
            match cb() {
                Ok(()) => {}
                Err(e) if after => {
                    tracing::warn!(event = ?event, error = %e, "Session callback failed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.before_flush.is_empty()
            && self.after_flush.is_empty()
            && self.before_commit.is_empty()
            && self.after_commit.is_empty()
            && self.after_rollback.is_empty()
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush executes pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (after flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

impl SessionEvent {
    pub const fn is_after(self) -> bool {
        matches!(
            self,
            SessionEvent::AfterFlush | SessionEvent::AfterCommit | SessionEvent::AfterRollback
        )
    }
}
