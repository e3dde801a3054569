//! Entity entries: the persistence context's record of one managed instance.

use std::fmt;
use std::sync::Arc;

use hibernate_core::{EntityKey, EntityPersister, Error, Result, Value};

/// Lifecycle status of a managed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Managed,
    ReadOnly,
    /// Scheduled for deletion at the next flush.
    Deleted,
    /// Deleted and flushed.
    Gone,
    /// Scheduled for insertion at the next flush.
    Saving,
    /// Registered by an in-progress load, not yet initialized.
    Loading,
}

impl Status {
    /// Whether the state machine allows `self -> next`.
    pub const fn can_transition_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Loading | Status::Saving, Status::Managed | Status::ReadOnly)
                | (Status::Managed, Status::ReadOnly)
                | (Status::ReadOnly, Status::Managed)
                | (Status::Managed | Status::ReadOnly | Status::Saving, Status::Deleted)
                | (Status::Deleted, Status::Gone | Status::Managed)
        )
    }

    pub const fn is_deleted_or_gone(self) -> bool {
        matches!(self, Status::Deleted | Status::Gone)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Managed => "MANAGED",
            Status::ReadOnly => "READ_ONLY",
            Status::Deleted => "DELETED",
            Status::Gone => "GONE",
            Status::Saving => "SAVING",
            Status::Loading => "LOADING",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock level held on an entity, ordered weakest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    #[default]
    None,
    Read,
    OptimisticForceIncrement,
    PessimisticWrite,
    Write,
}

impl LockMode {
    pub fn greater_than(self, other: LockMode) -> bool {
        self > other
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            LockMode::None => "NONE",
            LockMode::Read => "READ",
            LockMode::OptimisticForceIncrement => "OPTIMISTIC_FORCE_INCREMENT",
            LockMode::PessimisticWrite => "PESSIMISTIC_WRITE",
            LockMode::Write => "WRITE",
        }
    }
}

/// Bookkeeping for one managed entity.
///
/// `loaded_state` holds one value per persister property, in property order:
/// the basic value, the foreign key identifier of an owning to-one, and
/// `Null` for collections and inverse to-ones.
#[derive(Debug, Clone)]
pub struct EntityEntry {
    status: Status,
    loaded_state: Vec<Value>,
    persister: Arc<EntityPersister>,
    key: EntityKey,
    lock_mode: LockMode,
    version: Option<Value>,
    exists_in_database: bool,
    force_version_increment: bool,
}

impl EntityEntry {
    #[must_use]
    pub fn new(
        status: Status,
        loaded_state: Vec<Value>,
        key: EntityKey,
        persister: Arc<EntityPersister>,
        version: Option<Value>,
        lock_mode: LockMode,
        exists_in_database: bool,
    ) -> Self {
        Self {
            status,
            loaded_state,
            persister,
            key,
            lock_mode,
            version,
            exists_in_database,
            force_version_increment: false,
        }
    }

    /// Entry for an instance registered by a load that is still in progress.
    pub(crate) fn loading(key: EntityKey, persister: Arc<EntityPersister>) -> Self {
        Self::new(Status::Loading, Vec::new(), key, persister, None, LockMode::None, true)
    }

    /// Entry for an instance scheduled for insertion.
    pub(crate) fn saving(key: EntityKey, persister: Arc<EntityPersister>, version: Option<Value>) -> Self {
        Self::new(Status::Saving, Vec::new(), key, persister, version, LockMode::Write, false)
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn loaded_state(&self) -> &[Value] {
        &self.loaded_state
    }

    pub fn persister(&self) -> &Arc<EntityPersister> {
        &self.persister
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn entity_name(&self) -> &str {
        self.key.entity_name()
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    pub fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    pub fn is_read_only(&self) -> bool {
        self.status == Status::ReadOnly
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn set_status(&mut self, next: Status) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(Error::assertion(format!(
                "invalid status transition {} -> {} for {}",
                self.status, next, self.key
            )));
        }
        tracing::trace!(
            entity = %self.key.entity_name(),
            id = ?self.key.identifier(),
            from = self.status.as_str(),
            to = next.as_str(),
            "Entry status change"
        );
        self.status = next;
        Ok(())
    }

    pub fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        match self.status {
            Status::Managed | Status::ReadOnly => {
                self.set_status(if read_only { Status::ReadOnly } else { Status::Managed })
            }
            Status::Saving if read_only => self.set_status(Status::ReadOnly),
            Status::Saving => Ok(()),
            other => Err(Error::assertion(format!(
                "cannot change the read-only state of {} in status {}",
                self.key, other
            ))),
        }
    }

    /// Raise the lock mode; weaker modes are ignored.
    pub fn upgrade_lock(&mut self, mode: LockMode) {
        if mode.greater_than(self.lock_mode) {
            self.lock_mode = mode;
        }
    }

    pub fn requires_version_increment(&self) -> bool {
        self.force_version_increment
    }

    pub(crate) fn force_version_increment(&mut self) {
        self.force_version_increment = true;
    }

    /// Install the state read by a load and leave the LOADING status.
    pub(crate) fn post_load(&mut self, loaded_state: Vec<Value>, version: Option<Value>, read_only: bool) -> Result<()> {
        self.loaded_state = loaded_state;
        self.version = version;
        self.exists_in_database = true;
        self.set_status(if read_only { Status::ReadOnly } else { Status::Managed })
    }

    /// Refresh the snapshot after an insert or update was written.
    pub(crate) fn post_flush(&mut self, loaded_state: Vec<Value>, version: Option<Value>) -> Result<()> {
        if !self.exists_in_database && self.lock_mode == LockMode::Write {
            self.lock_mode = LockMode::Read;
        }
        self.loaded_state = loaded_state;
        self.version = version;
        self.exists_in_database = true;
        self.force_version_increment = false;
        if self.status == Status::Saving {
            self.set_status(Status::Managed)?;
        }
        Ok(())
    }

    /// Snapshot replaced without a status change (refresh, lock).
    pub(crate) fn set_loaded_state(&mut self, loaded_state: Vec<Value>, version: Option<Value>) {
        self.loaded_state = loaded_state;
        self.version = version;
    }
}
