//! Cascade styles and actions.
//!
//! A [`CascadeStyle`] is the per-association mapping flag set; a
//! [`CascadeAction`] is the operation currently being propagated. An action
//! travels across an association only when the association's style enables it.

use std::fmt;

use crate::error::{Error, Result};

/// An operation that can be cascaded across associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeAction {
    /// Make a transient instance persistent
    Persist,
    /// Persist cascade re-run from managed entities at flush time
    PersistOnFlush,
    /// Copy detached state onto a managed instance
    Merge,
    /// Schedule deletion
    Delete,
    /// Reattach with a lock mode
    Lock,
    /// Re-read state from the database
    Refresh,
    /// Copy an instance into the database as-is
    Replicate,
    /// Remove from the persistence context
    Evict,
}

impl CascadeAction {
    /// Save-type actions cascade to to-one targets before the entity's own row
    /// operation and to collections after it.
    pub const fn is_save_type(self) -> bool {
        matches!(
            self,
            CascadeAction::Persist
                | CascadeAction::PersistOnFlush
                | CascadeAction::Merge
                | CascadeAction::Replicate
        )
    }

    /// Whether the action walks into uninitialized collections.
    pub const fn initializes_collections(self) -> bool {
        matches!(self, CascadeAction::Delete)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            CascadeAction::Persist => "persist",
            CascadeAction::PersistOnFlush => "persist-on-flush",
            CascadeAction::Merge => "merge",
            CascadeAction::Delete => "delete",
            CascadeAction::Lock => "lock",
            CascadeAction::Refresh => "refresh",
            CascadeAction::Replicate => "replicate",
            CascadeAction::Evict => "evict",
        }
    }
}

impl fmt::Display for CascadeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which cascade actions an association propagates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeStyle {
    pub persist: bool,
    pub merge: bool,
    pub delete: bool,
    pub lock: bool,
    pub refresh: bool,
    pub replicate: bool,
    pub evict: bool,
    pub delete_orphan: bool,
}

impl CascadeStyle {
    pub const NONE: CascadeStyle = CascadeStyle {
        persist: false,
        merge: false,
        delete: false,
        lock: false,
        refresh: false,
        replicate: false,
        evict: false,
        delete_orphan: false,
    };

    pub const ALL: CascadeStyle = CascadeStyle {
        persist: true,
        merge: true,
        delete: true,
        lock: true,
        refresh: true,
        replicate: true,
        evict: true,
        delete_orphan: false,
    };

    pub const ALL_DELETE_ORPHAN: CascadeStyle = CascadeStyle {
        delete_orphan: true,
        ..CascadeStyle::ALL
    };

    /// Parse a comma-separated cascade string such as `"persist, merge"` or
    /// `"all-delete-orphan"`.
    pub fn parse(styles: &str) -> Result<Self> {
        let mut style = CascadeStyle::NONE;
        for token in styles.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.to_ascii_lowercase().as_str() {
                "none" => {}
                "all" => {
                    let orphan = style.delete_orphan;
                    style = CascadeStyle::ALL;
                    style.delete_orphan = orphan;
                }
                "all-delete-orphan" => style = CascadeStyle::ALL_DELETE_ORPHAN,
                "persist" | "save-update" => style.persist = true,
                "merge" => style.merge = true,
                "delete" | "remove" => style.delete = true,
                "lock" => style.lock = true,
                "refresh" => style.refresh = true,
                "replicate" => style.replicate = true,
                "evict" | "detach" => style.evict = true,
                "delete-orphan" => style.delete_orphan = true,
                other => {
                    return Err(Error::mapping(
                        None,
                        None,
                        format!("unsupported cascade style: {}", other),
                    ));
                }
            }
        }
        Ok(style)
    }

    /// Does this style propagate the given action?
    pub const fn does_cascade(&self, action: CascadeAction) -> bool {
        match action {
            CascadeAction::Persist | CascadeAction::PersistOnFlush => self.persist,
            CascadeAction::Merge => self.merge,
            CascadeAction::Delete => self.delete,
            CascadeAction::Lock => self.lock,
            CascadeAction::Refresh => self.refresh,
            CascadeAction::Replicate => self.replicate,
            CascadeAction::Evict => self.evict,
        }
    }

    /// Does this style propagate anything at all?
    pub const fn has_any(&self) -> bool {
        self.persist
            || self.merge
            || self.delete
            || self.lock
            || self.refresh
            || self.replicate
            || self.evict
            || self.delete_orphan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_combinations() {
        let style = CascadeStyle::parse("persist, merge").unwrap();
        assert!(style.does_cascade(CascadeAction::Persist));
        assert!(style.does_cascade(CascadeAction::PersistOnFlush));
        assert!(style.does_cascade(CascadeAction::Merge));
        assert!(!style.does_cascade(CascadeAction::Delete));

        let style = CascadeStyle::parse("all,delete-orphan").unwrap();
        assert_eq!(style, CascadeStyle::ALL_DELETE_ORPHAN);

        let style = CascadeStyle::parse("delete-orphan,all").unwrap();
        assert!(style.delete_orphan && style.delete);

        let style = CascadeStyle::parse("save-update").unwrap();
        assert!(style.persist && !style.merge);

        assert_eq!(CascadeStyle::parse("none").unwrap(), CascadeStyle::NONE);
        assert!(!CascadeStyle::NONE.has_any());
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(matches!(
            CascadeStyle::parse("persist,explode"),
            Err(Error::Mapping(_))
        ));
    }

    #[test]
    fn test_action_kinds() {
        assert!(CascadeAction::Persist.is_save_type());
        assert!(CascadeAction::Merge.is_save_type());
        assert!(!CascadeAction::Delete.is_save_type());
        assert!(CascadeAction::Delete.initializes_collections());
        assert_eq!(CascadeAction::Evict.to_string(), "evict");
    }
}
