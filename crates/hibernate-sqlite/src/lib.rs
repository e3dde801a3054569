//! SQLite connection for the persistence engine.
//!
// FFI bindings require unsafe code
#![allow(unsafe_code)]
//!
//! Implements the synchronous `Connection` trait from `hibernate-core` on top
//! of `libsqlite3-sys` (with SQLite bundled).
//!
//! - Lazy, forward-only cursors: rows are stepped as the loader consumes them
//! - Transactions mapped onto `BEGIN DEFERRED/IMMEDIATE/EXCLUSIVE`
//! - Errors mapped onto `DataAccessErrorKind` (constraint, busy, interrupted)
//! - In-memory and file-based databases
//!
//! # Example
//!
//! ```rust,ignore
//! use hibernate_core::{Connection, Value};
//! use hibernate_sqlite::SqliteConnection;
//!
//! let mut conn = SqliteConnection::open_memory()?;
//! conn.execute_raw("CREATE TABLE team (id INTEGER PRIMARY KEY, name TEXT)")?;
//! conn.execute("insert into team (id, name) values (?, ?)", &[Value::BigInt(1), "Avengers".into()])?;
//! ```

pub mod connection;
pub mod types;

pub use connection::{OpenFlags, SqliteConfig, SqliteConnection};

use std::ffi::CStr;

/// The SQLite library version, e.g. `"3.46.0"`.
pub fn sqlite_version() -> &'static str {
    // SAFETY: libversion returns a static, NUL-terminated string
    unsafe { CStr::from_ptr(libsqlite3_sys::sqlite3_libversion()) }
        .to_str()
        .unwrap_or("unknown")
}

/// The SQLite library version number, e.g. `3046000`.
pub fn sqlite_version_number() -> i32 {
    // SAFETY: no preconditions
    unsafe { libsqlite3_sys::sqlite3_libversion_number() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_version() {
        let version = sqlite_version();
        assert!(version.starts_with('3'));
        assert!(sqlite_version_number() >= 3_000_000);
    }
}
