//! SQLite connection implementation.
//!
//! Safe wrappers around SQLite's C API implementing the engine's
//! [`Connection`] trait. Queries return a lazy cursor that steps the
//! prepared statement as rows are consumed, so a failure part-way through a
//! result set reaches the caller as an `Err` item.

#![allow(clippy::borrow_as_ptr)] // FFI requires raw pointers
#![allow(clippy::if_not_else)]

use crate::types;
use hibernate_core::error::{DataAccessError, DataAccessErrorKind, Error, Result};
use hibernate_core::{ColumnInfo, Connection, IsolationLevel, Row, Rows, Value};
// The pre-generated bundled bindings in libsqlite3-sys omit
// `sqlite3_close_v2`, although the bundled library exports it.
mod ffi {
    pub use libsqlite3_sys::*;

    unsafe extern "C" {
        pub fn sqlite3_close_v2(db: *mut sqlite3) -> std::ffi::c_int;
    }
}
use std::ffi::{CStr, CString, c_int};
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;

/// Configuration for opening SQLite connections.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file, or ":memory:" for an in-memory database.
    pub path: String,
    pub flags: OpenFlags,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Enforce `REFERENCES` constraints.
    pub foreign_keys: bool,
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read_only: bool,
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Enable URI filename interpretation.
    pub uri: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Read-write access; the database must exist.
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;

        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }

        // Default to read-write if no mode specified
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }

        flags
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
            foreign_keys: true,
        }
    }
}

impl SqliteConfig {
    /// Create a config for a file-based database.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create a config for an in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }
}

/// A connection to a SQLite database.
///
/// The handle is owned by one session at a time; the engine never shares a
/// connection across threads while a unit of work is in progress.
pub struct SqliteConnection {
    db: *mut ffi::sqlite3,
    in_transaction: bool,
    path: String,
}

// SAFETY: the handle is only used through `&mut self` (or `&self` for
// read-only accessors that do not touch SQLite), so it is never used from two
// threads at once. SQLite is built in serialized mode by default.
unsafe impl Send for SqliteConnection {}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .field("open", &!self.db.is_null())
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl SqliteConnection {
    /// Open a connection with the given configuration.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let c_path = CString::new(config.path.as_str())
            .map_err(|_| data_error(DataAccessErrorKind::Connection, None, "invalid path: contains null byte"))?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let flags = config.flags.to_sqlite_flags();

        // SAFETY: We pass valid pointers and check the return value
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != ffi::SQLITE_OK {
            let msg = if !db.is_null() {
                // SAFETY: db is valid, errmsg returns a valid C string
                unsafe {
                    let msg = errmsg(db);
                    ffi::sqlite3_close(db);
                    msg
                }
            } else {
                error_string(rc)
            };
            return Err(data_error(
                DataAccessErrorKind::Connection,
                None,
                format!("failed to open database {}: {}", config.path, msg),
            ));
        }

        if config.busy_timeout_ms > 0 {
            // SAFETY: db is valid
            unsafe {
                ffi::sqlite3_busy_timeout(db, config.busy_timeout_ms as c_int);
            }
        }

        let mut conn = Self {
            db,
            in_transaction: false,
            path: config.path.clone(),
        };
        if config.foreign_keys {
            conn.execute_raw("PRAGMA foreign_keys = ON")?;
        }
        tracing::debug!(path = %conn.path, "opened sqlite connection");
        Ok(conn)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    /// Open a file-based database, creating it if needed.
    pub fn open_file(path: impl Into<String>) -> Result<Self> {
        Self::open(&SqliteConfig::file(path))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Execute one or more `;`-separated statements without parameters.
    ///
    /// Used for DDL and transaction control.
    pub fn execute_raw(&mut self, sql: &str) -> Result<()> {
        let db = self.handle(sql)?;
        let c_sql = CString::new(sql).map_err(|_| {
            data_error(DataAccessErrorKind::Statement, Some(sql), "SQL contains null byte")
        })?;

        let mut errmsg_ptr: *mut std::ffi::c_char = ptr::null_mut();

        // SAFETY: db is open, c_sql is a valid C string, errmsg_ptr receives
        // a SQLite-allocated message that we free below.
        let rc = unsafe { ffi::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg_ptr) };

        if rc != ffi::SQLITE_OK {
            let msg = if !errmsg_ptr.is_null() {
                // SAFETY: errmsg_ptr is a valid C string allocated by SQLite
                unsafe {
                    let msg = CStr::from_ptr(errmsg_ptr).to_string_lossy().into_owned();
                    ffi::sqlite3_free(errmsg_ptr.cast());
                    msg
                }
            } else {
                error_string(rc)
            };
            return Err(data_error(error_code_to_kind(rc), Some(sql), msg));
        }

        Ok(())
    }

    /// Rowid of the most recent successful insert.
    pub fn last_insert_rowid(&self) -> i64 {
        if self.db.is_null() {
            return 0;
        }
        // SAFETY: db is open
        unsafe { ffi::sqlite3_last_insert_rowid(self.db) }
    }

    /// Rows changed by the most recent statement.
    pub fn changes(&self) -> u64 {
        if self.db.is_null() {
            return 0;
        }
        // SAFETY: db is open
        let changes = unsafe { ffi::sqlite3_changes(self.db) };
        u64::try_from(changes).unwrap_or(0)
    }

    /// Close the handle. Later calls fail with a `Closed` error.
    pub fn close(&mut self) -> Result<()> {
        if self.db.is_null() {
            return Ok(());
        }
        // SAFETY: db is open; close_v2 defers the close until any
        // outstanding statements are finalized.
        let rc = unsafe { ffi::sqlite3_close_v2(self.db) };
        if rc != ffi::SQLITE_OK {
            return Err(data_error(DataAccessErrorKind::Connection, None, error_string(rc)));
        }
        self.db = ptr::null_mut();
        self.in_transaction = false;
        tracing::debug!(path = %self.path, "closed sqlite connection");
        Ok(())
    }

    fn handle(&self, sql: &str) -> Result<*mut ffi::sqlite3> {
        if self.db.is_null() {
            return Err(data_error(
                DataAccessErrorKind::Closed,
                Some(sql),
                "connection is closed",
            ));
        }
        Ok(self.db)
    }

    fn prepare(&self, sql: &str, params: &[Value]) -> Result<*mut ffi::sqlite3_stmt> {
        let db = self.handle(sql)?;
        let c_sql = CString::new(sql).map_err(|_| {
            data_error(DataAccessErrorKind::Statement, Some(sql), "SQL contains null byte")
        })?;

        let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
        // SAFETY: db is open and c_sql is a valid C string
        let rc = unsafe { ffi::sqlite3_prepare_v2(db, c_sql.as_ptr(), -1, &mut stmt, ptr::null_mut()) };
        if rc != ffi::SQLITE_OK {
            return Err(database_error(db, sql));
        }

        for (i, param) in params.iter().enumerate() {
            // SAFETY: stmt is valid and indices are 1-based
            let rc = match unsafe { types::bind_value(stmt, (i + 1) as c_int, param) } {
                Ok(rc) => rc,
                Err(err) => {
                    // SAFETY: stmt is valid and not yet handed out
                    unsafe { ffi::sqlite3_finalize(stmt) };
                    return Err(with_sql(err, sql));
                }
            };
            if rc != ffi::SQLITE_OK {
                let err = bind_error(db, sql, i + 1);
                // SAFETY: stmt is valid and not yet handed out
                unsafe { ffi::sqlite3_finalize(stmt) };
                return Err(err);
            }
        }

        Ok(stmt)
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        if !self.db.is_null() {
            // SAFETY: db is open
            unsafe {
                ffi::sqlite3_close_v2(self.db);
            }
        }
    }
}

/// Lazy cursor over a prepared statement.
struct SqliteRows<'conn> {
    db: *mut ffi::sqlite3,
    stmt: *mut ffi::sqlite3_stmt,
    columns: Arc<ColumnInfo>,
    sql: String,
    done: bool,
    _conn: PhantomData<&'conn mut SqliteConnection>,
}

impl Iterator for SqliteRows<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        // SAFETY: stmt stays valid until drop; the borrow on the connection
        // keeps db open for the cursor's lifetime.
        let rc = unsafe { ffi::sqlite3_step(self.stmt) };
        match rc {
            ffi::SQLITE_ROW => {
                let values = (0..self.columns.len())
                    // SAFETY: the statement just returned SQLITE_ROW
                    .map(|i| unsafe { types::read_column(self.stmt, i as c_int) })
                    .collect();
                Some(Ok(Row::with_columns(Arc::clone(&self.columns), values)))
            }
            ffi::SQLITE_DONE => {
                self.done = true;
                None
            }
            _ => {
                self.done = true;
                Some(Err(database_error(self.db, &self.sql)))
            }
        }
    }
}

impl Drop for SqliteRows<'_> {
    fn drop(&mut self) {
        // SAFETY: stmt is valid and finalized exactly once
        unsafe {
            ffi::sqlite3_finalize(self.stmt);
        }
    }
}

impl Connection for SqliteConnection {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows<'_>> {
        tracing::trace!(sql, params = params.len(), "sqlite query");
        let stmt = self.prepare(sql, params)?;

        // SAFETY: stmt is valid
        let count = unsafe { ffi::sqlite3_column_count(stmt) };
        let names = (0..count)
            // SAFETY: stmt is valid and i is within the column count
            .map(|i| unsafe { types::column_name(stmt, i) }.unwrap_or_else(|| format!("col{i}")))
            .collect();

        Ok(Box::new(SqliteRows {
            db: self.db,
            stmt,
            columns: Arc::new(ColumnInfo::new(names)),
            sql: sql.to_string(),
            done: false,
            _conn: PhantomData,
        }))
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        tracing::trace!(sql, params = params.len(), "sqlite execute");
        let stmt = self.prepare(sql, params)?;

        // SAFETY: stmt is valid
        let rc = unsafe { ffi::sqlite3_step(stmt) };
        let result = match rc {
            ffi::SQLITE_DONE | ffi::SQLITE_ROW => Ok(self.changes()),
            _ => Err(database_error(self.db, sql)),
        };

        // SAFETY: stmt is valid and finalized exactly once
        unsafe {
            ffi::sqlite3_finalize(stmt);
        }
        result
    }

    fn begin_with(&mut self, isolation: IsolationLevel) -> Result<()> {
        if self.in_transaction {
            return Err(data_error(
                DataAccessErrorKind::Statement,
                None,
                "already in a transaction",
            ));
        }

        // SQLite has no isolation levels; approximate with the locking mode
        // taken at BEGIN.
        let begin_sql = match isolation {
            IsolationLevel::Serializable => "BEGIN EXCLUSIVE",
            IsolationLevel::RepeatableRead | IsolationLevel::ReadCommitted => "BEGIN IMMEDIATE",
            IsolationLevel::ReadUncommitted => "BEGIN DEFERRED",
        };
        self.execute_raw(begin_sql)?;
        self.in_transaction = true;
        tracing::debug!(isolation = isolation.as_sql(), "sqlite transaction begun");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(data_error(DataAccessErrorKind::Statement, None, "not in a transaction"));
        }
        self.execute_raw("COMMIT")?;
        self.in_transaction = false;
        tracing::debug!("sqlite transaction committed");
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(data_error(DataAccessErrorKind::Statement, None, "not in a transaction"));
        }
        self.execute_raw("ROLLBACK")?;
        self.in_transaction = false;
        tracing::debug!("sqlite transaction rolled back");
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn is_open(&self) -> bool {
        !self.db.is_null()
    }
}

fn data_error(kind: DataAccessErrorKind, sql: Option<&str>, message: impl Into<String>) -> Error {
    Error::DataAccess(DataAccessError {
        kind,
        sql: sql.map(str::to_string),
        message: message.into(),
        source: None,
    })
}

fn with_sql(err: Error, sql: &str) -> Error {
    match err {
        Error::DataAccess(mut data) => {
            data.sql = Some(sql.to_string());
            Error::DataAccess(data)
        }
        other => other,
    }
}

/// # Safety
/// `db` must be a valid handle.
unsafe fn errmsg(db: *mut ffi::sqlite3) -> String {
    // SAFETY: errmsg returns a valid C string owned by SQLite
    unsafe { CStr::from_ptr(ffi::sqlite3_errmsg(db)).to_string_lossy().into_owned() }
}

fn error_string(code: c_int) -> String {
    // SAFETY: errstr returns a static C string for any code
    unsafe { CStr::from_ptr(ffi::sqlite3_errstr(code)).to_string_lossy().into_owned() }
}

fn database_error(db: *mut ffi::sqlite3, sql: &str) -> Error {
    // SAFETY: db is valid
    let (msg, code) = unsafe { (errmsg(db), ffi::sqlite3_errcode(db)) };
    data_error(error_code_to_kind(code), Some(sql), msg)
}

fn bind_error(db: *mut ffi::sqlite3, sql: &str, param_index: usize) -> Error {
    // SAFETY: db is valid
    let msg = unsafe { errmsg(db) };
    data_error(
        DataAccessErrorKind::Statement,
        Some(sql),
        format!("failed to bind parameter {}: {}", param_index, msg),
    )
}

fn error_code_to_kind(code: c_int) -> DataAccessErrorKind {
    match code & 0xff {
        ffi::SQLITE_CONSTRAINT => DataAccessErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => DataAccessErrorKind::Busy,
        ffi::SQLITE_INTERRUPT => DataAccessErrorKind::Interrupted,
        ffi::SQLITE_MISMATCH => DataAccessErrorKind::TypeMismatch,
        ffi::SQLITE_CANTOPEN | ffi::SQLITE_NOTADB | ffi::SQLITE_IOERR => DataAccessErrorKind::Connection,
        _ => DataAccessErrorKind::Statement,
    }
}
