//! Value binding and column decoding.
//!
//! SQLite has five storage classes (INTEGER, REAL, TEXT, BLOB and NULL).
//! Engine values map onto them as follows:
//!
//! | Value            | Storage class |
//! |------------------|---------------|
//! | `Bool`           | INTEGER 0/1   |
//! | `Int`, `BigInt`  | INTEGER       |
//! | `Double`         | REAL          |
//! | `Text`, `Json`   | TEXT          |
//! | `Bytes`          | BLOB          |
//!
//! Composite identifiers (`Value::Array`) are flattened into their columns
//! before statements are built, so they never reach a bind site.

use hibernate_core::Value;
use hibernate_core::error::{DataAccessError, DataAccessErrorKind, Error, Result};
use libsqlite3_sys as ffi;
use std::ffi::{CStr, c_int};

/// Bind a value to a prepared statement parameter.
///
/// Returns the SQLite result code of the bind call.
///
/// # Safety
/// - `stmt` must be a valid, non-null prepared statement handle
/// - `index` must be a valid 1-based parameter index
pub unsafe fn bind_value(stmt: *mut ffi::sqlite3_stmt, index: c_int, value: &Value) -> Result<c_int> {
    // SAFETY: the caller guarantees `stmt` and `index`; text and blob buffers
    // are copied by SQLite because of SQLITE_TRANSIENT.
    let rc = unsafe {
        match value {
            Value::Null => ffi::sqlite3_bind_null(stmt, index),
            Value::Bool(b) => ffi::sqlite3_bind_int(stmt, index, c_int::from(*b)),
            Value::Int(v) => ffi::sqlite3_bind_int(stmt, index, *v),
            Value::BigInt(v) => ffi::sqlite3_bind_int64(stmt, index, *v),
            Value::Double(v) => ffi::sqlite3_bind_double(stmt, index, *v),
            Value::Text(s) => bind_text(stmt, index, s),
            Value::Json(json) => bind_text(stmt, index, &json.to_string()),
            Value::Bytes(bytes) => ffi::sqlite3_bind_blob(
                stmt,
                index,
                bytes.as_ptr().cast(),
                bytes.len() as c_int,
                ffi::SQLITE_TRANSIENT(),
            ),
            Value::Array(_) => {
                return Err(Error::DataAccess(DataAccessError {
                    kind: DataAccessErrorKind::TypeMismatch,
                    sql: None,
                    message: format!("parameter {index} is a composite value and cannot be bound"),
                    source: None,
                }));
            }
        }
    };
    Ok(rc)
}

unsafe fn bind_text(stmt: *mut ffi::sqlite3_stmt, index: c_int, text: &str) -> c_int {
    let bytes = text.as_bytes();
    // SAFETY: the buffer outlives the call and SQLite copies it.
    unsafe {
        ffi::sqlite3_bind_text(
            stmt,
            index,
            bytes.as_ptr().cast(),
            bytes.len() as c_int,
            ffi::SQLITE_TRANSIENT(),
        )
    }
}

/// Read a column value from the current result row.
///
/// # Safety
/// - `stmt` must be a valid prepared statement that has just returned SQLITE_ROW
/// - `index` must be a valid 0-based column index
pub unsafe fn read_column(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Value {
    // SAFETY: guaranteed by the caller; returned buffers are copied before the
    // next step invalidates them.
    unsafe {
        match ffi::sqlite3_column_type(stmt, index) {
            ffi::SQLITE_INTEGER => {
                let v = ffi::sqlite3_column_int64(stmt, index);
                // Smallest representation; identity comparisons ignore width.
                match i32::try_from(v) {
                    Ok(small) => Value::Int(small),
                    Err(_) => Value::BigInt(v),
                }
            }
            ffi::SQLITE_FLOAT => Value::Double(ffi::sqlite3_column_double(stmt, index)),
            ffi::SQLITE_TEXT => {
                let ptr = ffi::sqlite3_column_text(stmt, index);
                let len = ffi::sqlite3_column_bytes(stmt, index);
                if ptr.is_null() {
                    Value::Null
                } else {
                    let slice = std::slice::from_raw_parts(ptr.cast::<u8>(), len as usize);
                    Value::Text(String::from_utf8_lossy(slice).into_owned())
                }
            }
            ffi::SQLITE_BLOB => {
                let ptr = ffi::sqlite3_column_blob(stmt, index);
                let len = ffi::sqlite3_column_bytes(stmt, index);
                if ptr.is_null() || len == 0 {
                    Value::Bytes(Vec::new())
                } else {
                    let slice = std::slice::from_raw_parts(ptr.cast::<u8>(), len as usize);
                    Value::Bytes(slice.to_vec())
                }
            }
            _ => Value::Null,
        }
    }
}

/// Get a result column name.
///
/// # Safety
/// - `stmt` must be a valid prepared statement
/// - `index` must be a valid 0-based column index
pub unsafe fn column_name(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Option<String> {
    // SAFETY: guaranteed by the caller.
    unsafe {
        let ptr = ffi::sqlite3_column_name(stmt, index);
        if ptr.is_null() {
            None
        } else {
            CStr::from_ptr(ptr).to_str().ok().map(String::from)
        }
    }
}
