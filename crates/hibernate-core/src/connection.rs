//! Database connection trait.
//!
//! The engine consumes a narrow, synchronous driver interface:
//!
//! - [`Connection`] - execute SQL with positional `?` parameters and manage transactions
//! - [`Rows`] - a forward-only cursor over result rows
//! - [`IsolationLevel`] - SQL transaction isolation levels
//!
//! Loads block on the calling thread. A driver failure while the cursor is
//! being consumed surfaces as an `Err` item, which aborts the in-progress load.

use crate::error::Result;
use crate::row::Row;
use crate::value::Value;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Transactions can see uncommitted changes from others.
    ReadUncommitted,

    /// Transactions only see committed changes from others.
    #[default]
    ReadCommitted,

    /// Transactions see a consistent snapshot of the database.
    RepeatableRead,

    /// Transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Forward-only cursor over a result set.
///
/// Each item is either the next row or the driver error that ended iteration.
pub type Rows<'a> = Box<dyn Iterator<Item = Result<Row>> + 'a>;

/// A synchronous database connection.
///
/// Implementations are owned by exactly one session at a time and are never
/// shared across threads while a unit of work is in progress.
pub trait Connection {
    /// Execute a query and return a forward-only cursor over its rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows<'_>>;

    /// Execute a statement and return the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Begin a transaction with the default isolation level.
    fn begin(&mut self) -> Result<()> {
        self.begin_with(IsolationLevel::default())
    }

    /// Begin a transaction with an explicit isolation level.
    fn begin_with(&mut self, isolation: IsolationLevel) -> Result<()>;

    /// Commit the current transaction.
    fn commit(&mut self) -> Result<()>;

    /// Roll back the current transaction.
    fn rollback(&mut self) -> Result<()>;

    /// Whether a transaction is currently open.
    fn in_transaction(&self) -> bool;

    /// Whether the connection can still execute statements.
    fn is_open(&self) -> bool {
        true
    }

    /// Collect every row of a query.
    fn query_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.query(sql, params)?.collect()
    }
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows<'_>> {
        (**self).query(sql, params)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        (**self).execute(sql, params)
    }

    fn begin_with(&mut self, isolation: IsolationLevel) -> Result<()> {
        (**self).begin_with(isolation)
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<()> {
        (**self).rollback()
    }

    fn in_transaction(&self) -> bool {
        (**self).in_transaction()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}
