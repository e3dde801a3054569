#![allow(dead_code)]

use hibernate::{
    Connection, DataAccessError, DataAccessErrorKind, Error, IsolationLevel, Result, Row, Rows,
    SqliteConnection, Value,
};

/// An in-memory database with `schema` applied.
pub fn memory_db(schema: &str) -> SqliteConnection {
    let mut conn = SqliteConnection::open_memory().expect("open sqlite memory db");
    conn.execute_raw(schema).expect("apply schema");
    conn
}

/// Run `sql` and collect every row.
pub fn rows(conn: &mut impl Connection, sql: &str, params: &[Value]) -> Vec<Row> {
    conn.query_all(sql, params).expect("query")
}

/// The single integer returned by `sql`.
pub fn scalar(conn: &mut impl Connection, sql: &str, params: &[Value]) -> i64 {
    let rows = rows(conn, sql, params);
    rows[0]
        .get(0)
        .and_then(Value::as_i64)
        .expect("integer scalar")
}

/// A connection whose queries fail after yielding a fixed number of rows.
///
/// Statements pass straight through; only result cursors are cut short.
pub struct FlakyConnection<C> {
    pub inner: C,
    pub fail_after: Option<usize>,
}

impl<C: Connection> FlakyConnection<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            fail_after: None,
        }
    }
}

impl<C: Connection> Connection for FlakyConnection<C> {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows<'_>> {
        let fail_after = self.fail_after;
        let rows = self.inner.query(sql, params)?;
        match fail_after {
            None => Ok(rows),
            Some(n) => {
                let failure = std::iter::once(Err(Error::DataAccess(DataAccessError {
                    kind: DataAccessErrorKind::Connection,
                    sql: Some(sql.to_string()),
                    message: "connection reset while reading rows".into(),
                    source: None,
                })));
                Ok(Box::new(rows.take(n).chain(failure)))
            }
        }
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.inner.execute(sql, params)
    }

    fn begin_with(&mut self, isolation: IsolationLevel) -> Result<()> {
        self.inner.begin_with(isolation)
    }

    fn commit(&mut self) -> Result<()> {
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<()> {
        self.inner.rollback()
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}
