//! Scripted in-memory connection for unit tests.

use std::sync::{Arc, Mutex};

use hibernate_core::{
    Connection, DataAccessError, DataAccessErrorKind, Error, IsolationLevel, Result, Row, Rows,
    Value,
};

#[derive(Debug, Default)]
struct MockState {
    /// `(sql fragment, columns, rows)`; the first matching entry answers.
    queries: Vec<(String, Vec<String>, Vec<Vec<Value>>)>,
    executes: Vec<(String, u64)>,
    /// `(sql fragment, rows delivered before the error)`.
    failure: Option<(String, usize)>,
    log: Vec<(String, Vec<Value>)>,
    in_transaction: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_query(&self, fragment: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> &Self {
        self.state.lock().unwrap().queries.push((
            fragment.to_string(),
            columns.iter().map(|c| (*c).to_string()).collect(),
            rows,
        ));
        self
    }

    pub fn on_execute(&self, fragment: &str, affected: u64) -> &Self {
        self.state
            .lock()
            .unwrap()
            .executes
            .push((fragment.to_string(), affected));
        self
    }

    /// Fail the cursor of matching queries after `rows` rows.
    pub fn fail_after(&self, fragment: &str, rows: usize) -> &Self {
        self.state.lock().unwrap().failure = Some((fragment.to_string(), rows));
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().log.iter().map(|(sql, _)| sql.clone()).collect()
    }

    pub fn params(&self, index: usize) -> Vec<Value> {
        self.state.lock().unwrap().log[index].1.clone()
    }

    pub fn count_matching(&self, fragment: &str) -> usize {
        self.statements().iter().filter(|s| s.contains(fragment)).count()
    }
}

impl Connection for MockConnection {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows<'_>> {
        let mut state = self.state.lock().unwrap();
        state.log.push((sql.to_string(), params.to_vec()));
        let (columns, rows) = state
            .queries
            .iter()
            .find(|(fragment, _, _)| sql.contains(fragment.as_str()))
            .map(|(_, columns, rows)| (columns.clone(), rows.clone()))
            .unwrap_or_default();
        let fail_at = state
            .failure
            .as_ref()
            .filter(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, n)| *n);
        let sql = sql.to_string();
        let mut delivered = 0;
        let mut rows = rows.into_iter();
        Ok(Box::new(std::iter::from_fn(move || {
            if fail_at == Some(delivered) {
                delivered += 1;
                return Some(Err(Error::DataAccess(DataAccessError {
                    kind: DataAccessErrorKind::Interrupted,
                    sql: Some(sql.clone()),
                    message: "cursor failed".into(),
                    source: None,
                })));
            }
            delivered += 1;
            rows.next().map(|values| Ok(Row::new(columns.clone(), values)))
        })))
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.log.push((sql.to_string(), params.to_vec()));
        Ok(state
            .executes
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map_or(1, |(_, affected)| *affected))
    }

    fn begin_with(&mut self, _isolation: IsolationLevel) -> Result<()> {
        self.state.lock().unwrap().in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.state.lock().unwrap().in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.state.lock().unwrap().in_transaction = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.state.lock().unwrap().in_transaction
    }
}
