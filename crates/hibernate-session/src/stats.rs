//! Per-session counters.

use serde::Serialize;

/// Statistics about the work a session has done.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatistics {
    /// Load queries sent to the connection
    pub queries_executed: u64,
    /// Entities initialized by loads
    pub entities_loaded: u64,
    /// Collections initialized by loads
    pub collections_loaded: u64,
    /// Proxies resolved to a target
    pub proxies_initialized: u64,
    pub flushes: u64,
    /// Listener or after-load action errors swallowed after a load
    pub callback_failures: u64,
    pub entity_inserts: u64,
    pub entity_updates: u64,
    pub entity_deletes: u64,
    /// Collection row statements (link rows, element rows, key updates)
    pub collection_statements: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_puts: u64,
}

impl SessionStatistics {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Log one SQL statement under the `hibernate::sql` target.
pub(crate) fn log_sql(show_sql: bool, sql: &str, params: &[hibernate_core::Value]) {
    if show_sql {
        tracing::info!(target: "hibernate::sql", sql = %sql, params = params.len(), "SQL");
    } else {
        tracing::debug!(target: "hibernate::sql", sql = %sql, params = ?params, "SQL");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_and_serialize() {
        let mut stats = SessionStatistics {
            queries_executed: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["queries_executed"], 3);
        stats.reset();
        assert_eq!(stats, SessionStatistics::default());
    }
}
