//! Identifier generation for newly persisted entities.

use std::collections::HashMap;
use std::sync::Mutex;

use hibernate_core::{
    Connection, EntityPersister, Error, IdGenerator, Result, UsageErrorKind, Value,
};

use crate::stats::log_sql;

/// Factory-wide generator state.
///
/// Increment counters are seeded from `max(id)` once per entity and tenant,
/// then advanced in memory. Tenants never share a counter.
#[derive(Debug, Default)]
pub struct IdentifierGenerators {
    counters: Mutex<HashMap<(Option<String>, String), i64>>,
}

impl IdentifierGenerators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the identifier of a new instance of `persister`.
    ///
    /// `current` is the identifier already set on the instance; assigned
    /// generators require it, generated ones keep it when present.
    #[tracing::instrument(level = "debug", skip(self, conn, persister, current), fields(entity = persister.entity_name()))]
    pub fn generate<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        persister: &EntityPersister,
        tenant_id: Option<&str>,
        current: Option<&Value>,
        show_sql: bool,
    ) -> Result<Value> {
        if let Some(id) = current.filter(|id| !id.is_null()) {
            return Ok(id.normalized());
        }
        match persister.generator() {
            IdGenerator::Assigned => Err(Error::usage(
                UsageErrorKind::IdentifierRequired,
                format!(
                    "identifier of {} must be assigned before persisting",
                    persister.entity_name()
                ),
            )),
            IdGenerator::Uuid => Ok(Value::Text(uuid::Uuid::new_v4().to_string())),
            IdGenerator::Increment => self.increment(conn, persister, tenant_id, show_sql),
        }
    }

    fn increment<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        persister: &EntityPersister,
        tenant_id: Option<&str>,
        show_sql: bool,
    ) -> Result<Value> {
        if persister.identifier().is_composite() {
            return Err(Error::mapping(
                Some(persister.entity_name()),
                Some(&persister.identifier().name),
                "increment generation requires a single-column identifier",
            ));
        }
        let slot = (tenant_id.map(str::to_string), persister.entity_name().to_string());
        let seeded = self.lock().contains_key(&slot);
        let seed = if seeded {
            None
        } else {
            let sql = format!(
                "select max({}) from {}",
                persister.identifier_columns()[0],
                persister.table()
            );
            log_sql(show_sql, &sql, &[]);
            let max = conn
                .query_all(&sql, &[])?
                .first()
                .and_then(|row| row.get(0))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            tracing::debug!(entity = persister.entity_name(), max, "Seeded increment generator");
            Some(max)
        };

        let mut counters = self.lock();
        let counter = counters.entry(slot).or_insert(seed.unwrap_or(0));
        *counter += 1;
        Ok(Value::BigInt(*counter))
    }

    /// Forget every counter so the next identifier is seeded again.
    pub fn reset(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(Option<String>, String), i64>> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnection;

    fn persister(generator: IdGenerator) -> EntityPersister {
        EntityPersister::builder("Hero", "hero")
            .identifier("id", "id")
            .generator(generator)
            .build()
            .unwrap()
    }

    #[test]
    fn test_assigned_requires_identifier() {
        let generators = IdentifierGenerators::new();
        let mut conn = MockConnection::new();
        let p = persister(IdGenerator::Assigned);
        let err = generators.generate(&mut conn, &p, None, None, false).unwrap_err();
        assert!(matches!(err, Error::Usage(ref u) if u.kind == UsageErrorKind::IdentifierRequired));
        let id = generators
            .generate(&mut conn, &p, None, Some(&Value::Int(7)), false)
            .unwrap();
        assert_eq!(id, Value::BigInt(7));
    }

    #[test]
    fn test_increment_seeds_once_per_tenant() {
        let generators = IdentifierGenerators::new();
        let mut conn = MockConnection::new();
        conn.on_query("select max(id) from hero", &["max"], vec![vec![Value::BigInt(41)]]);
        let p = persister(IdGenerator::Increment);

        let first = generators.generate(&mut conn, &p, None, None, false).unwrap();
        let second = generators.generate(&mut conn, &p, None, None, false).unwrap();
        assert_eq!(first, Value::BigInt(42));
        assert_eq!(second, Value::BigInt(43));
        assert_eq!(conn.count_matching("select max"), 1);

        let other_tenant = generators.generate(&mut conn, &p, Some("acme"), None, false).unwrap();
        assert_eq!(other_tenant, Value::BigInt(42));
        assert_eq!(conn.count_matching("select max"), 2);
    }

    #[test]
    fn test_uuid_generator() {
        let generators = IdentifierGenerators::new();
        let mut conn = MockConnection::new();
        let id = generators
            .generate(&mut conn, &persister(IdGenerator::Uuid), None, None, false)
            .unwrap();
        assert_eq!(id.as_str().map(str::len), Some(36));
        assert!(conn.statements().is_empty());
    }
}
