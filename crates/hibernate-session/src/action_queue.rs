//! Scheduled entity actions and the ordered statement plan of a flush.
//!
//! `persist` and `delete` only schedule work in the [`ActionQueue`]. At flush
//! time the session turns the queue, the dirty check and the collection diffs
//! into a [`FlushPlan`] whose statements run in a fixed order:
//!
//! 1. orphan removals
//! 2. entity inserts (parent-first when insert ordering is enabled)
//! 3. entity updates
//! 4. collection removals
//! 5. collection row updates
//! 6. collection recreations
//! 7. entity deletes

use std::collections::{HashMap, HashSet};

use hibernate_core::{Connection, EntityKey, Error, Result, StaleStateError, Value};

use crate::instance::EntityRef;
use crate::stats::log_sql;

// ============================================================================
// Scheduled actions
// ============================================================================

/// A delete scheduled by `delete`, a delete cascade or orphan removal.
#[derive(Debug, Clone)]
pub struct ScheduledDelete {
    pub key: EntityKey,
    pub entity: EntityRef,
    pub version: Option<Value>,
    /// False when the instance was persisted and deleted before any flush.
    pub exists_in_database: bool,
}

/// Entity actions waiting for the next flush.
#[derive(Debug, Default)]
pub struct ActionQueue {
    insertions: Vec<(EntityKey, EntityRef)>,
    orphan_removals: Vec<ScheduledDelete>,
    deletions: Vec<ScheduledDelete>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_insert(&mut self, key: EntityKey, entity: EntityRef) {
        self.insertions.push((key, entity));
    }

    /// Drop a scheduled insert; returns whether one was queued.
    pub fn remove_insert(&mut self, key: &EntityKey) -> bool {
        let before = self.insertions.len();
        self.insertions.retain(|(k, _)| k != key);
        before != self.insertions.len()
    }

    pub fn has_insert(&self, key: &EntityKey) -> bool {
        self.insertions.iter().any(|(k, _)| k == key)
    }

    pub fn add_delete(&mut self, delete: ScheduledDelete) {
        self.deletions.push(delete);
    }

    pub fn add_orphan_removal(&mut self, delete: ScheduledDelete) {
        self.orphan_removals.push(delete);
    }

    pub fn has_delete(&self, key: &EntityKey) -> bool {
        self.deletions
            .iter()
            .chain(&self.orphan_removals)
            .any(|d| &d.key == key)
    }

    /// Forget every action on `key` (evict, un-delete).
    pub fn remove(&mut self, key: &EntityKey) {
        self.insertions.retain(|(k, _)| k != key);
        self.deletions.retain(|d| &d.key != key);
        self.orphan_removals.retain(|d| &d.key != key);
    }

    pub fn insertions(&self) -> &[(EntityKey, EntityRef)] {
        &self.insertions
    }

    pub fn insert_count(&self) -> usize {
        self.insertions.len()
    }

    pub fn delete_count(&self) -> usize {
        self.deletions.len() + self.orphan_removals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insertions.is_empty() && self.deletions.is_empty() && self.orphan_removals.is_empty()
    }

    /// Copies of the scheduled inserts, orphan removals and deletes.
    ///
    /// The queue keeps them until the flush that writes them succeeds.
    pub(crate) fn scheduled(&self) -> (Vec<(EntityKey, EntityRef)>, Vec<ScheduledDelete>, Vec<ScheduledDelete>) {
        (
            self.insertions.clone(),
            self.orphan_removals.clone(),
            self.deletions.clone(),
        )
    }

    pub fn clear(&mut self) {
        self.insertions.clear();
        self.orphan_removals.clear();
        self.deletions.clear();
    }
}

// ============================================================================
// Statements
// ============================================================================

/// A pending entity statement.
#[derive(Debug, Clone)]
pub enum PendingOp {
    /// Insert a new row.
    Insert {
        key: EntityKey,
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
        /// Entities this row's foreign keys point at.
        depends_on: Vec<EntityKey>,
    },
    /// Update an existing row, guarded by the loaded version when present.
    Update {
        key: EntityKey,
        table: String,
        set_columns: Vec<String>,
        set_values: Vec<Value>,
        pk_columns: Vec<String>,
        pk_values: Vec<Value>,
        version_column: Option<String>,
        expected_version: Option<Value>,
    },
    /// Delete an existing row, guarded by the loaded version when present.
    Delete {
        key: EntityKey,
        table: String,
        pk_columns: Vec<String>,
        pk_values: Vec<Value>,
        version_column: Option<String>,
        expected_version: Option<Value>,
    },
}

impl PendingOp {
    /// Get the table name for this operation.
    pub fn table(&self) -> &str {
        match self {
            PendingOp::Insert { table, .. }
            | PendingOp::Update { table, .. }
            | PendingOp::Delete { table, .. } => table,
        }
    }

    /// Get the entity key for this operation.
    pub fn key(&self) -> &EntityKey {
        match self {
            PendingOp::Insert { key, .. } | PendingOp::Update { key, .. } | PendingOp::Delete { key, .. } => key,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert { .. })
    }

    pub fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete { .. })
    }

    /// SQL text and parameters.
    pub fn render(&self) -> (String, Vec<Value>) {
        match self {
            PendingOp::Insert {
                table, columns, values, ..
            } => (
                format!(
                    "insert into {} ({}) values ({})",
                    table,
                    columns.join(", "),
                    vec!["?"; columns.len()].join(", ")
                ),
                values.clone(),
            ),
            PendingOp::Update {
                table,
                set_columns,
                set_values,
                pk_columns,
                pk_values,
                version_column,
                expected_version,
                ..
            } => {
                let mut params = set_values.clone();
                params.extend(pk_values.iter().cloned());
                let mut condition = equalities(pk_columns);
                if let (Some(column), Some(version)) = (version_column, expected_version) {
                    condition.push_str(&format!(" and {}=?", column));
                    params.push(version.clone());
                }
                (
                    format!(
                        "update {} set {} where {}",
                        table,
                        set_columns
                            .iter()
                            .map(|c| format!("{}=?", c))
                            .collect::<Vec<_>>()
                            .join(", "),
                        condition
                    ),
                    params,
                )
            }
            PendingOp::Delete {
                table,
                pk_columns,
                pk_values,
                version_column,
                expected_version,
                ..
            } => {
                let mut params = pk_values.clone();
                let mut condition = equalities(pk_columns);
                if let (Some(column), Some(version)) = (version_column, expected_version) {
                    condition.push_str(&format!(" and {}=?", column));
                    params.push(version.clone());
                }
                (format!("delete from {} where {}", table, condition), params)
            }
        }
    }

    /// Execute; an update or delete that touches no row is an
    /// optimistic-lock failure.
    #[tracing::instrument(level = "debug", skip(self, conn), fields(entity = %self.key()))]
    pub fn execute<C: Connection + ?Sized>(&self, conn: &mut C, show_sql: bool) -> Result<()> {
        let (sql, params) = self.render();
        log_sql(show_sql, &sql, &params);
        let affected = conn.execute(&sql, &params)?;
        match self {
            PendingOp::Update {
                key, expected_version, ..
            }
            | PendingOp::Delete {
                key, expected_version, ..
            } if affected == 0 => {
                tracing::warn!(entity = %key, "Row was updated or deleted by another transaction");
                Err(Error::StaleState(StaleStateError {
                    entity_name: key.entity_name().to_string(),
                    identifier: key.identifier().clone(),
                    version: expected_version.clone(),
                }))
            }
            _ => Ok(()),
        }
    }
}

/// A pending collection row statement.
#[derive(Debug, Clone)]
pub enum CollectionOp {
    /// Delete every row of a link or element table for one owner.
    RemoveRows {
        table: String,
        key_columns: Vec<String>,
        key_values: Vec<Value>,
    },
    /// Null the foreign key of every child of one owner.
    DetachAll {
        table: String,
        key_columns: Vec<String>,
        key_values: Vec<Value>,
    },
    /// Insert one link or element row.
    InsertRow {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    /// Delete one link or element row.
    DeleteRow {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    /// Point a child's foreign key (and list index) at its owner.
    Attach {
        table: String,
        set_columns: Vec<String>,
        set_values: Vec<Value>,
        child_columns: Vec<String>,
        child_id: Vec<Value>,
    },
    /// Null one child's foreign key, if it still points at the owner.
    Detach {
        table: String,
        key_columns: Vec<String>,
        key_values: Vec<Value>,
        child_columns: Vec<String>,
        child_id: Vec<Value>,
    },
}

impl CollectionOp {
    pub fn table(&self) -> &str {
        match self {
            CollectionOp::RemoveRows { table, .. }
            | CollectionOp::DetachAll { table, .. }
            | CollectionOp::InsertRow { table, .. }
            | CollectionOp::DeleteRow { table, .. }
            | CollectionOp::Attach { table, .. }
            | CollectionOp::Detach { table, .. } => table,
        }
    }

    pub fn render(&self) -> (String, Vec<Value>) {
        match self {
            CollectionOp::RemoveRows {
                table,
                key_columns,
                key_values,
            } => (
                format!("delete from {} where {}", table, equalities(key_columns)),
                key_values.clone(),
            ),
            CollectionOp::DetachAll {
                table,
                key_columns,
                key_values,
            } => (
                format!(
                    "update {} set {} where {}",
                    table,
                    null_assignments(key_columns),
                    equalities(key_columns)
                ),
                key_values.clone(),
            ),
            CollectionOp::InsertRow { table, columns, values } => (
                format!(
                    "insert into {} ({}) values ({})",
                    table,
                    columns.join(", "),
                    vec!["?"; columns.len()].join(", ")
                ),
                values.clone(),
            ),
            CollectionOp::DeleteRow { table, columns, values } => (
                format!("delete from {} where {}", table, equalities(columns)),
                values.clone(),
            ),
            CollectionOp::Attach {
                table,
                set_columns,
                set_values,
                child_columns,
                child_id,
            } => {
                let mut params = set_values.clone();
                params.extend(child_id.iter().cloned());
                (
                    format!(
                        "update {} set {} where {}",
                        table,
                        set_columns
                            .iter()
                            .map(|c| format!("{}=?", c))
                            .collect::<Vec<_>>()
                            .join(", "),
                        equalities(child_columns)
                    ),
                    params,
                )
            }
            CollectionOp::Detach {
                table,
                key_columns,
                key_values,
                child_columns,
                child_id,
            } => {
                let mut params = key_values.clone();
                params.extend(child_id.iter().cloned());
                (
                    format!(
                        "update {} set {} where {} and {}",
                        table,
                        null_assignments(key_columns),
                        equalities(key_columns),
                        equalities(child_columns)
                    ),
                    params,
                )
            }
        }
    }

    pub fn execute<C: Connection + ?Sized>(&self, conn: &mut C, show_sql: bool) -> Result<u64> {
        let (sql, params) = self.render();
        log_sql(show_sql, &sql, &params);
        conn.execute(&sql, &params)
    }
}

fn equalities(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{}=?", c))
        .collect::<Vec<_>>()
        .join(" and ")
}

fn null_assignments(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{}=null", c))
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Ordering
// ============================================================================

/// Orders inserts so that every row is written after the rows its foreign
/// keys reference.
#[derive(Debug, Default)]
pub struct FlushOrderer;

impl FlushOrderer {
    pub fn new() -> Self {
        Self
    }

    /// Stable topological sort of inserts. Rows of the same entity are
    /// grouped together when their dependencies allow it.
    pub fn order_inserts(&self, ops: Vec<PendingOp>) -> Vec<PendingOp> {
        let keys: HashMap<EntityKey, usize> = ops.iter().enumerate().map(|(i, op)| (op.key().clone(), i)).collect();
        let deps: Vec<Vec<usize>> = ops
            .iter()
            .enumerate()
            .map(|(i, op)| match op {
                PendingOp::Insert { depends_on, .. } => depends_on
                    .iter()
                    .filter_map(|k| keys.get(k).copied())
                    .filter(|&d| d != i)
                    .collect(),
                _ => Vec::new(),
            })
            .collect();

        let mut group_order: Vec<&str> = Vec::new();
        for op in &ops {
            let name = op.key().entity_name();
            if !group_order.contains(&name) {
                group_order.push(name);
            }
        }

        let mut placed = vec![false; ops.len()];
        let mut order = Vec::with_capacity(ops.len());
        while order.len() < ops.len() {
            let mut progressed = false;
            for group in &group_order {
                loop {
                    let ready = (0..ops.len()).find(|&i| {
                        !placed[i] && ops[i].key().entity_name() == *group && deps[i].iter().all(|&d| placed[d])
                    });
                    match ready {
                        Some(i) => {
                            placed[i] = true;
                            order.push(i);
                            progressed = true;
                        }
                        None => break,
                    }
                }
            }
            if !progressed {
                // Cyclic foreign keys: keep the remaining rows in queue order.
                order.extend((0..ops.len()).filter(|&i| !placed[i]));
                break;
            }
        }

        let mut slots: Vec<Option<PendingOp>> = ops.into_iter().map(Some).collect();
        order.into_iter().filter_map(|i| slots[i].take()).collect()
    }
}

/// The statements of one flush, in execution order.
#[derive(Debug, Default)]
pub struct FlushPlan {
    pub orphan_removals: Vec<PendingOp>,
    pub inserts: Vec<PendingOp>,
    pub updates: Vec<PendingOp>,
    pub collection_removals: Vec<CollectionOp>,
    pub collection_updates: Vec<CollectionOp>,
    pub collection_recreations: Vec<CollectionOp>,
    pub deletes: Vec<PendingOp>,
}

/// Counts of the statements a plan executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub collection_rows: usize,
}

impl FlushPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.orphan_removals.len()
            + self.inserts.len()
            + self.updates.len()
            + self.collection_removals.len()
            + self.collection_updates.len()
            + self.collection_recreations.len()
            + self.deletes.len()
    }

    /// Keys of entities whose rows this plan deletes.
    pub fn deleted_keys(&self) -> HashSet<&EntityKey> {
        self.orphan_removals.iter().chain(&self.deletes).map(PendingOp::key).collect()
    }

    /// Execute every statement in order, stopping at the first failure.
    #[tracing::instrument(level = "info", skip(self, conn))]
    pub fn execute<C: Connection + ?Sized>(&self, conn: &mut C, show_sql: bool) -> Result<FlushResult> {
        tracing::info!(
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            deletes = self.deletes.len() + self.orphan_removals.len(),
            collection_ops = self.collection_removals.len()
                + self.collection_updates.len()
                + self.collection_recreations.len(),
            "Executing flush plan"
        );
        let start = std::time::Instant::now();
        let mut result = FlushResult::default();

        for op in &self.orphan_removals {
            op.execute(conn, show_sql)?;
            result.deleted += 1;
        }
        for op in &self.inserts {
            op.execute(conn, show_sql)?;
            result.inserted += 1;
        }
        for op in &self.updates {
            op.execute(conn, show_sql)?;
            result.updated += 1;
        }
        for op in self
            .collection_removals
            .iter()
            .chain(&self.collection_updates)
            .chain(&self.collection_recreations)
        {
            op.execute(conn, show_sql)?;
            result.collection_rows += 1;
        }
        for op in &self.deletes {
            op.execute(conn, show_sql)?;
            result.deleted += 1;
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnection;

    fn key(entity: &str, id: i64) -> EntityKey {
        EntityKey::new(entity, &Value::BigInt(id))
    }

    fn insert(entity: &str, id: i64, depends_on: Vec<EntityKey>) -> PendingOp {
        PendingOp::Insert {
            key: key(entity, id),
            table: entity.to_lowercase(),
            columns: vec!["id".into()],
            values: vec![Value::BigInt(id)],
            depends_on,
        }
    }

    fn update(version: Option<i64>) -> PendingOp {
        PendingOp::Update {
            key: key("Hero", 1),
            table: "hero".into(),
            set_columns: vec!["name".into(), "version".into()],
            set_values: vec![Value::from("Spidey"), Value::BigInt(2)],
            pk_columns: vec!["id".into()],
            pk_values: vec![Value::BigInt(1)],
            version_column: version.map(|_| "version".to_string()),
            expected_version: version.map(Value::BigInt),
        }
    }

    #[test]
    fn test_update_sql_checks_version() {
        let (sql, params) = update(Some(1)).render();
        assert_eq!(sql, "update hero set name=?, version=? where id=? and version=?");
        assert_eq!(params.len(), 4);
        assert_eq!(params[3], Value::BigInt(1));

        let (sql, _) = update(None).render();
        assert_eq!(sql, "update hero set name=?, version=? where id=?");
    }

    #[test]
    fn test_delete_sql() {
        let op = PendingOp::Delete {
            key: key("Hero", 1),
            table: "hero".into(),
            pk_columns: vec!["id".into()],
            pk_values: vec![Value::BigInt(1)],
            version_column: Some("version".into()),
            expected_version: Some(Value::BigInt(3)),
        };
        assert_eq!(op.render().0, "delete from hero where id=? and version=?");
        assert!(op.is_delete());
    }

    #[test]
    fn test_zero_rows_is_stale_state() {
        let mut conn = MockConnection::new();
        conn.on_execute("update hero", 0);
        let err = update(Some(1)).execute(&mut conn, false).unwrap_err();
        match err {
            Error::StaleState(e) => {
                assert_eq!(e.entity_name, "Hero");
                assert_eq!(e.version, Some(Value::BigInt(1)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_collection_op_sql() {
        let detach = CollectionOp::DetachAll {
            table: "hero".into(),
            key_columns: vec!["team_id".into()],
            key_values: vec![Value::BigInt(1)],
        };
        assert_eq!(detach.render().0, "update hero set team_id=null where team_id=?");

        let link = CollectionOp::InsertRow {
            table: "hero_power".into(),
            columns: vec!["hero_id".into(), "power_id".into()],
            values: vec![Value::BigInt(1), Value::BigInt(2)],
        };
        assert_eq!(link.render().0, "insert into hero_power (hero_id, power_id) values (?, ?)");

        let attach = CollectionOp::Attach {
            table: "hero".into(),
            set_columns: vec!["team_id".into(), "pos".into()],
            set_values: vec![Value::BigInt(1), Value::BigInt(0)],
            child_columns: vec!["id".into()],
            child_id: vec![Value::BigInt(9)],
        };
        let (sql, params) = attach.render();
        assert_eq!(sql, "update hero set team_id=?, pos=? where id=?");
        assert_eq!(params, vec![Value::BigInt(1), Value::BigInt(0), Value::BigInt(9)]);

        let detach_one = CollectionOp::Detach {
            table: "hero".into(),
            key_columns: vec!["team_id".into()],
            key_values: vec![Value::BigInt(1)],
            child_columns: vec!["id".into()],
            child_id: vec![Value::BigInt(9)],
        };
        let (sql, params) = detach_one.render();
        assert_eq!(sql, "update hero set team_id=null where team_id=? and id=?");
        assert_eq!(params, vec![Value::BigInt(1), Value::BigInt(9)]);
    }

    #[test]
    fn test_order_inserts_parent_first_and_grouped() {
        let ops = vec![
            insert("Hero", 1, vec![key("Team", 10)]),
            insert("Team", 10, vec![]),
            insert("Hero", 2, vec![key("Team", 10)]),
            insert("Power", 5, vec![]),
        ];
        let ordered = FlushOrderer::new().order_inserts(ops);
        let keys: Vec<String> = ordered.iter().map(|op| op.key().to_string()).collect();
        let team = keys.iter().position(|k| k.contains("Team")).unwrap();
        let hero1 = keys.iter().position(|k| k.contains("Hero#BigInt(1)")).unwrap();
        assert!(team < hero1);
        assert_eq!(ordered.len(), 4);
        // Hero rows stay adjacent.
        let heroes: Vec<usize> = keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.contains("Hero"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(heroes[1], heroes[0] + 1);
    }

    #[test]
    fn test_order_inserts_tolerates_cycles() {
        let ops = vec![
            insert("A", 1, vec![key("B", 1)]),
            insert("B", 1, vec![key("A", 1)]),
        ];
        let ordered = FlushOrderer::new().order_inserts(ops);
        assert_eq!(ordered.len(), 2);
    }

    #[test]
    fn test_plan_executes_in_queue_order() {
        let mut conn = MockConnection::new();
        let mut plan = FlushPlan::new();
        plan.deletes.push(PendingOp::Delete {
            key: key("Team", 1),
            table: "team".into(),
            pk_columns: vec!["id".into()],
            pk_values: vec![Value::BigInt(1)],
            version_column: None,
            expected_version: None,
        });
        plan.inserts.push(insert("Hero", 3, vec![]));
        plan.collection_removals.push(CollectionOp::RemoveRows {
            table: "hero_power".into(),
            key_columns: vec!["hero_id".into()],
            key_values: vec![Value::BigInt(3)],
        });
        let result = plan.execute(&mut conn, false).unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(result.deleted, 1);
        let statements = conn.statements();
        assert!(statements[0].starts_with("insert into hero"));
        assert!(statements[1].starts_with("delete from hero_power"));
        assert!(statements[2].starts_with("delete from team"));
    }

    #[test]
    fn test_queue_bookkeeping() {
        let persister = std::sync::Arc::new(
            hibernate_core::EntityPersister::builder("Hero", "hero")
                .identifier("id", "id")
                .build()
                .unwrap(),
        );
        let entity = EntityRef::new(crate::instance::EntityInstance::new(&persister).with_identifier(1_i64));
        let mut queue = ActionQueue::new();
        queue.add_insert(key("Hero", 1), entity.clone());
        assert!(queue.has_insert(&key("Hero", 1)));
        queue.add_delete(ScheduledDelete {
            key: key("Hero", 2),
            entity,
            version: None,
            exists_in_database: true,
        });
        assert_eq!(queue.delete_count(), 1);
        queue.remove(&key("Hero", 1));
        assert!(!queue.has_insert(&key("Hero", 1)));
        assert!(!queue.is_empty());
        queue.clear();
        assert!(queue.is_empty());
    }
}
