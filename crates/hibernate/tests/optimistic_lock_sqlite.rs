mod common;

use std::sync::Arc;

use common::scalar;
use hibernate::prelude::*;

const SCHEMA: &str = "
    CREATE TABLE hero (id INTEGER PRIMARY KEY, version INTEGER NOT NULL, name TEXT NOT NULL);
    INSERT INTO hero VALUES (1, 1, 'Deadpond');
";

fn factory() -> Arc<SessionFactory> {
    let metamodel = Metamodel::builder()
        .entity(
            EntityPersister::builder("Hero", "hero")
                .identifier("id", "id")
                .version("version", "version")
                .basic("name", "name")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    SessionFactory::builder(metamodel).build().unwrap()
}

fn open(path: &str) -> SqliteConnection {
    SqliteConnection::open(&SqliteConfig::file(path).busy_timeout(1000)).unwrap()
}

#[test]
fn test_concurrent_update_of_a_stale_version_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("heroes.db").to_string_lossy().into_owned();
    open(&path).execute_raw(SCHEMA).unwrap();

    let factory = factory();
    let mut alice = factory.open_session(open(&path)).unwrap();
    let mut bob = factory.open_session(open(&path)).unwrap();

    // Both read version 1.
    let bobs_hero = bob.get("Hero", 1_i64).unwrap().unwrap();

    alice.begin().unwrap();
    let alices_hero = alice.get("Hero", 1_i64).unwrap().unwrap();
    alices_hero.write().set("name", "Rusty-Man").unwrap();
    alice.commit().unwrap();
    assert_eq!(alices_hero.read().version().and_then(Value::as_i64), Some(2));
    assert_eq!(alice.statistics().entity_updates, 1);

    bob.begin().unwrap();
    bobs_hero.write().set("name", "Spider-Boy").unwrap();
    let err = bob.commit().unwrap_err();
    assert!(err.is_stale_state(), "expected stale state, got {err:?}");
    match &err {
        Error::StaleState(stale) => assert_eq!(stale.entity_name, "Hero"),
        other => panic!("unexpected error {other:?}"),
    }
    bob.rollback().unwrap();

    let mut check = open(&path);
    assert_eq!(scalar(&mut check, "select version from hero where id = 1", &[]), 2);
    let rows = check.query_all("select name from hero", &[]).unwrap();
    assert_eq!(rows[0].get(0), Some(&Value::Text("Rusty-Man".into())));
}

#[test]
fn test_unchanged_entities_are_not_written() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("heroes.db").to_string_lossy().into_owned();
    open(&path).execute_raw(SCHEMA).unwrap();

    let factory = factory();
    let mut session = factory.open_session(open(&path)).unwrap();
    session.begin().unwrap();
    let hero = session.get("Hero", 1_i64).unwrap().unwrap();
    assert!(!session.is_dirty().unwrap());
    session.commit().unwrap();
    assert_eq!(session.statistics().entity_updates, 0);
    assert_eq!(hero.read().version().and_then(Value::as_i64), Some(1));
}

#[test]
fn test_force_increment_lock_bumps_the_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("heroes.db").to_string_lossy().into_owned();
    open(&path).execute_raw(SCHEMA).unwrap();

    let factory = factory();
    let mut session = factory.open_session(open(&path)).unwrap();
    session.begin().unwrap();
    let hero = session.get("Hero", 1_i64).unwrap().unwrap();
    session.lock(hero.clone(), LockMode::OptimisticForceIncrement).unwrap();
    session.commit().unwrap();

    let mut check = open(&path);
    assert_eq!(scalar(&mut check, "select version from hero where id = 1", &[]), 2);
}
