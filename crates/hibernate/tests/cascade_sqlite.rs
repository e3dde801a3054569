mod common;

use std::sync::Arc;

use common::{rows, scalar};
use hibernate::prelude::*;

const SCHEMA: &str = "
    CREATE TABLE team (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
    CREATE TABLE hero (id INTEGER PRIMARY KEY, version INTEGER NOT NULL, name TEXT NOT NULL, team_id INTEGER);
    CREATE TABLE hero_nickname (hero_id INTEGER NOT NULL, nickname TEXT NOT NULL);
    INSERT INTO team VALUES (1, 'Preventers');
    INSERT INTO hero VALUES (1, 3, 'Deadpond', 1);
    INSERT INTO hero_nickname VALUES (1, 'Merc'), (1, 'Wade');
";

fn factory() -> Arc<SessionFactory> {
    let metamodel = Metamodel::builder()
        .entity(
            EntityPersister::builder("Team", "team")
                .identifier("id", "id")
                .basic("name", "name")
                .collection(
                    "heroes",
                    CollectionMapping::one_to_many("Hero", &["team_id"])
                        .inverse(true)
                        .cascade(CascadeStyle::ALL),
                )
                .build()
                .unwrap(),
        )
        .entity(
            EntityPersister::builder("Hero", "hero")
                .identifier("id", "id")
                .generator(IdGenerator::Increment)
                .version("version", "version")
                .basic("name", "name")
                .to_one(
                    "team",
                    ToOneMapping::many_to_one("Team", &["team_id"]).cascade(CascadeStyle::ALL),
                )
                .collection(
                    "nicknames",
                    CollectionMapping::elements("hero_nickname", &["hero_id"], "nickname")
                        .kind(CollectionKind::Set),
                )
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    SessionFactory::builder(metamodel).build().unwrap()
}

struct Db {
    _dir: tempfile::TempDir,
    path: String,
}

impl Db {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cascade.db").to_string_lossy().into_owned();
        let db = Self { _dir: dir, path };
        db.open().execute_raw(SCHEMA).unwrap();
        db
    }

    fn open(&self) -> SqliteConnection {
        SqliteConnection::open(&SqliteConfig::file(&self.path)).unwrap()
    }

    fn count(&self, sql: &str) -> i64 {
        scalar(&mut self.open(), sql, &[])
    }
}

/// A new team with two new heroes, wired in both directions.
fn new_team<C: Connection>(session: &Session<C>) -> (EntityRef, Vec<EntityRef>) {
    let team = session.instantiate("Team").unwrap();
    team.write().set_identifier(Some(Value::BigInt(2)));
    team.write().set("name", "Z-Force").unwrap();
    let heroes_collection = session.new_collection("Team.heroes").unwrap();
    let mut heroes = Vec::new();
    for name in ["Spider-Boy", "Tarantula"] {
        let hero = session.instantiate("Hero").unwrap();
        hero.write().set("name", name).unwrap();
        hero.write().set_to_one("team", Some(team.clone().into())).unwrap();
        heroes_collection.push(hero.clone()).unwrap();
        heroes.push(hero);
    }
    let nicknames = session.new_collection("Hero.nicknames").unwrap();
    nicknames.push(Value::from("Spidey")).unwrap();
    heroes[0].write().set_collection("nicknames", Some(nicknames)).unwrap();
    team.write().set_collection("heroes", Some(heroes_collection)).unwrap();
    (team, heroes)
}

#[test]
fn test_persisting_a_cycle_writes_every_row_once() {
    let db = Db::new();
    let factory = factory();
    let mut session = factory.open_session(db.open()).unwrap();

    session.begin().unwrap();
    let (team, heroes) = new_team(&session);
    session.persist(&team).unwrap();
    // Generated from max(id) at persist time.
    assert_eq!(heroes[0].read().identifier(), Some(&Value::BigInt(2)));
    assert_eq!(heroes[1].read().identifier(), Some(&Value::BigInt(3)));
    session.commit().unwrap();

    assert_eq!(session.statistics().entity_inserts, 3);
    assert_eq!(db.count("select count(*) from team where id = 2"), 1);
    assert_eq!(db.count("select count(*) from hero where team_id = 2"), 2);
    assert_eq!(db.count("select min(version) from hero where team_id = 2"), 0);
    let nicknames = rows(&mut db.open(), "select nickname from hero_nickname where hero_id = 2", &[]);
    assert_eq!(nicknames.len(), 1);
    assert_eq!(nicknames[0].get(0), Some(&Value::Text("Spidey".into())));

    // A second flush has nothing left to do.
    session.flush().unwrap();
    assert_eq!(session.statistics().entity_inserts, 3);
    assert_eq!(session.statistics().entity_updates, 0);
}

#[test]
fn test_rollback_forgets_new_instances() {
    let db = Db::new();
    let factory = factory();
    let mut session = factory.open_session(db.open()).unwrap();

    session.begin().unwrap();
    let (team, heroes) = new_team(&session);
    session.persist(&team).unwrap();
    session.flush().unwrap();
    assert!(session.contains(&team.clone().into()));
    session.rollback().unwrap();

    assert!(!session.contains(&team.into()));
    assert!(!session.contains(&heroes[0].clone().into()));
    assert!(session.action_queue().is_empty());
    assert_eq!(db.count("select count(*) from hero"), 1);
    assert_eq!(db.count("select count(*) from team"), 1);
}

#[test]
fn test_deleting_a_parent_cascades_to_its_children() {
    let db = Db::new();
    let factory = factory();
    let mut session = factory.open_session(db.open()).unwrap();

    session.begin().unwrap();
    let team = session.get("Team", 1_i64).unwrap().unwrap();
    session.delete(team.clone()).unwrap();
    assert!(session.get("Team", 1_i64).unwrap().is_none());
    session.commit().unwrap();

    assert_eq!(session.statistics().entity_deletes, 2);
    assert_eq!(db.count("select count(*) from team"), 0);
    assert_eq!(db.count("select count(*) from hero"), 0);
    assert_eq!(db.count("select count(*) from hero_nickname"), 0);
}

#[test]
fn test_element_changes_are_written_as_a_diff() {
    let db = Db::new();
    let factory = factory();
    let mut session = factory.open_session(db.open()).unwrap();

    session.begin().unwrap();
    let hero = session.get("Hero", 1_i64).unwrap().unwrap();
    let nicknames = hero.read().collection("nicknames").unwrap().cloned().unwrap();
    session.initialize_collection(&nicknames).unwrap();
    nicknames.remove(&Value::from("Merc").into()).unwrap();
    nicknames.push(Value::from("Deadpool")).unwrap();
    session.commit().unwrap();

    let mut names: Vec<String> = rows(&mut db.open(), "select nickname from hero_nickname where hero_id = 1", &[])
        .iter()
        .filter_map(|row| row.get(0).and_then(Value::as_str).map(str::to_string))
        .collect();
    names.sort();
    assert_eq!(names, vec!["Deadpool", "Wade"]);
    // The owner is versioned, so a collection change bumps its version.
    assert_eq!(db.count("select version from hero where id = 1"), 4);
}

#[test]
fn test_merge_copies_detached_state_onto_the_managed_instance() {
    let db = Db::new();
    let factory = factory();

    let mut first = factory.open_session(db.open()).unwrap();
    let detached = first.get("Hero", 1_i64).unwrap().unwrap();
    first.close().unwrap();
    detached.write().set("name", "Lady Deadpool").unwrap();

    let mut second = factory.open_session(db.open()).unwrap();
    second.begin().unwrap();
    let managed = second.merge(&detached).unwrap();
    assert!(!managed.ptr_eq(&detached));
    assert_eq!(
        managed.read().value("name").unwrap(),
        &Value::Text("Lady Deadpool".into())
    );
    second.commit().unwrap();

    let stored = rows(&mut db.open(), "select name, version from hero where id = 1", &[]);
    assert_eq!(stored[0].get(0), Some(&Value::Text("Lady Deadpool".into())));
    assert_eq!(stored[0].get(1).and_then(Value::as_i64), Some(4));
}
