mod common;

use std::sync::Arc;

use common::memory_db;
use hibernate::prelude::*;

const SCHEMA: &str = "
    CREATE TABLE team (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
    CREATE TABLE hero (id INTEGER PRIMARY KEY, name TEXT NOT NULL, team_id INTEGER);
    INSERT INTO team VALUES (1, 'Preventers'), (2, 'Z-Force');
    INSERT INTO hero VALUES (1, 'Deadpond', 1), (2, 'Rusty-Man', 2);
";

fn metamodel() -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityPersister::builder("Team", "team")
                .identifier("id", "id")
                .basic("name", "name")
                .cacheable(true)
                .collection("heroes", CollectionMapping::one_to_many("Hero", &["team_id"]).inverse(true))
                .build()
                .unwrap(),
        )
        .entity(
            EntityPersister::builder("Hero", "hero")
                .identifier("id", "id")
                .basic("name", "name")
                .to_one("team", ToOneMapping::many_to_one("Team", &["team_id"]))
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

fn cached_factory() -> Arc<SessionFactory> {
    SessionFactory::builder(metamodel())
        .settings(Settings::default().use_second_level_cache(true))
        .build()
        .unwrap()
}

fn name_of(entity: &EntityRef) -> String {
    entity.read().value("name").unwrap().as_str().unwrap().to_string()
}

#[test]
fn test_second_session_is_served_from_the_cache() {
    let factory = cached_factory();

    let mut first = factory.open_session(memory_db(SCHEMA)).unwrap();
    first.get("Team", 1_i64).unwrap().unwrap();
    assert_eq!(first.statistics().cache_misses, 1);
    assert_eq!(first.statistics().cache_puts, 1);
    first.close().unwrap();

    let mut second = factory.open_session(memory_db(SCHEMA)).unwrap();
    let team = second.get("Team", 1_i64).unwrap().unwrap();
    assert_eq!(name_of(&team), "Preventers");
    assert_eq!(second.statistics().cache_hits, 1);
    assert_eq!(second.statistics().queries_executed, 0);

    // Assembled like a database load: managed, with a lazy collection.
    assert!(second.contains(&EntityHandle::from(team.clone())));
    let heroes = team.read().collection("heroes").unwrap().cloned().unwrap();
    assert!(!heroes.is_initialized());
    second.initialize_collection(&heroes).unwrap();
    assert_eq!(heroes.len().unwrap(), 1);
    assert_eq!(second.statistics().queries_executed, 1);
}

#[test]
fn test_proxies_initialize_from_the_cache() {
    let factory = cached_factory();
    let mut warm = factory.open_session(memory_db(SCHEMA)).unwrap();
    warm.list(&Criteria::new("Team")).unwrap();
    assert_eq!(warm.statistics().cache_puts, 2);

    let mut session = factory.open_session(memory_db(SCHEMA)).unwrap();
    let hero = session.get("Hero", 2_i64).unwrap().unwrap();
    let proxy = hero
        .read()
        .to_one("team")
        .unwrap()
        .and_then(EntityHandle::as_proxy)
        .cloned()
        .unwrap();
    let team = session.initialize_proxy(&proxy).unwrap();
    assert_eq!(name_of(&team), "Z-Force");
    assert_eq!(session.statistics().queries_executed, 1);
    assert_eq!(session.statistics().cache_hits, 1);
}

#[test]
fn test_updates_evict_the_cached_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("teams.db").to_string_lossy().into_owned();
    let open = || SqliteConnection::open(&SqliteConfig::file(&path)).unwrap();
    open().execute_raw(SCHEMA).unwrap();

    let factory = cached_factory();
    let mut first = factory.open_session(open()).unwrap();
    first.get("Team", 1_i64).unwrap().unwrap();
    first.close().unwrap();

    let mut writer = factory.open_session(open()).unwrap();
    writer.begin().unwrap();
    let team = writer.get("Team", 1_i64).unwrap().unwrap();
    assert_eq!(writer.statistics().cache_hits, 1);
    team.write().set("name", "Avengers").unwrap();
    writer.commit().unwrap();
    writer.close().unwrap();

    let mut reader = factory.open_session(open()).unwrap();
    let team = reader.get("Team", 1_i64).unwrap().unwrap();
    assert_eq!(reader.statistics().cache_misses, 1);
    assert_eq!(reader.statistics().queries_executed, 1);
    assert_eq!(name_of(&team), "Avengers");
}

#[test]
fn test_regions_are_ignored_while_caching_is_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let settings_path = dir.path().join("settings.json");
    std::fs::write(&settings_path, r#"{ "use_second_level_cache": false, "show_sql": true }"#).unwrap();
    let settings = Settings::from_json_file(&settings_path).unwrap();
    assert!(settings.show_sql);

    let factory = SessionFactory::builder(metamodel()).settings(settings).build().unwrap();
    assert!(factory.cache_region("Team").is_none());

    for _ in 0..2 {
        let mut session = factory.open_session(memory_db(SCHEMA)).unwrap();
        session.get("Team", 1_i64).unwrap().unwrap();
        assert_eq!(session.statistics().queries_executed, 1);
        assert_eq!(session.statistics().cache_hits, 0);
    }
}
