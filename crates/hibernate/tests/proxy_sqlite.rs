mod common;

use std::sync::Arc;

use common::memory_db;
use hibernate::prelude::*;
use hibernate::{LazyInitializationErrorKind, SerializableProxy, UsageErrorKind};

const SCHEMA: &str = "
    CREATE TABLE team (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
    CREATE TABLE hero (id INTEGER PRIMARY KEY, name TEXT NOT NULL, team_id INTEGER);
    INSERT INTO team VALUES (1, 'Preventers');
    INSERT INTO hero VALUES (1, 'Deadpond', 1), (2, 'Rusty-Man', 1);
";

fn factory() -> Arc<SessionFactory> {
    let metamodel = Metamodel::builder()
        .entity(
            EntityPersister::builder("Team", "team")
                .identifier("id", "id")
                .basic("name", "name")
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
        .unwrap();
    SessionFactory::builder(metamodel).build().unwrap()
}

fn lazy_kind(err: &Error) -> Option<LazyInitializationErrorKind> {
    match err {
        Error::LazyInitialization(lazy) => Some(lazy.kind),
        _ => None,
    }
}

#[test]
fn test_proxy_of_a_closed_session_cannot_initialize() {
    let factory = factory();
    let mut first = factory.open_session(memory_db(SCHEMA)).unwrap();
    let proxy = first.load("Hero", 1_i64).unwrap().as_proxy().cloned().unwrap();
    assert!(proxy.is_attached());
    first.close().unwrap();
    assert!(!proxy.is_attached());

    let mut second = factory.open_session(memory_db(SCHEMA)).unwrap();
    let err = second.initialize_proxy(&proxy).unwrap_err();
    assert!(err.is_lazy_initialization());
    assert_eq!(lazy_kind(&err), Some(LazyInitializationErrorKind::SessionClosed));
    assert!(!proxy.is_initialized());

    // Binding it to the new session makes it usable again.
    second.reassociate_proxy(&proxy).unwrap();
    let hero = second.initialize_proxy(&proxy).unwrap();
    assert_eq!(hero.read().value("name").unwrap(), &Value::Text("Deadpond".into()));
}

#[test]
fn test_lazy_collection_of_a_closed_session_stays_unreadable() {
    let factory = factory();
    let mut session = factory.open_session(memory_db(SCHEMA)).unwrap();
    let team = session.get("Team", 1_i64).unwrap().unwrap();
    let heroes = team.read().collection("heroes").unwrap().cloned().unwrap();
    session.close().unwrap();

    let err = heroes.entities().unwrap_err();
    assert_eq!(lazy_kind(&err), Some(LazyInitializationErrorKind::UninitializedCollection));
    assert!(session.initialize_collection(&heroes).is_err());
}

#[test]
fn test_serialized_proxy_resolves_in_a_new_session() {
    let factory = factory();
    let mut first = factory.open_session(memory_db(SCHEMA)).unwrap();
    let proxy = first.load("Hero", 2_i64).unwrap().as_proxy().cloned().unwrap();
    let json = proxy.write_replace().to_json().unwrap();
    first.close().unwrap();

    let restored = SerializableProxy::from_json(&json).unwrap().read_resolve().unwrap();
    assert_eq!(restored.entity_name(), "Hero");
    assert_eq!(restored.identifier(), Value::BigInt(2));
    assert!(!restored.is_initialized());

    let mut second = factory.open_session(memory_db(SCHEMA)).unwrap();
    let err = second.initialize_proxy(&restored).unwrap_err();
    assert_eq!(lazy_kind(&err), Some(LazyInitializationErrorKind::NoSession));

    second.reassociate_proxy(&restored).unwrap();
    let hero = second.initialize_proxy(&restored).unwrap();
    assert_eq!(hero.read().value("name").unwrap(), &Value::Text("Rusty-Man".into()));
    assert!(second.get("Hero", 2_i64).unwrap().unwrap().ptr_eq(&hero));
}

#[test]
fn test_serialized_proxy_needs_its_factory() {
    let factory = factory();
    let mut session = factory.open_session(memory_db(SCHEMA)).unwrap();
    let serialized = session.load("Hero", 1_i64).unwrap().as_proxy().unwrap().write_replace();
    session.close().unwrap();

    factory.close();
    let err = serialized.read_resolve().unwrap_err();
    assert!(matches!(err, Error::Usage(ref usage) if usage.kind == UsageErrorKind::FactoryClosed));
    assert!(factory.open_session(memory_db(SCHEMA)).is_err());
}

#[test]
fn test_proxy_from_another_factory_is_rejected() {
    let one = factory();
    let other = factory();
    let mut session = one.open_session(memory_db(SCHEMA)).unwrap();
    let proxy = session.load("Team", 1_i64).unwrap().as_proxy().cloned().unwrap();

    let mut foreign = other.open_session(memory_db(SCHEMA)).unwrap();
    assert!(foreign.reassociate_proxy(&proxy).is_err());
    let err = foreign.initialize_proxy(&proxy).unwrap_err();
    assert_eq!(lazy_kind(&err), Some(LazyInitializationErrorKind::ForeignSession));
}
