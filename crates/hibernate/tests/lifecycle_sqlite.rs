mod common;

use std::sync::{Arc, Mutex};

use common::memory_db;
use hibernate::prelude::*;
use hibernate::EntityListener;

const SCHEMA: &str = "
    CREATE TABLE team (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
    CREATE TABLE hero (id INTEGER PRIMARY KEY, name TEXT NOT NULL, team_id INTEGER);
    INSERT INTO team VALUES (1, 'Preventers');
    INSERT INTO hero VALUES (1, 'Deadpond', 1), (2, 'Rusty-Man', 1), (3, 'Spider-Boy', 1);
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
                        .fetch(FetchMode::Join),
                )
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

/// Records what each `post_load` call could see.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, Option<usize>)>>,
}

impl EntityListener for Recorder {
    fn post_load(&self, entity: &EntityRef) -> Result<()> {
        let heroes = entity
            .read()
            .collection("heroes")
            .ok()
            .flatten()
            .and_then(|c| c.len().ok());
        self.seen
            .lock()
            .unwrap()
            .push((entity.entity_name(), heroes));
        Ok(())
    }
}

struct Failing;

impl EntityListener for Failing {
    fn post_load(&self, _entity: &EntityRef) -> Result<()> {
        Err(Error::Custom("listener failed".into()))
    }
}

struct Shared(Arc<Recorder>);

impl EntityListener for Shared {
    fn post_load(&self, entity: &EntityRef) -> Result<()> {
        self.0.post_load(entity)
    }
}

#[test]
fn test_post_load_sees_the_complete_fan_out() {
    let factory = factory();
    let mut session = factory.open_session(memory_db(SCHEMA)).unwrap();
    let recorder = Arc::new(Recorder::default());
    session.add_listener(Shared(Arc::clone(&recorder)));

    let team = session.get("Team", 1_i64).unwrap().unwrap();
    assert_eq!(session.statistics().queries_executed, 1);

    let seen = recorder.seen.lock().unwrap().clone();
    let team_calls: Vec<_> = seen.iter().filter(|(name, _)| name == "Team").collect();
    assert_eq!(team_calls, vec![&("Team".to_string(), Some(3))]);
    assert_eq!(seen.iter().filter(|(name, _)| name == "Hero").count(), 3);

    let heroes = team.read().collection("heroes").unwrap().cloned().unwrap();
    assert_eq!(heroes.len().unwrap(), 3);
}

#[test]
fn test_failing_callbacks_do_not_fail_the_load() {
    let factory = factory();
    let mut session = factory.open_session(memory_db(SCHEMA)).unwrap();
    session.add_listener(Failing);
    let calls = Arc::new(Mutex::new(0_usize));
    let counter = Arc::clone(&calls);
    session.add_after_load_action(move |_: &EntityRef, _: &EntityPersister| {
        *counter.lock().unwrap() += 1;
        Ok(())
    });

    let team = session.get("Team", 1_i64).unwrap();
    assert!(team.is_some());
    assert_eq!(session.statistics().callback_failures, 4);
    assert_eq!(*calls.lock().unwrap(), 4);
}

#[test]
fn test_flush_callbacks_run_around_the_flush() {
    let factory = factory();
    let mut session = factory.open_session(memory_db(SCHEMA)).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    for (label, before) in [("before", true), ("after", false)] {
        let log = Arc::clone(&log);
        let callback = move || {
            log.lock().unwrap().push(label);
            Ok(())
        };
        if before {
            session.on_before_flush(callback);
        } else {
            session.on_after_flush(callback);
        }
    }

    session.begin().unwrap();
    let hero = session.get("Hero", 1_i64).unwrap().unwrap();
    hero.write().set("name", "Lady Deadpool").unwrap();
    session.commit().unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["before", "after"]);
    assert_eq!(session.statistics().entity_updates, 1);
    assert_eq!(session.statistics().flushes, 1);
}
