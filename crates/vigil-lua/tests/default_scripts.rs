//! Behaviour of the built-in policy scripts written by `ensure_default_scripts`.

use std::sync::Arc;
use tempfile::TempDir;
use vigil_lua::{ensure_default_scripts, PolicyEngine};
use vigil_runtime::config::VigilConfig;
use vigil_runtime::{ConnectionSnapshot, MemoryStore};
use vigil_types::{Event, Filter};

fn setup() -> (TempDir, MemoryStore, PolicyEngine) {
    let dir = TempDir::new().unwrap();
    let mut config = VigilConfig::default();
    config.scripts.dir = dir.path().join("scripts");
    let created = ensure_default_scripts(&config.scripts).unwrap();
    assert_eq!(created.len(), 2);

    let store = MemoryStore::new();
    let engine = PolicyEngine::new(&config, Arc::new(store.clone()));
    (dir, store, engine)
}

fn event(kind: i64, content: &str, tags: Vec<Vec<String>>) -> Event {
    Event {
        id: format!("{kind}-{content}"),
        pubkey: "alice".into(),
        created_at: 1_700_000_000,
        kind,
        tags,
        content: content.into(),
        sig: "sig".into(),
    }
}

fn note(content: &str) -> Event {
    event(1, content, vec![])
}

#[test]
fn metadata_requires_auth() {
    let (_dir, _store, engine) = setup();
    let anon = ConnectionSnapshot::new("ip");
    let authed = ConnectionSnapshot::new("ip").with_pubkey("alice");

    assert_eq!(
        engine.decide_event(&event(0, "{}", vec![]), &anon).message(),
        "auth-required: please auth before publishing metadata"
    );
    assert!(engine.decide_event(&event(0, "{}", vec![]), &authed).is_accepted());
}

#[test]
fn only_short_untagged_notes_from_known_authors() {
    let (_dir, store, engine) = setup();
    let conn = ConnectionSnapshot::new("ip");

    assert_eq!(
        engine.decide_event(&event(3, "", vec![]), &conn).message(),
        "we only accept kind:1 notes"
    );
    assert_eq!(
        engine.decide_event(&note(&"x".repeat(141)), &conn).message(),
        "notes must have up to 140 characters only"
    );
    assert_eq!(
        engine
            .decide_event(&event(1, "hi", vec![vec!["t".into(), "x".into()]]), &conn)
            .message(),
        "notes cannot have tags"
    );
    assert_eq!(
        engine.decide_event(&note("hi"), &conn).message(),
        "publish your metadata here first"
    );

    store.insert(event(0, "{}", vec![]));
    assert!(engine.decide_event(&note("hi"), &conn).is_accepted());
    // 140 characters, more than 140 bytes
    assert!(engine.decide_event(&note(&"é".repeat(140)), &conn).is_accepted());
}

#[test]
fn filters_require_auth() {
    let (_dir, _store, engine) = setup();
    let d = engine.decide_filter(&Filter::default(), &ConnectionSnapshot::new("ip"));
    assert_eq!(
        d.message(),
        "auth-required: take a selfie and send it to the CIA"
    );
}
