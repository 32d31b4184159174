//! `PolicyService` on a tokio runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use vigil_lua::{PolicyEngine, PolicyService};
use vigil_runtime::config::VigilConfig;
use vigil_runtime::{ConnectionSnapshot, EventQuery, EventStream, MemoryStore, QueryError};
use vigil_types::{Event, Filter};

/// A store that takes far longer than any script deadline.
struct StalledStore;

impl EventQuery for StalledStore {
    fn query(&self, _filter: &Filter) -> Result<EventStream, QueryError> {
        std::thread::sleep(Duration::from_millis(1500));
        Ok(EventStream::empty())
    }
}

fn service(
    event_script: &str,
    query: Arc<dyn EventQuery>,
    timeout_ms: u64,
) -> (TempDir, PolicyService) {
    let dir = TempDir::new().unwrap();
    let mut config = VigilConfig::default();
    config.scripts.dir = dir.path().to_path_buf();
    config.limits.timeout_ms = timeout_ms;
    std::fs::write(config.scripts.event_path(), event_script).unwrap();
    std::fs::write(
        config.scripts.filter_path(),
        r#"return function(filter) if filter.search then return "no search" end end"#,
    )
    .unwrap();
    let engine = Arc::new(PolicyEngine::new(&config, query));
    (dir, PolicyService::new(engine))
}

fn note() -> Event {
    Event {
        id: "id".into(),
        pubkey: "pk".into(),
        created_at: 1,
        kind: 1,
        tags: vec![],
        content: "hello".into(),
        sig: "sig".into(),
    }
}

#[tokio::test]
async fn decides_on_blocking_pool() {
    let (_dir, service) = service(
        r#"return function(event) return delay(10, "async " .. event.content) end"#,
        Arc::new(MemoryStore::new()),
        5_000,
    );
    let conn = ConnectionSnapshot::new("ip");

    let d = service.decide_event(note(), &conn).await;
    assert!(d.is_rejected());
    assert_eq!(d.message(), "async hello");

    let filter = Filter::from_json(r#"{"search":"x"}"#).unwrap();
    assert_eq!(service.decide_filter(filter, &conn).await.message(), "no search");
    assert!(service
        .decide_filter(Filter::default(), &conn)
        .await
        .is_accepted());
}

#[tokio::test]
async fn concurrent_decisions_share_the_global_store() {
    let (_dir, service) = service(
        r#"return function(event, relay) relay.store.set(event.id, true) end"#,
        Arc::new(MemoryStore::new()),
        5_000,
    );

    let mut tasks = Vec::new();
    for i in 0..8 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            let conn = ConnectionSnapshot::new("ip");
            let mut ev = note();
            ev.id = format!("e{i}");
            service.decide_event(ev, &conn).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_accepted());
    }
    for i in 0..8 {
        assert!(service.engine().global_store().get(&format!("e{i}")).is_some());
    }
}

#[tokio::test]
async fn outer_timeout_fails_closed() {
    let (_dir, service) = service(
        r#"return function(event, relay) relay.query({}):next() end"#,
        Arc::new(StalledStore),
        100,
    );
    let service = service.with_grace(Duration::ZERO);

    let started = Instant::now();
    let d = service.decide_event(note(), &ConnectionSnapshot::new("ip")).await;
    assert!(started.elapsed() < Duration::from_millis(1000));
    assert!(d.is_rejected());
    assert_eq!(d.message(), "error: policy script timed out");
}

#[tokio::test]
async fn disconnect_clears_session() {
    let (_dir, service) = service(
        r#"return function(event, relay, conn) conn.store.set("k", 1) end"#,
        Arc::new(MemoryStore::new()),
        5_000,
    );
    let conn = ConnectionSnapshot::new("ip");
    service.decide_event(note(), &conn).await;
    assert!(service.engine().session_store().contains(conn.id));

    service.on_disconnect(conn.id);
    assert!(!service.engine().session_store().contains(conn.id));
}
