//! Storage query collaborator.
//!
//! The relay's storage engine is external; the engine only needs
//! `query(filter) -> events`. [`EventQuery`] is that seam, and
//! [`EventStream`] is the lazy, single-pass result it returns.

use parking_lot::RwLock;
use std::io::BufRead;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use vigil_types::{ErrorCode, Event, Filter, TypeError};

/// Default capacity of the channel between a store producer and a stream.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Errors reported by a storage backend.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The backend could not be reached or could not start the query.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend failed while producing results.
    #[error("query failed: {0}")]
    Failed(String),

    /// A stored record could not be decoded.
    #[error("invalid event at line {line}: {source}")]
    Decode {
        line: usize,
        #[source]
        source: TypeError,
    },

    /// I/O failure while loading records.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorCode for QueryError {
    fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "QUERY_UNAVAILABLE",
            Self::Failed(_) => "QUERY_FAILED",
            Self::Decode { .. } => "QUERY_DECODE",
            Self::Io(_) => "QUERY_IO",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

/// The `query(filter) -> sequence of events` capability.
pub trait EventQuery: Send + Sync {
    /// Starts a query.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] if the query cannot be started. Failures after
    /// the first result surface as `Err` items of the stream.
    fn query(&self, filter: &Filter) -> Result<EventStream, QueryError>;
}

/// Lazy, finite, single-pass sequence of query results.
///
/// Dropping the stream before exhaustion releases the source: for a
/// channel-backed stream the receiver is closed and the producer's next
/// send fails.
pub struct EventStream {
    inner: Box<dyn Iterator<Item = Result<Event, QueryError>> + Send>,
}

impl EventStream {
    /// Wraps any iterator of results.
    pub fn new<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Result<Event, QueryError>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            inner: Box::new(iter.into_iter()),
        }
    }

    /// A stream that yields nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }

    /// Reads results from a bounded channel until the sender is dropped.
    ///
    /// Iteration blocks the current thread, so the stream must be consumed
    /// outside of an async context.
    #[must_use]
    pub fn from_channel(mut rx: mpsc::Receiver<Result<Event, QueryError>>) -> Self {
        Self::new(std::iter::from_fn(move || rx.blocking_recv()))
    }
}

impl Iterator for EventStream {
    type Item = Result<Event, QueryError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

/// In-process event store.
///
/// Results are produced newest first on a dedicated thread and delivered
/// through a bounded channel, mirroring how a database-backed store streams
/// rows. Cloning yields a handle to the same events.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    events: Arc<RwLock<Vec<Event>>>,
    capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Sets the result channel capacity (minimum 1).
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Adds an event.
    pub fn insert(&self, event: Event) {
        self.events.write().push(event);
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Loads one JSON event per line. Blank lines are skipped.
    ///
    /// Returns the number of events loaded.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Decode`] naming the 1-based line of the first
    /// malformed record, or [`QueryError::Io`] if reading fails.
    pub fn load_jsonl(&self, reader: impl BufRead) -> Result<usize, QueryError> {
        let mut loaded = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event = Event::from_json(&line).map_err(|source| QueryError::Decode {
                line: idx + 1,
                source,
            })?;
            loaded.push(event);
        }
        let count = loaded.len();
        self.events.write().extend(loaded);
        debug!(count, "Loaded events into memory store");
        Ok(count)
    }

    fn select(&self, filter: &Filter) -> Vec<Event> {
        let mut matched: Vec<Event> = self
            .events
            .read()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.effective_limit() {
            matched.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        matched
    }
}

impl EventQuery for MemoryStore {
    fn query(&self, filter: &Filter) -> Result<EventStream, QueryError> {
        let matched = self.select(filter);
        trace!(matched = matched.len(), "Memory store query");

        let (tx, rx) = mpsc::channel(self.capacity);
        std::thread::Builder::new()
            .name("vigil-memory-query".into())
            .spawn(move || {
                for event in matched {
                    if tx.blocking_send(Ok(event)).is_err() {
                        trace!("Query stream dropped before exhaustion");
                        break;
                    }
                }
            })
            .map_err(|e| QueryError::Unavailable(e.to_string()))?;

        Ok(EventStream::from_channel(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::assert_error_codes;

    fn event(id: &str, kind: i64, pubkey: &str, created_at: i64) -> Event {
        Event {
            id: id.into(),
            pubkey: pubkey.into(),
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
            sig: "sig".into(),
        }
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new().with_channel_capacity(1);
        store.insert(event("a", 0, "alice", 10));
        store.insert(event("b", 1, "alice", 30));
        store.insert(event("c", 1, "bob", 20));
        store
    }

    fn ids(stream: EventStream) -> Vec<String> {
        stream.map(|r| r.unwrap().id).collect()
    }

    #[test]
    fn query_returns_matches_newest_first() {
        let filter = Filter {
            kinds: Some(vec![1]),
            ..Filter::default()
        };
        assert_eq!(ids(store().query(&filter).unwrap()), vec!["b", "c"]);
    }

    #[test]
    fn query_honours_limit() {
        let filter = Filter {
            limit: Some(2),
            ..Filter::default()
        };
        assert_eq!(ids(store().query(&filter).unwrap()), vec!["b", "c"]);
    }

    #[test]
    fn explicit_zero_limit_yields_nothing() {
        let filter = Filter {
            limit_zero: true,
            ..Filter::default()
        };
        assert!(ids(store().query(&filter).unwrap()).is_empty());
    }

    #[test]
    fn abandoned_stream_does_not_block_producer() {
        let mut stream = store().query(&Filter::default()).unwrap();
        assert!(stream.next().is_some());
        drop(stream);
        // the producer notices the closed channel and exits; a second query
        // still works
        assert_eq!(ids(store().query(&Filter::default()).unwrap()).len(), 3);
    }

    #[test]
    fn channel_stream_forwards_errors() {
        let (tx, rx) = mpsc::channel(4);
        tx.try_send(Ok(event("x", 1, "p", 1))).unwrap();
        tx.try_send(Err(QueryError::Failed("disk".into()))).unwrap();
        drop(tx);

        let results: Vec<_> = EventStream::from_channel(rx).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(QueryError::Failed(_))));
    }

    #[test]
    fn load_jsonl_skips_blank_lines() {
        let input = concat!(
            r#"{"id":"1","pubkey":"p","created_at":1,"kind":1,"sig":"s"}"#,
            "\n\n",
            r#"{"id":"2","pubkey":"p","created_at":2,"kind":0,"sig":"s"}"#,
            "\n"
        );
        let store = MemoryStore::new();
        assert_eq!(store.load_jsonl(input.as_bytes()).unwrap(), 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn load_jsonl_reports_bad_line() {
        let input = "{\"id\":\"1\",\"pubkey\":\"p\",\"created_at\":1,\"kind\":1,\"sig\":\"s\"}\nnot json\n";
        let err = MemoryStore::new().load_jsonl(input.as_bytes()).unwrap_err();
        assert!(matches!(err, QueryError::Decode { line: 2, .. }));
    }

    #[test]
    fn error_codes() {
        assert_error_codes(
            &[
                QueryError::Unavailable("x".into()),
                QueryError::Failed("x".into()),
                QueryError::Io(std::io::Error::other("x")),
            ],
            "QUERY_",
        );
        assert!(QueryError::Unavailable("x".into()).is_recoverable());
        assert!(!QueryError::Failed("x".into()).is_recoverable());
    }
}
