//! Per-invocation job queue.
//!
//! Promise reactions, thenable adoption and `fetch` requests are queued as
//! microtasks; `set_timeout` and `delay` callbacks are queued as timers.
//! The engine owns the queue and exhausts it with [`drain`] before a
//! decision is returned, so `decide()` stays synchronous for the host.

use crate::sandbox::Deadline;
use mlua::Lua;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce(&Lua) -> mlua::Result<()> + Send>;

#[derive(Default)]
struct QueueInner {
    microtasks: VecDeque<Task>,
    timers: BTreeMap<(Instant, u64), Task>,
    seq: u64,
}

/// FIFO microtask queue plus a timer wheel ordered by due time.
///
/// Stored in the VM's app data. Cloning yields a handle to the same queue.
#[derive(Clone, Default)]
pub struct JobQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("JobQueue")
            .field("microtasks", &inner.microtasks.len())
            .field("timers", &inner.timers.len())
            .finish()
    }
}

impl JobQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches the queue installed in `lua`.
    ///
    /// # Errors
    ///
    /// Returns a runtime error if no queue is installed.
    pub fn of(lua: &Lua) -> mlua::Result<Self> {
        lua.app_data_ref::<JobQueue>()
            .map(|q| (*q).clone())
            .ok_or_else(|| mlua::Error::RuntimeError("job queue not installed".into()))
    }

    /// Queues a microtask.
    pub fn enqueue(&self, task: Task) {
        self.inner.lock().microtasks.push_back(task);
    }

    /// Queues `task` to run once `delay` has elapsed.
    pub fn schedule(&self, delay: Duration, task: Task) {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let key = (Instant::now() + delay, inner.seq);
        inner.timers.insert(key, task);
    }

    fn pop_microtask(&self) -> Option<Task> {
        self.inner.lock().microtasks.pop_front()
    }

    fn pop_due_timer(&self, now: Instant) -> Option<Task> {
        let mut inner = self.inner.lock();
        let key = *inner.timers.keys().next()?;
        if key.0 <= now {
            inner.timers.remove(&key)
        } else {
            None
        }
    }

    fn next_timer_at(&self) -> Option<Instant> {
        self.inner.lock().timers.keys().next().map(|(at, _)| *at)
    }

    /// Number of queued microtasks and timers.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.microtasks.len() + inner.timers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every queued task.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.microtasks.clear();
        inner.timers.clear();
    }
}

/// Runs queued work until `done` reports true or nothing is left.
///
/// Microtasks run FIFO; when none remain the earliest timer runs, sleeping
/// until it is due. Sleeps never extend past the deadline.
///
/// # Errors
///
/// Propagates the first task error, or a deadline error once time runs out.
pub fn drain(
    lua: &Lua,
    queue: &JobQueue,
    deadline: &Deadline,
    done: impl Fn() -> bool,
) -> mlua::Result<()> {
    loop {
        while let Some(task) = queue.pop_microtask() {
            deadline.check()?;
            task(lua)?;
        }
        if done() {
            return Ok(());
        }

        let now = Instant::now();
        if let Some(task) = queue.pop_due_timer(now) {
            deadline.check()?;
            task(lua)?;
            continue;
        }

        let Some(at) = queue.next_timer_at() else {
            return Ok(());
        };
        if at > deadline.at() {
            std::thread::sleep(deadline.remaining());
            deadline.check()?;
        }
        let wait = at.saturating_duration_since(Instant::now());
        trace!(?wait, "Waiting for timer");
        std::thread::sleep(wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Task) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let make = move |name: &'static str| -> Task {
            let log = Arc::clone(&log2);
            Box::new(move |_lua: &Lua| {
                log.lock().push(name);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn microtasks_before_timers_in_order() {
        let lua = Lua::new();
        let queue = JobQueue::new();
        let (log, task) = recorder();

        queue.schedule(Duration::from_millis(20), task("late"));
        queue.schedule(Duration::from_millis(5), task("early"));
        queue.enqueue(task("a"));
        queue.enqueue(task("b"));

        drain(&lua, &queue, &Deadline::after(Duration::from_secs(5)), || false).unwrap();

        assert_eq!(*log.lock(), vec!["a", "b", "early", "late"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn tasks_may_enqueue_more_tasks() {
        let lua = Lua::new();
        let queue = JobQueue::new();
        let count = Arc::new(AtomicUsize::new(0));

        let q = queue.clone();
        let c = Arc::clone(&count);
        queue.enqueue(Box::new(move |_: &Lua| {
            c.fetch_add(1, Ordering::SeqCst);
            let c2 = Arc::clone(&c);
            q.enqueue(Box::new(move |_: &Lua| {
                c2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
            Ok(())
        }));

        drain(&lua, &queue, &Deadline::after(Duration::from_secs(5)), || false).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stops_early_when_done() {
        let lua = Lua::new();
        let queue = JobQueue::new();
        let (log, task) = recorder();
        queue.enqueue(task("now"));
        queue.schedule(Duration::from_secs(60), task("never"));

        drain(&lua, &queue, &Deadline::after(Duration::from_secs(5)), || true).unwrap();
        assert_eq!(*log.lock(), vec!["now"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn timer_past_deadline_times_out() {
        let lua = Lua::new();
        let queue = JobQueue::new();
        let (_log, task) = recorder();
        queue.schedule(Duration::from_secs(60), task("late"));

        let deadline = Deadline::after(Duration::from_millis(20));
        let started = Instant::now();
        let result = drain(&lua, &queue, &deadline, || false);

        assert!(result.is_err());
        assert!(deadline.expired());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn task_error_propagates() {
        let lua = Lua::new();
        let queue = JobQueue::new();
        queue.enqueue(Box::new(|_: &Lua| Err(mlua::Error::RuntimeError("bad".into()))));
        let err = drain(&lua, &queue, &Deadline::after(Duration::from_secs(1)), || false)
            .unwrap_err();
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn of_requires_installed_queue() {
        let lua = Lua::new();
        assert!(JobQueue::of(&lua).is_err());
        lua.set_app_data(JobQueue::new());
        assert!(JobQueue::of(&lua).is_ok());
    }
}
