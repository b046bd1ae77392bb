//! Background task scheduling for the slow loop.
//!
//! The hippocampus never calls `tokio::spawn` directly — it goes through a
//! [`Scheduler`] so tests can run the same extraction pipeline inline,
//! deterministically, without a runtime.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type TaskId = u64;
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Spawns a fire-and-forget future and returns an id the caller can track
/// in a [`TaskSet`] for completion bookkeeping.
pub trait Scheduler: Send + Sync {
    fn spawn(&self, task_id: TaskId, future: BoxFuture);
}

/// Production scheduler: one real `tokio::spawn` per task.
#[derive(Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn spawn(&self, _task_id: TaskId, future: BoxFuture) {
        tokio::spawn(future);
    }
}

/// Test scheduler: runs the future to completion on the current task
/// before returning, so assertions made right after a buffered chunk
/// crosses the threshold observe the finished effect.
#[derive(Default)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn spawn(&self, _task_id: TaskId, future: BoxFuture) {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(future);
        });
    }
}

/// Tracks ids of in-flight background tasks so callers can tell whether a
/// session's slow-loop processing is still running.
#[derive(Default)]
pub struct TaskSet {
    next_id: AtomicU64,
    inflight: Mutex<HashSet<TaskId>>,
}

impl TaskSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reserve(&self) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.inflight.lock().unwrap().insert(id);
        id
    }

    pub fn complete(&self, id: TaskId) {
        self.inflight.lock().unwrap().remove(&id);
    }

    pub fn is_idle(&self) -> bool {
        self.inflight.lock().unwrap().is_empty()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }
}
