//! Task-graph runtime over a dedicated work-stealing pool.
//!
//! Three operations: `spawn`, `spawn_after`, `wait_all`. Dependencies are
//! resolved by countdown, never by blocking a worker, so a running task
//! may freely spawn further tasks through a clone of the graph without
//! risking pool starvation. No fairness guarantees beyond eventual
//! execution.

use crate::error::{Result, TilerError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct DeferredTask {
    remaining: AtomicUsize,
    job: Mutex<Option<Job>>,
}

#[derive(Default)]
struct TaskWaiters {
    completed: bool,
    dependents: Vec<Arc<DeferredTask>>,
}

struct TaskState {
    waiters: Mutex<TaskWaiters>,
}

/// Completion handle of a spawned task, usable as a dependency.
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

struct GraphInner {
    pool: rayon::ThreadPool,
    in_flight: Mutex<usize>,
    all_done: Condvar,
}

#[derive(Clone)]
pub struct ExecutionGraph {
    inner: Arc<GraphInner>,
}

impl ExecutionGraph {
    pub fn new(concurrency: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .build()
            .map_err(|e| TilerError::invalid_config(format!("could not build thread pool: {}", e)))?;
        Ok(Self {
            inner: Arc::new(GraphInner {
                pool,
                in_flight: Mutex::new(0),
                all_done: Condvar::new(),
            }),
        })
    }

    pub fn concurrency(&self) -> usize {
        self.inner.pool.current_num_threads()
    }

    fn begin_task(&self) {
        let mut in_flight = self.inner.in_flight.lock().expect("graph state poisoned");
        *in_flight += 1;
    }

    fn finish_task(&self, state: &Arc<TaskState>) {
        // Release dependents before dropping our own in-flight count so
        // wait_all can never observe an empty graph with work pending.
        let dependents = {
            let mut waiters = state.waiters.lock().expect("task state poisoned");
            waiters.completed = true;
            std::mem::take(&mut waiters.dependents)
        };
        for dependent in dependents {
            self.release_dependency(&dependent);
        }

        let mut in_flight = self.inner.in_flight.lock().expect("graph state poisoned");
        *in_flight -= 1;
        if *in_flight == 0 {
            self.inner.all_done.notify_all();
        }
    }

    fn release_dependency(&self, deferred: &Arc<DeferredTask>) {
        if deferred.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let job = deferred
                .job
                .lock()
                .expect("deferred task poisoned")
                .take()
                .expect("deferred task submitted twice");
            self.inner.pool.spawn(job);
        }
    }

    /// Submits an independent task.
    pub fn spawn<F>(&self, task: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(TaskState {
            waiters: Mutex::new(TaskWaiters::default()),
        });
        self.begin_task();
        let graph = self.clone();
        let task_state = Arc::clone(&state);
        self.inner.pool.spawn(move || {
            task();
            graph.finish_task(&task_state);
        });
        TaskHandle { state }
    }

    /// Submits a task that runs only after all dependencies completed.
    pub fn spawn_after<F>(&self, deps: &[TaskHandle], task: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(TaskState {
            waiters: Mutex::new(TaskWaiters::default()),
        });
        self.begin_task();

        let graph = self.clone();
        let task_state = Arc::clone(&state);
        let job: Job = Box::new(move || {
            task();
            graph.finish_task(&task_state);
        });

        // One extra count guards against firing while dependencies are
        // still being registered.
        let deferred = Arc::new(DeferredTask {
            remaining: AtomicUsize::new(deps.len() + 1),
            job: Mutex::new(Some(job)),
        });
        for dep in deps {
            let mut waiters = dep.state.waiters.lock().expect("task state poisoned");
            if waiters.completed {
                drop(waiters);
                self.release_dependency(&deferred);
            } else {
                waiters.dependents.push(Arc::clone(&deferred));
            }
        }
        self.release_dependency(&deferred);

        TaskHandle { state }
    }

    /// Blocks the calling thread until every spawned task (including
    /// nested spawns) has completed. Only called from outside the pool.
    pub fn wait_all(&self) {
        let mut in_flight = self.inner.in_flight.lock().expect("graph state poisoned");
        while *in_flight > 0 {
            in_flight = self
                .inner
                .all_done
                .wait(in_flight)
                .expect("graph state poisoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn wait_all_sees_every_task() {
        let graph = ExecutionGraph::new(4).unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            graph.spawn(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        graph.wait_all();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn nested_spawns_complete_before_wait_all_returns() {
        let graph = ExecutionGraph::new(2).unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        let outer_counter = Arc::clone(&counter);
        let nested_graph = graph.clone();
        graph.spawn(move || {
            for _ in 0..10 {
                let counter = Arc::clone(&outer_counter);
                nested_graph.spawn(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
        });
        graph.wait_all();
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn spawn_after_orders_against_dependencies() {
        let graph = ExecutionGraph::new(4).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first_log = Arc::clone(&log);
        let first = graph.spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            first_log.lock().unwrap().push("sample");
        });
        let second_log = Arc::clone(&log);
        let second = graph.spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            second_log.lock().unwrap().push("sample");
        });
        let store_log = Arc::clone(&log);
        graph.spawn_after(&[first, second], move || {
            store_log.lock().unwrap().push("store");
        });

        graph.wait_all();
        let log = log.lock().unwrap();
        assert_eq!(log.as_slice(), &["sample", "sample", "store"]);
    }

    #[test]
    fn spawn_after_completed_dependency_runs_immediately() {
        let graph = ExecutionGraph::new(2).unwrap();
        let dep = graph.spawn(|| {});
        graph.wait_all();

        let ran = Arc::new(AtomicU64::new(0));
        let ran_clone = Arc::clone(&ran);
        graph.spawn_after(&[dep], move || {
            ran_clone.fetch_add(1, Ordering::Relaxed);
        });
        graph.wait_all();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }
}
