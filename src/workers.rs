//! Idle worker tasks, the registry that exposes their names, and the shared
//! [`StopSignal`].

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{sync::watch, task::JoinSet};
use tracing::{Instrument, debug, info_span, trace, warn};

/// Cooperative stop flag shared by the sampler and the worker pool.
///
/// Clones observe the same flag. Once raised it stays raised.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Create a new, lowered signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has been raised.
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal is raised. Resolves immediately if it already
    /// is.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Names of the worker tasks that are currently alive, by worker index.
///
/// Workers add themselves when they start and remove themselves when they
/// exit. The sampler only ever takes snapshots.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    names: Arc<Mutex<BTreeMap<usize, String>>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the live tasks, ordered by worker index.
    pub fn snapshot(&self) -> Vec<String> {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn register(&self, index: usize, name: String) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, name);
    }

    fn deregister(&self, index: usize) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&index);
    }
}

/// A fixed group of idle background tasks.
///
/// They do no real work. They exist so that every observation has a
/// non-trivial "active tasks" field. Each worker wakes on its own staggered
/// interval until the [`StopSignal`] is raised.
pub struct WorkerPool {
    tasks: JoinSet<()>,
    registry: TaskRegistry,
}

impl WorkerPool {
    /// Spawn `count` workers named `Worker-1` to `Worker-{count}`.
    ///
    /// Names are registered before this returns, so the first sample already
    /// sees every worker.
    pub fn spawn(count: usize, stop: &StopSignal) -> Self {
        let registry = TaskRegistry::new();
        let mut tasks = JoinSet::new();

        for index in 1..=count {
            let name = format!("Worker-{index}");
            let interval = worker_interval(index);
            registry.register(index, name.clone());

            let span = info_span!("Worker", name = %name);
            let stop = stop.clone();
            let registry = registry.clone();
            tasks.spawn(
                async move {
                    debug!(?interval, "Worker started");
                    loop {
                        tokio::select! {
                            _ = stop.stopped() => break,
                            _ = tokio::time::sleep(interval) => trace!("Worker idle tick"),
                        }
                    }
                    registry.deregister(index);
                    debug!("Worker stopped");
                }
                .instrument(span),
            );
        }

        Self { tasks, registry }
    }

    /// Handle to the names of the live workers.
    pub fn registry(&self) -> TaskRegistry {
        self.registry.clone()
    }

    /// Wait for every worker to exit. The stop signal must have been raised,
    /// otherwise this waits forever.
    pub async fn join(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(err) = res {
                warn!(%err, "Worker task failed");
            }
        }
    }
}

/// Worker `index` (1-based) idles for `0.6 + 0.2 * index` seconds per tick.
fn worker_interval(index: usize) -> Duration {
    Duration::from_millis(600 + 200 * index as u64)
}
