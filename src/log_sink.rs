//! The bounded on-disk alert log. [`LogSink`] is the consumer task;
//! [`BoundedLogBuffer`] is the ring it maintains.

use crate::{Observation, SinkError};
use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, warn};

/// Separator written between entries in the log file.
pub const ENTRY_DELIMITER: &str = "\n\n---\n\n";

/// The most recent rendered observations, oldest first.
///
/// Never holds more than its capacity. Pushing past capacity evicts from the
/// front, so the retained entries stay in chronological order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedLogBuffer {
    entries: VecDeque<String>,
    capacity: usize,
}

impl BoundedLogBuffer {
    /// Create an empty buffer. A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest entries beyond capacity.
    pub fn push(&mut self, entry: impl Into<String>) {
        self.entries.push_back(entry.into());
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of retained entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Retained entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// The most recent entry.
    pub fn last(&self) -> Option<&str> {
        self.entries.back().map(String::as_str)
    }

    /// The whole buffer in log file form. Deterministic for a given buffer.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push_str(ENTRY_DELIMITER);
            }
            out.push_str(entry);
        }
        out
    }

    /// Split log file contents back into entries.
    pub fn parse(contents: &str) -> Vec<&str> {
        if contents.is_empty() {
            return Vec::new();
        }
        contents.split(ENTRY_DELIMITER).collect()
    }
}

/// Shared, read-only view of the log sink's buffer.
#[derive(Debug, Clone)]
pub struct LogBufferHandle {
    inner: Arc<Mutex<BoundedLogBuffer>>,
}

impl LogBufferHandle {
    /// Copy of the buffer as it is right now.
    pub fn snapshot(&self) -> BoundedLogBuffer {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Totals reported by a log sink when its queue is drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogSinkStats {
    /// Observations taken off the queue.
    pub consumed: u64,
    /// File rewrites that failed.
    pub write_failures: u64,
    /// Entries retained at the end.
    pub retained: usize,
}

/// Consumer that keeps the last `capacity` alerts and mirrors them to a file.
pub struct LogSink {
    inbound: mpsc::UnboundedReceiver<Arc<Observation>>,
    buffer: Arc<Mutex<BoundedLogBuffer>>,
    path: PathBuf,
    stats: LogSinkStats,
}

impl LogSink {
    /// Create a log sink that writes to `path`.
    pub fn new(
        inbound: mpsc::UnboundedReceiver<Arc<Observation>>,
        path: impl Into<PathBuf>,
        capacity: usize,
    ) -> Self {
        Self {
            inbound,
            buffer: Arc::new(Mutex::new(BoundedLogBuffer::new(capacity))),
            path: path.into(),
            stats: LogSinkStats::default(),
        }
    }

    /// Read-only handle to the buffer, usable while the sink runs.
    pub fn buffer(&self) -> LogBufferHandle {
        LogBufferHandle {
            inner: self.buffer.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoundedLogBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one entry and produce the new file contents, under one lock.
    fn append(&self, entry: &str) -> (usize, String) {
        let mut buffer = self.lock();
        buffer.push(entry);
        (buffer.len(), buffer.serialize())
    }

    async fn write_file(&self, contents: String) -> Result<(), SinkError> {
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }

    /// Process one observation: append, evict, rewrite the file.
    async fn handle(&mut self, obs: &Observation) {
        self.stats.consumed += 1;
        let (len, contents) = obs.in_scope(|text| self.append(text));
        crate::metrics::record_log_len(len);

        let res = self
            .write_file(contents)
            .instrument(obs.span().clone())
            .await;
        match res {
            Ok(()) => debug!(
                parent: obs.span(),
                entries = len,
                path = %self.path.display(),
                "Log file rewritten"
            ),
            Err(err) => {
                self.stats.write_failures += 1;
                crate::metrics::record_sink_failure("log_file");
                warn!(parent: obs.span(), %err, "Could not write log file, entry kept in memory");
            }
        }
    }

    /// Spawn the log sink task. It runs until every sender is gone and the
    /// queue is empty, then resolves to its totals.
    pub fn spawn(mut self) -> tokio::task::JoinHandle<LogSinkStats> {
        tokio::spawn(async move {
            while let Some(obs) = self.inbound.recv().await {
                self.handle(&obs).await;
            }
            let retained = self.lock().len();
            self.stats.retained = retained;
            debug!(
                consumed = self.stats.consumed,
                retained = self.stats.retained,
                "Log queue drained"
            );
            self.stats
        })
    }
}
