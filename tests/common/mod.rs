#![allow(dead_code)]

use gpu_alert_monitor::{
    DataPoint, MemoryStore, MetricsSource, MonitorConfig, NotifyError, Notifier, SensorError,
    SinkError, TimeSeriesStore,
};
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// Replays a fixed list of GPU temperatures, then reads 0.0.
pub struct ScriptedSource {
    temps: VecDeque<f32>,
    released: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub fn new(temps: impl IntoIterator<Item = f32>) -> Self {
        Self {
            temps: temps.into_iter().collect(),
            released: Arc::default(),
        }
    }

    /// Flag set once the monitor releases the source.
    pub fn released_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }
}

impl MetricsSource for ScriptedSource {
    fn gpu_temperature(&mut self) -> Result<f32, SensorError> {
        Ok(self.temps.pop_front().unwrap_or(0.0))
    }

    fn memory_percent(&mut self) -> Result<f32, SensorError> {
        Ok(42.0)
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// A source whose every read fails.
pub struct BrokenSource;

impl MetricsSource for BrokenSource {
    fn gpu_temperature(&mut self) -> Result<f32, SensorError> {
        Err(SensorError::Unavailable {
            sensor: "gpu_temperature",
            reason: "no driver".into(),
        })
    }

    fn memory_percent(&mut self) -> Result<f32, SensorError> {
        Err(SensorError::Unavailable {
            sensor: "memory_percent",
            reason: "no procfs".into(),
        })
    }
}

/// A store that rejects every write.
#[derive(Debug, Default)]
pub struct DownStore;

impl TimeSeriesStore for DownStore {
    async fn write(&self, _point: &DataPoint) -> Result<(), SinkError> {
        Err(SinkError::Status {
            status: 503,
            body: "down".into(),
        })
    }

    async fn entries(&self) -> Result<Vec<String>, SinkError> {
        Ok(Vec::new())
    }
}

/// What the world looked like when a notification was sent.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: String,
    pub store_entries: Vec<String>,
    pub log_contents: Option<String>,
}

/// Records every message, along with the store and log file contents at
/// the time of sending.
#[derive(Clone)]
pub struct RecordingNotifier {
    store: MemoryStore,
    log_file: PathBuf,
    pub deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl RecordingNotifier {
    pub fn new(store: MemoryStore, log_file: &Path) -> Self {
        Self {
            store,
            log_file: log_file.to_owned(),
            deliveries: Arc::default(),
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        let delivery = Delivery {
            message: message.to_owned(),
            store_entries: self.store.points().into_iter().map(|p| p.entry).collect(),
            log_contents: std::fs::read_to_string(&self.log_file).ok(),
        };
        self.deliveries.lock().unwrap().push(delivery);
        Ok(())
    }
}

/// A fast config writing into `dir`.
pub fn config(dir: &Path, threshold: f32, run_events: u64, max_log_entries: usize) -> MonitorConfig {
    MonitorConfig {
        gpu_threshold: threshold,
        run_events,
        sample_interval: Duration::from_secs(1),
        max_log_entries,
        log_file: dir.join("logs").join("monitor.log"),
        worker_count: 3,
        ..Default::default()
    }
}
