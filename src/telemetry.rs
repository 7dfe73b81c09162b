//! Forwarding observations to a time-series store.
//!
//! [`TelemetrySink`] is the consumer task. Stores implement
//! [`TimeSeriesStore`]: [`InfluxStore`] talks to an InfluxDB 3 server over
//! HTTP, and [`MemoryStore`] keeps points in process for runs without one.

use crate::{InfluxConfig, Observation, SinkError};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::{
    future::Future,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, instrument, warn};

/// Measurement every point is written under.
pub const MEASUREMENT: &str = "system_monitor";

/// One point as written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPoint {
    /// Measurement name.
    pub measurement: &'static str,
    /// Value of the `host` tag.
    pub host: String,
    /// Value of the `entry` field: the rendered observation.
    pub entry: String,
    /// Point time, at microsecond precision. Together with the measurement
    /// and host this is the point's key in the store.
    pub timestamp: DateTime<Utc>,
}

impl DataPoint {
    /// The point for an observation, stamped with the time it is written.
    ///
    /// The rendered entry only has second resolution, so several alerts can
    /// share a rendered time. A strictly increasing write time keeps each
    /// write a distinct point instead of overwriting the previous one.
    pub fn from_observation(obs: &Observation) -> Self {
        Self {
            measurement: MEASUREMENT,
            host: obs.host().to_owned(),
            entry: obs.render().to_owned(),
            timestamp: next_write_time(),
        }
    }

    /// Encode as InfluxDB line protocol, with microsecond precision.
    pub fn to_line_protocol(&self) -> String {
        format!(
            "{},host={} entry=\"{}\" {}",
            escape_key(self.measurement),
            escape_key(&self.host),
            escape_field(&self.entry),
            self.timestamp.timestamp_micros()
        )
    }
}

/// The current time in microseconds, moved past the previous stamp if the
/// clock has not advanced. Strictly increasing within the process.
fn next_write_time() -> DateTime<Utc> {
    static LAST_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

    let now = Utc::now();
    let micros = now.timestamp_micros();
    let stamp = match LAST_MICROS.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        Some(micros.max(last.saturating_add(1)))
    }) {
        Ok(last) | Err(last) => micros.max(last.saturating_add(1)),
    };
    DateTime::from_timestamp_micros(stamp).unwrap_or(now)
}

/// Measurement names and tag values: commas, equals signs and spaces are
/// backslash-escaped.
fn escape_key(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// String field values: quotes and backslashes are escaped, newlines become
/// `\n` so a point stays on one line.
///
/// The server only unescapes quotes and backslashes, so the newline escape
/// comes back as written. [`unescape_newlines`] undoes it on read.
fn escape_field(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Turn the `\n` escapes of a stored entry back into newlines.
fn unescape_newlines(stored: &str) -> String {
    stored.replace("\\n", "\n")
}

/// A time-series backend.
pub trait TimeSeriesStore: Send + Sync + 'static {
    /// Write a single point.
    fn write(&self, point: &DataPoint) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Every `entry` written to the measurement, oldest first.
    fn entries(&self) -> impl Future<Output = Result<Vec<String>, SinkError>> + Send;
}

/// In-process store. Points live as long as the store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    points: Arc<Mutex<Vec<DataPoint>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far, in write order.
    pub fn points(&self) -> Vec<DataPoint> {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TimeSeriesStore for MemoryStore {
    async fn write(&self, point: &DataPoint) -> Result<(), SinkError> {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(point.clone());
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<String>, SinkError> {
        let mut points = self.points();
        // Stable, so equal timestamps keep write order.
        points.sort_by_key(|p| p.timestamp);
        Ok(points.into_iter().map(|p| p.entry).collect())
    }
}

/// InfluxDB 3 store, using the HTTP write and SQL query APIs.
#[derive(Debug, Clone)]
pub struct InfluxStore {
    client: reqwest::Client,
    config: InfluxConfig,
}

#[derive(Debug, Deserialize)]
struct EntryRow {
    entry: String,
}

impl InfluxStore {
    /// Create a client for the configured server. No connection is made
    /// until the first write.
    pub fn new(config: InfluxConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("gpu-alert-monitor/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client, config })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SinkError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SinkError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl TimeSeriesStore for InfluxStore {
    #[instrument(skip_all, fields(db = %self.config.database), name = "Influx write")]
    async fn write(&self, point: &DataPoint) -> Result<(), SinkError> {
        let url = format!("{}/api/v3/write_lp", self.config.host);
        let req = self
            .client
            .post(url)
            .query(&[
                ("db", self.config.database.as_str()),
                ("precision", "microsecond"),
            ])
            .body(point.to_line_protocol());
        Self::check(self.authorize(req).send().await?).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(db = %self.config.database), name = "Influx query")]
    async fn entries(&self) -> Result<Vec<String>, SinkError> {
        let url = format!("{}/api/v3/query_sql", self.config.host);
        let body = serde_json::json!({
            "db": self.config.database,
            "q": format!("SELECT entry FROM {MEASUREMENT} ORDER BY time ASC"),
            "format": "json",
        });
        let req = self.client.post(url).json(&body);
        let resp = Self::check(self.authorize(req).send().await?).await?;
        let bytes = resp.bytes().await?;
        let rows: Vec<EntryRow> = serde_json::from_slice(&bytes)?;
        Ok(rows.iter().map(|r| unescape_newlines(&r.entry)).collect())
    }
}

/// The store selected by configuration: InfluxDB when a host is set,
/// otherwise memory.
#[derive(Debug, Clone)]
pub enum ConfiguredStore {
    /// Remote InfluxDB 3 server.
    Influx(InfluxStore),
    /// In-process fallback.
    Memory(MemoryStore),
}

impl ConfiguredStore {
    /// Pick a store for `config`.
    pub fn from_config(config: Option<&InfluxConfig>) -> Result<Self, SinkError> {
        Ok(match config {
            Some(config) => Self::Influx(InfluxStore::new(config.clone())?),
            None => Self::Memory(MemoryStore::new()),
        })
    }
}

impl TimeSeriesStore for ConfiguredStore {
    async fn write(&self, point: &DataPoint) -> Result<(), SinkError> {
        match self {
            Self::Influx(store) => store.write(point).await,
            Self::Memory(store) => store.write(point).await,
        }
    }

    async fn entries(&self) -> Result<Vec<String>, SinkError> {
        match self {
            Self::Influx(store) => store.entries().await,
            Self::Memory(store) => store.entries().await,
        }
    }
}

/// Totals reported by a telemetry sink when its queue is drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    /// Observations taken off the queue.
    pub consumed: u64,
    /// Observations the store accepted.
    pub written: u64,
    /// Observations dropped because the write failed.
    pub dropped: u64,
}

/// Consumer that forwards each observation to a [`TimeSeriesStore`].
///
/// Delivery is at most once: a failed write is logged and the observation is
/// dropped.
pub struct TelemetrySink<S> {
    inbound: mpsc::UnboundedReceiver<Arc<Observation>>,
    store: Arc<S>,
    stats: TelemetryStats,
}

impl<S: TimeSeriesStore> TelemetrySink<S> {
    /// Create a telemetry sink writing to `store`.
    pub fn new(inbound: mpsc::UnboundedReceiver<Arc<Observation>>, store: Arc<S>) -> Self {
        Self {
            inbound,
            store,
            stats: TelemetryStats::default(),
        }
    }

    async fn handle(&mut self, obs: &Observation) {
        self.stats.consumed += 1;
        match forward(&*self.store, obs).await {
            Ok(()) => self.stats.written += 1,
            Err(_) => self.stats.dropped += 1,
        }
    }

    /// Spawn the telemetry sink task. It runs until every sender is gone and
    /// the queue is empty, then resolves to its totals.
    pub fn spawn(mut self) -> tokio::task::JoinHandle<TelemetryStats> {
        tokio::spawn(async move {
            while let Some(obs) = self.inbound.recv().await {
                self.handle(&obs).await;
            }
            debug!(
                consumed = self.stats.consumed,
                written = self.stats.written,
                dropped = self.stats.dropped,
                "Telemetry queue drained"
            );
            self.stats
        })
    }
}

/// Write one observation to `store` inside the observation's span. Failures
/// are logged and counted here, then returned.
pub(crate) async fn forward<S: TimeSeriesStore>(
    store: &S,
    obs: &Observation,
) -> Result<(), SinkError> {
    let point = DataPoint::from_observation(obs);
    let res = store.write(&point).instrument(obs.span().clone()).await;
    match &res {
        Ok(()) => debug!(parent: obs.span(), "Observation forwarded to time-series store"),
        Err(err) => {
            crate::metrics::record_sink_failure("time_series");
            warn!(parent: obs.span(), %err, "Time-series write failed, observation dropped");
        }
    }
    res
}
