//! GPU temperature alerting with a drain-complete shutdown.
//!
//! A single producer, the [`Sampler`], reads a [`MetricsSource`] at a fixed
//! interval. Whenever the GPU temperature is over the threshold it creates an
//! [`Observation`] and fans it out over two unbounded [`mpsc`] queues:
//!
//! - the [`LogSink`] keeps the most recent alerts in a [`BoundedLogBuffer`]
//!   and rewrites the log file after every one;
//! - the [`TelemetrySink`] forwards each alert to a [`TimeSeriesStore`].
//!
//! Each sink is its own task and drains at its own pace. The sampler never
//! waits on them.
//!
//! A [`WorkerPool`] of idle tasks runs alongside, so every observation
//! records which workers were alive when it was taken.
//!
//! The [`Monitor`] owns all of this for one run. When the sampler reaches its
//! quota, the monitor raises the [`StopSignal`] and waits for both queues to
//! drain. Then, exactly once, it sends the last alert through the
//! [`Notifier`] and tears everything down. See [`Phase`] for the sequence.
//!
//! Like any actor in this crate, an observation carries its own tracing span.
//! Everything done on its behalf, in either sink, is recorded inside that
//! span. [`init_tracing`] and [`init_metrics`] set up exporters for the
//! binary. Library code only talks to the `tracing` and `metrics` facades.
//!
//! [`mpsc`]: tokio::sync::mpsc

mod config;
pub use config::{InfluxConfig, MonitorConfig, TelegramConfig};

mod coordinator;
pub use coordinator::{Monitor, MonitorHandle, Phase, RunReport};

mod error;
pub use error::{ConfigError, NotifyError, SensorError, SinkError};

mod log_sink;
pub use log_sink::{BoundedLogBuffer, ENTRY_DELIMITER, LogBufferHandle, LogSink, LogSinkStats};

pub(crate) mod metrics;
pub use self::metrics::init_metrics;

mod monitor;
pub use monitor::{Sampler, SamplerOutcome, SamplerState};

mod notify;
pub use notify::{ConfiguredNotifier, DisabledNotifier, Notifier, TelegramNotifier};

mod obs;
pub use obs::{Observation, Reading};

mod source;
pub use source::{MetricsSource, SysinfoSource, resolve_host_identifier};

mod telemetry;
pub use telemetry::{
    ConfiguredStore, DataPoint, InfluxStore, MEASUREMENT, MemoryStore, TelemetrySink,
    TelemetryStats, TimeSeriesStore,
};

mod trace;
pub use trace::init_tracing;

mod workers;
pub use workers::{StopSignal, TaskRegistry, WorkerPool};

/// The monitor the binary runs: real sensors, and the store and notifier
/// selected by `config`.
pub type SystemMonitor = Monitor<SysinfoSource, ConfiguredStore, ConfiguredNotifier>;

/// Build a [`SystemMonitor`] from configuration.
///
/// Resolves the host identifier and prepares the log directory. Any error
/// here is fatal: nothing has been spawned yet.
pub fn system_monitor(config: MonitorConfig) -> eyre::Result<SystemMonitor> {
    let store = ConfiguredStore::from_config(config.influx.as_ref())?;
    let notifier = ConfiguredNotifier::from_config(config.telegram.as_ref())?;
    let host = resolve_host_identifier();
    tracing::info!(%host, store = store_kind(&store), "Monitor configured");
    Ok(Monitor::new(
        config,
        SysinfoSource::new(),
        store,
        notifier,
        host,
    )?)
}

fn store_kind(store: &ConfiguredStore) -> &'static str {
    match store {
        ConfiguredStore::Influx(_) => "influxdb",
        ConfiguredStore::Memory(_) => "memory",
    }
}
