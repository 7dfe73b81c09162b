//! Metrics collection and exporting. Check the docs for our [`init_metrics`].

use crate::obs::Reading;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::LazyLock;

const SAMPLES_TAKEN: &str = "gpu_monitor.samples_taken";
const SAMPLES_TAKEN_DESC: &str = "The total number of sampling ticks completed";

pub(crate) const ALERTS_RAISED: &str = "gpu_monitor.alerts_raised";
const ALERTS_RAISED_DESC: &str = "The number of samples that breached the GPU threshold";

pub(crate) const OBSERVATIONS_LIVE: &str = "gpu_monitor.observations_live";
const OBSERVATIONS_LIVE_DESC: &str = "The number of observations currently held in memory";

const GPU_TEMPERATURE_HISTOGRAM: &str = "gpu_monitor.gpu_temperature_celsius";
const GPU_TEMPERATURE_HISTOGRAM_DESC: &str = "GPU temperature of breaching samples";

const MEMORY_PERCENT_HISTOGRAM: &str = "gpu_monitor.memory_percent";
const MEMORY_PERCENT_HISTOGRAM_DESC: &str = "Memory utilization of breaching samples";

const SINK_FAILURES: &str = "gpu_monitor.sink_failures";
const SINK_FAILURES_DESC: &str = "Observations a sink failed to persist or forward";

const LOG_ENTRIES_RETAINED: &str = "gpu_monitor.log_entries_retained";
const LOG_ENTRIES_RETAINED_DESC: &str = "Entries currently held in the bounded alert log";

static DESCRIBE: LazyLock<()> = LazyLock::new(|| {
    metrics::describe_counter!(SAMPLES_TAKEN, SAMPLES_TAKEN_DESC);
    metrics::describe_counter!(ALERTS_RAISED, ALERTS_RAISED_DESC);
    metrics::describe_gauge!(OBSERVATIONS_LIVE, OBSERVATIONS_LIVE_DESC);
    metrics::describe_histogram!(GPU_TEMPERATURE_HISTOGRAM, GPU_TEMPERATURE_HISTOGRAM_DESC);
    metrics::describe_histogram!(
        MEMORY_PERCENT_HISTOGRAM,
        metrics::Unit::Percent,
        MEMORY_PERCENT_HISTOGRAM_DESC
    );
    metrics::describe_counter!(SINK_FAILURES, SINK_FAILURES_DESC);
    metrics::describe_gauge!(LOG_ENTRIES_RETAINED, LOG_ENTRIES_RETAINED_DESC);
});

pub(crate) fn record_sample() {
    counter!(SAMPLES_TAKEN).increment(1);
}

pub(crate) fn record_alert(reading: &Reading) {
    counter!(ALERTS_RAISED).increment(1);

    histogram!(GPU_TEMPERATURE_HISTOGRAM).record(reading.gpu_temperature as f64);
    histogram!(MEMORY_PERCENT_HISTOGRAM).record(reading.memory_percent as f64);
}

pub(crate) fn record_observation() {
    gauge!(OBSERVATIONS_LIVE).increment(1);
}

pub(crate) fn record_sink_failure(sink: &'static str) {
    counter!(SINK_FAILURES, "sink" => sink).increment(1);
}

pub(crate) fn record_log_len(len: usize) {
    gauge!(LOG_ENTRIES_RETAINED).set(len as f64);
}

/// Initialize a prometheus metrics exporter on the given port, or 9000 if
/// `None`. Returns the port the exporter listens on.
///
/// The library records through the [`metrics`] facade only. Nothing is
/// exported unless the binary installs a recorder, which is what this does.
///
/// ## Metrics in this program
///
/// - `gpu_monitor.samples_taken` (counter): sampling ticks completed,
///   breaching or not.
/// - `gpu_monitor.alerts_raised` (counter): samples over the GPU threshold.
/// - `gpu_monitor.observations_live` (gauge): observations still referenced
///   by a queue, a sink, or the sampler's last-alert slot.
/// - `gpu_monitor.gpu_temperature_celsius` and `gpu_monitor.memory_percent`
///   (histograms): readings of breaching samples.
/// - `gpu_monitor.sink_failures` (counter, labeled by `sink`): observations
///   that were dropped by the log file, time-series, or notifier path.
/// - `gpu_monitor.log_entries_retained` (gauge): size of the bounded log.
///
/// With the exporter running you can scrape it directly:
/// ```sh
/// curl http://localhost:9000/
/// ```
pub fn init_metrics(port: Option<u16>) -> eyre::Result<u16> {
    LazyLock::force(&DESCRIBE);
    let port = port.unwrap_or(9000);
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()?;
    Ok(port)
}

#[cfg(test)]
pub(crate) mod testing {
    use metrics::{
        Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
    };
    use std::sync::Mutex;

    /// Recorder that logs the names of registered counters and gauges, for
    /// use with [`metrics::with_local_recorder`].
    #[derive(Debug, Default)]
    pub(crate) struct NameLog {
        counters: Mutex<Vec<String>>,
        gauges: Mutex<Vec<String>>,
    }

    impl NameLog {
        pub(crate) fn counted(&self, name: &str) -> usize {
            self.counters.lock().unwrap().iter().filter(|n| *n == name).count()
        }

        pub(crate) fn gauged(&self, name: &str) -> usize {
            self.gauges.lock().unwrap().iter().filter(|n| *n == name).count()
        }
    }

    impl Recorder for NameLog {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            self.counters.lock().unwrap().push(key.name().to_owned());
            Counter::noop()
        }

        fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
            self.gauges.lock().unwrap().push(key.name().to_owned());
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }
}
