//! The [`Monitor`]: wires the sampler, sinks and workers together and runs
//! the drain-complete shutdown.

use crate::{
    BoundedLogBuffer, ConfigError, LogSink, LogSinkStats, MetricsSource, MonitorConfig, Notifier,
    Observation, Sampler, StopSignal, TelemetrySink, TelemetryStats, TimeSeriesStore, WorkerPool,
};
use eyre::WrapErr;
use std::{path::PathBuf, sync::Arc};
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, info, info_span, warn};

/// Lifecycle of a run. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Sampling.
    Running,
    /// The sampler is done. Sinks are draining.
    StopRequested,
    /// Both queues are empty and both sinks have exited.
    Drained,
    /// The final notification step has run (whether or not it succeeded).
    Notified,
    /// Workers joined, sensors released. Nothing else happens.
    Terminated,
}

/// Summary of a completed run.
#[derive(Debug)]
pub struct RunReport {
    /// Samples taken.
    pub events_processed: u64,
    /// Samples over the threshold.
    pub alerts_raised: u64,
    /// Observations enqueued to the log sink.
    pub log_enqueued: u64,
    /// Observations enqueued to the telemetry sink.
    pub telemetry_enqueued: u64,
    /// Log sink totals.
    pub log: LogSinkStats,
    /// Telemetry sink totals.
    pub telemetry: TelemetryStats,
    /// The alert log as it stood at the end of the run.
    pub log_entries: BoundedLogBuffer,
    /// Where the alert log was written.
    pub log_file: PathBuf,
    /// The observation the final notification was about.
    pub last_alert: Option<Arc<Observation>>,
    /// Whether the final notification was delivered.
    pub notification_sent: bool,
}

/// Observe or cut short a running [`Monitor`].
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    stop: StopSignal,
    phase: watch::Receiver<Phase>,
}

impl MonitorHandle {
    /// Ask the sampler to stop before its quota. The shutdown sequence still
    /// drains both sinks and sends the final notification.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// The current phase.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Wait until the run has reached `phase` (or a later one). Returns the
    /// phase actually observed.
    pub async fn reached(&mut self, phase: Phase) -> Phase {
        let seen = self.phase.wait_for(|p| *p >= phase).await.map(|p| *p);
        match seen {
            Ok(p) => p,
            // Monitor dropped: report the last phase seen.
            Err(_) => *self.phase.borrow(),
        }
    }
}

/// One monitor run.
///
/// Built once per process, owns every piece of shared state. [`Monitor::run`]
/// consumes it.
pub struct Monitor<M, S, N> {
    config: MonitorConfig,
    source: M,
    store: Arc<S>,
    notifier: N,
    host: Arc<str>,
    stop: StopSignal,
    phase: watch::Sender<Phase>,
}

impl<M, S, N> Monitor<M, S, N>
where
    M: MetricsSource,
    S: TimeSeriesStore,
    N: Notifier,
{
    /// Create a monitor. Fails if the config does not validate or the log
    /// directory cannot be created, in which case nothing has been started.
    pub fn new(
        config: MonitorConfig,
        source: M,
        store: S,
        notifier: N,
        host: impl Into<Arc<str>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        config.prepare_log_path()?;
        let (phase, _) = watch::channel(Phase::Running);
        Ok(Self {
            config,
            source,
            store: Arc::new(store),
            notifier,
            host: host.into(),
            stop: StopSignal::new(),
            phase,
        })
    }

    /// A handle for observing the run.
    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            stop: self.stop.clone(),
            phase: self.phase.subscribe(),
        }
    }

    /// The time-series store, e.g. to query it after the run.
    pub fn store(&self) -> Arc<S> {
        self.store.clone()
    }

    /// Run to completion: sample until the quota is reached, drain both
    /// sinks, send the final notification, then tear down.
    ///
    /// Only a panicked task makes this return an error. Sensor, sink and
    /// notification failures are logged and the run carries on.
    pub async fn run(self) -> eyre::Result<RunReport> {
        let span = info_span!(
            "Monitor run",
            host = %self.host,
            quota = self.config.run_events,
            threshold = self.config.gpu_threshold
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> eyre::Result<RunReport> {
        let Self {
            config,
            source,
            store,
            notifier,
            host,
            stop,
            phase,
        } = self;

        let workers = WorkerPool::spawn(config.worker_count, &stop);

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();

        let log_sink = LogSink::new(log_rx, &config.log_file, config.max_log_entries);
        let log_buffer = log_sink.buffer();
        let log_jh = log_sink.spawn();
        let telemetry_jh = TelemetrySink::new(telemetry_rx, store.clone()).spawn();

        let sampler_jh = Sampler::new(
            source,
            workers.registry(),
            host,
            config.gpu_threshold,
            config.run_events,
            config.sample_interval,
            stop.clone(),
            log_tx,
            telemetry_tx,
        )
        .spawn();
        enter(&phase, Phase::Running);

        // The sampler resolving is the completion signal. Its queue senders
        // are gone once it has.
        let outcome = sampler_jh.await.wrap_err("sampler task panicked")?;
        stop.stop();
        enter(&phase, Phase::StopRequested);
        info!(
            events = outcome.state.event_counter,
            alerts = outcome.state.alerts_raised,
            "Sampling finished, draining sinks"
        );

        let log_stats = log_jh.await.wrap_err("log sink task panicked")?;
        let telemetry_stats = telemetry_jh
            .await
            .wrap_err("telemetry sink task panicked")?;
        enter(&phase, Phase::Drained);

        let last_alert = outcome.state.last_alert;
        let notification_sent = match &last_alert {
            Some(obs) => final_notification(&*store, &notifier, obs).await,
            None => {
                info!("No alerts raised, no final notification");
                false
            }
        };
        enter(&phase, Phase::Notified);

        workers.join().await;
        let mut source = outcome.source;
        source.release();
        enter(&phase, Phase::Terminated);

        let log_entries = log_buffer.snapshot();
        info!(
            events = outcome.state.event_counter,
            retained = log_entries.len(),
            log_file = %config.log_file.display(),
            "Monitor terminated"
        );

        Ok(RunReport {
            events_processed: outcome.state.event_counter,
            alerts_raised: outcome.state.alerts_raised,
            log_enqueued: outcome.state.log_enqueued,
            telemetry_enqueued: outcome.state.telemetry_enqueued,
            log: log_stats,
            telemetry: telemetry_stats,
            log_entries,
            log_file: config.log_file,
            last_alert,
            notification_sent,
        })
    }
}

fn enter(tx: &watch::Sender<Phase>, phase: Phase) {
    tx.send_replace(phase);
    info!(?phase, "Monitor phase changed");
}

/// Re-submit the last alert to the store, then send it through the notifier.
/// Both sinks have drained by the time this runs.
async fn final_notification<S, N>(store: &S, notifier: &N, obs: &Observation) -> bool
where
    S: TimeSeriesStore,
    N: Notifier,
{
    // Already logged on failure.
    let _ = crate::telemetry::forward(store, obs).await;

    match notifier
        .send(obs.render())
        .instrument(obs.span().clone())
        .await
    {
        Ok(()) => {
            info!(parent: obs.span(), "Final notification sent");
            true
        }
        Err(err) => {
            crate::metrics::record_sink_failure("notifier");
            warn!(parent: obs.span(), %err, "Final notification not sent");
            false
        }
    }
}
