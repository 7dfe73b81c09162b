//! Sampling code. This module contains the [`Sampler`] struct.

use crate::{MetricsSource, Observation, StopSignal, TaskRegistry, obs::Reading};
use std::{sync::Arc, time::Duration};
use tokio::{spawn, sync::mpsc::UnboundedSender, time::MissedTickBehavior};
use tracing::{debug, info, info_span, instrument, trace, warn};

/// What the sampler did, handed back to the coordinator when it exits.
#[derive(Debug, Default)]
pub struct SamplerState {
    /// Sampling ticks completed, breaching or not.
    pub event_counter: u64,
    /// Ticks that breached the threshold.
    pub alerts_raised: u64,
    /// Observations accepted by the log queue.
    pub log_enqueued: u64,
    /// Observations accepted by the telemetry queue.
    pub telemetry_enqueued: u64,
    /// The most recent breaching observation.
    pub last_alert: Option<Arc<Observation>>,
}

/// The sampler's final state, plus its metrics source so the caller can
/// release it.
pub struct SamplerOutcome<M> {
    /// Counters and the last alert.
    pub state: SamplerState,
    /// The source the sampler read from.
    pub source: M,
}

/// Fixed-cadence producer. Samples the [`MetricsSource`] `quota` times and
/// fans every breaching observation out to the log and telemetry queues.
pub struct Sampler<M> {
    source: M,
    registry: TaskRegistry,
    host: Arc<str>,

    gpu_threshold: f32,
    quota: u64,
    interval: Duration,
    stop: StopSignal,

    log_tx: UnboundedSender<Arc<Observation>>,
    telemetry_tx: UnboundedSender<Arc<Observation>>,

    state: SamplerState,
}

impl<M: MetricsSource> Sampler<M> {
    /// Create a new sampler.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: M,
        registry: TaskRegistry,
        host: Arc<str>,
        gpu_threshold: f32,
        quota: u64,
        interval: Duration,
        stop: StopSignal,
        log_tx: UnboundedSender<Arc<Observation>>,
        telemetry_tx: UnboundedSender<Arc<Observation>>,
    ) -> Self {
        Self {
            source,
            registry,
            host,
            gpu_threshold,
            quota,
            interval,
            stop,
            log_tx,
            telemetry_tx,
            state: SamplerState::default(),
        }
    }

    /// Read the sensors once. A failed read becomes `0.0`.
    #[instrument(skip(self), name = "Taking reading")]
    fn take_reading(&mut self) -> Reading {
        let gpu_temperature = self.source.gpu_temperature().unwrap_or_else(|err| {
            warn!(%err, "GPU temperature read failed, using 0.0");
            0.0
        });
        let memory_percent = self.source.memory_percent().unwrap_or_else(|err| {
            warn!(%err, "Memory read failed, using 0.0");
            0.0
        });
        trace!(gpu_temperature, memory_percent, "Read sensors");
        Reading {
            gpu_temperature,
            memory_percent,
        }
    }

    /// Build an observation for a breaching reading and enqueue it on both
    /// sinks.
    fn dispatch(&mut self, reading: Reading, span: tracing::Span) {
        let tasks = self.registry.snapshot();
        let obs = Arc::new(Observation::new(reading, tasks, self.host.clone(), span));
        self.state.alerts_raised += 1;
        crate::metrics::record_alert(&reading);

        obs.in_scope(|_| {
            info!(
                gpu_temperature = reading.gpu_temperature,
                threshold = self.gpu_threshold,
                "GPU alert recorded"
            );

            if self.log_tx.send(obs.clone()).is_ok() {
                self.state.log_enqueued += 1;
            } else {
                warn!("Log sink gone, observation not logged");
            }

            if self.telemetry_tx.send(obs.clone()).is_ok() {
                self.state.telemetry_enqueued += 1;
            } else {
                warn!("Telemetry sink gone, observation not forwarded");
            }
        });

        self.state.last_alert = Some(obs);
    }

    /// Spawn the sampler in a new task. This is the core producer loop.
    ///
    /// The task resolves once the quota is reached or the stop signal is
    /// raised. Both queue senders are dropped when it does, which is what
    /// lets the sinks drain and finish.
    pub fn spawn(mut self) -> tokio::task::JoinHandle<SamplerOutcome<M>> {
        spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while self.state.event_counter < self.quota {
                tokio::select! {
                    biased;
                    _ = self.stop.stopped() => {
                        debug!(events = self.state.event_counter, "Stop raised, sampler exiting early");
                        break;
                    }
                    _ = interval.tick() => {}
                }

                let span = info_span!("Observation", observation_id = self.state.event_counter);
                let reading = span.in_scope(|| self.take_reading());

                if reading.gpu_temperature > self.gpu_threshold {
                    self.dispatch(reading, span);
                }

                self.state.event_counter += 1;
                crate::metrics::record_sample();
            }

            debug!(
                events = self.state.event_counter,
                alerts = self.state.alerts_raised,
                "Sampler finished"
            );

            let Sampler { source, state, .. } = self;
            SamplerOutcome { state, source }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SensorError;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    struct Scripted {
        temps: VecDeque<Result<f32, SensorError>>,
    }

    impl Scripted {
        fn new(temps: impl IntoIterator<Item = f32>) -> Self {
            Self {
                temps: temps.into_iter().map(Ok).collect(),
            }
        }

        fn idle() -> Self {
            Self {
                temps: VecDeque::new(),
            }
        }
    }

    impl MetricsSource for Scripted {
        fn gpu_temperature(&mut self) -> Result<f32, SensorError> {
            self.temps.pop_front().unwrap_or(Ok(0.0))
        }

        fn memory_percent(&mut self) -> Result<f32, SensorError> {
            Ok(33.0)
        }
    }

    fn sampler(
        source: Scripted,
        quota: u64,
        stop: StopSignal,
    ) -> (
        Sampler<Scripted>,
        mpsc::UnboundedReceiver<Arc<Observation>>,
        mpsc::UnboundedReceiver<Arc<Observation>>,
    ) {
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (tel_tx, tel_rx) = mpsc::unbounded_channel();
        let sampler = Sampler::new(
            source,
            TaskRegistry::new(),
            Arc::from("127.0.0.1"),
            20.0,
            quota,
            Duration::from_secs(1),
            stop,
            log_tx,
            tel_tx,
        );
        (sampler, log_rx, tel_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn only_breaches_are_dispatched() {
        let (s, mut log_rx, mut tel_rx) =
            sampler(Scripted::new([15.0, 25.0, 30.0]), 3, StopSignal::new());
        let outcome = s.spawn().await.unwrap();

        assert_eq!(outcome.state.event_counter, 3);
        assert_eq!(outcome.state.alerts_raised, 2);
        assert_eq!(outcome.state.log_enqueued, 2);
        assert_eq!(outcome.state.telemetry_enqueued, 2);
        let last = outcome.state.last_alert.unwrap();
        assert_eq!(last.gpu_temperature(), 30.0);

        let mut logged = Vec::new();
        while let Some(o) = log_rx.recv().await {
            logged.push(o.gpu_temperature());
        }
        assert_eq!(logged, [25.0, 30.0]);

        let first = tel_rx.recv().await.unwrap();
        let second = tel_rx.recv().await.unwrap();
        assert!(tel_rx.recv().await.is_none());
        assert_eq!(first.gpu_temperature(), 25.0);
        // Both queues see the same observation, not a copy.
        assert!(Arc::ptr_eq(&second, &last));
    }

    #[test]
    fn each_dispatch_counts_one_alert() {
        let (mut s, _log, _tel) = sampler(Scripted::idle(), 1, StopSignal::new());
        let reading = Reading {
            gpu_temperature: 45.0,
            memory_percent: 33.0,
        };

        let log = crate::metrics::testing::NameLog::default();
        metrics::with_local_recorder(&log, || {
            s.dispatch(reading, tracing::Span::none());
            s.dispatch(reading, tracing::Span::none());
        });

        assert_eq!(log.counted(crate::metrics::ALERTS_RAISED), 2);
        assert_eq!(s.state.alerts_raised, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_is_strict() {
        let (s, _log, _tel) = sampler(Scripted::new([20.0]), 1, StopSignal::new());
        let outcome = s.spawn().await.unwrap();
        assert_eq!(outcome.state.alerts_raised, 0);
        assert!(outcome.state.last_alert.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reads_become_zero_and_loop_continues() {
        let source = Scripted {
            temps: VecDeque::from([
                Err(SensorError::Unavailable {
                    sensor: "gpu_temperature",
                    reason: "driver hiccup".into(),
                }),
                Ok(50.0),
            ]),
        };
        let (s, _log, _tel) = sampler(source, 2, StopSignal::new());
        let outcome = s.spawn().await.unwrap();
        assert_eq!(outcome.state.event_counter, 2);
        assert_eq!(outcome.state.alerts_raised, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn samples_on_a_fixed_cadence() {
        let start = tokio::time::Instant::now();
        let (s, _log, _tel) = sampler(Scripted::idle(), 4, StopSignal::new());
        s.spawn().await.unwrap();
        // First tick is immediate, the next three wait one interval each.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_the_wait() {
        let stop = StopSignal::new();
        let (s, _log, _tel) = sampler(Scripted::idle(), 1_000, stop.clone());
        let jh = s.spawn();

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        stop.stop();
        let outcome = jh.await.unwrap();
        assert_eq!(outcome.state.event_counter, 3);
    }
}
