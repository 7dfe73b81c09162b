//! The [`Observation`] struct and its rendered text form.

use chrono::{DateTime, Local, SubsecRound};
use metrics::gauge;
use std::sync::Arc;
use tracing::trace;

/// Timestamp format used in every rendered line.
const TIMESTAMP_FORMAT: &str = "%d %m %Y %H:%M:%S";

/// Raw sensor values taken in a single sampling tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// GPU temperature in °C. `0.0` means no GPU is available.
    pub gpu_temperature: f32,

    /// Used memory as a percentage of total memory.
    pub memory_percent: f32,
}

/// A breaching sample, together with the tracing span associated with it.
///
/// Observations are created by the sampler only when the GPU temperature is
/// over the threshold. Once created they never change. The sampler hands an
/// `Arc<Observation>` to each sink queue, so the log sink and the telemetry
/// sink read the same value concurrently.
///
/// As with any unit of work in this crate, the span is part of the data. It is
/// opened when the observation is taken and closes when the last reference is
/// dropped. Sinks should do their work inside it:
///
/// ```rust
/// use gpu_alert_monitor::Observation;
///
/// fn handle(obs: &Observation) {
///     obs.in_scope(|text| {
///         tracing::info!(len = text.len(), "handling observation");
///     });
/// }
/// ```
#[derive(Debug)]
pub struct Observation {
    timestamp: DateTime<Local>,
    reading: Reading,
    active_tasks: Vec<String>,
    host: Arc<str>,

    rendered: String,

    span: tracing::Span,
}

impl Observation {
    /// Create a new observation stamped with the current local time.
    pub fn new(
        reading: Reading,
        active_tasks: Vec<String>,
        host: Arc<str>,
        span: tracing::Span,
    ) -> Self {
        Self::at(Local::now(), reading, active_tasks, host, span)
    }

    /// Create a new observation with an explicit timestamp. Sub-second
    /// precision is discarded.
    pub fn at(
        timestamp: DateTime<Local>,
        reading: Reading,
        active_tasks: Vec<String>,
        host: Arc<str>,
        span: tracing::Span,
    ) -> Self {
        let timestamp = timestamp.trunc_subsecs(0);
        let rendered = render(&timestamp, &reading, &active_tasks, &host);
        crate::metrics::record_observation();
        Self {
            timestamp,
            reading,
            active_tasks,
            host,
            rendered,
            span,
        }
    }

    /// When the sample was taken, at second resolution.
    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// GPU temperature in °C.
    pub fn gpu_temperature(&self) -> f32 {
        self.reading.gpu_temperature
    }

    /// Memory utilization percentage.
    pub fn memory_percent(&self) -> f32 {
        self.reading.memory_percent
    }

    /// Names of the worker tasks alive when the sample was taken.
    pub fn active_tasks(&self) -> &[String] {
        &self.active_tasks
    }

    /// Identifier of the host that produced this observation.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The four-line text block written to the log file, the time-series
    /// store, and the final notification.
    pub fn render(&self) -> &str {
        &self.rendered
    }

    /// Run a function on the rendered text within this observation's span.
    pub fn in_scope<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        self.span.in_scope(|| f(&self.rendered))
    }

    /// Get the tracing span associated with this observation.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

fn render(
    timestamp: &DateTime<Local>,
    reading: &Reading,
    active_tasks: &[String],
    host: &str,
) -> String {
    let ts = timestamp.format(TIMESTAMP_FORMAT);
    [
        format!(
            "{ts} + GPU: {:.1} °C + IP: {host}",
            reading.gpu_temperature
        ),
        format!(
            "{ts} + Memory: {:.1}% + IP: {host}",
            reading.memory_percent
        ),
        format!("{ts} + Tasks: {}", active_tasks.join(", ")),
        String::new(),
    ]
    .join("\n")
}

impl Drop for Observation {
    fn drop(&mut self) {
        self.span.in_scope(|| {
            trace!("Dropping observation");
        });
        gauge!(crate::metrics::OBSERVATIONS_LIVE).decrement(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Observation {
        let ts = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        Observation::at(
            ts,
            Reading {
                gpu_temperature: 71.34,
                memory_percent: 43.06,
            },
            vec!["Worker-1".into(), "Worker-2".into()],
            Arc::from("10.0.0.7"),
            tracing::Span::none(),
        )
    }

    #[test]
    fn renders_four_line_block() {
        let obs = sample();
        let expected = "09 03 2024 14:05:07 + GPU: 71.3 °C + IP: 10.0.0.7\n\
                        09 03 2024 14:05:07 + Memory: 43.1% + IP: 10.0.0.7\n\
                        09 03 2024 14:05:07 + Tasks: Worker-1, Worker-2\n";
        assert_eq!(obs.render(), expected);
        assert_eq!(obs.render().split('\n').count(), 4);
    }

    #[test]
    fn timestamp_has_second_resolution() {
        let ts = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
            + chrono::Duration::milliseconds(870);
        let obs = Observation::at(
            ts,
            Reading {
                gpu_temperature: 0.0,
                memory_percent: 0.0,
            },
            vec![],
            Arc::from("127.0.0.1"),
            tracing::Span::none(),
        );
        assert_eq!(obs.timestamp().timestamp_subsec_nanos(), 0);
        assert!(obs.render().contains("+ Tasks: \n"));
    }

    #[test]
    fn building_an_observation_is_not_an_alert() {
        let log = crate::metrics::testing::NameLog::default();
        metrics::with_local_recorder(&log, || drop(sample()));

        assert_eq!(log.counted(crate::metrics::ALERTS_RAISED), 0);
        // Incremented on creation, decremented on drop.
        assert_eq!(log.gauged(crate::metrics::OBSERVATIONS_LIVE), 2);
    }
}
