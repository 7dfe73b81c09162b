use gpu_alert_monitor::{
    MonitorConfig, TimeSeriesStore, init_metrics, init_tracing, system_monitor,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Set up the tracing.
    let provider = init_tracing();

    let config = MonitorConfig::from_env()?;
    if let Some(port) = config.metrics_port {
        init_metrics(Some(port))?;
        info!(port, "Prometheus exporter listening");
    }

    let monitor = system_monitor(config)?;
    let store = monitor.store();

    let report = monitor.run().await?;

    match (&report.last_alert, report.notification_sent) {
        (Some(_), true) => println!("Last entry sent as notification."),
        (Some(_), false) => println!("Could not send the last entry as notification."),
        (None, _) => println!("No alerts were raised."),
    }
    println!(
        "\nProcessed {} events. The last {} entries are recorded in '{}'",
        report.events_processed,
        report.log_entries.len(),
        report.log_file.display()
    );

    // Print every reading of this session that reached the time-series store.
    match store.entries().await {
        Ok(entries) => {
            println!("\nAll readings of this session stored in the time-series store:");
            for entry in entries {
                println!("{entry}");
            }
        }
        Err(err) => warn!(%err, "Could not query the time-series store"),
    }

    // Ensure the provider has a chance to shut down cleanly.
    // This allows it a chance to flush any remaining spans to the collector.
    provider.shutdown().map_err(Into::into)
}
