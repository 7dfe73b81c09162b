//! Sensor access. The sampler only sees the [`MetricsSource`] trait;
//! [`SysinfoSource`] is the implementation used by the binary.

use crate::SensorError;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use sysinfo::{Components, MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, instrument};

/// Substrings (lowercase) of component labels that identify a GPU sensor.
const GPU_LABEL_MARKERS: &[&str] = &["gpu", "nvidia", "radeon", "nouveau"];

/// Instantaneous readings of the host.
///
/// Implementations are read-only from the sampler's point of view. A failed
/// read is reported as an error and the sampler substitutes `0.0`.
pub trait MetricsSource: Send + 'static {
    /// Current GPU temperature in °C. Hosts without a GPU sensor must return
    /// `Ok(0.0)`, not an error.
    fn gpu_temperature(&mut self) -> Result<f32, SensorError>;

    /// Used memory as a percentage of total memory, 0-100.
    fn memory_percent(&mut self) -> Result<f32, SensorError>;

    /// Release any sensor library resources. Called once, after the final
    /// notification.
    fn release(&mut self) {}
}

/// [`MetricsSource`] backed by the `sysinfo` crate.
pub struct SysinfoSource {
    system: System,
    components: Components,
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoSource {
    /// Create a source with the memory and component lists loaded.
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
        );
        let components = Components::new_with_refreshed_list();
        debug!(components = components.list().len(), "Loaded sensor components");
        Self { system, components }
    }
}

impl MetricsSource for SysinfoSource {
    #[instrument(skip(self), name = "Reading GPU temperature")]
    fn gpu_temperature(&mut self) -> Result<f32, SensorError> {
        self.components.refresh(false);

        let mut gpu_sensors = self
            .components
            .list()
            .iter()
            .filter(|c| {
                let label = c.label().to_lowercase();
                GPU_LABEL_MARKERS.iter().any(|marker| label.contains(marker))
            })
            .peekable();

        // No GPU on this host.
        if gpu_sensors.peek().is_none() {
            return Ok(0.0);
        }

        gpu_sensors
            .filter_map(|c| c.temperature())
            .filter(|t| t.is_finite())
            .reduce(f32::max)
            .ok_or_else(|| SensorError::Unavailable {
                sensor: "gpu_temperature",
                reason: "GPU sensor present but returned no temperature".into(),
            })
    }

    #[instrument(skip(self), name = "Reading memory")]
    fn memory_percent(&mut self) -> Result<f32, SensorError> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err(SensorError::Unavailable {
                sensor: "memory_percent",
                reason: "total memory reported as zero".into(),
            });
        }
        Ok((self.system.used_memory() as f64 / total as f64 * 100.0) as f32)
    }

    fn release(&mut self) {
        debug!("Releasing sensor handles");
    }
}

/// Resolve the address this host uses to reach the network.
///
/// A UDP socket is "connected" to a public address so the OS picks the
/// outbound interface. No packet is sent. Falls back to `127.0.0.1` when
/// there is no route.
pub fn resolve_host_identifier() -> String {
    outbound_ip()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .to_string()
}

fn outbound_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(("8.8.8.8", 80))?;
    Ok(socket.local_addr()?.ip())
}
