//! Host utilisation via `sysinfo`.

use std::time::{Duration, Instant};
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, Networks, RefreshKind, System};

use crate::store::HostMetrics;

/// Keeps one `sysinfo::System` alive between ticks so CPU usage is measured
/// against the previous refresh.
pub struct HostMonitor {
    sys: System,
    disks: Disks,
    networks: Networks,
    networks_refreshed: Instant,
}

/// Receive and transmit rates over every interface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub rx_mbps: f64,
    pub tx_mbps: f64,
}

impl HostMonitor {
    pub fn new() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::new().with_cpu_usage())
                .with_memory(MemoryRefreshKind::new().with_ram()),
        );
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            networks_refreshed: Instant::now(),
        }
    }

    /// Traffic since the previous call, summed over all interfaces.
    ///
    /// `None` when no time has passed since the last refresh.
    pub fn throughput(&mut self) -> Option<Throughput> {
        self.networks.refresh();
        let now = Instant::now();
        let elapsed = now.duration_since(self.networks_refreshed);
        self.networks_refreshed = now;

        let (rx, tx) = self.networks.iter().fold((0u64, 0u64), |(rx, tx), (_, data)| {
            (rx.saturating_add(data.received()), tx.saturating_add(data.transmitted()))
        });

        Some(Throughput {
            rx_mbps: mbps(rx, elapsed)?,
            tx_mbps: mbps(tx, elapsed)?,
        })
    }

    /// Refresh CPU, memory and disks and return utilisation percentages.
    pub fn refresh(&mut self) -> HostMetrics {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        self.disks.refresh();
        if self.disks.list().is_empty() {
            self.disks.refresh_list();
        }

        let total_memory = self.sys.total_memory();
        let memory_percent = percent(self.sys.used_memory(), total_memory);

        let (used, total) = self.disks.list().iter().fold((0u64, 0u64), |(used, total), disk| {
            let size = disk.total_space();
            (
                used.saturating_add(size.saturating_sub(disk.available_space())),
                total.saturating_add(size),
            )
        });

        HostMetrics {
            cpu_percent: clamp_percent(self.sys.global_cpu_usage()),
            memory_percent,
            disk_percent: percent(used, total),
        }
    }
}

impl Default for HostMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes moved over `elapsed` as Mbit/s.
fn mbps(bytes: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return None;
    }
    Some(bytes as f64 * 8.0 / 1_000_000.0 / secs)
}

fn percent(part: u64, whole: u64) -> f32 {
    if whole == 0 {
        return 0.0;
    }
    clamp_percent((part as f64 / whole as f64 * 100.0) as f32)
}

fn clamp_percent(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 100.0)
    } else {
        0.0
    }
}
