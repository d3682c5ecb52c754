//! Periodic network throughput sampling.

use std::time::{Duration, Instant};
use sysinfo::Networks;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collector::CollectorClient;
use crate::host::HostState;
use crate::models::NetworkSpeedReport;

/// Bytes moved over `elapsed`, in megabits per second.
pub fn throughput_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    let mbps = bytes as f64 * 8.0 / secs / 1_000_000.0;
    (mbps * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy)]
struct Totals {
    received: u64,
    transmitted: u64,
    at: Instant,
}

/// Interface byte counters sampled across ticks.
pub struct SpeedSampler {
    networks: Networks,
    last: Option<Totals>,
}

impl Default for SpeedSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedSampler {
    pub fn new() -> Self {
        Self { networks: Networks::new_with_refreshed_list(), last: None }
    }

    fn totals(&mut self) -> Totals {
        self.networks.refresh(true);
        let (received, transmitted) = self
            .networks
            .list()
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (rx + data.total_received(), tx + data.total_transmitted())
            });
        Totals { received, transmitted, at: Instant::now() }
    }

    /// `(download_mbps, upload_mbps)` since the previous call; `None` on the first.
    pub fn sample(&mut self) -> Option<(f64, f64)> {
        let now = self.totals();
        let prev = self.last.replace(now)?;
        let elapsed = now.at.duration_since(prev.at);
        Some((
            throughput_mbps(now.received.saturating_sub(prev.received), elapsed),
            throughput_mbps(now.transmitted.saturating_sub(prev.transmitted), elapsed),
        ))
    }
}

pub async fn run_sampler(
    collector: CollectorClient,
    host: HostState,
    computer_name: String,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!("Network speed sampler active, every {:?}", interval);
    let mut sampler = SpeedSampler::new();
    sampler.sample();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => break,
        }
        let Some((download_mbps, upload_mbps)) = sampler.sample() else { continue };
        let snapshot = host.load();
        let report = NetworkSpeedReport {
            client_id: snapshot.local_ip.clone(),
            computer_name: computer_name.clone(),
            isp: snapshot.isp.clone(),
            download_mbps,
            upload_mbps,
            timestamp: chrono::Utc::now().timestamp(),
        };
        match collector.push_network_speed(&report).await {
            Ok(()) => info!(download_mbps, upload_mbps, "Network speed pushed"),
            Err(e) => warn!("Failed to push network speed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_bytes_to_megabits() {
        assert_eq!(throughput_mbps(1_250_000, Duration::from_secs(1)), 10.0);
        assert_eq!(throughput_mbps(7_500_000, Duration::from_secs(60)), 1.0);
    }

    #[test]
    fn zero_elapsed_is_zero() {
        assert_eq!(throughput_mbps(1_000, Duration::ZERO), 0.0);
    }

    #[test]
    fn first_sample_only_primes() {
        let mut sampler = SpeedSampler::new();
        assert!(sampler.sample().is_none());
        let (down, up) = sampler.sample().expect("second sample");
        assert!(down >= 0.0 && up >= 0.0);
    }
}
