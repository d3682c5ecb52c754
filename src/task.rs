//! Per-endpoint probe loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::StatusBoard;
use crate::host::HostState;
use crate::models::Endpoint;
use crate::probe::Prober;
use crate::reporting::ReportSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Running,
    StopRequested,
    Stopped,
}

/// Everything a probe loop needs, shared by all of them.
#[derive(Clone)]
pub struct ProbeContext {
    pub prober: Arc<dyn Prober>,
    pub sink: Arc<dyn ReportSink>,
    pub host: HostState,
    pub board: StatusBoard,
    pub ping_interval: Duration,
    /// Side-channel host report after this many probes.
    pub client_info_every: u64,
}

/// The measurement loop for one endpoint.
pub struct ProbeTask {
    endpoint: Endpoint,
    ctx: ProbeContext,
    token: CancellationToken,
    probes: Arc<AtomicU64>,
}

impl ProbeTask {
    /// Starts the loop on the runtime and returns its handle.
    pub fn spawn(endpoint: Endpoint, ctx: ProbeContext) -> ProbeHandle {
        let token = CancellationToken::new();
        let probes = Arc::new(AtomicU64::new(0));
        let task = ProbeTask {
            endpoint,
            ctx,
            token: token.clone(),
            probes: probes.clone(),
        };
        let join = tokio::spawn(task.run());
        ProbeHandle { token, probes, join }
    }

    async fn run(self) {
        let mut since_side_report = 0u64;
        while !self.token.is_cancelled() {
            let m = self.ctx.prober.probe(&self.endpoint).await;
            let host = self.ctx.host.load();
            self.ctx.sink.report_measurement(&self.endpoint, &m, &host).await;
            self.ctx.board.record(&self.endpoint, &m).await;
            self.probes.fetch_add(1, Ordering::Relaxed);

            since_side_report += 1;
            if since_side_report >= self.ctx.client_info_every {
                since_side_report = 0;
                self.ctx.sink.report_host_snapshot(&host).await;
            }

            debug!(endpoint = %self.endpoint, success = m.success, rtt_ms = m.rtt_ms, "probe");

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.ping_interval) => {}
                _ = self.token.cancelled() => break,
            }
        }
        info!(endpoint = %self.endpoint, "Probe loop exited");
    }
}

/// Owner's side of a running [`ProbeTask`].
pub struct ProbeHandle {
    token: CancellationToken,
    probes: Arc<AtomicU64>,
    join: JoinHandle<()>,
}

impl ProbeHandle {
    /// Asks the loop to stop after its in-flight probe.
    pub fn request_stop(&self) {
        self.token.cancel();
    }

    pub fn state(&self) -> ProbeState {
        if self.join.is_finished() {
            ProbeState::Stopped
        } else if self.token.is_cancelled() {
            ProbeState::StopRequested
        } else {
            ProbeState::Running
        }
    }

    /// Probes completed so far.
    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    /// Requests a stop and waits for the loop to exit.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}
