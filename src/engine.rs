use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::host::PresenceCheck;
use crate::models::Endpoint;
use crate::resolver::TargetSource;
use crate::task::{ProbeContext, ProbeHandle, ProbeTask};

/// Endpoints to start and stop for one reconciliation tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plan {
    pub to_start: BTreeSet<Endpoint>,
    pub to_stop: BTreeSet<Endpoint>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.to_start.is_empty() && self.to_stop.is_empty()
    }
}

/// Diffs the desired set against what is running.
pub fn plan<'a>(desired: &BTreeSet<Endpoint>, running: impl IntoIterator<Item = &'a Endpoint>) -> Plan {
    let running: BTreeSet<&Endpoint> = running.into_iter().collect();
    Plan {
        to_start: desired.iter().filter(|e| !running.contains(e)).cloned().collect(),
        to_stop: running.into_iter().filter(|e| !desired.contains(*e)).cloned().collect(),
    }
}

/// What a tick changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub started: BTreeSet<Endpoint>,
    pub stopped: BTreeSet<Endpoint>,
}

/// Reconciles the desired target set against running probe tasks.
///
/// Sole owner of the endpoint → task map; probe tasks never touch it.
pub struct TargetManager {
    source: Arc<dyn TargetSource>,
    presence: Arc<dyn PresenceCheck>,
    ctx: ProbeContext,
    poll_interval: Duration,
    running: HashMap<Endpoint, ProbeHandle>,
    last_desired: BTreeSet<Endpoint>,
    last_presence: Option<bool>,
}

impl TargetManager {
    pub fn new(
        source: Arc<dyn TargetSource>,
        presence: Arc<dyn PresenceCheck>,
        ctx: ProbeContext,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            presence,
            ctx,
            poll_interval,
            running: HashMap::new(),
            last_desired: BTreeSet::new(),
            last_presence: None,
        }
    }

    /// Endpoints with a live probe task.
    pub fn running(&self) -> BTreeSet<Endpoint> {
        self.running.keys().cloned().collect()
    }

    pub fn handle(&self, endpoint: &Endpoint) -> Option<&ProbeHandle> {
        self.running.get(endpoint)
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Target manager active, polling every {:?}", self.poll_interval);
        loop {
            if let Err(e) = self.tick().await {
                error!("Polling error: {:#}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        self.shutdown().await;
    }

    /// One reconciliation pass.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let app_running = self.presence.is_running().await;
        if self.last_presence != Some(app_running) {
            if app_running {
                info!("Broadcaster detected, monitoring its streaming servers");
            } else {
                info!("Broadcaster not running, no targets to monitor");
            }
            self.last_presence = Some(app_running);
        }

        let desired = self.source.desired(app_running).await?;
        if desired != self.last_desired {
            if desired.is_empty() {
                info!("Desired target set is now empty");
            } else {
                let list: Vec<&str> = desired.iter().map(Endpoint::as_str).collect();
                info!("Desired targets: {}", list.join(", "));
            }
        }

        let Plan { to_start, to_stop } = plan(&desired, self.running.keys());

        for endpoint in &to_start {
            let handle = ProbeTask::spawn(endpoint.clone(), self.ctx.clone());
            self.running.insert(endpoint.clone(), handle);
            info!(endpoint = %endpoint, "Started monitoring target");
        }

        for endpoint in &to_stop {
            match self.running.remove(endpoint) {
                Some(handle) => handle.request_stop(),
                None => warn!(endpoint = %endpoint, "Stop requested for unknown target"),
            }
            info!(endpoint = %endpoint, "Stopped monitoring target");
        }

        if !to_start.is_empty() || !to_stop.is_empty() {
            self.ctx.board.set_monitored(self.running()).await;
        }
        self.last_desired = desired;

        Ok(TickReport { started: to_start, stopped: to_stop })
    }

    /// Stops every probe task and waits for them to exit.
    pub async fn shutdown(&mut self) {
        let handles: Vec<ProbeHandle> = self.running.drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.request_stop();
        }
        for handle in handles {
            handle.stop().await;
        }
        self.ctx.board.set_monitored(BTreeSet::new()).await;
        info!("All probe tasks stopped");
    }
}
