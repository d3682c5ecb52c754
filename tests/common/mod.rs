#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stream_pulse::api::StatusBoard;
use stream_pulse::collector::RemoteTargets;
use stream_pulse::error::CollectorError;
use stream_pulse::host::{HostState, PresenceCheck};
use stream_pulse::probe::Prober;
use stream_pulse::reporting::ReportSink;
use stream_pulse::task::ProbeContext;
use stream_pulse::{Endpoint, HostSnapshot, Measurement};

/// Presence that tests can flip between ticks.
#[derive(Default)]
pub struct SwitchPresence(AtomicBool);

impl SwitchPresence {
    pub fn new(running: bool) -> Self {
        Self(AtomicBool::new(running))
    }

    pub fn set(&self, running: bool) {
        self.0.store(running, Ordering::SeqCst);
    }
}

#[async_trait]
impl PresenceCheck for SwitchPresence {
    async fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Remote list that either answers or fails like an unreachable collector.
#[derive(Default)]
pub struct ScriptedRemote {
    targets: Mutex<Option<Vec<String>>>,
    pub calls: AtomicUsize,
}

impl ScriptedRemote {
    pub fn answering(targets: &[&str]) -> Self {
        let remote = Self::default();
        remote.answer(targets);
        remote
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn answer(&self, targets: &[&str]) {
        *self.targets.lock().unwrap() = Some(targets.iter().map(|s| s.to_string()).collect());
    }

    pub fn fail(&self) {
        *self.targets.lock().unwrap() = None;
    }
}

#[async_trait]
impl RemoteTargets for ScriptedRemote {
    async fn fetch_targets(&self) -> Result<Vec<String>, CollectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.targets.lock().unwrap().clone() {
            Some(targets) => Ok(targets),
            None => Err(CollectorError::Status {
                path: "/get_targets",
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
            }),
        }
    }
}

pub struct FixedProber {
    pub delay: Duration,
}

#[async_trait]
impl Prober for FixedProber {
    async fn probe(&self, _endpoint: &Endpoint) -> Measurement {
        tokio::time::sleep(self.delay).await;
        Measurement::reply(7.0, "Reply from 10.0.0.1: bytes=32 time=7ms TTL=64")
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub measured: Mutex<Vec<Endpoint>>,
    pub snapshots: AtomicUsize,
}

impl RecordingSink {
    pub fn count_for(&self, endpoint: &str) -> usize {
        let endpoint = Endpoint::parse(endpoint).unwrap();
        self.measured.lock().unwrap().iter().filter(|e| **e == endpoint).count()
    }
}

#[async_trait]
impl ReportSink for RecordingSink {
    async fn report_measurement(&self, endpoint: &Endpoint, _m: &Measurement, _h: &HostSnapshot) {
        self.measured.lock().unwrap().push(endpoint.clone());
    }

    async fn report_host_snapshot(&self, _host: &HostSnapshot) {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn probe_context(prober: Arc<dyn Prober>, sink: Arc<dyn ReportSink>) -> ProbeContext {
    ProbeContext {
        prober,
        sink,
        host: HostState::default(),
        board: StatusBoard::default(),
        ping_interval: Duration::from_millis(5),
        client_info_every: 60,
    }
}

pub fn endpoints(items: &[&str]) -> std::collections::BTreeSet<Endpoint> {
    items.iter().filter_map(|s| Endpoint::parse(s)).collect()
}

/// Polls `cond` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
