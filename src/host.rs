//! Host metadata: who we are, where we are, and whether the broadcaster runs.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::env::EnvSource;
use crate::models::{HostSnapshot, SessionInfo, UNKNOWN};
use crate::resolver::split_preview;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Process names of the broadcasting application across platforms.
pub const BROADCASTER_PROCESSES: &[&str] = &["obs64.exe", "obs32.exe", "obs.exe", "obs"];

/// Shared, atomically replaced host snapshot.
///
/// One refresh loop publishes; probe tasks and reporters only load.
#[derive(Clone, Default)]
pub struct HostState {
    inner: Arc<ArcSwap<HostSnapshot>>,
}

impl HostState {
    pub fn new(initial: HostSnapshot) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(initial)) }
    }

    pub fn load(&self) -> Arc<HostSnapshot> {
        self.inner.load_full()
    }

    pub fn publish(&self, snapshot: HostSnapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}

#[async_trait]
pub trait PresenceCheck: Send + Sync {
    async fn is_running(&self) -> bool;
}

/// Looks the broadcaster up in the process table.
#[derive(Debug, Clone)]
pub struct ProcessPresence {
    names: Vec<String>,
}

impl Default for ProcessPresence {
    fn default() -> Self {
        Self::new(BROADCASTER_PROCESSES.iter().copied())
    }
}

impl ProcessPresence {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self { names: names.into_iter().map(str::to_ascii_lowercase).collect() }
    }

    fn scan(names: &[String]) -> bool {
        let mut sys = System::new_with_specifics(
            RefreshKind::nothing().with_processes(ProcessRefreshKind::nothing()),
        );
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys.processes().values().any(|p| {
            let name = p.name().to_string_lossy().to_ascii_lowercase();
            names.iter().any(|n| *n == name)
        })
    }
}

#[async_trait]
impl PresenceCheck for ProcessPresence {
    async fn is_running(&self) -> bool {
        let names = self.names.clone();
        match tokio::task::spawn_blocking(move || Self::scan(&names)).await {
            Ok(running) => running,
            Err(e) => {
                warn!("Process scan failed: {}", e);
                false
            }
        }
    }
}

/// Reads the session descriptors the broadcaster publishes.
pub fn session_from_env(env: &dyn EnvSource) -> SessionInfo {
    let mut session = SessionInfo {
        icr_code: env.get_or("OBS_ICR_CODE", UNKNOWN),
        title: env.get_or("OBS_STREAM_TITLE", UNKNOWN),
        ..SessionInfo::default()
    };

    let preview = env.get("OBS_STREAM_PREVIEW").unwrap_or_default();
    for url in split_preview(&preview) {
        let lower = url.to_ascii_lowercase();
        if lower.contains("youtube") || lower.contains("youtu.be") {
            session.preview_youtube = url.to_string();
        } else if lower.contains("ostream") {
            session.preview_ostream = url.to_string();
        } else if session.preview_ostream == UNKNOWN {
            session.preview_ostream = url.to_string();
        } else if session.preview_youtube == UNKNOWN {
            session.preview_youtube = url.to_string();
        }
    }
    session
}

#[derive(Deserialize)]
struct PublicIp {
    ip: String,
}

#[derive(Deserialize)]
struct IspLookup {
    status: Option<String>,
    isp: Option<String>,
}

/// Gathers a fresh [`HostSnapshot`] from the network and environment.
pub struct HostInspector {
    http: reqwest::Client,
    public_ip_url: String,
    isp_lookup_url: String,
    env: Arc<dyn EnvSource>,
    presence: Arc<dyn PresenceCheck>,
}

impl HostInspector {
    pub fn new(
        http: reqwest::Client,
        public_ip_url: String,
        isp_lookup_url: String,
        env: Arc<dyn EnvSource>,
        presence: Arc<dyn PresenceCheck>,
    ) -> Self {
        Self { http, public_ip_url, isp_lookup_url, env, presence }
    }

    pub async fn inspect(&self) -> HostSnapshot {
        let local_ip = local_ip().await.unwrap_or_else(|| UNKNOWN.into());
        let public_ip = match self.public_ip().await {
            Ok(ip) => ip,
            Err(e) => {
                warn!("Public IP lookup failed: {}", e);
                UNKNOWN.into()
            }
        };
        let isp = if public_ip == UNKNOWN {
            UNKNOWN.into()
        } else {
            match self.isp(&public_ip).await {
                Ok(Some(isp)) => isp,
                Ok(None) => UNKNOWN.into(),
                Err(e) => {
                    warn!("ISP lookup failed: {}", e);
                    UNKNOWN.into()
                }
            }
        };

        HostSnapshot {
            local_ip,
            public_ip,
            isp,
            app_running: self.presence.is_running().await,
            session: session_from_env(self.env.as_ref()),
        }
    }

    async fn public_ip(&self) -> reqwest::Result<String> {
        let body: PublicIp = self
            .http
            .get(&self.public_ip_url)
            .timeout(LOOKUP_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.ip)
    }

    async fn isp(&self, public_ip: &str) -> reqwest::Result<Option<String>> {
        let url = format!("{}{}", self.isp_lookup_url, public_ip);
        let body: IspLookup = self
            .http
            .get(url)
            .timeout(LOOKUP_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(match body.status.as_deref() {
            Some("success") => body.isp.filter(|s| !s.is_empty()),
            _ => None,
        })
    }
}

/// Address of the interface that routes to the internet.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub async fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

pub(crate) fn log_snapshot(snapshot: &HostSnapshot) {
    info!(
        local_ip = %snapshot.local_ip,
        public_ip = %snapshot.public_ip,
        isp = %snapshot.isp,
        app_running = snapshot.app_running,
        "Client info detected"
    );
    info!(
        icr_code = %snapshot.session.icr_code,
        title = %snapshot.session.title,
        ostream = %snapshot.session.preview_ostream,
        youtube = %snapshot.session.preview_youtube,
        "Streaming session"
    );
}
