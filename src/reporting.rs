//! Outbound reporting to the collector.
//!
//! Reports are fire-and-forget: a failed post is logged and dropped, the
//! next scheduled report supersedes it.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::collector::CollectorClient;
use crate::env::EnvSource;
use crate::host::{session_from_env, PresenceCheck};
use crate::models::{
    ClientInfoReport, Endpoint, HostSnapshot, Measurement, PingReport, SessionInfo, UNKNOWN,
};
use crate::probe::Prober;
use crate::resolver::local_targets;

/// Collector-side truncation limit for diagnostic text.
pub const RAW_LIMIT: usize = 2000;

/// Upper bound on resolving `target_ip` for one report.
pub const TARGET_LOOKUP_TIMEOUT: Duration = Duration::from_secs(1);

const NO_SERVER: &str = "none";

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn report_measurement(&self, endpoint: &Endpoint, measurement: &Measurement, host: &HostSnapshot);

    async fn report_host_snapshot(&self, host: &HostSnapshot);
}

/// Short ISP aliases used on dashboards.
const ISP_ALIASES: &[(&str, &str)] = &[
    ("Link3 Technologies Limited", "Link3"),
    ("Bangladesh Online Ltd", "BOL"),
    ("Cloud point", "SDNF"),
    ("Amber IT Limited", "AmberIT"),
    ("Mirnet", "BTS"),
    ("Mirnet Limited", "BTS"),
    ("BTS Communications (BD) Ltd", "BTS"),
    ("BTS Communications", "BTS"),
];

pub fn isp_display(isp: &str) -> String {
    let spaced = isp.replace('_', " ");
    ISP_ALIASES
        .iter()
        .find(|(name, _)| *name == spaced)
        .map(|(_, alias)| alias.to_string())
        .unwrap_or_else(|| isp.to_string())
}

pub fn target_display(target: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        return target.to_string();
    }
    let lower = target.to_ascii_lowercase();
    match lower.find(&suffix.to_ascii_lowercase()) {
        Some(idx) => target[..idx].to_string(),
        None => target.to_string(),
    }
}

fn query_value(url: &str, key: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// Identifier the collector uses to link a measurement to its preview.
pub fn stream_id(target: &str, in_house_suffix: &str, session: &SessionInfo) -> String {
    let lower = target.to_ascii_lowercase();
    if lower.contains("youtube") && session.preview_youtube != UNKNOWN {
        if let Some(id) = query_value(&session.preview_youtube, "v") {
            return id;
        }
    }
    if !in_house_suffix.is_empty()
        && lower.contains(&in_house_suffix.to_ascii_lowercase())
        && session.preview_ostream != UNKNOWN
    {
        if let Some(id) = query_value(&session.preview_ostream, "streamName") {
            return id;
        }
    }
    String::new()
}

pub fn truncate_raw(raw: &str) -> String {
    raw.chars().take(RAW_LIMIT).collect()
}

fn is_origin_server(target: &str) -> bool {
    target.starts_with("os-") || target.contains("ostream") || target.contains("origin")
}

fn is_platform_server(target: &str) -> bool {
    target.contains("youtube") || target.contains("rtmp")
}

/// Builds collector payloads and posts them.
pub struct HttpReporter {
    collector: CollectorClient,
    computer_name: String,
    display_suffix: String,
    env: Arc<dyn EnvSource>,
    presence: Arc<dyn PresenceCheck>,
    prober: Arc<dyn Prober>,
}

impl HttpReporter {
    pub fn new(
        collector: CollectorClient,
        computer_name: String,
        display_suffix: String,
        env: Arc<dyn EnvSource>,
        presence: Arc<dyn PresenceCheck>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            collector,
            computer_name,
            display_suffix,
            env,
            presence,
            prober,
        }
    }

    /// Address the system resolver hands out, which is what `ping` used.
    async fn target_ip(&self, endpoint: &Endpoint) -> String {
        if let Ok(ip) = endpoint.as_str().parse::<IpAddr>() {
            return ip.to_string();
        }
        let lookup = tokio::net::lookup_host((endpoint.as_str(), 0));
        match tokio::time::timeout(TARGET_LOOKUP_TIMEOUT, lookup).await {
            Ok(Ok(mut addrs)) => addrs.next().map(|a| a.ip().to_string()).unwrap_or_default(),
            Ok(Err(e)) => {
                debug!(endpoint = %endpoint, "DNS resolution failed: {}", e);
                String::new()
            }
            Err(_) => {
                debug!(endpoint = %endpoint, "DNS resolution timed out");
                String::new()
            }
        }
    }

    pub async fn ping_report(&self, endpoint: &Endpoint, m: &Measurement, host: &HostSnapshot) -> PingReport {
        let target = endpoint.as_str();
        PingReport {
            client_id: host.local_ip.clone(),
            computer_name: self.computer_name.clone(),
            target: target.to_string(),
            target_display: target_display(target, &self.display_suffix),
            target_ip: self.target_ip(endpoint).await,
            stream_id: stream_id(target, &self.display_suffix, &host.session),
            isp: host.isp.clone(),
            isp_display: isp_display(&host.isp),
            preview_ostream: host.session.preview_ostream.clone(),
            preview_youtube: host.session.preview_youtube.clone(),
            timestamp: chrono::Utc::now().timestamp(),
            success: m.success,
            rtt_ms: m.rtt_ms,
            raw: truncate_raw(&m.raw),
        }
    }

    /// Current session plus a fresh probe of each advertised server.
    pub async fn client_info(&self, host: &HostSnapshot) -> ClientInfoReport {
        let running = self.presence.is_running().await;
        let mut report = ClientInfoReport {
            client_id: host.local_ip.clone(),
            computer_name: self.computer_name.clone(),
            local_ip: host.local_ip.clone(),
            public_ip: host.public_ip.clone(),
            isp: host.isp.clone(),
            obs_icr_code: UNKNOWN.into(),
            obs_stream_title: UNKNOWN.into(),
            obs_stream_preview_ostream: UNKNOWN.into(),
            obs_stream_preview_youtube: UNKNOWN.into(),
            os_origin_server: NO_SERVER.into(),
            os_origin_ping: 0.0,
            youtube_server: NO_SERVER.into(),
            youtube_ping: 0.0,
            obs_running: running,
        };
        if !running {
            return report;
        }

        let session = session_from_env(self.env.as_ref());
        report.obs_icr_code = session.icr_code;
        report.obs_stream_title = session.title;
        report.obs_stream_preview_ostream = session.preview_ostream;
        report.obs_stream_preview_youtube = session.preview_youtube;

        let targets = local_targets(self.env.as_ref());
        let mut probes: FuturesUnordered<_> = targets
            .iter()
            .map(|t| async move { (t, self.prober.probe(t).await) })
            .collect();
        let mut results = Vec::with_capacity(targets.len());
        while let Some(result) = probes.next().await {
            results.push(result);
        }
        drop(probes);
        // Stable pick when several servers qualify.
        results.sort_by(|a, b| a.0.cmp(b.0));

        let rtt_or_zero = |m: &Measurement| if m.success && m.rtt_ms >= 0.0 { m.rtt_ms } else { 0.0 };
        for (target, m) in &results {
            let name = target.as_str();
            if report.os_origin_server == NO_SERVER && is_origin_server(name) {
                report.os_origin_server = name.to_string();
                report.os_origin_ping = rtt_or_zero(m);
            } else if report.youtube_server == NO_SERVER && is_platform_server(name) {
                report.youtube_server = name.to_string();
                report.youtube_ping = rtt_or_zero(m);
            }
        }
        report
    }
}

#[async_trait]
impl ReportSink for HttpReporter {
    async fn report_measurement(&self, endpoint: &Endpoint, measurement: &Measurement, host: &HostSnapshot) {
        let report = self.ping_report(endpoint, measurement, host).await;
        if let Err(e) = self.collector.push_ping(&report).await {
            warn!(endpoint = %endpoint, "Ping send error: {}", e);
        }
    }

    async fn report_host_snapshot(&self, host: &HostSnapshot) {
        let report = self.client_info(host).await;
        match self.collector.push_client_info(&report).await {
            Ok(()) if report.obs_running => info!(
                isp = %report.isp,
                public_ip = %report.public_ip,
                icr_code = %report.obs_icr_code,
                origin = %report.os_origin_server,
                origin_ping = report.os_origin_ping,
                "Client info pushed"
            ),
            Ok(()) => info!(isp = %report.isp, public_ip = %report.public_ip, "Client info pushed, broadcaster not running"),
            Err(e) => warn!("Failed to push client info: {}", e),
        }
    }
}
