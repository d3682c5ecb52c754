use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use url::{Host, Url};

/// Latency reported when a measurement is unavailable.
pub const SENTINEL_RTT_MS: f64 = -10.0;

pub const UNKNOWN: &str = "unknown";

/// A destination monitored for reachability.
///
/// Built only through [`Endpoint::parse`], so two endpoints compare equal
/// exactly when their normalized forms match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    /// Normalizes a hostname, `host:port` or streaming URL into an endpoint.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.contains("://") {
            return Self::from_url(&Url::parse(raw).ok()?);
        }
        Self::normalized(bare_host(raw))
    }

    /// Endpoint for the host part of `url`.
    pub fn from_url(url: &Url) -> Option<Self> {
        match url.host()? {
            Host::Domain(name) => Self::normalized(name),
            Host::Ipv4(ip) => Some(Self(ip.to_string())),
            Host::Ipv6(ip) => Some(Self(ip.to_string())),
        }
    }

    fn normalized(host: &str) -> Option<Self> {
        let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
        (!host.is_empty()).then_some(Self(host))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host of a scheme-less entry: `host`, `host:port`, `[v6]:port` or a bare
/// IPv6 literal.
fn bare_host(raw: &str) -> &str {
    let authority = raw.split(['/', '?']).next().unwrap_or_default();
    if let Some(bracketed) = authority.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or_default();
    }
    if authority.matches(':').count() == 1 {
        authority.split(':').next().unwrap_or_default()
    } else {
        authority
    }
}

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub success: bool,
    pub rtt_ms: f64,
    pub raw: String,
}

impl Measurement {
    pub fn reply(rtt_ms: f64, raw: impl Into<String>) -> Self {
        Self { success: true, rtt_ms, raw: raw.into() }
    }

    pub fn failed(raw: impl Into<String>) -> Self {
        Self { success: false, rtt_ms: SENTINEL_RTT_MS, raw: raw.into() }
    }
}

/// What the broadcasting application currently advertises about its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub icr_code: String,
    pub title: String,
    pub preview_ostream: String,
    pub preview_youtube: String,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            icr_code: UNKNOWN.into(),
            title: UNKNOWN.into(),
            preview_ostream: UNKNOWN.into(),
            preview_youtube: UNKNOWN.into(),
        }
    }
}

/// Immutable view of the host, replaced wholesale on every refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub local_ip: String,
    pub public_ip: String,
    pub isp: String,
    pub app_running: bool,
    pub session: SessionInfo,
}

impl Default for HostSnapshot {
    fn default() -> Self {
        Self {
            local_ip: UNKNOWN.into(),
            public_ip: UNKNOWN.into(),
            isp: UNKNOWN.into(),
            app_running: false,
            session: SessionInfo::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingReport {
    pub client_id: String,
    pub computer_name: String,
    pub target: String,
    pub target_display: String,
    pub target_ip: String,
    pub stream_id: String,
    pub isp: String,
    pub isp_display: String,
    pub preview_ostream: String,
    pub preview_youtube: String,
    pub timestamp: i64,
    pub success: bool,
    pub rtt_ms: f64,
    pub raw: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfoReport {
    pub client_id: String,
    pub computer_name: String,
    pub local_ip: String,
    pub public_ip: String,
    pub isp: String,
    pub obs_icr_code: String,
    pub obs_stream_title: String,
    pub obs_stream_preview_ostream: String,
    pub obs_stream_preview_youtube: String,
    pub os_origin_server: String,
    pub os_origin_ping: f64,
    pub youtube_server: String,
    pub youtube_ping: f64,
    pub obs_running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpeedReport {
    pub client_id: String,
    pub computer_name: String,
    pub isp: String,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub timestamp: i64,
}

/// One element of the collector's `/get_targets` response.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTarget {
    pub target: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct VersionInfo {
    pub build: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub target: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub rtt_ms: f64,
    pub message: String,
}

/// Read-only view served by the local status API.
#[derive(Debug, Default)]
pub struct MonitorState {
    pub monitored: BTreeSet<Endpoint>,
    pub last_results: HashMap<Endpoint, CheckResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_normalizes_case_and_whitespace() {
        assert_eq!(Endpoint::parse("  A.Example.COM "), Endpoint::parse("a.example.com"));
        assert_eq!(Endpoint::parse("a.example.com.").unwrap().as_str(), "a.example.com");
    }

    #[test]
    fn endpoint_extracts_host_from_url() {
        let ep = Endpoint::parse("rtmp://a.rtmp.youtube.com:1935/live2/key").unwrap();
        assert_eq!(ep.as_str(), "a.rtmp.youtube.com");
    }

    #[test]
    fn endpoint_keeps_ipv6_literal() {
        assert_eq!(Endpoint::parse("::1").unwrap().as_str(), "::1");
    }

    #[test]
    fn endpoint_unwraps_bracketed_ipv6() {
        assert_eq!(Endpoint::parse("rtmp://[2001:DB8::1]:1935/live").unwrap().as_str(), "2001:db8::1");
        assert_eq!(Endpoint::parse("[::1]:8080").unwrap().as_str(), "::1");
    }

    #[test]
    fn endpoint_strips_port_and_userinfo() {
        assert_eq!(Endpoint::parse("Origin.Example.com:1935").unwrap().as_str(), "origin.example.com");
        assert_eq!(Endpoint::parse("rtmp://user:pw@ingest.example.com/app").unwrap().as_str(), "ingest.example.com");
        assert_eq!(Endpoint::parse("https://10.0.0.5:8443/x").unwrap().as_str(), "10.0.0.5");
    }

    #[test]
    fn empty_is_not_an_endpoint() {
        assert!(Endpoint::parse("   ").is_none());
        assert!(Endpoint::parse("rtmp://").is_none());
    }
}
