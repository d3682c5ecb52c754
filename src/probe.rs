//! One-shot reachability probes.
//!
//! Every failure mode folds into [`Measurement::failed`], so callers never
//! see an error from this module.

use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use surge_ping::{Client as PingClient, Config as PingConfig, PingIdentifier, PingSequence};
use tokio::process::Command;

use crate::models::{Endpoint, Measurement, SENTINEL_RTT_MS};

/// Smallest latency we report; anything faster is below ping's resolution.
pub const MIN_RTT_MS: f64 = 1.0;

/// Name fragments of international platforms whose ingest sits far away.
const DISTANT_MARKERS: &[&str] = &["youtube", "rtmp", "facebook"];

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> Measurement;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reach {
    Local,
    Distant,
}

impl Reach {
    pub fn of(endpoint: &Endpoint) -> Self {
        let name = endpoint.as_str();
        if DISTANT_MARKERS.iter().any(|m| name.contains(m)) {
            Reach::Distant
        } else {
            Reach::Local
        }
    }

    /// How long the echo itself may take.
    pub fn echo_timeout(self) -> Duration {
        match self {
            Reach::Distant => Duration::from_millis(1500),
            Reach::Local => Duration::from_millis(1000),
        }
    }

    /// Wall-clock budget for the whole probe, process start-up included.
    pub fn budget(self) -> Duration {
        match self {
            Reach::Distant => Duration::from_secs(3),
            Reach::Local => Duration::from_secs(2),
        }
    }
}

/// Extracts the round-trip time from ping output.
///
/// Returns [`SENTINEL_RTT_MS`] when no time marker is present, the figure
/// does not parse, or it is exactly zero.
pub fn parse_rtt(output: &str) -> f64 {
    let equals = output.find("time=");
    let below = output.find("time<");
    let start = match (equals, below) {
        (_, Some(b)) if equals.map_or(true, |e| b < e) => return MIN_RTT_MS,
        (Some(e), _) => e + "time=".len(),
        _ => return SENTINEL_RTT_MS,
    };

    let mut seen_dot = false;
    let digits: String = output[start..]
        .chars()
        .take_while(|&c| {
            if c == '.' && !seen_dot {
                seen_dot = true;
                true
            } else {
                c.is_ascii_digit()
            }
        })
        .collect();

    match digits.parse::<f64>() {
        Ok(rtt) if rtt == 0.0 || !rtt.is_finite() => SENTINEL_RTT_MS,
        Ok(rtt) => rtt.max(MIN_RTT_MS),
        Err(_) => SENTINEL_RTT_MS,
    }
}

/// Probes by running the platform `ping` utility once.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPing;

impl SystemPing {
    fn command(endpoint: &Endpoint, reach: Reach) -> Command {
        let timeout = reach.echo_timeout();
        let mut cmd = Command::new("ping");
        if cfg!(windows) {
            cmd.args(["-n", "1", "-w"]).arg(timeout.as_millis().to_string());
        } else if cfg!(target_os = "macos") {
            // BSD ping takes -W in milliseconds.
            cmd.args(["-c", "1", "-W"]).arg(timeout.as_millis().to_string());
        } else {
            let secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
            cmd.args(["-c", "1", "-W"]).arg(secs.to_string());
        }
        cmd.arg(endpoint.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(windows_sys::Win32::System::Threading::CREATE_NO_WINDOW);
        cmd
    }
}

#[async_trait]
impl Prober for SystemPing {
    async fn probe(&self, endpoint: &Endpoint) -> Measurement {
        let reach = Reach::of(endpoint);
        let child = Self::command(endpoint, reach).output();

        let output = match tokio::time::timeout(reach.budget(), child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Measurement::failed(e.to_string()),
            Err(_) => return Measurement::failed("Timeout"),
        };

        let text = diagnostic_text(&output.stdout, &output.stderr);
        if !output.status.success() {
            return Measurement::failed(text);
        }
        let rtt = parse_rtt(&text);
        if rtt == SENTINEL_RTT_MS {
            Measurement::failed(text)
        } else {
            Measurement::reply(rtt, text)
        }
    }
}

/// Ping output for `raw`; stderr when stdout says nothing, as with
/// resolution failures on Unix.
fn diagnostic_text(stdout: &[u8], stderr: &[u8]) -> String {
    let out = String::from_utf8_lossy(stdout);
    if out.trim().is_empty() {
        String::from_utf8_lossy(stderr).into_owned()
    } else {
        out.into_owned()
    }
}

/// Probes with a raw ICMP echo; needs raw-socket privileges.
pub struct IcmpPing {
    client: PingClient,
    dns_resolver: TokioResolver,
}

impl IcmpPing {
    pub fn new() -> std::io::Result<Self> {
        let client = PingClient::new(&PingConfig::default())?;
        // Same name servers as the system `ping`.
        let dns_resolver = TokioResolver::builder_tokio().map_err(std::io::Error::other)?.build();
        Ok(Self { client, dns_resolver })
    }

    async fn resolve(&self, endpoint: &Endpoint) -> Result<IpAddr, String> {
        if let Ok(ip) = endpoint.as_str().parse::<IpAddr>() {
            return Ok(ip);
        }
        match self.dns_resolver.lookup_ip(endpoint.as_str()).await {
            Ok(lookup) => lookup.iter().next().ok_or_else(|| "No IP Address Found".into()),
            Err(e) => Err(format!("DNS Resolution Failed: {}", e)),
        }
    }
}

#[async_trait]
impl Prober for IcmpPing {
    async fn probe(&self, endpoint: &Endpoint) -> Measurement {
        let reach = Reach::of(endpoint);
        let echo = async {
            let ip = match self.resolve(endpoint).await {
                Ok(ip) => ip,
                Err(e) => return Err(e),
            };
            let payload = [0u8; 56];
            let mut pinger = self.client.pinger(ip, PingIdentifier(rand::random())).await;
            pinger.timeout(reach.echo_timeout());
            match pinger.ping(PingSequence(0), &payload).await {
                Ok((_, latency)) => {
                    let rtt = (latency.as_secs_f64() * 1000.0).max(MIN_RTT_MS);
                    Ok(Measurement::reply(rtt, format!("Reply from {ip}: time={rtt:.1}ms")))
                }
                Err(e) => Err(format!("Request to {ip} failed: {e}")),
            }
        };

        match tokio::time::timeout(reach.budget(), echo).await {
            Ok(Ok(measurement)) => measurement,
            Ok(Err(msg)) => Measurement::failed(msg),
            Err(_) => Measurement::failed("Timeout"),
        }
    }
}
