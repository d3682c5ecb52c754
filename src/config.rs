use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::env::EnvSource;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: f64,
    #[serde(default = "default_client_info_every")]
    pub client_info_every: u64,
    #[serde(default = "default_host_refresh_interval")]
    pub host_refresh_interval_secs: u64,
    #[serde(default = "default_network_speed_interval")]
    pub network_speed_interval_secs: u64,
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default = "default_update_check_interval")]
    pub update_check_interval_secs: u64,
    #[serde(default)]
    pub status_port: Option<u16>,
    #[serde(default)]
    pub probe_mode: ProbeMode,
    #[serde(default = "default_target_display_suffix")]
    pub target_display_suffix: String,
    #[serde(default = "default_public_ip_url")]
    pub public_ip_url: String,
    #[serde(default = "default_isp_lookup_url")]
    pub isp_lookup_url: String,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// Shell out to the platform `ping` utility.
    #[default]
    System,
    /// Raw ICMP echo from inside the agent.
    Icmp,
}

impl FromStr for ProbeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "icmp" => Ok(Self::Icmp),
            other => Err(format!("unknown probe mode '{other}'")),
        }
    }
}

fn default_server_url() -> String { "http://127.0.0.1:5010".into() }
fn default_poll_interval() -> u64 { 5 }
fn default_ping_interval() -> f64 { 1.0 }
fn default_client_info_every() -> u64 { 60 }
fn default_host_refresh_interval() -> u64 { 300 }
fn default_network_speed_interval() -> u64 { 60 }
fn default_update_check_interval() -> u64 { 3600 }
fn default_target_display_suffix() -> String { ".udvashunmesh.com".into() }
fn default_public_ip_url() -> String { "https://api.ipify.org?format=json".into() }
fn default_isp_lookup_url() -> String { "http://ip-api.com/json/".into() }

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            agent_name: None,
            poll_interval_secs: default_poll_interval(),
            ping_interval_secs: default_ping_interval(),
            client_info_every: default_client_info_every(),
            host_refresh_interval_secs: default_host_refresh_interval(),
            network_speed_interval_secs: default_network_speed_interval(),
            auto_update: false,
            update_check_interval_secs: default_update_check_interval(),
            status_port: None,
            probe_mode: ProbeMode::default(),
            target_display_suffix: default_target_display_suffix(),
            public_ip_url: default_public_ip_url(),
            isp_lookup_url: default_isp_lookup_url(),
            log_dir: None,
        }
    }
}

impl AgentConfig {
    /// Optional JSON file first, then live environment overrides.
    pub fn load(env: &dyn EnvSource) -> Result<Self> {
        let path = env
            .get("AGENT_CONFIG")
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from("agent.json")).filter(|p| p.exists()));

        let base = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        Ok(base.with_env(env))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn with_env(mut self, env: &dyn EnvSource) -> Self {
        if let Some(url) = env.get("SERVER_URL") {
            self.server_url = url;
        }
        if let Some(name) = env.get("AGENT_NAME") {
            self.agent_name = Some(name);
        }
        override_parsed(env, "POLL_INTERVAL", &mut self.poll_interval_secs);
        override_parsed(env, "PING_INTERVAL", &mut self.ping_interval_secs);
        override_parsed(env, "CLIENT_INFO_EVERY", &mut self.client_info_every);
        override_parsed(env, "HOST_REFRESH_INTERVAL", &mut self.host_refresh_interval_secs);
        override_parsed(env, "NETWORK_SPEED_INTERVAL", &mut self.network_speed_interval_secs);
        override_parsed(env, "UPDATE_CHECK_INTERVAL", &mut self.update_check_interval_secs);
        override_parsed(env, "PROBE_MODE", &mut self.probe_mode);
        if let Some(raw) = env.get("AUTO_UPDATE") {
            match parse_flag(&raw) {
                Some(flag) => self.auto_update = flag,
                None => warn!(key = "AUTO_UPDATE", value = %raw, "Ignoring unparsable setting"),
            }
        }
        if let Some(raw) = env.get("STATUS_PORT") {
            match raw.trim().parse::<u16>() {
                Ok(0) => self.status_port = None,
                Ok(port) => self.status_port = Some(port),
                Err(_) => warn!(key = "STATUS_PORT", value = %raw, "Ignoring unparsable setting"),
            }
        }
        if let Some(suffix) = env.get("TARGET_DISPLAY_SUFFIX") {
            self.target_display_suffix = suffix;
        }
        if let Some(url) = env.get("PUBLIC_IP_URL") {
            self.public_ip_url = url;
        }
        if let Some(url) = env.get("ISP_LOOKUP_URL") {
            self.isp_lookup_url = url;
        }
        if let Some(dir) = env.get("LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if self.agent_name.is_none() {
            self.agent_name = Some(detect_agent_name(env));
        }
        self.sanitize()
    }

    fn sanitize(mut self) -> Self {
        if self.poll_interval_secs == 0 {
            warn!("POLL_INTERVAL must be positive, using default");
            self.poll_interval_secs = default_poll_interval();
        }
        if !self.ping_interval_secs.is_finite() || self.ping_interval_secs <= 0.0 {
            warn!("PING_INTERVAL must be positive, using default");
            self.ping_interval_secs = default_ping_interval();
        }
        if self.client_info_every == 0 {
            self.client_info_every = default_client_info_every();
        }
        if self.host_refresh_interval_secs == 0 {
            self.host_refresh_interval_secs = default_host_refresh_interval();
        }
        if self.update_check_interval_secs == 0 {
            self.update_check_interval_secs = default_update_check_interval();
        }
        self
    }

    pub fn agent_name(&self) -> &str {
        self.agent_name.as_deref().unwrap_or("unknown-agent")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs_f64(self.ping_interval_secs)
    }

    pub fn host_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.host_refresh_interval_secs)
    }

    /// `None` when the throughput sampler is switched off.
    pub fn network_speed_interval(&self) -> Option<Duration> {
        (self.network_speed_interval_secs > 0)
            .then(|| Duration::from_secs(self.network_speed_interval_secs))
    }

    pub fn update_check_interval(&self) -> Duration {
        Duration::from_secs(self.update_check_interval_secs)
    }

    pub fn log_dir(&self) -> PathBuf {
        if let Some(dir) = &self.log_dir {
            return dir.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|p| p.join("logs")))
            .unwrap_or_else(|| PathBuf::from("logs"))
    }
}

fn override_parsed<T: FromStr>(env: &dyn EnvSource, key: &str, slot: &mut T) {
    if let Some(raw) = env.get(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => warn!(key, value = %raw, "Ignoring unparsable setting"),
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn detect_agent_name(env: &dyn EnvSource) -> String {
    env.get("COMPUTERNAME")
        .or_else(sysinfo::System::host_name)
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "unknown-agent".into())
}
