//! Computes the set of endpoints that should be monitored right now.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::collector::RemoteTargets;
use crate::env::EnvSource;
use crate::host::PresenceCheck;
use crate::models::Endpoint;

/// Only these platforms are picked out of preview URLs; the in-house
/// ingest is already listed under its own name.
const PREVIEW_PLATFORMS: &[&str] = &["youtube", "facebook", "fb."];

const STREAMING_SCHEMES: &[&str] = &["rtmp", "rtmps"];

/// Produces the desired target set for one reconciliation tick.
#[async_trait]
pub trait TargetSource: Send + Sync {
    /// `app_running` is the presence observed for this tick.
    async fn desired(&self, app_running: bool) -> Result<BTreeSet<Endpoint>>;
}

/// Splits a preview value on `|` when present, else on `,`.
pub fn split_preview(value: &str) -> Vec<&str> {
    let sep = if value.contains('|') { '|' } else { ',' };
    value.split(sep).map(str::trim).filter(|s| !s.is_empty()).collect()
}

/// Hostname of a streaming-transport URL, if it is one.
pub fn streaming_host(raw: &str) -> Option<Endpoint> {
    let url = Url::parse(raw.trim()).ok()?;
    if !STREAMING_SCHEMES.contains(&url.scheme()) {
        return None;
    }
    Endpoint::from_url(&url)
}

/// Endpoints advertised by the broadcaster's live configuration.
pub fn local_targets(env: &dyn EnvSource) -> BTreeSet<Endpoint> {
    let mut targets: BTreeSet<Endpoint> = env
        .get("OBS_STREAMING_SERVERS")
        .unwrap_or_default()
        .split(',')
        .filter_map(Endpoint::parse)
        .collect();

    let preview = env.get("OBS_STREAM_PREVIEW").unwrap_or_default();
    for url in split_preview(&preview) {
        let Some(host) = streaming_host(url) else { continue };
        if PREVIEW_PLATFORMS.iter().any(|p| host.as_str().contains(p)) && targets.insert(host.clone()) {
            debug!(endpoint = %host, "Picked up platform ingest from preview");
        }
    }
    targets
}

/// Merges live host configuration with the collector's endpoint list.
pub struct EndpointResolver {
    env: Arc<dyn EnvSource>,
    presence: Arc<dyn PresenceCheck>,
    remote: Arc<dyn RemoteTargets>,
}

impl EndpointResolver {
    pub fn new(
        env: Arc<dyn EnvSource>,
        presence: Arc<dyn PresenceCheck>,
        remote: Arc<dyn RemoteTargets>,
    ) -> Self {
        Self { env, presence, remote }
    }

    /// Desired set, checking broadcaster presence first.
    pub async fn resolve(&self) -> BTreeSet<Endpoint> {
        let running = self.presence.is_running().await;
        self.resolve_with_presence(running).await
    }

    pub async fn resolve_with_presence(&self, app_running: bool) -> BTreeSet<Endpoint> {
        if !app_running {
            return BTreeSet::new();
        }

        let mut targets = local_targets(self.env.as_ref());
        match self.remote.fetch_targets().await {
            Ok(remote) => targets.extend(remote.iter().filter_map(|t| Endpoint::parse(t))),
            Err(e) => info!("Remote target list unavailable, using local targets: {}", e),
        }
        targets
    }
}

#[async_trait]
impl TargetSource for EndpointResolver {
    async fn desired(&self, app_running: bool) -> Result<BTreeSet<Endpoint>> {
        Ok(self.resolve_with_presence(app_running).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::StaticEnv;
    use crate::error::CollectorError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Presence(bool);

    #[async_trait]
    impl PresenceCheck for Presence {
        async fn is_running(&self) -> bool {
            self.0
        }
    }

    #[derive(Default)]
    struct Remote {
        targets: Option<Vec<&'static str>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteTargets for Remote {
        async fn fetch_targets(&self) -> Result<Vec<String>, CollectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.targets {
                Some(t) => Ok(t.iter().map(|s| s.to_string()).collect()),
                None => Err(CollectorError::EmptyArtifact { path: "/get_targets" }),
            }
        }
    }

    fn set(items: &[&str]) -> BTreeSet<Endpoint> {
        items.iter().filter_map(|s| Endpoint::parse(s)).collect()
    }

    fn resolver(env: StaticEnv, running: bool, remote: Arc<Remote>) -> EndpointResolver {
        EndpointResolver::new(Arc::new(env), Arc::new(Presence(running)), remote)
    }

    #[test]
    fn preview_split_prefers_pipe() {
        assert_eq!(split_preview("a,b|c"), vec!["a,b", "c"]);
        assert_eq!(split_preview(" a , b "), vec!["a", "b"]);
        assert_eq!(split_preview("single"), vec!["single"]);
        assert!(split_preview("").is_empty());
    }

    #[test]
    fn only_streaming_schemes_yield_hosts() {
        assert_eq!(
            streaming_host("rtmps://live-api-s.facebook.com:443/rtmp/key").unwrap().as_str(),
            "live-api-s.facebook.com"
        );
        assert!(streaming_host("https://www.youtube.com/watch?v=x").is_none());
        assert!(streaming_host("not a url").is_none());
        assert_eq!(
            streaming_host("RTMP://[2001:db8::7]:1935/live").unwrap().as_str(),
            "2001:db8::7"
        );
    }

    #[test]
    fn local_targets_merge_servers_and_platform_previews() {
        let env = StaticEnv::new([
            ("OBS_STREAMING_SERVERS", "os-origin-server-1.example.com, ,Backup.Example.com"),
            (
                "OBS_STREAM_PREVIEW",
                "rtmp://a.rtmp.youtube.com/live2|rtmp://os-origin-server-1.example.com/live|rtmp://ingest.other.tv/app",
            ),
        ]);
        assert_eq!(
            local_targets(&env),
            set(&["os-origin-server-1.example.com", "backup.example.com", "a.rtmp.youtube.com"])
        );
    }

    #[tokio::test]
    async fn empty_when_broadcaster_absent() {
        let env = StaticEnv::new([("OBS_STREAMING_SERVERS", "a.com,b.com")]);
        let remote = Arc::new(Remote { targets: Some(vec!["c.com"]), ..Default::default() });
        let r = resolver(env, false, remote.clone());
        assert!(r.resolve().await.is_empty());
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deduplicates_local_and_remote() {
        let env = StaticEnv::new([("OBS_STREAMING_SERVERS", "a.com,b.com")]);
        let remote = Arc::new(Remote { targets: Some(vec!["b.com", "c.com"]), ..Default::default() });
        let r = resolver(env, true, remote);
        assert_eq!(r.resolve().await, set(&["a.com", "b.com", "c.com"]));
    }

    #[tokio::test]
    async fn remote_failure_keeps_local_targets() {
        let env = StaticEnv::new([("OBS_STREAMING_SERVERS", "a.com")]);
        let r = resolver(env, true, Arc::new(Remote::default()));
        assert_eq!(r.desired(true).await.unwrap(), set(&["a.com"]));
    }
}
