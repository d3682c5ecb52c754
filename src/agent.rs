//! Wires the components together and runs them until shutdown or restart.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{self, StatusBoard};
use crate::collector::CollectorClient;
use crate::config::{AgentConfig, ProbeMode};
use crate::engine::TargetManager;
use crate::env::EnvSource;
use crate::host::{log_snapshot, HostInspector, HostState, PresenceCheck, ProcessPresence};
use crate::netspeed;
use crate::probe::{IcmpPing, Prober, SystemPing};
use crate::reporting::{HttpReporter, ReportSink};
use crate::resolver::EndpointResolver;
use crate::task::ProbeContext;
use crate::updater::Updater;

/// Optional loops that run next to the core reconciliation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auxiliary {
    HostRefresh { interval: Duration },
    NetworkSpeed { interval: Duration },
    SelfUpdate { interval: Duration },
    StatusApi { port: u16 },
}

impl Auxiliary {
    /// Auxiliary loops switched on by `config`.
    pub fn enabled(config: &AgentConfig) -> Vec<Auxiliary> {
        let mut aux = vec![Auxiliary::HostRefresh { interval: config.host_refresh_interval() }];
        if let Some(interval) = config.network_speed_interval() {
            aux.push(Auxiliary::NetworkSpeed { interval });
        }
        if config.auto_update {
            aux.push(Auxiliary::SelfUpdate { interval: config.update_check_interval() });
        }
        if let Some(port) = config.status_port {
            aux.push(Auxiliary::StatusApi { port });
        }
        aux
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    Shutdown,
    /// A new build was installed; the process should exit for a restart.
    Restart,
}

enum Finished {
    Core,
    Aux(Auxiliary),
    Updated,
}

pub struct Agent {
    config: AgentConfig,
    collector: CollectorClient,
    host: HostState,
    board: StatusBoard,
    inspector: Arc<HostInspector>,
    reporter: Arc<dyn ReportSink>,
    manager: TargetManager,
}

impl Agent {
    pub fn new(config: AgentConfig, env: Arc<dyn EnvSource>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("stream-pulse/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        let collector = CollectorClient::with_client(http.clone(), &config.server_url);
        let presence: Arc<dyn PresenceCheck> = Arc::new(ProcessPresence::default());

        let prober: Arc<dyn Prober> = match config.probe_mode {
            ProbeMode::System => Arc::new(SystemPing),
            ProbeMode::Icmp => Arc::new(IcmpPing::new().context("Failed to open ICMP socket")?),
        };

        let reporter: Arc<dyn ReportSink> = Arc::new(HttpReporter::new(
            collector.clone(),
            config.agent_name().to_string(),
            config.target_display_suffix.clone(),
            env.clone(),
            presence.clone(),
            prober.clone(),
        ));
        let inspector = Arc::new(HostInspector::new(
            http,
            config.public_ip_url.clone(),
            config.isp_lookup_url.clone(),
            env.clone(),
            presence.clone(),
        ));

        let host = HostState::default();
        let board = StatusBoard::default();
        let resolver = Arc::new(EndpointResolver::new(env, presence.clone(), Arc::new(collector.clone())));
        let ctx = ProbeContext {
            prober,
            sink: reporter.clone(),
            host: host.clone(),
            board: board.clone(),
            ping_interval: config.ping_interval(),
            client_info_every: config.client_info_every,
        };
        let manager = TargetManager::new(resolver, presence.clone(), ctx, config.poll_interval());

        Ok(Self { config, collector, host, board, inspector, reporter, manager })
    }

    /// Runs until `shutdown` fires or an update asks for a restart.
    pub async fn run(self, shutdown: CancellationToken) -> AgentExit {
        let Agent { config, collector, host, board, inspector, reporter, manager } = self;
        let stop = shutdown.child_token();
        let mut tasks: JoinSet<Finished> = JoinSet::new();

        // Payloads need host metadata from the first probe on.
        refresh_host(&inspector, &host, reporter.as_ref()).await;

        let core_stop = stop.clone();
        tasks.spawn(async move {
            manager.run(core_stop).await;
            Finished::Core
        });

        for aux in Auxiliary::enabled(&config) {
            info!(?aux, "Starting auxiliary task");
            let stop = stop.clone();
            match aux {
                Auxiliary::HostRefresh { interval } => {
                    let (inspector, host, reporter) = (inspector.clone(), host.clone(), reporter.clone());
                    tasks.spawn(async move {
                        loop {
                            tokio::select! {
                                _ = tokio::time::sleep(interval) => {}
                                _ = stop.cancelled() => break,
                            }
                            refresh_host(&inspector, &host, reporter.as_ref()).await;
                        }
                        Finished::Aux(aux)
                    });
                }
                Auxiliary::NetworkSpeed { interval } => {
                    let (collector, host, name) =
                        (collector.clone(), host.clone(), config.agent_name().to_string());
                    tasks.spawn(async move {
                        netspeed::run_sampler(collector, host, name, interval, stop).await;
                        Finished::Aux(aux)
                    });
                }
                Auxiliary::SelfUpdate { interval } => match Updater::for_current_exe(collector.clone()) {
                    Ok(updater) => {
                        tasks.spawn(async move {
                            if updater.run(interval, stop).await {
                                Finished::Updated
                            } else {
                                Finished::Aux(aux)
                            }
                        });
                    }
                    Err(e) => warn!("Self-update disabled: {:#}", e),
                },
                Auxiliary::StatusApi { port } => {
                    let board = board.clone();
                    tasks.spawn(async move {
                        if let Err(e) = api::start_server(port, board, stop).await {
                            error!("Status API failed on port {}: {}", port, e);
                        }
                        Finished::Aux(aux)
                    });
                }
            }
        }

        let exit = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break AgentExit::Shutdown,
                joined = tasks.join_next() => match joined {
                    Some(Ok(Finished::Updated)) => break AgentExit::Restart,
                    Some(Ok(Finished::Core)) => {
                        error!("Target manager exited unexpectedly");
                        break AgentExit::Shutdown;
                    }
                    Some(Ok(Finished::Aux(aux))) => warn!(?aux, "Auxiliary task ended"),
                    Some(Err(e)) => error!("Agent task failed: {}", e),
                    None => break AgentExit::Shutdown,
                },
            }
        };

        stop.cancel();
        let drain = async { while tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
            warn!("Tasks did not finish in time, aborting");
            tasks.abort_all();
        }
        exit
    }
}

async fn refresh_host(inspector: &HostInspector, host: &HostState, reporter: &dyn ReportSink) {
    let snapshot = inspector.inspect().await;
    log_snapshot(&snapshot);
    host.publish(snapshot);
    reporter.report_host_snapshot(&host.load()).await;
}
