use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use stream_pulse::env::{platform_env, EnvSource};
use stream_pulse::updater::RESTART_EXIT_CODE;
use stream_pulse::{utils, Agent, AgentConfig, AgentExit};

#[tokio::main]
async fn main() -> Result<()> {
    utils::setup_console();

    let env: Arc<dyn EnvSource> = Arc::from(platform_env());
    let config = AgentConfig::load(env.as_ref())?;
    let log_guard = utils::init_logging(&config.log_dir());

    info!("Agent starting");
    info!("  AGENT_NAME: {}", config.agent_name());
    info!("  SERVER_URL: {}", config.server_url);
    info!("  POLL_INTERVAL: {}s, PING_INTERVAL: {}s", config.poll_interval_secs, config.ping_interval_secs);
    info!("  PROBE_MODE: {:?}", config.probe_mode);
    info!("  LOG_DIR: {}", config.log_dir().display());

    let agent = Agent::new(config, env)?;
    let shutdown = CancellationToken::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received. Stopping agent...");
                trigger.cancel();
            }
            Err(e) => error!("Cannot listen for shutdown signal: {}", e),
        }
    });

    match agent.run(shutdown).await {
        AgentExit::Shutdown => Ok(()),
        AgentExit::Restart => {
            info!("Exiting for restart into the updated build");
            drop(log_guard);
            std::process::exit(RESTART_EXIT_CODE);
        }
    }
}
