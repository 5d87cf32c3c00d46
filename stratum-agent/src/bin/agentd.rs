//! Main entry point for the stratum agent daemon.
//!
//! Pools come from `AGENT_POOLS` or an `AGENT_CONFIG` file, the pool
//! sub-account from `AGENT_SUB_ACCOUNT`.

use anyhow::Context;
use stratum_agent::{config::AgentConfig, daemon::Daemon, tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config = AgentConfig::from_env().context("loading configuration")?;
    let sub_account =
        std::env::var("AGENT_SUB_ACCOUNT").context("AGENT_SUB_ACCOUNT is not set")?;

    Daemon::new(config, sub_account).run().await
}
