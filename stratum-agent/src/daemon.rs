//! Daemon lifecycle for the agent.
//!
//! Starts one upstream session per configured pool, waits for a shutdown
//! signal, then cancels the sessions and waits for them to close.

use std::sync::Arc;

use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::AgentConfig;
use crate::tracing::prelude::*;
use crate::upstream::{Status, UpstreamHandle, UpstreamSession};

/// The agent process: upstream sessions plus signal handling.
pub struct Daemon {
    config: Arc<AgentConfig>,
    sub_account: String,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(config: AgentConfig, sub_account: impl Into<String>) -> Self {
        Self {
            config: Arc::new(config),
            sub_account: sub_account.into(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Spawn a session for every pool and return their handles.
    ///
    /// Each session runs until shutdown. The handshake outcome is logged
    /// from a separate task.
    pub fn spawn_sessions(&self) -> anyhow::Result<Vec<UpstreamHandle>> {
        let mut handles = Vec::with_capacity(self.config.pools.len());

        for pool_index in 0..self.config.pools.len() {
            let session = UpstreamSession::new(
                Arc::clone(&self.config),
                self.sub_account.clone(),
                pool_index,
                self.shutdown.child_token(),
            )?;
            let server = session.remote_address();
            let handle = session.handle();

            self.tracker.spawn(session.start());
            self.tracker.spawn({
                let handle = handle.clone();
                async move {
                    match handle.handshake_finished().await {
                        Status::Authorized => info!(server = %server, "Upstream ready"),
                        status => warn!(server = %server, status = ?status, "Upstream unavailable"),
                    }
                }
            });

            handles.push(handle);
        }

        Ok(handles)
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        let handles = self.spawn_sessions()?;
        self.tracker.close();

        info!(pools = handles.len(), sub_account = %self.sub_account, "Started.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            },
        }

        trace!("Shutting down.");
        self.shutdown.cancel();
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }

    /// Request shutdown without a signal.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
