use std::{net::SocketAddr, time::Duration};

use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    build_client, config,
    cp_client::{ControlPlaneClient, CpError},
    state::{self, SyncState},
    sync::{self, CycleOutcome},
    telemetry, validate_control_plane_url, version,
};

/// Controls optional behaviours when starting the agent programmatically.
#[derive(Clone, Debug)]
pub struct AgentOptions {
    /// Initialize a tracing subscriber before starting the agent.
    pub init_tracing: bool,
    /// Start the dedicated `/metrics` HTTP server.
    pub serve_metrics: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            init_tracing: true,
            serve_metrics: true,
        }
    }
}

/// Handle returned by [`start_agent`] to manage shutdown.
pub struct AgentHandle {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    /// Returns a cloneable receiver that fires when shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Request a graceful shutdown; idempotent.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for all agent tasks to finish.
    pub async fn await_termination(self) -> anyhow::Result<()> {
        for handle in self.tasks {
            if let Err(join_err) = handle.await
                && join_err.is_panic()
            {
                error!(?join_err, "agent task panicked during shutdown");
                anyhow::bail!("agent task panicked");
            }
        }
        Ok(())
    }

    /// Request shutdown and block until all tasks have stopped.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.request_shutdown();
        self.await_termination().await
    }
}

/// Start the host-agent using the provided configuration and options.
pub async fn start_agent(
    cfg: config::AppConfig,
    options: AgentOptions,
) -> anyhow::Result<AgentHandle> {
    if options.init_tracing {
        telemetry::init_tracing();
    }

    validate_control_plane_url(&cfg)?;

    let metrics_handle = telemetry::init_metrics_recorder();
    let metrics_addr: SocketAddr = format!("{}:{}", cfg.metrics_host, cfg.metrics_port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid metrics bind address: {}", err))?;

    let client = build_client(&cfg)?;
    let applied_version = state::load_applied_version(&cfg.applied_version_path())?;
    telemetry::record_applied_version(applied_version);

    info!(
        host_id = %cfg.host_id,
        cp = %cfg.control_plane_url,
        insecure_http = cfg.allow_insecure_http,
        tls_skip_verify = cfg.tls_insecure_skip_verify,
        plan_path = %cfg.plan_path.display(),
        applied_version,
        version = version::VERSION,
        git_sha = version::GIT_SHA,
        dirty = version::GIT_DIRTY,
        built_at = version::BUILD_TIMESTAMP,
        "host agent starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if options.serve_metrics {
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let shutdown_fut = async move {
                if *shutdown.borrow() {
                    return;
                }
                let _ = shutdown.changed().await;
            };
            if let Err(err) =
                telemetry::serve_metrics_with_shutdown(metrics_handle, metrics_addr, shutdown_fut)
                    .await
            {
                error!(?err, "metrics server exited with error");
            }
        }));
    }

    let sync_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        let sync = SyncState::with_applied(applied_version);
        if let Err(err) = sync_loop(cfg, client, sync, sync_shutdown).await {
            error!(?err, "sync loop terminated with error");
        }
    }));

    Ok(AgentHandle {
        shutdown_tx,
        shutdown_rx,
        tasks,
    })
}

/// Runs sync cycles until shutdown. The first cycle starts immediately; failed
/// cycles are retried with exponential backoff instead of the poll interval.
pub async fn sync_loop(
    cfg: config::AppConfig,
    client: reqwest::Client,
    mut sync: SyncState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<SyncState> {
    let poll_interval = Duration::from_secs(cfg.poll_interval_secs);
    let backoff_base = Duration::from_millis(cfg.backoff_ms);
    let backoff_max = Duration::from_millis(cfg.backoff_max_ms);
    let mut attempt: u32 = 0;
    let mut delay = Duration::ZERO;

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let cp = ControlPlaneClient::new(&cfg, client.clone());
        match sync::sync_once(&cfg, &cp, &mut sync).await {
            Ok(outcome) => {
                attempt = 0;
                delay = poll_interval;
                log_outcome(cp.request_id(), &outcome);
            }
            Err(err) => {
                attempt = attempt.saturating_add(1);
                delay = state::backoff_with_jitter(backoff_base, backoff_max, attempt);
                let credential_failure = err
                    .downcast_ref::<CpError>()
                    .is_some_and(CpError::is_credential_failure);
                if credential_failure {
                    error!(
                        request_id = cp.request_id(),
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "control plane rejected host credentials"
                    );
                } else {
                    warn!(
                        request_id = cp.request_id(),
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "sync cycle failed"
                    );
                }
            }
        }
    }

    info!(applied_version = sync.applied_version, "sync loop stopped");
    Ok(sync)
}

fn log_outcome(request_id: &str, outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::UpToDate { .. } | CycleOutcome::NotYetVisible { .. } => {}
        CycleOutcome::Applied { version } => {
            info!(request_id, version, "sync cycle applied new plan");
        }
        CycleOutcome::Failed { version } => {
            warn!(request_id, version, "sync cycle reported apply failure");
        }
        CycleOutcome::Suppressed { version } => {
            info!(
                request_id,
                version, "target already failed on this host; waiting for a new target"
            );
        }
    }
}

/// Waits for Ctrl+C or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_options_defaults() {
        let opts = AgentOptions::default();
        assert!(opts.init_tracing);
        assert!(opts.serve_metrics);
    }

    #[tokio::test]
    async fn agent_handle_request_shutdown_sets_signal() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = AgentHandle {
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
        };

        handle.request_shutdown();
        assert!(*handle.shutdown_signal().borrow());
    }

    #[tokio::test]
    async fn agent_handle_reports_task_panics() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async {
            panic!("boom");
        });
        let handle = AgentHandle {
            shutdown_tx,
            shutdown_rx,
            tasks: vec![task],
        };

        let err = handle.await_termination().await.expect_err("panic");
        assert!(err.to_string().contains("panicked"));
    }
}
