pub mod app_state;
pub mod auth;
pub mod config;
pub mod error;
pub mod export;
pub mod history;
pub mod http;
pub mod metrics;
pub mod openapi;
pub mod persistence;
pub mod planner;
pub mod reality;
pub mod registry;
pub mod resolver;
pub mod routes;
pub mod services;
pub mod telemetry;
pub mod tokens;
pub mod validation;
pub mod version;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{env, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, http::HeaderName};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::app_state::{AppState, OperatorAuth};
use crate::metrics::{init_metrics_recorder, record_build_info};
use crate::persistence::{KvRef, SqliteKv};
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    Serve,
    MigrationsDryRun,
}

pub fn parse_command() -> Result<CommandMode> {
    parse_args(env::args().skip(1))
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CommandMode> {
    let Some(first) = args.next() else {
        return Ok(CommandMode::Serve);
    };

    match first.as_str() {
        "--migrations-dry-run" | "migrations-dry-run" => Ok(CommandMode::MigrationsDryRun),
        "migrate" => match args.next().as_deref() {
            Some("--dry-run") | Some("dry-run") => Ok(CommandMode::MigrationsDryRun),
            _ => anyhow::bail!("unknown migrate option; use --dry-run"),
        },
        "--help" | "-h" => {
            println!(
                "Usage: control-plane [--migrations-dry-run]|[migrate --dry-run]\n\
                 Run without arguments to start the server."
            );
            std::process::exit(0);
        }
        other => anyhow::bail!("unknown argument: {other}"),
    }
}

/// Boot the control-plane using the provided command mode.
pub async fn run(mode: CommandMode) -> Result<()> {
    run_with_shutdown(mode, shutdown_signal()).await
}

pub async fn run_with_shutdown<S>(mode: CommandMode, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let metrics_handle = init_metrics_recorder();

    let operator_tokens: Vec<String> = app_config
        .operator
        .tokens
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if operator_tokens.is_empty() {
        anyhow::bail!(
            "EDGEFLEET_CP__OPERATOR__TOKENS must contain at least one non-empty token"
        );
    }
    let operator_header = app_config
        .operator
        .header_name
        .parse::<HeaderName>()
        .map_err(|err| anyhow::anyhow!("invalid operator header name: {}", err))?;

    let db_pool = persistence::migrations::init_pool(&app_config.database.url).await?;
    if mode == CommandMode::MigrationsDryRun {
        let snapshot = persistence::migrations::dry_run_migrations(&db_pool).await?;
        info!(
            current_version = snapshot.latest_applied,
            target_version = snapshot.latest_available,
            pending = snapshot.pending.len(),
            "migration dry-run completed"
        );
        return Ok(());
    }

    let migration_outcome = persistence::migrations::run_migrations(&db_pool).await?;
    if migration_outcome.applied.is_empty() {
        info!(
            current_version = migration_outcome.snapshot.latest_applied,
            target_version = migration_outcome.snapshot.latest_available,
            "database schema is up to date"
        );
    } else {
        info!(
            versions = ?migration_outcome.applied,
            current_version = migration_outcome.snapshot.latest_applied,
            "applied database migrations"
        );
    }
    record_build_info(&migration_outcome.snapshot);

    let registry = Registry::builtin();
    info!(
        templates = registry.builtin_templates().len(),
        plan_retention = app_config.distribution.plan_retention_count,
        auto_reality_keys = app_config.distribution.auto_reality_keys,
        "capability registry loaded"
    );

    let kv: KvRef = Arc::new(SqliteKv::new(db_pool.clone()));
    let state = AppState {
        db: db_pool,
        kv,
        registry: Arc::new(registry),
        operator_auth: OperatorAuth {
            tokens: operator_tokens,
            header_name: operator_header,
        },
        token_pepper: app_config.tokens.pepper.clone(),
        limits: app_config.limits.clone(),
        distribution: app_config.distribution.clone(),
        metrics_handle,
        schema: migration_outcome.snapshot,
    };

    let api_addr: SocketAddr = format!("{}:{}", app_config.server.host, app_config.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {}", err))?;
    let metrics_addr: SocketAddr =
        format!("{}:{}", app_config.metrics.host, app_config.metrics.port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {}", err))?;

    let app: Router = routes::build_router(state.clone()).with_state(state.clone());
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let metrics_app = routes::build_metrics_router().with_state(state);
    let metrics_service = metrics_app.into_make_service_with_connect_info::<SocketAddr>();

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%api_addr, "control-plane listening");
    info!(%metrics_addr, "control-plane metrics listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    let mut api_shutdown = shutdown_rx.clone();
    let mut metrics_shutdown = shutdown_rx;

    let mut api_task = tokio::spawn(async move {
        axum::serve(api_listener, make_service)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            })
            .await
    });

    let mut metrics_task = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_service)
            .with_graceful_shutdown(async move {
                let _ = metrics_shutdown.changed().await;
            })
            .await
    });

    tokio::select! {
        res = &mut api_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("control-plane task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("control-plane server failed: {err}"))?;
            metrics_task
                .await
                .map_err(|err| anyhow::anyhow!("control-plane metrics task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("control-plane metrics server failed: {err}"))?;
        }
        res = &mut metrics_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("control-plane metrics task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("control-plane metrics server failed: {err}"))?;
            api_task
                .await
                .map_err(|err| anyhow::anyhow!("control-plane task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("control-plane server failed: {err}"))?;
        }
    }

    info!("control-plane stopped");
    Ok(())
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
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
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> impl Iterator<Item = String> {
        values
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn command_modes_parse() {
        assert_eq!(parse_args(args(&[])).unwrap(), CommandMode::Serve);
        assert_eq!(
            parse_args(args(&["--migrations-dry-run"])).unwrap(),
            CommandMode::MigrationsDryRun
        );
        assert_eq!(
            parse_args(args(&["migrate", "--dry-run"])).unwrap(),
            CommandMode::MigrationsDryRun
        );
        assert!(parse_args(args(&["migrate"])).is_err());
        assert!(parse_args(args(&["--standalone"])).is_err());
    }
}
