//! Pool setup and the embedded migrations that create the `kv` table.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrate;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use uuid::Uuid;

use super::Db;
use crate::Result;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Schema position of a database relative to the migrations built into this binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationSnapshot {
    pub latest_applied: Option<i64>,
    pub latest_available: Option<i64>,
    pub pending: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct MigrationRunOutcome {
    pub snapshot: MigrationSnapshot,
    pub applied: Vec<i64>,
}

/// Opens the store. `sqlite::memory:` maps to a private temp file behind one connection so every
/// caller gets an isolated database.
pub async fn init_pool(database_url: &str) -> Result<Db> {
    let is_memory = database_url.starts_with("sqlite::memory");
    let url = if is_memory {
        let path = std::env::temp_dir().join(format!("edgefleet-{}.sqlite", Uuid::new_v4()));
        format!("sqlite://{}", path.display())
    } else {
        database_url.to_string()
    };
    if let Some(parent) = url
        .strip_prefix("sqlite://")
        .and_then(|path| Path::new(path).parent())
        .filter(|parent| !parent.as_os_str().is_empty())
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create database directory {}", parent.display()))?;
    }

    let opts = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    SqlitePoolOptions::new()
        .max_connections(if is_memory { 1 } else { 5 })
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(opts)
        .await
        .with_context(|| format!("connect to {url}"))
}

pub fn latest_migration_version() -> Option<i64> {
    MIGRATOR.iter().map(|m| m.version).max()
}

/// Reads the applied set, refusing databases written by a different build.
pub async fn migration_snapshot(pool: &Db) -> Result<MigrationSnapshot> {
    let mut conn = pool.acquire().await?;
    conn.ensure_migrations_table()
        .await
        .context("ensure migrations table exists")?;
    if let Some(version) = conn.dirty_version().await? {
        anyhow::bail!("database is in a dirty migration state at version {version}");
    }
    let applied = conn
        .list_applied_migrations()
        .await
        .context("list applied migrations")?;

    let known: HashMap<i64, &[u8]> = MIGRATOR
        .iter()
        .map(|m| (m.version, &*m.checksum))
        .collect();
    for migration in &applied {
        match known.get(&migration.version) {
            None => anyhow::bail!("database has unknown migration version {}", migration.version),
            Some(checksum) if *checksum != &*migration.checksum => anyhow::bail!(
                "migration {} checksum mismatch between database and binary",
                migration.version
            ),
            Some(_) => {}
        }
    }

    let mut pending: Vec<i64> = known
        .keys()
        .copied()
        .filter(|version| !applied.iter().any(|m| m.version == *version))
        .collect();
    pending.sort_unstable();
    Ok(MigrationSnapshot {
        latest_applied: applied.iter().map(|m| m.version).max(),
        latest_available: latest_migration_version(),
        pending,
    })
}

/// Checks the live schema and replays every migration against a scratch database.
pub async fn dry_run_migrations(pool: &Db) -> Result<MigrationSnapshot> {
    let snapshot = migration_snapshot(pool).await?;
    let scratch = init_pool("sqlite::memory:").await?;
    MIGRATOR
        .run(&scratch)
        .await
        .context("dry-run execution of migrations failed")?;
    Ok(snapshot)
}

pub async fn run_migrations(pool: &Db) -> Result<MigrationRunOutcome> {
    let before = migration_snapshot(pool).await?;
    if before.pending.is_empty() {
        return Ok(MigrationRunOutcome {
            snapshot: before,
            applied: Vec::new(),
        });
    }

    MIGRATOR
        .run(pool)
        .await
        .context("applying database migrations failed")?;
    Ok(MigrationRunOutcome {
        snapshot: migration_snapshot(pool).await?,
        applied: before.pending,
    })
}
