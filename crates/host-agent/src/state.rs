use std::{fs, io, path::Path, time::Duration};

use anyhow::Context;
use rand::Rng;

use crate::api::ApplyReportRequest;
use crate::apply::write_atomic;

/// Agent-side bookkeeping carried between sync cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    /// Last version successfully applied; mirrored to `state_dir/applied_version`.
    pub applied_version: u64,
    /// Version whose apply failed; not retried until the target changes.
    pub failed_version: Option<u64>,
    /// Report that has not been acknowledged by the control plane yet.
    pub pending_report: Option<ApplyReportRequest>,
}

impl SyncState {
    pub fn with_applied(applied_version: u64) -> Self {
        Self {
            applied_version,
            ..Self::default()
        }
    }
}

/// Reads the persisted applied version; a missing file means nothing was applied yet.
pub fn load_applied_version(path: &Path) -> anyhow::Result<u64> {
    match fs::read_to_string(path) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("corrupt applied version in {}", path.display())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read applied version {}", path.display()))
        }
    }
}

pub fn store_applied_version(path: &Path, version: u64) -> anyhow::Result<()> {
    write_atomic(path, format!("{version}\n").as_bytes())
        .with_context(|| format!("failed to persist applied version to {}", path.display()))
}

pub fn backoff_with_jitter(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
    let mut backoff = base.saturating_mul(exp);
    if backoff > max {
        backoff = max;
    }
    let jitter_max = backoff.as_millis() / 2;
    let jitter_ms: u128 = rand::rng().random_range(0..=jitter_max.max(1));
    backoff + Duration::from_millis(jitter_ms as u64)
}
