use std::{
    fs,
    io::Write,
    path::Path,
    process::Stdio,
    time::Duration,
};

use anyhow::Context;
use tokio::process::Command;
use tracing::{debug, info};

use crate::api::Plan;

const APPLY_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const OUTPUT_TAIL_BYTES: usize = 512;

/// Replaces `path` with `data` through a temp file in the same directory, so
/// readers never observe a partially written file.
pub fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|err| anyhow::anyhow!("failed to replace {}: {}", path.display(), err))?;
    Ok(())
}

pub fn write_plan(path: &Path, plan: &Plan) -> anyhow::Result<()> {
    let body = serde_json::to_vec_pretty(plan).context("encode plan")?;
    write_atomic(path, &body)?;
    info!(
        path = %path.display(),
        version = plan.version(),
        archetype = %plan.archetype(),
        "plan written"
    );
    Ok(())
}

/// Runs the configured apply hook with the plan path appended as last argument.
pub async fn run_apply_command(command: &str, plan_path: &Path) -> anyhow::Result<String> {
    run_apply_command_with_timeout(command, plan_path, APPLY_COMMAND_TIMEOUT).await
}

pub(crate) async fn run_apply_command_with_timeout(
    command: &str,
    plan_path: &Path,
    timeout: Duration,
) -> anyhow::Result<String> {
    let mut parts = command.split_whitespace();
    let program = parts.next().context("apply_command is empty")?;

    let child = Command::new(program)
        .args(parts)
        .arg(plan_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start apply command {program}"))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| anyhow::anyhow!("apply command timed out after {}s", timeout.as_secs()))?
        .context("failed to wait for apply command")?;

    let stdout = tail(&output.stdout);
    let stderr = tail(&output.stderr);
    debug!(%stdout, %stderr, status = %output.status, "apply command finished");

    if !output.status.success() {
        anyhow::bail!("apply command exited with {}: {}", output.status, stderr);
    }
    Ok(stdout)
}

fn tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.len() <= OUTPUT_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - OUTPUT_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::edge_plan;
    use uuid::Uuid;

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("plan.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.path() != path)
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    #[test]
    fn written_plan_decodes_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        let plan = edge_plan(Uuid::new_v4(), 4);

        write_plan(&path, &plan).unwrap();
        let decoded: Plan = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(decoded, plan);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn apply_command_receives_plan_path() {
        let dir = tempfile::tempdir().unwrap();
        let plan_path = dir.path().join("plan.json");
        fs::write(&plan_path, "{}").unwrap();

        let out = run_apply_command("echo applying", &plan_path).await.unwrap();
        assert_eq!(out, format!("applying {}", plan_path.display()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_apply_command_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let plan_path = dir.path().join("plan.json");

        let err = run_apply_command("false", &plan_path).await.unwrap_err();
        assert!(err.to_string().contains("apply command exited"), "{err}");

        let err = run_apply_command("/nonexistent/reload-proxy", &plan_path)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_apply_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let plan_path = dir.path().join("plan.json");
        let script = dir.path().join("slow-reload.sh");
        fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        }

        let command = script.display().to_string();
        let err = run_apply_command_with_timeout(&command, &plan_path, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }
}
