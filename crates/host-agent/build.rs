use std::{env, fs, path::PathBuf, process::Command};

struct BuildInfo {
    version: String,
    git_sha: String,
    dirty: bool,
    timestamp: String,
}

impl BuildInfo {
    fn collect() -> Self {
        let git_sha = env::var("GIT_SHA")
            .ok()
            .map(|sha| sha.trim().to_string())
            .filter(|sha| !sha.is_empty())
            .or_else(|| git(&["rev-parse", "--short", "HEAD"]))
            .unwrap_or_else(|| "unknown".to_string());
        let dirty = match env::var("GIT_DIRTY") {
            Ok(raw) => matches!(raw.trim(), "1" | "true"),
            Err(_) => git(&["status", "--porcelain"]).is_some_and(|out| !out.is_empty()),
        };

        Self {
            version: env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string()),
            git_sha,
            dirty,
            timestamp: build_timestamp(),
        }
    }

    fn label(&self) -> String {
        if self.git_sha == "unknown" || !self.dirty {
            self.git_sha.clone()
        } else {
            format!("{}-dirty", self.git_sha)
        }
    }

    fn render(&self) -> String {
        let label = self.label();
        let full = format!("{} ({}, built {})", self.version, label, self.timestamp);
        [
            format!("pub const VERSION: &str = {:?};", self.version),
            format!("pub const GIT_SHA: &str = {:?};", self.git_sha),
            format!("pub const GIT_DIRTY: bool = {};", self.dirty),
            format!("pub const BUILD_TIMESTAMP: &str = {:?};", self.timestamp),
            format!("pub const GIT_LABEL: &str = {label:?};"),
            format!("pub const FULL_VERSION: &str = {full:?};"),
        ]
        .join("\n")
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Honors SOURCE_DATE_EPOCH for reproducible builds.
fn build_timestamp() -> String {
    env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(chrono::Utc::now)
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn main() -> anyhow::Result<()> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    fs::write(out_dir.join("version.rs"), BuildInfo::collect().render() + "\n")?;

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/refs");
    println!("cargo:rerun-if-env-changed=GIT_SHA");
    println!("cargo:rerun-if-env-changed=GIT_DIRTY");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    Ok(())
}
