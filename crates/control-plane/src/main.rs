use control_plane::{init_tracing, parse_command, run, version};
use tracing::info;

#[tokio::main]
async fn main() -> control_plane::Result<()> {
    init_tracing();
    let mode = parse_command()?;
    info!(
        version = version::VERSION,
        build = version::GIT_LABEL,
        built_at = version::BUILD_TIMESTAMP,
        mode = ?mode,
        "edgefleet control-plane starting"
    );
    run(mode).await
}
