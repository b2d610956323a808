use host_agent::{
    config,
    runner::{self, AgentOptions},
    telemetry,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cfg = config::load()?;

    let agent = runner::start_agent(
        cfg,
        AgentOptions {
            init_tracing: false,
            serve_metrics: true,
        },
    )
    .await?;

    runner::wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping agent");
    agent.shutdown().await
}
