use anyhow::Result;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install the global `tracing` subscriber for the node process.
pub fn setup_logging(level: Level) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Logging setup failed: {}", e))
}
