mod daemon;

use tracing_subscriber::EnvFilter;

use crate::daemon::{DaemonConfig, DaemonRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if parse_cli_mode(std::env::args())? == CliMode::Help {
        println!("Usage: cloudsyncd [--help]");
        println!();
        println!("Environment:");
        println!("  CLOUDSYNC_CONFIG_DIR            configuration and state directory");
        println!("  CLOUDSYNC_SYNC_DIR              sync root used when config.json has none");
        println!("  CLOUDSYNC_WORKERS               number of task workers (5)");
        println!("  CLOUDSYNC_MAX_RETRIES           attempts for transient failures (10)");
        println!("  CLOUDSYNC_WAIT_DELAY_MS         pause before requeueing a deferred task (100)");
        println!("  CLOUDSYNC_STATE_SAVE_SECS       state snapshot interval (60)");
        println!("  CLOUDSYNC_DIRECTORY_CHECK_SECS  storage folder check interval (5)");
        println!("  CLOUDSYNC_ENABLE_ROOT_WATCHER   react to sync root changes immediately (true)");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}
