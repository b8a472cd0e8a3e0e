use amrsurf_cli::{run, Cli, Settings};
use amrsurf_reconstruction::parallel::{init_thread_pool, ThreadPoolConfig};
use anyhow::{Context, Result};
use clap::Parser;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::resolve(&cli)?;

    // RUST_LOG, when set, takes precedence over --verbose
    let level = if settings.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut pool = ThreadPoolConfig::default();
    if let Some(threads) = settings.threads {
        pool = pool.with_threads(threads);
    }
    init_thread_pool(pool).context("Failed to start the thread pool")?;

    let reports = run(&settings)?;
    let files: usize = reports.iter().map(|r| r.files.len()).sum();
    log::info!("Processed {} snapshots, wrote {} files", reports.len(), files);
    Ok(())
}
