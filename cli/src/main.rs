//! Terminal driver for the sync layer.
//!
//! Plays the "external collaborator" role: reads the published view-model,
//! selects runs, triggers refreshes. Useful for poking at a results server
//! without a browser.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use url::Url;

use semsync_core::{
    ArtifactFetcher, RunRegistry, SyncConfig, SyncControllerBuilder, SyncHandle, SyncPhase,
};

#[derive(Parser)]
#[command(name = "semsync", about = "Sync and inspect model-data runs")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the results catalog root URL.
    #[arg(long, global = true)]
    results_root: Option<Url>,

    /// Override the legacy (unscoped) data root URL.
    #[arg(long, global = true)]
    legacy_data_root: Option<Url>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List available runs, newest first.
    Runs,
    /// Print one run's manifest as JSON.
    Manifest { run_id: String },
    /// Fetch once and print the assembled view-model as JSON.
    Snapshot {
        /// Run to select instead of the newest.
        #[arg(long)]
        run: Option<String>,
    },
    /// Keep the view-model fresh and log every publish until Ctrl-C.
    Watch {
        /// Run to select instead of the newest.
        #[arg(long)]
        run: Option<String>,
        /// Poll interval in seconds.
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Runs => list_runs(config).await,
        Command::Manifest { run_id } => print_manifest(config, &run_id).await,
        Command::Snapshot { run } => snapshot(config, run).await,
        Command::Watch { run, interval } => watch(config, run, interval).await,
    }
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(url) = &cli.results_root {
        config.results_root = url.clone();
    }
    if let Some(url) = &cli.legacy_data_root {
        config.legacy_data_root = url.clone();
    }
    Ok(config)
}

fn registry(config: &SyncConfig) -> Result<RunRegistry> {
    Ok(RunRegistry::new(ArtifactFetcher::new(config))?)
}

async fn list_runs(config: SyncConfig) -> Result<()> {
    let runs = registry(&config)?.list_runs().await;
    if runs.is_empty() {
        bail!("no runs available at {}", config.results_root);
    }
    for run in runs {
        println!("{}\t{}\t{}", run.run_id, run.timestamp, run.label);
    }
    Ok(())
}

async fn print_manifest(config: SyncConfig, run_id: &str) -> Result<()> {
    let manifest = registry(&config)?
        .get_manifest(run_id)
        .await
        .with_context(|| format!("no manifest for run {run_id}"))?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

async fn snapshot(config: SyncConfig, run: Option<String>) -> Result<()> {
    let handle = SyncControllerBuilder::new(config).spawn()?;
    if let Some(run_id) = &run {
        handle.set_current_run(run_id.clone()).await?;
    }
    wait_until_settled(&handle, run.as_deref()).await?;

    println!("{}", serde_json::to_string_pretty(&*handle.data())?);
    handle.shutdown();
    Ok(())
}

/// Wait for the first settled phase for the requested run.
async fn wait_until_settled(handle: &SyncHandle, run: Option<&str>) -> Result<()> {
    let mut phase = handle.subscribe_phase();
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let current = *phase.borrow_and_update();
            let settled = matches!(
                current,
                SyncPhase::Idle | SyncPhase::Error | SyncPhase::NoRunsAvailable
            );
            let on_requested_run =
                run.is_none() || handle.current_run().as_deref() == run;
            if settled && on_requested_run {
                return Ok(());
            }
            phase
                .changed()
                .await
                .map_err(|_| anyhow!("sync controller exited"))?;
        }
    })
    .await
    .context("timed out waiting for the first sync cycle")?
}

async fn watch(config: SyncConfig, run: Option<String>, interval: Option<u64>) -> Result<()> {
    let mut builder = SyncControllerBuilder::new(config);
    if let Some(secs) = interval {
        builder = builder.with_poll_interval(Duration::from_secs(secs));
    }
    let handle = builder.spawn()?;
    if let Some(run_id) = run {
        handle.set_current_run(run_id).await?;
    }

    let mut data = handle.subscribe_data();
    let mut phase = handle.subscribe_phase();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = data.changed() => {
                changed.map_err(|_| anyhow!("sync controller exited"))?;
                let snapshot = data.borrow_and_update().clone();
                let decomposition = snapshot.decomposition();
                tracing::info!(
                    run = handle.current_run().as_deref().unwrap_or("-"),
                    sample_size = snapshot.sample_size,
                    valid = snapshot.validation.is_valid,
                    total_effect = decomposition.total,
                    "model data updated"
                );
                for error in &snapshot.validation.errors {
                    tracing::warn!(%error, "validation");
                }
            }
            changed = phase.changed() => {
                changed.map_err(|_| anyhow!("sync controller exited"))?;
                let current = *phase.borrow_and_update();
                tracing::info!(phase = ?current, "sync phase");
            }
        }
    }

    handle.shutdown();
    Ok(())
}
