use reelwatch::app::{App, Services};
use reelwatch::config::ConfigStore;
use reelwatch::persistence::KvGateway;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

/// Parse args
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the config file, created with defaults if missing
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the task and download databases
    #[clap(short, long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    pretty_env_logger::formatted_builder()
        .filter(None, log::LevelFilter::Warn)
        .filter(Some("reelwatch"), log::LevelFilter::Info)
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_default())
        .init();

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    ensure_exists(&config_dir)?;

    let store = ConfigStore::load_or_create(&config_path)
        .with_context(|| format!("Unable to load config {config_path:?}"))?;

    let data_dir = args.data_dir.unwrap_or_else(|| config_dir.join("data"));
    ensure_exists(&data_dir)?;
    let gateway = KvGateway::open(&data_dir)
        .with_context(|| format!("Unable to open persistence directory {data_dir:?}"))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Unable to start the runtime")?
        .block_on(run(store, gateway))
}

async fn run(store: ConfigStore, gateway: KvGateway) -> Result<()> {
    let app = App::new(Arc::new(store), Arc::new(gateway), Services::inert())
        .context("Unable to register tasks")?;

    app.start();
    wait_for_shutdown(&app).await?;

    log::info!("Shutting down, waiting for running tasks");
    app.stop().await;
    Ok(())
}

/// Returns on Ctrl-C. SIGHUP re-reads the config file.
#[cfg(unix)]
async fn wait_for_shutdown(app: &App) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Unable to listen for SIGHUP")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                return result.context("Unable to listen for Ctrl-C");
            }
            _ = hangup.recv() => reload(app),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_app: &App) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Unable to listen for Ctrl-C")
}

#[cfg(unix)]
fn reload(app: &App) {
    match app.reload_config() {
        Ok(reloads) => log::info!("Config reloaded, {} tasks rescheduled", reloads.len()),
        Err(err) => log::error!("Unable to reload config: {:#}", anyhow::Error::from(err)),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let home = home::home_dir().context("Unable to find the home directory")?;
    Ok(home.join(".config").join("reelwatch").join("config.toml"))
}

fn ensure_exists(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }

    let exists = dir
        .try_exists()
        .with_context(|| format!("Couldn't access directory {dir:?}"))?;

    if !exists {
        log::info!("Creating directory {dir:?}");
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Unable to create directory {dir:?}"))?;
    }

    Ok(())
}
