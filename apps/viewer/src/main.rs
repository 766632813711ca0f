mod commands;
mod orchestration;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing_subscriber::EnvFilter;
use viewer_core::{
    settings::SettingsStore, EngineConfig, EngineEvent, HttpDataBackend, Navigator, ViewerEngine,
};

use crate::{
    commands::parse_command,
    orchestration::{dispatch, Flow},
};

#[derive(Parser, Debug)]
#[command(about = "Browse several tabular files and query them together")]
struct Args {
    /// Base URL of the data backend.
    #[arg(long, default_value = "http://127.0.0.1:8750/api")]
    backend_url: String,
    /// Rows fetched per page.
    #[arg(long)]
    page_size: Option<usize>,
    /// JSON releases feed used by `check-update`.
    #[arg(long)]
    releases_url: Option<String>,
    /// Settings file; defaults to the per-user config directory.
    #[arg(long)]
    settings: Option<std::path::PathBuf>,
    /// Files opened at startup.
    files: Vec<String>,
}

struct ConsoleNavigator;

#[async_trait]
impl Navigator for ConsoleNavigator {
    async fn navigate_to_viewer(&self, path: &str) -> Result<()> {
        println!("viewing {path}");
        Ok(())
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::ViewInvalidated { session_id, tag } => {
            tracing::trace!(%session_id, tag, "viewer: view invalidated")
        }
        EngineEvent::Error {
            session_id,
            message,
        } => tracing::warn!(session_id = ?session_id, message = %message, "viewer: error"),
        other => tracing::debug!(event = ?other, "viewer: event"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut config = EngineConfig::load(std::path::Path::new("."));
    if let Some(page_size) = args.page_size.filter(|size| *size > 0) {
        config.page_size = page_size;
    }
    if args.releases_url.is_some() {
        config.releases_url = args.releases_url.clone();
    }

    let mut settings = match &args.settings {
        Some(path) => SettingsStore::open(path),
        None => SettingsStore::open_default(&config.app_name)
            .context("cannot locate settings directory")?,
    };
    tracing::info!(
        path = %settings.path().display(),
        theme = ?settings.settings().theme,
        "viewer: settings loaded"
    );

    let backend = Arc::new(HttpDataBackend::new(&args.backend_url)?);
    let engine = ViewerEngine::new_with_dependencies(
        backend.clone(),
        backend,
        Arc::new(ConsoleNavigator),
        config,
    );

    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "viewer: event log fell behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    for path in &args.files {
        engine.open_or_activate(path, false).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let cmd = match parse_command(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(err) => {
                eprintln!("{err}");
                continue;
            }
        };
        match dispatch(&engine, &mut settings, cmd).await {
            Ok(Flow::Quit) => break,
            Ok(Flow::Continue) => {}
            Err(err) => eprintln!("error: {err:#}"),
        }
    }

    engine.close_all().await;
    Ok(())
}
