//! Runs parsed commands against the engine and prints their results.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use shared::domain::SessionId;
use uuid::Uuid;
use viewer_core::{
    settings::{SettingsStore, Theme},
    update::UpdateStatus,
    DataStore, ViewerEngine,
};

use crate::commands::{Command, FontChange, SessionRef, HELP};

const PREVIEW_ROWS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub fn command_name(cmd: &Command) -> &'static str {
    match cmd {
        Command::Open { .. } => "open",
        Command::Reload { .. } => "reload",
        Command::Changed { .. } => "changed",
        Command::Close { .. } => "close",
        Command::CloseAll => "close_all",
        Command::Switch { .. } => "switch",
        Command::Rename { .. } => "rename",
        Command::QueryMode { .. } => "query_mode",
        Command::Query { .. } => "query",
        Command::ClearQuery => "clear_query",
        Command::More => "more",
        Command::List => "list",
        Command::Show => "show",
        Command::CheckUpdate => "check_update",
        Command::Theme { .. } => "theme",
        Command::Font(_) => "font",
        Command::Help => "help",
        Command::Quit => "quit",
    }
}

pub fn resolve_session(store: &DataStore, session: &SessionRef) -> Option<SessionId> {
    match session {
        SessionRef::Index(index) => store.sessions().nth(index - 1).map(|s| s.id()),
        SessionRef::Id(raw) => {
            let id = SessionId(Uuid::parse_str(raw).ok()?);
            store.session(id).map(|s| s.id())
        }
    }
}

async fn lookup(engine: &ViewerEngine, session: &SessionRef) -> Result<SessionId> {
    engine
        .with_store(|store| resolve_session(store, session))
        .await
        .ok_or_else(|| anyhow!("no session matches {session:?}"))
}

pub async fn dispatch(
    engine: &Arc<ViewerEngine>,
    settings: &mut SettingsStore,
    cmd: Command,
) -> Result<Flow> {
    tracing::debug!(command = command_name(&cmd), "viewer: dispatching command");
    match cmd {
        Command::Open { path } => {
            engine.open_or_activate(&path, false).await?;
            print_status(engine).await;
        }
        Command::Reload { path } => {
            engine.open_or_activate(&path, true).await?;
            print_status(engine).await;
        }
        Command::Changed { path } => engine.file_changed(&path).await?,
        Command::Close { session } => {
            let id = lookup(engine, &session).await?;
            engine.close_session(id).await?;
        }
        Command::CloseAll => engine.close_all().await,
        Command::Switch { session } => {
            let id = lookup(engine, &session).await?;
            engine.activate(id).await?;
            print_status(engine).await;
        }
        Command::Rename { session, name } => {
            let id = lookup(engine, &session).await?;
            engine.rename_session(id, &name).await?;
        }
        Command::QueryMode { active } => {
            engine.set_query_mode(active).await;
            print_status(engine).await;
        }
        Command::Query { text } => {
            engine.submit_query(&text).await?;
            engine.set_query_mode(true).await;
            print_status(engine).await;
        }
        Command::ClearQuery => {
            engine.set_query(None).await;
            print_status(engine).await;
        }
        Command::More => {
            if !engine.load_more().await? {
                println!("nothing more to load");
            }
            print_status(engine).await;
        }
        Command::List => print!("{}", engine.with_store(render_sessions).await),
        Command::Show => print!("{}", engine.with_store(render_view).await),
        Command::CheckUpdate => {
            let report = engine.check_for_updates().await;
            let checked = report.checked_at.format("%Y-%m-%d %H:%M:%S UTC");
            match report.status {
                UpdateStatus::Available { latest } => {
                    println!("update available: {latest} (checked {checked})")
                }
                UpdateStatus::UpToDate => println!("up to date (checked {checked})"),
                UpdateStatus::Failed(err) => println!("update check failed: {err}"),
                UpdateStatus::Unknown | UpdateStatus::Checking => {}
            }
        }
        Command::Theme { dark } => {
            settings.set_theme(if dark { Theme::Dark } else { Theme::Light });
            println!("theme: {:?}", settings.settings().theme);
        }
        Command::Font(change) => {
            match change {
                FontChange::Next => {
                    settings.cycle_font();
                }
                FontChange::Larger => {
                    settings.increase_font_size();
                }
                FontChange::Smaller => {
                    settings.decrease_font_size();
                }
            }
            let current = settings.settings();
            println!(
                "font: {} {}px",
                current.font_family.css_family(),
                current.font_size
            );
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

async fn print_status(engine: &ViewerEngine) {
    println!("{}", engine.with_store(render_status).await);
}

pub fn render_status(store: &DataStore) -> String {
    let Some(session) = store.active_session() else {
        return "no file open".to_string();
    };
    let mode = if store.query_mode_active() { "sql" } else { "raw" };
    let mut line = format!(
        "[{mode}] {} {}/{} rows",
        session.name(),
        store.loaded_rows(),
        store.total_rows()
    );
    if store.loading() {
        line.push_str(" (loading)");
    } else if store.loading_more() {
        line.push_str(" (loading more)");
    }
    if let Some(error) = store.error() {
        line.push_str(&format!(" error: {error}"));
    }
    line
}

pub fn render_sessions(store: &DataStore) -> String {
    let active = store.active_session_id();
    let mut out = String::new();
    for (index, session) in store.sessions().enumerate() {
        let marker = if Some(session.id()) == active { '*' } else { ' ' };
        out.push_str(&format!(
            "{marker}#{} {} {} ({})\n",
            index + 1,
            session.name(),
            session.path(),
            session.id()
        ));
    }
    if let Some(query) = store.current_query() {
        out.push_str(&format!("query: {query}\n"));
    }
    out
}

pub fn render_view(store: &DataStore) -> String {
    let Some(view) = store.current_view() else {
        return format!("{}\n", render_status(store));
    };
    let mut out = format!("{}\n", render_status(store));
    let header: Vec<String> = view
        .columns
        .iter()
        .map(|column| format!("{}:{}", column.name, column.dtype))
        .collect();
    out.push_str(&header.join("\t"));
    out.push('\n');
    for row in view.rows.iter().take(PREVIEW_ROWS) {
        out.push_str(&row.join("\t"));
        out.push('\n');
    }
    if view.rows.len() > PREVIEW_ROWS {
        out.push_str(&format!("... {} more loaded\n", view.rows.len() - PREVIEW_ROWS));
    }
    if let Some(metadata) = store.metadata() {
        out.push_str(&format!(
            "file: {} size={} row_groups={} compression={}\n",
            metadata.name, metadata.size, metadata.row_groups, metadata.compression
        ));
    }
    out
}

#[cfg(test)]
#[path = "tests/orchestration_tests.rs"]
mod tests;
