//! Async lifecycle manager over the store and the collaborators.
//!
//! Each operation takes the store lock, performs one atomic store step,
//! releases the lock, awaits the backend and then re-locks to apply the
//! response. Observers subscribe to [`EngineEvent`]s or compare
//! [`ViewKey`]s.

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use shared::{
    domain::{first_supported_path, SessionId},
    protocol::{DatasetView, FetchOptions},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    backend::{DataBackend, FileWatcher, MissingFileWatcher, Navigator, NoopNavigator},
    config::EngineConfig,
    error::EngineError,
    store::{Completion, DataStore, PageRequest, RequestTicket, ViewKey, ViewTarget},
    update::{UpdateChecker, UpdateReport, UpdateStatus},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    SessionOpened {
        session_id: SessionId,
        path: String,
    },
    SessionClosed {
        session_id: SessionId,
        path: String,
    },
    ActiveSessionChanged(Option<SessionId>),
    QueryModeChanged(bool),
    ViewInvalidated {
        session_id: SessionId,
        tag: u64,
    },
    Navigate(String),
    Error {
        session_id: Option<SessionId>,
        message: String,
    },
    UpdateStatusChanged(UpdateStatus),
}

/// What a claimed page has to be fetched from.
enum PageSource {
    Raw {
        path: String,
        options: FetchOptions,
    },
    Query {
        text: String,
        paths: Vec<String>,
    },
}

pub struct ViewerEngine {
    backend: Arc<dyn DataBackend>,
    watcher: Arc<dyn FileWatcher>,
    navigator: Arc<dyn Navigator>,
    updates: UpdateChecker,
    config: EngineConfig,
    store: Mutex<DataStore>,
    update_report: Mutex<Option<UpdateReport>>,
    events: broadcast::Sender<EngineEvent>,
}

impl ViewerEngine {
    pub fn new(backend: Arc<dyn DataBackend>, config: EngineConfig) -> Arc<Self> {
        Self::new_with_dependencies(
            backend,
            Arc::new(MissingFileWatcher),
            Arc::new(NoopNavigator),
            config,
        )
    }

    pub fn new_with_dependencies(
        backend: Arc<dyn DataBackend>,
        watcher: Arc<dyn FileWatcher>,
        navigator: Arc<dyn Navigator>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            backend,
            watcher,
            navigator,
            updates: UpdateChecker::new(config.releases_url.clone()),
            config,
            store: Mutex::new(DataStore::new()),
            update_report: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs `f` against a consistent snapshot of the store.
    pub async fn with_store<R>(&self, f: impl FnOnce(&DataStore) -> R) -> R {
        let store = self.store.lock().await;
        f(&store)
    }

    pub async fn view_key(&self) -> ViewKey {
        self.store.lock().await.view_key()
    }

    pub async fn current_view(&self) -> Option<Arc<DatasetView>> {
        self.store.lock().await.current_view().cloned()
    }

    fn publish(&self, events: impl IntoIterator<Item = EngineEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    // -- opening ----------------------------------------------------------

    /// Activates the session already showing `path`, or opens a new one.
    /// With `force_reload` an existing session is reloaded in place.
    pub async fn open_or_activate(&self, path: &str, force_reload: bool) -> Result<SessionId> {
        let (id, ticket, options, created) = {
            let mut store = self.store.lock().await;
            match store.find_by_path(path) {
                Some(id) => {
                    store.set_active_session(id)?;
                    if !force_reload {
                        drop(store);
                        debug!(session_id = %id, path, "viewer: already open; activated");
                        self.publish([EngineEvent::ActiveSessionChanged(Some(id))]);
                        return Ok(id);
                    }
                    let options = store
                        .session(id)
                        .map(|session| session.fetch_options().clone())
                        .unwrap_or_default();
                    let ticket = store.begin_load(ViewTarget::Raw(id))?;
                    (id, ticket, options, false)
                }
                None => {
                    let id = store.add_session(path);
                    let ticket = store.begin_load(ViewTarget::Raw(id))?;
                    (id, ticket, FetchOptions::default(), true)
                }
            }
        };

        if created {
            info!(session_id = %id, path, "viewer: session opened");
            self.publish([
                EngineEvent::SessionOpened {
                    session_id: id,
                    path: path.to_string(),
                },
                EngineEvent::ActiveSessionChanged(Some(id)),
            ]);
        } else {
            info!(session_id = %id, path, "viewer: reloading session");
            self.publish([EngineEvent::ActiveSessionChanged(Some(id))]);
        }

        let completion = self.run_raw_load(ticket, path, &options).await;

        if created && self.store.lock().await.session(id).is_some() {
            if let Err(err) = self.watcher.start_watching(path).await {
                warn!(path, error = %err, "viewer: failed to start watching");
            }
            // A close that ran while the watch was being installed has
            // already sent its stop.
            let orphaned = self.store.lock().await.find_by_path(path).is_none();
            if orphaned {
                debug!(path, "viewer: session closed while watch was starting");
                self.unwatch(path).await;
            }
        }

        if completion == Completion::Applied && self.load_succeeded(id).await {
            if let Err(err) = self.navigator.navigate_to_viewer(path).await {
                warn!(path, error = %err, "viewer: navigation failed");
            }
            self.publish([EngineEvent::Navigate(path.to_string())]);
        }
        Ok(id)
    }

    /// Opens the first `.parquet`/`.csv` path of a drop payload.
    pub async fn open_dropped<S: AsRef<str>>(&self, paths: &[S]) -> Result<Option<SessionId>> {
        let Some(path) = first_supported_path(paths) else {
            debug!(count = paths.len(), "viewer: drop contained no supported file");
            return Ok(None);
        };
        self.open_or_activate(path, false).await.map(Some)
    }

    /// Re-fetches a session's raw view with its current sorting/filtering.
    pub async fn reload(&self, id: SessionId) -> Result<()> {
        let (ticket, path, options) = {
            let mut store = self.store.lock().await;
            let session = store.session(id).ok_or(EngineError::UnknownSession(id))?;
            let path = session.path().to_string();
            let options = session.fetch_options().clone();
            (store.begin_load(ViewTarget::Raw(id))?, path, options)
        };
        self.run_raw_load(ticket, &path, &options).await;
        Ok(())
    }

    /// Replaces a session's sorting/filtering and reloads it from offset 0.
    pub async fn apply_options(&self, id: SessionId, options: FetchOptions) -> Result<()> {
        let (ticket, path) = {
            let mut store = self.store.lock().await;
            let ticket = store.begin_raw_load_with(id, options.clone())?;
            let path = store
                .session(id)
                .map(|session| session.path().to_string())
                .ok_or(EngineError::UnknownSession(id))?;
            (ticket, path)
        };
        self.run_raw_load(ticket, &path, &options).await;
        Ok(())
    }

    /// Watcher notification: every session showing `path` is reloaded.
    pub async fn file_changed(&self, path: &str) -> Result<()> {
        let ids = self.store.lock().await.session_ids_for_path(path);
        if ids.is_empty() {
            debug!(path, "viewer: change for a file that is not open");
        }
        for id in ids {
            info!(session_id = %id, path, "viewer: file changed on disk; reloading");
            self.reload(id).await?;
        }
        Ok(())
    }

    async fn load_succeeded(&self, id: SessionId) -> bool {
        self.store
            .lock()
            .await
            .session(id)
            .is_some_and(|session| session.raw_view().is_some() && session.error().is_none())
    }

    async fn run_raw_load(
        &self,
        ticket: RequestTicket,
        path: &str,
        options: &FetchOptions,
    ) -> Completion {
        let result = self.backend.get_data(path, options).await;
        self.finish_load(ticket, result).await
    }

    async fn finish_load(&self, ticket: RequestTicket, result: Result<DatasetView>) -> Completion {
        let mut store = self.store.lock().await;
        let before = tag_snapshot(&store);
        let (completion, failure) = match result {
            Ok(mut view) => {
                view.clean_dtypes();
                (store.complete_load(ticket, view), None)
            }
            Err(err) => {
                let message = format!("{err:#}");
                (store.fail_request(ticket, message.clone()), Some(message))
            }
        };
        let mut events = invalidations(&before, &store);
        drop(store);

        if completion == Completion::Applied {
            if let Some(message) = failure {
                warn!(target_view = ?ticket.target(), error = %message, "viewer: load failed");
                events.push(error_event(ticket.target(), message));
            }
        }
        self.publish(events);
        completion
    }

    // -- pagination -------------------------------------------------------

    /// Fetches the next page of whatever the active session is showing.
    /// Returns whether rows were appended.
    pub async fn load_more(&self) -> Result<bool> {
        let target = {
            let store = self.store.lock().await;
            let Some(id) = store.active_session_id() else {
                return Ok(false);
            };
            ViewTarget::new(id, store.current_mode())
        };
        self.load_more_for(target).await
    }

    /// At most one page fetch per target is in flight; a second request
    /// made meanwhile returns `Ok(false)` without touching the backend.
    pub async fn load_more_for(&self, target: ViewTarget) -> Result<bool> {
        let (request, source) = {
            let mut store = self.store.lock().await;
            let Some(request) = store.begin_load_more(target)? else {
                return Ok(false);
            };
            let source = match target {
                ViewTarget::Raw(id) => {
                    let session = store.session(id).ok_or(EngineError::UnknownSession(id))?;
                    PageSource::Raw {
                        path: session.path().to_string(),
                        options: session.fetch_options().clone(),
                    }
                }
                ViewTarget::Query => PageSource::Query {
                    text: store.current_query().unwrap_or_default().to_string(),
                    paths: store.distinct_paths(),
                },
            };
            (request, source)
        };

        let PageRequest { ticket, offset } = request;
        let limit = self.config.page_size;
        debug!(target_view = ?target, offset, limit, "viewer: fetching page");
        let result = match &source {
            PageSource::Raw { path, options } => {
                self.backend
                    .get_more_rows(path, offset, limit, options)
                    .await
            }
            PageSource::Query { text, paths } => {
                self.backend
                    .get_more_query_rows(text, paths, offset, limit)
                    .await
            }
        };

        let mut store = self.store.lock().await;
        let before = tag_snapshot(&store);
        let (completion, failure) = match result {
            Ok(rows) => (store.complete_load_more(ticket, rows), None),
            Err(err) => {
                let message = format!("{err:#}");
                (store.fail_request(ticket, message.clone()), Some(message))
            }
        };
        let mut events = invalidations(&before, &store);
        drop(store);

        let appended = completion == Completion::Applied && failure.is_none();
        if let (Completion::Applied, Some(message)) = (completion, failure) {
            warn!(target_view = ?target, error = %message, "viewer: page fetch failed");
            events.push(error_event(target, message));
        }
        self.publish(events);
        Ok(appended)
    }

    // -- query ------------------------------------------------------------

    /// Sets the shared query without running it. New sessions inherit it.
    pub async fn set_query(&self, text: Option<&str>) -> bool {
        let mut store = self.store.lock().await;
        let before = tag_snapshot(&store);
        let active = store.set_query(text);
        let events = invalidations(&before, &store);
        drop(store);
        self.publish(events);
        active
    }

    /// Sets the shared query and runs it over every open file. Blank text
    /// clears the query instead.
    pub async fn submit_query(&self, text: &str) -> Result<()> {
        let (ticket, query, paths) = {
            let mut store = self.store.lock().await;
            let before = tag_snapshot(&store);
            if !store.has_sessions() {
                return Err(EngineError::NoActiveSession.into());
            }
            if !store.set_query(Some(text)) {
                let events = invalidations(&before, &store);
                drop(store);
                self.publish(events);
                return Ok(());
            }
            store.reset_query_results();
            let ticket = store.begin_load(ViewTarget::Query)?;
            let query = store.current_query().unwrap_or_default().to_string();
            let paths = store.distinct_paths();
            let events = invalidations(&before, &store);
            drop(store);
            self.publish(events);
            (ticket, query, paths)
        };

        info!(files = paths.len(), "viewer: running shared query");
        let result = self.backend.run_query(&query, &paths).await;
        self.finish_load(ticket, result).await;
        Ok(())
    }

    pub async fn set_query_mode(&self, active: bool) -> ViewKey {
        let (changed, key) = {
            let mut store = self.store.lock().await;
            let changed = store.query_mode_active() != active;
            store.set_query_mode(active);
            (changed, store.view_key())
        };
        if changed {
            debug!(active, "viewer: query mode changed");
            self.publish([EngineEvent::QueryModeChanged(active)]);
        }
        key
    }

    pub async fn clear_error(&self, id: SessionId) -> Result<()> {
        let mut store = self.store.lock().await;
        let before = tag_snapshot(&store);
        store.clear_error(id)?;
        let events = invalidations(&before, &store);
        drop(store);
        self.publish(events);
        Ok(())
    }

    // -- registry ---------------------------------------------------------

    pub async fn activate(&self, id: SessionId) -> Result<()> {
        self.store.lock().await.set_active_session(id)?;
        self.publish([EngineEvent::ActiveSessionChanged(Some(id))]);
        Ok(())
    }

    pub async fn rename_session(&self, id: SessionId, name: &str) -> Result<()> {
        self.store.lock().await.rename_session(id, name)?;
        Ok(())
    }

    /// Closes one session. The watch on its path is dropped once no other
    /// session shows the same file.
    pub async fn close_session(&self, id: SessionId) -> Result<()> {
        let (removed, active, left_query_mode) = {
            let mut store = self.store.lock().await;
            let was_query_mode = store.query_mode_active();
            let removed = store
                .remove_session(id)
                .ok_or(EngineError::UnknownSession(id))?;
            (
                removed,
                store.active_session_id(),
                was_query_mode && !store.query_mode_active(),
            )
        };

        info!(session_id = %id, path = %removed.path, "viewer: session closed");
        let mut events = vec![EngineEvent::SessionClosed {
            session_id: id,
            path: removed.path.clone(),
        }];
        if removed.was_active {
            events.push(EngineEvent::ActiveSessionChanged(active));
        }
        if left_query_mode {
            events.push(EngineEvent::QueryModeChanged(false));
        }
        self.publish(events);

        if removed.unwatch {
            self.unwatch(&removed.path).await;
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        let (closed, paths, left_query_mode) = {
            let mut store = self.store.lock().await;
            let closed: Vec<(SessionId, String)> = store
                .sessions()
                .map(|session| (session.id(), session.path().to_string()))
                .collect();
            let was_query_mode = store.query_mode_active();
            (closed, store.clear(), was_query_mode)
        };
        if closed.is_empty() {
            return;
        }

        info!(count = closed.len(), "viewer: all sessions closed");
        let mut events: Vec<EngineEvent> = closed
            .into_iter()
            .map(|(session_id, path)| EngineEvent::SessionClosed { session_id, path })
            .collect();
        events.push(EngineEvent::ActiveSessionChanged(None));
        if left_query_mode {
            events.push(EngineEvent::QueryModeChanged(false));
        }
        self.publish(events);

        for path in paths {
            self.unwatch(&path).await;
        }
    }

    async fn unwatch(&self, path: &str) {
        if let Err(err) = self.watcher.stop_watching(path).await {
            warn!(path, error = %err, "viewer: failed to stop watching");
        }
    }

    // -- updates ----------------------------------------------------------

    pub async fn update_status(&self) -> UpdateStatus {
        self.update_report
            .lock()
            .await
            .as_ref()
            .map_or(UpdateStatus::Unknown, |report| report.status.clone())
    }

    pub async fn last_update_report(&self) -> Option<UpdateReport> {
        self.update_report.lock().await.clone()
    }

    /// Compares the backend's version to the newest release. Failures end
    /// up in the returned status.
    pub async fn check_for_updates(&self) -> UpdateReport {
        self.publish([EngineEvent::UpdateStatusChanged(UpdateStatus::Checking)]);
        let report = self.updates.check(self.backend.as_ref()).await;
        *self.update_report.lock().await = Some(report.clone());
        self.publish([EngineEvent::UpdateStatusChanged(report.status.clone())]);
        report
    }
}

fn tag_snapshot(store: &DataStore) -> HashMap<SessionId, u64> {
    store
        .sessions()
        .map(|session| (session.id(), session.invalidation_tag()))
        .collect()
}

fn invalidations(before: &HashMap<SessionId, u64>, store: &DataStore) -> Vec<EngineEvent> {
    store
        .sessions()
        .filter(|session| before.get(&session.id()) != Some(&session.invalidation_tag()))
        .map(|session| EngineEvent::ViewInvalidated {
            session_id: session.id(),
            tag: session.invalidation_tag(),
        })
        .collect()
}

fn error_event(target: ViewTarget, message: String) -> EngineEvent {
    let session_id = match target {
        ViewTarget::Raw(id) => Some(id),
        ViewTarget::Query => None,
    };
    EngineEvent::Error {
        session_id,
        message,
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
