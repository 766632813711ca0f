//! Session registry, per-view pagination state and the shared query result.
//!
//! Everything here is synchronous: the engine takes the store lock, performs
//! one of these operations and releases it before awaiting the backend, so
//! each call is atomic with respect to observers.

use std::{collections::BTreeMap, sync::Arc};

use shared::{
    domain::{display_name_from_path, SessionId, TableLayout, ViewMode},
    protocol::{ColumnInfo, DatasetView, FetchOptions, MetadataInfo},
};
use tracing::debug;

use crate::error::EngineError;

pub const DEFAULT_PAGE_SIZE: usize = 250;

/// The unit pagination state is tracked for. Query state is shared by every
/// session, so it has a single target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewTarget {
    Raw(SessionId),
    Query,
}

impl ViewTarget {
    pub fn new(session_id: SessionId, mode: ViewMode) -> Self {
        match mode {
            ViewMode::Raw => Self::Raw(session_id),
            ViewMode::Query => Self::Query,
        }
    }

    pub fn mode(self) -> ViewMode {
        match self {
            Self::Raw(_) => ViewMode::Raw,
            Self::Query => ViewMode::Query,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Load,
    LoadMore,
}

/// Identity of an in-flight backend request.
///
/// A response is only applied while its ticket is current: the generation of
/// the target has not moved and the matching loading flag is still set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTicket {
    target: ViewTarget,
    kind: RequestKind,
    generation: u64,
}

impl RequestTicket {
    pub fn target(&self) -> ViewTarget {
        self.target
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn mode(&self) -> ViewMode {
        self.target.mode()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub ticket: RequestTicket,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Applied,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Idle,
    Loading,
    LoadingMore,
    Loaded,
    Errored,
}

/// Everything the presentation layer needs to compare to know the current
/// view must be re-read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewKey {
    pub active_session_id: Option<SessionId>,
    pub query_mode_active: bool,
    pub tag: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedSession {
    pub id: SessionId,
    pub path: String,
    pub was_active: bool,
    /// No remaining session shares the path.
    pub unwatch: bool,
}

#[derive(Debug, Clone)]
struct FileSession {
    id: SessionId,
    path: String,
    name: String,
    raw_view: Option<Arc<DatasetView>>,
    raw_loading: bool,
    raw_loading_more: bool,
    raw_failed: bool,
    raw_generation: u64,
    fetch_options: FetchOptions,
    error: Option<String>,
    base_columns: Option<Vec<ColumnInfo>>,
    column_widths: BTreeMap<usize, f32>,
    table_layout: TableLayout,
    tag: u64,
}

impl FileSession {
    fn new(path: String) -> Self {
        Self {
            id: SessionId::new(),
            name: display_name_from_path(&path),
            path,
            raw_view: None,
            raw_loading: false,
            raw_loading_more: false,
            raw_failed: false,
            raw_generation: 0,
            fetch_options: FetchOptions::default(),
            error: None,
            base_columns: None,
            column_widths: BTreeMap::new(),
            table_layout: TableLayout::default(),
            tag: 0,
        }
    }

    fn invalidate(&mut self) {
        self.tag += 1;
    }
}

#[derive(Debug, Default)]
struct SharedQuery {
    text: Option<String>,
    view: Option<Arc<DatasetView>>,
    loading: bool,
    loading_more: bool,
    failed: bool,
    generation: u64,
}

impl SharedQuery {
    fn is_active(&self) -> bool {
        self.text.is_some()
    }
}

/// Read handle joining one session's private state with the shared query.
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    session: &'a FileSession,
    query: &'a SharedQuery,
}

impl<'a> SessionView<'a> {
    pub fn id(&self) -> SessionId {
        self.session.id
    }

    pub fn path(&self) -> &'a str {
        &self.session.path
    }

    pub fn name(&self) -> &'a str {
        &self.session.name
    }

    pub fn raw_view(&self) -> Option<&'a Arc<DatasetView>> {
        self.session.raw_view.as_ref()
    }

    pub fn query_view(&self) -> Option<&'a Arc<DatasetView>> {
        self.query.view.as_ref()
    }

    pub fn view(&self, mode: ViewMode) -> Option<&'a Arc<DatasetView>> {
        match mode {
            ViewMode::Raw => self.raw_view(),
            ViewMode::Query => self.query_view(),
        }
    }

    pub fn raw_loading(&self) -> bool {
        self.session.raw_loading
    }

    pub fn raw_loading_more(&self) -> bool {
        self.session.raw_loading_more
    }

    pub fn query_loading(&self) -> bool {
        self.query.loading
    }

    pub fn query_loading_more(&self) -> bool {
        self.query.loading_more
    }

    pub fn loading(&self, mode: ViewMode) -> bool {
        match mode {
            ViewMode::Raw => self.raw_loading(),
            ViewMode::Query => self.query_loading(),
        }
    }

    pub fn loading_more(&self, mode: ViewMode) -> bool {
        match mode {
            ViewMode::Raw => self.raw_loading_more(),
            ViewMode::Query => self.query_loading_more(),
        }
    }

    pub fn error(&self) -> Option<&'a str> {
        self.session.error.as_deref()
    }

    pub fn current_query(&self) -> Option<&'a str> {
        self.query.text.as_deref()
    }

    pub fn base_columns(&self) -> Option<&'a [ColumnInfo]> {
        self.session.base_columns.as_deref()
    }

    pub fn fetch_options(&self) -> &'a FetchOptions {
        &self.session.fetch_options
    }

    pub fn column_widths(&self) -> &'a BTreeMap<usize, f32> {
        &self.session.column_widths
    }

    pub fn table_layout(&self) -> TableLayout {
        self.session.table_layout
    }

    pub fn invalidation_tag(&self) -> u64 {
        self.session.tag
    }

    pub fn page_state(&self, mode: ViewMode) -> PageState {
        let (loading, loading_more, failed) = match mode {
            ViewMode::Raw => (
                self.session.raw_loading,
                self.session.raw_loading_more,
                self.session.raw_failed,
            ),
            ViewMode::Query => (self.query.loading, self.query.loading_more, self.query.failed),
        };
        if loading {
            PageState::Loading
        } else if loading_more {
            PageState::LoadingMore
        } else if failed {
            PageState::Errored
        } else if self.view(mode).is_some() {
            PageState::Loaded
        } else {
            PageState::Idle
        }
    }
}

#[derive(Debug, Default)]
pub struct DataStore {
    sessions: Vec<FileSession>,
    active_session_id: Option<SessionId>,
    query_mode_active: bool,
    query: SharedQuery,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn session_mut(&mut self, id: SessionId) -> Result<&mut FileSession, EngineError> {
        self.sessions
            .iter_mut()
            .find(|session| session.id == id)
            .ok_or(EngineError::UnknownSession(id))
    }

    fn handle<'a>(&'a self, session: &'a FileSession) -> SessionView<'a> {
        SessionView {
            session,
            query: &self.query,
        }
    }

    fn invalidate_all(&mut self) {
        for session in &mut self.sessions {
            session.invalidate();
        }
    }

    // -- registry ---------------------------------------------------------

    /// Registers a new session and makes it active. Callers dedupe by path.
    pub fn add_session(&mut self, path: impl Into<String>) -> SessionId {
        let session = FileSession::new(path.into());
        let id = session.id;
        debug!(
            session_id = %id,
            path = %session.path,
            inherited_query = self.query.text.is_some(),
            "store: session added"
        );
        self.sessions.push(session);
        self.active_session_id = Some(id);
        id
    }

    pub fn remove_session(&mut self, id: SessionId) -> Option<RemovedSession> {
        let index = self.sessions.iter().position(|session| session.id == id)?;
        let removed = self.sessions.remove(index);
        let was_active = self.active_session_id == Some(id);
        if was_active {
            self.active_session_id = self.sessions.last().map(|session| session.id);
        }
        if self.sessions.is_empty() {
            // Nothing is left to inherit the query from.
            self.forget_query();
        }
        let unwatch = !self
            .sessions
            .iter()
            .any(|session| session.path == removed.path);
        Some(RemovedSession {
            id,
            path: removed.path,
            was_active,
            unwatch,
        })
    }

    /// Drops every session and returns the distinct paths they referenced.
    pub fn clear(&mut self) -> Vec<String> {
        let paths = self.distinct_paths();
        self.sessions.clear();
        self.active_session_id = None;
        self.forget_query();
        paths
    }

    fn forget_query(&mut self) {
        let generation = self.query.generation + 1;
        self.query = SharedQuery {
            generation,
            ..SharedQuery::default()
        };
        self.query_mode_active = false;
    }

    pub fn rename_session(
        &mut self,
        id: SessionId,
        name: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.session_mut(id)?.name = name.into();
        Ok(())
    }

    /// Moves the active pointer. Query mode is left as it is.
    pub fn set_active_session(&mut self, id: SessionId) -> Result<(), EngineError> {
        if !self.sessions.iter().any(|session| session.id == id) {
            return Err(EngineError::UnknownSession(id));
        }
        self.active_session_id = Some(id);
        Ok(())
    }

    pub fn set_column_widths(
        &mut self,
        id: SessionId,
        widths: BTreeMap<usize, f32>,
    ) -> Result<(), EngineError> {
        self.session_mut(id)?.column_widths = widths;
        Ok(())
    }

    pub fn set_table_layout(&mut self, id: SessionId, layout: TableLayout) -> Result<(), EngineError> {
        self.session_mut(id)?.table_layout = layout;
        Ok(())
    }

    pub fn find_by_path(&self, path: &str) -> Option<SessionId> {
        self.sessions
            .iter()
            .find(|session| session.path == path)
            .map(|session| session.id)
    }

    pub fn session_ids_for_path(&self, path: &str) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|session| session.path == path)
            .map(|session| session.id)
            .collect()
    }

    pub fn distinct_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        for session in &self.sessions {
            if !paths.contains(&session.path) {
                paths.push(session.path.clone());
            }
        }
        paths
    }

    pub fn session(&self, id: SessionId) -> Option<SessionView<'_>> {
        self.sessions
            .iter()
            .find(|session| session.id == id)
            .map(|session| self.handle(session))
    }

    /// Sessions in creation order.
    pub fn sessions(&self) -> impl Iterator<Item = SessionView<'_>> + '_ {
        self.sessions.iter().map(move |session| self.handle(session))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn has_sessions(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn active_session_id(&self) -> Option<SessionId> {
        self.active_session_id
    }

    pub fn active_session(&self) -> Option<SessionView<'_>> {
        self.active_session_id.and_then(|id| self.session(id))
    }

    // -- view resolution --------------------------------------------------

    pub fn query_mode_active(&self) -> bool {
        self.query_mode_active
    }

    pub fn set_query_mode(&mut self, active: bool) {
        self.query_mode_active = active;
    }

    pub fn current_mode(&self) -> ViewMode {
        ViewMode::from_query_flag(self.query_mode_active)
    }

    pub fn current_view(&self) -> Option<&Arc<DatasetView>> {
        self.active_session()?.view(self.current_mode())
    }

    pub fn loading(&self) -> bool {
        self.active_session()
            .is_some_and(|session| session.loading(self.current_mode()))
    }

    pub fn loading_more(&self) -> bool {
        self.active_session()
            .is_some_and(|session| session.loading_more(self.current_mode()))
    }

    pub fn error(&self) -> Option<&str> {
        self.active_session()?.error()
    }

    pub fn current_query(&self) -> Option<&str> {
        self.query.text.as_deref()
    }

    /// Query mode is on and there is a query to show results for.
    pub fn is_query_mode(&self) -> bool {
        self.query_mode_active && self.query.is_active()
    }

    pub fn base_columns(&self) -> Option<&[ColumnInfo]> {
        self.active_session()?.base_columns()
    }

    /// File metadata always comes from the raw view, even in query mode.
    pub fn metadata(&self) -> Option<&MetadataInfo> {
        self.active_session()?.raw_view()?.metadata.as_ref()
    }

    pub fn total_rows(&self) -> usize {
        self.current_view().map_or(0, |view| view.total_rows())
    }

    pub fn loaded_rows(&self) -> usize {
        self.current_view().map_or(0, |view| view.loaded_rows())
    }

    pub fn has_more_rows(&self) -> bool {
        self.current_view().is_some_and(|view| !view.is_complete())
    }

    pub fn view_key(&self) -> ViewKey {
        ViewKey {
            active_session_id: self.active_session_id,
            query_mode_active: self.query_mode_active,
            tag: self
                .active_session()
                .map_or(0, |session| session.invalidation_tag()),
        }
    }

    // -- shared query -----------------------------------------------------

    /// Sets the one query shared by all sessions. Blank text clears it along
    /// with every session's query result. Returns whether a query is active.
    /// A changed text drops the previous result and makes any in-flight
    /// query request stale.
    pub fn set_query(&mut self, query: Option<&str>) -> bool {
        let text = query
            .filter(|text| !text.trim().is_empty())
            .map(str::to_string);
        let changed = text != self.query.text;
        self.query.text = text;
        if changed || !self.query.is_active() {
            self.reset_query_results();
        }
        self.query.is_active()
    }

    pub fn reset_query_results(&mut self) {
        self.query.view = None;
        self.query.loading = false;
        self.query.loading_more = false;
        self.query.failed = false;
        self.query.generation += 1;
        self.invalidate_all();
    }

    /// Full replace of a view.
    pub fn set_data(&mut self, target: ViewTarget, data: DatasetView) -> Result<(), EngineError> {
        match target {
            ViewTarget::Raw(id) => {
                let query_active = self.query.is_active();
                let session = self.session_mut(id)?;
                if !query_active {
                    session.base_columns = Some(data.columns.clone());
                }
                session.raw_view = Some(Arc::new(data));
                session.raw_loading = false;
                session.raw_loading_more = false;
                session.raw_failed = false;
                session.raw_generation += 1;
                session.error = None;
                session.invalidate();
            }
            ViewTarget::Query => {
                self.query.view = Some(Arc::new(data));
                self.query.loading = false;
                self.query.loading_more = false;
                self.query.failed = false;
                self.query.generation += 1;
                for session in &mut self.sessions {
                    session.error = None;
                    session.invalidate();
                }
            }
        }
        Ok(())
    }

    /// Appends a page to an existing view. Observers holding the previous
    /// `Arc` keep seeing the previous rows.
    pub fn append_rows(
        &mut self,
        target: ViewTarget,
        rows: Vec<Vec<String>>,
    ) -> Result<(), EngineError> {
        match target {
            ViewTarget::Raw(id) => {
                let session = self.session_mut(id)?;
                session.raw_loading_more = false;
                match session.raw_view.as_mut() {
                    Some(view) => {
                        Arc::make_mut(view).rows.extend(rows);
                        if session.raw_failed {
                            session.raw_failed = false;
                            session.error = None;
                        }
                        session.invalidate();
                    }
                    None => debug!(session_id = %id, "store: append without raw view ignored"),
                }
            }
            ViewTarget::Query => {
                self.query.loading_more = false;
                match self.query.view.as_mut() {
                    Some(view) => {
                        Arc::make_mut(view).rows.extend(rows);
                        if self.query.failed {
                            self.query.failed = false;
                            for session in &mut self.sessions {
                                session.error = None;
                            }
                        }
                        self.invalidate_all();
                    }
                    None => debug!("store: append without query view ignored"),
                }
            }
        }
        Ok(())
    }

    /// Records a failed initial load. Query failures reach every session and
    /// drop the shared result.
    pub fn set_error(
        &mut self,
        target: ViewTarget,
        message: impl Into<String>,
    ) -> Result<(), EngineError> {
        let message = message.into();
        match target {
            ViewTarget::Raw(id) => {
                let session = self.session_mut(id)?;
                session.error = Some(message);
                session.raw_loading = false;
                session.raw_loading_more = false;
                session.raw_failed = true;
                session.invalidate();
            }
            ViewTarget::Query => {
                self.query.view = None;
                self.query.loading = false;
                self.query.loading_more = false;
                self.query.failed = true;
                for session in &mut self.sessions {
                    session.error = Some(message.clone());
                    session.invalidate();
                }
            }
        }
        Ok(())
    }

    pub fn clear_error(&mut self, id: SessionId) -> Result<(), EngineError> {
        if self.query_mode_active {
            if !self.sessions.iter().any(|session| session.id == id) {
                return Err(EngineError::UnknownSession(id));
            }
            for session in &mut self.sessions {
                if session.error.take().is_some() {
                    session.invalidate();
                }
            }
        } else {
            let session = self.session_mut(id)?;
            if session.error.take().is_some() {
                session.invalidate();
            }
        }
        Ok(())
    }

    // -- pagination -------------------------------------------------------

    pub fn begin_load(&mut self, target: ViewTarget) -> Result<RequestTicket, EngineError> {
        let generation = match target {
            ViewTarget::Raw(id) => {
                let session = self.session_mut(id)?;
                session.raw_generation += 1;
                session.raw_loading = true;
                session.raw_loading_more = false;
                session.raw_failed = false;
                session.raw_generation
            }
            ViewTarget::Query => {
                self.query.generation += 1;
                self.query.loading = true;
                self.query.loading_more = false;
                self.query.failed = false;
                self.query.generation
            }
        };
        Ok(RequestTicket {
            target,
            kind: RequestKind::Load,
            generation,
        })
    }

    /// Starts a raw load that also replaces the session's sorting/filtering.
    pub fn begin_raw_load_with(
        &mut self,
        id: SessionId,
        options: FetchOptions,
    ) -> Result<RequestTicket, EngineError> {
        self.session_mut(id)?.fetch_options = options;
        self.begin_load(ViewTarget::Raw(id))
    }

    /// Claims the next page of a view. Returns `None` when a page fetch is
    /// already in flight for the target, an initial load is running, there
    /// is no view yet, or every row is already loaded.
    pub fn begin_load_more(
        &mut self,
        target: ViewTarget,
    ) -> Result<Option<PageRequest>, EngineError> {
        let (loading, loading_more, view, generation) = match target {
            ViewTarget::Raw(id) => {
                let session = self.session_mut(id)?;
                (
                    &mut session.raw_loading,
                    &mut session.raw_loading_more,
                    session.raw_view.as_ref(),
                    session.raw_generation,
                )
            }
            ViewTarget::Query => (
                &mut self.query.loading,
                &mut self.query.loading_more,
                self.query.view.as_ref(),
                self.query.generation,
            ),
        };

        if *loading_more {
            debug!(?target, "store: page fetch already in flight; request dropped");
            return Ok(None);
        }
        if *loading {
            debug!(?target, "store: initial load in flight; page fetch skipped");
            return Ok(None);
        }
        let Some(view) = view else {
            return Ok(None);
        };
        if view.is_complete() {
            return Ok(None);
        }

        let offset = view.loaded_rows();
        *loading_more = true;
        Ok(Some(PageRequest {
            ticket: RequestTicket {
                target,
                kind: RequestKind::LoadMore,
                generation,
            },
            offset,
        }))
    }

    fn is_current(&self, ticket: &RequestTicket) -> bool {
        let (loading, loading_more, generation) = match ticket.target {
            ViewTarget::Raw(id) => {
                let Some(session) = self.sessions.iter().find(|session| session.id == id) else {
                    return false;
                };
                (
                    session.raw_loading,
                    session.raw_loading_more,
                    session.raw_generation,
                )
            }
            ViewTarget::Query => (
                self.query.loading,
                self.query.loading_more,
                self.query.generation,
            ),
        };
        let in_flight = match ticket.kind {
            RequestKind::Load => loading,
            RequestKind::LoadMore => loading_more,
        };
        in_flight && generation == ticket.generation
    }

    pub fn complete_load(&mut self, ticket: RequestTicket, data: DatasetView) -> Completion {
        if !self.is_current(&ticket) {
            debug!(?ticket, "store: stale load response dropped");
            return Completion::Stale;
        }
        match self.set_data(ticket.target, data) {
            Ok(()) => Completion::Applied,
            Err(_) => Completion::Stale,
        }
    }

    pub fn complete_load_more(
        &mut self,
        ticket: RequestTicket,
        rows: Vec<Vec<String>>,
    ) -> Completion {
        if !self.is_current(&ticket) {
            debug!(?ticket, "store: stale page response dropped");
            return Completion::Stale;
        }
        match self.append_rows(ticket.target, rows) {
            Ok(()) => Completion::Applied,
            Err(_) => Completion::Stale,
        }
    }

    /// Routes a backend failure into the error transition for the ticket's
    /// kind. A failed page fetch keeps the rows already loaded.
    pub fn fail_request(&mut self, ticket: RequestTicket, message: impl Into<String>) -> Completion {
        if !self.is_current(&ticket) {
            debug!(?ticket, "store: stale failure dropped");
            return Completion::Stale;
        }
        let message = message.into();
        match (ticket.kind, ticket.target) {
            (RequestKind::Load, target) => {
                if self.set_error(target, message).is_err() {
                    return Completion::Stale;
                }
            }
            (RequestKind::LoadMore, ViewTarget::Raw(id)) => {
                let Ok(session) = self.session_mut(id) else {
                    return Completion::Stale;
                };
                session.raw_loading_more = false;
                session.raw_failed = true;
                session.error = Some(message);
                session.invalidate();
            }
            (RequestKind::LoadMore, ViewTarget::Query) => {
                self.query.loading_more = false;
                self.query.failed = true;
                for session in &mut self.sessions {
                    session.error = Some(message.clone());
                    session.invalidate();
                }
            }
        }
        Completion::Applied
    }

    pub fn page_state(&self, target: ViewTarget) -> Option<PageState> {
        match target {
            ViewTarget::Raw(id) => Some(self.session(id)?.page_state(ViewMode::Raw)),
            ViewTarget::Query => {
                let session = self.sessions.first()?;
                Some(self.handle(session).page_state(ViewMode::Query))
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
