use super::*;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use shared::{
    domain::ViewMode,
    protocol::{ColumnInfo, Sorting},
};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    GetData(String),
    GetMoreRows { path: String, offset: usize },
    RunQuery { query: String, paths: Vec<String> },
    GetMoreQueryRows { offset: usize },
}

struct PageGate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[derive(Default)]
struct FakeBackend {
    calls: Mutex<Vec<Call>>,
    fail_paths: Vec<String>,
    query_error: Option<String>,
    page_gate: Option<PageGate>,
}

impl FakeBackend {
    async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }
}

fn dataset(total: usize, loaded: usize) -> DatasetView {
    DatasetView {
        dimensions: (total, 2),
        columns: vec![
            ColumnInfo::new("id", "Int64"),
            ColumnInfo::new("ts", "Datetime(ms, UTC)"),
        ],
        rows: (0..loaded)
            .map(|i| vec![i.to_string(), "2024-01-01".to_string()])
            .collect(),
        metadata: None,
    }
}

fn page(offset: usize, count: usize) -> Vec<Vec<String>> {
    (offset..offset + count)
        .map(|i| vec![i.to_string(), "2024-01-01".to_string()])
        .collect()
}

#[async_trait]
impl DataBackend for FakeBackend {
    async fn get_data(&self, path: &str, _options: &FetchOptions) -> Result<DatasetView> {
        self.calls.lock().await.push(Call::GetData(path.to_string()));
        if self.fail_paths.iter().any(|p| p == path) {
            return Err(anyhow!("cannot read {path}"));
        }
        Ok(dataset(600, 250))
    }

    async fn get_more_rows(
        &self,
        path: &str,
        offset: usize,
        limit: usize,
        _options: &FetchOptions,
    ) -> Result<Vec<Vec<String>>> {
        self.calls.lock().await.push(Call::GetMoreRows {
            path: path.to_string(),
            offset,
        });
        if let Some(gate) = &self.page_gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        Ok(page(offset, limit.min(600 - offset)))
    }

    async fn run_query(&self, query: &str, paths: &[String]) -> Result<DatasetView> {
        self.calls.lock().await.push(Call::RunQuery {
            query: query.to_string(),
            paths: paths.to_vec(),
        });
        match &self.query_error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(dataset(300, 250)),
        }
    }

    async fn get_more_query_rows(
        &self,
        _query: &str,
        _paths: &[String],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Vec<String>>> {
        self.calls
            .lock()
            .await
            .push(Call::GetMoreQueryRows { offset });
        Ok(page(offset, limit.min(300 - offset)))
    }

    async fn get_version(&self) -> Result<String> {
        Ok("0.1.0".into())
    }
}

#[derive(Default)]
struct RecordingWatcher {
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
}

#[async_trait]
impl FileWatcher for RecordingWatcher {
    async fn start_watching(&self, path: &str) -> Result<()> {
        self.started.lock().await.push(path.to_string());
        Ok(())
    }

    async fn stop_watching(&self, path: &str) -> Result<()> {
        self.stopped.lock().await.push(path.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNavigator {
    visited: Mutex<Vec<String>>,
}

#[async_trait]
impl Navigator for RecordingNavigator {
    async fn navigate_to_viewer(&self, path: &str) -> Result<()> {
        self.visited.lock().await.push(path.to_string());
        Ok(())
    }
}

struct Harness {
    engine: Arc<ViewerEngine>,
    backend: Arc<FakeBackend>,
    watcher: Arc<RecordingWatcher>,
    navigator: Arc<RecordingNavigator>,
}

fn harness_with(backend: FakeBackend) -> Harness {
    let backend = Arc::new(backend);
    let watcher = Arc::new(RecordingWatcher::default());
    let navigator = Arc::new(RecordingNavigator::default());
    let engine = ViewerEngine::new_with_dependencies(
        backend.clone(),
        watcher.clone(),
        navigator.clone(),
        EngineConfig::default(),
    );
    Harness {
        engine,
        backend,
        watcher,
        navigator,
    }
}

fn harness() -> Harness {
    harness_with(FakeBackend::default())
}

#[tokio::test]
async fn open_loads_watches_and_navigates() {
    let h = harness();
    let mut events = h.engine.subscribe_events();

    let id = h
        .engine
        .open_or_activate("/data/a.parquet", false)
        .await
        .expect("open");

    assert_eq!(h.backend.calls().await, vec![Call::GetData("/data/a.parquet".into())]);
    assert_eq!(*h.watcher.started.lock().await, vec!["/data/a.parquet".to_string()]);
    assert_eq!(*h.navigator.visited.lock().await, vec!["/data/a.parquet".to_string()]);

    let (name, dtypes, rows) = h
        .engine
        .with_store(|store| {
            let session = store.active_session().expect("active");
            let view = session.raw_view().expect("raw view");
            (
                session.name().to_string(),
                view.columns.iter().map(|c| c.dtype.clone()).collect::<Vec<_>>(),
                view.rows.len(),
            )
        })
        .await;
    assert_eq!(name, "a");
    assert_eq!(dtypes, vec!["Int64".to_string(), "Datetime".to_string()]);
    assert_eq!(rows, 250);

    assert_eq!(
        events.recv().await.expect("event"),
        EngineEvent::SessionOpened {
            session_id: id,
            path: "/data/a.parquet".into()
        }
    );
    let mut saw_navigate = false;
    while let Ok(event) = events.try_recv() {
        saw_navigate |= event == EngineEvent::Navigate("/data/a.parquet".into());
    }
    assert!(saw_navigate);
}

#[tokio::test]
async fn reopening_an_open_path_only_activates() {
    let h = harness();
    let a = h.engine.open_or_activate("/a.parquet", false).await.expect("open a");
    let b = h.engine.open_or_activate("/b.parquet", false).await.expect("open b");
    assert_ne!(a, b);

    let again = h.engine.open_or_activate("/a.parquet", false).await.expect("reopen");
    assert_eq!(again, a);
    assert_eq!(h.engine.view_key().await.active_session_id, Some(a));
    assert_eq!(h.backend.calls().await.len(), 2);
    assert_eq!(h.engine.with_store(|store| store.len()).await, 2);

    h.engine.open_or_activate("/a.parquet", true).await.expect("force reload");
    assert_eq!(h.backend.calls().await.len(), 3);
    assert_eq!(h.engine.with_store(|store| store.len()).await, 2);
    assert_eq!(h.watcher.started.lock().await.len(), 2);
}

#[tokio::test]
async fn failed_open_records_error_without_navigating() {
    let h = harness_with(FakeBackend {
        fail_paths: vec!["/broken.csv".into()],
        ..FakeBackend::default()
    });
    let mut events = h.engine.subscribe_events();

    let id = h.engine.open_or_activate("/broken.csv", false).await.expect("open");

    let (error, loading) = h
        .engine
        .with_store(|store| (store.error().map(str::to_string), store.loading()))
        .await;
    assert_eq!(error.as_deref(), Some("cannot read /broken.csv"));
    assert!(!loading);
    assert!(h.navigator.visited.lock().await.is_empty());

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::Error { session_id, .. } = event {
            assert_eq!(session_id, Some(id));
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[tokio::test]
async fn new_session_inherits_query_without_running_it() {
    let h = harness();
    h.engine.open_or_activate("a.parquet", false).await.expect("open a");
    assert!(h.engine.set_query(Some("select 1")).await);
    let s2 = h.engine.open_or_activate("b.parquet", false).await.expect("open b");

    let query = h
        .engine
        .with_store(|store| store.session(s2).and_then(|s| s.current_query()).map(str::to_string))
        .await;
    assert_eq!(query.as_deref(), Some("select 1"));
    assert!(!h
        .backend
        .calls()
        .await
        .iter()
        .any(|call| matches!(call, Call::RunQuery { .. })));
}

#[tokio::test]
async fn query_result_is_shared_and_paged_once() {
    let h = harness();
    let s1 = h.engine.open_or_activate("/a.parquet", false).await.expect("open a");
    let s2 = h.engine.open_or_activate("/b.parquet", false).await.expect("open b");

    h.engine.submit_query("select * from a").await.expect("query");
    assert_eq!(
        h.backend.calls().await[2],
        Call::RunQuery {
            query: "select * from a".into(),
            paths: vec!["/a.parquet".into(), "/b.parquet".into()],
        }
    );

    h.engine.set_query_mode(true).await;
    assert!(h.engine.load_more().await.expect("load more"));
    assert_eq!(
        h.backend.calls().await.last(),
        Some(&Call::GetMoreQueryRows { offset: 250 })
    );

    let (v1, v2) = h
        .engine
        .with_store(|store| {
            (
                store.session(s1).and_then(|s| s.query_view()).cloned(),
                store.session(s2).and_then(|s| s.query_view()).cloned(),
            )
        })
        .await;
    let (v1, v2) = (v1.expect("s1 query view"), v2.expect("s2 query view"));
    assert!(Arc::ptr_eq(&v1, &v2));
    assert_eq!(v1.rows.len(), 300);

    // Every row is loaded now.
    assert!(!h.engine.load_more().await.expect("load more"));
}

#[tokio::test]
async fn query_error_reaches_every_session() {
    let h = harness_with(FakeBackend {
        query_error: Some("syntax error near 'selec'".into()),
        ..FakeBackend::default()
    });
    let s1 = h.engine.open_or_activate("/a.parquet", false).await.expect("open a");
    let s2 = h.engine.open_or_activate("/b.parquet", false).await.expect("open b");
    h.engine.activate(s1).await.expect("activate");

    h.engine.submit_query("selec 1").await.expect("query");

    let states = h
        .engine
        .with_store(|store| {
            [s1, s2]
                .iter()
                .map(|id| {
                    let session = store.session(*id).expect("session");
                    (
                        session.error().map(str::to_string),
                        session.query_view().is_some(),
                        session.query_loading(),
                    )
                })
                .collect::<Vec<_>>()
        })
        .await;
    for (error, has_view, loading) in states {
        assert_eq!(error.as_deref(), Some("syntax error near 'selec'"));
        assert!(!has_view);
        assert!(!loading);
    }
}

#[tokio::test]
async fn blank_query_clears_instead_of_running() {
    let h = harness();
    h.engine.open_or_activate("/a.parquet", false).await.expect("open");
    h.engine.submit_query("select 1").await.expect("query");
    h.engine.submit_query("   ").await.expect("clear");

    let (query, has_view) = h
        .engine
        .with_store(|store| {
            let session = store.active_session().expect("active");
            (session.current_query().map(str::to_string), session.query_view().is_some())
        })
        .await;
    assert_eq!(query, None);
    assert!(!has_view);
    let runs = h
        .backend
        .calls()
        .await
        .into_iter()
        .filter(|call| matches!(call, Call::RunQuery { .. }))
        .count();
    assert_eq!(runs, 1);
}

#[tokio::test]
async fn query_without_sessions_is_rejected() {
    let h = harness();
    let err = h.engine.submit_query("select 1").await.expect_err("no sessions");
    assert_eq!(
        err.downcast_ref::<EngineError>(),
        Some(&EngineError::NoActiveSession)
    );
}

#[tokio::test]
async fn concurrent_load_more_reaches_backend_once() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let h = harness_with(FakeBackend {
        page_gate: Some(PageGate {
            entered: entered.clone(),
            release: release.clone(),
        }),
        ..FakeBackend::default()
    });
    h.engine.open_or_activate("/a.parquet", false).await.expect("open");

    let first = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.load_more().await })
    };
    entered.notified().await;

    assert!(!h.engine.load_more().await.expect("second load more"));
    assert!(h.engine.with_store(|store| store.loading_more()).await);

    release.notify_one();
    assert!(first.await.expect("join").expect("first load more"));

    let page_calls: Vec<Call> = h
        .backend
        .calls()
        .await
        .into_iter()
        .filter(|call| matches!(call, Call::GetMoreRows { .. }))
        .collect();
    assert_eq!(
        page_calls,
        vec![Call::GetMoreRows {
            path: "/a.parquet".into(),
            offset: 250
        }]
    );
    assert_eq!(h.engine.with_store(|store| store.loaded_rows()).await, 500);
}

#[tokio::test]
async fn closing_last_session_on_a_path_unwatches_once() {
    let h = harness();
    let a = h.engine.open_or_activate("/a.parquet", false).await.expect("open a");
    let b = h.engine.open_or_activate("/b.parquet", false).await.expect("open b");

    h.engine.close_session(a).await.expect("close a");
    assert_eq!(*h.watcher.stopped.lock().await, vec!["/a.parquet".to_string()]);
    assert_eq!(h.engine.view_key().await.active_session_id, Some(b));

    let err = h.engine.close_session(a).await.expect_err("already closed");
    assert_eq!(
        err.downcast_ref::<EngineError>(),
        Some(&EngineError::UnknownSession(a))
    );
    assert_eq!(h.watcher.stopped.lock().await.len(), 1);
}

#[tokio::test]
async fn closing_one_of_two_sessions_sharing_a_path_keeps_watch() {
    let h = harness();
    let first = h.engine.open_or_activate("/a.parquet", false).await.expect("open");
    let second = h.engine.store.lock().await.add_session("/a.parquet");

    h.engine.close_session(first).await.expect("close first");
    assert!(h.watcher.stopped.lock().await.is_empty());

    h.engine.close_session(second).await.expect("close second");
    assert_eq!(*h.watcher.stopped.lock().await, vec!["/a.parquet".to_string()]);
    assert_eq!(h.engine.view_key().await.active_session_id, None);
}

#[tokio::test]
async fn close_all_unwatches_each_path_and_forgets_query() {
    let h = harness();
    h.engine.open_or_activate("/a.parquet", false).await.expect("open a");
    h.engine.open_or_activate("/b.parquet", false).await.expect("open b");
    h.engine.set_query(Some("select 1")).await;

    h.engine.close_all().await;

    let mut stopped = h.watcher.stopped.lock().await.clone();
    stopped.sort();
    assert_eq!(stopped, vec!["/a.parquet".to_string(), "/b.parquet".to_string()]);
    let (empty, query) = h
        .engine
        .with_store(|store| (store.is_empty(), store.current_query().map(str::to_string)))
        .await;
    assert!(empty);
    assert_eq!(query, None);
}

#[tokio::test]
async fn file_change_reloads_matching_sessions() {
    let h = harness();
    h.engine.open_or_activate("/a.parquet", false).await.expect("open a");
    h.engine.open_or_activate("/b.parquet", false).await.expect("open b");

    h.engine.file_changed("/a.parquet").await.expect("changed");
    h.engine.file_changed("/elsewhere.csv").await.expect("not open");

    let loads: Vec<Call> = h
        .backend
        .calls()
        .await
        .into_iter()
        .filter(|call| *call == Call::GetData("/a.parquet".into()))
        .collect();
    assert_eq!(loads.len(), 2);
}

#[tokio::test]
async fn drop_opens_first_supported_file() {
    let h = harness();
    let opened = h
        .engine
        .open_dropped(&["/notes.txt", "/DATA/Sales.PARQUET", "/b.csv"])
        .await
        .expect("drop");
    assert!(opened.is_some());
    assert_eq!(
        h.backend.calls().await,
        vec![Call::GetData("/DATA/Sales.PARQUET".into())]
    );

    let nothing = h.engine.open_dropped(&["/notes.txt"]).await.expect("drop");
    assert_eq!(nothing, None);
}

#[tokio::test]
async fn apply_options_reloads_with_new_sorting() {
    let h = harness();
    let id = h.engine.open_or_activate("/a.parquet", false).await.expect("open");
    let options = FetchOptions {
        sorting: Some(vec![Sorting {
            column: "id".into(),
            ascending: false,
        }]),
        filtering: None,
    };

    h.engine.apply_options(id, options.clone()).await.expect("apply");

    let stored = h
        .engine
        .with_store(|store| store.session(id).map(|s| s.fetch_options().clone()))
        .await;
    assert_eq!(stored, Some(options));
    assert_eq!(h.backend.calls().await.len(), 2);
}

#[tokio::test]
async fn mode_toggle_and_activation_keep_view_key_consistent() {
    let h = harness();
    let a = h.engine.open_or_activate("/a.parquet", false).await.expect("open a");
    let b = h.engine.open_or_activate("/b.parquet", false).await.expect("open b");

    let raw_key = h.engine.view_key().await;
    let query_key = h.engine.set_query_mode(true).await;
    assert_ne!(raw_key, query_key);
    assert!(query_key.query_mode_active);
    assert!(h.engine.current_view().await.is_none());

    h.engine.activate(a).await.expect("activate");
    let key = h.engine.view_key().await;
    assert_eq!(key.active_session_id, Some(a));
    assert!(key.query_mode_active);

    h.engine.set_query_mode(false).await;
    assert!(h.engine.current_view().await.is_some());
    assert!(h.engine.activate(b).await.is_ok());
    assert_eq!(
        h.engine.with_store(|store| store.current_mode()).await,
        ViewMode::Raw
    );
}

#[tokio::test]
async fn update_check_records_status() {
    let h = harness();
    assert_eq!(h.engine.update_status().await, UpdateStatus::Unknown);

    // No releases feed is configured by default.
    let report = h.engine.check_for_updates().await;
    assert!(matches!(report.status, UpdateStatus::Failed(_)));
    assert_eq!(report.current.as_deref(), Some("0.1.0"));
    assert_eq!(h.engine.update_status().await, report.status);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchCall {
    Start(String),
    Stop(String),
}

struct GatedWatcher {
    calls: Mutex<Vec<WatchCall>>,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl FileWatcher for GatedWatcher {
    async fn start_watching(&self, path: &str) -> Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        self.calls.lock().await.push(WatchCall::Start(path.to_string()));
        Ok(())
    }

    async fn stop_watching(&self, path: &str) -> Result<()> {
        self.calls.lock().await.push(WatchCall::Stop(path.to_string()));
        Ok(())
    }
}

#[tokio::test]
async fn close_during_watch_start_leaves_no_watch() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let watcher = Arc::new(GatedWatcher {
        calls: Mutex::new(Vec::new()),
        entered: entered.clone(),
        release: release.clone(),
    });
    let engine = ViewerEngine::new_with_dependencies(
        Arc::new(FakeBackend::default()),
        watcher.clone(),
        Arc::new(RecordingNavigator::default()),
        EngineConfig::default(),
    );

    let open = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.open_or_activate("/a.parquet", false).await })
    };
    entered.notified().await;

    let id = engine.view_key().await.active_session_id.expect("session");
    engine.close_session(id).await.expect("close");
    release.notify_one();
    open.await.expect("join").expect("open");

    let calls = watcher.calls.lock().await.clone();
    assert!(calls.contains(&WatchCall::Start("/a.parquet".into())));
    assert_eq!(calls.last(), Some(&WatchCall::Stop("/a.parquet".into())));
}

#[tokio::test]
async fn changing_query_text_never_pages_onto_old_result() {
    let h = harness();
    h.engine.open_or_activate("/a.parquet", false).await.expect("open");
    h.engine.submit_query("select a").await.expect("query");
    h.engine.set_query_mode(true).await;

    assert!(h.engine.set_query(Some("select b")).await);

    assert!(!h.engine.load_more().await.expect("load more"));
    assert!(h.engine.current_view().await.is_none());
    assert!(!h
        .backend
        .calls()
        .await
        .iter()
        .any(|call| matches!(call, Call::GetMoreQueryRows { .. })));

    h.engine.submit_query("select b").await.expect("rerun");
    assert_eq!(
        h.engine.with_store(|store| store.loaded_rows()).await,
        250
    );
}

#[tokio::test]
async fn query_mode_toggle_is_published() {
    let h = harness();
    h.engine.open_or_activate("/a.parquet", false).await.expect("open");
    let mut events = h.engine.subscribe_events();

    h.engine.set_query_mode(true).await;
    h.engine.set_query_mode(true).await;
    h.engine.set_query_mode(false).await;

    let mut toggles = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::QueryModeChanged(active) = event {
            toggles.push(active);
        }
    }
    assert_eq!(toggles, vec![true, false]);
}

#[tokio::test]
async fn closing_last_session_leaves_query_mode() {
    let h = harness();
    let id = h.engine.open_or_activate("/a.parquet", false).await.expect("open");
    h.engine.set_query_mode(true).await;
    let mut events = h.engine.subscribe_events();

    h.engine.close_session(id).await.expect("close");

    assert!(!h.engine.view_key().await.query_mode_active);
    let mut saw_mode_change = false;
    while let Ok(event) = events.try_recv() {
        saw_mode_change |= event == EngineEvent::QueryModeChanged(false);
    }
    assert!(saw_mode_change);

    h.engine.open_or_activate("/b.parquet", false).await.expect("open b");
    assert!(!h.engine.view_key().await.query_mode_active);
}
