//! Collaborators the engine talks to: the data backend, the file watcher and
//! the navigation hook, plus an HTTP implementation of the first two.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::{
    error::BackendError,
    protocol::{DatasetView, FetchOptions},
};
use url::Url;

#[async_trait]
pub trait DataBackend: Send + Sync {
    async fn get_data(&self, path: &str, options: &FetchOptions) -> Result<DatasetView>;
    async fn get_more_rows(
        &self,
        path: &str,
        offset: usize,
        limit: usize,
        options: &FetchOptions,
    ) -> Result<Vec<Vec<String>>>;
    async fn run_query(&self, query: &str, paths: &[String]) -> Result<DatasetView>;
    async fn get_more_query_rows(
        &self,
        query: &str,
        paths: &[String],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Vec<String>>>;
    async fn get_version(&self) -> Result<String>;
}

#[async_trait]
pub trait FileWatcher: Send + Sync {
    async fn start_watching(&self, path: &str) -> Result<()>;
    async fn stop_watching(&self, path: &str) -> Result<()>;
}

/// Called once a freshly opened dataset has loaded, so the shell can switch
/// to the table screen.
#[async_trait]
pub trait Navigator: Send + Sync {
    async fn navigate_to_viewer(&self, path: &str) -> Result<()>;
}

pub struct NoopNavigator;

#[async_trait]
impl Navigator for NoopNavigator {
    async fn navigate_to_viewer(&self, _path: &str) -> Result<()> {
        Ok(())
    }
}

pub struct MissingFileWatcher;

#[async_trait]
impl FileWatcher for MissingFileWatcher {
    async fn start_watching(&self, path: &str) -> Result<()> {
        Err(anyhow!("file watching is unavailable for {path}"))
    }

    async fn stop_watching(&self, path: &str) -> Result<()> {
        Err(anyhow!("file watching is unavailable for {path}"))
    }
}

#[derive(Debug, Serialize)]
struct GetDataRequest<'a> {
    path: &'a str,
    #[serde(flatten)]
    options: &'a FetchOptions,
}

#[derive(Debug, Serialize)]
struct GetMoreRowsRequest<'a> {
    path: &'a str,
    offset: usize,
    limit: usize,
    #[serde(flatten)]
    options: &'a FetchOptions,
}

#[derive(Debug, Serialize)]
struct RunQueryRequest<'a> {
    query: &'a str,
    paths: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct WatchRequest<'a> {
    path: &'a str,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

/// Data backend reached over HTTP with JSON bodies.
pub struct HttpDataBackend {
    http: Client,
    base_url: Url,
}

impl HttpDataBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .with_context(|| format!("invalid backend url: {base_url}"))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("backend url cannot be used as a base: {base_url}"));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, name: &str) -> Result<Url> {
        self.base_url
            .join(name)
            .with_context(|| format!("failed to build backend endpoint '{name}'"))
    }

    async fn post<B, T>(&self, name: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.endpoint(name)?)
            .json(body)
            .send()
            .await
            .with_context(|| format!("backend request '{name}' failed"))?;
        decode_response(name, response).await
    }

    async fn post_unit<B>(&self, name: &str, body: &B) -> Result<()>
    where
        B: Serialize + ?Sized + Sync,
    {
        let response = self
            .http
            .post(self.endpoint(name)?)
            .json(body)
            .send()
            .await
            .with_context(|| format!("backend request '{name}' failed"))?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(error_from_response(response).await)
    }
}

async fn decode_response<T: DeserializeOwned>(name: &str, response: reqwest::Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    response
        .json::<T>()
        .await
        .with_context(|| format!("invalid '{name}' response from backend"))
}

async fn error_from_response(response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    match response.text().await {
        Ok(body) => match serde_json::from_str::<BackendError>(&body) {
            Ok(err) => anyhow::Error::new(err),
            Err(_) if body.trim().is_empty() => anyhow!("backend returned {status}"),
            Err(_) => anyhow!("backend returned {status}: {}", body.trim()),
        },
        Err(err) => anyhow!("backend returned {status}; body unreadable: {err}"),
    }
}

#[async_trait]
impl DataBackend for HttpDataBackend {
    async fn get_data(&self, path: &str, options: &FetchOptions) -> Result<DatasetView> {
        self.post("get_data", &GetDataRequest { path, options }).await
    }

    async fn get_more_rows(
        &self,
        path: &str,
        offset: usize,
        limit: usize,
        options: &FetchOptions,
    ) -> Result<Vec<Vec<String>>> {
        self.post(
            "get_more_rows",
            &GetMoreRowsRequest {
                path,
                offset,
                limit,
                options,
            },
        )
        .await
    }

    async fn run_query(&self, query: &str, paths: &[String]) -> Result<DatasetView> {
        self.post(
            "run_query",
            &RunQueryRequest {
                query,
                paths,
                offset: None,
                limit: None,
            },
        )
        .await
    }

    async fn get_more_query_rows(
        &self,
        query: &str,
        paths: &[String],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Vec<String>>> {
        self.post(
            "get_more_query_rows",
            &RunQueryRequest {
                query,
                paths,
                offset: Some(offset),
                limit: Some(limit),
            },
        )
        .await
    }

    async fn get_version(&self) -> Result<String> {
        let response = self
            .http
            .get(self.endpoint("version")?)
            .send()
            .await
            .context("backend request 'version' failed")?;
        let body: VersionResponse = decode_response("version", response).await?;
        Ok(body.version)
    }
}

#[async_trait]
impl FileWatcher for HttpDataBackend {
    async fn start_watching(&self, path: &str) -> Result<()> {
        self.post_unit("start_watching", &WatchRequest { path }).await
    }

    async fn stop_watching(&self, path: &str) -> Result<()> {
        self.post_unit("stop_watching", &WatchRequest { path }).await
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
