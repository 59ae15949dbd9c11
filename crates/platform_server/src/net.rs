use anyhow::{Context, Result};
use async_trait::async_trait;
use platform::{FetchResponse, Fetcher};
use std::path::PathBuf;

/// Fetches `http(s)://` urls over the network and anything else from disk,
/// relative paths resolving against `base_dir`.
pub struct ServerFetcher {
    client: reqwest::Client,
    base_dir: PathBuf,
}

impl ServerFetcher {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_dir: base_dir.into(),
        }
    }

    async fn fetch_remote(&self, url: &str) -> Result<FetchResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to fetch {url}"))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("failed to read body of {url}"))?;
        Ok(FetchResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            body: body.to_vec(),
        })
    }

    async fn fetch_local(&self, url: &str) -> Result<FetchResponse> {
        let raw = url.strip_prefix("file://").unwrap_or(url);
        let path = self.base_dir.join(raw);
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(FetchResponse::ok(body)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(FetchResponse {
                status: 404,
                status_text: "Not Found".to_string(),
                body: Vec::new(),
            }),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }
}

impl Default for ServerFetcher {
    fn default() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

#[async_trait]
impl Fetcher for ServerFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.fetch_remote(url).await
        } else {
            self.fetch_local(url).await
        }
    }
}
