use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use glico_core::remote::{RemoteDocument, RemoteError, RemoteStore};

#[derive(Deserialize)]
struct RangeItem {
    id: String,
    data: serde_json::Value,
}

/// [`RemoteStore`] backed by a `glico serve` instance.
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("glico-cli/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, kind: &str, path: &str) -> String {
        format!("{}/api/{kind}/{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.api_key {
            Some(ref key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))
    }
}

async fn rejected(response: Response) -> RemoteError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    RemoteError::Rejected { status, message }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn exists(&self, namespace: &str) -> Result<bool, RemoteError> {
        let response = self
            .send(self.client.get(self.url("namespaces", namespace)))
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(rejected(response).await),
        }
    }

    async fn get_document(&self, path: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let response = self.send(self.client.get(self.url("documents", path))).await?;
        match response.status() {
            StatusCode::OK => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| RemoteError::Transport(e.to_string()))?;
                Ok(Some(body.to_vec()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(rejected(response).await),
        }
    }

    async fn set_document(&self, path: &str, body: Vec<u8>) -> Result<(), RemoteError> {
        let request = self
            .client
            .put(self.url("documents", path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        let response = self.send(request).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(rejected(response).await)
        }
    }

    async fn range_query(
        &self,
        collection: &str,
        start: &str,
        end: &str,
    ) -> Result<Vec<RemoteDocument>, RemoteError> {
        let request = self
            .client
            .get(self.url("collections", collection))
            .query(&[("start", start), ("end", end)]);
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        let items: Vec<RangeItem> = response
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        items
            .into_iter()
            .map(|item| {
                let body = serde_json::to_vec(&item.data)
                    .map_err(|e| RemoteError::Malformed(e.to_string()))?;
                Ok(RemoteDocument { id: item.id, body })
            })
            .collect()
    }
}
