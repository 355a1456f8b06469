//! HTTP implementation of [`Backend`] (http://localhost:5009 by default).

use super::types::{
    ChatRequest, ClearResponse, ErrorBody, HealthResponse, StatusResponse, UploadAck,
};
use super::{Backend, BackendError, ByteStream};
use crate::upload::Document;
use async_trait::async_trait;
use futures_util::StreamExt;

const DEFAULT_BASE_URL: &str = "http://localhost:5009";

/// Client for the analysis backend HTTP API.
#[derive(Clone)]
pub struct BackendClient {
    base_url: String,
    client: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET /api/health, the liveness probe.
    pub async fn health(&self) -> Result<HealthResponse, BackendError> {
        let url = format!("{}/api/health", self.base_url);
        let res = self.client.get(&url).send().await?;
        let res = ensure_success(res).await?;
        Ok(res.json().await?)
    }
}

/// Map a non-2xx response to `BackendError::Api`, preferring the JSON `error` field of the body.
async fn ensure_success(res: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.error)
        .filter(|e| !e.trim().is_empty());
    Err(BackendError::Api(match detail {
        Some(error) => error,
        None => format!("{} {}", status, body),
    }))
}

#[async_trait]
impl Backend for BackendClient {
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ByteStream, BackendError> {
        let url = format!("{}/api/chat/stream", self.base_url);
        let res = self.client.post(&url).json(request).send().await?;
        let res = ensure_success(res).await?;
        log::debug!("chat stream opened ({} model)", request.model);
        Ok(res
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(BackendError::Request))
            .boxed())
    }

    async fn upload(&self, document: &Document) -> Result<UploadAck, BackendError> {
        let url = format!("{}/api/upload", self.base_url);
        let part = reqwest::multipart::Part::bytes(document.bytes().to_vec())
            .file_name(document.file_name().to_string())
            .mime_str(document.content_type())?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let res = self.client.post(&url).multipart(form).send().await?;
        let res = ensure_success(res).await?;
        Ok(res.json().await?)
    }

    async fn status(&self) -> Result<StatusResponse, BackendError> {
        let url = format!("{}/api/status", self.base_url);
        let res = self.client.get(&url).send().await?;
        let res = ensure_success(res).await?;
        Ok(res.json().await?)
    }

    async fn clear(&self) -> Result<ClearResponse, BackendError> {
        let url = format!("{}/api/clear", self.base_url);
        let res = self
            .client
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let res = ensure_success(res).await?;
        Ok(res.json().await?)
    }
}
