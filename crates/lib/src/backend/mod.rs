//! Transport adapter for the analysis backend.
//!
//! [`Backend`] is the seam the chat exchange and the upload poller talk to; [`BackendClient`]
//! implements it over HTTP. Deadlines are applied here so that every exit path drops the
//! underlying response (and with it the socket).

mod client;
#[cfg(test)]
pub(crate) mod fake;
mod types;

pub use client::BackendClient;
pub use types::{
    ChatRequest, ClearResponse, FileDetail, HealthResponse, StatusResponse, UploadAck,
};

use crate::upload::Document;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::future::Future;
use tokio::time::Instant;

/// Raw response body chunks, in arrival order.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, BackendError>>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend api error: {0}")]
    Api(String),
    #[error("backend request timed out")]
    TimedOut,
}

/// Operations consumed from the analysis backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// POST /api/chat/stream. Returns the raw SSE body once response headers arrive.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ByteStream, BackendError>;

    /// POST /api/upload (multipart `file` field).
    async fn upload(&self, document: &Document) -> Result<UploadAck, BackendError>;

    /// GET /api/status.
    async fn status(&self) -> Result<StatusResponse, BackendError>;

    /// POST /api/clear. Drops every uploaded document server-side.
    async fn clear(&self) -> Result<ClearResponse, BackendError>;
}

/// Run `fut` until `deadline`. On expiry the future is dropped and `TimedOut` is returned.
pub async fn until_deadline<T, F>(deadline: Instant, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(BackendError::TimedOut),
    }
}

/// Bound a byte stream by `deadline`. When it expires the stream yields one `TimedOut` error,
/// drops the inner stream and ends.
pub fn stream_until_deadline(stream: ByteStream, deadline: Instant) -> ByteStream {
    futures_util::stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(item)) => Some((item, Some(stream))),
            Ok(None) => None,
            Err(_) => {
                log::debug!("byte stream deadline reached, dropping response");
                Some((Err(BackendError::TimedOut), None))
            }
        }
    })
    .boxed()
}
