//! Scripted in-memory backend for unit tests.

use super::{
    Backend, BackendError, ByteStream, ChatRequest, ClearResponse, FileDetail, StatusResponse,
    UploadAck,
};
use crate::upload::Document;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// How the fake answers `chat_stream`.
pub(crate) enum ChatScript {
    /// Body delivered as these chunks, then the stream ends.
    Chunks(Vec<Vec<u8>>),
    /// Body delivers these chunks and then never ends.
    Hang(Vec<Vec<u8>>),
    /// Request fails before any body arrives.
    Reject(String),
}

pub(crate) struct FakeBackend {
    chat: Mutex<Option<ChatScript>>,
    upload: Mutex<Option<Result<UploadAck, BackendError>>>,
    statuses: Mutex<VecDeque<Result<StatusResponse, BackendError>>>,
    /// Returned once the scripted statuses run out.
    steady_status: Mutex<Option<StatusResponse>>,
    /// When set, `upload` never answers.
    hang_upload: AtomicBool,
    /// When set, `status` never answers.
    hang_status: AtomicBool,
    pub chat_calls: AtomicU32,
    pub upload_calls: AtomicU32,
    pub status_calls: AtomicU32,
    pub clear_calls: AtomicU32,
    pub last_chat: Mutex<Option<ChatRequest>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            chat: Mutex::new(None),
            upload: Mutex::new(None),
            statuses: Mutex::new(VecDeque::new()),
            steady_status: Mutex::new(None),
            hang_upload: AtomicBool::new(false),
            hang_status: AtomicBool::new(false),
            chat_calls: AtomicU32::new(0),
            upload_calls: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
            clear_calls: AtomicU32::new(0),
            last_chat: Mutex::new(None),
        }
    }

    pub fn with_chat(self, script: ChatScript) -> Self {
        *self.chat.lock().unwrap() = Some(script);
        self
    }

    /// Chat body made of the given SSE lines, one chunk per line.
    pub fn with_chat_lines(self, lines: &[&str]) -> Self {
        let chunks = lines.iter().map(|l| format!("{}\n\n", l).into_bytes()).collect();
        self.with_chat(ChatScript::Chunks(chunks))
    }

    pub fn with_upload(self, ack: Result<UploadAck, BackendError>) -> Self {
        *self.upload.lock().unwrap() = Some(ack);
        self
    }

    pub fn push_status(self, status: Result<StatusResponse, BackendError>) -> Self {
        self.statuses.lock().unwrap().push_back(status);
        self
    }

    pub fn with_steady_status(self, status: StatusResponse) -> Self {
        *self.steady_status.lock().unwrap() = Some(status);
        self
    }

    pub fn with_hanging_upload(self) -> Self {
        self.hang_upload.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_hanging_status(self) -> Self {
        self.hang_status.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

/// Status body with a single file entry.
pub(crate) fn status_for(file: &str, file_status: &str, ready: bool) -> StatusResponse {
    let completed = u32::from(file_status == "completed");
    let processing = u32::from(file_status == "processing");
    let errored = u32::from(file_status == "error");
    StatusResponse {
        status: Some(if ready { "ready" } else { "initializing" }.to_string()),
        query_engine_ready: ready,
        total_files: 1,
        completed_files: completed,
        processing_files: processing,
        error_files: errored,
        files_detail: vec![FileDetail {
            filename: file.to_string(),
            status: file_status.to_string(),
            upload_time: Some(1_700_000_000.0),
            error: None,
        }],
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ByteStream, BackendError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_chat.lock().unwrap() = Some(request.clone());
        match self.chat.lock().unwrap().take() {
            Some(ChatScript::Chunks(chunks)) => {
                Ok(futures_util::stream::iter(chunks.into_iter().map(Ok)).boxed())
            }
            Some(ChatScript::Hang(chunks)) => Ok(futures_util::stream::iter(
                chunks.into_iter().map(Ok),
            )
            .chain(futures_util::stream::pending())
            .boxed()),
            Some(ChatScript::Reject(msg)) => Err(BackendError::Api(msg)),
            None => Err(BackendError::Api("no chat scripted".to_string())),
        }
    }

    async fn upload(&self, _document: &Document) -> Result<UploadAck, BackendError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_upload.load(Ordering::SeqCst) {
            futures_util::future::pending::<()>().await;
        }
        self.upload
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(BackendError::Api("no upload scripted".to_string())))
    }

    async fn status(&self) -> Result<StatusResponse, BackendError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_status.load(Ordering::SeqCst) {
            futures_util::future::pending::<()>().await;
        }
        if let Some(next) = self.statuses.lock().unwrap().pop_front() {
            return next;
        }
        self.steady_status
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BackendError::Api("no status scripted".to_string()))
    }

    async fn clear(&self) -> Result<ClearResponse, BackendError> {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ClearResponse {
            message: Some("all documents cleared".to_string()),
            status: Some("success".to_string()),
        })
    }
}
