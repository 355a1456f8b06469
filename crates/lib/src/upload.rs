//! Document upload: client-side validation, the upload POST, and polling until indexed.
//!
//! Every path leaves a system message in the session describing what happened. Readiness is
//! cleared before the POST (the backend drops earlier documents on upload) and set again only
//! when the poller reports completion.

use crate::backend::{self, Backend, BackendError, UploadAck};
use crate::config::{Config, UploadConfig};
use crate::poller::{
    CancelToken, PollOutcome, PollPolicy, PollProgress, ProgressSnapshot, UploadJob,
    UploadPoller,
};
use crate::session::ChatSession;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

pub const PDF_CONTENT_TYPE: &str = "application/pdf";
const OCTET_STREAM: &str = "application/octet-stream";

/// A file read into memory, ready to send.
#[derive(Debug, Clone)]
pub struct Document {
    file_name: String,
    content_type: String,
    bytes: Vec<u8>,
}

impl Document {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// Read a file from disk. The content type is derived from the extension.
    pub async fn from_path(path: &Path) -> Result<Self, UploadError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| UploadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let is_pdf = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        let content_type = if is_pdf { PDF_CONTENT_TYPE } else { OCTET_STREAM };
        Ok(Self::new(file_name, content_type, bytes))
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Only PDF files are supported ('{0}' is not a PDF).")]
    NotPdf(String),
    #[error("File size cannot exceed {} MB ('{file_name}' is {size} bytes).", .max / (1024 * 1024))]
    TooLarge {
        file_name: String,
        size: u64,
        max: u64,
    },
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Client-side checks run before any network call.
pub fn validate(document: &Document, max_bytes: u64) -> Result<(), UploadError> {
    if !document.content_type.to_ascii_lowercase().contains("pdf") {
        return Err(UploadError::NotPdf(document.file_name.clone()));
    }
    let size = document.len() as u64;
    if size > max_bytes {
        return Err(UploadError::TooLarge {
            file_name: document.file_name.clone(),
            size,
            max: max_bytes,
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub max_bytes: u64,
    /// Deadline for the upload POST itself.
    pub timeout: Duration,
    pub policy: PollPolicy,
}

impl Default for UploadOptions {
    fn default() -> Self {
        let upload = UploadConfig::default();
        Self {
            max_bytes: upload.max_bytes,
            timeout: Duration::from_secs(600),
            policy: PollPolicy::from_config(&upload),
        }
    }
}

impl UploadOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_bytes: config.upload.max_bytes,
            timeout: config.backend.request_timeout(),
            policy: PollPolicy::from_config(&config.upload),
        }
    }
}

/// How an accepted upload ended. Validation failures are `Err(UploadError)` instead.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// Indexed and the query engine is ready; chat is allowed.
    Ready,
    Failed(String),
    /// Gave up waiting (POST deadline or poll ceiling); the server may still finish.
    StillProcessing(Option<ProgressSnapshot>),
    /// The backend could not be reached while polling.
    Unreachable(String),
    Cancelled,
}

/// Validate, upload and wait for `document` to be indexed.
///
/// Validation failures are reported as a system message and returned as `Err` without any
/// network call. Everything after that is reported in the returned outcome.
pub async fn upload_document<B: Backend + ?Sized>(
    session: &mut ChatSession,
    backend: &B,
    document: &Document,
    options: &UploadOptions,
    cancel: &CancelToken,
    on_progress: &mut (dyn FnMut(&PollProgress) + Send),
) -> Result<UploadOutcome, UploadError> {
    if let Err(e) = validate(document, options.max_bytes) {
        log::info!("rejected upload of {}: {}", document.file_name(), e);
        session.append_system_message(e.to_string(), true);
        return Err(e);
    }

    let name = document.file_name().to_string();
    session.set_upload_ready(false);
    session.append_system_message(
        format!(
            "Replacing previous documents with \"{}\"... this may take a few seconds.",
            name
        ),
        false,
    );
    log::info!("uploading {} ({} bytes)", name, document.len());

    let deadline = Instant::now() + options.timeout;
    let posted = tokio::select! {
        _ = cancel.cancelled() => {
            log::info!("upload of {} cancelled before acknowledgement", name);
            session.append_system_message(stopped_waiting_message(&name), false);
            return Ok(UploadOutcome::Cancelled);
        }
        posted = backend::until_deadline(deadline, backend.upload(document)) => posted,
    };
    let ack = match posted {
        Ok(ack) => ack,
        Err(BackendError::TimedOut) => {
            session.append_system_message(
                format!(
                    "Uploading \"{}\" timed out. The server may still be processing it; check the status later.",
                    name
                ),
                true,
            );
            return Ok(UploadOutcome::StillProcessing(None));
        }
        Err(e) => {
            let error = match e {
                BackendError::Api(message) => message,
                other => other.to_string(),
            };
            session.append_system_message(format!("Upload failed: {}", error), true);
            return Ok(UploadOutcome::Failed(error));
        }
    };

    Ok(settle(session, backend, &name, ack, options, cancel, on_progress).await)
}

async fn settle<B: Backend + ?Sized>(
    session: &mut ChatSession,
    backend: &B,
    name: &str,
    ack: UploadAck,
    options: &UploadOptions,
    cancel: &CancelToken,
    on_progress: &mut (dyn FnMut(&PollProgress) + Send),
) -> UploadOutcome {
    if let Some(error) = ack.error.filter(|e| !e.trim().is_empty()) {
        session.append_system_message(format!("Upload failed: {}", error), true);
        return UploadOutcome::Failed(error);
    }
    if !ack.processing {
        session.set_upload_ready(true);
        session.append_system_message(ready_message(name), false);
        return UploadOutcome::Ready;
    }

    let job_name = ack.filename.unwrap_or_else(|| name.to_string());
    if let Some(message) = ack.message {
        log::info!("upload of {} acknowledged: {}", job_name, message);
    }
    let poller = UploadPoller::new(UploadJob::new(job_name), options.policy.clone());
    match poller.run(backend, cancel, on_progress).await {
        PollOutcome::Completed(_) => {
            session.set_upload_ready(true);
            session.append_system_message(ready_message(name), false);
            UploadOutcome::Ready
        }
        PollOutcome::Failed(error) => {
            session.append_system_message(
                format!("Processing \"{}\" failed: {}", name, error),
                true,
            );
            UploadOutcome::Failed(error)
        }
        PollOutcome::TimedOut(snapshot) => {
            let progress = snapshot
                .map(|s| format!(" Last known progress: {}.", describe_progress(&s)))
                .unwrap_or_default();
            session.append_system_message(
                format!(
                    "\"{}\" is still being processed and may finish later.{}",
                    name, progress
                ),
                true,
            );
            UploadOutcome::StillProcessing(snapshot)
        }
        PollOutcome::Unreachable(error) => {
            session.append_system_message(
                format!(
                    "Lost contact with the server while processing \"{}\": {}",
                    name, error
                ),
                true,
            );
            UploadOutcome::Unreachable(error)
        }
        PollOutcome::Cancelled => {
            session.append_system_message(stopped_waiting_message(name), false);
            UploadOutcome::Cancelled
        }
    }
}

fn stopped_waiting_message(name: &str) -> String {
    format!(
        "Stopped waiting for \"{}\". The server may still finish processing it.",
        name
    )
}

fn ready_message(name: &str) -> String {
    format!(
        "\"{}\" is uploaded and indexed. You can start asking questions about it.",
        name
    )
}

/// One-line summary of backend counters.
pub fn describe_progress(snapshot: &ProgressSnapshot) -> String {
    format!(
        "{}/{} completed, {} processing, {} failed, query engine {}",
        snapshot.completed_files,
        snapshot.total_files,
        snapshot.processing_files,
        snapshot.error_files,
        if snapshot.query_engine_ready {
            "ready"
        } else {
            "initializing"
        }
    )
}

/// POST /api/clear. Readiness is reset whatever the result; the session gets a notice.
pub async fn clear_documents<B: Backend + ?Sized>(
    session: &mut ChatSession,
    backend: &B,
) -> Result<String, BackendError> {
    session.set_upload_ready(false);
    match backend.clear().await {
        Ok(res) => {
            let message = res
                .message
                .unwrap_or_else(|| "All documents cleared.".to_string());
            log::info!("cleared server documents: {}", message);
            session.append_system_message(message.clone(), false);
            Ok(message)
        }
        Err(e) => {
            log::warn!("clearing server documents failed: {}", e);
            session.append_system_message(format!("Clearing documents failed: {}", e), true);
            Err(e)
        }
    }
}
