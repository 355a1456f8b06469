//! One chat exchange: user message in, streamed assistant reply out.
//!
//! The reply is always closed before [`send_message`] returns, whatever happened on the wire.
//! Failures after submission are not `Err`: they close the reply with an error text and are
//! reported in [`ExchangeOutcome`]. The stream itself is never retried.

use crate::assembler::{AssembleError, Flow, StreamAssembler};
use crate::backend::{self, Backend, BackendError, ChatRequest};
use crate::config::Config;
use crate::session::{ChatSession, MessageId, ReplyClose, SessionError};
use crate::sse;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::time::Instant;

/// Submission policy and transport deadline for chat.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Refuse to submit until an upload has completed.
    pub require_upload: bool,
    /// Wall-clock bound on the whole exchange, from request to last frame.
    pub timeout: Duration,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            require_upload: true,
            timeout: Duration::from_secs(600),
        }
    }
}

impl ChatOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            require_upload: config.chat.require_upload,
            timeout: config.backend.request_timeout(),
        }
    }
}

/// Reasons a message is refused before anything is sent.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("upload a PDF document before asking questions")]
    UploadRequired,
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Why an exchange ended with an error reply.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Transport(BackendError),
    #[error("{0}")]
    Server(String),
}

impl ExchangeError {
    /// Text shown in place of the reply.
    pub fn user_message(&self) -> String {
        match self {
            ExchangeError::Transport(BackendError::TimedOut) => {
                "The request timed out. The server may still be working on it; please try again later."
                    .to_string()
            }
            ExchangeError::Transport(e) => format!(
                "Sorry, an error occurred: {}. Please check your network connection or try again later.",
                e
            ),
            ExchangeError::Server(message) => message.clone(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExchangeError::Transport(BackendError::TimedOut))
    }
}

#[derive(Debug)]
pub enum ReplyStatus {
    /// The backend sent `status: "complete"`.
    Completed,
    /// The body ended without a terminal status; the reply was closed with what arrived.
    Truncated,
    Failed(ExchangeError),
}

#[derive(Debug)]
pub struct ExchangeOutcome {
    pub user_message: MessageId,
    pub reply: MessageId,
    pub status: ReplyStatus,
}

/// Submit `text` and stream the reply into `session`. `on_chunk` sees each text delta as it arrives.
pub async fn send_message<B: Backend + ?Sized>(
    session: &mut ChatSession,
    backend: &B,
    text: &str,
    options: &ChatOptions,
    on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
) -> Result<ExchangeOutcome, ChatError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    if options.require_upload && !session.upload_ready() {
        return Err(ChatError::UploadRequired);
    }
    if let Some(open) = session.streaming_message() {
        return Err(SessionError::ExchangeInFlight(open.id()).into());
    }

    let user_message = session.append_user_message(text);
    let reply = session.begin_assistant_reply()?;
    let request = ChatRequest {
        message: text.to_string(),
        model: session.selected_model(),
    };
    log::info!(
        "session {}: sending message {} ({} model)",
        session.id(),
        user_message,
        request.model
    );

    let deadline = Instant::now() + options.timeout;
    let status = match stream_reply(session, backend, reply, &request, deadline, on_chunk).await {
        Ok(status) => status,
        Err(e) => {
            log::warn!("session {}: reply {} failed: {}", session.id(), reply, e);
            session.close_assistant_reply(reply, ReplyClose::Failed(e.user_message()))?;
            ReplyStatus::Failed(e)
        }
    };
    Ok(ExchangeOutcome {
        user_message,
        reply,
        status,
    })
}

async fn stream_reply<B: Backend + ?Sized>(
    session: &mut ChatSession,
    backend: &B,
    reply: MessageId,
    request: &ChatRequest,
    deadline: Instant,
    on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
) -> Result<ReplyStatus, ExchangeError> {
    let body = backend::until_deadline(deadline, backend.chat_stream(request))
        .await
        .map_err(ExchangeError::Transport)?;
    let frames = sse::decode(backend::stream_until_deadline(body, deadline));
    futures_util::pin_mut!(frames);

    let mut assembler = StreamAssembler::new(reply);
    let mut count = 0usize;
    while let Some(frame) = frames.next().await {
        let frame = frame.map_err(ExchangeError::Transport)?;
        count += 1;
        match assembler.apply(session, frame, on_chunk) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Done) => {
                log::debug!("reply {}: complete after {} frames", reply, count);
                return Ok(ReplyStatus::Completed);
            }
            Err(AssembleError::Server(message)) => return Err(ExchangeError::Server(message)),
            Err(AssembleError::Session(e)) => {
                return Err(ExchangeError::Server(e.to_string()));
            }
        }
    }
    log::debug!(
        "reply {}: stream ended without status after {} frames",
        reply,
        count
    );
    assembler
        .finish(session)
        .map_err(|e| ExchangeError::Server(e.to_string()))?;
    Ok(ReplyStatus::Truncated)
}
