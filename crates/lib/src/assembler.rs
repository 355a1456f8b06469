//! Folds decoded frames into one assistant reply.
//!
//! Text is accumulated in the assembler and written to the message as a whole on every chunk,
//! so the message never depends on reading back its own stale text.

use crate::session::{ChatSession, MessageId, ReplyClose, SessionError, Source, StreamUpdate};
use crate::sse::StreamFrame;

/// What the driver should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The reply is closed; stop reading.
    Done,
}

#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    /// The backend reported an error for this exchange. The message is verbatim.
    #[error("{0}")]
    Server(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Accumulates one reply and applies it to the session.
#[derive(Debug)]
pub struct StreamAssembler {
    message_id: MessageId,
    text: String,
    sources: Vec<Source>,
    closed: bool,
}

impl StreamAssembler {
    pub fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            text: String::new(),
            sources: Vec::new(),
            closed: false,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Apply one frame in arrival order. `on_chunk` sees each text delta.
    ///
    /// Returns `Err(Server)` for error frames; the caller closes the reply with the error.
    /// Frames arriving after the reply was closed are ignored.
    pub fn apply(
        &mut self,
        session: &mut ChatSession,
        frame: StreamFrame,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<Flow, AssembleError> {
        if self.closed {
            log::debug!("reply {}: ignoring frame after close", self.message_id);
            return Ok(Flow::Done);
        }
        let (chunk, sources, complete) = match frame {
            StreamFrame::Failed(error) => return Err(AssembleError::Server(error)),
            StreamFrame::Update {
                chunk,
                sources,
                complete,
            } => (chunk, sources, complete),
        };
        if let Some(chunk) = chunk {
            self.text.push_str(&chunk);
            on_chunk(&chunk);
            session.apply_stream_update(
                self.message_id,
                StreamUpdate {
                    text: Some(self.text.clone()),
                    sources: None,
                },
            )?;
        }
        if let Some(sources) = sources {
            log::debug!("reply {}: {} sources", self.message_id, sources.len());
            self.sources = sources.clone();
            session.apply_stream_update(
                self.message_id,
                StreamUpdate {
                    text: None,
                    sources: Some(sources),
                },
            )?;
        }
        if complete {
            self.finish(session)?;
            return Ok(Flow::Done);
        }
        Ok(Flow::Continue)
    }

    /// Close the reply with everything accumulated so far. Used on `complete` and when the
    /// stream ends without a terminal status.
    pub fn finish(&mut self, session: &mut ChatSession) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        session.close_assistant_reply(
            self.message_id,
            ReplyClose::Completed {
                text: self.text.clone(),
                sources: self.sources.clone(),
            },
        )
    }
}
