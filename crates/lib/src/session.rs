//! Chat session state: message history, selected model, and upload readiness.
//!
//! The session is an owned aggregate. The exchange driver and the upload flow borrow it
//! mutably for the duration of their work, so there is no locking here. All mutation goes
//! through the methods below; at most one assistant reply is open (streaming) at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// First message of every session.
pub const GREETING: &str = "Hi! I'm your PDF assistant. I can analyze a PDF, search it, \
summarize the key points and answer questions about it. Pick a model, upload a PDF and \
let's talk about it.";

/// Unique session identifier (opaque string).
pub type SessionId = String;

/// Session-local message id. Ids increase in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    User,
    Assistant,
    System,
}

/// Models the backend can answer with. Wire ids are lowercase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    #[default]
    Gemini,
    Azure,
    Ollama,
}

impl Model {
    pub const ALL: [Model; 3] = [Model::Gemini, Model::Azure, Model::Ollama];

    /// Wire id sent in the chat request body.
    pub fn id(self) -> &'static str {
        match self {
            Model::Gemini => "gemini",
            Model::Azure => "azure",
            Model::Ollama => "ollama",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Model::Gemini => "Gemini",
            Model::Azure => "Azure",
            Model::Ollama => "Ollama",
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Model {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Model::ALL
            .into_iter()
            .find(|m| m.id().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let ids: Vec<&str> = Model::ALL.iter().map(|m| m.id()).collect();
                format!("unknown model '{}' (expected one of: {})", s, ids.join(", "))
            })
    }
}

/// One retrieved passage the answer was grounded on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub file_name: String,
    pub page: Option<u32>,
    pub score: Option<f64>,
}

/// A message in the session. Fields are read through accessors; mutation goes through [`ChatSession`].
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: MessageId,
    sender: Sender,
    text: String,
    sources: Vec<Source>,
    is_streaming: bool,
    is_error: bool,
    model: Option<Model>,
    created_at: DateTime<Utc>,
}

impl Message {
    fn new(id: MessageId, sender: Sender, text: String) -> Self {
        Self {
            id,
            sender,
            text,
            sources: Vec::new(),
            is_streaming: false,
            is_error: false,
            model: None,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn sender(&self) -> Sender {
        self.sender
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    /// Model that produced an assistant reply.
    pub fn model(&self) -> Option<Model> {
        self.model
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Partial update to an open reply. `None` leaves the field as it is.
#[derive(Debug, Clone, Default)]
pub struct StreamUpdate {
    pub text: Option<String>,
    pub sources: Option<Vec<Source>>,
}

/// How an open reply is closed.
#[derive(Debug, Clone)]
pub enum ReplyClose {
    /// Final text and sources as accumulated by the assembler.
    Completed { text: String, sources: Vec<Source> },
    /// The exchange failed; the text is replaced by this message.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("message {0} not found")]
    UnknownMessage(MessageId),
    #[error("message {0} is not streaming")]
    NotStreaming(MessageId),
    #[error("reply {0} is still streaming")]
    ExchangeInFlight(MessageId),
}

/// One chat session: ordered message history, selected model, and readiness flag.
#[derive(Debug, Clone)]
pub struct ChatSession {
    id: SessionId,
    messages: Vec<Message>,
    selected_model: Model,
    upload_ready: bool,
    next_id: u64,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new(Model::default())
    }
}

impl ChatSession {
    /// Create a session seeded with the assistant greeting.
    pub fn new(model: Model) -> Self {
        let mut session = Self {
            id: format!("sess-{}", uuid::Uuid::new_v4()),
            messages: Vec::new(),
            selected_model: model,
            upload_ready: false,
            next_id: 1,
        };
        session.seed_greeting();
        session
    }

    fn seed_greeting(&mut self) {
        let id = self.allocate_id();
        self.messages
            .push(Message::new(id, Sender::Assistant, GREETING.to_string()));
    }

    fn allocate_id(&mut self) -> MessageId {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn selected_model(&self) -> Model {
        self.selected_model
    }

    pub fn select_model(&mut self, model: Model) {
        log::debug!("session {}: model set to {}", self.id, model);
        self.selected_model = model;
    }

    pub fn upload_ready(&self) -> bool {
        self.upload_ready
    }

    pub fn set_upload_ready(&mut self, ready: bool) {
        if self.upload_ready != ready {
            log::debug!("session {}: upload ready = {}", self.id, ready);
        }
        self.upload_ready = ready;
    }

    /// The reply currently being streamed, if any.
    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.is_streaming)
    }

    pub fn append_user_message(&mut self, text: impl Into<String>) -> MessageId {
        let id = self.allocate_id();
        self.messages.push(Message::new(id, Sender::User, text.into()));
        id
    }

    /// Append a closed system notice (upload progress, validation failures, etc.).
    pub fn append_system_message(&mut self, text: impl Into<String>, is_error: bool) -> MessageId {
        let id = self.allocate_id();
        let mut message = Message::new(id, Sender::System, text.into());
        message.is_error = is_error;
        self.messages.push(message);
        id
    }

    /// Open an empty assistant reply for the selected model. Fails if another reply is still open.
    pub fn begin_assistant_reply(&mut self) -> Result<MessageId, SessionError> {
        if let Some(open) = self.streaming_message() {
            return Err(SessionError::ExchangeInFlight(open.id));
        }
        let id = self.allocate_id();
        let mut message = Message::new(id, Sender::Assistant, String::new());
        message.is_streaming = true;
        message.model = Some(self.selected_model);
        self.messages.push(message);
        Ok(id)
    }

    pub fn apply_stream_update(
        &mut self,
        id: MessageId,
        update: StreamUpdate,
    ) -> Result<(), SessionError> {
        let message = self.open_reply_mut(id)?;
        if let Some(text) = update.text {
            message.text = text;
        }
        if let Some(sources) = update.sources {
            message.sources = sources;
        }
        Ok(())
    }

    /// Close an open reply. After this the message text no longer changes.
    pub fn close_assistant_reply(
        &mut self,
        id: MessageId,
        close: ReplyClose,
    ) -> Result<(), SessionError> {
        let message = self.open_reply_mut(id)?;
        match close {
            ReplyClose::Completed { text, sources } => {
                message.text = text;
                message.sources = sources;
            }
            ReplyClose::Failed(error) => {
                message.text = error;
                message.is_error = true;
            }
        }
        message.is_streaming = false;
        Ok(())
    }

    /// Drop the history back to the greeting and clear readiness. The selected model is kept.
    pub fn reset_session(&mut self) {
        log::info!("session {}: reset", self.id);
        self.messages.clear();
        self.upload_ready = false;
        self.seed_greeting();
    }

    fn open_reply_mut(&mut self, id: MessageId) -> Result<&mut Message, SessionError> {
        let message = self
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(SessionError::UnknownMessage(id))?;
        if !message.is_streaming {
            return Err(SessionError::NotStreaming(id));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str, page: u32) -> Source {
        Source {
            file_name: name.to_string(),
            page: Some(page),
            score: Some(0.5),
        }
    }

    #[test]
    fn new_session_has_greeting_and_is_not_ready() {
        let session = ChatSession::new(Model::Azure);
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].sender(), Sender::Assistant);
        assert_eq!(session.messages()[0].text(), GREETING);
        assert!(!session.upload_ready());
        assert_eq!(session.selected_model(), Model::Azure);
        assert!(session.id().starts_with("sess-"));
    }

    #[test]
    fn only_one_reply_can_stream() {
        let mut session = ChatSession::default();
        session.append_user_message("hi");
        let first = session.begin_assistant_reply().unwrap();
        assert_eq!(
            session.begin_assistant_reply(),
            Err(SessionError::ExchangeInFlight(first))
        );
        session
            .close_assistant_reply(
                first,
                ReplyClose::Completed {
                    text: "done".into(),
                    sources: vec![],
                },
            )
            .unwrap();
        let second = session.begin_assistant_reply().unwrap();
        assert!(second > first);
        let streaming: Vec<_> = session.messages().iter().filter(|m| m.is_streaming()).collect();
        assert_eq!(streaming.len(), 1);
    }

    #[test]
    fn stream_update_replaces_sources_instead_of_merging() {
        let mut session = ChatSession::default();
        let id = session.begin_assistant_reply().unwrap();
        session
            .apply_stream_update(
                id,
                StreamUpdate {
                    text: Some("A".into()),
                    sources: Some(vec![source("a.pdf", 1), source("b.pdf", 2)]),
                },
            )
            .unwrap();
        session
            .apply_stream_update(
                id,
                StreamUpdate {
                    text: None,
                    sources: Some(vec![source("c.pdf", 3)]),
                },
            )
            .unwrap();
        let message = session.message(id).unwrap();
        assert_eq!(message.text(), "A");
        assert_eq!(message.sources(), &[source("c.pdf", 3)]);
    }

    #[test]
    fn closed_reply_is_frozen() {
        let mut session = ChatSession::default();
        let id = session.begin_assistant_reply().unwrap();
        session
            .close_assistant_reply(id, ReplyClose::Failed("boom".into()))
            .unwrap();
        let message = session.message(id).unwrap();
        assert!(message.is_error());
        assert!(!message.is_streaming());
        assert_eq!(message.text(), "boom");
        assert_eq!(
            session.apply_stream_update(
                id,
                StreamUpdate {
                    text: Some("late".into()),
                    sources: None
                }
            ),
            Err(SessionError::NotStreaming(id))
        );
        assert_eq!(session.message(id).unwrap().text(), "boom");
    }

    #[test]
    fn reset_keeps_model_and_drops_history() {
        let mut session = ChatSession::default();
        session.select_model(Model::Ollama);
        session.set_upload_ready(true);
        session.append_user_message("question");
        session.append_system_message("uploaded", false);
        session.reset_session();
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].text(), GREETING);
        assert!(!session.upload_ready());
        assert_eq!(session.selected_model(), Model::Ollama);
    }

    #[test]
    fn model_parses_case_insensitively() {
        assert_eq!("Gemini".parse::<Model>(), Ok(Model::Gemini));
        assert_eq!(" ollama ".parse::<Model>(), Ok(Model::Ollama));
        let err = "gpt".parse::<Model>().unwrap_err();
        assert!(err.contains("gemini, azure, ollama"));
    }
}
