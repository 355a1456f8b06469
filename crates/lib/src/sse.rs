//! SSE frame decoding for the chat stream.
//!
//! The backend writes `data: <json>` lines. Bytes are buffered until a newline arrives, so a
//! line split across network chunks is decoded once, whole. Each payload is validated into a
//! [`StreamFrame`] here; nothing downstream looks at raw JSON.

use crate::backend::{BackendError, ByteStream};
use crate::session::Source;
use futures_util::Stream;
use serde::{Deserialize, Deserializer};
use std::collections::VecDeque;

const DATA_PREFIX: &str = "data: ";

/// Used when the backend reports `status: "error"` without a message.
pub const UNKNOWN_ERROR: &str = "unknown error";

/// One decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// The backend reported an error for this exchange (`error` field or `status: "error"`).
    Failed(String),
    /// Incremental content. `complete` marks the end of the exchange.
    Update {
        chunk: Option<String>,
        sources: Option<Vec<Source>>,
        complete: bool,
    },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    chunk: Option<String>,
    #[serde(default)]
    sources: Option<Vec<Source>>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl From<RawFrame> for StreamFrame {
    fn from(raw: RawFrame) -> Self {
        if let Some(error) = raw.error.filter(|e| !e.is_empty()) {
            return StreamFrame::Failed(error);
        }
        match raw.status.as_deref() {
            Some("error") => StreamFrame::Failed(UNKNOWN_ERROR.to_string()),
            status => StreamFrame::Update {
                chunk: raw.chunk.filter(|c| !c.is_empty()),
                sources: raw.sources,
                complete: status == Some("complete"),
            },
        }
    }
}

/// Source entries arrive either as full objects or, from older backends, as bare file names.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawSource {
    Name(String),
    Detail {
        #[serde(default, alias = "fileName", alias = "filename")]
        file_name: Option<String>,
        #[serde(default)]
        page: Option<RawPage>,
        #[serde(default, alias = "relevance_score")]
        score: Option<f64>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPage {
    Number(u32),
    Text(String),
}

impl From<RawSource> for Source {
    fn from(raw: RawSource) -> Self {
        match raw {
            RawSource::Name(file_name) => Source {
                file_name,
                page: None,
                score: None,
            },
            RawSource::Detail {
                file_name,
                page,
                score,
            } => Source {
                file_name: file_name.unwrap_or_else(|| "unknown file".to_string()),
                page: page.and_then(|p| match p {
                    RawPage::Number(n) => Some(n),
                    RawPage::Text(s) => s.trim().parse().ok(),
                }),
                score,
            },
        }
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RawSource::deserialize(deserializer).map(Source::from)
    }
}

/// Incremental line splitter. Holds the trailing partial line between pushes.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the frames of every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(i) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=i).collect();
            if let Some(frame) = decode_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// End of input: decode whatever is left as a final, unterminated line.
    pub fn finish(&mut self) -> Option<StreamFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<StreamFrame> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(&['\n', '\r'][..]);
    let payload = line.strip_prefix(DATA_PREFIX)?;
    if payload.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<RawFrame>(payload) {
        Ok(raw) => Some(raw.into()),
        Err(e) => {
            log::warn!("dropping malformed SSE payload ({}): {}", e, payload);
            None
        }
    }
}

struct DecodeState {
    bytes: Option<ByteStream>,
    decoder: SseDecoder,
    pending: VecDeque<StreamFrame>,
}

/// Decode a response body into frames. Transport errors are passed through and end the sequence.
pub fn decode(bytes: ByteStream) -> impl Stream<Item = Result<StreamFrame, BackendError>> + Send {
    let state = DecodeState {
        bytes: Some(bytes),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
    };
    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(frame) = st.pending.pop_front() {
                return Some((Ok(frame), st));
            }
            let bytes = st.bytes.as_mut()?;
            match futures_util::StreamExt::next(bytes).await {
                Some(Ok(chunk)) => st.pending.extend(st.decoder.push(&chunk)),
                Some(Err(e)) => {
                    st.bytes = None;
                    return Some((Err(e), st));
                }
                None => {
                    st.bytes = None;
                    st.pending.extend(st.decoder.finish());
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    const BODY: &str = "data: {\"chunk\": \"Hel\", \"status\": \"streaming\"}\n\n\
        : keep-alive\n\
        data: {\"chunk\": \"lo 世界\", \"status\": \"streaming\"}\n\n\
        event: ignored\n\
        data: {\"chunk\": \"\\n\\n📖 Sources:\", \"sources\": [{\"file_name\": \"x.pdf\", \"page\": 2, \"score\": 0.9}], \"status\": \"sources\"}\n\n\
        data: {\"status\": \"complete\"}\n\n";

    fn decode_all(chunks: &[&[u8]]) -> Vec<StreamFrame> {
        let mut decoder = SseDecoder::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            frames.extend(decoder.push(chunk));
        }
        frames.extend(decoder.finish());
        frames
    }

    fn decode_strs(chunks: &[&str]) -> Vec<StreamFrame> {
        let bytes: Vec<&[u8]> = chunks.iter().map(|c| c.as_bytes()).collect();
        decode_all(&bytes)
    }

    fn chunk(text: &str) -> StreamFrame {
        StreamFrame::Update {
            chunk: Some(text.to_string()),
            sources: None,
            complete: false,
        }
    }

    #[test]
    fn decodes_frames_in_order() {
        let frames = decode_all(&[BODY.as_bytes()]);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0], chunk("Hel"));
        assert_eq!(frames[1], chunk("lo 世界"));
        let StreamFrame::Update { sources, .. } = &frames[2] else {
            panic!("expected update, got {:?}", frames[2]);
        };
        assert_eq!(
            sources.as_deref(),
            Some(
                &[Source {
                    file_name: "x.pdf".into(),
                    page: Some(2),
                    score: Some(0.9)
                }][..]
            )
        );
        assert_eq!(
            frames[3],
            StreamFrame::Update {
                chunk: None,
                sources: None,
                complete: true
            }
        );
    }

    #[test]
    fn rechunking_never_changes_the_frames() {
        let bytes = BODY.as_bytes();
        let whole = decode_all(&[bytes]);
        for split in 1..bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(decode_all(&[a, b]), whole, "split at byte {}", split);
        }
        for size in [1, 2, 3, 7, 16] {
            let pieces: Vec<&[u8]> = bytes.chunks(size).collect();
            assert_eq!(decode_all(&pieces), whole, "chunks of {} bytes", size);
        }
    }

    #[test]
    fn malformed_payload_is_skipped() {
        let frames = decode_strs(&[
            "data: {\"chunk\": \"A\"}\n",
            "data: {not json}\n",
            "data: [DONE]\n",
            "data: {\"chunk\": \"B\"}\n",
        ]);
        assert_eq!(frames, vec![chunk("A"), chunk("B")]);
    }

    #[test]
    fn lines_without_data_prefix_are_ignored() {
        let frames = decode_strs(&["id: 1\ndata:{\"chunk\":\"no space\"}\nretry: 10\n\n"]);
        assert!(frames.is_empty());
    }

    #[test]
    fn crlf_and_unterminated_last_line_are_decoded() {
        let frames = decode_strs(&["data: {\"chunk\":\"A\"}\r\n\r\ndata: {\"status\":\"complete\"}"]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], chunk("A"));
    }

    #[test]
    fn error_field_and_error_status_become_failed() {
        let frames = decode_strs(&[
            "data: {\"error\": \"model unavailable\", \"status\": \"error\"}\n",
            "data: {\"status\": \"error\"}\n",
            "data: {\"error\": \"\", \"chunk\": \"ok\"}\n",
        ]);
        assert_eq!(
            frames,
            vec![
                StreamFrame::Failed("model unavailable".into()),
                StreamFrame::Failed(UNKNOWN_ERROR.into()),
                chunk("ok"),
            ]
        );
    }

    #[test]
    fn empty_chunk_is_treated_as_absent() {
        let frames = decode_strs(&["data: {\"chunk\": \"\", \"status\": \"streaming\"}\n"]);
        assert_eq!(
            frames,
            vec![StreamFrame::Update {
                chunk: None,
                sources: None,
                complete: false
            }]
        );
    }

    #[test]
    fn sources_are_decoded_leniently() {
        let frames = decode_strs(&[
            "data: {\"sources\": [\"1700000000_a.pdf\", {\"file_name\": \"b.pdf\", \"page\": \"7\"}, {\"page\": \"unknown\"}]}\n",
        ]);
        let StreamFrame::Update {
            sources: Some(sources),
            ..
        } = &frames[0]
        else {
            panic!("expected sources, got {:?}", frames);
        };
        assert_eq!(sources.len(), 3);
        assert_eq!(sources[0].file_name, "1700000000_a.pdf");
        assert_eq!(sources[0].page, None);
        assert_eq!(sources[1].page, Some(7));
        assert_eq!(sources[1].score, None);
        assert_eq!(sources[2].file_name, "unknown file");
        assert_eq!(sources[2].page, None);
    }

    #[tokio::test]
    async fn decode_stream_passes_transport_error_and_stops() {
        let body: ByteStream = futures_util::stream::iter(vec![
            Ok(b"data: {\"chunk\": \"A\"}\ndata: {\"ch".to_vec()),
            Err(BackendError::Api("connection reset".into())),
            Ok(b"unk\": \"B\"}\n".to_vec()),
        ])
        .boxed();
        let items: Vec<_> = decode(body).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &chunk("A"));
        assert!(matches!(items[1], Err(BackendError::Api(_))));
    }

    #[tokio::test]
    async fn decode_stream_joins_split_line() {
        let body: ByteStream = futures_util::stream::iter(vec![
            Ok(b"data: {\"ch".to_vec()),
            Ok(b"unk\": \"A".to_vec()),
            Ok("\u{e9}\"}\n".as_bytes().to_vec()),
        ])
        .boxed();
        let frames: Vec<StreamFrame> = decode(body).map(|f| f.unwrap()).collect().await;
        assert_eq!(frames, vec![chunk("A\u{e9}")]);
    }
}
