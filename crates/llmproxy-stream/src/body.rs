use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures::StreamExt as _;

/// Boxed error produced by a body stream.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An already-open response body delivered incrementally.
pub type ByteStream = Pin<Box<dyn futures::Stream<Item = Result<Bytes, BoxError>> + Send + 'static>>;

/// Adapts a `reqwest` response body.
pub fn from_response(response: reqwest::Response) -> ByteStream {
    Box::pin(
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Box::new(e) as BoxError)),
    )
}

/// Builds a body from in-memory chunks (captured transcripts, fixtures).
pub fn from_chunks<I, B>(chunks: I) -> ByteStream
where
    I: IntoIterator<Item = B>,
    B: Into<Bytes>,
{
    let chunks: Vec<Result<Bytes, BoxError>> = chunks.into_iter().map(|c| Ok(c.into())).collect();
    Box::pin(futures::stream::iter(chunks))
}

/// The three wire formats the remote service streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Server-Sent Events (`text/event-stream`).
    Sse,
    /// One chat envelope per line.
    NdjsonChat,
    /// One structured record per line (start/update/completion/error).
    StructuredJson,
}

impl WireFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sse => "sse",
            Self::NdjsonChat => "ndjson_chat",
            Self::StructuredJson => "structured_json",
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire formats that decode into chat [`StreamEvent`](crate::StreamEvent)s.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChatFormat {
    Sse,
    Ndjson,
}

impl ChatFormat {
    /// Picks the chat format from a `Content-Type` header value.
    ///
    /// `text/event-stream` selects SSE; everything else (including a missing
    /// header) is treated as NDJSON.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let mime = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|m| m.trim().to_ascii_lowercase())
            .unwrap_or_default();
        if mime == "text/event-stream" {
            Self::Sse
        } else {
            Self::Ndjson
        }
    }

    pub fn wire_format(self) -> WireFormat {
        match self {
            Self::Sse => WireFormat::Sse,
            Self::Ndjson => WireFormat::NdjsonChat,
        }
    }

    /// How the collector folds `text_delta` for this format.
    pub fn text_fold(self) -> TextFold {
        match self {
            Self::Sse => TextFold::Append,
            Self::Ndjson => TextFold::Replace,
        }
    }
}

/// Text-delta contract of a chat format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextFold {
    /// Each delta is a new fragment; the aggregate concatenates them.
    Append,
    /// Each delta is the accumulated content so far; the latest one wins.
    Replace,
}
