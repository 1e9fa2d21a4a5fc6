//! Frame extraction over a buffered response body.
//!
//! Both NDJSON formats use line framing; SSE groups lines into blocks
//! terminated by a blank line. Every body read races the session's done
//! signal so a close from another task unblocks a read stuck on a silent
//! socket.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::body::{BoxError, ByteStream, WireFormat};

/// Shared ownership of the response body.
///
/// The reader polls through it; whichever task closes the session drops the
/// body through it, so the connection is released even when nobody is
/// pulling. The lock is only held for a single synchronous poll.
#[derive(Clone)]
pub(crate) struct BodySlot {
    body: Arc<Mutex<Option<ByteStream>>>,
}

impl BodySlot {
    pub fn new(body: ByteStream) -> Self {
        Self {
            body: Arc::new(Mutex::new(Some(body))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ByteStream>> {
        self.body.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops the body. Returns `true` if this call dropped it.
    pub fn release(&self) -> bool {
        let body = self.lock().take();
        body.is_some()
    }

    #[cfg(test)]
    pub fn is_released(&self) -> bool {
        self.lock().is_none()
    }

    /// `Ready(None)` once the body has ended or been released.
    fn poll_next(&self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, BoxError>>> {
        match self.lock().as_mut() {
            Some(body) => body.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

/// Why a read did not produce a frame.
#[derive(Debug)]
pub(crate) enum ReadError {
    /// The session was closed while (or before) reading.
    Aborted,
    /// The body itself failed.
    Body(BoxError),
}

/// One protocol unit before normalization: an SSE block or an NDJSON line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RawFrame {
    /// SSE event name; always empty for line frames.
    pub name: String,
    /// SSE data lines joined by `\n`, or the line without its terminator.
    pub data: Bytes,
}

impl RawFrame {
    /// An SSE keep-alive or a blank line.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.data.iter().all(u8::is_ascii_whitespace)
    }
}

pub(crate) struct FrameReader {
    body: BodySlot,
    buf: BytesMut,
    // Bytes of `buf` already known to contain no newline.
    scanned: usize,
    eof: bool,
    abort: CancellationToken,
}

impl FrameReader {
    pub fn new(body: BodySlot, abort: CancellationToken) -> Self {
        Self {
            body,
            buf: BytesMut::with_capacity(8 * 1024),
            scanned: 0,
            eof: false,
            abort,
        }
    }

    /// Drops the body and any buffered bytes.
    pub fn release(&mut self) {
        self.body.release();
        self.buf.clear();
        self.scanned = 0;
        self.eof = true;
    }

    #[cfg(test)]
    pub fn is_released(&self) -> bool {
        self.body.is_released()
    }

    async fn fill(&mut self) -> Result<(), ReadError> {
        let body = &self.body;
        let next = tokio::select! {
            biased;
            _ = self.abort.cancelled() => None,
            chunk = futures::future::poll_fn(|cx| body.poll_next(cx)) => Some(chunk),
        };
        match next {
            Some(Some(Ok(chunk))) => {
                self.buf.extend_from_slice(&chunk);
                Ok(())
            }
            Some(Some(Err(err))) => {
                self.release();
                Err(ReadError::Body(err))
            }
            None => {
                self.release();
                Err(ReadError::Aborted)
            }
            // A closer cancels the abort token before dropping the body, so an
            // empty slot seen under a cancelled token is an abort, not EOF.
            Some(None) if self.abort.is_cancelled() => {
                self.release();
                Err(ReadError::Aborted)
            }
            Some(None) => {
                self.body.release();
                self.eof = true;
                Ok(())
            }
        }
    }

    /// Returns the next line including its `\n`, or the un-terminated tail at
    /// end of stream.
    pub async fn next_line(&mut self) -> Result<Option<Bytes>, ReadError> {
        loop {
            if self.abort.is_cancelled() {
                self.release();
                return Err(ReadError::Aborted);
            }
            if let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
                let end = self.scanned + offset + 1;
                self.scanned = 0;
                return Ok(Some(self.buf.split_to(end).freeze()));
            }
            self.scanned = self.buf.len();
            if self.eof {
                self.scanned = 0;
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.buf.split().freeze()));
            }
            self.fill().await?;
        }
    }

    /// Line framing for both NDJSON formats.
    pub async fn next_line_frame(&mut self) -> Result<Option<RawFrame>, ReadError> {
        Ok(self.next_line().await?.map(|line| RawFrame {
            name: String::new(),
            data: line.slice(..trim_line_ending(&line).len()),
        }))
    }

    /// SSE framing. Returns empty frames for keep-alives; the caller skips them.
    pub async fn next_sse_frame(&mut self) -> Result<Option<RawFrame>, ReadError> {
        let mut name = String::new();
        let mut data = BytesMut::new();
        let mut has_data = false;
        let mut started = false;
        loop {
            let Some(raw) = self.next_line().await? else {
                return Ok(started.then(|| RawFrame {
                    name,
                    data: data.freeze(),
                }));
            };
            let line = trim_line_ending(&raw);
            if line.is_empty() {
                return Ok(Some(RawFrame {
                    name,
                    data: data.freeze(),
                }));
            }
            started = true;
            if line[0] == b':' {
                continue;
            }
            let (field, value) = split_field(line);
            match field {
                b"event" => name = String::from_utf8_lossy(value).trim().to_string(),
                b"data" => {
                    if has_data {
                        data.extend_from_slice(b"\n");
                    }
                    data.extend_from_slice(value);
                    has_data = true;
                }
                _ => {}
            }
        }
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn split_field(line: &[u8]) -> (&[u8], &[u8]) {
    match line.iter().position(|b| *b == b':') {
        Some(idx) => {
            let value = &line[idx + 1..];
            (&line[..idx], value.strip_prefix(b" ").unwrap_or(value))
        }
        None => (line, &line[line.len()..]),
    }
}

/// Raw frame source for one wire format.
pub(crate) enum RawFrameSource {
    Sse(FrameReader),
    NdjsonChat(FrameReader),
    Structured(FrameReader),
}

impl RawFrameSource {
    pub fn open(format: WireFormat, body: BodySlot, abort: CancellationToken) -> Self {
        let reader = FrameReader::new(body, abort);
        match format {
            WireFormat::Sse => Self::Sse(reader),
            WireFormat::NdjsonChat => Self::NdjsonChat(reader),
            WireFormat::StructuredJson => Self::Structured(reader),
        }
    }

    pub async fn next_frame(&mut self) -> Result<Option<RawFrame>, ReadError> {
        match self {
            Self::Sse(reader) => reader.next_sse_frame().await,
            Self::NdjsonChat(reader) | Self::Structured(reader) => reader.next_line_frame().await,
        }
    }

    pub fn format(&self) -> WireFormat {
        match self {
            Self::Sse(_) => WireFormat::Sse,
            Self::NdjsonChat(_) => WireFormat::NdjsonChat,
            Self::Structured(_) => WireFormat::StructuredJson,
        }
    }

    fn reader_mut(&mut self) -> &mut FrameReader {
        match self {
            Self::Sse(reader) | Self::NdjsonChat(reader) | Self::Structured(reader) => reader,
        }
    }

    pub fn release(&mut self) {
        self.reader_mut().release();
    }
}
