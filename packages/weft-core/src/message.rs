//! Message payloads: buffered or streamed, one-shot unless explicitly buffered.
//!
//! A [`Message`] wraps a single underlying source. Buffered bodies can be read
//! any number of times; a streamed body is handed out exactly once, after
//! which the message is consumed and further reads fail with
//! [`MessageError::AlreadyConsumed`]. Dropping a message closes the
//! underlying resource on every exit path.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Boxed byte-stream source for streamed message bodies.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

// ---------------------------------------------------------------------------
// MessageError
// ---------------------------------------------------------------------------

/// Errors from reading or buffering a message body.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The one-shot body was already handed out or fully read.
    #[error("message body already consumed")]
    AlreadyConsumed,
    /// The underlying stream failed.
    #[error("message stream error: {0}")]
    Io(#[from] io::Error),
    /// The body is not valid UTF-8 and was requested as text.
    #[error("message body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

enum Body {
    /// Repeatable in-memory body. Every read gets a fresh cursor.
    Buffered(Bytes),
    /// One-shot streamed body; `size` is `None` for unbounded sources.
    Stream { reader: BoxReader, size: Option<u64> },
    /// A one-shot body that has been handed out or fully read.
    Consumed,
}

/// A lazily-materialized message payload.
///
/// Ownership transfers to whichever consumer performs the terminal read.
/// A message produced on one task may be consumed on another, but a single
/// open reader must never be polled by two tasks concurrently.
pub struct Message {
    body: Body,
}

impl Message {
    /// Creates a repeatable message over an in-memory buffer.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            body: Body::Buffered(bytes.into()),
        }
    }

    /// Creates a repeatable message from text.
    pub fn from_string(text: impl Into<String>) -> Self {
        Self::from_bytes(text.into().into_bytes())
    }

    /// Creates an empty repeatable message.
    #[must_use]
    pub fn nil() -> Self {
        Self::from_bytes(Bytes::new())
    }

    /// Creates a one-shot message over a byte stream.
    ///
    /// `size` is the total byte count when known; pass `None` for unbounded
    /// sources.
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static, size: Option<u64>) -> Self {
        Self {
            body: Body::Stream {
                reader: Box::new(reader),
                size,
            },
        }
    }

    /// Whether this message can be read more than once.
    #[must_use]
    pub fn is_repeatable(&self) -> bool {
        matches!(self.body, Body::Buffered(_))
    }

    /// Whether the one-shot body has already been handed out.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        matches!(self.body, Body::Consumed)
    }

    /// Total body size in bytes, or `None` when the source is unbounded.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        match &self.body {
            Body::Buffered(bytes) => Some(bytes.len() as u64),
            Body::Stream { size, .. } => *size,
            Body::Consumed => None,
        }
    }

    /// Terminal stream read.
    ///
    /// A buffered body yields a fresh cursor on every call. A streamed body
    /// is handed over exactly once; this message then reports consumed.
    ///
    /// # Errors
    ///
    /// [`MessageError::AlreadyConsumed`] if the one-shot body was already
    /// handed out.
    pub fn as_reader(&mut self) -> Result<BoxReader, MessageError> {
        match std::mem::replace(&mut self.body, Body::Consumed) {
            Body::Buffered(bytes) => {
                self.body = Body::Buffered(bytes.clone());
                Ok(Box::new(io::Cursor::new(bytes)))
            }
            Body::Stream { reader, .. } => Ok(reader),
            Body::Consumed => Err(MessageError::AlreadyConsumed),
        }
    }

    /// Fully materializes the body as bytes.
    ///
    /// Repeatable bodies answer repeatedly; a streamed body is drained and
    /// the message is consumed afterwards.
    ///
    /// # Errors
    ///
    /// Fails on an already-consumed one-shot body or on stream errors.
    pub async fn read_to_bytes(&mut self) -> Result<Bytes, MessageError> {
        match std::mem::replace(&mut self.body, Body::Consumed) {
            Body::Buffered(bytes) => {
                self.body = Body::Buffered(bytes.clone());
                Ok(bytes)
            }
            Body::Stream { mut reader, .. } => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            Body::Consumed => Err(MessageError::AlreadyConsumed),
        }
    }

    /// Fully materializes the body as a UTF-8 string.
    ///
    /// # Errors
    ///
    /// Fails on an already-consumed one-shot body, stream errors, or
    /// non-UTF-8 content.
    pub async fn read_to_string(&mut self) -> Result<String, MessageError> {
        let bytes = self.read_to_bytes().await?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    /// Drains a streamed body into an in-memory buffer, making the message
    /// repeatable. The only way to get multiple independent readers.
    ///
    /// # Errors
    ///
    /// Fails on an already-consumed body or on stream errors.
    pub async fn make_repeatable(&mut self) -> Result<(), MessageError> {
        if self.is_repeatable() {
            return Ok(());
        }
        let bytes = self.read_to_bytes().await?;
        self.body = Body::Buffered(bytes);
        Ok(())
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.body {
            Body::Buffered(bytes) => f
                .debug_struct("Message")
                .field("repeatable", &true)
                .field("size", &bytes.len())
                .finish(),
            Body::Stream { size, .. } => f
                .debug_struct("Message")
                .field("repeatable", &false)
                .field("size", size)
                .finish(),
            Body::Consumed => f.debug_struct("Message").field("consumed", &true).finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// TeeReader
// ---------------------------------------------------------------------------

enum TeeState {
    /// Pulling bytes from the inner reader.
    Reading,
    /// Inner reader hit EOF; shutting the mirror sink down so its far end
    /// observes end-of-stream.
    Shutdown,
    /// EOF delivered and mirror shut down.
    Done,
}

/// An [`AsyncRead`] adapter mirroring every byte read into an [`AsyncWrite`]
/// sink.
///
/// Sink backpressure propagates to the reader: when the sink is full the read
/// returns `Pending` and the consumer blocks; it never fails on backpressure.
/// A sink write error (the far end dropped the pipe) surfaces as a read
/// error. At inner EOF the sink is shut down before EOF is reported, so the
/// mirror side observes exactly the bytes the consumer read.
pub struct TeeReader<R, W> {
    reader: R,
    writer: W,
    /// Bytes handed to the consumer but not yet fully mirrored.
    pending: Vec<u8>,
    written: usize,
    state: TeeState,
}

impl<R, W> TeeReader<R, W> {
    /// Wraps `reader`, mirroring everything read from it into `writer`.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            pending: Vec::new(),
            written: 0,
            state: TeeState::Reading,
        }
    }
}

impl<R, W> AsyncRead for TeeReader<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            // Bytes owed to the mirror are flushed before anything else, so a
            // slow mirror consumer backpressures this reader.
            while this.written < this.pending.len() {
                match Pin::new(&mut this.writer).poll_write(cx, &this.pending[this.written..]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "mirror sink accepted no bytes",
                        )));
                    }
                    Poll::Ready(Ok(n)) => this.written += n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
            this.pending.clear();
            this.written = 0;

            match this.state {
                TeeState::Done => return Poll::Ready(Ok(())),
                TeeState::Shutdown => match Pin::new(&mut this.writer).poll_shutdown(cx) {
                    Poll::Ready(_) => {
                        this.state = TeeState::Done;
                        return Poll::Ready(Ok(()));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                TeeState::Reading => {
                    let before = buf.filled().len();
                    match Pin::new(&mut this.reader).poll_read(cx, buf) {
                        Poll::Ready(Ok(())) => {
                            let chunk = &buf.filled()[before..];
                            if chunk.is_empty() {
                                // Inner EOF: close the mirror before
                                // reporting EOF to the consumer.
                                this.state = TeeState::Shutdown;
                                continue;
                            }
                            this.pending.extend_from_slice(chunk);
                            return Poll::Ready(Ok(()));
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
