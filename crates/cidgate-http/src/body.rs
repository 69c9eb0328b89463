//! Gateway response body types supporting buffered, streaming, and empty modes.
//!
//! This module provides [`GatewayBody`], the HTTP response body type used
//! throughout the gateway service. It supports three modes:
//!
//! - **Buffered**: error pages, HTML listings, converted IPLD documents.
//! - **Streaming**: file content, CAR and TAR archives. Archive streams end
//!   with an `X-Stream-Error` trailer when their writer failed after the
//!   status line was already sent.
//! - **Empty**: HEAD responses, redirects, 304s.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use cidgate_core::ExportStream;
use futures::{Stream, StreamExt};
use http::HeaderValue;
use http_body::Frame;
use http_body_util::Full;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// Trailer announcing that a streamed archive is incomplete.
pub const STREAM_ERROR_TRAILER: &str = "x-stream-error";

type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame<Bytes>, std::io::Error>> + Send>>;

/// Gateway response body.
///
/// Implements [`http_body::Body`] so it can be used directly with hyper responses.
#[derive(Default)]
pub enum GatewayBody {
    /// Fully buffered payload.
    Buffered(Full<Bytes>),
    /// Frames produced on demand.
    Streaming(FrameStream),
    /// No payload.
    #[default]
    Empty,
}

impl fmt::Debug for GatewayBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered(full) => f.debug_tuple("Buffered").field(full).finish(),
            Self::Streaming(_) => f.write_str("Streaming"),
            Self::Empty => f.write_str("Empty"),
        }
    }
}

impl GatewayBody {
    /// Create a buffered body from bytes.
    #[must_use]
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::Buffered(Full::new(data.into()))
    }

    /// Create a buffered body from a UTF-8 string.
    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self::Buffered(Full::new(Bytes::from(s.into())))
    }

    /// Create an empty body.
    #[must_use]
    pub fn empty() -> Self {
        Self::Empty
    }

    /// Stream everything a reader yields.
    pub fn from_reader(reader: impl AsyncRead + Send + 'static) -> Self {
        let frames = ReaderStream::new(reader).map(|chunk| chunk.map(Frame::data));
        Self::Streaming(Box::pin(frames))
    }

    /// Stream a background export, reporting late failures as a trailer.
    ///
    /// The export's cancellation guard lives inside the body, so dropping the
    /// response stops the writer.
    #[must_use]
    pub fn from_export(export: ExportStream) -> Self {
        let ExportStream {
            reader,
            done,
            cancel,
        } = export;

        let data = ReaderStream::new(reader).map(|chunk| chunk.map(Frame::data));
        let trailer = futures::stream::once(async move {
            let _guard = cancel;
            match done.await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some("stream writer exited without reporting".to_owned()),
            }
        })
        .filter_map(|message| async move {
            message.map(|m| Ok::<_, std::io::Error>(stream_error_frame(&m)))
        });

        Self::Streaming(Box::pin(data.chain(trailer)))
    }
}

fn stream_error_frame(message: &str) -> Frame<Bytes> {
    let mut trailers = http::HeaderMap::new();
    let value = HeaderValue::from_str(message)
        .unwrap_or_else(|_| HeaderValue::from_static("stream aborted"));
    trailers.insert(STREAM_ERROR_TRAILER, value);
    Frame::trailers(trailers)
}

impl http_body::Body for GatewayBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            Self::Buffered(full) => Pin::new(full)
                .poll_frame(cx)
                .map_err(|never| match never {}),
            Self::Streaming(stream) => stream.as_mut().poll_next(cx),
            Self::Empty => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            Self::Buffered(full) => full.is_end_stream(),
            Self::Streaming(_) => false,
            Self::Empty => true,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self {
            Self::Buffered(full) => full.size_hint(),
            Self::Streaming(_) => http_body::SizeHint::default(),
            Self::Empty => http_body::SizeHint::with_exact(0),
        }
    }
}
