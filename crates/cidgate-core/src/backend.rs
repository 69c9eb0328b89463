//! The backend seam.
//!
//! [`GatewayBackend`] is everything the HTTP layer needs from a content
//! store: name resolution, path traversal, and the four ways of reading
//! content (file/directory, whole tree, single block, CAR stream). The HTTP
//! layer holds it as `Arc<dyn GatewayBackend>`, so the trait uses
//! `#[async_trait]` to stay object safe.
//!
//! Cancellation is by dropping the returned future. Long-lived producers
//! (directory listings, CAR streams) stop once their consumer goes away.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use tokio::io::{AsyncRead, AsyncSeek};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::DropGuard;

use crate::error::GatewayError;
use crate::path::{ContentPath, ImmutablePath, PathMetadata};

/// A byte range with an inclusive end, as written in a `Range` header.
///
/// A negative `to` with `from == 0` is a suffix range: the last `-to` bytes.
/// `to == None` reads through the end of the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset.
    pub from: u64,
    /// Last byte offset (inclusive), or a negated suffix length.
    pub to: Option<i64>,
}

impl ByteRange {
    /// The last `len` bytes of the content.
    ///
    /// An empty suffix selects nothing, so it starts past the end of any
    /// content and never resolves.
    #[must_use]
    pub fn suffix(len: u64) -> Self {
        match i64::try_from(len) {
            Ok(0) => Self {
                from: u64::MAX,
                to: None,
            },
            Ok(len) => Self {
                from: 0,
                to: Some(-len),
            },
            Err(_) => Self {
                from: 0,
                to: Some(i64::MIN),
            },
        }
    }

    /// Resolve against the content size into an inclusive `(start, end)`
    /// pair, or `None` if the range is unsatisfiable.
    #[must_use]
    pub fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        if size == 0 {
            return None;
        }
        match self.to {
            Some(to) if to < 0 => {
                let suffix = to.unsigned_abs().min(size);
                Some((size - suffix, size - 1))
            }
            Some(to) => {
                let to = u64::try_from(to).ok()?;
                (self.from < size && to >= self.from).then(|| (self.from, to.min(size - 1)))
            }
            None => (self.from < size).then_some((self.from, size - 1)),
        }
    }
}

/// Something a file body can be read from.
pub trait ContentReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> ContentReader for T {}

/// File content with a known size.
pub struct FileContent {
    /// Total size in bytes.
    pub size: u64,
    /// Seekable reader positioned at the start.
    pub reader: Pin<Box<dyn ContentReader>>,
}

impl FileContent {
    /// Wrap an in-memory buffer.
    #[must_use]
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self {
            size: bytes.len() as u64,
            reader: Box::pin(std::io::Cursor::new(bytes)),
        }
    }
}

impl fmt::Debug for FileContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileContent")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name.
    pub name: String,
    /// Target CID.
    pub cid: Cid,
    /// Cumulative size, if known.
    pub size: Option<u64>,
}

/// A single-use stream of directory entries fed through a bounded channel.
#[derive(Debug)]
pub struct DirectoryEntries {
    rx: mpsc::Receiver<Result<DirEntry, GatewayError>>,
}

impl DirectoryEntries {
    /// Create a bounded channel; the sender half belongs to the producer.
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<DirEntry, GatewayError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }

    /// Next entry, or `None` once the producer is done.
    pub async fn next(&mut self) -> Option<Result<DirEntry, GatewayError>> {
        self.rx.recv().await
    }

    /// Drain every entry, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<DirEntry>, GatewayError> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await {
            out.push(entry?);
        }
        Ok(out)
    }
}

/// A directory as returned by [`GatewayBackend::get`].
#[derive(Debug)]
pub struct DirectoryListing {
    /// Cumulative size of the directory DAG, if known.
    pub dag_size: Option<u64>,
    /// Entries, consumed at most once.
    pub entries: DirectoryEntries,
}

/// Result of [`GatewayBackend::get`].
#[derive(Debug)]
pub enum GetResponse {
    /// A file, or a structured block exposed as bytes.
    File(FileContent),
    /// A directory.
    Directory(DirectoryListing),
}

/// Result of [`GatewayBackend::head`].
#[derive(Debug, Clone)]
pub enum HeadResponse {
    /// A file with its size and leading bytes for content sniffing.
    File {
        /// Total size in bytes.
        size: u64,
        /// Up to the first few kilobytes.
        start: Bytes,
    },
    /// A directory.
    Directory {
        /// Cumulative size of the directory DAG, if known.
        dag_size: Option<u64>,
    },
}

/// A fully expanded UnixFS tree, as returned by [`GatewayBackend::get_all`].
#[derive(Debug)]
pub enum UnixfsNode {
    /// A file.
    File(FileContent),
    /// A directory with its entries in name order.
    Directory(Vec<(String, UnixfsNode)>),
}

/// A byte stream produced by a background writer.
///
/// The reader yields the payload; `done` resolves once the writer stops,
/// carrying any error that happened after the first byte was produced.
/// Dropping the stream cancels the writer.
pub struct ExportStream {
    /// Payload bytes.
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    /// Completion signal.
    pub done: oneshot::Receiver<Result<(), GatewayError>>,
    /// Cancels the writer when dropped.
    pub cancel: DropGuard,
}

impl fmt::Debug for ExportStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportStream").finish_non_exhaustive()
    }
}

/// The content store behind the gateway.
#[async_trait]
pub trait GatewayBackend: Send + Sync + 'static {
    /// Resolve a possibly mutable path to an immutable one. Object paths are
    /// returned unchanged.
    async fn resolve_mutable(&self, path: &ContentPath) -> Result<ImmutablePath, GatewayError>;

    /// Traverse a path without fetching its terminal content.
    async fn resolve_path(&self, path: &ImmutablePath) -> Result<PathMetadata, GatewayError>;

    /// Fetch a file (optionally only `ranges` of it) or a directory listing.
    async fn get(
        &self,
        path: &ImmutablePath,
        ranges: &[ByteRange],
    ) -> Result<(PathMetadata, GetResponse), GatewayError>;

    /// Fetch a whole UnixFS tree.
    async fn get_all(
        &self,
        path: &ImmutablePath,
    ) -> Result<(PathMetadata, UnixfsNode), GatewayError>;

    /// Fetch the raw bytes of the terminal block.
    async fn get_block(&self, path: &ImmutablePath) -> Result<(PathMetadata, Bytes), GatewayError>;

    /// Size and type of the terminal node, without its full content.
    async fn head(
        &self,
        path: &ImmutablePath,
    ) -> Result<(PathMetadata, HeadResponse), GatewayError>;

    /// Stream the DAG under the terminal node as a CAR.
    async fn get_car(
        &self,
        path: &ImmutablePath,
    ) -> Result<(PathMetadata, ExportStream), GatewayError>;

    /// Whether every block needed for `path` is available without network
    /// access.
    async fn is_cached(&self, path: &ContentPath) -> bool;

    /// Raw bytes of the signed naming record for `name`.
    async fn get_naming_record(&self, name: &Cid) -> Result<Bytes, GatewayError>;

    /// The content path a host's DNS link record points to.
    async fn get_name_record_by_host(&self, host: &str) -> Result<ContentPath, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_resolve_open_and_closed_ranges() {
        let open = ByteRange { from: 2, to: None };
        assert_eq!(open.resolve(10), Some((2, 9)));
        let closed = ByteRange { from: 2, to: Some(100) };
        assert_eq!(closed.resolve(10), Some((2, 9)));
        let past_end = ByteRange { from: 10, to: Some(12) };
        assert_eq!(past_end.resolve(10), None);
    }

    #[test]
    fn test_should_resolve_suffix_ranges() {
        let suffix = ByteRange { from: 0, to: Some(-3) };
        assert_eq!(suffix.resolve(10), Some((7, 9)));
        let oversized = ByteRange { from: 0, to: Some(-30) };
        assert_eq!(oversized.resolve(10), Some((0, 9)));
        assert_eq!(ByteRange::suffix(3), suffix);
    }

    #[test]
    fn test_should_never_satisfy_empty_suffix() {
        assert_eq!(ByteRange::suffix(0).resolve(10), None);
        assert_eq!(ByteRange::suffix(0).resolve(u64::MAX), None);
    }

    #[test]
    fn test_should_not_satisfy_ranges_of_empty_content() {
        let range = ByteRange { from: 0, to: None };
        assert_eq!(range.resolve(0), None);
    }

    #[tokio::test]
    async fn test_should_stream_directory_entries_once() {
        let (tx, entries) = DirectoryEntries::channel(2);
        let cid = crate::cids::sha256_cid(crate::cids::RAW, b"x");
        tx.send(Ok(DirEntry {
            name: "x".to_owned(),
            cid,
            size: Some(1),
        }))
        .await
        .unwrap();
        drop(tx);
        let all = entries.collect().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "x");
    }
}
