//! Tar archives of UnixFS trees.
//!
//! The archive is written into a pipe, the same way CAR exports are, by a
//! [`tar::Builder`] running on the blocking pool behind a [`SyncIoBridge`].
//! The top-level entry is named after the CID and directories get a
//! trailing `/`. The builder emits GNU long-name entries and block padding.

use std::io::{self, Read};

use cidgate_core::{ExportStream, GatewayError, ImmutablePath, UnixfsNode};
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Response, StatusCode};
use tar::{Builder, EntryType, Header};
use tokio::io::DuplexStream;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    RequestContext, count_stream_failures, etag_for, respond, set_disposition, set_nosniff,
    set_roots_header, set_stream_trailer,
};
use crate::body::GatewayBody;
use crate::caching::set_cache_headers;
use crate::negotiate::ResponseFormat;

const PIPE_CAPACITY: usize = 64 * 1024;

pub(super) async fn serve_tar(
    ctx: &RequestContext<'_>,
    path: &ImmutablePath,
) -> Result<Response<GatewayBody>, GatewayError> {
    let (md, tree) = if ctx.is_head {
        (ctx.backend.resolve_path(path).await?, None)
    } else {
        let (md, tree) = ctx.backend.get_all(path).await?;
        (md, Some(tree))
    };
    let cid = md.last_segment.cid;

    let mut headers = HeaderMap::new();
    set_roots_header(&mut headers, &md);
    set_cache_headers(
        &mut headers,
        &ctx.content_path,
        &etag_for(&cid, ResponseFormat::Tar),
    );
    let name = ctx
        .query
        .non_empty("filename")
        .map_or_else(|| format!("{cid}.tar"), str::to_owned);
    set_disposition(&mut headers, "attachment", &name);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-tar"));
    set_nosniff(&mut headers);
    set_stream_trailer(&mut headers);

    let body = tree.map_or_else(GatewayBody::empty, |tree| {
        let export = export_tar(cid.to_string(), tree);
        GatewayBody::from_export(count_stream_failures(export, ResponseFormat::Tar))
    });
    Ok(respond(StatusCode::OK, headers, body))
}

/// Start writing `tree` as a tar archive whose top-level entry is `name`.
pub(crate) fn export_tar(name: String, tree: UnixfsNode) -> ExportStream {
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let (done_tx, done_rx) = oneshot::channel();
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let handle = Handle::current();

    tokio::task::spawn_blocking(move || {
        let out = SyncIoBridge::new_with_handle(writer, handle.clone());
        let mut builder = Builder::new(out);
        let result = write_tree(&mut builder, &handle, &cancelled, name, tree)
            .and_then(|()| finish_archive(builder));
        if let Err(err) = &result {
            debug!(error = %err, "tar export stopped early");
        }
        done_tx.send(result).ok();
    });

    ExportStream {
        reader: Box::pin(reader),
        done: done_rx,
        cancel: token.drop_guard(),
    }
}

type TarBuilder = Builder<SyncIoBridge<DuplexStream>>;

fn write_tree(
    builder: &mut TarBuilder,
    handle: &Handle,
    cancelled: &CancellationToken,
    name: String,
    tree: UnixfsNode,
) -> Result<(), GatewayError> {
    let written = write_entries(builder, handle, cancelled, name, tree);
    if written.is_err() {
        // Close the pipe so the builder cannot append an end-of-archive marker
        // when it is dropped.
        builder.get_mut().shutdown().ok();
    }
    written
}

fn write_entries(
    builder: &mut TarBuilder,
    handle: &Handle,
    cancelled: &CancellationToken,
    name: String,
    tree: UnixfsNode,
) -> Result<(), GatewayError> {
    let mut stack = vec![(name, tree)];
    while let Some((path, node)) = stack.pop() {
        if cancelled.is_cancelled() {
            return Err(GatewayError::Internal("tar export cancelled".to_owned()));
        }
        match node {
            UnixfsNode::File(file) => {
                let mut header = entry_header(EntryType::Regular, file.size);
                let reader = SizedReader {
                    inner: SyncIoBridge::new_with_handle(file.reader, handle.clone()),
                    remaining: file.size,
                };
                builder
                    .append_data(&mut header, &path, reader)
                    .map_err(|e| GatewayError::Internal(format!("{path}: {e}")))?;
            }
            UnixfsNode::Directory(entries) => {
                let mut header = entry_header(EntryType::Directory, 0);
                builder.append_data(&mut header, format!("{path}/"), io::empty())?;
                for (child, node) in entries.into_iter().rev() {
                    if child.is_empty() || child == "." || child == ".." || child.contains('/') {
                        return Err(GatewayError::Internal(format!(
                            "refusing to archive entry {child:?} under {path}"
                        )));
                    }
                    stack.push((format!("{path}/{child}"), node));
                }
            }
        }
    }
    Ok(())
}

fn finish_archive(builder: TarBuilder) -> Result<(), GatewayError> {
    let mut out = builder.into_inner()?;
    out.shutdown()?;
    Ok(())
}

fn entry_header(entry_type: EntryType, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(if entry_type == EntryType::Directory {
        0o755
    } else {
        0o644
    });
    header.set_size(size);
    header.set_mtime(0);
    header
}

/// Yields exactly `remaining` bytes of `inner`, failing if it ends early.
struct SizedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for SizedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = usize::try_from(self.remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 && max > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use cidgate_core::FileContent;
    use tokio::io::AsyncReadExt;

    use super::*;

    async fn archive(tree: UnixfsNode) -> Vec<u8> {
        let mut export = export_tar("root".to_owned(), tree);
        let mut out = Vec::new();
        export.reader.read_to_end(&mut out).await.unwrap();
        export.done.await.unwrap().unwrap();
        out
    }

    fn file(data: &'static [u8]) -> UnixfsNode {
        UnixfsNode::File(FileContent::from_bytes(Bytes::from_static(data)))
    }

    #[tokio::test]
    async fn test_should_write_readable_archive() {
        let long_name = "n".repeat(150);
        let tree = UnixfsNode::Directory(vec![
            ("a.txt".to_owned(), file(b"hello")),
            (
                "sub".to_owned(),
                UnixfsNode::Directory(vec![(long_name.clone(), file(b"deep"))]),
            ),
        ]);
        let bytes = archive(tree).await;

        let mut reader = tar::Archive::new(bytes.as_slice());
        let mut seen = Vec::new();
        for entry in reader.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            seen.push((path, content));
        }
        assert_eq!(seen[0].0, "root/");
        assert_eq!(seen[1], ("root/a.txt".to_owned(), "hello".to_owned()));
        assert_eq!(seen[2].0, "root/sub/");
        assert_eq!(seen[3], (format!("root/sub/{long_name}"), "deep".to_owned()));
    }

    #[tokio::test]
    async fn test_should_archive_single_file() {
        let bytes = archive(file(b"solo")).await;
        let mut reader = tar::Archive::new(bytes.as_slice());
        let mut entry = reader.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("root"));
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "solo");
    }

    #[test]
    fn test_should_fail_on_short_file_content() {
        let mut reader = SizedReader {
            inner: &b"abc"[..],
            remaining: 5,
        };
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn test_should_refuse_path_traversal_names() {
        let tree = UnixfsNode::Directory(vec![("..".to_owned(), file(b"x"))]);
        let mut export = export_tar("root".to_owned(), tree);
        let mut out = Vec::new();
        export.reader.read_to_end(&mut out).await.unwrap();
        assert!(export.done.await.unwrap().is_err());
    }
}
