//! CARv1 archives.
//!
//! Export runs as a background task that writes into a bounded in-memory
//! pipe. The task walks the DAG depth-first, visiting each link once, and
//! reports its outcome on a oneshot channel after closing the pipe, so a
//! consumer can surface late failures out of band. The task stops when the
//! consumer drops the stream, when the pipe breaks, or when its deadline
//! passes.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use prost::encoding::{decode_varint, encode_varint};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::ExportStream;
use crate::codec::{self, Node};
use crate::cids::DAG_CBOR;
use crate::error::GatewayError;

/// Capacity of the pipe between the writer task and the response body.
const PIPE_CAPACITY: usize = 64 * 1024;

/// The only CAR version this gateway produces.
pub const CAR_VERSION: u64 = 1;

/// Where export reads blocks from.
#[async_trait]
pub trait BlockSource: Send + Sync + 'static {
    /// Raw bytes of one block.
    async fn block(&self, cid: &Cid) -> Result<Bytes, GatewayError>;
}

/// Encode the varint-prefixed DAG-CBOR header naming `root`.
pub fn encode_header(root: &Cid) -> Result<Vec<u8>, GatewayError> {
    let mut header = BTreeMap::new();
    header.insert("roots".to_owned(), Node::List(vec![Node::Link(*root)]));
    header.insert(
        "version".to_owned(),
        Node::Integer(i128::from(CAR_VERSION)),
    );
    let body = codec::encode(DAG_CBOR, &Node::Map(header))?;
    let mut out = Vec::with_capacity(body.len() + 2);
    encode_varint(body.len() as u64, &mut out);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Start exporting the DAG under `root`.
pub fn export<S: BlockSource>(source: Arc<S>, root: Cid, timeout: Duration) -> ExportStream {
    let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let (done_tx, done_rx) = oneshot::channel();
    let token = CancellationToken::new();
    let cancelled = token.clone();

    tokio::spawn(async move {
        let result = tokio::select! {
            () = cancelled.cancelled() => {
                Err(GatewayError::Internal("car export cancelled".to_owned()))
            }
            written = tokio::time::timeout(timeout, write_dag(source.as_ref(), root, &mut writer)) => {
                written.map_err(GatewayError::from).and_then(|r| r)
            }
        };
        writer.shutdown().await.ok();
        drop(writer);

        if let Err(err) = &result {
            debug!(%root, error = %err, "car export stopped early");
        }
        done_tx.send(result).ok();
    });

    ExportStream {
        reader: Box::pin(reader),
        done: done_rx,
        cancel: token.drop_guard(),
    }
}

async fn write_dag<S, W>(source: &S, root: Cid, out: &mut W) -> Result<(), GatewayError>
where
    S: BlockSource + ?Sized,
    W: AsyncWrite + Unpin,
{
    out.write_all(&encode_header(&root)?).await?;

    let mut seen = HashSet::new();
    let mut stack = vec![root];
    while let Some(cid) = stack.pop() {
        if !seen.insert(cid) {
            continue;
        }
        let data = source.block(&cid).await?;
        let cid_bytes = cid.to_bytes();
        let mut frame = Vec::with_capacity(10 + cid_bytes.len());
        encode_varint((cid_bytes.len() + data.len()) as u64, &mut frame);
        frame.extend_from_slice(&cid_bytes);
        out.write_all(&frame).await?;
        out.write_all(&data).await?;

        let links = codec::links(cid.codec(), &data)?;
        stack.extend(links.into_iter().rev());
    }
    out.flush().await?;
    Ok(())
}

/// A decoded CAR archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarArchive {
    /// Header roots.
    pub roots: Vec<Cid>,
    /// Blocks in archive order.
    pub blocks: Vec<(Cid, Bytes)>,
}

/// Decode a CARv1 archive held in memory.
pub fn decode(input: &[u8]) -> Result<CarArchive, GatewayError> {
    let bad = |what: &str| GatewayError::BadRequest(format!("invalid car archive: {what}"));

    let (header_len, used) = read_varint(input).ok_or_else(|| bad("header length"))?;
    let header_end = usize::try_from(header_len)
        .ok()
        .and_then(|len| used.checked_add(len))
        .filter(|end| *end <= input.len())
        .ok_or_else(|| bad("truncated header"))?;
    let header = codec::decode(DAG_CBOR, &input[used..header_end])?;

    if header.lookup("version").ok() != Some(&Node::Integer(i128::from(CAR_VERSION))) {
        return Err(bad("unsupported version"));
    }
    let roots = match header.lookup("roots") {
        Ok(Node::List(items)) => items
            .iter()
            .map(|n| match n {
                Node::Link(cid) => Ok(*cid),
                _ => Err(bad("root is not a link")),
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(bad("missing roots")),
    };

    let mut blocks = Vec::new();
    let mut rest = &input[header_end..];
    while !rest.is_empty() {
        let (len, used) = read_varint(rest).ok_or_else(|| bad("block length"))?;
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| used.checked_add(len))
            .filter(|end| *end <= rest.len())
            .ok_or_else(|| bad("truncated block"))?;
        let mut section = &rest[used..end];
        let cid = Cid::read_bytes(&mut section).map_err(|e| bad(&e.to_string()))?;
        blocks.push((cid, Bytes::copy_from_slice(section)));
        rest = &rest[end..];
    }

    Ok(CarArchive { roots, blocks })
}

/// Decode a varint from the front of `input` with the number of bytes it took.
fn read_varint(input: &[u8]) -> Option<(u64, usize)> {
    let mut rest = input;
    let value = decode_varint(&mut rest).ok()?;
    Some((value, input.len() - rest.len()))
}
