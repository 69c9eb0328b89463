//! In-memory content store.
//!
//! [`MemoryBackend`] keeps blocks, mutable names, naming records and DNS
//! link records in concurrent maps. Files are stored as single raw leaves and
//! directories as dag-pb nodes, which is enough to exercise every rendering
//! path of the gateway without a network.
//!
//! # Examples
//!
//! ```
//! use cidgate_core::{ContentPath, GatewayBackend, ImmutablePath, MemoryBackend};
//!
//! # tokio_test::block_on(async {
//! let backend = MemoryBackend::new();
//! let file = backend.add_file("hello");
//! let dir = backend.add_directory([("hello.txt", file)]);
//!
//! let path = ContentPath::parse(&format!("/object/{dir}/hello.txt")).unwrap();
//! let path = ImmutablePath::try_from(path).unwrap();
//! let md = backend.resolve_path(&path).await.unwrap();
//! assert_eq!(md.last_segment.cid, file);
//! # });
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::backend::{
    ByteRange, DirEntry, DirectoryEntries, DirectoryListing, ExportStream, FileContent,
    GatewayBackend, GetResponse, HeadResponse, UnixfsNode,
};
use crate::car::{self, BlockSource};
use crate::cids::{self, DAG_PB, IDENTITY, RAW, SHA2_256};
use crate::codec::{self, Node, PbLink, PbNode};
use crate::error::GatewayError;
use crate::path::{ContentPath, ImmutablePath, Namespace, PathMetadata, ResolvedPath};

/// How many name-to-name hops resolution follows before giving up.
pub const MAX_RESOLVE_DEPTH: usize = 32;

/// Leading bytes returned by `head` for content sniffing.
const SNIFF_LEN: usize = 3072;

/// Default ceiling on a single CAR export.
const DEFAULT_CAR_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct MemoryStore {
    blocks: DashMap<Cid, Bytes>,
    /// Blocks that are served but would need a network fetch.
    remote: DashSet<Cid>,
    /// Key-based names by canonical key string.
    names: DashMap<String, ContentPath>,
    records: DashMap<Cid, Bytes>,
    dnslink: DashMap<String, ContentPath>,
}

impl MemoryStore {
    fn block(&self, cid: &Cid) -> Result<Bytes, GatewayError> {
        if cid.hash().code() == IDENTITY {
            return Ok(Bytes::copy_from_slice(cid.hash().digest()));
        }
        self.blocks
            .get(cid)
            .map(|b| b.clone())
            .ok_or_else(|| GatewayError::NotFound(format!("block {cid}")))
    }

    fn lookup_name(&self, name: &str) -> Option<ContentPath> {
        if let Some(key) = cids::name_key_cid(name) {
            return self.names.get(&key.to_string()).map(|p| p.clone());
        }
        self.dnslink
            .get(&name.to_ascii_lowercase())
            .map(|p| p.clone())
    }

    fn cumulative_size(&self, cid: &Cid) -> u64 {
        let Ok(data) = self.block(cid) else {
            return 0;
        };
        let own = data.len() as u64;
        if cid.codec() != DAG_PB {
            return own;
        }
        PbNode::decode(&data).map_or(own, |node| {
            own + node
                .links
                .iter()
                .map(|l| l.tsize.unwrap_or_else(|| self.cumulative_size(&l.hash)))
                .sum::<u64>()
        })
    }

    fn traverse(&self, path: &ImmutablePath) -> Result<PathMetadata, GatewayError> {
        let mut roots = Vec::with_capacity(path.rest().len());
        let mut current = path.root_cid();
        let mut inner: Vec<String> = Vec::new();

        for segment in path.rest() {
            roots.push(current);
            let data = self.block(&current)?;
            match current.codec() {
                DAG_PB => {
                    let node = PbNode::decode(&data)?;
                    let link = node.link(segment).ok_or_else(|| GatewayError::NoSuchLink {
                        name: segment.clone(),
                        cid: current.to_string(),
                    })?;
                    current = link.hash;
                }
                structured if cids::is_structured_codec(structured) => {
                    let node = codec::decode(structured, &data)?;
                    let mut reached = &node;
                    for step in inner.iter().chain(std::iter::once(segment)) {
                        reached = reached.lookup(step).map_err(GatewayError::backend)?;
                    }
                    if let Node::Link(next) = reached {
                        current = *next;
                        inner.clear();
                    } else {
                        inner.push(segment.clone());
                    }
                }
                _ => {
                    return Err(GatewayError::NoSuchLink {
                        name: segment.clone(),
                        cid: current.to_string(),
                    });
                }
            }
        }

        Ok(PathMetadata {
            path_segment_roots: roots,
            last_segment: ResolvedPath {
                path: path.clone(),
                cid: current,
                remainder: inner.join("/"),
            },
            content_type: None,
        })
    }

    fn unixfs_tree(&self, cid: &Cid) -> Result<UnixfsNode, GatewayError> {
        let data = self.block(cid)?;
        if cid.codec() == DAG_PB {
            let node = PbNode::decode(&data)?;
            if node.is_directory() {
                let entries = node
                    .links
                    .iter()
                    .map(|l| -> Result<_, GatewayError> {
                        Ok((l.name.clone(), self.unixfs_tree(&l.hash)?))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(UnixfsNode::Directory(entries));
            }
            return Err(unsupported_pb(cid));
        }
        Ok(UnixfsNode::File(FileContent::from_bytes(data)))
    }
}

#[async_trait]
impl BlockSource for MemoryStore {
    async fn block(&self, cid: &Cid) -> Result<Bytes, GatewayError> {
        MemoryStore::block(self, cid)
    }
}

fn unsupported_pb(cid: &Cid) -> GatewayError {
    GatewayError::Unimplemented(format!("{cid} is a dag-pb node that is not a directory"))
}

/// In-memory [`GatewayBackend`].
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
    car_timeout: Duration,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::default()),
            car_timeout: DEFAULT_CAR_TIMEOUT,
        }
    }

    /// Set the ceiling on a single CAR export.
    #[must_use]
    pub fn with_car_timeout(mut self, timeout: Duration) -> Self {
        self.car_timeout = timeout;
        self
    }

    /// Store a block under its SHA2-256 CID.
    pub fn put_block(&self, codec: u64, data: impl Into<Bytes>) -> Cid {
        let data = data.into();
        let cid = cids::sha256_cid(codec, &data);
        self.store.blocks.insert(cid, data);
        cid
    }

    /// Store a file as a single raw leaf.
    pub fn add_file(&self, data: impl Into<Bytes>) -> Cid {
        self.put_block(RAW, data)
    }

    /// Store a directory of named entries.
    pub fn add_directory<I, S>(&self, entries: I) -> Cid
    where
        I: IntoIterator<Item = (S, Cid)>,
        S: Into<String>,
    {
        let links = entries
            .into_iter()
            .map(|(name, hash)| PbLink {
                hash,
                name: name.into(),
                tsize: Some(self.store.cumulative_size(&hash)),
            })
            .collect();
        self.put_block(DAG_PB, PbNode::directory(links).encode())
    }

    /// Encode and store a structured node.
    pub fn add_node(&self, codec: u64, node: &Node) -> Result<Cid, GatewayError> {
        let data = codec::encode(codec, node)?;
        Ok(self.put_block(codec, data))
    }

    /// Point a key-based name at `target`.
    pub fn publish(&self, name: &str, target: ContentPath) -> Result<(), GatewayError> {
        let key = cids::name_key_cid(name).ok_or_else(|| GatewayError::InvalidCid {
            input: name.to_owned(),
            reason: "not a key-based name".to_owned(),
        })?;
        self.store.names.insert(key.to_string(), target);
        Ok(())
    }

    /// Store the signed record for a key-based name.
    pub fn put_naming_record(&self, name: &Cid, record: impl Into<Bytes>) {
        let key = Cid::new_v1(cids::LIBP2P_KEY, *name.hash());
        self.store.records.insert(key, record.into());
    }

    /// Point a DNS name at `target`.
    pub fn set_dnslink(&self, host: &str, target: ContentPath) {
        self.store
            .dnslink
            .insert(host.to_ascii_lowercase(), target);
    }

    /// Mark a block as only reachable over the network.
    pub fn mark_remote(&self, cid: Cid) {
        self.store.remote.insert(cid);
    }

    /// Import every block of a CARv1 archive, verifying SHA2-256 hashes.
    ///
    /// Returns the archive roots.
    pub fn import_car(&self, archive: &[u8]) -> Result<Vec<Cid>, GatewayError> {
        let car = car::decode(archive)?;
        for (cid, data) in car.blocks {
            if cid.hash().code() == SHA2_256
                && cids::sha256_cid(cid.codec(), &data).hash() != cid.hash()
            {
                return Err(GatewayError::BadRequest(format!(
                    "block {cid} does not match its hash"
                )));
            }
            self.store.blocks.insert(cid, data);
        }
        debug!(roots = car.roots.len(), "imported car archive");
        Ok(car.roots)
    }
}

#[async_trait]
impl GatewayBackend for MemoryBackend {
    async fn resolve_mutable(&self, path: &ContentPath) -> Result<ImmutablePath, GatewayError> {
        let mut current = path.clone();
        for _ in 0..MAX_RESOLVE_DEPTH {
            if current.namespace() == Namespace::Object {
                return ImmutablePath::try_from(current);
            }
            let target = self
                .store
                .lookup_name(current.root())
                .ok_or_else(|| GatewayError::ResolveFailed(current.root().to_owned()))?;
            current = current.rebase(target.namespace(), target.root(), target.rest());
        }
        Err(GatewayError::ResolveRecursion(path.to_string()))
    }

    async fn resolve_path(&self, path: &ImmutablePath) -> Result<PathMetadata, GatewayError> {
        self.store.traverse(path)
    }

    async fn get(
        &self,
        path: &ImmutablePath,
        _ranges: &[ByteRange],
    ) -> Result<(PathMetadata, GetResponse), GatewayError> {
        let md = self.store.traverse(path)?;
        let cid = md.last_segment.cid;
        let data = self.store.block(&cid)?;
        if cid.codec() != DAG_PB {
            return Ok((md, GetResponse::File(FileContent::from_bytes(data))));
        }

        let node = PbNode::decode(&data)?;
        if !node.is_directory() {
            return Err(unsupported_pb(&cid));
        }
        let (tx, entries) = DirectoryEntries::channel(node.links.len());
        for link in node.links {
            let entry = DirEntry {
                name: link.name,
                cid: link.hash,
                size: link.tsize,
            };
            tx.try_send(Ok(entry))
                .map_err(|e| GatewayError::Internal(format!("directory listing: {e}")))?;
        }
        let listing = DirectoryListing {
            dag_size: Some(self.store.cumulative_size(&cid)),
            entries,
        };
        Ok((md, GetResponse::Directory(listing)))
    }

    async fn get_all(
        &self,
        path: &ImmutablePath,
    ) -> Result<(PathMetadata, UnixfsNode), GatewayError> {
        let md = self.store.traverse(path)?;
        let tree = self.store.unixfs_tree(&md.last_segment.cid)?;
        Ok((md, tree))
    }

    async fn get_block(&self, path: &ImmutablePath) -> Result<(PathMetadata, Bytes), GatewayError> {
        let md = self.store.traverse(path)?;
        let data = self.store.block(&md.last_segment.cid)?;
        Ok((md, data))
    }

    async fn head(
        &self,
        path: &ImmutablePath,
    ) -> Result<(PathMetadata, HeadResponse), GatewayError> {
        let md = self.store.traverse(path)?;
        let cid = md.last_segment.cid;
        let data = self.store.block(&cid)?;
        if cid.codec() == DAG_PB {
            if !PbNode::decode(&data)?.is_directory() {
                return Err(unsupported_pb(&cid));
            }
            let dag_size = Some(self.store.cumulative_size(&cid));
            return Ok((md, HeadResponse::Directory { dag_size }));
        }
        let start = data.slice(..data.len().min(SNIFF_LEN));
        Ok((
            md,
            HeadResponse::File {
                size: data.len() as u64,
                start,
            },
        ))
    }

    async fn get_car(
        &self,
        path: &ImmutablePath,
    ) -> Result<(PathMetadata, ExportStream), GatewayError> {
        let md = self.store.traverse(path)?;
        let stream = car::export(
            Arc::clone(&self.store),
            md.last_segment.cid,
            self.car_timeout,
        );
        Ok((md, stream))
    }

    async fn is_cached(&self, path: &ContentPath) -> bool {
        let Ok(path) = self.resolve_mutable(path).await else {
            return false;
        };
        let Ok(md) = self.store.traverse(&path) else {
            return false;
        };
        md.path_segment_roots
            .iter()
            .chain(std::iter::once(&md.last_segment.cid))
            .all(|cid| !self.store.remote.contains(cid))
    }

    async fn get_naming_record(&self, name: &Cid) -> Result<Bytes, GatewayError> {
        let key = Cid::new_v1(cids::LIBP2P_KEY, *name.hash());
        self.store
            .records
            .get(&key)
            .map(|r| r.clone())
            .ok_or_else(|| GatewayError::NotFound(format!("naming record for {name}")))
    }

    async fn get_name_record_by_host(&self, host: &str) -> Result<ContentPath, GatewayError> {
        self.store
            .dnslink
            .get(&host.to_ascii_lowercase())
            .map(|p| p.clone())
            .ok_or_else(|| GatewayError::ResolveFailed(host.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::cids::DAG_JSON;
    use crate::error::ErrorKind;

    fn object(cid: &Cid, rest: &[&str]) -> ImmutablePath {
        let path = ContentPath::from_parts(Namespace::Object, &cid.to_string(), rest).unwrap();
        ImmutablePath::try_from(path).unwrap()
    }

    #[tokio::test]
    async fn test_should_record_one_root_per_traversed_segment() {
        let backend = MemoryBackend::new();
        let file = backend.add_file("hi");
        let sub = backend.add_directory([("f.txt", file)]);
        let root = backend.add_directory([("sub", sub)]);

        let md = backend
            .resolve_path(&object(&root, &["sub", "f.txt"]))
            .await
            .unwrap();
        assert_eq!(md.path_segment_roots, vec![root, sub]);
        assert_eq!(md.last_segment.cid, file);
        assert!(md.last_segment.remainder.is_empty());
    }

    #[tokio::test]
    async fn test_should_fail_missing_link_with_not_found() {
        let backend = MemoryBackend::new();
        let root = backend.add_directory(Vec::<(String, Cid)>::new());
        let err = backend
            .resolve_path(&object(&root, &["nope"]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoSuchLink { .. }));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_should_follow_links_inside_structured_nodes() {
        let backend = MemoryBackend::new();
        let file = backend.add_file("leaf");
        let mut map = BTreeMap::new();
        map.insert("child".to_owned(), Node::Link(file));
        map.insert("meta".to_owned(), {
            let mut m = BTreeMap::new();
            m.insert("title".to_owned(), Node::String("t".into()));
            Node::Map(m)
        });
        let root = backend.add_node(DAG_JSON, &Node::Map(map)).unwrap();

        let md = backend.resolve_path(&object(&root, &["child"])).await.unwrap();
        assert_eq!(md.last_segment.cid, file);

        let md = backend
            .resolve_path(&object(&root, &["meta", "title"]))
            .await
            .unwrap();
        assert_eq!(md.last_segment.cid, root);
        assert_eq!(md.last_segment.remainder, "meta/title");
        assert_eq!(md.path_segment_roots, vec![root, root]);

        let err = backend
            .resolve_path(&object(&root, &["missing"]))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_should_resolve_names_through_chains() {
        let backend = MemoryBackend::new();
        let file = backend.add_file("x");
        let dir = backend.add_directory([("x", file)]);
        let key = cids::sha256_cid(cids::LIBP2P_KEY, b"key").to_string();
        backend
            .publish(&key, ContentPath::from_cid(&dir))
            .unwrap();
        backend.set_dnslink(
            "example.com",
            ContentPath::parse(&format!("/name/{key}")).unwrap(),
        );

        let path = ContentPath::parse("/name/example.com/x").unwrap();
        let resolved = backend.resolve_mutable(&path).await.unwrap();
        assert_eq!(resolved.to_string(), format!("/object/{dir}/x"));
    }

    #[tokio::test]
    async fn test_should_stop_resolution_loops() {
        let backend = MemoryBackend::new();
        backend.set_dnslink("a.example", ContentPath::parse("/name/b.example").unwrap());
        backend.set_dnslink("b.example", ContentPath::parse("/name/a.example").unwrap());
        let err = backend
            .resolve_mutable(&ContentPath::parse("/name/a.example").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ResolveRecursion(_)));
    }

    #[tokio::test]
    async fn test_should_fail_unknown_name() {
        let backend = MemoryBackend::new();
        let err = backend
            .resolve_mutable(&ContentPath::parse("/name/unknown.example").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_should_list_directory_entries_with_sizes() {
        let backend = MemoryBackend::new();
        let a = backend.add_file("aaa");
        let b = backend.add_file("bb");
        let dir = backend.add_directory([("b", b), ("a", a)]);

        let (_, response) = backend.get(&object(&dir, &[]), &[]).await.unwrap();
        let GetResponse::Directory(listing) = response else {
            panic!("expected a directory");
        };
        let entries = listing.entries.collect().await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(entries[0].size, Some(3));
        assert!(listing.dag_size.unwrap() > 5);
    }

    #[tokio::test]
    async fn test_should_read_file_content() {
        let backend = MemoryBackend::new();
        let file = backend.add_file("hello world");
        let (_, response) = backend.get(&object(&file, &[]), &[]).await.unwrap();
        let GetResponse::File(mut content) = response else {
            panic!("expected a file");
        };
        let mut out = String::new();
        content.reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
        assert_eq!(content.size, 11);
    }

    #[tokio::test]
    async fn test_should_serve_identity_blocks_without_storage() {
        let backend = MemoryBackend::new();
        let cid = cids::identity_cid(RAW, b"inline").unwrap();
        let (_, data) = backend.get_block(&object(&cid, &[])).await.unwrap();
        assert_eq!(&data[..], b"inline");
    }

    #[tokio::test]
    async fn test_should_report_remote_blocks_as_uncached() {
        let backend = MemoryBackend::new();
        let file = backend.add_file("x");
        let dir = backend.add_directory([("x", file)]);
        let path = ContentPath::parse(&format!("/object/{dir}/x")).unwrap();
        assert!(backend.is_cached(&path).await);
        backend.mark_remote(file);
        assert!(!backend.is_cached(&path).await);
    }

    #[tokio::test]
    async fn test_should_round_trip_car_export_into_fresh_store() {
        let source = MemoryBackend::new();
        let file = source.add_file("payload");
        let dir = source.add_directory([("p", file)]);
        let (_, mut stream) = source.get_car(&object(&dir, &[])).await.unwrap();
        let mut archive = Vec::new();
        stream.reader.read_to_end(&mut archive).await.unwrap();

        let target = MemoryBackend::new();
        let roots = target.import_car(&archive).unwrap();
        assert_eq!(roots, vec![dir]);
        let md = target.resolve_path(&object(&dir, &["p"])).await.unwrap();
        assert_eq!(md.last_segment.cid, file);
    }

    #[tokio::test]
    async fn test_should_return_naming_record_by_any_key_codec() {
        let backend = MemoryBackend::new();
        let key = cids::sha256_cid(cids::LIBP2P_KEY, b"k");
        backend.put_naming_record(&key, "record");
        let as_raw = Cid::new_v1(RAW, *key.hash());
        let record = backend.get_naming_record(&as_raw).await.unwrap();
        assert_eq!(&record[..], b"record");
    }
}
