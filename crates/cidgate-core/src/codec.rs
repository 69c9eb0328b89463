//! IPLD data model and the block codecs the gateway understands.
//!
//! Every supported codec decodes into the same [`Node`] tree, which is what
//! makes cross-codec conversion (DAG-CBOR to DAG-JSON and back) a pair of
//! plain tree walks. Directories are dag-pb nodes, framed with `prost`
//! through [`PbNode`].

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use bytes::Bytes;
use ciborium::Value as CborValue;
use cid::Cid;
use prost::Message as _;
use serde_json::Value as JsonValue;

use crate::cids::{CBOR, DAG_CBOR, DAG_JSON, DAG_PB, JSON, RAW};
use crate::error::GatewayError;

/// CBOR tag marking an embedded CID.
const CID_TAG: u64 = 42;

/// A node in the IPLD data model.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer wide enough for both signed and unsigned 64-bit values.
    Integer(i128),
    /// Float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Byte string.
    Bytes(Bytes),
    /// Ordered list.
    List(Vec<Node>),
    /// Map with string keys.
    Map(BTreeMap<String, Node>),
    /// Link to another block.
    Link(Cid),
}

/// Raised when a path cannot be followed inside a structured node.
#[derive(Debug, thiserror::Error)]
pub enum KindError {
    /// The map key or list index does not exist.
    #[error("key {0:?} does not exist")]
    NotExists(String),
    /// The node cannot be traversed at all.
    #[error("cannot traverse {segment:?} into a {kind} node")]
    WrongKind {
        /// The segment being followed.
        segment: String,
        /// Kind of the node that was reached.
        kind: &'static str,
    },
}

impl Node {
    /// Data-model kind name.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Link(_) => "link",
        }
    }

    /// Follow one path segment: a map key or a list index.
    pub fn lookup(&self, segment: &str) -> Result<&Node, KindError> {
        match self {
            Self::Map(map) => map
                .get(segment)
                .ok_or_else(|| KindError::NotExists(segment.to_owned())),
            Self::List(list) => segment
                .parse::<usize>()
                .ok()
                .and_then(|i| list.get(i))
                .ok_or_else(|| KindError::NotExists(segment.to_owned())),
            other => Err(KindError::WrongKind {
                segment: segment.to_owned(),
                kind: other.kind_name(),
            }),
        }
    }

    /// Collect every link in the tree, in document order.
    pub fn collect_links(&self, out: &mut Vec<Cid>) {
        match self {
            Self::Link(cid) => out.push(*cid),
            Self::List(list) => list.iter().for_each(|n| n.collect_links(out)),
            Self::Map(map) => map.values().for_each(|n| n.collect_links(out)),
            _ => {}
        }
    }
}

/// Decode a block into the data model.
pub fn decode(codec: u64, data: &[u8]) -> Result<Node, GatewayError> {
    let node = match codec {
        DAG_CBOR | CBOR => {
            let value: CborValue = ciborium::from_reader(data)
                .map_err(|e| GatewayError::Internal(format!("decoding error: {e}")))?;
            from_cbor(value, codec == DAG_CBOR)
        }
        DAG_JSON | JSON => {
            let value: JsonValue = serde_json::from_slice(data)
                .map_err(|e| GatewayError::Internal(format!("decoding error: {e}")))?;
            from_json(value, codec == DAG_JSON)
        }
        DAG_PB => Ok(PbNode::decode(data)?.into_node()),
        RAW => Ok(Node::Bytes(Bytes::copy_from_slice(data))),
        other => Err(format!("no decoder registered for multicodec {other:#x}")),
    };
    node.map_err(|e| GatewayError::Internal(format!("decoding error: {e}")))
}

/// Encode a node with the given codec.
pub fn encode(codec: u64, node: &Node) -> Result<Vec<u8>, GatewayError> {
    let encoded = match codec {
        DAG_CBOR | CBOR => to_cbor(node, codec == DAG_CBOR).and_then(|value| {
            let mut out = Vec::new();
            ciborium::into_writer(&value, &mut out).map_err(|e| e.to_string())?;
            Ok(out)
        }),
        DAG_JSON | JSON => to_json(node).and_then(|v| serde_json::to_vec(&v).map_err(|e| e.to_string())),
        other => Err(format!("no encoder registered for multicodec {other:#x}")),
    };
    encoded.map_err(|e| GatewayError::Internal(format!("encoding error: {e}")))
}

/// Links held by a block, in traversal order.
pub fn links(codec: u64, data: &[u8]) -> Result<Vec<Cid>, GatewayError> {
    match codec {
        DAG_PB => Ok(PbNode::decode(data)?
            .links
            .into_iter()
            .map(|l| l.hash)
            .collect()),
        DAG_CBOR | DAG_JSON => {
            let mut out = Vec::new();
            decode(codec, data)?.collect_links(&mut out);
            Ok(out)
        }
        _ => Ok(Vec::new()),
    }
}

fn from_cbor(value: CborValue, dag: bool) -> Result<Node, String> {
    Ok(match value {
        CborValue::Null => Node::Null,
        CborValue::Bool(b) => Node::Bool(b),
        CborValue::Integer(i) => Node::Integer(i128::from(i)),
        CborValue::Float(f) => Node::Float(f),
        CborValue::Text(s) => Node::String(s),
        CborValue::Bytes(b) => Node::Bytes(Bytes::from(b)),
        CborValue::Array(items) => Node::List(
            items
                .into_iter()
                .map(|v| from_cbor(v, dag))
                .collect::<Result<_, _>>()?,
        ),
        CborValue::Map(entries) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                let CborValue::Text(key) = key else {
                    return Err("map keys must be strings".to_owned());
                };
                map.insert(key, from_cbor(value, dag)?);
            }
            Node::Map(map)
        }
        CborValue::Tag(CID_TAG, inner) if dag => match *inner {
            CborValue::Bytes(bytes) if bytes.first() == Some(&0) => {
                Node::Link(Cid::try_from(&bytes[1..]).map_err(|e| e.to_string())?)
            }
            _ => return Err("malformed CID in tag 42".to_owned()),
        },
        CborValue::Tag(tag, _) if dag => return Err(format!("unsupported CBOR tag {tag}")),
        CborValue::Tag(_, inner) => from_cbor(*inner, dag)?,
        _ => return Err("unsupported CBOR value".to_owned()),
    })
}

fn to_cbor(node: &Node, dag: bool) -> Result<CborValue, String> {
    Ok(match node {
        Node::Null => CborValue::Null,
        Node::Bool(b) => CborValue::Bool(*b),
        Node::Integer(i) => CborValue::Integer(
            ciborium::value::Integer::try_from(*i).map_err(|_| format!("integer {i} out of range"))?,
        ),
        Node::Float(f) => CborValue::Float(*f),
        Node::String(s) => CborValue::Text(s.clone()),
        Node::Bytes(b) => CborValue::Bytes(b.to_vec()),
        Node::List(items) => CborValue::Array(
            items
                .iter()
                .map(|n| to_cbor(n, dag))
                .collect::<Result<_, _>>()?,
        ),
        Node::Map(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            if dag {
                keys.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
            }
            let mut entries = Vec::with_capacity(keys.len());
            for key in keys {
                entries.push((CborValue::Text(key.clone()), to_cbor(&map[key], dag)?));
            }
            CborValue::Map(entries)
        }
        Node::Link(cid) => {
            let mut bytes = vec![0u8];
            bytes.extend_from_slice(&cid.to_bytes());
            CborValue::Tag(CID_TAG, Box::new(CborValue::Bytes(bytes)))
        }
    })
}

fn from_json(value: JsonValue, dag: bool) -> Result<Node, String> {
    Ok(match value {
        JsonValue::Null => Node::Null,
        JsonValue::Bool(b) => Node::Bool(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Node::Integer(i128::from(i))
            } else if let Some(u) = n.as_u64() {
                Node::Integer(i128::from(u))
            } else {
                Node::Float(n.as_f64().ok_or("unrepresentable number")?)
            }
        }
        JsonValue::String(s) => Node::String(s),
        JsonValue::Array(items) => Node::List(
            items
                .into_iter()
                .map(|v| from_json(v, dag))
                .collect::<Result<_, _>>()?,
        ),
        JsonValue::Object(object) => {
            if dag && object.len() == 1 {
                if let Some(reserved) = object.get("/") {
                    return decode_reserved(reserved);
                }
            }
            let mut map = BTreeMap::new();
            for (key, value) in object {
                map.insert(key, from_json(value, dag)?);
            }
            Node::Map(map)
        }
    })
}

/// Decode the `{"/": ...}` forms of DAG-JSON.
fn decode_reserved(reserved: &JsonValue) -> Result<Node, String> {
    match reserved {
        JsonValue::String(s) => Cid::try_from(s.as_str())
            .map(Node::Link)
            .map_err(|e| format!("invalid link {s:?}: {e}")),
        JsonValue::Object(inner) => match inner.get("bytes") {
            Some(JsonValue::String(b64)) if inner.len() == 1 => STANDARD_NO_PAD
                .decode(b64)
                .or_else(|_| STANDARD.decode(b64))
                .map(|b| Node::Bytes(Bytes::from(b)))
                .map_err(|e| format!("invalid bytes: {e}")),
            _ => Err("invalid reserved object".to_owned()),
        },
        _ => Err("invalid reserved value".to_owned()),
    }
}

fn to_json(node: &Node) -> Result<JsonValue, String> {
    Ok(match node {
        Node::Null => JsonValue::Null,
        Node::Bool(b) => JsonValue::Bool(*b),
        Node::Integer(i) => {
            if let Ok(v) = i64::try_from(*i) {
                JsonValue::from(v)
            } else if let Ok(v) = u64::try_from(*i) {
                JsonValue::from(v)
            } else {
                return Err(format!("integer {i} out of range"));
            }
        }
        Node::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .ok_or_else(|| format!("float {f} has no JSON form"))?,
        Node::String(s) => JsonValue::String(s.clone()),
        Node::Bytes(b) => serde_json::json!({ "/": { "bytes": STANDARD_NO_PAD.encode(b) } }),
        Node::List(items) => {
            JsonValue::Array(items.iter().map(to_json).collect::<Result<_, _>>()?)
        }
        Node::Map(map) => {
            let mut object = serde_json::Map::new();
            for (key, value) in map {
                object.insert(key.clone(), to_json(value)?);
            }
            JsonValue::Object(object)
        }
        Node::Link(cid) => serde_json::json!({ "/": cid.to_string() }),
    })
}

/// A named link inside a dag-pb node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbLink {
    /// Target CID.
    pub hash: Cid,
    /// Link name, unique within a directory.
    pub name: String,
    /// Cumulative size of the target DAG.
    pub tsize: Option<u64>,
}

/// A dag-pb node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PbNode {
    /// Links in stored order.
    pub links: Vec<PbLink>,
    /// Opaque payload; UnixFS metadata for directories.
    pub data: Option<Bytes>,
}

impl PbNode {
    /// A UnixFS directory holding `links`.
    #[must_use]
    pub fn directory(mut links: Vec<PbLink>) -> Self {
        links.sort_by(|a, b| a.name.cmp(&b.name));
        let unixfs = UnixfsData {
            kind: Some(UNIXFS_DIRECTORY),
        };
        Self {
            links,
            data: Some(Bytes::from(unixfs.encode_to_vec())),
        }
    }

    /// Whether the payload marks a UnixFS directory.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.data
            .as_deref()
            .and_then(|data| UnixfsData::decode(data).ok())
            .is_some_and(|unixfs| unixfs.kind == Some(UNIXFS_DIRECTORY))
    }

    /// Find a link by name.
    #[must_use]
    pub fn link(&self, name: &str) -> Option<&PbLink> {
        self.links.iter().find(|l| l.name == name)
    }

    /// Decode the protobuf framing.
    pub fn decode(input: &[u8]) -> Result<Self, GatewayError> {
        let wire = PbNodeWire::decode(input).map_err(|e| malformed(&e.to_string()))?;
        let links = wire
            .links
            .into_iter()
            .map(PbLink::try_from)
            .collect::<Result<_, _>>()?;
        Ok(Self {
            links,
            data: wire.data,
        })
    }

    /// Encode with links first, as the canonical form requires.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for link in &self.links {
            prost::encoding::message::encode(PB_LINKS_TAG, &PbLinkWire::from(link), &mut out);
        }
        if let Some(data) = &self.data {
            prost::encoding::bytes::encode(PB_DATA_TAG, data, &mut out);
        }
        out
    }

    fn into_node(self) -> Node {
        let links = self
            .links
            .into_iter()
            .map(|l| {
                let mut map = BTreeMap::new();
                map.insert("Hash".to_owned(), Node::Link(l.hash));
                map.insert("Name".to_owned(), Node::String(l.name));
                if let Some(tsize) = l.tsize {
                    map.insert("Tsize".to_owned(), Node::Integer(i128::from(tsize)));
                }
                Node::Map(map)
            })
            .collect();
        let mut map = BTreeMap::new();
        map.insert("Links".to_owned(), Node::List(links));
        if let Some(data) = self.data {
            map.insert("Data".to_owned(), Node::Bytes(data));
        }
        Node::Map(map)
    }
}

const PB_DATA_TAG: u32 = 1;
const PB_LINKS_TAG: u32 = 2;

/// UnixFS `Type` of a plain directory.
const UNIXFS_DIRECTORY: i32 = 1;

/// dag-pb `PBNode` as it appears on the wire.
#[derive(Clone, PartialEq, prost::Message)]
struct PbNodeWire {
    #[prost(bytes = "bytes", optional, tag = "1")]
    data: Option<Bytes>,
    #[prost(message, repeated, tag = "2")]
    links: Vec<PbLinkWire>,
}

/// dag-pb `PBLink` as it appears on the wire.
#[derive(Clone, PartialEq, prost::Message)]
struct PbLinkWire {
    #[prost(bytes = "vec", optional, tag = "1")]
    hash: Option<Vec<u8>>,
    #[prost(string, optional, tag = "2")]
    name: Option<String>,
    #[prost(uint64, optional, tag = "3")]
    tsize: Option<u64>,
}

/// The UnixFS metadata carried in a directory's `Data` field.
#[derive(Clone, PartialEq, prost::Message)]
struct UnixfsData {
    #[prost(int32, optional, tag = "1")]
    kind: Option<i32>,
}

impl From<&PbLink> for PbLinkWire {
    fn from(link: &PbLink) -> Self {
        Self {
            hash: Some(link.hash.to_bytes()),
            name: Some(link.name.clone()),
            tsize: link.tsize,
        }
    }
}

impl TryFrom<PbLinkWire> for PbLink {
    type Error = GatewayError;

    fn try_from(wire: PbLinkWire) -> Result<Self, Self::Error> {
        let hash = wire.hash.ok_or_else(|| malformed("link without hash"))?;
        Ok(Self {
            hash: Cid::try_from(hash.as_slice()).map_err(|e| malformed(&e.to_string()))?,
            name: wire.name.unwrap_or_default(),
            tsize: wire.tsize,
        })
    }
}

fn malformed(what: &str) -> GatewayError {
    GatewayError::Internal(format!("malformed dag-pb node: {what}"))
}
