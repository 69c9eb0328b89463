//! CID helpers: multicodec constants, parsing, hashing, and DNS-label encoding.

use cid::Cid;
use cid::Version;
use cid::multihash::Multihash;
use multibase::Base;
use sha2::{Digest, Sha256};

use crate::error::GatewayError;

/// Raw binary leaves.
pub const RAW: u64 = 0x55;
/// Protobuf-framed nodes used for directories.
pub const DAG_PB: u64 = 0x70;
/// DAG-CBOR.
pub const DAG_CBOR: u64 = 0x71;
/// DAG-JSON.
pub const DAG_JSON: u64 = 0x0129;
/// Plain JSON.
pub const JSON: u64 = 0x0200;
/// Plain CBOR.
pub const CBOR: u64 = 0x51;
/// Public keys used as mutable-name identifiers.
pub const LIBP2P_KEY: u64 = 0x72;

/// Identity multihash: the digest is the content itself.
pub const IDENTITY: u64 = 0x00;
/// SHA2-256 multihash.
pub const SHA2_256: u64 = 0x12;

/// Longest label allowed in a DNS name.
pub const DNS_LABEL_MAX_LENGTH: usize = 63;

/// Parse a CID from its string form.
pub fn parse_cid(input: &str) -> Result<Cid, GatewayError> {
    Cid::try_from(input).map_err(|e| GatewayError::InvalidCid {
        input: input.to_owned(),
        reason: e.to_string(),
    })
}

/// Build a CIDv1 over the SHA2-256 digest of `data`.
#[must_use]
pub fn sha256_cid(codec: u64, data: &[u8]) -> Cid {
    let digest = Sha256::digest(data);
    let hash = Multihash::<64>::wrap(SHA2_256, &digest[..])
        .expect("sha2-256 digest should fit in a multihash");
    Cid::new_v1(codec, hash)
}

/// Build a CIDv1 whose multihash inlines `data` verbatim.
pub fn identity_cid(codec: u64, data: &[u8]) -> Result<Cid, GatewayError> {
    let hash = Multihash::<64>::wrap(IDENTITY, data)
        .map_err(|e| GatewayError::BadRequest(format!("identity payload too large: {e}")))?;
    Ok(Cid::new_v1(codec, hash))
}

/// Whether the codec carries structured IPLD data rather than file bytes.
#[must_use]
pub fn is_structured_codec(codec: u64) -> bool {
    matches!(codec, JSON | CBOR | DAG_JSON | DAG_CBOR)
}

/// Human-readable codec name.
#[must_use]
pub fn codec_name(codec: u64) -> &'static str {
    match codec {
        RAW => "raw",
        DAG_PB => "dag-pb",
        DAG_CBOR => "dag-cbor",
        DAG_JSON => "dag-json",
        JSON => "json",
        CBOR => "cbor",
        LIBP2P_KEY => "libp2p-key",
        _ => "unknown",
    }
}

/// Decode a bare base58btc peer identifier (`Qm...` or `12D3Koo...`).
#[must_use]
pub fn parse_peer_id(input: &str) -> Option<Multihash<64>> {
    if !(input.starts_with("Qm") || input.starts_with('1')) {
        return None;
    }
    let bytes = Base::Base58Btc.decode(input).ok()?;
    Multihash::<64>::from_bytes(&bytes).ok()
}

/// Interpret a mutable-name root as a key CID, accepting CIDs of any codec
/// and bare peer identifiers. Returns `None` for DNS names.
#[must_use]
pub fn name_key_cid(input: &str) -> Option<Cid> {
    if let Some(hash) = parse_peer_id(input) {
        return Some(Cid::new_v1(LIBP2P_KEY, hash));
    }
    let cid = Cid::try_from(input).ok()?;
    Some(Cid::new_v1(LIBP2P_KEY, *cid.hash()))
}

/// Encode a CID as a single DNS label, preferring `base` and falling back to
/// base36 when the preferred encoding does not fit.
pub fn to_dns_label(cid: &Cid, base: Base) -> Result<String, GatewayError> {
    let cid = upgrade_v1(cid);
    let label = encode(&cid, base)?;
    if label.len() <= DNS_LABEL_MAX_LENGTH {
        return Ok(label);
    }
    let label = encode(&cid, Base::Base36Lower)?;
    if label.len() <= DNS_LABEL_MAX_LENGTH {
        return Ok(label);
    }
    Err(GatewayError::BadRequest(format!(
        "CID incompatible with DNS label length limit of {DNS_LABEL_MAX_LENGTH}: {label}"
    )))
}

/// The canonical DNS-safe form of an object root.
pub fn object_dns_label(cid: &Cid) -> Result<String, GatewayError> {
    to_dns_label(cid, Base::Base32Lower)
}

/// The canonical DNS-safe form of a key-based name root.
pub fn name_dns_label(key: &Cid) -> Result<String, GatewayError> {
    let key = Cid::new_v1(LIBP2P_KEY, *key.hash());
    to_dns_label(&key, Base::Base36Lower)
}

fn upgrade_v1(cid: &Cid) -> Cid {
    match cid.version() {
        Version::V0 => Cid::new_v1(cid.codec(), *cid.hash()),
        Version::V1 => *cid,
    }
}

fn encode(cid: &Cid, base: Base) -> Result<String, GatewayError> {
    cid.to_string_of_base(base)
        .map_err(|e| GatewayError::Internal(format!("cannot encode {cid}: {e}")))
}
