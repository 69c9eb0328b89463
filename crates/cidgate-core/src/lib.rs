//! Core of the cidgate content gateway.
//!
//! This crate holds everything below the HTTP layer:
//!
//! - **Paths** ([`path`]): namespaced content paths and the metadata that
//!   resolving them produces.
//! - **CIDs** ([`cids`]): multicodec constants, parsing, and DNS-safe
//!   encodings.
//! - **Codecs** ([`codec`]): the IPLD data model shared by DAG-JSON,
//!   DAG-CBOR, plain JSON/CBOR, and dag-pb directories.
//! - **CAR** ([`car`]): streaming CARv1 export and in-memory import.
//! - **Backend** ([`backend`]): the [`GatewayBackend`] trait the HTTP layer
//!   serves content through.
//! - **Memory** ([`memory`]): an in-memory backend for tests and local use.
//! - **Errors** ([`error`]): [`GatewayError`] and its HTTP classification.

pub mod backend;
pub mod car;
pub mod cids;
pub mod codec;
pub mod error;
pub mod memory;
pub mod path;

pub use backend::{
    ByteRange, DirEntry, DirectoryEntries, DirectoryListing, ExportStream, FileContent,
    GatewayBackend, GetResponse, HeadResponse, UnixfsNode,
};
pub use cid::Cid;
pub use error::{ErrorKind, GatewayError};
pub use memory::MemoryBackend;
pub use path::{ContentPath, ImmutablePath, Namespace, PathMetadata, ResolvedPath};
