//! Arbor Protocol -- endpoint tree, id negotiation, dynamic parents, caches.
//!
//! Endpoints are declared once into a [`Tree`] with [`TreeBuilder`]. Each peer
//! link owns a [`Connection`] that maps tree paths to small integers on first
//! use: the first message on a path is preceded by an announce (wire id 0)
//! carrying the path's dotted name chain, later messages carry only the id.
//!
//! Every message on the wire starts with a 4-byte big-endian tag, then the
//! encoded key values of the path, then the endpoint payload.

pub mod builder;
pub mod cache;
pub mod connection;
pub mod context;
pub mod dynamic;
pub mod ids;
pub mod limits;
pub mod path;
pub mod tree;

pub use arbor_codec::ErrorKind;
pub use builder::{EndpointRef, LinkRef, Parent, TreeBuilder};
pub use cache::{CacheStore, Equivalence, KeyEquivalence, NaturalEquivalence, ObjectCache};
pub use connection::{Connection, Delivery, Outbound, Priority};
pub use context::{ContextKey, Direction, MessageContext, MissingKeys, Value};
pub use dynamic::DynamicLink;
pub use limits::{ProtocolRevision, CURRENT_REVISION, REVISION_0};
pub use path::{Path, ResolvedPath};
pub use tree::{LengthHint, NodeIndex, Tree};

use arbor_codec::CodecError;

/// Tag of the announce message that binds a path to an id.
pub const ID_ANNOUNCE: u32 = 0;

/// Tag of the batch container frame (handled by the session layer).
pub const ID_BATCH: u32 = 1;

/// Tag of the bandwidth advertisement frame (handled by the session layer).
pub const ID_BANDWIDTH: u32 = 2;

/// First id handed out to a path.
pub const FIRST_ALLOCATED_ID: u32 = CURRENT_REVISION.reserved_ids;

/// Size of the wire tag in front of every message.
pub const TAG_BYTES: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("unknown id {0}")]
    UnknownId(u32),
    #[error("id {0} is reserved")]
    ReservedId(u32),
    #[error("id {id} out of range (max {max})")]
    IdOutOfRange { id: u32, max: u32 },
    #[error("outgoing ids exhausted (max {max})")]
    IdsExhausted { max: u32 },
    #[error("id {id} already bound to '{existing}'")]
    DuplicateId { id: u32, existing: String },
    #[error("no node '{name}' under '{parent}'")]
    UnknownName { parent: String, name: String },
    #[error("'{0}' is not an endpoint")]
    NotAnEndpoint(String),
    #[error("path depth {depth} exceeds {max}")]
    PathTooDeep { depth: usize, max: usize },
    #[error("{remaining} trailing bytes after '{path}'")]
    TrailingBytes { path: String, remaining: usize },
    #[error("cache '{cache}': id {id} not yet known")]
    CacheUnknownId { cache: String, id: u32 },
    #[error("cache '{cache}': id {id} announced twice")]
    CacheDuplicate { cache: String, id: u32 },
    #[error("cache '{cache}' is full ({max} entries)")]
    CacheFull { cache: String, max: u32 },
    #[error("dynamic node '{0}' has no parent for this value")]
    UnresolvedDynamic(String),
    #[error("link '{link}' does not target dynamic node '{dynamic}'")]
    LinkMismatch { link: String, dynamic: String },
    #[error("node #{0} does not belong to this tree")]
    UnknownNode(u32),
    #[error("'{0}' is not a dynamic node")]
    NotDynamic(String),
    #[error("context value is not a {expected}")]
    ValueType { expected: &'static str },
    #[error("no context value for '{0}'")]
    MissingValue(String),
    #[error("duplicate name '{name}' under '{parent}'")]
    DuplicateName { parent: String, name: String },
    #[error("invalid node name '{0}'")]
    InvalidName(String),
    #[error("handler rejected message: {0}")]
    Handler(String),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Codec(e) => e.kind(),
            ProtocolError::IdsExhausted { .. }
            | ProtocolError::CacheFull { .. }
            | ProtocolError::UnresolvedDynamic(_)
            | ProtocolError::LinkMismatch { .. }
            | ProtocolError::NotDynamic(_)
            | ProtocolError::UnknownNode(_)
            | ProtocolError::ValueType { .. }
            | ProtocolError::MissingValue(_)
            | ProtocolError::DuplicateName { .. }
            | ProtocolError::InvalidName(_) => ErrorKind::Misuse,
            _ => ErrorKind::Malformed,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
