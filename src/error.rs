use thiserror::Error;

/// Fatal errors: always surfaced to the caller, regardless of strict mode.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay does not match the expected signature")]
    InvalidSignature,
    #[error("encrypted payload length {0} is not a multiple of the Blowfish block size")]
    TruncatedCipher(usize),
    #[error("inflated size {actual} does not match the header's declared size {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("no schema is available for client version {0}")]
    UnsupportedVersion(String),
    #[error("schema inconsistency: {0}")]
    SchemaError(String),
    #[error("restricted decoder encountered a forbidden global: {module}.{name}")]
    ForbiddenGlobal { module: String, name: String },
    #[error("battle results arena id {found} does not match the arena id {expected} set earlier in the replay")]
    ArenaIdMismatch { expected: u64, found: u64 },
    #[error("replay ended before a BattleResults packet was observed")]
    IncompleteReplay,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("packet parsing failed: {0}")]
    Parse(String),
    #[error("{0}")]
    Packet(#[from] PacketError),
}

/// Per-packet recoverable errors. In strict mode these abort the parse; in non-strict
/// mode they are logged (with time, type, and a hex dump of the offending payload) and
/// the packet is skipped, leaving prior controller state untouched.
#[derive(Debug, Error, Clone)]
pub enum PacketError {
    #[error("unknown packet type 0x{0:x}")]
    UnknownPacketType(u32),
    #[error("payload for packet type 0x{packet_type:x} was truncated: needed {needed} more bytes")]
    TruncatedPayload { packet_type: u32, needed: usize },
    #[error("payload for packet type 0x{packet_type:x} had {remaining} trailing bytes after its fixed-shape fields")]
    TrailingBytes { packet_type: u32, remaining: usize },
    #[error("entity {entity_id} of type {type_name} has no property/method at index {index}")]
    SchemaMismatch {
        entity_id: u32,
        type_name: String,
        index: usize,
    },
    #[error("entity {entity_id} of type {type_name} left {remaining} trailing bytes after decoding index {index}")]
    TrailingPropertyBytes {
        entity_id: u32,
        type_name: String,
        index: usize,
        remaining: usize,
    },
    #[error("dispatch of {type_name}::{member} failed: {reason}")]
    DispatchFailure {
        type_name: String,
        member: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, ReplayError>;
