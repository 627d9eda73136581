//! Arbor Codec -- bit-packed byte buffers for the arbor wire protocol.
//!
//! Booleans and fixed-width fields share a rolling byte. Every other write is
//! byte-aligned and seals the rolling byte first. Nothing on the wire says
//! which operation produced which bytes: a reader must call the matching read
//! operations in the order the writer called the write operations.
//!
//! The checking variant ([`BitEncoder::checking`] / [`BitDecoder::checking`])
//! records that order on the write side and validates it on the read side.

pub mod bits;
pub mod check;
pub mod ident;
pub mod varint;

pub use bits::{enum_bit_width, BitDecoder, BitEncoder, WireEnum};
pub use check::{Op, OpLog};
pub use ident::Identifier;

/// Default upper bound for strings read without an explicit limit.
pub const MAX_STRING_BYTES: usize = 32 * 1024;

/// Upper bound for the textual form of an [`Identifier`].
pub const MAX_IDENTIFIER_BYTES: usize = 256;

/// Maximum encoded size of a signed or unsigned 32-bit varint.
pub const MAX_VAR32_BYTES: usize = 5;

/// Maximum encoded size of a signed or unsigned 64-bit varint.
pub const MAX_VAR64_BYTES: usize = 10;

/// Broad classification of codec and protocol failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The bytes cannot be decoded. Drop the message, keep the connection.
    Malformed,
    /// Programmer error on the local side (bad arguments, bad tree).
    Misuse,
    /// Checking codec only: the read sequence diverged from the write sequence.
    DebugMismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of buffer: need {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("invalid bit count {0} (expected 1..=32)")]
    InvalidBitCount(u32),
    #[error("value {value} does not fit in {bits} bits")]
    ValueOutOfRange { value: u64, bits: u32 },
    #[error("enum codec needs at least one variant")]
    EmptyEnum,
    #[error("enum ordinal {ordinal} out of range for {count} variants")]
    EnumOutOfRange { ordinal: u32, count: u32 },
    #[error("varint longer than {max_bytes} bytes")]
    VarIntTooLong { max_bytes: usize },
    #[error("varint value exceeds the target width")]
    VarIntOverflow,
    #[error("string of {len} bytes exceeds limit {max}")]
    StringTooLong { len: usize, max: usize },
    #[error("byte block of {len} bytes exceeds limit {max}")]
    BlockTooLong { len: usize, max: usize },
    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("operation {index}: written as {written}, read as {read}")]
    Mismatch { index: usize, written: Op, read: Op },
    #[error("operation {index}: read {read} past the end of the write log")]
    Exhausted { index: usize, read: Op },
    #[error("{unread} written operations never read (first at {index})")]
    Unconsumed { index: usize, unread: usize },
}

impl CodecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodecError::InvalidBitCount(_)
            | CodecError::EmptyEnum
            | CodecError::ValueOutOfRange { .. } => ErrorKind::Misuse,
            CodecError::Mismatch { .. }
            | CodecError::Exhausted { .. }
            | CodecError::Unconsumed { .. } => ErrorKind::DebugMismatch,
            _ => ErrorKind::Malformed,
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
