//! Operation log for the checking codec.
//!
//! A checking [`BitEncoder`](crate::BitEncoder) appends one [`Op`] per
//! top-level write call. A checking [`BitDecoder`](crate::BitDecoder) walks
//! the same log and fails on the first read that does not match, naming the
//! operation index. Composite writes (strings, identifiers, byte blocks) are
//! logged once, not per internal varint.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Bool,
    Bits(u8),
    Enum(u32),
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    VarI32,
    VarI64,
    VarU32,
    VarU64,
    ByteBlock,
    Str,
    Identifier,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Bits(n) => write!(f, "bits({n})"),
            Op::Enum(count) => write!(f, "enum({count})"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

/// Ordered record of the operations a checking encoder performed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpLog {
    ops: Vec<Op>,
}

impl OpLog {
    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub fn get(&self, index: usize) -> Option<Op> {
        self.ops.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Op> {
        self.ops.iter()
    }
}
