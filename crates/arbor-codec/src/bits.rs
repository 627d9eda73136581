//! Bit-packed encoder and decoder over `bytes` buffers.
//!
//! Rolling byte: the first boolean (or fixed-width bit) reserves a byte at the
//! current write position and fills it from the most significant bit down.
//! Further bits go into the same byte until eight have been written or a
//! byte-aligned write seals it. The decoder mirrors this exactly.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::check::{Op, OpLog};
use crate::ident::Identifier;
use crate::{varint, CodecError, Result, MAX_IDENTIFIER_BYTES};

/// Rust enums with a fixed variant count, encoded as their ordinal in the
/// minimal number of bits.
pub trait WireEnum: Sized {
    const COUNT: u32;

    fn ordinal(&self) -> u32;

    fn from_ordinal(ordinal: u32) -> Option<Self>;
}

/// Bits needed to encode an ordinal among `count` values.
pub fn enum_bit_width(count: u32) -> Result<u32> {
    match count {
        0 => Err(CodecError::EmptyEnum),
        1 => Ok(0),
        n => Ok(32 - (n - 1).leading_zeros()),
    }
}

fn check_bit_count(bits: u32) -> Result<()> {
    if bits == 0 || bits > 32 {
        return Err(CodecError::InvalidBitCount(bits));
    }
    Ok(())
}

// ============================================================================
// Encoder
// ============================================================================

#[derive(Debug, Default)]
pub struct BitEncoder {
    buf: BytesMut,
    /// Position of the rolling byte inside `buf`.
    bit_index: usize,
    /// Bits already used in the rolling byte; 0 means no open byte.
    bit_count: u8,
    log: Option<OpLog>,
}

impl BitEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// An encoder that records every operation for a checking decoder.
    pub fn checking() -> Self {
        Self {
            log: Some(OpLog::default()),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> BytesMut {
        self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    /// Frozen bytes plus the operation log (empty unless built with
    /// [`BitEncoder::checking`]).
    pub fn finish_checked(self) -> (Bytes, OpLog) {
        (self.buf.freeze(), self.log.unwrap_or_default())
    }

    fn record(&mut self, op: Op) {
        if let Some(log) = &mut self.log {
            log.push(op);
        }
    }

    fn seal(&mut self) {
        self.bit_count = 0;
    }

    fn push_bit(&mut self, bit: bool) {
        if self.bit_count == 0 {
            self.bit_index = self.buf.len();
            self.buf.put_u8(0);
        }
        if bit {
            self.buf[self.bit_index] |= 0x80 >> self.bit_count;
        }
        self.bit_count = (self.bit_count + 1) % 8;
    }

    fn push_bits(&mut self, value: u32, bits: u32) {
        for shift in (0..bits).rev() {
            self.push_bit((value >> shift) & 1 == 1);
        }
    }

    pub fn write_bool(&mut self, value: bool) {
        self.record(Op::Bool);
        self.push_bit(value);
    }

    /// Writes the low `bits` bits of `value`, most significant first.
    pub fn write_fixed_bits(&mut self, value: u32, bits: u32) -> Result<()> {
        check_bit_count(bits)?;
        if bits < 32 && value >> bits != 0 {
            return Err(CodecError::ValueOutOfRange {
                value: u64::from(value),
                bits,
            });
        }
        self.record(Op::Bits(bits as u8));
        self.push_bits(value, bits);
        Ok(())
    }

    /// Writes `ordinal` using `ceil(log2(count))` bits. One-valued
    /// enumerations write nothing.
    pub fn write_enum(&mut self, ordinal: u32, count: u32) -> Result<()> {
        let bits = enum_bit_width(count)?;
        if ordinal >= count {
            return Err(CodecError::ValueOutOfRange {
                value: u64::from(ordinal),
                bits,
            });
        }
        self.record(Op::Enum(count));
        self.push_bits(ordinal, bits);
        Ok(())
    }

    pub fn write_enum_value<E: WireEnum>(&mut self, value: &E) -> Result<()> {
        self.write_enum(value.ordinal(), E::COUNT)
    }

    pub fn write_u8(&mut self, value: u8) {
        self.record(Op::U8);
        self.seal();
        self.buf.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.record(Op::U16);
        self.seal();
        self.buf.put_u16(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.record(Op::U32);
        self.seal();
        self.buf.put_u32(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.record(Op::U64);
        self.seal();
        self.buf.put_u64(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.record(Op::F32);
        self.seal();
        self.buf.put_f32(value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.record(Op::F64);
        self.seal();
        self.buf.put_f64(value);
    }

    pub fn write_var_i32(&mut self, value: i32) {
        self.record(Op::VarI32);
        self.seal();
        varint::put_var_i32(&mut self.buf, value);
    }

    pub fn write_var_i64(&mut self, value: i64) {
        self.record(Op::VarI64);
        self.seal();
        varint::put_var_i64(&mut self.buf, value);
    }

    pub fn write_var_u32(&mut self, value: u32) {
        self.record(Op::VarU32);
        self.seal();
        varint::put_var_u32(&mut self.buf, value);
    }

    pub fn write_var_u64(&mut self, value: u64) {
        self.record(Op::VarU64);
        self.seal();
        varint::put_var_u64(&mut self.buf, value);
    }

    /// Length-prefixed raw bytes.
    pub fn write_byte_block(&mut self, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| CodecError::BlockTooLong {
            len: data.len(),
            max: u32::MAX as usize,
        })?;
        self.record(Op::ByteBlock);
        self.seal();
        varint::put_var_u32(&mut self.buf, len);
        self.buf.put_slice(data);
        Ok(())
    }

    /// Length-prefixed UTF-8. Fails rather than truncating when `value` is
    /// longer than `max_len` bytes.
    pub fn write_str(&mut self, value: &str, max_len: usize) -> Result<()> {
        let len = u32::try_from(value.len())
            .ok()
            .filter(|_| value.len() <= max_len)
            .ok_or(CodecError::StringTooLong {
                len: value.len(),
                max: max_len,
            })?;
        self.record(Op::Str);
        self.put_str(value, len);
        Ok(())
    }

    pub fn write_identifier(&mut self, id: &Identifier) {
        let text = id.to_string();
        // Bounded by MAX_IDENTIFIER_BYTES at construction.
        debug_assert!(text.len() <= MAX_IDENTIFIER_BYTES);
        self.record(Op::Identifier);
        self.put_str(&text, text.len() as u32);
    }

    fn put_str(&mut self, value: &str, len: u32) {
        self.seal();
        varint::put_var_u32(&mut self.buf, len);
        self.buf.put_slice(value.as_bytes());
    }
}

// ============================================================================
// Decoder
// ============================================================================

#[derive(Debug)]
struct Checker {
    log: OpLog,
    cursor: usize,
}

#[derive(Debug)]
pub struct BitDecoder {
    buf: Bytes,
    current: u8,
    bit_count: u8,
    check: Option<Checker>,
}

impl BitDecoder {
    pub fn new(buf: Bytes) -> Self {
        Self {
            buf,
            current: 0,
            bit_count: 0,
            check: None,
        }
    }

    /// A decoder that validates every read against the writer's log.
    pub fn checking(buf: Bytes, log: OpLog) -> Self {
        Self {
            check: Some(Checker { log, cursor: 0 }),
            ..Self::new(buf)
        }
    }

    /// Unread whole bytes. Bits left in a partially read rolling byte are
    /// not counted.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn has_remaining(&self) -> bool {
        self.buf.has_remaining()
    }

    /// The unread bytes.
    pub fn into_remaining(self) -> Bytes {
        self.buf
    }

    /// Fails if a checking decoder left written operations unread.
    pub fn finish_checked(&self) -> Result<()> {
        if let Some(check) = &self.check {
            if check.cursor < check.log.len() {
                return Err(CodecError::Unconsumed {
                    index: check.cursor,
                    unread: check.log.len() - check.cursor,
                });
            }
        }
        Ok(())
    }

    fn expect(&mut self, read: Op) -> Result<()> {
        let Some(check) = &mut self.check else {
            return Ok(());
        };
        let index = check.cursor;
        match check.log.get(index) {
            Some(written) if written == read => {
                check.cursor += 1;
                Ok(())
            }
            Some(written) => Err(CodecError::Mismatch {
                index,
                written,
                read,
            }),
            None => Err(CodecError::Exhausted { index, read }),
        }
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        let remaining = self.buf.remaining();
        if remaining < needed {
            return Err(CodecError::UnexpectedEof { needed, remaining });
        }
        Ok(())
    }

    fn seal(&mut self) {
        self.bit_count = 0;
    }

    fn pull_bit(&mut self) -> Result<bool> {
        if self.bit_count == 0 {
            self.ensure(1)?;
            self.current = self.buf.get_u8();
        }
        let bit = self.current & (0x80 >> self.bit_count) != 0;
        self.bit_count = (self.bit_count + 1) % 8;
        Ok(bit)
    }

    fn pull_bits(&mut self, bits: u32) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..bits {
            value = (value << 1) | u32::from(self.pull_bit()?);
        }
        Ok(value)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.expect(Op::Bool)?;
        self.pull_bit()
    }

    pub fn read_fixed_bits(&mut self, bits: u32) -> Result<u32> {
        check_bit_count(bits)?;
        self.expect(Op::Bits(bits as u8))?;
        self.pull_bits(bits)
    }

    pub fn read_enum(&mut self, count: u32) -> Result<u32> {
        let bits = enum_bit_width(count)?;
        self.expect(Op::Enum(count))?;
        let ordinal = self.pull_bits(bits)?;
        if ordinal >= count {
            return Err(CodecError::EnumOutOfRange { ordinal, count });
        }
        Ok(ordinal)
    }

    pub fn read_enum_value<E: WireEnum>(&mut self) -> Result<E> {
        let ordinal = self.read_enum(E::COUNT)?;
        E::from_ordinal(ordinal).ok_or(CodecError::EnumOutOfRange {
            ordinal,
            count: E::COUNT,
        })
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.expect(Op::U8)?;
        self.seal();
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.expect(Op::U16)?;
        self.seal();
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.expect(Op::U32)?;
        self.seal();
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.expect(Op::U64)?;
        self.seal();
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.expect(Op::F32)?;
        self.seal();
        self.ensure(4)?;
        Ok(self.buf.get_f32())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.expect(Op::F64)?;
        self.seal();
        self.ensure(8)?;
        Ok(self.buf.get_f64())
    }

    pub fn read_var_i32(&mut self) -> Result<i32> {
        self.expect(Op::VarI32)?;
        self.seal();
        varint::get_var_i32(&mut self.buf)
    }

    pub fn read_var_i64(&mut self) -> Result<i64> {
        self.expect(Op::VarI64)?;
        self.seal();
        varint::get_var_i64(&mut self.buf)
    }

    pub fn read_var_u32(&mut self) -> Result<u32> {
        self.expect(Op::VarU32)?;
        self.seal();
        varint::get_var_u32(&mut self.buf)
    }

    pub fn read_var_u64(&mut self) -> Result<u64> {
        self.expect(Op::VarU64)?;
        self.seal();
        varint::get_var_u64(&mut self.buf)
    }

    /// Reads a length-prefixed block without copying.
    pub fn read_byte_block(&mut self, max_len: usize) -> Result<Bytes> {
        self.expect(Op::ByteBlock)?;
        self.seal();
        let len = varint::get_var_u32(&mut self.buf)? as usize;
        if len > max_len {
            return Err(CodecError::BlockTooLong { len, max: max_len });
        }
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn read_str(&mut self, max_len: usize) -> Result<String> {
        self.expect(Op::Str)?;
        self.pull_str(max_len)
    }

    /// Reads an identifier; a string that is not a valid identifier is an
    /// error.
    pub fn read_identifier(&mut self) -> Result<Identifier> {
        self.expect(Op::Identifier)?;
        self.pull_str(MAX_IDENTIFIER_BYTES)?.parse()
    }

    /// Like [`read_identifier`](Self::read_identifier), but a well-formed
    /// string that is not a valid identifier yields `Ok(None)`. Broken
    /// payloads (truncated, oversized, bad UTF-8) are still errors.
    pub fn read_identifier_safe(&mut self) -> Result<Option<Identifier>> {
        self.expect(Op::Identifier)?;
        let text = self.pull_str(MAX_IDENTIFIER_BYTES)?;
        Ok(text.parse().ok())
    }

    fn pull_str(&mut self, max_len: usize) -> Result<String> {
        self.seal();
        let len = varint::get_var_u32(&mut self.buf)? as usize;
        if len > max_len {
            return Err(CodecError::StringTooLong { len, max: max_len });
        }
        self.ensure(len)?;
        let raw = self.buf.split_to(len);
        Ok(String::from_utf8(raw.to_vec())?)
    }
}
