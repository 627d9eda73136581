//! Variable-length integers.
//!
//! Unsigned values use plain LEB128: 7-bit groups, least significant first,
//! high bit set on every byte but the last.
//!
//! Signed values fold the sign out before grouping. A negative `v` is stored
//! as the magnitude `!v` (so -1 becomes 0) with a sign flag. The first byte
//! is `[continue][sign][6 magnitude bits]`, every following byte is
//! `[continue][7 magnitude bits]`. One byte covers -64..=63, two bytes
//! -8192..=8191, and each extra byte adds 7 bits of magnitude.

use bytes::{Buf, BufMut};

use crate::{CodecError, Result, MAX_VAR32_BYTES, MAX_VAR64_BYTES};

const CONTINUE: u8 = 0x80;
const SIGN: u8 = 0x40;

pub fn put_var_u32<B: BufMut>(buf: &mut B, value: u32) {
    put_var_u64(buf, u64::from(value));
}

pub fn put_var_u64<B: BufMut>(buf: &mut B, mut value: u64) {
    loop {
        let group = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(group);
            return;
        }
        buf.put_u8(group | CONTINUE);
    }
}

pub fn get_var_u32<B: Buf>(buf: &mut B) -> Result<u32> {
    let value = get_unsigned(buf, MAX_VAR32_BYTES)?;
    u32::try_from(value).map_err(|_| CodecError::VarIntOverflow)
}

pub fn get_var_u64<B: Buf>(buf: &mut B) -> Result<u64> {
    let value = get_unsigned(buf, MAX_VAR64_BYTES)?;
    u64::try_from(value).map_err(|_| CodecError::VarIntOverflow)
}

pub fn put_var_i32<B: BufMut>(buf: &mut B, value: i32) {
    put_signed(buf, i64::from(value));
}

pub fn put_var_i64<B: BufMut>(buf: &mut B, value: i64) {
    put_signed(buf, value);
}

pub fn get_var_i32<B: Buf>(buf: &mut B) -> Result<i32> {
    let (negative, magnitude) = get_signed(buf, MAX_VAR32_BYTES)?;
    if magnitude > i32::MAX as u128 {
        return Err(CodecError::VarIntOverflow);
    }
    let magnitude = magnitude as i32;
    Ok(if negative { !magnitude } else { magnitude })
}

pub fn get_var_i64<B: Buf>(buf: &mut B) -> Result<i64> {
    let (negative, magnitude) = get_signed(buf, MAX_VAR64_BYTES)?;
    if magnitude > i64::MAX as u128 {
        return Err(CodecError::VarIntOverflow);
    }
    let magnitude = magnitude as i64;
    Ok(if negative { !magnitude } else { magnitude })
}

/// Number of bytes [`put_var_u32`] / [`put_var_u64`] emit for `value`.
pub fn unsigned_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Number of bytes [`put_var_i32`] / [`put_var_i64`] emit for `value`.
pub fn signed_len(value: i64) -> usize {
    let magnitude = (if value < 0 { !value } else { value }) as u64;
    let bits = 64 - magnitude.leading_zeros() as usize;
    1 + bits.saturating_sub(6).div_ceil(7)
}

fn put_signed<B: BufMut>(buf: &mut B, value: i64) {
    let negative = value < 0;
    let mut magnitude = (if negative { !value } else { value }) as u64;

    let mut first = (magnitude & 0x3F) as u8;
    if negative {
        first |= SIGN;
    }
    magnitude >>= 6;
    if magnitude == 0 {
        buf.put_u8(first);
        return;
    }
    buf.put_u8(first | CONTINUE);
    put_var_u64(buf, magnitude);
}

fn get_unsigned<B: Buf>(buf: &mut B, max_bytes: usize) -> Result<u128> {
    let mut value: u128 = 0;
    let mut shift = 0u32;
    for _ in 0..max_bytes {
        let byte = next_byte(buf)?;
        value |= u128::from(byte & 0x7F) << shift;
        if byte & CONTINUE == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(CodecError::VarIntTooLong { max_bytes })
}

fn get_signed<B: Buf>(buf: &mut B, max_bytes: usize) -> Result<(bool, u128)> {
    let first = next_byte(buf)?;
    let negative = first & SIGN != 0;
    let mut magnitude = u128::from(first & 0x3F);
    if first & CONTINUE == 0 {
        return Ok((negative, magnitude));
    }
    let rest = get_unsigned(buf, max_bytes - 1).map_err(|e| match e {
        CodecError::VarIntTooLong { .. } => CodecError::VarIntTooLong { max_bytes },
        other => other,
    })?;
    magnitude |= rest << 6;
    Ok((negative, magnitude))
}

fn next_byte<B: Buf>(buf: &mut B) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(CodecError::UnexpectedEof {
            needed: 1,
            remaining: 0,
        });
    }
    Ok(buf.get_u8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    fn encode_i32(value: i32) -> BytesMut {
        let mut buf = BytesMut::new();
        put_var_i32(&mut buf, value);
        buf
    }

    #[test]
    fn test_single_byte_range() {
        for v in -64..=63 {
            assert_eq!(encode_i32(v).len(), 1, "value {v}");
        }
        assert_eq!(encode_i32(64).len(), 2);
        assert_eq!(encode_i32(-65).len(), 2);
    }

    #[test]
    fn test_two_byte_range() {
        assert_eq!(encode_i32(8191).len(), 2);
        assert_eq!(encode_i32(-8192).len(), 2);
        assert_eq!(encode_i32(8192).len(), 3);
        assert_eq!(encode_i32(-8193).len(), 3);
    }

    #[test]
    fn test_extremes_use_five_bytes() {
        assert_eq!(encode_i32(i32::MAX).len(), 5);
        assert_eq!(encode_i32(i32::MIN).len(), 5);

        let mut buf = BytesMut::new();
        put_var_i64(&mut buf, i64::MIN);
        assert_eq!(buf.len(), 10);
        assert_eq!(get_var_i64(&mut buf.freeze()).unwrap(), i64::MIN);
    }

    #[test]
    fn test_length_grows_at_thresholds() {
        // (1 << n) - 1, 1 << n, -(1 << n), -(1 << n) - 1 for every n.
        let mut previous = 0;
        for n in 0..31u32 {
            let p = 1i64 << n;
            for v in [p - 1, p, -p, -p - 1] {
                let Ok(v) = i32::try_from(v) else { continue };
                let len = encode_i32(v).len();
                assert_eq!(len, signed_len(i64::from(v)), "value {v}");
                let magnitude_bits = 32 - (if v < 0 { !v } else { v }).leading_zeros() as usize;
                let expected = if magnitude_bits <= 6 {
                    1
                } else {
                    1 + (magnitude_bits - 6).div_ceil(7)
                };
                assert_eq!(len, expected, "value {v}");
            }
            let len = encode_i32(((1i64 << n) - 1) as i32).len();
            assert!(len >= previous);
            previous = len;
        }
    }

    #[test]
    fn test_sign_fold_is_complement() {
        // -1 folds to magnitude 0 with the sign bit set.
        assert_eq!(&encode_i32(-1)[..], &[SIGN]);
        assert_eq!(&encode_i32(0)[..], &[0]);
        assert_eq!(&encode_i32(63)[..], &[0x3F]);
        assert_eq!(&encode_i32(-64)[..], &[SIGN | 0x3F]);
    }

    #[test]
    fn test_too_long_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xFF; 6]);
        let err = get_var_i32(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, CodecError::VarIntTooLong { max_bytes: 5 }));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert!(get_var_u32(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_overflow_rejected() {
        // Five bytes, but the magnitude needs 34 bits.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xBF, 0xFF, 0xFF, 0xFF, 0x7F]);
        assert!(matches!(
            get_var_i32(&mut buf.freeze()),
            Err(CodecError::VarIntOverflow)
        ));
    }

    #[test]
    fn test_truncated_input() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x80);
        assert!(matches!(
            get_var_i32(&mut buf.freeze()),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_var_i32_roundtrip(v in any::<i32>()) {
            let mut bytes = encode_i32(v).freeze();
            prop_assert_eq!(bytes.len(), signed_len(i64::from(v)));
            prop_assert_eq!(get_var_i32(&mut bytes).unwrap(), v);
            prop_assert!(bytes.is_empty());
        }

        #[test]
        fn prop_var_i64_roundtrip(v in any::<i64>()) {
            let mut buf = BytesMut::new();
            put_var_i64(&mut buf, v);
            prop_assert!(buf.len() <= MAX_VAR64_BYTES);
            prop_assert_eq!(get_var_i64(&mut buf.freeze()).unwrap(), v);
        }

        #[test]
        fn prop_var_u64_roundtrip(v in any::<u64>()) {
            let mut buf = BytesMut::new();
            put_var_u64(&mut buf, v);
            prop_assert_eq!(buf.len(), unsigned_len(v));
            prop_assert_eq!(get_var_u64(&mut buf.freeze()).unwrap(), v);
        }
    }
}
