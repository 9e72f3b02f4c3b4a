//! Wire format for Google's Protocol Buffers, aka [protobuf](https://protobuf.dev).

use crate::error::DecodeError;
use crate::leb128;

/// Minimum value of a protobuf field id.
pub const MINIMUM_FIELD_ID: u32 = 1;
/// Maximum value of a protobuf field id.
pub const MAXIMUM_FIELD_ID: u32 = (1 << 29) - 1;

/// Denotes the type of a field in an encoded protobuf message.
///
/// Protobuf messages are a series of key-value pairs. When encoded each
/// key-value pair is turned into a record consisting of a field id, a
/// [`WireType`], and a payload. The [`WireType`] indicates how large the
/// proceeding payload is.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum WireType {
    /// Variable length integer.
    ///
    /// Used for: `int32`, `int64`, `uint32`, `uint64`, `sint32`, `sint64`, `bool`, `enum`.
    Varint = 0,
    /// 64-bit integer.
    ///
    /// Used for: `fixed64`, `sfixed64`, `double`.
    I64 = 1,
    /// Variable length field.
    ///
    /// Used for: `string`, `bytes`, `message`, packed `repeated` fields.
    Len = 2,
    /// Group start (deprecated).
    SGroup = 3,
    /// Group end (deprecated).
    EGroup = 4,
    /// 32-bit integer.
    ///
    /// Used for: `fixed32`, `sfixed32`, `float`.
    I32 = 5,
}

impl WireType {
    /// Try to decode a [`WireType`] from the provided raw value.
    #[inline(always)]
    pub const fn from_val(value: u8) -> Option<Self> {
        match value {
            0 => Some(WireType::Varint),
            1 => Some(WireType::I64),
            2 => Some(WireType::Len),
            3 => Some(WireType::SGroup),
            4 => Some(WireType::EGroup),
            5 => Some(WireType::I32),
            _other => None,
        }
    }

    /// Return the raw value for this [`WireType`].
    #[inline(always)]
    pub const fn into_val(self) -> u8 {
        self as u8
    }
}

/// A decoded protobuf record key combining a field id and a [`WireType`].
///
/// On the wire a key is a single varint whose low three bits are the wire
/// type and whose remaining bits are the field id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordKey {
    /// The field id (tag) component of the key.
    pub field_id: u32,
    /// The wire type component of the key.
    pub wire_type: WireType,
}

impl RecordKey {
    /// Splits a raw key value into its components, validating the wire type
    /// bits and the field id range.
    #[inline]
    pub fn from_raw(raw: u32) -> Result<Self, DecodeError> {
        let wire_bits = (raw & 0b111) as u8;
        let field_id = raw >> 3;

        match WireType::from_val(wire_bits) {
            Some(wire_type) if field_id >= MINIMUM_FIELD_ID => Ok(RecordKey {
                field_id,
                wire_type,
            }),
            _ => Err(DecodeError::InvalidKey {
                wire_type: wire_bits,
                field_id,
            }),
        }
    }

    /// Returns the raw on-the-wire value of this key.
    ///
    /// The maximum field id is `2^29 - 1` so the raw key always fits in 32
    /// bits.
    #[inline(always)]
    pub const fn raw(self) -> u32 {
        (self.field_id << 3) | self.wire_type.into_val() as u32
    }
}

/// Decodes the key of the next record from a protobuf-encoded message.
///
/// This is called once per record, for every record in a message.
#[inline]
pub fn decode_key<B: bytes::Buf>(buf: &mut B) -> Result<RecordKey, DecodeError> {
    let raw = leb128::read_u32(buf)?;
    RecordKey::from_raw(raw)
}

/// Encodes a record key as a single varint.
#[inline]
pub fn encode_key<B: bytes::BufMut>(key: RecordKey, buf: &mut B) {
    leb128::write_u64(u64::from(key.raw()), buf);
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn proptest_key_roundtrips() {
        fn arb_field_id() -> impl Strategy<Value = u32> {
            MINIMUM_FIELD_ID..=MAXIMUM_FIELD_ID
        }

        fn arb_wiretype() -> impl Strategy<Value = WireType> {
            (0..=5u8).prop_map(|val| WireType::from_val(val).expect("known valid"))
        }

        fn test(field_id: u32, wire_type: WireType) {
            let mut buf = Vec::with_capacity(8);
            encode_key(RecordKey { field_id, wire_type }, &mut buf);
            let rnd = decode_key(&mut &buf[..]).unwrap();

            assert_eq!(field_id, rnd.field_id);
            assert_eq!(wire_type, rnd.wire_type);
        }

        let strat = (arb_field_id(), arb_wiretype());
        proptest!(|((field_id, wire_type) in strat)| test(field_id, wire_type))
    }

    #[test]
    fn test_all_wire_type_values() {
        for i in u8::MIN..u8::MAX {
            let wire_type = WireType::from_val(i);
            match (i, wire_type) {
                (0, Some(WireType::Varint))
                | (1, Some(WireType::I64))
                | (2, Some(WireType::Len))
                | (3, Some(WireType::SGroup))
                | (4, Some(WireType::EGroup))
                | (5, Some(WireType::I32)) => (),
                (_, None) => (),
                other => panic!("unexpected value {other:?}"),
            }
        }
    }

    #[test]
    fn test_decode_key() {
        // Field 1, wire type 0 (varint): key = (1 << 3) | 0 = 8.
        let mut buf = &[0x08][..];
        let key = decode_key(&mut buf).unwrap();
        assert_eq!(key.field_id, 1);
        assert_eq!(key.wire_type, WireType::Varint);

        // Field 2, wire type 2 (len): key = (2 << 3) | 2 = 18.
        let mut buf = &[0x12][..];
        let key = decode_key(&mut buf).unwrap();
        assert_eq!(key.field_id, 2);
        assert_eq!(key.wire_type, WireType::Len);
    }

    #[test]
    fn test_invalid_keys() {
        // Wire type 6 does not exist.
        let mut buf = &[0x0e][..];
        assert_eq!(
            decode_key(&mut buf),
            Err(DecodeError::InvalidKey {
                wire_type: 6,
                field_id: 1
            })
        );

        // Field id 0 is reserved.
        let mut buf = &[0x00][..];
        assert_eq!(
            decode_key(&mut buf),
            Err(DecodeError::InvalidKey {
                wire_type: 0,
                field_id: 0
            })
        );
    }
}
