//! Runtime descriptors that dictate message layout.
//!
//! A [`MessageDescriptor`] plays the role generated types play in other
//! protobuf runtimes: it names each field, its wire semantics, and the byte
//! offset of its storage inside a message region. Descriptors are long-lived
//! and read-only; the decoder only ever looks at them.

use core::fmt;
use core::mem::{align_of, size_of};

use crate::error::DescriptorError;
use crate::message::{MessageHeader, ProtoBytes, ProtoString, RawList, MESSAGE_ALIGN};
use crate::wire::WireType;

/// Sentinel validating that a value really is a [`MessageDescriptor`].
pub const MESSAGE_DESCRIPTOR_MAGIC: u32 = 0x4d44_5347;

/// Optional custom initializer a descriptor may supply for its message
/// region.
///
/// # Safety
///
/// The callee must initialize all `len` bytes of `region` to a valid message
/// state, including stamping the descriptor pointer into the header.
pub type MessageInitFn = unsafe fn(region: *mut u8, len: usize);

/// The declared type of a message field.
///
/// This is a closed enumeration over the protobuf scalar and compound kinds;
/// deprecated groups have no representation here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int32,
    Sint32,
    Uint32,
    Sfixed32,
    Fixed32,
    Float,
    Int64,
    Sint64,
    Uint64,
    Sfixed64,
    Fixed64,
    Double,
    Bool,
    Enum,
    String,
    Bytes,
    Message,
}

impl FieldType {
    /// The wire type records of this field type are framed with.
    ///
    /// Packable repeated fields may additionally arrive as a single
    /// [`WireType::Len`] record.
    pub const fn wire_type(self) -> WireType {
        match self {
            FieldType::Int32
            | FieldType::Sint32
            | FieldType::Uint32
            | FieldType::Int64
            | FieldType::Sint64
            | FieldType::Uint64
            | FieldType::Bool
            | FieldType::Enum => WireType::Varint,
            FieldType::Sfixed32 | FieldType::Fixed32 | FieldType::Float => WireType::I32,
            FieldType::Sfixed64 | FieldType::Fixed64 | FieldType::Double => WireType::I64,
            FieldType::String | FieldType::Bytes | FieldType::Message => WireType::Len,
        }
    }

    /// Element width used when sizing a repeated field's backing store.
    pub const fn repeated_ele_size(self) -> usize {
        match self {
            FieldType::Int32
            | FieldType::Sint32
            | FieldType::Uint32
            | FieldType::Sfixed32
            | FieldType::Fixed32
            | FieldType::Float
            | FieldType::Enum => 4,
            FieldType::Int64
            | FieldType::Sint64
            | FieldType::Uint64
            | FieldType::Sfixed64
            | FieldType::Fixed64
            | FieldType::Double => 8,
            FieldType::Bool => size_of::<bool>(),
            FieldType::String => size_of::<ProtoString>(),
            FieldType::Bytes => size_of::<ProtoBytes>(),
            FieldType::Message => size_of::<*mut MessageHeader>(),
        }
    }

    /// Natural alignment of a repeated element, paired with
    /// [`repeated_ele_size`](Self::repeated_ele_size) when allocating.
    pub(crate) const fn repeated_ele_align(self) -> usize {
        match self {
            FieldType::Int32
            | FieldType::Sint32
            | FieldType::Uint32
            | FieldType::Sfixed32
            | FieldType::Fixed32
            | FieldType::Float
            | FieldType::Enum => 4,
            FieldType::Int64
            | FieldType::Sint64
            | FieldType::Uint64
            | FieldType::Sfixed64
            | FieldType::Fixed64
            | FieldType::Double => 8,
            FieldType::Bool => 1,
            FieldType::String => align_of::<ProtoString>(),
            FieldType::Bytes => align_of::<ProtoBytes>(),
            FieldType::Message => align_of::<*mut MessageHeader>(),
        }
    }

    /// Whether repeated fields of this type may use the packed encoding.
    ///
    /// Everything except strings, bytes, and messages is packable.
    pub const fn is_packable(self) -> bool {
        !matches!(self, FieldType::String | FieldType::Bytes | FieldType::Message)
    }
}

/// How many values a field may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    /// Exactly one value; its absence fails the parse.
    Required,
    /// Zero or one value, tracked by a presence bit.
    Optional,
    /// Any number of values, stored in a [`RawList`].
    Repeated,
}

/// Bitset of per-field behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldFlags(u32);

impl FieldFlags {
    /// No flags set.
    pub const NONE: FieldFlags = FieldFlags(0);
    /// Repeated field uses the packed encoding when serialized.
    pub const PACKED: FieldFlags = FieldFlags(1 << 0);
    /// Field is a member of a oneof group; `quantifier_offset` addresses the
    /// group's discriminator.
    pub const ONEOF: FieldFlags = FieldFlags(1 << 1);

    /// Combines two flag sets.
    pub const fn union(self, other: FieldFlags) -> FieldFlags {
        FieldFlags(self.0 | other.0)
    }

    /// Whether all bits of `other` are set in `self`.
    pub const fn contains(self, other: FieldFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Default applied to a non-repeated field when the input carries no record
/// for it.
///
/// String and message defaults are intentionally absent; such fields stay
/// null when unset.
#[derive(Debug, Clone, Copy)]
pub enum DefaultValue {
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Enum(i32),
    Bytes(&'static [u8]),
}

/// The descriptor a message- or enum-typed field points at.
#[derive(Clone, Copy)]
pub enum SubDescriptor {
    /// Layout of the nested message.
    Message(&'static MessageDescriptor),
    /// Value table of the enum.
    Enum(&'static EnumDescriptor),
}

impl fmt::Debug for SubDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubDescriptor::Message(d) => write!(f, "Message({})", d.name),
            SubDescriptor::Enum(d) => write!(f, "Enum({})", d.name),
        }
    }
}

/// A single named value of an enum.
#[derive(Debug, Clone, Copy)]
pub struct EnumValue {
    /// The value's declared name.
    pub name: &'static str,
    /// The value's wire number.
    pub number: i32,
}

/// Value table for an enum type.
#[derive(Debug, Clone, Copy)]
pub struct EnumDescriptor {
    /// The enum's declared name.
    pub name: &'static str,
    /// All declared values. Aliased numbers may appear more than once; the
    /// first occurrence is canonical.
    pub values: &'static [EnumValue],
}

impl EnumDescriptor {
    /// Returns the canonical [`EnumValue`] for a wire number.
    ///
    /// When aliasing maps one number to several names, the first declared
    /// value wins. The decoder stores the wire number as-is either way.
    pub fn canonical(&self, number: i32) -> Option<&EnumValue> {
        self.values.iter().find(|v| v.number == number)
    }
}

/// Describes one field of a message: identity, wire semantics, and where its
/// storage lives inside the message region.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    /// The field's declared name.
    pub name: &'static str,
    /// The field's wire id (tag).
    pub id: u32,
    /// How many values the field carries.
    pub label: Label,
    /// The field's declared type.
    pub ty: FieldType,
    /// Byte offset of the field's storage from the start of the message
    /// region.
    pub offset: usize,
    /// For oneof members, byte offset of the group's `u32` discriminator.
    /// Unused (zero) otherwise.
    pub quantifier_offset: usize,
    /// Default applied when no record for this field appears.
    pub default_value: Option<DefaultValue>,
    /// Sub-descriptor for message- and enum-typed fields.
    pub descriptor: Option<SubDescriptor>,
    /// Behavior flags.
    pub flags: FieldFlags,
}

impl FieldDescriptor {
    /// Size in bytes of this field's storage inside the message region.
    pub(crate) fn storage_size(&self) -> usize {
        if matches!(self.label, Label::Repeated) {
            return size_of::<RawList>();
        }
        match self.ty {
            FieldType::Message => match self.descriptor {
                Some(SubDescriptor::Message(sub)) => sub.sizeof_message,
                _ => 0,
            },
            other => other.repeated_ele_size(),
        }
    }

    /// Natural alignment of this field's storage.
    pub(crate) fn storage_align(&self) -> usize {
        if matches!(self.label, Label::Repeated) {
            return align_of::<RawList>();
        }
        match self.ty {
            FieldType::Message => MESSAGE_ALIGN,
            other => other.repeated_ele_align(),
        }
    }
}

/// Describes the complete layout of one message type.
pub struct MessageDescriptor {
    /// Must equal [`MESSAGE_DESCRIPTOR_MAGIC`].
    pub magic: u32,
    /// The message's declared name.
    pub name: &'static str,
    /// Total size in bytes of a message region, header included.
    pub sizeof_message: usize,
    /// Field descriptors, ordered to match `field_ids`.
    pub fields: &'static [FieldDescriptor],
    /// Field ids sorted ascending, parallel to `fields`, used for binary
    /// search.
    pub field_ids: &'static [u32],
    /// Optional custom region initializer.
    pub message_init: Option<MessageInitFn>,
}

impl MessageDescriptor {
    /// Looks up the index of the field with the given wire id.
    #[inline]
    pub fn field_index(&self, id: u32) -> Option<usize> {
        int_range_lookup(self.field_ids, id)
    }

    /// Looks up a field descriptor by wire id.
    pub fn field_by_id(&self, id: u32) -> Option<&FieldDescriptor> {
        self.field_index(id).map(|i| &self.fields[i])
    }

    /// Ordinal of field `index` among this message's required fields, used
    /// to address the required-field bitmap.
    pub(crate) fn required_ordinal(&self, index: usize) -> usize {
        self.fields[..index]
            .iter()
            .filter(|f| matches!(f.label, Label::Required))
            .count()
    }

    /// Bitmap with one bit set per required field.
    pub(crate) fn required_mask(&self) -> u64 {
        let count = self
            .fields
            .iter()
            .filter(|f| matches!(f.label, Label::Required))
            .count();
        if count == 0 {
            0
        } else {
            u64::MAX >> (64 - count)
        }
    }

    /// Validates the descriptor contract the decoder relies on.
    ///
    /// Meant to run once when a descriptor is built or loaded; the decode
    /// entry points only debug-assert it. Checks the magic, the parallel id
    /// array, field count against the presence bitmap, and that every
    /// field's storage is in-bounds and naturally aligned.
    pub fn verify(&self) -> Result<(), DescriptorError> {
        if self.magic != MESSAGE_DESCRIPTOR_MAGIC {
            return Err(DescriptorError::BadMagic(self.magic));
        }
        if self.fields.len() != self.field_ids.len() {
            return Err(DescriptorError::ParallelMismatch);
        }
        if self.fields.len() > 64 {
            return Err(DescriptorError::TooManyFields(self.name));
        }
        if self.sizeof_message < size_of::<MessageHeader>() {
            return Err(DescriptorError::RegionTooSmall(self.name));
        }
        if self.field_ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(DescriptorError::UnsortedIds);
        }

        for (field, &id) in self.fields.iter().zip(self.field_ids) {
            if field.id != id {
                return Err(DescriptorError::IdMismatch(field.name));
            }

            match field.ty {
                FieldType::Message => {
                    if !matches!(field.descriptor, Some(SubDescriptor::Message(_))) {
                        return Err(DescriptorError::MissingSubDescriptor(field.name));
                    }
                }
                FieldType::Enum => {
                    if !matches!(field.descriptor, Some(SubDescriptor::Enum(_))) {
                        return Err(DescriptorError::MissingSubDescriptor(field.name));
                    }
                }
                _ => {}
            }

            let size = field.storage_size();
            let align = field.storage_align();
            if field.offset < size_of::<MessageHeader>()
                || field.offset.checked_add(size).is_none()
                || field.offset + size > self.sizeof_message
            {
                return Err(DescriptorError::FieldOutOfBounds(field.name));
            }
            if field.offset % align != 0 {
                return Err(DescriptorError::MisalignedField(field.name));
            }

            if field.flags.contains(FieldFlags::ONEOF) {
                let q = field.quantifier_offset;
                if q < size_of::<MessageHeader>()
                    || q + size_of::<u32>() > self.sizeof_message
                    || q % align_of::<u32>() != 0
                {
                    return Err(DescriptorError::BadQuantifier(field.name));
                }
            }
        }

        Ok(())
    }
}

impl fmt::Debug for MessageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Descriptors may be cyclic (recursive message types), so only the
        // identity is printed.
        f.debug_struct("MessageDescriptor")
            .field("name", &self.name)
            .field("sizeof_message", &self.sizeof_message)
            .field("fields", &self.fields.len())
            .finish()
    }
}

/// Finds the index of `value` in a sorted sequence of field ids.
#[inline]
pub fn int_range_lookup(ids: &[u32], value: u32) -> Option<usize> {
    ids.binary_search(&value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_range_lookup() {
        let ids = &[1, 2, 5, 9, 400];
        assert_eq!(int_range_lookup(ids, 1), Some(0));
        assert_eq!(int_range_lookup(ids, 5), Some(2));
        assert_eq!(int_range_lookup(ids, 400), Some(4));
        assert_eq!(int_range_lookup(ids, 3), None);
        assert_eq!(int_range_lookup(&[], 3), None);
    }

    #[test]
    fn test_ele_sizes() {
        assert_eq!(FieldType::Int32.repeated_ele_size(), 4);
        assert_eq!(FieldType::Enum.repeated_ele_size(), 4);
        assert_eq!(FieldType::Double.repeated_ele_size(), 8);
        assert_eq!(FieldType::Bool.repeated_ele_size(), 1);
        assert_eq!(
            FieldType::String.repeated_ele_size(),
            size_of::<ProtoString>()
        );
        assert_eq!(
            FieldType::Message.repeated_ele_size(),
            size_of::<*mut MessageHeader>()
        );
    }

    #[test]
    fn test_packable() {
        assert!(FieldType::Int32.is_packable());
        assert!(FieldType::Bool.is_packable());
        assert!(FieldType::Double.is_packable());
        assert!(!FieldType::String.is_packable());
        assert!(!FieldType::Bytes.is_packable());
        assert!(!FieldType::Message.is_packable());
    }

    #[test]
    fn test_flags() {
        let flags = FieldFlags::PACKED.union(FieldFlags::ONEOF);
        assert!(flags.contains(FieldFlags::PACKED));
        assert!(flags.contains(FieldFlags::ONEOF));
        assert!(!FieldFlags::NONE.contains(FieldFlags::PACKED));
    }

    #[test]
    fn test_enum_canonical_prefers_first_alias() {
        static VALUES: [EnumValue; 3] = [
            EnumValue { name: "UNKNOWN", number: 0 },
            EnumValue { name: "STARTED", number: 1 },
            EnumValue { name: "RUNNING", number: 1 },
        ];
        static DESC: EnumDescriptor = EnumDescriptor {
            name: "State",
            values: &VALUES,
        };

        assert_eq!(DESC.canonical(1).unwrap().name, "STARTED");
        assert_eq!(DESC.canonical(0).unwrap().name, "UNKNOWN");
        assert!(DESC.canonical(7).is_none());
    }

    // Malformed descriptors for exercising every rejection in `verify`.
    // Offsets are hand-picked relative to the header rather than taken from
    // a real struct, which is all `verify` ever sees.

    const HEADER: usize = size_of::<MessageHeader>();

    const fn fd(name: &'static str, id: u32, ty: FieldType, offset: usize) -> FieldDescriptor {
        FieldDescriptor {
            name,
            id,
            label: Label::Optional,
            ty,
            offset,
            quantifier_offset: 0,
            default_value: None,
            descriptor: None,
            flags: FieldFlags::NONE,
        }
    }

    fn desc(
        fields: &'static [FieldDescriptor],
        field_ids: &'static [u32],
        sizeof_message: usize,
    ) -> MessageDescriptor {
        MessageDescriptor {
            magic: MESSAGE_DESCRIPTOR_MAGIC,
            name: "Test",
            sizeof_message,
            fields,
            field_ids,
            message_init: None,
        }
    }

    static ONE_FIELD: [FieldDescriptor; 1] = [fd("value", 1, FieldType::Int32, HEADER)];

    #[test]
    fn test_verify_minimal_descriptor() {
        assert_eq!(desc(&ONE_FIELD, &[1], HEADER + 8).verify(), Ok(()));
    }

    #[test]
    fn test_verify_rejects_bad_magic() {
        let mut d = desc(&ONE_FIELD, &[1], HEADER + 8);
        d.magic = 0xdead_beef;
        assert_eq!(d.verify(), Err(DescriptorError::BadMagic(0xdead_beef)));
    }

    #[test]
    fn test_verify_rejects_parallel_mismatch() {
        assert_eq!(
            desc(&ONE_FIELD, &[1, 2], HEADER + 8).verify(),
            Err(DescriptorError::ParallelMismatch)
        );
    }

    static UNSORTED_FIELDS: [FieldDescriptor; 2] = [
        fd("a", 5, FieldType::Int32, HEADER),
        fd("b", 2, FieldType::Int32, HEADER + 4),
    ];

    #[test]
    fn test_verify_rejects_unsorted_ids() {
        assert_eq!(
            desc(&UNSORTED_FIELDS, &[5, 2], HEADER + 8).verify(),
            Err(DescriptorError::UnsortedIds)
        );
    }

    static DUPLICATE_FIELDS: [FieldDescriptor; 2] = [
        fd("a", 2, FieldType::Int32, HEADER),
        fd("b", 2, FieldType::Int32, HEADER + 4),
    ];

    #[test]
    fn test_verify_rejects_duplicate_ids() {
        assert_eq!(
            desc(&DUPLICATE_FIELDS, &[2, 2], HEADER + 8).verify(),
            Err(DescriptorError::UnsortedIds)
        );
    }

    static MISNUMBERED_FIELDS: [FieldDescriptor; 2] = [
        fd("a", 1, FieldType::Int32, HEADER),
        fd("b", 9, FieldType::Int32, HEADER + 4),
    ];

    #[test]
    fn test_verify_rejects_id_mismatch() {
        // `field_ids` is sorted but disagrees with the second descriptor.
        assert_eq!(
            desc(&MISNUMBERED_FIELDS, &[1, 2], HEADER + 8).verify(),
            Err(DescriptorError::IdMismatch("b"))
        );
    }

    static TOO_MANY_FIELDS: [FieldDescriptor; 65] = [fd("f", 1, FieldType::Int32, HEADER); 65];
    static TOO_MANY_IDS: [u32; 65] = [1; 65];

    #[test]
    fn test_verify_rejects_too_many_fields() {
        // 65 fields cannot be tracked by the presence word.
        assert_eq!(
            desc(&TOO_MANY_FIELDS, &TOO_MANY_IDS, HEADER + 512).verify(),
            Err(DescriptorError::TooManyFields("Test"))
        );
    }

    #[test]
    fn test_verify_rejects_undersized_region() {
        assert_eq!(
            desc(&[], &[], HEADER - 1).verify(),
            Err(DescriptorError::RegionTooSmall("Test"))
        );
    }

    static HEADER_OVERLAP: [FieldDescriptor; 1] = [fd("value", 1, FieldType::Int32, 0)];

    #[test]
    fn test_verify_rejects_field_overlapping_header() {
        assert_eq!(
            desc(&HEADER_OVERLAP, &[1], HEADER + 8).verify(),
            Err(DescriptorError::FieldOutOfBounds("value"))
        );
    }

    #[test]
    fn test_verify_rejects_field_past_region_end() {
        // Four bytes of storage, two bytes of room.
        assert_eq!(
            desc(&ONE_FIELD, &[1], HEADER + 2).verify(),
            Err(DescriptorError::FieldOutOfBounds("value"))
        );
    }

    static MISALIGNED: [FieldDescriptor; 1] = [fd("value", 1, FieldType::Int64, HEADER + 4)];

    #[test]
    fn test_verify_rejects_misaligned_offset() {
        // An eight-byte scalar at a four-byte offset.
        assert_eq!(
            desc(&MISALIGNED, &[1], HEADER + 16).verify(),
            Err(DescriptorError::MisalignedField("value"))
        );
    }

    static BARE_MESSAGE: [FieldDescriptor; 1] = [fd("child", 1, FieldType::Message, HEADER)];

    #[test]
    fn test_verify_rejects_message_without_descriptor() {
        assert_eq!(
            desc(&BARE_MESSAGE, &[1], HEADER + 64).verify(),
            Err(DescriptorError::MissingSubDescriptor("child"))
        );
    }

    static EMPTY_DESC: MessageDescriptor = MessageDescriptor {
        magic: MESSAGE_DESCRIPTOR_MAGIC,
        name: "Empty",
        sizeof_message: HEADER,
        fields: &[],
        field_ids: &[],
        message_init: None,
    };

    static MISKINDED_ENUM: [FieldDescriptor; 1] = [FieldDescriptor {
        descriptor: Some(SubDescriptor::Message(&EMPTY_DESC)),
        ..fd("state", 1, FieldType::Enum, HEADER)
    }];

    #[test]
    fn test_verify_rejects_wrong_sub_descriptor_kind() {
        // An enum field pointing at a message descriptor.
        assert_eq!(
            desc(&MISKINDED_ENUM, &[1], HEADER + 8).verify(),
            Err(DescriptorError::MissingSubDescriptor("state"))
        );
    }

    static ONEOF_BAD_QUANTIFIER: [FieldDescriptor; 1] = [FieldDescriptor {
        flags: FieldFlags::ONEOF,
        ..fd("num", 1, FieldType::Int32, HEADER + 4)
    }];

    #[test]
    fn test_verify_rejects_bad_oneof_quantifier() {
        // A discriminator offset of zero points into the header.
        assert_eq!(
            desc(&ONEOF_BAD_QUANTIFIER, &[1], HEADER + 8).verify(),
            Err(DescriptorError::BadQuantifier("num"))
        );
    }
}
