//! Error types for descriptor verification and wire-format decoding.

/// Errors produced while decoding a protobuf-encoded buffer.
///
/// The decoder never recovers internally; the first error aborts the parse
/// and is returned to the caller. Unknown fields are not errors, they are
/// captured verbatim on the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// A record key carried wire-type bits outside the known alphabet, or a
    /// field id outside the valid tag range.
    #[error("invalid record key: wire type {wire_type}, field id {field_id}")]
    InvalidKey {
        /// The raw low three bits of the key.
        wire_type: u8,
        /// The remaining bits of the key.
        field_id: u32,
    },

    /// The input ended in the middle of a varint or a record key.
    #[error("not enough bytes left in the input")]
    NotEnoughBytes,

    /// A varint does not fit in the target integer width.
    #[error("varint does not fit in a {bits}-bit integer")]
    Overflow {
        /// Width of the target integer in bits.
        bits: u32,
    },

    /// A required field had no record in the input.
    #[error("required field `{0}` is missing")]
    FieldMissing(&'static str),

    /// An optional field expected by the caller had no record in the input.
    #[error("optional field `{0}` is missing")]
    OptionalFieldMissing(&'static str),

    /// A required message-typed field had no record in the input.
    #[error("required sub-message `{0}` is missing")]
    SubMessageMissing(&'static str),

    /// A field typed as message or enum has no sub-descriptor.
    #[error("field `{0}` is typed as a message or enum but has no descriptor")]
    DescriptorMissing(&'static str),

    /// The record's wire type is incompatible with the declared field type,
    /// or a packed payload length is not a multiple of the element size.
    #[error("wire value is not compatible with the declared field type")]
    InvalidType,

    /// A fixed-width or length-prefixed payload was truncated.
    #[error("truncated or malformed payload")]
    InvalidData,

    /// Message nesting exceeded the decoder's depth cap.
    #[error("message nesting deeper than {0} levels")]
    RecursionLimit(u32),
}

/// Errors found while verifying a [`MessageDescriptor`] at load time.
///
/// [`MessageDescriptor`]: crate::descriptor::MessageDescriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    /// The descriptor's magic word does not match
    /// [`MESSAGE_DESCRIPTOR_MAGIC`](crate::descriptor::MESSAGE_DESCRIPTOR_MAGIC).
    #[error("descriptor magic {0:#010x} does not match")]
    BadMagic(u32),

    /// `fields` and `field_ids` differ in length.
    #[error("`fields` and `field_ids` differ in length")]
    ParallelMismatch,

    /// `field_ids` is not sorted in strictly ascending order.
    #[error("field ids are not sorted in ascending order")]
    UnsortedIds,

    /// A field's id disagrees with its `field_ids` entry.
    #[error("field `{0}` does not match its `field_ids` entry")]
    IdMismatch(&'static str),

    /// The presence bitmap covers at most 64 fields per message.
    #[error("message `{0}` declares more than 64 fields")]
    TooManyFields(&'static str),

    /// `sizeof_message` cannot hold the message header.
    #[error("message `{0}` is smaller than the message header")]
    RegionTooSmall(&'static str),

    /// A field's storage falls outside the message region or overlaps the
    /// header.
    #[error("field `{0}` storage is out of bounds")]
    FieldOutOfBounds(&'static str),

    /// A field's offset is not naturally aligned for its storage type.
    #[error("field `{0}` offset is not aligned for its type")]
    MisalignedField(&'static str),

    /// A message- or enum-typed field is missing its sub-descriptor, or
    /// carries a sub-descriptor of the wrong kind.
    #[error("field `{0}` is missing a matching sub-descriptor")]
    MissingSubDescriptor(&'static str),

    /// A oneof member's discriminator offset is out of bounds or misaligned.
    #[error("oneof member `{0}` has an invalid discriminator offset")]
    BadQuantifier(&'static str),
}
