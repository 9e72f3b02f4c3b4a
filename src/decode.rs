//! Two-pass message decoding: scan, size, parse.
//!
//! The scanner walks the input once, splitting it into records and tallying
//! repeated-field element counts. The allocator pass then sizes every
//! repeated field's backing store exactly, and the parser walks the scanned
//! records a second time, storing values at descriptor-supplied offsets.
//! Pre-sizing is load-bearing: each list is allocated once and never
//! reallocated, so the two passes must not be fused.

use core::alloc::Layout;
use core::mem::size_of;
use core::ptr;
use core::ptr::NonNull;

use bytes::Buf;
use smallvec::{smallvec, SmallVec};

use crate::arena::Arena;
use crate::descriptor::{
    FieldDescriptor, FieldFlags, FieldType, Label, MessageDescriptor, SubDescriptor,
    MESSAGE_DESCRIPTOR_MAGIC,
};
use crate::error::DecodeError;
use crate::leb128;
use crate::message::{
    self, MessageHeader, ProtoBytes, ProtoMessage, ProtoString, UnknownField, MESSAGE_ALIGN,
};
use crate::wire::{self, RecordKey, WireType};

/// Maximum message nesting depth, bounding stack use on hostile input.
pub const RECURSION_LIMIT: u32 = 100;

/// A decoding cursor over a contiguous buffer.
///
/// Carries the arena every piece of decoded storage is allocated from. The
/// produced message tree borrows from that arena and is released by dropping
/// it.
pub struct DecodeCtx<'a> {
    rest: &'a [u8],
    full_len: usize,
    arena: &'a Arena,
    depth: u32,
}

/// One record split out of the input by the scanner.
struct ScannedMember<'a> {
    key: RecordKey,
    /// Index of the matched field descriptor, `None` for unknown fields.
    field_index: Option<usize>,
    /// Everything after the key, including the length prefix for `Len`
    /// records.
    data: &'a [u8],
    /// Size of the length prefix inside `data` (zero for non-`Len` records).
    prefix_len: usize,
}

impl<'a> ScannedMember<'a> {
    fn payload(&self) -> &'a [u8] {
        &self.data[self.prefix_len..]
    }
}

/// Everything the first pass learned about the input.
struct ScanOutcome<'a> {
    members: SmallVec<[ScannedMember<'a>; 16]>,
    /// Element tallies, parallel to the descriptor's fields.
    counts: SmallVec<[usize; 16]>,
    unknown: usize,
}

impl<'a> DecodeCtx<'a> {
    /// Creates a cursor over `data`, allocating from `arena`.
    pub fn new(data: &'a [u8], arena: &'a Arena) -> Self {
        DecodeCtx {
            rest: data,
            full_len: data.len(),
            arena,
            depth: 0,
        }
    }

    /// Bytes consumed so far.
    pub fn bytes_read(&self) -> usize {
        self.full_len - self.rest.len()
    }

    /// Advances past `n` bytes without interpreting them.
    pub fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.take(n).map(|_| ())
    }

    /// Decodes a fresh message of type `desc` from the remaining input.
    ///
    /// The message region is allocated from the arena; the returned header
    /// (and all storage reachable from it) lives until the arena is dropped.
    pub fn deserialize(
        &mut self,
        desc: &'static MessageDescriptor,
    ) -> Result<&'a mut MessageHeader, DecodeError> {
        check_descriptor(desc);
        let region = self.alloc_region(desc);
        unsafe {
            self.deserialize_region(desc, region.as_ptr())?;
            Ok(&mut *(region.as_ptr() as *mut MessageHeader))
        }
    }

    /// Decodes into a caller-provided message region.
    ///
    /// Decoding into an already-initialized region merges: records in the
    /// input overwrite or append to what the region already holds.
    ///
    /// # Safety
    ///
    /// `region` must be valid for `desc.sizeof_message` bytes, aligned to
    /// [`MESSAGE_ALIGN`], outlive `'a`, and be either zero-filled or a
    /// message previously initialized with the same `desc`.
    pub unsafe fn deserialize_into(
        &mut self,
        desc: &'static MessageDescriptor,
        region: NonNull<u8>,
    ) -> Result<&'a mut MessageHeader, DecodeError> {
        check_descriptor(desc);
        unsafe {
            self.deserialize_region(desc, region.as_ptr())?;
            Ok(&mut *(region.as_ptr() as *mut MessageHeader))
        }
    }

    /// Decodes a fresh message through its typed [`ProtoMessage`] binding.
    pub fn decode<M: ProtoMessage>(&mut self) -> Result<&'a mut M, DecodeError> {
        let header = self.deserialize(M::DESCRIPTOR)?;
        Ok(unsafe { &mut *(header as *mut MessageHeader as *mut M) })
    }

    /// Derives a child cursor over `data` for a nested message.
    fn with_data(&self, data: &'a [u8]) -> Result<DecodeCtx<'a>, DecodeError> {
        if self.depth >= RECURSION_LIMIT {
            return Err(DecodeError::RecursionLimit(RECURSION_LIMIT));
        }
        Ok(DecodeCtx {
            rest: data,
            full_len: data.len(),
            arena: self.arena,
            depth: self.depth + 1,
        })
    }

    /// Allocates and header-zeroes a message region for `desc`.
    fn alloc_region(&self, desc: &MessageDescriptor) -> NonNull<u8> {
        let layout = Layout::from_size_align(desc.sizeof_message, MESSAGE_ALIGN)
            .expect("message layout overflow");
        let region = self.arena.alloc(layout);
        // Zero the header so `is_init` is well defined before the
        // initializer runs.
        unsafe { ptr::write_bytes(region.as_ptr(), 0, size_of::<MessageHeader>()) };
        region
    }

    /// Splits off the next `n` bytes of input.
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.rest.len() < n {
            return Err(DecodeError::InvalidData);
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    /// Runs the full scan → allocate → parse pipeline over the remaining
    /// input, into `region`.
    ///
    /// # Safety
    ///
    /// `region` satisfies the contract documented on
    /// [`deserialize_into`](Self::deserialize_into).
    unsafe fn deserialize_region(
        &mut self,
        desc: &'static MessageDescriptor,
        region: *mut u8,
    ) -> Result<(), DecodeError> {
        if !unsafe { message::header_mut(region) }.is_init() {
            unsafe { message::init_region(region, desc) };
        }
        debug_assert!(unsafe { message::header_mut(region) }
            .descriptor()
            .is_some_and(|d| ptr::eq(d, desc)));

        let scan = self.scan(desc)?;
        debug_assert!(self.rest.is_empty());

        unsafe { self.reserve_storage(desc, region, &scan) };

        let mut seen_required = 0u64;
        for member in &scan.members {
            unsafe { self.parse_member(desc, region, member, &mut seen_required)? };
        }

        let missing = desc.required_mask() & !seen_required;
        if missing != 0 {
            for (index, field) in desc.fields.iter().enumerate() {
                if matches!(field.label, Label::Required)
                    && missing & (1 << desc.required_ordinal(index)) != 0
                {
                    return Err(match field.ty {
                        FieldType::Message => DecodeError::SubMessageMissing(field.name),
                        _ => DecodeError::FieldMissing(field.name),
                    });
                }
            }
        }

        Ok(())
    }

    /// First pass: split the input into records and tally repeated counts.
    fn scan(&mut self, desc: &'static MessageDescriptor) -> Result<ScanOutcome<'a>, DecodeError> {
        let mut out = ScanOutcome {
            members: SmallVec::new(),
            counts: smallvec![0usize; desc.fields.len()],
            unknown: 0,
        };

        // Encoders typically emit fields in descriptor order, so the record
        // we just matched is very likely to match again.
        let mut last: Option<usize> = None;

        while !self.rest.is_empty() {
            let key = wire::decode_key(&mut self.rest)?;

            let field_index = match last {
                Some(i) if desc.fields[i].id == key.field_id => Some(i),
                _ => desc.field_index(key.field_id),
            };
            last = field_index;

            let start = self.rest;
            let mut prefix_len = 0;
            let data = match key.wire_type {
                WireType::Varint => {
                    leb128::read_u64(&mut self.rest)?;
                    let consumed = start.len() - self.rest.len();
                    &start[..consumed]
                }
                WireType::I64 => self.take(8)?,
                WireType::I32 => self.take(4)?,
                WireType::Len => {
                    let len = leb128::read_u64(&mut self.rest)?;
                    let len = usize::try_from(len).map_err(|_| DecodeError::InvalidData)?;
                    prefix_len = start.len() - self.rest.len();
                    if self.rest.len() < len {
                        return Err(DecodeError::InvalidData);
                    }
                    self.rest = &self.rest[len..];
                    &start[..prefix_len + len]
                }
                WireType::SGroup | WireType::EGroup => return Err(DecodeError::InvalidType),
            };

            if let Some(index) = field_index {
                let field = &desc.fields[index];
                if matches!(field.label, Label::Repeated) {
                    let n = if key.wire_type == WireType::Len
                        && (field.flags.contains(FieldFlags::PACKED) || field.ty.is_packable())
                    {
                        packed_count(field.ty, &data[prefix_len..])?
                    } else {
                        1
                    };
                    out.counts[index] += n;
                }
            } else {
                out.unknown += 1;
            }

            out.members.push(ScannedMember {
                key,
                field_index,
                data,
                prefix_len,
            });
        }

        Ok(out)
    }

    /// Allocator pass: size every non-empty repeated field exactly once and
    /// reserve the unknown-field list.
    unsafe fn reserve_storage(
        &self,
        desc: &'static MessageDescriptor,
        region: *mut u8,
        scan: &ScanOutcome<'a>,
    ) {
        for (index, field) in desc.fields.iter().enumerate() {
            if !matches!(field.label, Label::Repeated) {
                continue;
            }
            let count = scan.counts[index];
            if count == 0 {
                continue;
            }

            let size = field.ty.repeated_ele_size();
            let layout = Layout::from_size_align(count * size, field.ty.repeated_ele_align())
                .expect("list layout overflow");
            let items = self.arena.alloc(layout);
            unsafe { message::list_at(region, field.offset) }.reset(items, count);
        }

        if scan.unknown > 0 {
            let layout =
                Layout::array::<UnknownField>(scan.unknown).expect("list layout overflow");
            let items = self.arena.alloc(layout);
            unsafe { message::header_mut(region) }
                .unknown_mut()
                .reset(items, scan.unknown);
        }
    }

    /// Second pass: store one scanned record into the message.
    unsafe fn parse_member(
        &self,
        desc: &'static MessageDescriptor,
        region: *mut u8,
        member: &ScannedMember<'a>,
        seen_required: &mut u64,
    ) -> Result<(), DecodeError> {
        let Some(index) = member.field_index else {
            unsafe { self.append_unknown(region, member) };
            return Ok(());
        };
        let field = &desc.fields[index];

        match field.label {
            Label::Required => {
                unsafe { self.parse_singular(field, region.add(field.offset), member)? };
                *seen_required |= 1 << desc.required_ordinal(index);
            }
            Label::Optional => {
                if field.flags.contains(FieldFlags::ONEOF) {
                    unsafe { self.parse_oneof(desc, field, region, member)? };
                } else {
                    unsafe { self.parse_singular(field, region.add(field.offset), member)? };
                    unsafe { message::header_mut(region) }.set_present(index);
                }
            }
            Label::Repeated => {
                if member.key.wire_type == WireType::Len
                    && (field.flags.contains(FieldFlags::PACKED) || field.ty.is_packable())
                {
                    unsafe { self.parse_packed(field, region, member)? };
                } else {
                    unsafe { self.parse_repeated_one(field, region, member)? };
                }
            }
        }

        Ok(())
    }

    /// Stores a non-repeated member at `dst`.
    unsafe fn parse_singular(
        &self,
        field: &FieldDescriptor,
        dst: *mut u8,
        member: &ScannedMember<'a>,
    ) -> Result<(), DecodeError> {
        match field.ty {
            FieldType::Message => {
                expect_wire(member.key.wire_type, WireType::Len)?;
                let Some(SubDescriptor::Message(sub)) = field.descriptor else {
                    return Err(DecodeError::DescriptorMissing(field.name));
                };
                // Singular sub-messages are embedded in place; a second
                // record for the same field merges into the existing one.
                let mut child = self.with_data(member.payload())?;
                unsafe { child.deserialize_region(sub, dst) }
            }
            _ => unsafe { self.parse_scalar_at(field, dst, member) },
        }
    }

    /// Appends one unpacked element to a repeated field's list.
    unsafe fn parse_repeated_one(
        &self,
        field: &FieldDescriptor,
        region: *mut u8,
        member: &ScannedMember<'a>,
    ) -> Result<(), DecodeError> {
        let list = unsafe { message::list_at(region, field.offset) };

        if let FieldType::Message = field.ty {
            expect_wire(member.key.wire_type, WireType::Len)?;
            let Some(SubDescriptor::Message(sub)) = field.descriptor else {
                return Err(DecodeError::DescriptorMissing(field.name));
            };
            let sub_region = self.alloc_region(sub);
            let mut child = self.with_data(member.payload())?;
            unsafe {
                child.deserialize_region(sub, sub_region.as_ptr())?;
                list.push(sub_region.as_ptr() as *mut MessageHeader);
            }
            return Ok(());
        }

        let slot = unsafe { list.next_slot(field.ty.repeated_ele_size()) };
        unsafe { self.parse_scalar_at(field, slot, member) }
    }

    /// Decodes a scalar, string, or bytes value from a scanned record and
    /// writes it at `dst`.
    unsafe fn parse_scalar_at(
        &self,
        field: &FieldDescriptor,
        dst: *mut u8,
        member: &ScannedMember<'a>,
    ) -> Result<(), DecodeError> {
        let wire = member.key.wire_type;
        let mut payload = member.payload();

        unsafe {
            match field.ty {
                FieldType::Int32 | FieldType::Enum => {
                    expect_wire(wire, WireType::Varint)?;
                    // Negative int32 values arrive sign-extended to ten
                    // bytes; the low 32 bits carry the value.
                    let v = leb128::read_u64(&mut payload)? as i32;
                    (dst as *mut i32).write(v);
                }
                FieldType::Sint32 => {
                    expect_wire(wire, WireType::Varint)?;
                    let v = leb128::zigzag_decode32(leb128::read_u32(&mut payload)?);
                    (dst as *mut i32).write(v);
                }
                FieldType::Uint32 => {
                    expect_wire(wire, WireType::Varint)?;
                    let v = leb128::read_u32(&mut payload)?;
                    (dst as *mut u32).write(v);
                }
                FieldType::Int64 => {
                    expect_wire(wire, WireType::Varint)?;
                    let v = leb128::read_u64(&mut payload)? as i64;
                    (dst as *mut i64).write(v);
                }
                FieldType::Sint64 => {
                    expect_wire(wire, WireType::Varint)?;
                    let v = leb128::zigzag_decode64(leb128::read_u64(&mut payload)?);
                    (dst as *mut i64).write(v);
                }
                FieldType::Uint64 => {
                    expect_wire(wire, WireType::Varint)?;
                    let v = leb128::read_u64(&mut payload)?;
                    (dst as *mut u64).write(v);
                }
                FieldType::Sfixed32 => {
                    expect_wire(wire, WireType::I32)?;
                    (dst as *mut i32).write((&mut payload).get_i32_le());
                }
                FieldType::Fixed32 => {
                    expect_wire(wire, WireType::I32)?;
                    (dst as *mut u32).write((&mut payload).get_u32_le());
                }
                FieldType::Float => {
                    expect_wire(wire, WireType::I32)?;
                    (dst as *mut f32).write((&mut payload).get_f32_le());
                }
                FieldType::Sfixed64 => {
                    expect_wire(wire, WireType::I64)?;
                    (dst as *mut i64).write((&mut payload).get_i64_le());
                }
                FieldType::Fixed64 => {
                    expect_wire(wire, WireType::I64)?;
                    (dst as *mut u64).write((&mut payload).get_u64_le());
                }
                FieldType::Double => {
                    expect_wire(wire, WireType::I64)?;
                    (dst as *mut f64).write((&mut payload).get_f64_le());
                }
                FieldType::Bool => {
                    expect_wire(wire, WireType::Varint)?;
                    let v = payload.first().is_some_and(|b| *b != 0);
                    (dst as *mut bool).write(v);
                }
                FieldType::String => {
                    expect_wire(wire, WireType::Len)?;
                    let copy = self.arena.alloc_str(payload);
                    (dst as *mut ProtoString).write(ProtoString::from_raw(copy, payload.len()));
                }
                FieldType::Bytes => {
                    expect_wire(wire, WireType::Len)?;
                    let copy = self.arena.alloc_copy(payload);
                    (dst as *mut ProtoBytes).write(ProtoBytes::from_raw(copy, payload.len()));
                }
                FieldType::Message => unreachable!("message members are routed to the caller"),
            }
        }

        Ok(())
    }

    /// Decodes a packed `Len` payload, appending every element to the
    /// preallocated list. Capacity was sized from the scanner's tally over
    /// this same payload, so the counts agree by construction.
    unsafe fn parse_packed(
        &self,
        field: &FieldDescriptor,
        region: *mut u8,
        member: &ScannedMember<'a>,
    ) -> Result<(), DecodeError> {
        let list = unsafe { message::list_at(region, field.offset) };
        let mut payload = member.payload();

        while !payload.is_empty() {
            unsafe {
                match field.ty {
                    FieldType::Int32 | FieldType::Enum => {
                        list.push(leb128::read_u64(&mut payload)? as i32);
                    }
                    FieldType::Sint32 => {
                        list.push(leb128::zigzag_decode32(leb128::read_u32(&mut payload)?));
                    }
                    FieldType::Uint32 => {
                        list.push(leb128::read_u32(&mut payload)?);
                    }
                    FieldType::Int64 => {
                        list.push(leb128::read_u64(&mut payload)? as i64);
                    }
                    FieldType::Sint64 => {
                        list.push(leb128::zigzag_decode64(leb128::read_u64(&mut payload)?));
                    }
                    FieldType::Uint64 => {
                        list.push(leb128::read_u64(&mut payload)?);
                    }
                    FieldType::Sfixed32 => {
                        if payload.len() < 4 {
                            return Err(DecodeError::InvalidData);
                        }
                        list.push((&mut payload).get_i32_le());
                    }
                    FieldType::Fixed32 => {
                        if payload.len() < 4 {
                            return Err(DecodeError::InvalidData);
                        }
                        list.push((&mut payload).get_u32_le());
                    }
                    FieldType::Float => {
                        if payload.len() < 4 {
                            return Err(DecodeError::InvalidData);
                        }
                        list.push((&mut payload).get_f32_le());
                    }
                    FieldType::Sfixed64 => {
                        if payload.len() < 8 {
                            return Err(DecodeError::InvalidData);
                        }
                        list.push((&mut payload).get_i64_le());
                    }
                    FieldType::Fixed64 => {
                        if payload.len() < 8 {
                            return Err(DecodeError::InvalidData);
                        }
                        list.push((&mut payload).get_u64_le());
                    }
                    FieldType::Double => {
                        if payload.len() < 8 {
                            return Err(DecodeError::InvalidData);
                        }
                        list.push((&mut payload).get_f64_le());
                    }
                    FieldType::Bool => {
                        let byte = (&mut payload).get_u8();
                        list.push(byte != 0);
                    }
                    FieldType::String | FieldType::Bytes | FieldType::Message => {
                        return Err(DecodeError::InvalidType);
                    }
                }
            }
        }

        Ok(())
    }

    /// Handles a oneof member: clears any previously-set sibling in the same
    /// group, stores the value, and records this field's id in the group's
    /// discriminator.
    unsafe fn parse_oneof(
        &self,
        desc: &'static MessageDescriptor,
        field: &FieldDescriptor,
        region: *mut u8,
        member: &ScannedMember<'a>,
    ) -> Result<(), DecodeError> {
        let case: u32 = unsafe { message::read_at(region, field.quantifier_offset) };
        if case != 0 && case != field.id {
            if let Some(prev) = desc.field_by_id(case) {
                unsafe { message::zero_at(region, prev.offset, prev.storage_size()) };
            }
        }

        unsafe {
            self.parse_singular(field, region.add(field.offset), member)?;
            message::write_at(region, field.quantifier_offset, field.id);
        }
        Ok(())
    }

    /// Duplicates an unmatched record into the message's unknown list.
    unsafe fn append_unknown(&self, region: *mut u8, member: &ScannedMember<'a>) {
        let copy = self.arena.alloc_copy(member.data);
        let data = ProtoBytes::from_raw(copy, member.data.len());
        unsafe {
            message::header_mut(region).unknown_mut().push(UnknownField {
                key: member.key,
                data,
            });
        }
    }
}

fn check_descriptor(desc: &MessageDescriptor) {
    assert_eq!(
        desc.magic, MESSAGE_DESCRIPTOR_MAGIC,
        "value is not a message descriptor"
    );
    debug_assert_eq!(desc.verify(), Ok(()));
}

#[inline(always)]
fn expect_wire(actual: WireType, expected: WireType) -> Result<(), DecodeError> {
    if actual == expected {
        Ok(())
    } else {
        Err(DecodeError::InvalidType)
    }
}

/// Counts the elements of a packed payload without materializing them.
fn packed_count(ty: FieldType, payload: &[u8]) -> Result<usize, DecodeError> {
    match ty {
        FieldType::Sfixed32 | FieldType::Fixed32 | FieldType::Float => {
            if payload.len() % 4 != 0 {
                return Err(DecodeError::InvalidType);
            }
            Ok(payload.len() / 4)
        }
        FieldType::Sfixed64 | FieldType::Fixed64 | FieldType::Double => {
            if payload.len() % 8 != 0 {
                return Err(DecodeError::InvalidType);
            }
            Ok(payload.len() / 8)
        }
        // Canonical encoders emit one byte per bool.
        FieldType::Bool => Ok(payload.len()),
        FieldType::Int32
        | FieldType::Sint32
        | FieldType::Uint32
        | FieldType::Int64
        | FieldType::Sint64
        | FieldType::Uint64
        | FieldType::Enum => {
            // One element per varint terminator byte.
            Ok(payload.iter().filter(|b| *b & 0x80 == 0).count())
        }
        FieldType::String | FieldType::Bytes | FieldType::Message => Err(DecodeError::InvalidType),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_count() {
        // Three varints: 3, 270, 86942.
        let payload = [0x03, 0x8e, 0x02, 0x9e, 0xa7, 0x05];
        assert_eq!(packed_count(FieldType::Int32, &payload).unwrap(), 3);

        assert_eq!(packed_count(FieldType::Fixed32, &[0; 12]).unwrap(), 3);
        assert_eq!(packed_count(FieldType::Double, &[0; 16]).unwrap(), 2);
        assert_eq!(packed_count(FieldType::Bool, &[1, 0, 1]).unwrap(), 3);

        assert_eq!(
            packed_count(FieldType::Fixed32, &[0; 6]),
            Err(DecodeError::InvalidType)
        );
        assert_eq!(
            packed_count(FieldType::Fixed64, &[0; 12]),
            Err(DecodeError::InvalidType)
        );
        assert_eq!(
            packed_count(FieldType::String, &[0; 4]),
            Err(DecodeError::InvalidType)
        );
    }
}
