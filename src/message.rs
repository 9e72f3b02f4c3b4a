//! Offset-addressed message storage.
//!
//! A decoded message is a byte region whose layout is dictated by its
//! [`MessageDescriptor`]: a [`MessageHeader`] at offset zero, then field
//! storage at descriptor-declared offsets. All access goes through raw
//! offset reads and writes; the descriptor verifier proves every offset
//! in-bounds and naturally aligned before any of them is trusted.

use core::fmt;
use core::ptr::{self, NonNull};
use core::slice;
use core::str;

use static_assertions::assert_eq_size;

use crate::descriptor::{DefaultValue, Label, MessageDescriptor};
use crate::error::DecodeError;
use crate::leb128;
use crate::wire::RecordKey;

/// Alignment every message region must have.
pub const MESSAGE_ALIGN: usize = core::mem::align_of::<MessageHeader>();

// The raw storage types must stay pointer-shaped; descriptors bake their
// sizes into field offsets.
assert_eq_size!(Option<&'static MessageDescriptor>, usize);
assert_eq_size!(ProtoString, [usize; 2]);
assert_eq_size!(ProtoBytes, [usize; 2]);
assert_eq_size!(RawList, [usize; 3]);

/// Header at the start of every message region.
///
/// Holds the descriptor pointer that marks the region initialized, the
/// presence bitmap for optional fields (indexed by field index, which is why
/// descriptors cap out at 64 fields), and the unknown-field list.
///
/// A zero-filled region is the well-defined "uninitialized" state: the
/// descriptor pointer is null and [`is_init`](Self::is_init) is false.
#[repr(C)]
pub struct MessageHeader {
    descriptor: Option<&'static MessageDescriptor>,
    presence: u64,
    unknown: RawList,
}

impl MessageHeader {
    /// The descriptor this message was decoded with, if initialized.
    pub fn descriptor(&self) -> Option<&'static MessageDescriptor> {
        self.descriptor
    }

    /// Whether the region has been initialized.
    pub fn is_init(&self) -> bool {
        self.descriptor.is_some()
    }

    /// Whether a record for the optional field at `field_index` was observed
    /// on the wire.
    pub fn has(&self, field_index: usize) -> bool {
        field_index < 64 && self.presence & (1 << field_index) != 0
    }

    pub(crate) fn set_present(&mut self, field_index: usize) {
        debug_assert!(field_index < 64);
        self.presence |= 1 << field_index;
    }

    /// Checks that a record for the optional field at `field_index` was
    /// observed on the wire.
    ///
    /// An absent optional field is never a decode error; callers that treat
    /// one as mandatory apply this check after the parse.
    pub fn require(&self, field_index: usize) -> Result<(), DecodeError> {
        if self.has(field_index) {
            return Ok(());
        }
        let name = self
            .descriptor
            .and_then(|d| d.fields.get(field_index))
            .map_or("<unknown>", |f| f.name);
        Err(DecodeError::OptionalFieldMissing(name))
    }

    /// Fields whose ids were absent from the descriptor, in the order they
    /// appeared on the wire.
    pub fn unknown_fields(&self) -> &[UnknownField] {
        // The unknown list always holds UnknownField elements.
        unsafe { self.unknown.as_slice::<UnknownField>() }
    }

    pub(crate) fn unknown_mut(&mut self) -> &mut RawList {
        &mut self.unknown
    }
}

impl fmt::Debug for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHeader")
            .field("descriptor", &self.descriptor.map(|d| d.name))
            .field("presence", &format_args!("{:#018x}", self.presence))
            .field("unknown", &self.unknown.len())
            .finish()
    }
}

/// Marker trait binding a concrete `#[repr(C)]` message struct to its
/// descriptor, enabling typed decoding via
/// [`DecodeCtx::decode`](crate::DecodeCtx::decode).
///
/// # Safety
///
/// Implementors must guarantee that:
///
/// * `Self` is `#[repr(C)]` with a [`MessageHeader`] as its first field,
/// * `size_of::<Self>() == DESCRIPTOR.sizeof_message`,
/// * every field offset in `DESCRIPTOR` addresses a field of `Self` whose
///   Rust type matches the descriptor's storage type, and
/// * a zero-filled `Self` is a valid uninitialized message.
pub unsafe trait ProtoMessage: Sized {
    /// Descriptor describing the layout of `Self`.
    const DESCRIPTOR: &'static MessageDescriptor;

    /// The message header embedded at the start of `Self`.
    fn header(&self) -> &MessageHeader {
        unsafe { &*(self as *const Self as *const MessageHeader) }
    }
}

/// String storage: a NUL-terminated, arena-owned copy.
///
/// `len` excludes the trailing NUL. A zeroed value (null pointer) is the
/// unset state and reads as empty.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProtoString {
    ptr: *const u8,
    len: usize,
}

impl ProtoString {
    /// The unset string.
    pub const fn empty() -> Self {
        ProtoString {
            ptr: ptr::null(),
            len: 0,
        }
    }

    pub(crate) fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        ProtoString {
            ptr: ptr.as_ptr(),
            len,
        }
    }

    /// Whether a value was ever stored. Distinguishes "unset" from "set to
    /// the empty string".
    pub fn is_set(&self) -> bool {
        !self.ptr.is_null()
    }

    /// Length in bytes, excluding the trailing NUL.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the string is empty (or unset).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The string's bytes, without the trailing NUL.
    pub fn as_bytes(&self) -> &[u8] {
        if self.ptr.is_null() {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.ptr, self.len) }
        }
    }

    /// The string as UTF-8. The decoder copies wire bytes without
    /// validation, so this can fail.
    pub fn to_str(&self) -> Result<&str, str::Utf8Error> {
        str::from_utf8(self.as_bytes())
    }
}

impl Default for ProtoString {
    fn default() -> Self {
        ProtoString::empty()
    }
}

impl PartialEq<str> for ProtoString {
    fn eq(&self, other: &str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl PartialEq<&str> for ProtoString {
    fn eq(&self, other: &&str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl fmt::Debug for ProtoString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Bytes storage: an arena-owned copy of a length-delimited payload.
///
/// A zeroed value (null pointer) is the unset state.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProtoBytes {
    ptr: *const u8,
    len: usize,
}

impl ProtoBytes {
    /// The unset value.
    pub const fn empty() -> Self {
        ProtoBytes {
            ptr: ptr::null(),
            len: 0,
        }
    }

    pub(crate) fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        ProtoBytes {
            ptr: ptr.as_ptr(),
            len,
        }
    }

    pub(crate) const fn from_static(data: &'static [u8]) -> Self {
        ProtoBytes {
            ptr: data.as_ptr(),
            len: data.len(),
        }
    }

    /// Whether a value was ever stored.
    pub fn is_set(&self) -> bool {
        !self.ptr.is_null()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty (or unset).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.ptr, self.len) }
        }
    }
}

impl Default for ProtoBytes {
    fn default() -> Self {
        ProtoBytes::empty()
    }
}

impl fmt::Debug for ProtoBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtoBytes({} bytes)", self.len)
    }
}

/// Repeated-field storage: a pointer to the backing store plus length and
/// capacity. The element width comes from the field's descriptor at runtime,
/// so the list itself is untyped.
///
/// The decoder sizes every list exactly once (capacity equals the scanned
/// element count) and then appends; a decoded list always has
/// `len == capacity`.
#[repr(C)]
pub struct RawList {
    items: *mut u8,
    len: usize,
    cap: usize,
}

impl RawList {
    /// An empty list.
    pub const fn empty() -> Self {
        RawList {
            items: ptr::null_mut(),
            len: 0,
            cap: 0,
        }
    }

    /// Number of decoded elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the list holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of elements the backing store can hold.
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Views the list as a typed slice.
    ///
    /// # Safety
    ///
    /// `T` must be the storage type selected by the owning field's
    /// descriptor (`i32`/`u32`/`f32` for the 4-byte kinds, the 8-byte
    /// equivalents, `bool`, [`ProtoString`], [`ProtoBytes`], or
    /// `*mut MessageHeader`).
    pub unsafe fn as_slice<T>(&self) -> &[T] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.items as *const T, self.len) }
        }
    }

    /// Points the list at a fresh backing store and clears it so the parser
    /// can append.
    pub(crate) fn reset(&mut self, items: NonNull<u8>, cap: usize) {
        self.items = items.as_ptr();
        self.len = 0;
        self.cap = cap;
    }

    /// Appends a value. Capacity must have been reserved.
    pub(crate) unsafe fn push<T>(&mut self, value: T) {
        debug_assert!(self.len < self.cap);
        unsafe { (self.items as *mut T).add(self.len).write(value) };
        self.len += 1;
    }

    /// Claims the next element slot of `size` bytes, advancing the length.
    pub(crate) unsafe fn next_slot(&mut self, size: usize) -> *mut u8 {
        debug_assert!(self.len < self.cap);
        let slot = unsafe { self.items.add(self.len * size) };
        self.len += 1;
        slot
    }
}

impl Default for RawList {
    fn default() -> Self {
        RawList::empty()
    }
}

impl fmt::Debug for RawList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawList")
            .field("len", &self.len)
            .field("cap", &self.cap)
            .finish()
    }
}

/// A wire record whose field id was absent from the descriptor, retained
/// verbatim so a later encoder can round-trip it.
#[repr(C)]
#[derive(Debug)]
pub struct UnknownField {
    /// The record's key.
    pub key: RecordKey,
    /// Everything after the key, including the length prefix for
    /// length-delimited records.
    pub data: ProtoBytes,
}

impl UnknownField {
    /// The retained payload bytes.
    pub fn bytes(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Re-emits this record exactly as it appeared on the wire.
    pub fn encode_into<B: bytes::BufMut>(&self, buf: &mut B) {
        leb128::write_u64(u64::from(self.key.raw()), buf);
        buf.put_slice(self.bytes());
    }

    /// Encoded size of this record, key included.
    pub fn encoded_len(&self) -> usize {
        leb128::encoded_len(u64::from(self.key.raw())) + self.data.len()
    }
}

// ---------------------------------------------------------------------------
// Raw region access. Soundness rests on the descriptor verifier: offsets are
// in-bounds and naturally aligned for the type stored at them.

pub(crate) unsafe fn header_mut<'a>(region: *mut u8) -> &'a mut MessageHeader {
    unsafe { &mut *(region as *mut MessageHeader) }
}

pub(crate) unsafe fn read_at<T: Copy>(region: *const u8, offset: usize) -> T {
    unsafe { (region.add(offset) as *const T).read() }
}

pub(crate) unsafe fn write_at<T>(region: *mut u8, offset: usize, value: T) {
    unsafe { (region.add(offset) as *mut T).write(value) }
}

pub(crate) unsafe fn list_at<'a>(region: *mut u8, offset: usize) -> &'a mut RawList {
    unsafe { &mut *(region.add(offset) as *mut RawList) }
}

pub(crate) unsafe fn zero_at(region: *mut u8, offset: usize, size: usize) {
    unsafe { ptr::write_bytes(region.add(offset), 0, size) };
}

/// Initializes a message region for `desc`.
///
/// Delegates to the descriptor's custom initializer when present; otherwise
/// zero-fills the region, stamps the descriptor pointer, and applies the
/// defaults of non-repeated fields.
///
/// # Safety
///
/// `region` must be valid for `desc.sizeof_message` bytes and aligned to
/// [`MESSAGE_ALIGN`].
pub(crate) unsafe fn init_region(region: *mut u8, desc: &'static MessageDescriptor) {
    if let Some(init) = desc.message_init {
        unsafe { init(region, desc.sizeof_message) };
        return;
    }

    unsafe {
        ptr::write_bytes(region, 0, desc.sizeof_message);
        header_mut(region).descriptor = Some(desc);
    }

    for field in desc.fields {
        if matches!(field.label, Label::Repeated) {
            continue;
        }
        if let Some(default) = field.default_value {
            unsafe { apply_default(region, field.offset, default) };
        }
    }
}

unsafe fn apply_default(region: *mut u8, offset: usize, default: DefaultValue) {
    unsafe {
        match default {
            DefaultValue::Int32(v) => write_at(region, offset, v),
            DefaultValue::Uint32(v) => write_at(region, offset, v),
            DefaultValue::Int64(v) => write_at(region, offset, v),
            DefaultValue::Uint64(v) => write_at(region, offset, v),
            DefaultValue::Float(v) => write_at(region, offset, v),
            DefaultValue::Double(v) => write_at(region, offset, v),
            DefaultValue::Bool(v) => write_at(region, offset, v),
            DefaultValue::Enum(v) => write_at(region, offset, v),
            DefaultValue::Bytes(data) => write_at(region, offset, ProtoBytes::from_static(data)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::wire::WireType;

    use super::*;

    #[test]
    fn test_unset_string_reads_empty() {
        let s = ProtoString::empty();
        assert!(!s.is_set());
        assert!(s.is_empty());
        assert_eq!(s.as_bytes(), b"");
        assert_eq!(s.to_str().unwrap(), "");
    }

    #[test]
    fn test_unknown_field_reencodes_verbatim() {
        static PAYLOAD: &[u8] = &[0x07];
        let field = UnknownField {
            key: RecordKey {
                field_id: 2,
                wire_type: WireType::Varint,
            },
            data: ProtoBytes::from_static(PAYLOAD),
        };

        let mut buf = Vec::new();
        field.encode_into(&mut buf);
        assert_eq!(buf, [0x10, 0x07]);
        assert_eq!(field.encoded_len(), 2);
    }

    #[test]
    fn test_raw_list_push_and_slice() {
        let mut storage = [0i32; 3];
        let mut list = RawList::empty();
        list.reset(
            NonNull::new(storage.as_mut_ptr() as *mut u8).unwrap(),
            storage.len(),
        );

        unsafe {
            list.push(3i32);
            list.push(270i32);
            list.push(86942i32);
            assert_eq!(list.as_slice::<i32>(), &[3, 270, 86942]);
        }
        assert_eq!(list.len(), 3);
        assert_eq!(list.capacity(), 3);
    }
}
