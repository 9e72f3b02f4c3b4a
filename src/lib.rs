//! A descriptor-driven decoder for the protobuf wire format.
//!
//! Instead of decoding into statically generated types, `protodyn`
//! materializes messages whose layout is dictated entirely by runtime
//! [`MessageDescriptor`](descriptor::MessageDescriptor) values: each field
//! descriptor names the byte offset of its storage inside a message region,
//! and the decoder writes values through those offsets.
//!
//! Decoding is two-pass. A scanner first splits the input into records and
//! tallies repeated-field element counts, then every repeated field's
//! backing store is allocated exactly once, and finally a parser walks the
//! scanned records storing values. All decoded storage comes from a caller
//! supplied [`Arena`] and is released by dropping it.
//!
//! ```ignore
//! let arena = Arena::new();
//! let mut ctx = DecodeCtx::new(&encoded, &arena);
//! let person: &Person = ctx.decode()?;
//! assert_eq!(person.name, "Alice");
//! ```
//!
//! Unknown fields are retained verbatim in wire order, optional fields carry
//! presence bits, oneof groups keep a discriminator next to their members,
//! and packed repeated scalars decode from a single length-delimited record.

pub mod arena;
pub mod descriptor;
pub mod error;
pub mod leb128;
pub mod message;
pub mod wire;

mod decode;

pub use crate::arena::Arena;
pub use crate::decode::{DecodeCtx, RECURSION_LIMIT};
pub use crate::error::{DecodeError, DescriptorError};
pub use crate::message::{MessageHeader, ProtoMessage};
