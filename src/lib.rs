//! # binschema: declarative binary format decoder
//!
//! A schema describes a binary format as structs of typed fields; small
//! expressions (sizes, counts, conditions, switch discriminants, seeks)
//! refer to fields decoded earlier. The decoder walks a byte buffer with the
//! schema and produces a tree of [`DecodedNode`]s with offsets and sizes.
//!
//! ## Schema text
//!
//! ```text
//! format Demo { endian: little; root: File; }
//!
//! struct File {
//!   magic: bytes [size = 2, expect = x"BD01"];
//!   count: u8;
//!   records: Record [repeat = count, count = {count}];
//! }
//!
//! struct Record {
//!   kind: u8;
//!   len: u8;
//!   name: ascii [size = {len}, if = {kind == 1}];
//! }
//! ```
//!
//! ## Field types
//!
//! - Integers `u8`..`u64`, `i8`..`i64`, floats `f32`, `f64`
//! - Strings `ascii`, `utf8`, `utf16le`, `utf16be`, `sjis`, `latin1`, and `*z` null-terminated forms
//! - `bytes`, `bitfield`, `switch`, `zlib`, `deflate`, `uleb128`, `sleb128`, `vlq`, `virtual`
//! - Any other type name refers to a struct
//!
//! ## Error modes
//!
//! [`decode`] stops at the first failure. [`decode_with_recovery`] with
//! [`ErrorMode::Continue`] records failures as error nodes and keeps going.

pub mod context;
pub mod decoder;
pub mod dump;
pub mod expr;
pub mod node;
pub mod parser;
pub mod schema;
pub mod value;

pub use context::{ContextError, DecodeContext};
pub use decoder::{decode, decode_with_recovery, DecodeError, DecodeErrorKind, Decoder, ErrorMode};
pub use expr::{ExprError, Expression};
pub use node::{DecodedNode, NodeKind};
pub use parser::{load, load_file, parse};
pub use schema::{Endianness, ResolvedSchema, Schema, SchemaError};
pub use value::RuntimeValue;
