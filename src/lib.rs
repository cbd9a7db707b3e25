//! A runtime interpreter for Kaitai Struct (`.ksy`) binary format schemas.
//!
//! Unlike the reference `kaitai-struct-compiler`, this crate never generates
//! code: a [`schema::Schema`] is compiled once from a [`schema::def::SchemaDef`]
//! and then walked directly by [`parser::parse`] / [`serializer::serialize`]
//! against any byte stream. The same compiled schema can parse and serialize
//! many independent streams concurrently; see [`cancel`] for how long-running
//! walks can be aborted cooperatively.

pub mod cancel;
pub mod errors;
pub mod expr;
pub mod parser;
pub mod process;
pub mod resolve;
pub mod schema;
pub mod serializer;
pub mod stream;
pub mod validate;
pub mod value;

pub use cancel::CancellationToken;
pub use errors::{ErrorKind, KaitaiError, Result};
pub use parser::{parse, parse_with_cache};
pub use schema::def::SchemaDef;
pub use schema::{Field, Instance, Meta, Param, Primitive, Repeat, Schema, TypeRef, UserType, Valid};
pub use serializer::{serialize, serialize_with_cache};
pub use value::{EnumValue, Node, Value};
