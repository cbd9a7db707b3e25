//! Schema data model: the `def` (serde-loadable, plain-data) layer and the
//! `model` (compiled, immutable, runtime) layer built from it.

pub mod def;
pub mod model;

pub use model::{Field, Instance, Meta, Param, Primitive, Repeat, Schema, TypeRef, UserType, Valid};
