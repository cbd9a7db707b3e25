//! Plain-data, `serde`-(de)serializable shapes mirroring the schema as an
//! external loader (YAML or JSON, out of scope for this crate) would hand
//! it to us: a `*Def` layer, compiled into the runtime layer in
//! [`super::model`].

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndianDef {
    Little,
    Big,
    #[default]
    Unset,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MetaDef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub endian: EndianDef,
    #[serde(rename = "bit-endian", default)]
    pub bit_endian: EndianDef,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(rename = "root-type", default)]
    pub root_type: Option<String>,
}

/// A type reference: a primitive/user-type name, a switch record, or an
/// ad-hoc `"switch-on: expr"` string (parsed lazily by the resolver).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TypeRefDef {
    Name(String),
    Switch(SwitchDef),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SwitchDef {
    #[serde(rename = "switch-on")]
    pub switch_on: String,
    pub cases: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatDef {
    #[default]
    None,
    Expr,
    Eos,
    Until,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ValidDef {
    #[serde(default)]
    pub eq: Option<serde_json::Value>,
    #[serde(default)]
    pub min: Option<serde_json::Value>,
    #[serde(default)]
    pub max: Option<serde_json::Value>,
    #[serde(rename = "any-of", default)]
    pub any_of: Option<Vec<serde_json::Value>>,
    #[serde(rename = "in-enum", default)]
    pub in_enum: bool,
    #[serde(default)]
    pub expr: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FieldDef {
    pub id: String,
    #[serde(rename = "type", default)]
    pub type_ref: Option<TypeRefDef>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(rename = "size-eos", default)]
    pub size_eos: bool,
    #[serde(default)]
    pub repeat: RepeatDef,
    #[serde(rename = "repeat-expr", default)]
    pub repeat_expr: Option<String>,
    #[serde(rename = "repeat-until", default)]
    pub repeat_until: Option<String>,
    #[serde(rename = "if", default)]
    pub if_expr: Option<String>,
    #[serde(default)]
    pub contents: Option<Vec<u8>>,
    #[serde(default)]
    pub process: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub terminator: Option<u8>,
    #[serde(default)]
    pub include: bool,
    #[serde(default)]
    pub consume: bool,
    #[serde(rename = "pad-right", default)]
    pub pad_right: Option<u8>,
    #[serde(rename = "enum", default)]
    pub enum_name: Option<String>,
    #[serde(default)]
    pub valid: Option<ValidDef>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ParamDef {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InstanceDef {
    pub value: String,
    #[serde(rename = "type", default)]
    pub type_ref: Option<TypeRefDef>,
    #[serde(rename = "if", default)]
    pub if_expr: Option<String>,
    #[serde(default)]
    pub repeat: RepeatDef,
    #[serde(rename = "repeat-expr", default)]
    pub repeat_expr: Option<String>,
    #[serde(rename = "repeat-until", default)]
    pub repeat_until: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UserTypeDef {
    #[serde(default)]
    pub seq: Vec<FieldDef>,
    #[serde(default)]
    pub types: IndexMap<String, UserTypeDef>,
    #[serde(default)]
    pub instances: IndexMap<String, InstanceDef>,
    #[serde(default)]
    pub params: Vec<ParamDef>,
    #[serde(default)]
    pub enums: IndexMap<String, HashMap<i64, String>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SchemaDef {
    #[serde(default)]
    pub meta: MetaDef,
    #[serde(default)]
    pub seq: Vec<FieldDef>,
    #[serde(default)]
    pub types: IndexMap<String, UserTypeDef>,
    #[serde(default)]
    pub instances: IndexMap<String, InstanceDef>,
    #[serde(default)]
    pub enums: IndexMap<String, HashMap<i64, String>>,
    #[serde(default)]
    pub params: Vec<ParamDef>,
}
