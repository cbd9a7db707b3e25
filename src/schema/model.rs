//! The immutable, resolved runtime schema compiled from the [`super::def`]
//! layer: a compile step that rejects malformed input once, up front, so
//! the parser and serializer never have to.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::errors::{ErrorKind, KaitaiError, Result};
use crate::stream::{BitEndian, Endian};

use super::def::{
    EndianDef, FieldDef, InstanceDef, ParamDef, RepeatDef, SchemaDef, SwitchDef, TypeRefDef,
    UserTypeDef, ValidDef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    None,
    Expr,
    Eos,
    Until,
}

/// A resolved type reference. Primitive literals are parsed eagerly;
/// everything else is resolved lazily by [`crate::resolve`] since it may
/// depend on run-time expression evaluation.
#[derive(Debug, Clone)]
pub enum TypeRef {
    Primitive(Primitive),
    Bytes,
    Str,
    Strz,
    /// A bare user-type name, resolved against the lexical scope chain.
    User(String),
    Switch(Switch),
    /// `switch-on: <expr>` — the expression yields the type name itself.
    AdHocSwitch(String),
}

#[derive(Debug, Clone)]
pub struct Switch {
    pub switch_on: String,
    pub cases: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    U(u8, Endian),
    S(u8, Endian),
    F(u8, Endian),
    B(u8, BitEndian),
}

#[derive(Debug, Clone)]
pub enum Valid {
    Eq(serde_json::Value),
    Range {
        min: Option<serde_json::Value>,
        max: Option<serde_json::Value>,
    },
    AnyOf(Vec<serde_json::Value>),
    InEnum,
    Expr(String),
}

#[derive(Debug, Clone)]
pub struct Field {
    pub id: String,
    pub type_ref: Option<TypeRef>,
    pub size: Option<String>,
    pub size_eos: bool,
    pub repeat: Repeat,
    pub repeat_expr: Option<String>,
    pub repeat_until: Option<String>,
    pub if_expr: Option<String>,
    pub contents: Option<Vec<u8>>,
    pub process: Option<String>,
    pub encoding: Option<String>,
    pub terminator: u8,
    pub include: bool,
    pub consume: bool,
    pub pad_right: Option<u8>,
    pub enum_name: Option<String>,
    pub valid: Option<Valid>,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub id: String,
    pub type_name: String,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub value: String,
    pub type_ref: Option<TypeRef>,
    pub if_expr: Option<String>,
    pub repeat: Repeat,
    pub repeat_expr: Option<String>,
    pub repeat_until: Option<String>,
    pub encoding: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UserType {
    pub name: String,
    pub seq: Vec<Field>,
    pub types: IndexMap<String, UserType>,
    pub instances: IndexMap<String, Instance>,
    pub params: Vec<Param>,
    pub enums: IndexMap<String, HashMap<i64, String>>,
}

impl UserType {
    /// Looks up a nested type by name, searching only this type's own
    /// `types` map (the caller walks the lexical scope chain upward).
    pub fn find_type(&self, name: &str) -> Option<&UserType> {
        self.types.get(name)
    }

    pub fn find_enum(&self, name: &str) -> Option<&HashMap<i64, String>> {
        self.enums.get(name)
    }
}

#[derive(Debug, Clone)]
pub struct Meta {
    pub id: String,
    pub endian: Endian,
    pub bit_endian: BitEndian,
    pub encoding: String,
    pub imports: Vec<String>,
    pub root_type: Option<String>,
}

/// The fully compiled, immutable schema. Shared by reference across
/// concurrent parses.
#[derive(Debug, Clone)]
pub struct Schema {
    pub meta: Meta,
    pub root: UserType,
}

impl Schema {
    /// Compiles a [`SchemaDef`] (as an external loader would hand us, e.g.
    /// from YAML/JSON) into a resolved [`Schema`]. Primitive type strings
    /// are parsed once here; user-type and switch resolution happens at
    /// parse/serialize time since it depends on expression evaluation.
    pub fn compile(def: &SchemaDef) -> Result<Schema> {
        let endian = match def.meta.endian {
            EndianDef::Little => Endian::Little,
            _ => Endian::Big,
        };
        let bit_endian = match def.meta.bit_endian {
            EndianDef::Little => BitEndian::Little,
            _ => BitEndian::Big,
        };
        let meta = Meta {
            id: def.meta.id.clone(),
            endian,
            bit_endian,
            encoding: def.meta.encoding.clone().unwrap_or_else(|| "UTF-8".to_string()),
            imports: def.meta.imports.clone(),
            root_type: def.meta.root_type.clone(),
        };
        let root_name = meta.root_type.clone().unwrap_or_else(|| meta.id.clone());
        let root_def = UserTypeDef {
            seq: def.seq.clone(),
            types: def.types.clone(),
            instances: def.instances.clone(),
            params: def.params.clone(),
            enums: def.enums.clone(),
        };
        let root = compile_user_type(&root_name, &root_def, endian, bit_endian)?;
        Ok(Schema { meta, root })
    }

    pub fn root_type_name(&self) -> &str {
        &self.root.name
    }
}

fn compile_user_type(
    name: &str,
    def: &UserTypeDef,
    endian: Endian,
    bit_endian: BitEndian,
) -> Result<UserType> {
    let mut seq = Vec::with_capacity(def.seq.len());
    for f in &def.seq {
        seq.push(compile_field(f, endian, bit_endian)?);
    }
    let mut types = IndexMap::with_capacity(def.types.len());
    for (child_name, child_def) in &def.types {
        types.insert(
            child_name.clone(),
            compile_user_type(child_name, child_def, endian, bit_endian)?,
        );
    }
    let mut instances = IndexMap::with_capacity(def.instances.len());
    for (inst_name, inst_def) in &def.instances {
        instances.insert(inst_name.clone(), compile_instance(inst_name, inst_def, endian, bit_endian)?);
    }
    let params = def
        .params
        .iter()
        .map(|p: &ParamDef| Param {
            id: p.id.clone(),
            type_name: p.type_name.clone(),
        })
        .collect();
    Ok(UserType {
        name: name.to_string(),
        seq,
        types,
        instances,
        params,
        enums: def.enums.clone(),
    })
}

fn compile_repeat(repeat: RepeatDef) -> Repeat {
    match repeat {
        RepeatDef::None => Repeat::None,
        RepeatDef::Expr => Repeat::Expr,
        RepeatDef::Eos => Repeat::Eos,
        RepeatDef::Until => Repeat::Until,
    }
}

fn compile_field(f: &FieldDef, endian: Endian, bit_endian: BitEndian) -> Result<Field> {
    let type_ref = match &f.type_ref {
        None => None,
        Some(t) => Some(compile_type_ref(t, endian, bit_endian)?),
    };
    let valid = match &f.valid {
        None => None,
        Some(v) => Some(compile_valid(v)?),
    };
    Ok(Field {
        id: f.id.clone(),
        type_ref,
        size: f.size.clone(),
        size_eos: f.size_eos,
        repeat: compile_repeat(f.repeat),
        repeat_expr: f.repeat_expr.clone(),
        repeat_until: f.repeat_until.clone(),
        if_expr: f.if_expr.clone(),
        contents: f.contents.clone(),
        process: f.process.clone(),
        encoding: f.encoding.clone(),
        terminator: f.terminator.unwrap_or(0),
        include: f.include,
        consume: f.consume,
        pad_right: f.pad_right,
        enum_name: f.enum_name.clone(),
        valid,
    })
}

fn compile_instance(id: &str, def: &InstanceDef, endian: Endian, bit_endian: BitEndian) -> Result<Instance> {
    let type_ref = match &def.type_ref {
        None => None,
        Some(t) => Some(compile_type_ref(t, endian, bit_endian)?),
    };
    Ok(Instance {
        id: id.to_string(),
        value: def.value.clone(),
        type_ref,
        if_expr: def.if_expr.clone(),
        repeat: compile_repeat(def.repeat),
        repeat_expr: def.repeat_expr.clone(),
        repeat_until: def.repeat_until.clone(),
        encoding: def.encoding.clone(),
    })
}

fn compile_valid(v: &ValidDef) -> Result<Valid> {
    if let Some(e) = &v.eq {
        return Ok(Valid::Eq(e.clone()));
    }
    if v.min.is_some() || v.max.is_some() {
        return Ok(Valid::Range {
            min: v.min.clone(),
            max: v.max.clone(),
        });
    }
    if let Some(set) = &v.any_of {
        return Ok(Valid::AnyOf(set.clone()));
    }
    if v.in_enum {
        return Ok(Valid::InEnum);
    }
    if let Some(expr) = &v.expr {
        return Ok(Valid::Expr(expr.clone()));
    }
    Err(KaitaiError::new(ErrorKind::ExprCompileError {
        source: String::new(),
        reason: "empty `valid` specification".to_string(),
    }))
}

fn compile_type_ref(t: &TypeRefDef, endian: Endian, bit_endian: BitEndian) -> Result<TypeRef> {
    match t {
        TypeRefDef::Switch(SwitchDef { switch_on, cases }) => Ok(TypeRef::Switch(Switch {
            switch_on: switch_on.clone(),
            cases: cases.clone(),
        })),
        TypeRefDef::Name(name) => parse_type_name(name, endian, bit_endian),
    }
}

/// Parses a bare type-reference string into a [`TypeRef`]: a primitive
/// literal (`u2le`, `s4`, `f8be`, `b12le`), `str`/`strz`/`bytes`, an
/// ad-hoc `"switch-on: expr"` directive, or a user-type name.
pub fn parse_type_name(name: &str, endian: Endian, bit_endian: BitEndian) -> Result<TypeRef> {
    if let Some(rest) = name.strip_prefix("switch-on:") {
        return Ok(TypeRef::AdHocSwitch(rest.trim().to_string()));
    }
    match name {
        "str" => return Ok(TypeRef::Str),
        "strz" => return Ok(TypeRef::Strz),
        "bytes" => return Ok(TypeRef::Bytes),
        _ => {}
    }
    if let Some(p) = parse_primitive(name, endian, bit_endian) {
        return Ok(TypeRef::Primitive(p));
    }
    Ok(TypeRef::User(name.to_string()))
}

fn parse_primitive(name: &str, default_endian: Endian, default_bit_endian: BitEndian) -> Option<Primitive> {
    let bytes = name.as_bytes();
    if bytes.is_empty() {
        return None;
    }
    let (kind, rest) = (bytes[0], &name[1..]);
    match kind {
        b'u' | b's' => {
            let (digits, suffix) = split_endian_suffix(rest);
            let width: u8 = digits.parse().ok()?;
            if ![1u8, 2, 4, 8].contains(&width) {
                return None;
            }
            let endian = suffix.unwrap_or(default_endian);
            Some(if kind == b'u' {
                Primitive::U(width, endian)
            } else {
                Primitive::S(width, endian)
            })
        }
        b'f' => {
            let (digits, suffix) = split_endian_suffix(rest);
            let width: u8 = digits.parse().ok()?;
            if ![4u8, 8].contains(&width) {
                return None;
            }
            Some(Primitive::F(width, suffix.unwrap_or(default_endian)))
        }
        b'b' => {
            let (digits, suffix) = split_bit_endian_suffix(rest);
            let width: u8 = digits.parse().ok()?;
            if width == 0 || width > 64 {
                return None;
            }
            Some(Primitive::B(width, suffix.unwrap_or(default_bit_endian)))
        }
        _ => None,
    }
}

fn split_endian_suffix(rest: &str) -> (&str, Option<Endian>) {
    if let Some(d) = rest.strip_suffix("le") {
        (d, Some(Endian::Little))
    } else if let Some(d) = rest.strip_suffix("be") {
        (d, Some(Endian::Big))
    } else {
        (rest, None)
    }
}

fn split_bit_endian_suffix(rest: &str) -> (&str, Option<BitEndian>) {
    if let Some(d) = rest.strip_suffix("le") {
        (d, Some(BitEndian::Little))
    } else if let Some(d) = rest.strip_suffix("be") {
        (d, Some(BitEndian::Big))
    } else {
        (rest, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_primitive_with_explicit_endian() {
        let p = parse_primitive("u2le", Endian::Big, BitEndian::Big).unwrap();
        assert_eq!(p, Primitive::U(2, Endian::Little));
    }

    #[test]
    fn primitive_inherits_default_endian() {
        let p = parse_primitive("u2", Endian::Little, BitEndian::Big).unwrap();
        assert_eq!(p, Primitive::U(2, Endian::Little));
    }

    #[test]
    fn bitfield_parses_width_and_bit_endian() {
        let p = parse_primitive("b12le", Endian::Big, BitEndian::Big).unwrap();
        assert_eq!(p, Primitive::B(12, BitEndian::Little));
    }

    #[test]
    fn rejects_invalid_width() {
        assert!(parse_primitive("u3", Endian::Big, BitEndian::Big).is_none());
    }

    #[test]
    fn non_primitive_name_is_user_type() {
        let t = parse_type_name("my_type", Endian::Big, BitEndian::Big).unwrap();
        assert!(matches!(t, TypeRef::User(n) if n == "my_type"));
    }

    #[test]
    fn ad_hoc_switch_directive() {
        let t = parse_type_name("switch-on: foo", Endian::Big, BitEndian::Big).unwrap();
        assert!(matches!(t, TypeRef::AdHocSwitch(e) if e == "foo"));
    }
}
