//! Resolves a [`TypeRef`] (as attached to a field or instance) into a
//! concrete type to parse/serialize next: a primitive, a byte/string
//! literal, a lexically-scoped user type, or — for `switch-on` and ad-hoc
//! `switch-on: <expr>` type references — whichever of those an expression
//! evaluated against the current value tree selects.

use std::collections::HashMap;

use crate::errors::{ErrorKind, KaitaiError, Result};
use crate::expr::{self, EvalCtx};
use crate::schema::model::{self, Primitive, Switch, TypeRef, UserType};
use crate::stream::{BitEndian, Endian};
use crate::value::Value;

/// The concrete thing a [`TypeRef`] resolved to.
pub enum Resolved<'u> {
    Primitive(Primitive),
    Bytes,
    Str,
    Strz,
    User(&'u UserType),
}

/// Ad-hoc `switch-on:` chains are capped at this many hops: a resolved type
/// name that is itself another `switch-on:` directive counts as one hop.
/// Past this depth we assume the schema is malformed rather than loop.
const MAX_AD_HOC_DEPTH: u32 = 16;

/// Walks `ancestors` (root-first, current type last) looking for a nested
/// type named `name`, starting from the innermost (most local) scope and
/// widening outward — the same order names are resolved in by the
/// expression evaluator's scope chain.
pub fn find_user_type<'u>(name: &str, ancestors: &[&'u UserType]) -> Result<&'u UserType> {
    for ut in ancestors.iter().rev() {
        if let Some(found) = ut.find_type(name) {
            return Ok(found);
        }
    }
    Err(KaitaiError::new(ErrorKind::UnknownType {
        name: name.to_string(),
    }))
}

pub fn resolve_type_ref<'u>(
    type_ref: &TypeRef,
    ancestors: &[&'u UserType],
    endian: Endian,
    bit_endian: BitEndian,
    ctx: &mut EvalCtx,
) -> Result<Resolved<'u>> {
    match type_ref {
        TypeRef::Primitive(p) => Ok(Resolved::Primitive(*p)),
        TypeRef::Bytes => Ok(Resolved::Bytes),
        TypeRef::Str => Ok(Resolved::Str),
        TypeRef::Strz => Ok(Resolved::Strz),
        TypeRef::User(name) => Ok(Resolved::User(find_user_type(name, ancestors)?)),
        TypeRef::Switch(switch) => {
            let value = eval_named(&switch.switch_on, ctx)?;
            let type_name = choose_case(switch, &value)?;
            let next = model::parse_type_name(&type_name, endian, bit_endian)?;
            resolve_type_ref(&next, ancestors, endian, bit_endian, ctx)
        }
        TypeRef::AdHocSwitch(expr_src) => {
            resolve_ad_hoc(expr_src, ancestors, endian, bit_endian, ctx, 0)
        }
    }
}

fn resolve_ad_hoc<'u>(
    expr_src: &str,
    ancestors: &[&'u UserType],
    endian: Endian,
    bit_endian: BitEndian,
    ctx: &mut EvalCtx,
    depth: u32,
) -> Result<Resolved<'u>> {
    if depth > MAX_AD_HOC_DEPTH {
        return Err(KaitaiError::new(ErrorKind::UnknownType {
            name: "<switch recursion limit>".to_string(),
        }));
    }
    let value = eval_named(expr_src, ctx)?;
    let type_name = value_to_type_name(&value)?;
    if let Some(rest) = type_name.strip_prefix("switch-on:") {
        return resolve_ad_hoc(rest.trim(), ancestors, endian, bit_endian, ctx, depth + 1);
    }
    let next = model::parse_type_name(&type_name, endian, bit_endian)?;
    resolve_type_ref(&next, ancestors, endian, bit_endian, ctx)
}

fn eval_named(source: &str, ctx: &mut EvalCtx) -> Result<Value> {
    let ast = ctx.cache.compile(source)?;
    expr::eval(&ast, ctx)
}

fn value_to_type_name(val: &Value) -> Result<String> {
    match val {
        Value::Str { val, .. } => Ok(val.clone()),
        Value::Enum(e) => Ok(e.name.clone().unwrap_or_else(|| e.int_val.to_string())),
        Value::SInt { val, .. } => Ok(val.to_string()),
        Value::UInt { val, .. } => Ok(val.to_string()),
        _ => Err(KaitaiError::new(ErrorKind::UnknownType {
            name: "<non-type-name-value>".to_string(),
        })),
    }
}

fn choose_case(switch: &Switch, value: &Value) -> Result<String> {
    for (key, type_name) in &switch.cases {
        if key != "_" && case_matches(key, value) {
            return Ok(type_name.clone());
        }
    }
    if let Some(default) = switch.cases.get("_") {
        return Ok(default.clone());
    }
    Err(KaitaiError::new(ErrorKind::NoCase {
        switch_on: switch.switch_on.clone(),
        value: format!("{value:?}"),
    }))
}

fn case_matches(key: &str, value: &Value) -> bool {
    let unquoted = key
        .strip_prefix(['\'', '"'])
        .and_then(|s| s.strip_suffix(['\'', '"']))
        .unwrap_or(key);

    if let Some(enum_variant) = key.rsplit("::").next().filter(|_| key.contains("::")) {
        if let Value::Enum(e) = value {
            if e.name.as_deref() == Some(enum_variant) {
                return true;
            }
        }
        if let Ok(n) = enum_variant.parse::<i64>() {
            if value.as_i64() == Some(n) {
                return true;
            }
        }
        return false;
    }

    if let Ok(n) = key.parse::<i64>() {
        if value.as_i64() == Some(n) {
            return true;
        }
    }
    if let Some(s) = value.as_str() {
        return s == unquoted;
    }
    false
}

/// Walks `ancestors` the same way [`find_user_type`] does, but for an
/// `enum` table: a field's `enum:` attribute names an enum that may be
/// declared on the field's own type or on any enclosing one.
pub fn find_enum_table<'u>(name: &str, ancestors: &[&'u UserType]) -> Option<&'u HashMap<i64, String>> {
    for ut in ancestors.iter().rev() {
        if let Some(found) = ut.find_enum(name) {
            return Some(found);
        }
    }
    None
}

/// Checks whether entering `name` at the current stream position `pos`
/// would form a zero-progress cycle: the same type name already active on
/// the stack at the same byte offset it was pushed at. Genuine recursive
/// types (e.g. a linked list) always consume at least one byte per level,
/// so only a truly non-advancing re-entry is an error.
#[derive(Debug, Default)]
pub struct TypeStack {
    entries: Vec<(String, u64)>,
}

impl TypeStack {
    pub fn new() -> Self {
        TypeStack::default()
    }

    pub fn push(&mut self, name: &str, pos: u64) -> Result<()> {
        if self.entries.iter().any(|(n, p)| n == name && *p == pos) {
            let mut cycle: Vec<String> = self.entries.iter().map(|(n, _)| n.clone()).collect();
            cycle.push(name.to_string());
            return Err(KaitaiError::new(ErrorKind::CircularTypeDependency { cycle }));
        }
        self.entries.push((name.to_string(), pos));
        Ok(())
    }

    pub fn pop(&mut self) {
        self.entries.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn type_stack_allows_progressing_recursion() {
        let mut stack = TypeStack::new();
        stack.push("node", 0).unwrap();
        stack.push("node", 4).unwrap();
        stack.pop();
        stack.pop();
    }

    #[test]
    fn type_stack_rejects_zero_progress_recursion() {
        let mut stack = TypeStack::new();
        stack.push("node", 10).unwrap();
        assert!(stack.push("node", 10).is_err());
    }

    #[test]
    fn case_matches_int_key() {
        assert!(case_matches("1", &Value::unsigned(1, 1)));
        assert!(!case_matches("2", &Value::unsigned(1, 1)));
    }

    #[test]
    fn case_matches_quoted_string_key() {
        assert!(case_matches(
            "'png'",
            &Value::Str {
                encoding: "UTF-8".into(),
                val: "png".into()
            }
        ));
    }

    #[test]
    fn case_matches_enum_qualified_key() {
        let value = Value::Enum(crate::value::EnumValue {
            enum_name: "image_type".into(),
            int_val: 2,
            name: Some("png".into()),
            valid: true,
        });
        assert!(case_matches("image_type::png", &value));
    }

    #[test]
    fn choose_case_falls_back_to_default() {
        let mut cases = HashMap::new();
        cases.insert("1".to_string(), "a".to_string());
        cases.insert("_".to_string(), "fallback".to_string());
        let switch = Switch {
            switch_on: "tag".into(),
            cases,
        };
        let result = choose_case(&switch, &Value::unsigned(1, 99)).unwrap();
        assert_eq!(result, "fallback");
    }
}
