//! The Serializer Core: the mirror image of [`crate::parser`] — walks a
//! [`Schema`] against an already-built [`Value`] tree and emits bytes.
//! Field order, endianness/encoding defaults, and instance-evaluation
//! semantics match the parser exactly so a parse-then-serialize round trip
//! reproduces the original stream.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::cancel::{self, CancellationToken};
use crate::errors::{ErrorKind, KaitaiError, Result};
use crate::expr::{self, EvalCtx, ExprCache, IoInfo, Scope};
use crate::process;
use crate::resolve::{self, Resolved, TypeStack};
use crate::schema::{Field, Primitive, Repeat, Schema, TypeRef, UserType};
use crate::stream::{Endian, Writer};
use crate::value::{Node, Value};

/// Serializes `value` against `schema`'s root type, using a throwaway
/// expression cache. Prefer [`serialize_with_cache`] when serializing
/// against the same schema repeatedly.
pub fn serialize(schema: &Schema, value: &Value, cancel: Option<&CancellationToken>) -> Result<Vec<u8>> {
    let cache = ExprCache::default();
    serialize_with_cache(schema, value, &cache, cancel)
}

/// As [`serialize`], but against a caller-supplied, possibly-shared
/// [`ExprCache`].
pub fn serialize_with_cache<'s>(
    schema: &'s Schema,
    value: &Value,
    cache: &'s ExprCache,
    cancel: Option<&'s CancellationToken>,
) -> Result<Vec<u8>> {
    let span = tracing::info_span!("serialize", root = %schema.root.name);
    let _enter = span.enter();
    tracing::debug!("serialize start");
    let s = Serializer {
        schema,
        cache,
        cancel,
        type_stack: RefCell::new(TypeStack::new()),
        progress: Cell::new(0),
    };
    let root_node = value.as_node().ok_or_else(|| {
        KaitaiError::new(ErrorKind::ExprEvalError {
            source: String::new(),
            reason: "root value is not a struct/map".to_string(),
        })
    })?;
    let mut writer = Writer::new();
    let mut ancestors: Vec<&'s UserType> = Vec::new();
    let result = s.write_type_value(&schema.root, root_node, &mut writer, None, &mut ancestors);
    match &result {
        Ok(_) => tracing::debug!("serialize complete"),
        Err(e) => tracing::debug!(error = %e, "serialize failed"),
    }
    result?;
    Ok(writer.into_bytes())
}

struct Serializer<'s> {
    schema: &'s Schema,
    cache: &'s ExprCache,
    cancel: Option<&'s CancellationToken>,
    type_stack: RefCell<TypeStack>,
    progress: Cell<u64>,
}

impl<'s> Serializer<'s> {
    fn cancel_check(&self) -> Result<()> {
        cancel::check_cancelled(self.cancel)
    }

    fn bump(&self, bits: u64) {
        self.progress.set(self.progress.get() + bits);
    }

    fn eval_ctx<'c>(&'c self, scope: &'c Rc<Scope<'s>>, writer: &Writer, sizeof: Option<u64>) -> EvalCtx<'s, 'c> {
        let io = IoInfo {
            pos: writer.pos(),
            size: writer.pos(),
            eof: true,
        };
        EvalCtx::new(&**scope, io, sizeof, self.cache)
    }

    fn eval_bool(&self, src: &str, scope: &Rc<Scope<'s>>, writer: &Writer) -> Result<bool> {
        let ast = self.cache.compile(src)?;
        let mut ctx = self.eval_ctx(scope, writer, None);
        Ok(expr::eval(&ast, &mut ctx)?.truthy())
    }

    fn eval_size(&self, src: &str, scope: &Rc<Scope<'s>>, writer: &Writer) -> Result<usize> {
        let ast = self.cache.compile(src)?;
        let mut ctx = self.eval_ctx(scope, writer, None);
        let value = expr::eval(&ast, &mut ctx)?;
        let n = value.as_i64().ok_or_else(|| {
            KaitaiError::new(ErrorKind::ExprEvalError {
                source: src.to_string(),
                reason: "expression did not yield an integer".to_string(),
            })
        })?;
        if n < 0 {
            return Err(KaitaiError::new(ErrorKind::ExprRangeError));
        }
        Ok(n as usize)
    }

    fn build_process(&self, raw: &str, scope: &Rc<Scope<'s>>, writer: &Writer) -> Result<process::ProcessSpec> {
        self.cancel_check()?;
        process::resolve_spec(raw, |src| {
            let ast = self.cache.compile(src)?;
            let mut ctx = self.eval_ctx(scope, writer, None);
            expr::eval(&ast, &mut ctx)
        })
    }

    fn lookup(&self, field: &Field, scope: &Rc<Scope<'s>>) -> Result<Value> {
        scope
            .node
            .borrow()
            .get(&field.id)
            .cloned()
            .ok_or_else(|| KaitaiError::new(ErrorKind::MissingField { id: field.id.clone() }))
    }

    /// Unwraps `field`'s declared `enum` tagging: an enum-tagged value is
    /// rewritten to the plain signed integer it carries so the rest of the
    /// write path doesn't need to special-case it. A raw integer passed
    /// where an enum is declared is accepted as-is (§4.8).
    fn unwrap_enum(&self, field: &Field, value: Value) -> Result<Value> {
        if field.enum_name.is_none() {
            return Ok(value);
        }
        match value {
            Value::Enum(e) => Ok(Value::SInt { width: 8, val: e.int_val }),
            other => Ok(other),
        }
    }

    fn encode_str(&self, text: &str, encoding: &str) -> Result<Vec<u8>> {
        let enc = encoding_rs::Encoding::for_label(encoding.as_bytes()).unwrap_or(encoding_rs::UTF_8);
        let (bytes, _, had_errors) = enc.encode(text);
        if had_errors {
            return Err(KaitaiError::new(ErrorKind::EncodingError {
                encoding: encoding.to_string(),
                direction: crate::errors::EncodingDirection::Encode,
            }));
        }
        Ok(bytes.into_owned())
    }

    /// Truncates or zero-right-pads `bytes` to exactly `n` bytes.
    fn resize_with_pad(&self, mut bytes: Vec<u8>, n: usize) -> Vec<u8> {
        bytes.resize(n, 0);
        bytes
    }

    fn write_primitive(&self, p: Primitive, value: &Value, writer: &mut Writer) -> Result<()> {
        let numeric_err = || {
            KaitaiError::new(ErrorKind::ExprEvalError {
                source: String::new(),
                reason: "value is not numeric".to_string(),
            })
        };
        match p {
            Primitive::U(width, endian) => {
                let v = value.as_u64().ok_or_else(numeric_err)?;
                match width {
                    1 => writer.write_u1(v as u8, endian),
                    2 => writer.write_u2(v as u16, endian),
                    4 => writer.write_u4(v as u32, endian),
                    8 => writer.write_u8(v, endian),
                    _ => unreachable!("width validated at schema compile time"),
                }
                self.bump(width as u64 * 8);
            }
            Primitive::S(width, endian) => {
                let v = value.as_i64().ok_or_else(numeric_err)?;
                match width {
                    1 => writer.write_s1(v as i8, endian),
                    2 => writer.write_s2(v as i16, endian),
                    4 => writer.write_s4(v as i32, endian),
                    8 => writer.write_s8(v, endian),
                    _ => unreachable!("width validated at schema compile time"),
                }
                self.bump(width as u64 * 8);
            }
            Primitive::F(width, endian) => {
                let v = value.as_f64().ok_or_else(numeric_err)?;
                match width {
                    4 => writer.write_f4(v as f32, endian),
                    8 => writer.write_f8(v, endian),
                    _ => unreachable!("width validated at schema compile time"),
                }
                self.bump(width as u64 * 8);
            }
            Primitive::B(width, bit_endian) => {
                let v = value.as_u64().ok_or_else(numeric_err)?;
                writer.write_bits(width as usize, v, bit_endian)?;
                self.bump(width as u64);
            }
        }
        Ok(())
    }

    fn write_resolved(
        &self,
        type_ref: &TypeRef,
        value: &Value,
        writer: &mut Writer,
        scope: &Rc<Scope<'s>>,
        ancestors: &mut Vec<&'s UserType>,
    ) -> Result<()> {
        let resolved = {
            let mut ctx = self.eval_ctx(scope, writer, None);
            resolve::resolve_type_ref(
                type_ref,
                ancestors.as_slice(),
                self.schema.meta.endian,
                self.schema.meta.bit_endian,
                &mut ctx,
            )?
        };
        match resolved {
            Resolved::Primitive(p) => self.write_primitive(p, value, writer),
            Resolved::Bytes => {
                let bytes = value.as_bytes().ok_or_else(|| {
                    KaitaiError::new(ErrorKind::ExprEvalError {
                        source: String::new(),
                        reason: "expected a byte sequence".to_string(),
                    })
                })?;
                writer.write_bytes(bytes);
                self.bump(bytes.len() as u64 * 8);
                Ok(())
            }
            Resolved::Str => {
                let text = value.as_str().ok_or_else(|| {
                    KaitaiError::new(ErrorKind::ExprEvalError {
                        source: String::new(),
                        reason: "expected a string".to_string(),
                    })
                })?;
                let encoded = self.encode_str(text, &self.schema.meta.encoding)?;
                self.bump(encoded.len() as u64 * 8);
                writer.write_bytes(&encoded);
                Ok(())
            }
            Resolved::Strz => {
                let text = value.as_str().ok_or_else(|| {
                    KaitaiError::new(ErrorKind::ExprEvalError {
                        source: String::new(),
                        reason: "expected a string".to_string(),
                    })
                })?;
                let mut encoded = self.encode_str(text, &self.schema.meta.encoding)?;
                encoded.push(0);
                self.bump(encoded.len() as u64 * 8);
                writer.write_bytes(&encoded);
                Ok(())
            }
            Resolved::User(ut) => {
                let node = value.as_node().ok_or_else(|| {
                    KaitaiError::new(ErrorKind::ExprEvalError {
                        source: String::new(),
                        reason: "expected a nested struct".to_string(),
                    })
                })?;
                self.write_type_value(ut, node, writer, Some(scope), ancestors)
            }
        }
    }

    /// Handles a field whose wire form is computed directly: no `size`,
    /// `size_eos`, or `process` in play (§4.8's generic write path mirror
    /// of §4.6 step 7's "operate on the current stream" branch).
    fn write_generic_field(
        &self,
        field: &Field,
        value: &Value,
        writer: &mut Writer,
        scope: &Rc<Scope<'s>>,
        ancestors: &mut Vec<&'s UserType>,
    ) -> Result<()> {
        let type_ref = field.type_ref.as_ref().ok_or_else(|| {
            KaitaiError::new(ErrorKind::UnknownType {
                name: "<field has no type>".to_string(),
            })
        })?;
        let unwrapped = self.unwrap_enum(field, value.clone())?;
        if field.size.is_some() || field.size_eos || field.process.is_some() {
            let mut inner = Writer::new();
            self.write_resolved(type_ref, &unwrapped, &mut inner, scope, ancestors)?;
            let mut bytes = inner.into_bytes();
            if let Some(proc_src) = &field.process {
                let spec = self.build_process(proc_src, scope, writer)?;
                tracing::trace!(field = %field.id, process = proc_src, len = bytes.len(), "unapplying process filter");
                bytes = spec.unapply(&bytes)?;
            }
            if !field.size_eos {
                if let Some(size_src) = &field.size {
                    let n = self.eval_size(size_src, scope, writer)?;
                    bytes = self.resize_with_pad(bytes, n);
                }
            }
            writer.write_bytes(&bytes);
            self.bump(bytes.len() as u64 * 8);
            Ok(())
        } else {
            self.write_resolved(type_ref, &unwrapped, writer, scope, ancestors)
        }
    }

    /// Emits the raw bytes that would have been `read_field_raw_bytes`'s
    /// counterpart on the parse side, then (for `size`-bounded fields)
    /// pads/truncates. `pad_right` is re-applied on write since the parser
    /// stripped it from the decoded value.
    fn write_field_bytes(&self, field: &Field, mut raw: Vec<u8>, writer: &mut Writer, scope: &Rc<Scope<'s>>) -> Result<()> {
        if let Some(pad) = field.pad_right {
            if let Some(size_src) = &field.size {
                let n = self.eval_size(size_src, scope, writer)?;
                if raw.len() < n {
                    raw.resize(n, pad);
                }
            }
        }
        if field.size_eos {
            writer.write_bytes(&raw);
        } else if let Some(size_src) = &field.size {
            let n = self.eval_size(size_src, scope, writer)?;
            let sized = self.resize_with_pad(raw, n);
            writer.write_bytes(&sized);
        } else if matches!(field.type_ref, Some(TypeRef::Strz)) {
            writer.write_bytes(&raw);
            writer.write_bytes(&[field.terminator]);
        } else {
            writer.write_bytes(&raw);
            if field.consume && !field.include {
                writer.write_bytes(&[field.terminator]);
            }
        }
        self.bump(raw.len() as u64 * 8);
        Ok(())
    }

    fn write_field_once(
        &self,
        field: &Field,
        value: &Value,
        writer: &mut Writer,
        scope: &Rc<Scope<'s>>,
        ancestors: &mut Vec<&'s UserType>,
    ) -> Result<()> {
        if let Some(expected) = &field.contents {
            writer.write_bytes(expected);
            self.bump(expected.len() as u64 * 8);
            return Ok(());
        }
        match &field.type_ref {
            Some(TypeRef::Str) | Some(TypeRef::Strz) => {
                let text = value.as_str().ok_or_else(|| {
                    KaitaiError::new(ErrorKind::ExprEvalError {
                        source: String::new(),
                        reason: format!("field `{}` expected a string value", field.id),
                    })
                })?;
                let encoding = field.encoding.clone().unwrap_or_else(|| self.schema.meta.encoding.clone());
                let raw = self.encode_str(text, &encoding)?;
                self.write_field_bytes(field, raw, writer, scope)
            }
            Some(TypeRef::Bytes) => {
                let mut raw = value
                    .as_bytes()
                    .ok_or_else(|| {
                        KaitaiError::new(ErrorKind::ExprEvalError {
                            source: String::new(),
                            reason: format!("field `{}` expected a byte sequence", field.id),
                        })
                    })?
                    .to_vec();
                if let Some(proc_src) = &field.process {
                    let spec = self.build_process(proc_src, scope, writer)?;
                    tracing::trace!(field = %field.id, process = proc_src, len = raw.len(), "unapplying process filter");
                    raw = spec.unapply(&raw)?;
                }
                self.write_field_bytes(field, raw, writer, scope)
            }
            _ => self.write_generic_field(field, value, writer, scope, ancestors),
        }
    }

    fn write_repeated(
        &self,
        field: &Field,
        value: &Value,
        writer: &mut Writer,
        scope: &Rc<Scope<'s>>,
        ancestors: &mut Vec<&'s UserType>,
    ) -> Result<()> {
        let items = value.as_array().ok_or_else(|| {
            KaitaiError::new(ErrorKind::ExprEvalError {
                source: String::new(),
                reason: format!("field `{}` expected an array for `repeat`", field.id),
            })
        })?;
        if field.repeat == Repeat::Expr {
            let src = field.repeat_expr.as_deref().ok_or_else(|| {
                KaitaiError::new(ErrorKind::ExprEvalError {
                    source: String::new(),
                    reason: "`repeat: expr` without `repeat-expr`".to_string(),
                })
            })?;
            let expected = self.eval_size(src, scope, writer)?;
            if expected != items.len() {
                return Err(KaitaiError::new(ErrorKind::RepeatCountMismatch {
                    id: field.id.clone(),
                    expected,
                    got: items.len(),
                }));
            }
        }
        if field.repeat == Repeat::Until && items.is_empty() {
            return Err(KaitaiError::new(ErrorKind::EmptyRepeatUntil { id: field.id.clone() }));
        }
        for item in items {
            self.cancel_check()?;
            self.write_field_once(field, item, writer, scope, ancestors)?;
        }
        Ok(())
    }

    fn write_field(
        &self,
        field: &Field,
        scope: &Rc<Scope<'s>>,
        writer: &mut Writer,
        ancestors: &mut Vec<&'s UserType>,
    ) -> Result<()> {
        self.cancel_check()?;
        let result = (|| -> Result<()> {
            if let Some(if_src) = &field.if_expr {
                if !self.eval_bool(if_src, scope, writer)? {
                    return Ok(());
                }
            }
            if field.contents.is_some() {
                return self.write_field_once(field, &Value::Null, writer, scope, ancestors);
            }
            let value = self.lookup(field, scope)?;
            if field.repeat != Repeat::None {
                self.write_repeated(field, &value, writer, scope, ancestors)
            } else {
                self.write_field_once(field, &value, writer, scope, ancestors)
            }
        })();
        result.map_err(|e| e.with_field(field.id.clone()))
    }

    /// Mirrors [`crate::parser::Parser::run_instances`]: evaluated purely
    /// for side effects (so later field expressions referencing an
    /// instance see a resolved value), never written to the output.
    fn run_instances(&self, ut: &'s UserType, scope: &Rc<Scope<'s>>) -> Result<()> {
        let total = ut.instances.len();
        let mut remaining: Vec<&str> = ut.instances.keys().map(String::as_str).collect();
        let mut pass = 0;
        while !remaining.is_empty() && pass < total + 2 {
            self.cancel_check()?;
            let mut next_remaining = Vec::new();
            let mut progressed = false;
            for name in &remaining {
                if scope.node.borrow().get(name).is_some() {
                    progressed = true;
                    continue;
                }
                let inst = &ut.instances[*name];
                let size = scope.node.borrow().byte_size;
                let io = IoInfo { pos: size, size, eof: true };
                let mut ctx = EvalCtx::new(&**scope, io, Some(size), self.cache);
                match expr::eval::eval_instance_on((**scope).clone(), inst, &mut ctx) {
                    Ok(_) => progressed = true,
                    Err(_) => next_remaining.push(*name),
                }
            }
            if !progressed {
                break;
            }
            remaining = next_remaining;
            pass += 1;
        }
        if !remaining.is_empty() {
            return Err(KaitaiError::new(ErrorKind::UnresolvedInstances {
                names: remaining.iter().map(|s| s.to_string()).collect(),
            }));
        }
        Ok(())
    }

    fn write_type_seq(
        &self,
        ut: &'s UserType,
        scope: &Rc<Scope<'s>>,
        writer: &mut Writer,
        ancestors: &mut Vec<&'s UserType>,
    ) -> Result<()> {
        for field in &ut.seq {
            self.write_field(field, scope, writer, ancestors)?;
        }
        self.run_instances(ut, scope)
    }

    /// Writes a full user type: builds a scope pre-populated from `node`
    /// (the caller-supplied input data for this level), writes every `seq`
    /// field in order, then evaluates instances for their side effects.
    fn write_type_value(
        &self,
        ut: &'s UserType,
        node: &Node,
        writer: &mut Writer,
        parent_scope: Option<&Rc<Scope<'s>>>,
        ancestors: &mut Vec<&'s UserType>,
    ) -> Result<()> {
        self.cancel_check()?;
        tracing::trace!(type_name = %ut.name, depth = ancestors.len(), "entering type");
        self.type_stack.borrow_mut().push(&ut.name, self.progress.get())?;
        ancestors.push(ut);

        let owned_node = Rc::new(RefCell::new(node.clone()));
        let scope = match parent_scope {
            Some(p) => Rc::new(Scope::child(p, owned_node, ut)),
            None => Rc::new(Scope::root_scope(owned_node, ut)),
        };

        let result = self.write_type_seq(ut, &scope, writer, ancestors);

        ancestors.pop();
        self.type_stack.borrow_mut().pop();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use crate::schema::def::{FieldDef, MetaDef, SchemaDef, TypeRefDef};
    use crate::stream::Reader;

    fn field(id: &str, ty: &str) -> FieldDef {
        FieldDef {
            id: id.to_string(),
            type_ref: Some(TypeRefDef::Name(ty.to_string())),
            ..Default::default()
        }
    }

    #[test]
    fn round_trips_simple_record() {
        let def = SchemaDef {
            meta: MetaDef {
                id: "simple".to_string(),
                ..Default::default()
            },
            seq: vec![
                field("magic", "u1"),
                field("length", "u2le"),
                FieldDef {
                    size: Some("length".to_string()),
                    encoding: Some("UTF-8".to_string()),
                    ..field("message", "str")
                },
            ],
            ..Default::default()
        };
        let schema = Schema::compile(&def).unwrap();
        let original = [0x42, 0x05, 0x00, 0x68, 0x65, 0x6C, 0x6C, 0x6F];
        let mut stream = Reader::from_bytes(&original);
        let value = parser::parse(&schema, &mut stream, None).unwrap();
        let written = serialize(&schema, &value, None).unwrap();
        assert_eq!(written, original);
    }

    #[test]
    fn missing_field_is_reported() {
        let def = SchemaDef {
            meta: MetaDef {
                id: "needs_field".to_string(),
                ..Default::default()
            },
            seq: vec![field("a", "u1"), field("b", "u1")],
            ..Default::default()
        };
        let schema = Schema::compile(&def).unwrap();
        let mut node = Node::new("needs_field");
        node.insert("a", Value::unsigned(1, 7));
        let value = Value::Map(node);
        let err = serialize(&schema, &value, None).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MissingField { .. }));
    }

    #[test]
    fn repeat_count_mismatch_is_rejected() {
        let def = SchemaDef {
            meta: MetaDef {
                id: "rep".to_string(),
                ..Default::default()
            },
            seq: vec![
                field("count", "u1"),
                FieldDef {
                    repeat: crate::schema::def::RepeatDef::Expr,
                    repeat_expr: Some("count".to_string()),
                    ..field("numbers", "u1")
                },
            ],
            ..Default::default()
        };
        let schema = Schema::compile(&def).unwrap();
        let mut node = Node::new("rep");
        node.insert("count", Value::unsigned(1, 3));
        node.insert("numbers", Value::Array(vec![Value::unsigned(1, 1), Value::unsigned(1, 2)]));
        let value = Value::Map(node);
        let err = serialize(&schema, &value, None).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::RepeatCountMismatch { .. }));
    }

    #[test]
    fn contents_are_written_regardless_of_input_map() {
        let def = SchemaDef {
            meta: MetaDef {
                id: "magic_only".to_string(),
                ..Default::default()
            },
            seq: vec![FieldDef {
                contents: Some(vec![0x89, b'P', b'N', b'G']),
                ..field("magic", "bytes")
            }],
            ..Default::default()
        };
        let schema = Schema::compile(&def).unwrap();
        let node = Node::new("magic_only");
        let value = Value::Map(node);
        let written = serialize(&schema, &value, None).unwrap();
        assert_eq!(written, vec![0x89, b'P', b'N', b'G']);
    }
}
