//! The Parser Core: a depth-first traversal of a [`Schema`] against a
//! [`Reader`], producing a [`Value`] tree. Mirrors [`crate::serializer`]
//! field-for-field so the two stay in lockstep for round-tripping.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::cancel::{self, CancellationToken};
use crate::errors::{ErrorKind, KaitaiError, Result};
use crate::expr::{self, EvalCtx, ExprCache, IoInfo, Scope};
use crate::process;
use crate::resolve::{self, Resolved, TypeStack};
use crate::schema::{Field, Primitive, Repeat, Schema, TypeRef, UserType};
use crate::stream::Reader;
use crate::validate;
use crate::value::{EnumValue, Node, Value};

/// Parses `stream` against `schema`'s root type, using a throwaway
/// expression cache. Prefer [`parse_with_cache`] when parsing the same
/// schema repeatedly (e.g. concurrently across threads, or one-after-
/// another), so compiled expressions are reused.
pub fn parse(schema: &Schema, stream: &mut Reader, cancel: Option<&CancellationToken>) -> Result<Value> {
    let cache = ExprCache::default();
    parse_with_cache(schema, stream, &cache, cancel)
}

/// As [`parse`], but against a caller-supplied, possibly-shared
/// [`ExprCache`]. The cache is internally synchronized (§5: read-mostly,
/// writes under a lock), so the same cache may back concurrent parses of
/// the same schema on separate streams.
pub fn parse_with_cache<'s>(
    schema: &'s Schema,
    stream: &mut Reader,
    cache: &'s ExprCache,
    cancel: Option<&'s CancellationToken>,
) -> Result<Value> {
    let span = tracing::info_span!("parse", root = %schema.root.name);
    let _enter = span.enter();
    tracing::debug!(start_pos = stream.pos(), "parse start");
    let p = Parser {
        schema,
        cache,
        cancel,
        type_stack: RefCell::new(TypeStack::new()),
        progress: Cell::new(0),
    };
    let mut ancestors: Vec<&'s UserType> = Vec::new();
    let result = p.parse_type_value(&schema.root, stream, None, &mut ancestors);
    match &result {
        Ok(_) => tracing::debug!("parse complete"),
        Err(e) => tracing::debug!(error = %e, "parse failed"),
    }
    result
}

struct Parser<'s> {
    schema: &'s Schema,
    cache: &'s ExprCache,
    cancel: Option<&'s CancellationToken>,
    /// Guards against zero-progress type recursion (§4.4.5). Keyed on
    /// `self.progress`, a monotonic "bits consumed anywhere so far"
    /// counter rather than any one stream's own position, so the check
    /// stays correct across substream boundaries (where a fresh `Reader`
    /// restarts its own `pos()` at zero even though real progress was made
    /// carving it out of the parent).
    type_stack: RefCell<TypeStack>,
    progress: Cell<u64>,
}

impl<'s> Parser<'s> {
    fn cancel_check(&self) -> Result<()> {
        cancel::check_cancelled(self.cancel)
    }

    fn bump(&self, bits: u64) {
        self.progress.set(self.progress.get() + bits);
    }

    fn eval_ctx<'c>(&'c self, scope: &'c Rc<Scope<'s>>, stream: &Reader, sizeof: Option<u64>) -> EvalCtx<'s, 'c> {
        let io = IoInfo {
            pos: stream.pos(),
            size: stream.size(),
            eof: stream.eof(),
        };
        EvalCtx::new(&**scope, io, sizeof, self.cache)
    }

    fn eval_bool(&self, src: &str, scope: &Rc<Scope<'s>>, stream: &Reader) -> Result<bool> {
        let ast = self.cache.compile(src)?;
        let mut ctx = self.eval_ctx(scope, stream, None);
        Ok(expr::eval(&ast, &mut ctx)?.truthy())
    }

    fn eval_size(&self, src: &str, scope: &Rc<Scope<'s>>, stream: &Reader) -> Result<usize> {
        let ast = self.cache.compile(src)?;
        let mut ctx = self.eval_ctx(scope, stream, None);
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

    fn read_bytes(&self, stream: &mut Reader, n: usize) -> Result<Vec<u8>> {
        let bytes = stream.read_bytes(n)?;
        self.bump(bytes.len() as u64 * 8);
        Ok(bytes)
    }

    fn build_process(&self, raw: &str, scope: &Rc<Scope<'s>>, stream: &Reader) -> Result<process::ProcessSpec> {
        self.cancel_check()?;
        process::resolve_spec(raw, |src| {
            let ast = self.cache.compile(src)?;
            let mut ctx = self.eval_ctx(scope, stream, None);
            expr::eval(&ast, &mut ctx)
        })
    }

    /// Reads the raw bytes for a `str`/`strz`/`bytes` field: sized,
    /// size-to-EOS, or terminator-delimited, per spec.md §4.6 step 5/6,
    /// then applies `pad-right` stripping.
    fn read_field_raw_bytes(&self, field: &Field, stream: &mut Reader, scope: &Rc<Scope<'s>>) -> Result<Vec<u8>> {
        let mut bytes = if field.size_eos {
            let b = stream.read_bytes_full()?;
            self.bump(b.len() as u64 * 8);
            b
        } else if let Some(size_src) = &field.size {
            let n = self.eval_size(size_src, scope, stream)?;
            self.read_bytes(stream, n)?
        } else if matches!(field.type_ref, Some(TypeRef::Strz)) {
            let b = stream.read_bytes_until(field.terminator, field.include, true, false)?;
            self.bump(b.len() as u64 * 8 + 8);
            b
        } else {
            let b = stream.read_bytes_until(field.terminator, field.include, field.consume, true)?;
            self.bump(b.len() as u64 * 8);
            b
        };
        if let Some(pad) = field.pad_right {
            while bytes.last() == Some(&pad) {
                bytes.pop();
            }
        }
        Ok(bytes)
    }

    fn read_primitive(&self, p: Primitive, stream: &mut Reader) -> Result<Value> {
        let value = match p {
            Primitive::U(width, endian) => {
                let v = match width {
                    1 => stream.read_u1(endian)? as u64,
                    2 => stream.read_u2(endian)? as u64,
                    4 => stream.read_u4(endian)? as u64,
                    8 => stream.read_u8(endian)?,
                    _ => unreachable!("width validated at schema compile time"),
                };
                self.bump(width as u64 * 8);
                Value::unsigned(width, v)
            }
            Primitive::S(width, endian) => {
                let v = match width {
                    1 => stream.read_s1(endian)? as i64,
                    2 => stream.read_s2(endian)? as i64,
                    4 => stream.read_s4(endian)? as i64,
                    8 => stream.read_s8(endian)?,
                    _ => unreachable!("width validated at schema compile time"),
                };
                self.bump(width as u64 * 8);
                Value::signed(width, v)
            }
            Primitive::F(width, endian) => {
                let v = match width {
                    4 => stream.read_f4(endian)? as f64,
                    8 => stream.read_f8(endian)?,
                    _ => unreachable!("width validated at schema compile time"),
                };
                self.bump(width as u64 * 8);
                Value::float(width, v)
            }
            Primitive::B(width, bit_endian) => {
                let v = stream.read_bits(width as usize, bit_endian)?;
                self.bump(width as u64);
                Value::bit(width, bit_endian, v)
            }
        };
        Ok(value)
    }

    fn resolve_and_parse(
        &self,
        type_ref: &TypeRef,
        stream: &mut Reader,
        scope: &Rc<Scope<'s>>,
        ancestors: &mut Vec<&'s UserType>,
    ) -> Result<Value> {
        let resolved = {
            let mut ctx = self.eval_ctx(scope, stream, None);
            resolve::resolve_type_ref(
                type_ref,
                ancestors.as_slice(),
                self.schema.meta.endian,
                self.schema.meta.bit_endian,
                &mut ctx,
            )?
        };
        match resolved {
            Resolved::Primitive(p) => self.read_primitive(p, stream),
            Resolved::Bytes => {
                let b = stream.read_bytes_full()?;
                self.bump(b.len() as u64 * 8);
                Ok(Value::Bytes(b))
            }
            Resolved::Str => {
                let b = stream.read_bytes_full()?;
                self.bump(b.len() as u64 * 8);
                expr::decode_bytes(&b, &self.schema.meta.encoding)
            }
            Resolved::Strz => {
                let b = stream.read_bytes_until(0, false, true, false)?;
                self.bump(b.len() as u64 * 8 + 8);
                expr::decode_bytes(&b, &self.schema.meta.encoding)
            }
            Resolved::User(ut) => self.parse_type_value(ut, stream, Some(scope), ancestors),
        }
    }

    /// Handles the generic (non-`str`/`strz`/`bytes`) field case: §4.6
    /// step 7 — if `size`/`size_eos`/`process` is present, read into a
    /// buffer, apply processing, and recurse on a substream of the
    /// result; otherwise resolve and parse directly off `stream`.
    fn parse_generic_field(
        &self,
        field: &Field,
        stream: &mut Reader,
        scope: &Rc<Scope<'s>>,
        ancestors: &mut Vec<&'s UserType>,
    ) -> Result<Value> {
        let type_ref = field.type_ref.as_ref().ok_or_else(|| {
            KaitaiError::new(ErrorKind::UnknownType {
                name: "<field has no type>".to_string(),
            })
        })?;
        if field.size.is_some() || field.size_eos || field.process.is_some() {
            let mut raw = if field.size_eos {
                let b = stream.read_bytes_full()?;
                self.bump(b.len() as u64 * 8);
                b
            } else if let Some(size_src) = &field.size {
                let n = self.eval_size(size_src, scope, stream)?;
                self.read_bytes(stream, n)?
            } else {
                return Err(KaitaiError::new(ErrorKind::ProcessError {
                    name: field.process.clone().unwrap_or_default(),
                    reason: "`process` without a declared size or size-eos".to_string(),
                }));
            };
            if let Some(proc_src) = &field.process {
                let spec = self.build_process(proc_src, scope, stream)?;
                tracing::trace!(field = %field.id, process = proc_src, len = raw.len(), "applying process filter");
                raw = spec.apply(&raw)?;
            }
            let mut sub = Reader::from_owned(raw);
            self.resolve_and_parse(type_ref, &mut sub, scope, ancestors)
        } else {
            self.resolve_and_parse(type_ref, stream, scope, ancestors)
        }
    }

    fn apply_enum(&self, field: &Field, value: Value, ancestors: &[&'s UserType]) -> Result<Value> {
        let Some(enum_name) = &field.enum_name else {
            return Ok(value);
        };
        let int_val = value.as_i64().ok_or_else(|| {
            KaitaiError::new(ErrorKind::ExprEvalError {
                source: String::new(),
                reason: format!("field `{}` has `enum` but its value is not an integer", field.id),
            })
        })?;
        let table = resolve::find_enum_table(enum_name, ancestors).ok_or_else(|| {
            KaitaiError::new(ErrorKind::UnknownType {
                name: enum_name.clone(),
            })
        })?;
        let name = table.get(&int_val).cloned();
        Ok(Value::Enum(EnumValue {
            enum_name: enum_name.clone(),
            int_val,
            valid: name.is_some(),
            name,
        }))
    }

    fn apply_valid(&self, field: &Field, value: &Value, scope: &Rc<Scope<'s>>, stream: &Reader) -> Result<()> {
        let Some(valid) = &field.valid else {
            return Ok(());
        };
        let mut ctx = self.eval_ctx(scope, stream, value.byte_width());
        ctx.loop_var = Some(value.clone());
        validate::check_valid(&field.id, valid, value, &mut ctx)
    }

    /// A single read of `field`, ignoring `repeat` (the caller loops when
    /// `repeat` is set). Implements §4.6 `parse_field` steps 4-9.
    fn parse_field_once(
        &self,
        field: &Field,
        stream: &mut Reader,
        scope: &Rc<Scope<'s>>,
        ancestors: &mut Vec<&'s UserType>,
    ) -> Result<Value> {
        let raw = if let Some(expected) = &field.contents {
            let bytes = self.read_bytes(stream, expected.len())?;
            validate::check_contents(&field.id, expected, &bytes)?;
            Value::Bytes(bytes)
        } else {
            match &field.type_ref {
                Some(TypeRef::Str) | Some(TypeRef::Strz) => {
                    let bytes = self.read_field_raw_bytes(field, stream, scope)?;
                    let encoding = field.encoding.clone().unwrap_or_else(|| self.schema.meta.encoding.clone());
                    expr::decode_bytes(&bytes, &encoding)?
                }
                Some(TypeRef::Bytes) => {
                    let mut bytes = self.read_field_raw_bytes(field, stream, scope)?;
                    if let Some(proc_src) = &field.process {
                        let spec = self.build_process(proc_src, scope, stream)?;
                        tracing::trace!(field = %field.id, process = proc_src, len = bytes.len(), "applying process filter");
                        bytes = spec.apply(&bytes)?;
                    }
                    Value::Bytes(bytes)
                }
                _ => self.parse_generic_field(field, stream, scope, ancestors)?,
            }
        };
        let tagged = self.apply_enum(field, raw, ancestors.as_slice())?;
        self.apply_valid(field, &tagged, scope, stream)?;
        Ok(tagged)
    }

    fn parse_repeated(
        &self,
        field: &Field,
        stream: &mut Reader,
        scope: &Rc<Scope<'s>>,
        ancestors: &mut Vec<&'s UserType>,
    ) -> Result<Value> {
        match field.repeat {
            Repeat::Expr => {
                let src = field.repeat_expr.as_deref().ok_or_else(|| {
                    KaitaiError::new(ErrorKind::ExprEvalError {
                        source: String::new(),
                        reason: "`repeat: expr` without `repeat-expr`".to_string(),
                    })
                })?;
                let count = self.eval_size(src, scope, stream)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    self.cancel_check()?;
                    items.push(self.parse_field_once(field, stream, scope, ancestors)?);
                }
                Ok(Value::Array(items))
            }
            Repeat::Eos => {
                let mut items = Vec::new();
                loop {
                    self.cancel_check()?;
                    if stream.eof() {
                        break;
                    }
                    items.push(self.parse_field_once(field, stream, scope, ancestors)?);
                }
                Ok(Value::Array(items))
            }
            Repeat::Until => {
                let src = field.repeat_until.as_deref().ok_or_else(|| {
                    KaitaiError::new(ErrorKind::ExprEvalError {
                        source: String::new(),
                        reason: "`repeat: until` without `repeat-until`".to_string(),
                    })
                })?;
                let ast = self.cache.compile(src)?;
                let mut items = Vec::new();
                loop {
                    self.cancel_check()?;
                    let item = self.parse_field_once(field, stream, scope, ancestors)?;
                    let mut ctx = self.eval_ctx(scope, stream, None).with_loop_var(item.clone());
                    let done = expr::eval(&ast, &mut ctx)?.truthy();
                    items.push(item);
                    if done {
                        break;
                    }
                }
                if items.is_empty() {
                    return Err(KaitaiError::new(ErrorKind::EmptyRepeatUntil { id: field.id.clone() }));
                }
                Ok(Value::Array(items))
            }
            Repeat::None => unreachable!("caller only delegates here when repeat is set"),
        }
    }

    fn parse_field(
        &self,
        field: &Field,
        stream: &mut Reader,
        scope: &Rc<Scope<'s>>,
        ancestors: &mut Vec<&'s UserType>,
    ) -> Result<Option<Value>> {
        self.cancel_check()?;
        let result = (|| -> Result<Option<Value>> {
            if let Some(if_src) = &field.if_expr {
                if !self.eval_bool(if_src, scope, stream)? {
                    return Ok(None);
                }
            }
            let value = if field.repeat != Repeat::None {
                self.parse_repeated(field, stream, scope, ancestors)?
            } else {
                self.parse_field_once(field, stream, scope, ancestors)?
            };
            Ok(Some(value))
        })();
        result.map_err(|e| e.with_field(field.id.clone()))
    }

    /// Iterative multi-pass evaluation of `ut`'s declared instances (§4.7).
    /// Instances already memoized (by an on-demand lookup while parsing the
    /// seq) are skipped. Gives up after `n+2` passes if any remain
    /// unresolved, where `n` is the instance count.
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
                let io = IoInfo {
                    pos: scope.node.borrow().byte_size,
                    size: scope.node.borrow().byte_size,
                    eof: true,
                };
                let mut ctx = EvalCtx::new(&**scope, io, Some(scope.node.borrow().byte_size), self.cache);
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

    /// Parses a full user type (including the schema root): pushes the
    /// type-stack cycle guard, builds a fresh scope chained off
    /// `parent_scope`, reads every `seq` field, then evaluates instances.
    fn parse_type_value(
        &self,
        ut: &'s UserType,
        stream: &mut Reader,
        parent_scope: Option<&Rc<Scope<'s>>>,
        ancestors: &mut Vec<&'s UserType>,
    ) -> Result<Value> {
        self.cancel_check()?;
        tracing::trace!(type_name = %ut.name, depth = ancestors.len(), pos = stream.pos(), "entering type");
        self.type_stack.borrow_mut().push(&ut.name, self.progress.get())?;
        ancestors.push(ut);

        let start_pos = stream.pos();
        let node = Rc::new(RefCell::new(Node::new(ut.name.clone())));
        node.borrow_mut().byte_offset_start = start_pos;
        let scope = match parent_scope {
            Some(p) => Rc::new(Scope::child(p, node.clone(), ut)),
            None => Rc::new(Scope::root_scope(node.clone(), ut)),
        };

        let result = self.parse_type_seq(ut, stream, &node, &scope, ancestors, start_pos);

        ancestors.pop();
        self.type_stack.borrow_mut().pop();
        result?;
        Ok(Value::Map(node.borrow().clone()))
    }

    /// The fallible body of [`Self::parse_type_value`], split out so the
    /// type-stack/ancestors cleanup above always runs regardless of outcome.
    fn parse_type_seq(
        &self,
        ut: &'s UserType,
        stream: &mut Reader,
        node: &Rc<RefCell<Node>>,
        scope: &Rc<Scope<'s>>,
        ancestors: &mut Vec<&'s UserType>,
        start_pos: u64,
    ) -> Result<()> {
        for field in &ut.seq {
            if let Some(value) = self.parse_field(field, stream, scope, ancestors)? {
                node.borrow_mut().insert(field.id.clone(), value);
            }
        }
        node.borrow_mut().byte_size = stream.pos() - start_pos;
        self.run_instances(ut, scope)
    }
}
