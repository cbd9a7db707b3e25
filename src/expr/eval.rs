//! Tree-walking evaluator. Takes an [`Expr`] and an [`EvalCtx`] (current
//! scope, `_io` snapshot, `_sizeof`, the `_` loop binding, and the
//! instance-cycle guard) and produces a [`Value`].

use super::ast::{BinOp, Expr, UnOp};
use super::cache::ExprCache;
use super::scope::Scope;
use crate::errors::{ErrorKind, KaitaiError, Result};
use crate::schema::Instance;
use crate::value::Value;

/// A read-only snapshot of the active stream's position, exposed to
/// expressions as `_io.pos` / `_io.size` / `_io.eof`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoInfo {
    pub pos: u64,
    pub size: u64,
    pub eof: bool,
}

pub struct EvalCtx<'a, 'b> {
    pub scope: &'b Scope<'a>,
    pub io: IoInfo,
    pub sizeof: Option<u64>,
    pub loop_var: Option<Value>,
    pub active_instances: Vec<String>,
    pub cache: &'b ExprCache,
}

impl<'a, 'b> EvalCtx<'a, 'b> {
    pub fn new(scope: &'b Scope<'a>, io: IoInfo, sizeof: Option<u64>, cache: &'b ExprCache) -> Self {
        EvalCtx {
            scope,
            io,
            sizeof,
            loop_var: None,
            active_instances: Vec::new(),
            cache,
        }
    }

    pub fn with_loop_var(mut self, v: Value) -> Self {
        self.loop_var = Some(v);
        self
    }
}

fn eval_err(reason: impl Into<String>) -> KaitaiError {
    KaitaiError::new(ErrorKind::ExprEvalError {
        source: String::new(),
        reason: reason.into(),
    })
}

fn int_result(v: i64) -> Value {
    Value::SInt { width: 8, val: v }
}

pub fn eval(expr: &Expr, ctx: &mut EvalCtx) -> Result<Value> {
    match expr {
        Expr::Int(v) => Ok(int_result(*v)),
        Expr::Float(v) => Ok(Value::Float { width: 8, val: *v }),
        Expr::Str(s) => Ok(Value::Str {
            encoding: "UTF-8".to_string(),
            val: s.clone(),
        }),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Array(items) => {
            let vals: Vec<Value> = items.iter().map(|e| eval(e, ctx)).collect::<Result<_>>()?;
            if !vals.is_empty()
                && vals
                    .iter()
                    .all(|v| matches!(v.as_i64(), Some(n) if (0..=255).contains(&n)))
            {
                Ok(Value::Bytes(vals.iter().map(|v| v.as_i64().unwrap() as u8).collect()))
            } else {
                Ok(Value::Array(vals))
            }
        }
        Expr::Ident(name) => eval_ident(name, ctx),
        Expr::Member(recv, field) => {
            if is_io_ident(recv) {
                return eval_io_member(field, ctx.io);
            }
            let recv_val = eval(recv, ctx)?;
            eval_member(&recv_val, field)
        }
        Expr::Call(recv, name, args) => {
            if is_io_ident(recv) {
                return Err(eval_err(format!("`_io` has no method `{name}`")));
            }
            let recv_val = eval(recv, ctx)?;
            eval_call(&recv_val, name, args, ctx)
        }
        Expr::Index(recv, idx) => {
            let recv_val = eval(recv, ctx)?;
            let idx_val = eval(idx, ctx)?;
            eval_index(&recv_val, &idx_val)
        }
        Expr::Unary(op, inner) => {
            let v = eval(inner, ctx)?;
            eval_unary(*op, &v)
        }
        Expr::Binary(BinOp::And, l, r) => {
            let lv = eval(l, ctx)?;
            if !lv.truthy() {
                Ok(Value::Bool(false))
            } else {
                let rv = eval(r, ctx)?;
                Ok(Value::Bool(rv.truthy()))
            }
        }
        Expr::Binary(BinOp::Or, l, r) => {
            let lv = eval(l, ctx)?;
            if lv.truthy() {
                Ok(Value::Bool(true))
            } else {
                let rv = eval(r, ctx)?;
                Ok(Value::Bool(rv.truthy()))
            }
        }
        Expr::Binary(op, l, r) => {
            let lv = eval(l, ctx)?;
            let rv = eval(r, ctx)?;
            eval_binary(*op, &lv, &rv)
        }
        Expr::Ternary(cond, then_e, else_e) => {
            let cv = eval(cond, ctx)?;
            if cv.truthy() {
                eval(then_e, ctx)
            } else {
                eval(else_e, ctx)
            }
        }
    }
}

fn is_io_ident(expr: &Expr) -> bool {
    matches!(expr, Expr::Ident(n) if n == "_io")
}

fn eval_io_member(field: &str, io: IoInfo) -> Result<Value> {
    match field {
        "pos" => Ok(Value::unsigned(8, io.pos)),
        "size" => Ok(Value::unsigned(8, io.size)),
        "eof" => Ok(Value::Bool(io.eof)),
        other => Err(eval_err(format!("`_io` has no property `{other}`"))),
    }
}

fn eval_ident(name: &str, ctx: &mut EvalCtx) -> Result<Value> {
    match name {
        "_parent" => match &ctx.scope.parent {
            Some(p) => Ok(Value::Map(p.node.borrow().clone())),
            None => Err(eval_err("`_parent` is unavailable at the root type")),
        },
        "_root" => Ok(Value::Map(ctx.scope.root.borrow().clone())),
        "_sizeof" => match ctx.sizeof {
            Some(n) => Ok(Value::unsigned(8, n)),
            None => Err(eval_err("`_sizeof` is unavailable in this context")),
        },
        "_" => ctx
            .loop_var
            .clone()
            .ok_or_else(|| eval_err("`_` is unavailable outside repeat-until")),
        "_io" => Err(eval_err("`_io` must be used via `.pos`, `.size`, or `.eof`")),
        _ => resolve_chain(name, ctx),
    }
}

fn resolve_chain(name: &str, ctx: &mut EvalCtx) -> Result<Value> {
    if let Some(v) = ctx.scope.node.borrow().get(name) {
        return Ok(v.clone());
    }
    if let Some(inst) = ctx.scope.user_type.instances.get(name).cloned() {
        return eval_instance_on(ctx.scope.clone(), &inst, ctx);
    }
    let mut cur = ctx.scope.parent.clone();
    while let Some(s) = cur {
        if let Some(v) = s.node.borrow().get(name) {
            return Ok(v.clone());
        }
        if let Some(inst) = s.user_type.instances.get(name).cloned() {
            return eval_instance_on((*s).clone(), &inst, ctx);
        }
        cur = s.parent.clone();
    }
    Err(eval_err(format!("undefined name `{name}`")))
}

/// Evaluates `inst` against `owner_scope` (the scope of the type that
/// declares it), memoizing the result into that scope's node. Used both for
/// on-demand lookups from [`resolve_chain`] and for the parser/serializer's
/// eager post-seq instance pass.
pub(crate) fn eval_instance_on(owner_scope: Scope<'_>, inst: &Instance, ctx: &mut EvalCtx) -> Result<Value> {
    if ctx.active_instances.iter().any(|n| n == &inst.id) {
        let mut names = ctx.active_instances.clone();
        names.push(inst.id.clone());
        return Err(KaitaiError::new(ErrorKind::InstanceCycle { names }));
    }
    let value_ast = ctx.cache.compile(&inst.value)?;
    let if_ast = match &inst.if_expr {
        Some(src) => Some(ctx.cache.compile(src)?),
        None => None,
    };
    let size = owner_scope.node.borrow().byte_size;
    let saved_guard = std::mem::take(&mut ctx.active_instances);
    let mut guard = saved_guard;
    guard.push(inst.id.clone());
    let mut sub = EvalCtx {
        scope: &owner_scope,
        io: IoInfo {
            pos: size,
            size,
            eof: true,
        },
        sizeof: Some(size),
        loop_var: None,
        active_instances: guard,
        cache: ctx.cache,
    };
    let result = (|| -> Result<Value> {
        if let Some(if_ast) = &if_ast {
            if !eval(if_ast, &mut sub)?.truthy() {
                return Ok(Value::Null);
            }
        }
        eval(&value_ast, &mut sub)
    })();
    let mut guard = sub.active_instances;
    guard.pop();
    ctx.active_instances = guard;
    let result = result?;
    owner_scope.node.borrow_mut().insert(inst.id.clone(), result.clone());
    Ok(result)
}

fn eval_unary(op: UnOp, v: &Value) -> Result<Value> {
    match op {
        UnOp::Neg => match v {
            Value::Float { val, .. } => Ok(Value::Float { width: 8, val: -val }),
            other => Ok(int_result(-other.as_i64().ok_or_else(|| eval_err("`-` on non-numeric value"))?)),
        },
        UnOp::Not => Ok(Value::Bool(!v.truthy())),
        UnOp::BitNot => Ok(int_result(!v.as_i64().ok_or_else(|| eval_err("`~` on non-integer value"))?)),
    }
}

fn bytes_like(v: &Value) -> Option<Vec<u8>> {
    match v {
        Value::Bytes(b) => Some(b.clone()),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for i in items {
                let n = i.as_i64()?;
                if !(0..=255).contains(&n) {
                    return None;
                }
                out.push(n as u8);
            }
            Some(out)
        }
        _ => None,
    }
}

fn floor_div(a: i64, b: i64) -> Result<i64> {
    if b == 0 {
        return Err(eval_err("division by zero"));
    }
    let q = a / b;
    let r = a % b;
    Ok(if r != 0 && (r < 0) != (b < 0) { q - 1 } else { q })
}

fn floor_mod(a: i64, b: i64) -> Result<i64> {
    if b == 0 {
        return Err(eval_err("modulus by zero"));
    }
    let r = a % b;
    Ok(if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
}

fn eval_binary(op: BinOp, l: &Value, r: &Value) -> Result<Value> {
    use BinOp::*;
    match op {
        Eq | Ne | Lt | Le | Gt | Ge => return eval_compare(op, l, r),
        _ => {}
    }
    match op {
        Add | Sub | Mul | Div | Mod => {
            if matches!(l, Value::Float { .. }) || matches!(r, Value::Float { .. }) {
                let a = l.as_f64().ok_or_else(|| eval_err("arithmetic on non-numeric value"))?;
                let b = r.as_f64().ok_or_else(|| eval_err("arithmetic on non-numeric value"))?;
                let v = match op {
                    Add => a + b,
                    Sub => a - b,
                    Mul => a * b,
                    Div => a / b,
                    Mod => a % b,
                    _ => unreachable!(),
                };
                return Ok(Value::Float { width: 8, val: v });
            }
            let a = l.as_i64().ok_or_else(|| eval_err("arithmetic on non-numeric value"))?;
            let b = r.as_i64().ok_or_else(|| eval_err("arithmetic on non-numeric value"))?;
            let v = match op {
                Add => a.checked_add(b).ok_or_else(|| eval_err("integer overflow"))?,
                Sub => a.checked_sub(b).ok_or_else(|| eval_err("integer overflow"))?,
                Mul => a.checked_mul(b).ok_or_else(|| eval_err("integer overflow"))?,
                Div => floor_div(a, b)?,
                Mod => floor_mod(a, b)?,
                _ => unreachable!(),
            };
            Ok(int_result(v))
        }
        BitAnd | BitOr | BitXor => {
            let a = l.as_i64().ok_or_else(|| eval_err("bitwise op on non-integer value"))?;
            let b = r.as_i64().ok_or_else(|| eval_err("bitwise op on non-integer value"))?;
            Ok(int_result(match op {
                BitAnd => a & b,
                BitOr => a | b,
                BitXor => a ^ b,
                _ => unreachable!(),
            }))
        }
        Shl => {
            let a = l.as_i64().ok_or_else(|| eval_err("`<<` on non-integer value"))?;
            let n = (r.as_i64().ok_or_else(|| eval_err("`<<` shift amount not integer"))? as u32) % 64;
            Ok(int_result(a.wrapping_shl(n)))
        }
        Shr => {
            let n = (r.as_i64().ok_or_else(|| eval_err("`>>` shift amount not integer"))? as u32) % 64;
            match l {
                Value::UInt { val, .. } => Ok(Value::unsigned(8, val >> n)),
                other => {
                    let a = other.as_i64().ok_or_else(|| eval_err("`>>` on non-integer value"))?;
                    Ok(int_result(a.wrapping_shr(n)))
                }
            }
        }
        And | Or => unreachable!("short-circuit ops handled in eval()"),
        Eq | Ne | Lt | Le | Gt | Ge => unreachable!("handled above"),
    }
}

fn eval_compare(op: BinOp, l: &Value, r: &Value) -> Result<Value> {
    use BinOp::*;
    let ordering = if let (Some(a), Some(b)) = (bytes_like(l), bytes_like(r)) {
        a.cmp(&b)
    } else if let (Value::Str { val: a, .. }, Value::Str { val: b, .. }) = (l, r) {
        a.cmp(b)
    } else if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        a.partial_cmp(&b).ok_or_else(|| eval_err("NaN comparison"))?
    } else if let (Value::Bool(a), Value::Bool(b)) = (l, r) {
        a.cmp(b)
    } else {
        return Err(eval_err("incomparable operand types"));
    };
    let result = match op {
        Eq => ordering == std::cmp::Ordering::Equal,
        Ne => ordering != std::cmp::Ordering::Equal,
        Lt => ordering == std::cmp::Ordering::Less,
        Le => ordering != std::cmp::Ordering::Greater,
        Gt => ordering == std::cmp::Ordering::Greater,
        Ge => ordering != std::cmp::Ordering::Less,
        _ => unreachable!(),
    };
    Ok(Value::Bool(result))
}

fn length_of(v: &Value) -> Result<Value> {
    match v {
        Value::Bytes(b) => Ok(int_result(b.len() as i64)),
        Value::Array(a) => Ok(int_result(a.len() as i64)),
        Value::Str { val, .. } => Ok(int_result(val.chars().count() as i64)),
        _ => Err(eval_err("`length`/`size` not supported on this value")),
    }
}

fn eval_member(recv: &Value, field: &str) -> Result<Value> {
    match field {
        "length" | "size" => length_of(recv),
        "first" => array_edge(recv, true),
        "last" => array_edge(recv, false),
        "min" => array_extreme(recv, true),
        "max" => array_extreme(recv, false),
        "reverse" => reverse_value(recv),
        "to_i" => to_i(recv, None),
        other => match recv {
            Value::Map(node) => node
                .get(other)
                .cloned()
                .ok_or_else(|| eval_err(format!("no field `{other}`"))),
            _ => Err(eval_err(format!("no property `{other}` on this value"))),
        },
    }
}

fn array_edge(v: &Value, first: bool) -> Result<Value> {
    match v {
        Value::Array(items) => (if first { items.first() } else { items.last() })
            .cloned()
            .ok_or_else(|| eval_err("empty array")),
        Value::Bytes(b) => (if first { b.first() } else { b.last() })
            .map(|&x| Value::unsigned(1, x as u64))
            .ok_or_else(|| eval_err("empty array")),
        _ => Err(eval_err("`first`/`last` require an array")),
    }
}

fn array_extreme(v: &Value, min: bool) -> Result<Value> {
    let items: Vec<Value> = match v {
        Value::Array(items) => items.clone(),
        Value::Bytes(b) => b.iter().map(|&x| Value::unsigned(1, x as u64)).collect(),
        _ => return Err(eval_err("`min`/`max` require an array")),
    };
    if items.is_empty() {
        return Err(eval_err("empty array"));
    }
    let mut best = items[0].clone();
    for item in items.into_iter().skip(1) {
        let better = if min {
            item.as_f64() < best.as_f64()
        } else {
            item.as_f64() > best.as_f64()
        };
        if better {
            best = item;
        }
    }
    Ok(best)
}

fn reverse_value(v: &Value) -> Result<Value> {
    match v {
        Value::Str { encoding, val } => Ok(Value::Str {
            encoding: encoding.clone(),
            val: val.chars().rev().collect(),
        }),
        Value::Bytes(b) => Ok(Value::Bytes(b.iter().rev().copied().collect())),
        Value::Array(items) => Ok(Value::Array(items.iter().rev().cloned().collect())),
        _ => Err(eval_err("`reverse` not supported on this value")),
    }
}

fn to_i(v: &Value, base: Option<i64>) -> Result<Value> {
    let text = match v {
        Value::Str { val, .. } => val.as_str(),
        _ => return Err(eval_err("`to_i` requires a string")),
    };
    let radix = base.unwrap_or(10) as u32;
    let (neg, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let mag = i64::from_str_radix(digits, radix).map_err(|_| eval_err("`to_i`: not a valid number"))?;
    Ok(int_result(if neg { -mag } else { mag }))
}

fn eval_index(recv: &Value, idx: &Value) -> Result<Value> {
    let i = idx.as_i64().ok_or_else(|| eval_err("index is not an integer"))?;
    match recv {
        Value::Array(items) => {
            let idx = usize::try_from(i).map_err(|_| KaitaiError::new(ErrorKind::ExprRangeError))?;
            items
                .get(idx)
                .cloned()
                .ok_or_else(|| KaitaiError::new(ErrorKind::ExprRangeError))
        }
        Value::Bytes(b) => {
            let idx = usize::try_from(i).map_err(|_| KaitaiError::new(ErrorKind::ExprRangeError))?;
            b.get(idx)
                .map(|&x| Value::unsigned(1, x as u64))
                .ok_or_else(|| KaitaiError::new(ErrorKind::ExprRangeError))
        }
        _ => Err(eval_err("indexing requires an array")),
    }
}

fn eval_call(recv: &Value, name: &str, args: &[Expr], ctx: &mut EvalCtx) -> Result<Value> {
    match name {
        "substring" => {
            if args.len() != 2 {
                return Err(eval_err("`substring` takes exactly 2 arguments"));
            }
            let a = eval(&args[0], ctx)?.as_i64().ok_or_else(|| eval_err("`substring` bounds must be integers"))?;
            let b = eval(&args[1], ctx)?.as_i64().ok_or_else(|| eval_err("`substring` bounds must be integers"))?;
            let Value::Str { encoding, val } = recv else {
                return Err(eval_err("`substring` requires a string"));
            };
            let chars: Vec<char> = val.chars().collect();
            if a < 0 || b < a || b as usize > chars.len() {
                return Err(KaitaiError::new(ErrorKind::ExprRangeError));
            }
            let s: String = chars[a as usize..b as usize].iter().collect();
            Ok(Value::Str {
                encoding: encoding.clone(),
                val: s,
            })
        }
        "to_i" => {
            if args.len() > 1 {
                return Err(eval_err("`to_i` takes at most one argument"));
            }
            let base = match args.first() {
                Some(e) => Some(eval(e, ctx)?.as_i64().ok_or_else(|| eval_err("`to_i` base must be an integer"))?),
                None => None,
            };
            to_i(recv, base)
        }
        "to_s" => {
            if args.len() != 1 {
                return Err(eval_err("`to_s` takes exactly one argument"));
            }
            let enc_val = eval(&args[0], ctx)?;
            let encoding = enc_val.as_str().ok_or_else(|| eval_err("`to_s` encoding must be a string"))?;
            let bytes = recv.as_bytes().ok_or_else(|| eval_err("`to_s` requires a byte sequence"))?;
            decode_bytes(bytes, encoding)
        }
        other => Err(eval_err(format!("unknown method `{other}`"))),
    }
}

pub fn decode_bytes(bytes: &[u8], encoding: &str) -> Result<Value> {
    let enc = encoding_rs::Encoding::for_label(encoding.as_bytes()).unwrap_or(encoding_rs::UTF_8);
    let (text, _, had_errors) = enc.decode(bytes);
    if had_errors {
        return Err(KaitaiError::new(ErrorKind::EncodingError {
            encoding: encoding.to_string(),
            direction: crate::errors::EncodingDirection::Decode,
        }));
    }
    Ok(Value::Str {
        encoding: encoding.to_string(),
        val: text.into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parser::parse;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn empty_scope<'a>(ut: &'a crate::schema::UserType) -> Scope<'a> {
        Scope::root_scope(Rc::new(RefCell::new(crate::value::Node::new("root"))), ut)
    }

    fn eval_str(src: &str) -> Result<Value> {
        let ut = crate::schema::UserType {
            name: "root".into(),
            seq: vec![],
            types: Default::default(),
            instances: Default::default(),
            params: vec![],
            enums: Default::default(),
        };
        let scope = empty_scope(&ut);
        let cache = ExprCache::new(None);
        let mut ctx = EvalCtx::new(&scope, IoInfo::default(), None, &cache);
        let ast = parse(src).unwrap();
        eval(&ast, &mut ctx)
    }

    #[test]
    fn floored_division_rounds_toward_negative_infinity() {
        assert_eq!(eval_str("-9837 / 13").unwrap(), int_result(-757));
        assert_eq!(eval_str("-9837 % 13").unwrap(), int_result(4));
    }

    #[test]
    fn ternary_is_lazy() {
        // the false branch divides by zero; only picked arm is evaluated
        assert_eq!(eval_str("true ? 1 : (1 / 0)").unwrap(), int_result(1));
    }

    #[test]
    fn array_literal_of_bytes() {
        assert_eq!(eval_str("[1, 2, 255]").unwrap(), Value::Bytes(vec![1, 2, 255]));
    }

    #[test]
    fn array_literal_of_non_bytes() {
        assert_eq!(
            eval_str("[1, 300]").unwrap(),
            Value::Array(vec![int_result(1), int_result(300)])
        );
    }

    #[test]
    fn string_substring_half_open() {
        assert_eq!(
            eval_str(r#""hello".substring(1, 3)"#).unwrap(),
            Value::Str {
                encoding: "UTF-8".into(),
                val: "el".into()
            }
        );
    }

    #[test]
    fn string_length_is_char_count() {
        assert_eq!(eval_str(r#""hello".length"#).unwrap(), int_result(5));
    }

    #[test]
    fn byte_array_lexicographic_compare() {
        assert_eq!(eval_str("[1, 2, 3] < [1, 2, 4]").unwrap(), Value::Bool(true));
    }

    #[test]
    fn to_i_with_base() {
        assert_eq!(eval_str(r#""ff".to_i(16)"#).unwrap(), int_result(255));
    }

    #[test]
    fn bitwise_and_shift() {
        assert_eq!(eval_str("6 & 3").unwrap(), int_result(2));
        assert_eq!(eval_str("1 << 4").unwrap(), int_result(16));
    }
}
