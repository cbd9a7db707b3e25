//! The expression sublanguage used throughout KSY schemas: field sizes,
//! `if` conditions, `repeat-expr`/`repeat-until`, `switch-on`, and instance
//! `value`s are all one of these expressions, evaluated against the value
//! tree built so far.

pub mod ast;
pub mod cache;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod scope;

pub use ast::Expr;
pub use cache::ExprCache;
pub use eval::{decode_bytes, eval, EvalCtx, IoInfo};
pub use parser::parse;
pub use scope::Scope;
