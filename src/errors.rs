//! Error taxonomy for parsing, serializing, and evaluating KSY schemas.
//!
//! Every [`KaitaiError`] carries a breadcrumb: the chain of field ids from
//! the root of the value tree down to the field where the failure occurred.
//! The breadcrumb is built up incrementally as the error propagates back
//! through [`crate::parser`] and [`crate::serializer`] via
//! [`KaitaiError::with_field`].

use std::fmt;

/// The chain of field ids from the root to the failure site, root first.
pub type Breadcrumb = Vec<String>;

/// The specific failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    #[error("unexpected end of stream reading field `{field}`")]
    UnexpectedEof { field: String },

    #[error("unknown type `{name}`")]
    UnknownType { name: String },

    #[error("circular type dependency: {}", cycle.join(" -> "))]
    CircularTypeDependency { cycle: Vec<String> },

    #[error("switch on `{switch_on}` has no case for value `{value}` and no default")]
    NoCase { switch_on: String, value: String },

    #[error("failed to compile expression `{source}`: {reason}")]
    ExprCompileError { source: String, reason: String },

    #[error("failed to evaluate expression `{source}`: {reason}")]
    ExprEvalError { source: String, reason: String },

    #[error("expression produced an out-of-range result")]
    ExprRangeError,

    #[error("instance evaluation cycle: {}", names.join(" -> "))]
    InstanceCycle { names: Vec<String> },

    #[error("could not resolve instances (missing or cyclic): {}", names.join(", "))]
    UnresolvedInstances { names: Vec<String> },

    #[error("content mismatch on field `{field}`: expected {expected:?}, got {actual:?}")]
    ContentValidationFailed {
        field: String,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },

    #[error("validation failed on field `{field}`: {reason}")]
    ValidationFailed { field: String, reason: String },

    #[error("process filter `{name}` failed: {reason}")]
    ProcessError { name: String, reason: String },

    #[error("encoding error ({direction}) with encoding `{encoding}`")]
    EncodingError {
        encoding: String,
        direction: EncodingDirection,
    },

    #[error("missing required field `{id}`")]
    MissingField { id: String },

    #[error("repeat count mismatch on `{id}`: expected {expected}, got {got}")]
    RepeatCountMismatch {
        id: String,
        expected: usize,
        got: usize,
    },

    #[error("`repeat: until` on `{id}` produced zero items")]
    EmptyRepeatUntil { id: String },

    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingDirection {
    Decode,
    Encode,
}

impl fmt::Display for EncodingDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingDirection::Decode => write!(f, "decode"),
            EncodingDirection::Encode => write!(f, "encode"),
        }
    }
}

/// A [`ErrorKind`] plus the breadcrumb of field ids leading to it, and,
/// where practical, the byte offset in the root stream.
#[derive(Debug, Clone, PartialEq)]
pub struct KaitaiError {
    pub kind: ErrorKind,
    pub path: Breadcrumb,
    pub position: Option<u64>,
}

impl KaitaiError {
    pub fn new(kind: ErrorKind) -> Self {
        KaitaiError {
            kind,
            path: Vec::new(),
            position: None,
        }
    }

    pub fn at_position(mut self, pos: u64) -> Self {
        self.position = Some(pos);
        self
    }

    /// Prepends a field id to the breadcrumb as the error propagates upward.
    pub fn with_field(mut self, id: impl Into<String>) -> Self {
        self.path.insert(0, id.into());
        self
    }
}

impl From<ErrorKind> for KaitaiError {
    fn from(kind: ErrorKind) -> Self {
        KaitaiError::new(kind)
    }
}

impl fmt::Display for KaitaiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{} (at {})", self.kind, self.path.join("."))
        }?;
        if let Some(pos) = self.position {
            write!(f, " [offset {pos}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for KaitaiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

pub type Result<T> = std::result::Result<T, KaitaiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breadcrumb_accumulates_root_first() {
        let err = KaitaiError::new(ErrorKind::UnexpectedEof {
            field: "len".to_string(),
        })
        .with_field("inner")
        .with_field("outer");

        assert_eq!(err.path, vec!["outer".to_string(), "inner".to_string()]);
    }

    #[test]
    fn display_includes_path_and_position() {
        let err = KaitaiError::new(ErrorKind::Cancelled)
            .with_field("foo")
            .at_position(12);
        let msg = err.to_string();
        assert!(msg.contains("foo"));
        assert!(msg.contains("12"));
    }
}
