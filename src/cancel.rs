//! Cooperative cancellation, checked at well-defined points during parse and serialize.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{ErrorKind, KaitaiError};

/// A caller-held handle that can request cancellation of an in-flight parse
/// or serialize. Cloning shares the same underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` if cancellation has been requested. Called
    /// before each field, each repeat iteration, each recursive type entry,
    /// and each process-filter invocation.
    pub fn check(&self) -> Result<(), KaitaiError> {
        if self.is_cancelled() {
            tracing::debug!("cancellation observed");
            Err(KaitaiError::new(ErrorKind::Cancelled))
        } else {
            Ok(())
        }
    }
}

/// Checks an optional token; a `None` token never cancels.
pub fn check_cancelled(token: Option<&CancellationToken>) -> Result<(), KaitaiError> {
    match token {
        Some(t) => t.check(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancels_after_request() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.check().is_err());
    }

    #[test]
    fn clone_shares_flag() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
