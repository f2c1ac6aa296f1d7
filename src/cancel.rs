//! Cooperative cancellation for long table operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, TableError};

/// Shared cancel flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(Canceled)` once `cancel` was called on any clone.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(TableError::Canceled)
        } else {
            Ok(())
        }
    }
}
