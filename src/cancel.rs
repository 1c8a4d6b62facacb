//! Cooperative cancellation token.
//!
//! Every suspendable operation in this crate (`write_block`, `read_block`,
//! `scan`, checkpoint and hash-chain operations) accepts an optional
//! `&CancelToken`. A cancelled token does not interrupt anything by
//! itself — callers must check it at the documented suspension points —
//! but it gives a caller on another thread a way to ask an in-flight
//! operation to stop at the next safe point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Check `token` (if any) and return `Err(Cancelled)` if it has fired.
pub fn check(token: Option<&CancelToken>) -> crate::error::Result<()> {
    if let Some(t) = token {
        if t.is_cancelled() {
            return Err(crate::error::BlockError::Cancelled);
        }
    }
    Ok(())
}
