//! Per-collection exclusion for structural operations.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{SecretsError, SecretsResult};

/// Registry of collections currently undergoing a structural operation
/// (create, delete, generate-stored-key).
///
/// Acquiring a name yields a single-owner [`InterleaveToken`]; holding
/// the token is required for the structural operation, and an attempt to
/// acquire a held name fails immediately with the transient
/// `InterleavedRequest` error so the caller may retry.
#[derive(Default)]
pub(crate) struct InterleaveGuard {
    busy: Arc<Mutex<HashSet<String>>>,
}

impl InterleaveGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires exclusive structural access to a collection name.
    pub fn try_acquire(&self, collection_name: &str) -> SecretsResult<InterleaveToken> {
        let mut busy = self.busy.lock();
        if !busy.insert(collection_name.to_string()) {
            return Err(interleaved_request_error(collection_name));
        }
        Ok(InterleaveToken {
            busy: Arc::clone(&self.busy),
            collection_name: collection_name.to_string(),
        })
    }

    /// True while a structural operation holds the name.
    pub fn is_busy(&self, collection_name: &str) -> bool {
        self.busy.lock().contains(collection_name)
    }

    /// Fails with the transient error if the name is held.
    pub fn ensure_not_busy(&self, collection_name: &str) -> SecretsResult<()> {
        if self.is_busy(collection_name) {
            return Err(interleaved_request_error(collection_name));
        }
        Ok(())
    }
}

fn interleaved_request_error(collection_name: &str) -> SecretsError {
    SecretsError::InterleavedRequest(format!(
        "collection {collection_name} is busy with another structural operation, try again"
    ))
}

/// Single-owner token for a guarded collection name; releases on drop.
pub(crate) struct InterleaveToken {
    busy: Arc<Mutex<HashSet<String>>>,
    collection_name: String,
}

impl Drop for InterleaveToken {
    fn drop(&mut self) {
        self.busy.lock().remove(&self.collection_name);
    }
}
