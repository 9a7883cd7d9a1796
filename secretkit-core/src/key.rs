//! Derived encryption key material.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// An opaque key derived by a plugin from an authentication code and the
/// process salt.
///
/// Never persisted by the core; lives in the key cache only while the
/// protected item is logically unlocked.
///
/// # Security
///
/// - Zeroized on drop.
/// - `Debug` output is redacted.
/// - Cloning is explicit; keys are moved into and out of the cache rather
///   than shared.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey(Vec<u8>);

impl DerivedKey {
    /// Wraps raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes. Treat as sensitive material.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the key length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the key is empty (no key material).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// An empty placeholder key, used where the plugin tracks its own
    /// unlock state and no key needs to cross the boundary.
    #[must_use]
    pub fn none() -> Self {
        Self(Vec::new())
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
