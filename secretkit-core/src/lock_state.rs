//! Process-wide lock key material.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::{SecretsError, SecretsResult};
use crate::key::DerivedKey;

const BKDB_KEY_LABEL: &[u8] = b"secretkit:bookkeeping-lock-key";
const DEVICE_KEY_LABEL: &[u8] = b"secretkit:device-lock-key";

/// The well-known sentinel installed by `forget_lock_code`; key material
/// derived from it never matches a user-chosen code.
pub const FORGOTTEN_LOCK_CODE: &[u8; 64] =
    b"ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

/// Process-wide lock state: the bookkeeping database lock key, the device
/// lock key, and the flag recording whether the database opened with an
/// empty code at boot.
///
/// Both keys are derived from the master lock code and the process salt
/// under distinct labels, so neither can be computed from the other.
pub struct LockState {
    salt: Vec<u8>,
    bkdb_lock_key: DerivedKey,
    device_lock_key: DerivedKey,
    no_lock_code: bool,
}

impl LockState {
    /// Creates lock state over the given process salt, with key material
    /// initialised from the empty lock code.
    pub fn new(salt: Vec<u8>) -> SecretsResult<Self> {
        let mut state = Self {
            salt,
            bkdb_lock_key: DerivedKey::none(),
            device_lock_key: DerivedKey::none(),
            no_lock_code: false,
        };
        state.initialise(b"")?;
        Ok(state)
    }

    /// Re-derives both lock keys from `lock_code` and the process salt.
    pub fn initialise(&mut self, lock_code: &[u8]) -> SecretsResult<()> {
        self.bkdb_lock_key = derive(lock_code, &self.salt, BKDB_KEY_LABEL)?;
        self.device_lock_key = derive(lock_code, &self.salt, DEVICE_KEY_LABEL)?;
        Ok(())
    }

    /// Tests a candidate lock code against the current key material.
    #[must_use]
    pub fn test_lock_code(&self, lock_code: &[u8]) -> bool {
        match derive(lock_code, &self.salt, BKDB_KEY_LABEL) {
            Ok(candidate) => candidate == self.bkdb_lock_key,
            Err(_) => false,
        }
    }

    /// The key protecting the bookkeeping database.
    #[must_use]
    pub fn bkdb_lock_key(&self) -> &DerivedKey {
        &self.bkdb_lock_key
    }

    /// The key protecting device-locked collections and secrets.
    #[must_use]
    pub fn device_lock_key(&self) -> &DerivedKey {
        &self.device_lock_key
    }

    /// The process salt mixed into every plugin key derivation.
    #[must_use]
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Whether the database was opened with an empty code at boot and the
    /// code has not been modified since.
    #[must_use]
    pub fn no_lock_code(&self) -> bool {
        self.no_lock_code
    }

    /// Records whether the current lock code is empty.
    pub fn set_no_lock_code(&mut self, no_lock_code: bool) {
        self.no_lock_code = no_lock_code;
    }
}

fn derive(lock_code: &[u8], salt: &[u8], label: &[u8]) -> SecretsResult<DerivedKey> {
    let hk = Hkdf::<Sha256>::new(Some(salt), lock_code);
    let mut okm = vec![0u8; 32];
    hk.expand(label, &mut okm)
        .map_err(|e| SecretsError::unknown(format!("lock key derivation failed: {e}")))?;
    Ok(DerivedKey::from_bytes(okm))
}
