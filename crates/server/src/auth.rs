//! Credential verification.
//!
//! Passwords are stored as `SHA256(password || salt)` with a fresh 32-byte
//! salt per account. Verification looks the record up before doing any
//! hashing and compares digests in constant time.

use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::store::{CredentialRecord, CredentialStore, StoreResult};

/// Salt length in bytes.
pub const SALT_SIZE: usize = 32;

/// Create an account with a freshly salted hash.
///
/// An existing record for the same username is replaced by the store.
pub fn create_account(
    store: &dyn CredentialStore,
    username: &str,
    password: &str,
) -> StoreResult<()> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);

    store.put(&CredentialRecord {
        username: username.to_string(),
        password_hash: salted_hash(password.as_bytes(), &salt),
        salt: salt.to_vec(),
    })
}

/// Check a username/password pair against the store.
///
/// An unknown username returns `Ok(false)` without computing a hash. Store
/// failures propagate as errors so callers never mistake them for success.
pub fn verify(store: &dyn CredentialStore, username: &str, password: &str) -> StoreResult<bool> {
    let Some(record) = store.get(username)? else {
        debug!(username, "authentication attempt for unknown user");
        return Ok(false);
    };

    let attempt = salted_hash(password.as_bytes(), &record.salt);
    Ok(attempt.ct_eq(&record.password_hash).into())
}

fn salted_hash(password: &[u8], salt: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(password);
    hasher.update(salt);
    hasher.finalize().to_vec()
}
