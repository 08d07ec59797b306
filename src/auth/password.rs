//! Password credentials as Argon2id PHC strings.
//!
//! Hashes carried over from an imported collection in any other format do not
//! parse, and verification reports them as `Credential` errors.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

use crate::error::{RelayError, RelayResult};

/// Hash a password with a fresh random salt.
///
/// # Errors
/// Returns `Credential` if hashing fails.
pub fn hash_password(password: &str) -> RelayResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| RelayError::Credential(format!("failed to hash password: {e}")))
}

/// Check a password against a stored PHC string.
///
/// Returns `Ok(false)` for a wrong password.
///
/// # Errors
/// Returns `Credential` if the stored hash is not a valid PHC string.
pub fn verify_password(password: &str, encoded: &str) -> RelayResult<bool> {
    let parsed = PasswordHash::new(encoded)
        .map_err(|e| RelayError::Credential(format!("invalid password hash format: {e}")))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
