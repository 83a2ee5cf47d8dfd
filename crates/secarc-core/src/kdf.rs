//! Key derivation: PBKDF2-HMAC-SHA512 password → key-encrypting key

use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha512;
use zeroize::Zeroize;

use crate::error::{SecarcError, SecarcResult};
use crate::{KEY_SIZE, SALT_SIZE};

/// Lowest iteration count accepted when creating or re-keying a container.
///
/// Existing containers may store less and still open.
pub const MIN_ITERATIONS: u32 = 10_000;

/// Iteration count used when the caller has no preference.
pub const DEFAULT_ITERATIONS: u32 = 300_000;

/// Stored counts above this are far beyond anything the tool writes by
/// default and get a warning before derivation starts.
pub const HIGH_ITERATIONS: u32 = 100 * DEFAULT_ITERATIONS;

/// A 256-bit key-encrypting key derived from a password.
///
/// Zeroized on drop to prevent secrets lingering in memory.
pub struct Kek {
    bytes: [u8; KEY_SIZE],
}

impl Kek {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for Kek {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for Kek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kek").field("bytes", &"[REDACTED]").finish()
    }
}

/// PBKDF2 parameters as stored in a container header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub salt: [u8; SALT_SIZE],
    pub iterations: u32,
}

impl KdfParams {
    /// Fresh random salt with the given iteration count, raised to
    /// [`MIN_ITERATIONS`] if lower.
    pub fn generate(iterations: u32) -> Self {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        Self {
            salt,
            iterations: clamp_iterations(iterations),
        }
    }
}

/// Raise a requested iteration count to the creation floor.
pub fn clamp_iterations(requested: u32) -> u32 {
    if requested < MIN_ITERATIONS {
        tracing::warn!(
            requested,
            floor = MIN_ITERATIONS,
            "iteration count below floor, clamping"
        );
        MIN_ITERATIONS
    } else {
        requested
    }
}

/// Warn when a stored iteration count will make derivation unusually slow.
///
/// The header is only authenticated after the KEK exists, so a corrupted
/// count cannot be rejected up front. Returns whether the warning fired.
pub fn warn_if_costly(iterations: u32) -> bool {
    if iterations > HIGH_ITERATIONS {
        tracing::warn!(
            iterations,
            default = DEFAULT_ITERATIONS,
            "stored iteration count is unusually high, key derivation may take a long time"
        );
        true
    } else {
        false
    }
}

/// Derive a 256-bit KEK from a password, salt and iteration count.
///
/// Any positive iteration count is honored so that old containers keep
/// opening; the floor is only enforced by [`KdfParams::generate`].
pub fn derive_kek(
    password: &SecretString,
    salt: &[u8; SALT_SIZE],
    iterations: u32,
) -> SecarcResult<Kek> {
    if iterations == 0 {
        return Err(SecarcError::format("KDF iteration count must be positive"));
    }

    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha512>(
        password.expose_secret().as_bytes(),
        salt,
        iterations,
        &mut key,
    );

    Ok(Kek::from_bytes(key))
}
