//! Envelope keys: DEK generation and wrapping under a password-derived KEK

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{SecarcError, SecarcResult};
use crate::kdf::Kek;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// The per-container 256-bit data encryption key. Zeroized on drop.
pub struct Dek {
    bytes: [u8; KEY_SIZE],
}

impl Dek {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for Dek {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for Dek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dek").field("bytes", &"[REDACTED]").finish()
    }
}

/// A DEK encrypted under a KEK, as laid out in the container key block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedDek {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: [u8; KEY_SIZE],
    pub tag: [u8; TAG_SIZE],
}

impl WrappedDek {
    pub const LEN: usize = NONCE_SIZE + KEY_SIZE + TAG_SIZE;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..NONCE_SIZE].copy_from_slice(&self.nonce);
        out[NONCE_SIZE..NONCE_SIZE + KEY_SIZE].copy_from_slice(&self.ciphertext);
        out[NONCE_SIZE + KEY_SIZE..].copy_from_slice(&self.tag);
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::LEN]) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        let mut ciphertext = [0u8; KEY_SIZE];
        let mut tag = [0u8; TAG_SIZE];
        nonce.copy_from_slice(&bytes[..NONCE_SIZE]);
        ciphertext.copy_from_slice(&bytes[NONCE_SIZE..NONCE_SIZE + KEY_SIZE]);
        tag.copy_from_slice(&bytes[NONCE_SIZE + KEY_SIZE..]);
        Self {
            nonce,
            ciphertext,
            tag,
        }
    }
}

/// Generate a random 256-bit data encryption key.
pub fn generate_dek() -> Dek {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    Dek::from_bytes(bytes)
}

/// Wrap (encrypt) the DEK under a KEK.
///
/// Uses AES-256-GCM with a fresh random nonce. `aad` is the serialized
/// container header, so KDF parameters cannot be swapped without failing the
/// unwrap.
pub fn wrap(dek: &Dek, kek: &Kek, aad: &[u8]) -> SecarcResult<WrappedDek> {
    let cipher = Aes256Gcm::new(kek.as_bytes().into());

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: dek.as_bytes(),
                aad,
            },
        )
        .map_err(|e| anyhow::anyhow!("key wrapping failed: {e}"))?;

    if sealed.len() != KEY_SIZE + TAG_SIZE {
        return Err(anyhow::anyhow!("wrapped key has unexpected size: {}", sealed.len()).into());
    }

    let mut ciphertext = [0u8; KEY_SIZE];
    let mut tag = [0u8; TAG_SIZE];
    ciphertext.copy_from_slice(&sealed[..KEY_SIZE]);
    tag.copy_from_slice(&sealed[KEY_SIZE..]);

    Ok(WrappedDek {
        nonce,
        ciphertext,
        tag,
    })
}

/// Unwrap (decrypt) the DEK.
///
/// A tag mismatch is reported as [`SecarcError::WrongPasswordOrCorrupted`]:
/// a wrong password and a damaged key block look the same here.
pub fn unwrap(wrapped: &WrappedDek, kek: &Kek, aad: &[u8]) -> SecarcResult<Dek> {
    let cipher = Aes256Gcm::new(kek.as_bytes().into());

    let mut sealed = Vec::with_capacity(KEY_SIZE + TAG_SIZE);
    sealed.extend_from_slice(&wrapped.ciphertext);
    sealed.extend_from_slice(&wrapped.tag);

    let mut plaintext = cipher
        .decrypt(
            Nonce::from_slice(&wrapped.nonce),
            Payload { msg: &sealed, aad },
        )
        .map_err(|_| SecarcError::corrupted())?;

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(Dek::from_bytes(key_bytes))
}

/// Re-wrap an already unwrapped DEK under a new KEK.
///
/// Holding a `Dek` is the proof that the old KEK was correct: the only way to
/// get one for an existing container is a successful [`unwrap`].
pub fn rewrap(dek: &Dek, new_kek: &Kek, aad: &[u8]) -> SecarcResult<WrappedDek> {
    wrap(dek, new_kek, aad)
}
