//! secarc-core: password-based encryption engine for `.secarc` containers
//!
//! Architecture: envelope encryption over a chunked AES-256-GCM stream
//!
//! Pipeline: walk source → manifest → encrypt manifest + file chunks under DEK → staged write → rename
//!
//! Key hierarchy:
//! ```text
//! Password
//!   └── KEK (256-bit, PBKDF2-HMAC-SHA512, salt + iterations stored in header)
//!       └── DEK (per-container, 256-bit random, wrapped by KEK, AAD = header)
//!           ├── Manifest AEAD: AES-256-GCM (nonce = base, index 0)
//!           └── Chunk AEAD:    AES-256-GCM (nonce = base ^ index, AAD = index || flags)
//! ```
//!
//! Changing the password re-wraps the DEK and rewrites only the fixed-size key
//! block at the front of the container.

pub mod container;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod manifest;
pub mod stream;

pub use engine::{
    change_password, change_password_with_progress, decrypt_container,
    decrypt_container_with_progress, encrypt_path, encrypt_path_with_progress, list_container,
    verify_container, verify_container_with_progress, DecryptSummary, EncryptSummary, ProgressFn,
};
pub use envelope::{generate_dek, Dek, WrappedDek};
pub use error::{ErrorKind, SecarcError, SecarcResult};
pub use kdf::{derive_kek, Kek, KdfParams, DEFAULT_ITERATIONS, MIN_ITERATIONS};
pub use manifest::{Entry, EntryKind, Manifest};

/// Size of a DEK/KEK in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of a KDF salt
pub const SALT_SIZE: usize = 16;

/// Default plaintext chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;
