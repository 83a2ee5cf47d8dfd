//! The five container operations: encrypt, decrypt, list, verify, re-key
//!
//! Every call runs one linear pipeline and owns its keys for exactly that
//! call:
//!   - `encrypt_path`: walk → manifest → DEK + KEK → manifest/chunks → staged write → rename
//!   - `decrypt_container`: key block → KEK → DEK → manifest → chunks → files
//!   - `list_container`: key block → KEK → DEK → manifest
//!   - `verify_container`: like decrypt, plaintext discarded
//!   - `change_password`: key block → old KEK → DEK → new KEK → rewrite key block

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use secrecy::SecretString;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::container::{ContainerReader, ContainerWriter, Header};
use crate::envelope::{self, generate_dek, Dek};
use crate::error::{SecarcError, SecarcResult};
use crate::kdf::{clamp_iterations, derive_kek, warn_if_costly, KdfParams};
use crate::manifest::{Entry, EntryKind, Manifest};
use crate::stream::{decrypt_stream, encrypt_stream, open_manifest, seal_manifest, PlainChunk};
use crate::{DEFAULT_CHUNK_SIZE, NONCE_SIZE};

/// Progress callback type (done, total, message)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

/// Result of a successful `encrypt_path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptSummary {
    /// Manifest entries, files and empty directories
    pub entries: usize,
    pub files: usize,
    /// Plaintext bytes encrypted
    pub bytes: u64,
    /// Chunk records written, excluding the manifest
    pub chunks: u64,
}

/// Result of a successful `decrypt_container`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptSummary {
    pub entries: usize,
    pub files: usize,
    pub bytes: u64,
    pub chunks: u64,
}

/// Encrypt a file or directory tree into a new container.
///
/// `iterations` below [`crate::MIN_ITERATIONS`] is raised to the floor. With
/// `overwrite == false` an existing `destination` is never touched.
pub fn encrypt_path(
    source: &Path,
    destination: &Path,
    password: &SecretString,
    iterations: u32,
    overwrite: bool,
) -> SecarcResult<EncryptSummary> {
    encrypt_path_with_progress(source, destination, password, iterations, overwrite, None)
}

/// [`encrypt_path`] reporting plaintext bytes encrypted.
pub fn encrypt_path_with_progress(
    source: &Path,
    destination: &Path,
    password: &SecretString,
    iterations: u32,
    overwrite: bool,
    progress: Option<&ProgressFn>,
) -> SecarcResult<EncryptSummary> {
    let kdf = KdfParams::generate(iterations);
    encrypt_with_params(
        source,
        destination,
        password,
        kdf,
        DEFAULT_CHUNK_SIZE,
        overwrite,
        progress,
    )
}

fn encrypt_with_params(
    source: &Path,
    destination: &Path,
    password: &SecretString,
    kdf: KdfParams,
    chunk_size: u32,
    overwrite: bool,
    progress: Option<&ProgressFn>,
) -> SecarcResult<EncryptSummary> {
    debug!(source = %source.display(), destination = %destination.display(), "encrypt: start");

    let source_meta = std::fs::symlink_metadata(source).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SecarcError::SourceNotFound {
            path: source.to_path_buf(),
        },
        _ => SecarcError::io(format!("stat {}", source.display()), e),
    })?;
    if !overwrite && destination.symlink_metadata().is_ok() {
        return Err(SecarcError::DestinationExists {
            path: destination.to_path_buf(),
        });
    }

    let manifest = Manifest::build(source)?;
    debug!(
        entries = manifest.entries().count(),
        files = manifest.file_count(),
        "encrypt: manifest built"
    );

    let mut writer = ContainerWriter::create(destination, overwrite)?;

    let header = Header::new(kdf, chunk_size);
    let header_bytes = header.to_bytes();
    let dek = generate_dek();
    debug!(iterations = kdf.iterations, "encrypt: deriving key");
    let wrapped = {
        let kek = derive_kek(password, &kdf.salt, kdf.iterations)?;
        envelope::wrap(&dek, &kek, &header_bytes)?
    };
    writer.write_key_block(&header, &wrapped)?;

    let manifest_bytes = Zeroizing::new(manifest.to_bytes()?);
    let manifest_record = seal_manifest(&dek, &manifest_bytes)?;
    writer.write_manifest(&manifest_record)?;
    let base_nonce = manifest_record.nonce;

    let total = manifest.total_size();
    let mut bytes = 0u64;
    let mut chunks = 0u64;
    let mut next_index = 1u64;

    debug!("encrypt: streaming chunks");
    for entry in manifest.file_entries() {
        let path = if source_meta.is_dir() {
            source.join(&entry.path)
        } else {
            source.to_path_buf()
        };
        let file = File::open(&path)
            .map_err(|e| SecarcError::io(format!("opening {}", path.display()), e))
            .map_err(|e| e.in_entry(&entry.path))?;

        let mut stream = encrypt_stream(file, &dek, base_nonce, next_index, chunk_size);
        let mut file_bytes = 0u64;
        for record in stream.by_ref() {
            let record = record.map_err(|e| e.in_entry(&entry.path))?;
            file_bytes += record.ciphertext.len() as u64;
            writer.write_chunk(&record)?;
            chunks += 1;

            if let Some(cb) = progress {
                cb(bytes + file_bytes, total, &entry.path);
            }
        }
        next_index = stream.next_index();

        if file_bytes != entry.size {
            return Err(SecarcError::io(
                "encrypting",
                std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!(
                        "file changed size during encryption ({} -> {file_bytes} bytes)",
                        entry.size
                    ),
                ),
            )
            .in_entry(&entry.path));
        }
        bytes += file_bytes;
    }

    let container_bytes = writer.finish()?;

    let summary = EncryptSummary {
        entries: manifest.entries().count(),
        files: manifest.file_count(),
        bytes,
        chunks,
    };
    info!(
        source = %source.display(),
        destination = %destination.display(),
        entries = summary.entries,
        bytes = summary.bytes,
        chunks = summary.chunks,
        container_bytes,
        "encrypted"
    );
    Ok(summary)
}

/// Decrypt a container into `destination_dir`, creating it if absent.
///
/// Existing files at entry paths are replaced: the old directory entry is
/// unlinked and a new file created, so a hard link to a file outside the
/// destination is never written through. On a chunk failure the
/// operation stops; files already extracted stay, and the error names the
/// entry whose file is incomplete.
pub fn decrypt_container(
    container: &Path,
    destination_dir: &Path,
    password: &SecretString,
) -> SecarcResult<DecryptSummary> {
    decrypt_container_with_progress(container, destination_dir, password, None)
}

/// [`decrypt_container`] reporting plaintext bytes extracted.
pub fn decrypt_container_with_progress(
    container: &Path,
    destination_dir: &Path,
    password: &SecretString,
    progress: Option<&ProgressFn>,
) -> SecarcResult<DecryptSummary> {
    debug!(container = %container.display(), "decrypt: start");

    let mut reader = ContainerReader::open(container)?;
    let dek = unlock(&reader, password)?;
    let (manifest, base_nonce) = read_manifest(&mut reader, &dek)?;
    let chunk_size = reader.header().chunk_size;

    std::fs::create_dir_all(destination_dir).map_err(|e| {
        SecarcError::io(format!("creating {}", destination_dir.display()), e)
    })?;

    debug!("decrypt: streaming chunks");
    let chunks = decrypt_stream(reader.into_records()?, &dek, base_nonce, 1);
    let summary = process_payload(&manifest, chunks, chunk_size, progress, |entry| {
        let target = safe_join(destination_dir, &entry.path)?;
        match entry.kind {
            EntryKind::Directory => {
                std::fs::create_dir_all(&target)
                    .map_err(|e| SecarcError::io(format!("creating {}", target.display()), e))?;
                Ok(None)
            }
            EntryKind::File => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        SecarcError::io(format!("creating {}", parent.display()), e)
                    })?;
                }
                create_fresh(&target).map(Some)
            }
        }
    })?;

    info!(
        container = %container.display(),
        destination = %destination_dir.display(),
        entries = summary.entries,
        bytes = summary.bytes,
        chunks = summary.chunks,
        "decrypted"
    );
    Ok(summary)
}

/// List the entries of a container. Only the manifest is decrypted and
/// nothing is written.
pub fn list_container(container: &Path, password: &SecretString) -> SecarcResult<Vec<Entry>> {
    debug!(container = %container.display(), "list: start");

    let mut reader = ContainerReader::open(container)?;
    let dek = unlock(&reader, password)?;
    let (manifest, _) = read_manifest(&mut reader, &dek)?;

    info!(
        container = %container.display(),
        entries = manifest.entries().count(),
        "listed"
    );
    Ok(manifest.into_entries())
}

/// Authenticate every byte of a container without writing anything.
///
/// Returns false on any failure, including a wrong password or a missing
/// file. The reason is logged at debug level.
pub fn verify_container(container: &Path, password: &SecretString) -> bool {
    verify_container_with_progress(container, password, None)
}

/// [`verify_container`] reporting plaintext bytes checked.
pub fn verify_container_with_progress(
    container: &Path,
    password: &SecretString,
    progress: Option<&ProgressFn>,
) -> bool {
    match verify_inner(container, password, progress) {
        Ok(summary) => {
            info!(
                container = %container.display(),
                entries = summary.entries,
                bytes = summary.bytes,
                chunks = summary.chunks,
                "verified"
            );
            true
        }
        Err(e) => {
            debug!(container = %container.display(), error = %e, "verify: failed");
            false
        }
    }
}

fn verify_inner(
    container: &Path,
    password: &SecretString,
    progress: Option<&ProgressFn>,
) -> SecarcResult<DecryptSummary> {
    debug!(container = %container.display(), "verify: start");

    let mut reader = ContainerReader::open(container)?;
    let dek = unlock(&reader, password)?;
    let (manifest, base_nonce) = read_manifest(&mut reader, &dek)?;
    let chunk_size = reader.header().chunk_size;

    let chunks = decrypt_stream(reader.into_records()?, &dek, base_nonce, 1);
    process_payload(&manifest, chunks, chunk_size, progress, |_| Ok(None))
}

/// Re-wrap the container's DEK under a new password.
///
/// Only the key block is rewritten; the payload is untouched. A fresh salt
/// is always drawn. `new_iterations` of `None` keeps the stored count as it
/// is; an explicit count is raised to the creation floor.
pub fn change_password(
    container: &Path,
    current_password: &SecretString,
    new_password: &SecretString,
    new_iterations: Option<u32>,
) -> SecarcResult<()> {
    change_password_with_progress(container, current_password, new_password, new_iterations, None)
}

/// [`change_password`] reporting its two key derivations.
pub fn change_password_with_progress(
    container: &Path,
    current_password: &SecretString,
    new_password: &SecretString,
    new_iterations: Option<u32>,
    progress: Option<&ProgressFn>,
) -> SecarcResult<()> {
    debug!(container = %container.display(), "passwd: start");
    let report = |done: u64, msg: &str| {
        if let Some(cb) = progress {
            cb(done, 3, msg);
        }
    };

    report(0, "unlocking");
    let reader = ContainerReader::open_for_update(container)?;
    let dek = unlock(&reader, current_password)?;
    let old_header = *reader.header();

    report(1, "deriving new key");
    let iterations = match new_iterations {
        Some(requested) => clamp_iterations(requested),
        None => old_header.kdf.iterations,
    };
    let header = Header::new(KdfParams::generate(iterations), old_header.chunk_size);
    let wrapped = {
        let kek = derive_kek(new_password, &header.kdf.salt, header.kdf.iterations)?;
        envelope::rewrap(&dek, &kek, &header.to_bytes())?
    };

    report(2, "rewriting key block");
    reader.rewrite_key_block(&header, &wrapped)?;
    report(3, "done");

    info!(
        container = %container.display(),
        old_iterations = old_header.kdf.iterations,
        iterations = header.kdf.iterations,
        "password changed"
    );
    Ok(())
}

/// Derive the KEK from the stored KDF parameters and unwrap the DEK.
fn unlock(reader: &ContainerReader, password: &SecretString) -> SecarcResult<Dek> {
    let kdf = reader.header().kdf;
    warn_if_costly(kdf.iterations);
    debug!(iterations = kdf.iterations, "deriving key");
    let kek = derive_kek(password, &kdf.salt, kdf.iterations)?;
    debug!("unwrapping data key");
    envelope::unwrap(reader.wrapped_dek(), &kek, reader.header_bytes())
}

fn read_manifest(
    reader: &mut ContainerReader,
    dek: &Dek,
) -> SecarcResult<(Manifest, [u8; NONCE_SIZE])> {
    let record = reader.read_manifest()?;
    let plaintext = open_manifest(dek, &record)?;
    let manifest = Manifest::from_bytes(&plaintext)?;
    debug!(
        entries = manifest.entries().count(),
        files = manifest.file_count(),
        "manifest decrypted"
    );
    Ok((manifest, record.nonce))
}

/// Walk the manifest against the decrypted chunk stream.
///
/// `open_entry` is called once per entry in manifest order and may return a
/// file to receive that entry's plaintext. Checks that every file entry has
/// exactly one well-formed segment and that nothing follows the last one.
fn process_payload<I, F>(
    manifest: &Manifest,
    mut chunks: I,
    chunk_size: u32,
    progress: Option<&ProgressFn>,
    mut open_entry: F,
) -> SecarcResult<DecryptSummary>
where
    I: Iterator<Item = SecarcResult<PlainChunk>>,
    F: FnMut(&Entry) -> SecarcResult<Option<File>>,
{
    let total = manifest.total_size();
    let mut bytes = 0u64;
    let mut chunk_count = 0u64;

    for entry in manifest.entries() {
        let sink = open_entry(entry).map_err(|e| e.in_entry(&entry.path))?;
        if entry.kind == EntryKind::Directory {
            continue;
        }
        let mut sink = sink.map(BufWriter::new);

        let mut entry_bytes = 0u64;
        let mut entry_chunks = 0u64;
        loop {
            let chunk = match chunks.next() {
                Some(chunk) => chunk.map_err(|e| e.in_entry(&entry.path))?,
                None => {
                    return Err(SecarcError::format(format!(
                        "container ends before the data of {}",
                        entry.path
                    )));
                }
            };
            let len = chunk.data.len() as u64;
            if !chunk.is_final && len != u64::from(chunk_size) {
                return Err(SecarcError::format(format!(
                    "short chunk {} inside {}",
                    chunk.index, entry.path
                )));
            }

            if let Some(out) = sink.as_mut() {
                out.write_all(&chunk.data)
                    .map_err(|e| SecarcError::io("writing file", e).in_entry(&entry.path))?;
            }
            entry_bytes += len;
            entry_chunks += 1;

            if let Some(cb) = progress {
                cb(bytes + entry_bytes, total, &entry.path);
            }
            if chunk.is_final {
                break;
            }
        }

        if let Some(out) = sink.as_mut() {
            out.flush()
                .map_err(|e| SecarcError::io("writing file", e).in_entry(&entry.path))?;
        }
        if entry_bytes != entry.size || entry_chunks != entry.chunk_count(chunk_size) {
            return Err(SecarcError::format(format!(
                "{} holds {entry_bytes} bytes in {entry_chunks} chunks, manifest says {} bytes",
                entry.path, entry.size
            )));
        }
        bytes += entry_bytes;
        chunk_count += entry_chunks;
    }

    if chunks.next().is_some() {
        return Err(SecarcError::format("trailing data after the last entry"));
    }

    Ok(DecryptSummary {
        entries: manifest.entries().count(),
        files: manifest.file_count(),
        bytes,
        chunks: chunk_count,
    })
}

/// Replace whatever file sits at `target` with a new, empty one.
fn create_fresh(target: &Path) -> SecarcResult<File> {
    match std::fs::remove_file(target) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(SecarcError::io(format!("replacing {}", target.display()), e));
        }
    }
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
        .map_err(|e| SecarcError::io(format!("creating {}", target.display()), e))
}

/// Resolve a manifest path under `root`, refusing anything that could land
/// outside it: non-normal components and symlinks already on disk.
fn safe_join(root: &Path, rel: &str) -> SecarcResult<PathBuf> {
    let refuse = |why: &str| {
        SecarcError::io(
            format!("extracting {rel}"),
            std::io::Error::new(std::io::ErrorKind::InvalidInput, why.to_string()),
        )
    };

    let mut path = root.to_path_buf();
    let mut depth = 0;
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => {
                path.push(part);
                depth += 1;
                if let Ok(meta) = std::fs::symlink_metadata(&path) {
                    if meta.file_type().is_symlink() {
                        return Err(refuse("path goes through a symbolic link"));
                    }
                }
            }
            _ => return Err(refuse("path escapes the destination")),
        }
    }
    if depth == 0 {
        return Err(refuse("empty path"));
    }
    Ok(path)
}
