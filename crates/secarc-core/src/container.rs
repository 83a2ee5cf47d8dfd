//! `.secarc` container file format
//!
//! Layout (version 1, integers big-endian):
//! ```text
//! key block (93 bytes, rewritten in place on password change)
//!   [6: "SECARC"][2: version][1: kdf id][16: salt][4: iterations][4: chunk size]
//!   [12: DEK nonce][32: DEK ciphertext][16: DEK tag]
//! manifest record
//!   [12: base nonce][4: length m][m: ciphertext][16: tag]
//! chunk records, until EOF
//!   [8: index][1: flags][12: nonce][4: length n][n: ciphertext][16: tag]
//! ```
//!
//! The first 33 bytes (the header) are the associated data of the wrapped DEK.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::envelope::WrappedDek;
use crate::error::{SecarcError, SecarcResult};
use crate::kdf::KdfParams;
use crate::stream::{ChunkRecord, ManifestRecord, FLAG_FINAL};
use crate::{NONCE_SIZE, SALT_SIZE, TAG_SIZE};

pub const MAGIC: &[u8; 6] = b"SECARC";
pub const FORMAT_VERSION: u16 = 1;

/// KDF algorithm id for PBKDF2-HMAC-SHA512
pub const KDF_PBKDF2_SHA512: u8 = 1;

pub const HEADER_LEN: usize = 6 + 2 + 1 + SALT_SIZE + 4 + 4;
pub const KEY_BLOCK_LEN: usize = HEADER_LEN + WrappedDek::LEN;

pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;
pub const MAX_MANIFEST_LEN: u32 = 64 * 1024 * 1024;

/// Fixed container header: everything needed to derive the KEK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kdf: KdfParams,
    pub chunk_size: u32,
}

impl Header {
    pub fn new(kdf: KdfParams, chunk_size: u32) -> Self {
        Self { kdf, chunk_size }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..6].copy_from_slice(MAGIC);
        out[6..8].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        out[8] = KDF_PBKDF2_SHA512;
        out[9..25].copy_from_slice(&self.kdf.salt);
        out[25..29].copy_from_slice(&self.kdf.iterations.to_be_bytes());
        out[29..33].copy_from_slice(&self.chunk_size.to_be_bytes());
        out
    }

    /// Parse a header, checking magic and version before anything else.
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> SecarcResult<Self> {
        if &bytes[0..6] != MAGIC {
            return Err(SecarcError::format("not a secarc container (bad magic)"));
        }
        let version = u16::from_be_bytes([bytes[6], bytes[7]]);
        if version != FORMAT_VERSION {
            return Err(SecarcError::format(format!(
                "unsupported container version {version}"
            )));
        }
        if bytes[8] != KDF_PBKDF2_SHA512 {
            return Err(SecarcError::format(format!(
                "unknown KDF algorithm id {}",
                bytes[8]
            )));
        }

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[9..25]);
        let iterations = u32::from_be_bytes([bytes[25], bytes[26], bytes[27], bytes[28]]);
        let chunk_size = u32::from_be_bytes([bytes[29], bytes[30], bytes[31], bytes[32]]);

        if iterations == 0 {
            return Err(SecarcError::format("KDF iteration count must be positive"));
        }
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(SecarcError::format(format!(
                "chunk size {chunk_size} out of range"
            )));
        }

        Ok(Self {
            kdf: KdfParams { salt, iterations },
            chunk_size,
        })
    }
}

/// Staged container output.
///
/// Everything is written to a temp file next to the destination. Nothing
/// appears at the destination until [`ContainerWriter::finish`]; dropping the
/// writer removes the temp file.
pub struct ContainerWriter {
    destination: PathBuf,
    overwrite: bool,
    out: BufWriter<NamedTempFile>,
    written: u64,
}

impl ContainerWriter {
    pub fn create(destination: &Path, overwrite: bool) -> SecarcResult<Self> {
        if !overwrite && destination.symlink_metadata().is_ok() {
            return Err(SecarcError::DestinationExists {
                path: destination.to_path_buf(),
            });
        }

        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let tmp = tempfile::Builder::new()
            .prefix(".secarc-")
            .suffix(".tmp")
            .tempfile_in(parent)
            .map_err(|e| {
                SecarcError::io(format!("creating temp file in {}", parent.display()), e)
            })?;

        Ok(Self {
            destination: destination.to_path_buf(),
            overwrite,
            out: BufWriter::new(tmp),
            written: 0,
        })
    }

    fn put(&mut self, bytes: &[u8]) -> SecarcResult<()> {
        self.out
            .write_all(bytes)
            .map_err(|e| SecarcError::io("writing container", e))?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    pub fn write_key_block(&mut self, header: &Header, wrapped: &WrappedDek) -> SecarcResult<()> {
        self.put(&header.to_bytes())?;
        self.put(&wrapped.to_bytes())
    }

    pub fn write_manifest(&mut self, record: &ManifestRecord) -> SecarcResult<()> {
        let len = u32::try_from(record.ciphertext.len())
            .ok()
            .filter(|l| *l <= MAX_MANIFEST_LEN)
            .ok_or_else(|| anyhow::anyhow!("manifest too large"))?;
        self.put(&record.nonce)?;
        self.put(&len.to_be_bytes())?;
        self.put(&record.ciphertext)?;
        self.put(&record.tag)
    }

    pub fn write_chunk(&mut self, record: &ChunkRecord) -> SecarcResult<()> {
        let len = u32::try_from(record.ciphertext.len())
            .map_err(|_| anyhow::anyhow!("chunk too large"))?;
        self.put(&record.index.to_be_bytes())?;
        self.put(&[record.flags])?;
        self.put(&record.nonce)?;
        self.put(&len.to_be_bytes())?;
        self.put(&record.ciphertext)?;
        self.put(&record.tag)
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush, fsync and move the container onto its destination.
    pub fn finish(self) -> SecarcResult<u64> {
        let tmp = self
            .out
            .into_inner()
            .map_err(|e| SecarcError::io("flushing container", e.into_error()))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| SecarcError::io("syncing container", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
                .map_err(|e| SecarcError::io("setting container permissions", e))?;
        }

        let persisted = if self.overwrite {
            tmp.persist(&self.destination)
        } else {
            tmp.persist_noclobber(&self.destination)
        };
        match persisted {
            Ok(_) => Ok(self.written),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(SecarcError::DestinationExists {
                    path: self.destination,
                })
            }
            Err(e) => Err(SecarcError::io(
                format!("moving container to {}", self.destination.display()),
                e.error,
            )),
        }
    }
}

/// Sequential container input.
pub struct ContainerReader {
    reader: BufReader<File>,
    header: Header,
    header_bytes: [u8; HEADER_LEN],
    wrapped: WrappedDek,
    manifest_read: bool,
}

impl ContainerReader {
    /// Open a container and read its key block.
    pub fn open(path: &Path) -> SecarcResult<Self> {
        Self::open_with(path, OpenOptions::new().read(true))
    }

    /// Open a container for reading and for [`ContainerReader::rewrite_key_block`]
    /// through the same handle.
    pub fn open_for_update(path: &Path) -> SecarcResult<Self> {
        Self::open_with(path, OpenOptions::new().read(true).write(true))
    }

    fn open_with(path: &Path, options: &OpenOptions) -> SecarcResult<Self> {
        let file = match options.open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecarcError::SourceNotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(SecarcError::io(format!("opening {}", path.display()), e)),
        };
        let mut reader = BufReader::new(file);

        let mut header_bytes = [0u8; HEADER_LEN];
        read_exact(&mut reader, &mut header_bytes, "header")?;
        let header = Header::parse(&header_bytes)?;

        let mut wrapped_bytes = [0u8; WrappedDek::LEN];
        read_exact(&mut reader, &mut wrapped_bytes, "wrapped key")?;

        Ok(Self {
            reader,
            header,
            header_bytes,
            wrapped: WrappedDek::from_bytes(&wrapped_bytes),
            manifest_read: false,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Raw header bytes, as bound into the wrapped DEK.
    pub fn header_bytes(&self) -> &[u8; HEADER_LEN] {
        &self.header_bytes
    }

    pub fn wrapped_dek(&self) -> &WrappedDek {
        &self.wrapped
    }

    pub fn read_manifest(&mut self) -> SecarcResult<ManifestRecord> {
        let mut nonce = [0u8; NONCE_SIZE];
        read_exact(&mut self.reader, &mut nonce, "manifest nonce")?;

        let mut len = [0u8; 4];
        read_exact(&mut self.reader, &mut len, "manifest length")?;
        let len = u32::from_be_bytes(len);
        if len > MAX_MANIFEST_LEN {
            return Err(SecarcError::format(format!(
                "manifest length {len} exceeds limit"
            )));
        }

        let ciphertext = read_vec(&mut self.reader, len as usize, "manifest")?;
        let mut tag = [0u8; TAG_SIZE];
        read_exact(&mut self.reader, &mut tag, "manifest tag")?;

        self.manifest_read = true;
        Ok(ManifestRecord {
            nonce,
            ciphertext,
            tag,
        })
    }

    /// Overwrite the key block in place through this handle and fsync.
    ///
    /// The reader must come from [`ContainerReader::open_for_update`], so the
    /// file rewritten is the one whose key block was read even if the path
    /// has been replaced since.
    pub fn rewrite_key_block(self, header: &Header, wrapped: &WrappedDek) -> SecarcResult<()> {
        let mut block = Vec::with_capacity(KEY_BLOCK_LEN);
        block.extend_from_slice(&header.to_bytes());
        block.extend_from_slice(&wrapped.to_bytes());

        let mut file = self.reader.into_inner();
        let write = |file: &mut File| -> std::io::Result<()> {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&block)?;
            file.sync_all()
        };
        write(&mut file).map_err(|e| SecarcError::io("rewriting key block", e))
    }

    /// Switch to reading chunk records. The manifest must have been read.
    pub fn into_records(self) -> SecarcResult<ChunkRecords> {
        if !self.manifest_read {
            return Err(anyhow::anyhow!("chunk records requested before the manifest").into());
        }
        Ok(ChunkRecords {
            reader: self.reader,
            chunk_size: self.header.chunk_size,
            done: false,
        })
    }
}

/// Lazy iterator over the chunk records that follow the manifest.
///
/// Ends cleanly at EOF on a record boundary; a partial record is a format
/// error. Nothing is yielded after an error.
pub struct ChunkRecords {
    reader: BufReader<File>,
    chunk_size: u32,
    done: bool,
}

impl ChunkRecords {
    fn read_record(&mut self) -> SecarcResult<Option<ChunkRecord>> {
        let at_eof = self
            .reader
            .fill_buf()
            .map_err(|e| SecarcError::io("reading container", e))?
            .is_empty();
        if at_eof {
            return Ok(None);
        }

        let mut index = [0u8; 8];
        read_exact(&mut self.reader, &mut index, "chunk index")?;
        let mut flags = [0u8; 1];
        read_exact(&mut self.reader, &mut flags, "chunk flags")?;
        let flags = flags[0];
        if flags & !FLAG_FINAL != 0 {
            return Err(SecarcError::format(format!("unknown chunk flags {flags:#04x}")));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        read_exact(&mut self.reader, &mut nonce, "chunk nonce")?;
        let mut len = [0u8; 4];
        read_exact(&mut self.reader, &mut len, "chunk length")?;
        let len = u32::from_be_bytes(len);
        if len > self.chunk_size {
            return Err(SecarcError::format(format!(
                "chunk length {len} exceeds chunk size {}",
                self.chunk_size
            )));
        }

        let ciphertext = read_vec(&mut self.reader, len as usize, "chunk")?;
        let mut tag = [0u8; TAG_SIZE];
        read_exact(&mut self.reader, &mut tag, "chunk tag")?;

        Ok(Some(ChunkRecord {
            index: u64::from_be_bytes(index),
            flags,
            nonce,
            ciphertext,
            tag,
        }))
    }
}

impl Iterator for ChunkRecords {
    type Item = SecarcResult<ChunkRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for ChunkRecords {}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> SecarcResult<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => SecarcError::format(format!("truncated {what}")),
        _ => SecarcError::io(format!("reading {what}"), e),
    })
}

fn read_vec<R: Read>(reader: &mut R, len: usize, what: &str) -> SecarcResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    read_exact(reader, &mut buf, what)?;
    Ok(buf)
}
