//! Chunked AES-256-GCM stream cipher
//!
//! Every record in a container is sealed under the one DEK with a nonce
//! derived from its global sequence index:
//! ```text
//! nonce(i) = base_nonce with bytes 4..12 XOR i (u64, big-endian)
//! AAD(manifest) = "secarc-manifest" || 0u64
//! AAD(chunk i)  = "secarc-chunk" || i (u64 BE) || flags (u8)
//! ```
//!
//! Index 0 is the manifest; file chunks start at 1. Binding the index and
//! the `final` flag into the AAD stops chunks being reordered, dropped from
//! the end of a file, or moved between files.

use std::io::Read;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::envelope::Dek;
use crate::error::{SecarcError, SecarcResult};
use crate::{NONCE_SIZE, TAG_SIZE};

/// Flag bit marking the last chunk of a file.
pub const FLAG_FINAL: u8 = 0x01;

const MANIFEST_AAD_LABEL: &[u8] = b"secarc-manifest";
const CHUNK_AAD_LABEL: &[u8] = b"secarc-chunk";

/// One encrypted chunk as stored in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub index: u64,
    pub flags: u8,
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

impl ChunkRecord {
    pub fn is_final(&self) -> bool {
        self.flags & FLAG_FINAL != 0
    }
}

/// The encrypted manifest. Its nonce is the stream's base nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRecord {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

/// A decrypted chunk. The plaintext is wiped when dropped.
pub struct PlainChunk {
    pub index: u64,
    pub is_final: bool,
    pub data: Zeroizing<Vec<u8>>,
}

/// Nonce for sequence index `index`.
pub fn derive_nonce(base: &[u8; NONCE_SIZE], index: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = *base;
    for (n, i) in nonce[NONCE_SIZE - 8..].iter_mut().zip(index.to_be_bytes()) {
        *n ^= i;
    }
    nonce
}

fn manifest_aad() -> Vec<u8> {
    let mut aad = Vec::with_capacity(MANIFEST_AAD_LABEL.len() + 8);
    aad.extend_from_slice(MANIFEST_AAD_LABEL);
    aad.extend_from_slice(&0u64.to_be_bytes());
    aad
}

fn chunk_aad(index: u64, flags: u8) -> Vec<u8> {
    let mut aad = Vec::with_capacity(CHUNK_AAD_LABEL.len() + 9);
    aad.extend_from_slice(CHUNK_AAD_LABEL);
    aad.extend_from_slice(&index.to_be_bytes());
    aad.push(flags);
    aad
}

fn seal(
    cipher: &Aes256Gcm,
    nonce: &[u8; NONCE_SIZE],
    msg: &[u8],
    aad: &[u8],
) -> SecarcResult<(Vec<u8>, [u8; TAG_SIZE])> {
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg, aad })
        .map_err(|e| anyhow::anyhow!("chunk encryption failed: {e}"))?;

    let split = sealed.len() - TAG_SIZE;
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&sealed[split..]);
    sealed.truncate(split);
    Ok((sealed, tag))
}

fn open(
    cipher: &Aes256Gcm,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
    aad: &[u8],
) -> SecarcResult<Zeroizing<Vec<u8>>> {
    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: &sealed, aad })
        .map(Zeroizing::new)
        .map_err(|_| SecarcError::corrupted())
}

/// Encrypt the serialized manifest under a fresh random base nonce.
pub fn seal_manifest(dek: &Dek, plaintext: &[u8]) -> SecarcResult<ManifestRecord> {
    let cipher = Aes256Gcm::new(dek.as_bytes().into());

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let (ciphertext, tag) = seal(&cipher, &nonce, plaintext, &manifest_aad())?;
    Ok(ManifestRecord {
        nonce,
        ciphertext,
        tag,
    })
}

/// Decrypt the manifest record.
pub fn open_manifest(dek: &Dek, record: &ManifestRecord) -> SecarcResult<Zeroizing<Vec<u8>>> {
    let cipher = Aes256Gcm::new(dek.as_bytes().into());
    open(
        &cipher,
        &record.nonce,
        &record.ciphertext,
        &record.tag,
        &manifest_aad(),
    )
}

/// Start encrypting `reader` as a run of chunk records.
///
/// The first record gets `start_index`. The last record carries
/// [`FLAG_FINAL`]; an empty reader yields exactly one empty final record.
pub fn encrypt_stream<R: Read>(
    reader: R,
    dek: &Dek,
    base_nonce: [u8; NONCE_SIZE],
    start_index: u64,
    chunk_size: u32,
) -> EncryptStream<R> {
    EncryptStream {
        reader,
        cipher: Aes256Gcm::new(dek.as_bytes().into()),
        base_nonce,
        next_index: start_index,
        chunk_size,
        lookahead: None,
        done: false,
    }
}

/// Lazy iterator over the encrypted chunks of one reader.
///
/// Holds at most two plaintext chunks: the one being sealed and the one read
/// ahead to decide whether it is final.
pub struct EncryptStream<R> {
    reader: R,
    cipher: Aes256Gcm,
    base_nonce: [u8; NONCE_SIZE],
    next_index: u64,
    chunk_size: u32,
    lookahead: Option<Zeroizing<Vec<u8>>>,
    done: bool,
}

impl<R: Read> EncryptStream<R> {
    /// Index the next record will get.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    fn read_chunk(&mut self) -> SecarcResult<Zeroizing<Vec<u8>>> {
        let mut buf = Zeroizing::new(Vec::with_capacity(self.chunk_size as usize));
        self.reader
            .by_ref()
            .take(u64::from(self.chunk_size))
            .read_to_end(&mut buf)
            .map_err(|e| SecarcError::io("reading source file", e))?;
        Ok(buf)
    }

    fn next_record(&mut self) -> SecarcResult<ChunkRecord> {
        let current = match self.lookahead.take() {
            Some(chunk) => chunk,
            None => self.read_chunk()?,
        };
        let ahead = self.read_chunk()?;

        let flags = if ahead.is_empty() {
            self.done = true;
            FLAG_FINAL
        } else {
            self.lookahead = Some(ahead);
            0
        };

        let index = self.next_index;
        self.next_index = index
            .checked_add(1)
            .ok_or_else(|| anyhow::anyhow!("chunk index overflow"))?;

        let nonce = derive_nonce(&self.base_nonce, index);
        let (ciphertext, tag) = seal(&self.cipher, &nonce, &current, &chunk_aad(index, flags))?;

        Ok(ChunkRecord {
            index,
            flags,
            nonce,
            ciphertext,
            tag,
        })
    }
}

impl<R: Read> Iterator for EncryptStream<R> {
    type Item = SecarcResult<ChunkRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = self.next_record();
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

/// Start decrypting a sequence of chunk records.
///
/// `records` is expected to begin at `start_index` and count up by one.
pub fn decrypt_stream<I>(
    records: I,
    dek: &Dek,
    base_nonce: [u8; NONCE_SIZE],
    start_index: u64,
) -> DecryptStream<I::IntoIter>
where
    I: IntoIterator<Item = SecarcResult<ChunkRecord>>,
{
    DecryptStream {
        records: records.into_iter(),
        cipher: Aes256Gcm::new(dek.as_bytes().into()),
        base_nonce,
        next_index: start_index,
        failed: false,
    }
}

/// Lazy iterator over decrypted chunks.
///
/// Yields nothing after the first error, and never yields plaintext from a
/// record that failed authentication.
pub struct DecryptStream<I> {
    records: I,
    cipher: Aes256Gcm,
    base_nonce: [u8; NONCE_SIZE],
    next_index: u64,
    failed: bool,
}

impl<I> DecryptStream<I> {
    /// Index the next record must carry.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    fn open_record(&mut self, record: ChunkRecord) -> SecarcResult<PlainChunk> {
        let index = self.next_index;
        let nonce = derive_nonce(&self.base_nonce, index);

        // The stored index and nonce are redundant with the position; a
        // mismatch means the record was moved or rewritten.
        if record.index != index || record.nonce != nonce {
            return Err(SecarcError::corrupted());
        }

        let data = open(
            &self.cipher,
            &nonce,
            &record.ciphertext,
            &record.tag,
            &chunk_aad(index, record.flags),
        )?;

        self.next_index += 1;
        Ok(PlainChunk {
            index,
            is_final: record.is_final(),
            data,
        })
    }
}

impl<I> Iterator for DecryptStream<I>
where
    I: Iterator<Item = SecarcResult<ChunkRecord>>,
{
    type Item = SecarcResult<PlainChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = match self.records.next()? {
            Ok(record) => self.open_record(record),
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

impl<I> std::iter::FusedIterator for DecryptStream<I> where
    I: std::iter::FusedIterator<Item = SecarcResult<ChunkRecord>>
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::generate_dek;
    use proptest::prelude::*;

    const BASE: [u8; NONCE_SIZE] = [7u8; NONCE_SIZE];

    fn seal_all(dek: &Dek, data: &[u8], chunk_size: u32) -> Vec<ChunkRecord> {
        encrypt_stream(data, dek, BASE, 1, chunk_size)
            .collect::<SecarcResult<Vec<_>>>()
            .unwrap()
    }

    fn open_all(dek: &Dek, records: Vec<ChunkRecord>) -> SecarcResult<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in decrypt_stream(records.into_iter().map(Ok), dek, BASE, 1) {
            out.extend_from_slice(&chunk?.data);
        }
        Ok(out)
    }

    #[test]
    fn test_derive_nonce() {
        let base = [0u8; NONCE_SIZE];
        assert_eq!(derive_nonce(&base, 0), base);

        let n = derive_nonce(&base, 0x0102);
        assert_eq!(&n[..10], &[0u8; 10]);
        assert_eq!(&n[10..], &[0x01, 0x02]);

        // base nonce prefix is untouched
        let n = derive_nonce(&[0xFFu8; NONCE_SIZE], u64::MAX);
        assert_eq!(&n[..4], &[0xFF; 4]);
        assert_eq!(&n[4..], &[0u8; 8]);
    }

    #[test]
    fn test_stream_roundtrip_multi_chunk() {
        let dek = generate_dek();
        let data: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();

        let records = seal_all(&dek, &data, 4096);
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(!records[0].is_final());
        assert!(!records[1].is_final());
        assert!(records[2].is_final());
        assert_eq!(records[2].ciphertext.len(), 10_000 - 2 * 4096);

        assert_eq!(open_all(&dek, records).unwrap(), data);
    }

    #[test]
    fn test_empty_input_is_one_final_chunk() {
        let dek = generate_dek();
        let records = seal_all(&dek, b"", 4096);

        assert_eq!(records.len(), 1);
        assert!(records[0].is_final());
        assert!(records[0].ciphertext.is_empty());
        assert_eq!(open_all(&dek, records).unwrap(), b"");
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_empty_chunk() {
        let dek = generate_dek();
        let records = seal_all(&dek, &[0x55u8; 8192], 4096);

        assert_eq!(records.len(), 2);
        assert!(records[1].is_final());
        assert_eq!(records[1].ciphertext.len(), 4096);
    }

    #[test]
    fn test_next_index_continues_across_files() {
        let dek = generate_dek();
        let mut first = encrypt_stream(&b"abc"[..], &dek, BASE, 1, 2);
        let records: Vec<_> = first.by_ref().collect::<SecarcResult<_>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(first.next_index(), 3);

        let second: Vec<_> = encrypt_stream(&b"d"[..], &dek, BASE, first.next_index(), 2)
            .collect::<SecarcResult<_>>()
            .unwrap();
        assert_eq!(second[0].index, 3);
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let records = seal_all(&generate_dek(), b"secret data", 4096);
        let result = open_all(&generate_dek(), records);
        assert!(matches!(
            result,
            Err(SecarcError::WrongPasswordOrCorrupted { .. })
        ));
    }

    #[test]
    fn test_decrypt_swapped_records_fails() {
        let dek = generate_dek();
        let mut records = seal_all(&dek, &[1u8; 300], 100);
        records.swap(0, 1);
        assert!(open_all(&dek, records).is_err());
    }

    #[test]
    fn test_decrypt_tampered_ciphertext() {
        let dek = generate_dek();
        let mut records = seal_all(&dek, b"hello, encrypted world!", 4096);
        records[0].ciphertext[0] ^= 0xFF;
        assert!(open_all(&dek, records).is_err());
    }

    #[test]
    fn test_decrypt_stops_after_first_error() {
        let dek = generate_dek();
        let mut records = seal_all(&dek, &[9u8; 300], 100);
        records[0].tag[3] ^= 0x10;

        let mut stream = decrypt_stream(records.into_iter().map(Ok), &dek, BASE, 1);
        assert!(stream.next().unwrap().is_err());
        assert!(stream.next().is_none(), "stream must be fused after an error");
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dek = generate_dek();
        let record = seal_manifest(&dek, b"{\"version\":1}").unwrap();
        assert_eq!(&open_manifest(&dek, &record).unwrap()[..], b"{\"version\":1}");
    }

    #[test]
    fn test_manifest_is_not_a_chunk() {
        // A record sealed as the manifest must not open as chunk 0.
        let dek = generate_dek();
        let manifest = seal_manifest(&dek, b"data").unwrap();
        let as_chunk = ChunkRecord {
            index: 0,
            flags: FLAG_FINAL,
            nonce: manifest.nonce,
            ciphertext: manifest.ciphertext,
            tag: manifest.tag,
        };
        let result: Vec<_> = decrypt_stream([Ok(as_chunk)], &dek, manifest.nonce, 0).collect();
        assert!(result[0].is_err());
    }

    proptest! {
        #[test]
        fn mutated_index_fails(delta in 1u64..u64::MAX, which in 0usize..3) {
            let dek = generate_dek();
            let mut records = seal_all(&dek, &[0xA5u8; 250], 100);
            records[which].index = records[which].index.wrapping_add(delta);
            prop_assert!(open_all(&dek, records).is_err());
        }

        #[test]
        fn shifted_counter_fails_tag_check(delta in 1u64..u64::MAX - 8) {
            // Index and nonce agree with the shifted position, so only the
            // AEAD tag can catch it.
            let dek = generate_dek();
            let mut records = seal_all(&dek, &[0x3Cu8; 250], 100);
            for record in &mut records {
                record.index += delta;
                record.nonce = derive_nonce(&BASE, record.index);
            }

            let mut stream = decrypt_stream(records.into_iter().map(Ok), &dek, BASE, 1 + delta);
            let first = stream.next().unwrap();
            let is_wrong_pw = matches!(first, Err(SecarcError::WrongPasswordOrCorrupted { .. }));
            prop_assert!(is_wrong_pw);
            prop_assert!(stream.next().is_none());
        }

        #[test]
        fn mutated_flags_fail(bits in 1u8..=255, which in 0usize..3) {
            let dek = generate_dek();
            let mut records = seal_all(&dek, &[0x5Au8; 250], 100);
            records[which].flags ^= bits;
            prop_assert!(open_all(&dek, records).is_err());
        }

        #[test]
        fn roundtrip_any_size(
            data in proptest::collection::vec(any::<u8>(), 0..=2048),
            chunk_size in 1u32..=512,
        ) {
            let dek = generate_dek();
            let records = seal_all(&dek, &data, chunk_size);
            let expected = std::cmp::max(1, data.len().div_ceil(chunk_size as usize));
            prop_assert_eq!(records.len(), expected);
            prop_assert_eq!(open_all(&dek, records).unwrap(), data);
        }
    }
}
