//! Merkle root hashes over chunked payloads.
//!
//! The tree is 64 levels deep and filled left to right with the SHA1
//! hashes of fixed-size chunks (the last chunk may be short). Missing
//! leaves are all-zero hashes, as are internal nodes with two missing
//! children. Only one remembered hash per level is needed: inserting a
//! chunk hash walks up the levels, merging with the remembered left
//! sibling until it finds an empty slot.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha1::{Digest, Sha1};

use crate::error::MetaError;

/// Depth of the emulated hash tree.
const MERKLE_LEVELS: usize = 64;
/// Hash size in bytes.
const HASH_LEN: usize = 20;
/// The padding hash for absent subtrees.
const ZERO_HASH: [u8; HASH_LEN] = [0; HASH_LEN];

fn hash_pair(left: &[u8; HASH_LEN], right: &[u8; HASH_LEN]) -> [u8; HASH_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Incremental root hash calculation.
pub struct RootHashBuilder {
    levels: Vec<Option<[u8; HASH_LEN]>>,
}

impl RootHashBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            levels: vec![None; MERKLE_LEVELS],
        }
    }

    /// Insert the next chunk of payload, left to right.
    pub fn push_chunk(&mut self, chunk: &[u8]) {
        let mut hash: [u8; HASH_LEN] = Sha1::digest(chunk).into();
        for slot in &mut self.levels {
            match slot.take() {
                None => {
                    *slot = Some(hash);
                    return;
                }
                Some(left) => {
                    hash = hash_pair(&left, &hash);
                }
            }
        }
    }

    /// Combine the remembered hashes into the root, padding with zero
    /// hashes on the right.
    #[must_use]
    pub fn finish(self) -> [u8; HASH_LEN] {
        let Some(lowest) = self.levels.iter().position(Option::is_some) else {
            return ZERO_HASH;
        };
        let top = MERKLE_LEVELS.saturating_sub(1);
        if lowest == top {
            return self
                .levels
                .last()
                .copied()
                .flatten()
                .unwrap_or(ZERO_HASH);
        }
        let mut hash = ZERO_HASH;
        for slot in self.levels.iter().skip(lowest).take(top.saturating_sub(lowest)) {
            hash = match slot {
                Some(left) => hash_pair(left, &hash),
                None => hash_pair(&hash, &ZERO_HASH),
            };
        }
        hash
    }
}

impl Default for RootHashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Root hash of an in-memory payload.
///
/// # Errors
///
/// Returns [`MetaError::PieceLengthZero`] when `chunk_size` is zero.
pub fn root_hash_of_bytes(data: &[u8], chunk_size: u64) -> Result<String, MetaError> {
    let chunk_size = usize::try_from(chunk_size).map_err(|_| MetaError::PieceLengthZero)?;
    if chunk_size == 0 {
        return Err(MetaError::PieceLengthZero);
    }
    let mut builder = RootHashBuilder::new();
    for chunk in data.chunks(chunk_size) {
        builder.push_chunk(chunk);
    }
    Ok(to_hex(&builder.finish()))
}

/// Root hash of a file on disk, read in `chunk_size` pieces.
///
/// # Errors
///
/// Returns [`MetaError::PieceLengthZero`] for a zero chunk size and
/// [`MetaError::ReadFile`] on I/O errors.
pub fn root_hash_of_file(path: &Path, chunk_size: u64) -> Result<String, MetaError> {
    let chunk_size = usize::try_from(chunk_size).map_err(|_| MetaError::PieceLengthZero)?;
    if chunk_size == 0 {
        return Err(MetaError::PieceLengthZero);
    }
    let mut file = File::open(path).map_err(|source| MetaError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let mut builder = RootHashBuilder::new();
    let mut buffer = vec![0_u8; chunk_size];
    loop {
        let mut filled = 0;
        while filled < chunk_size {
            let read = file
                .read(buffer.get_mut(filled..).unwrap_or(&mut []))
                .map_err(|source| MetaError::ReadFile {
                    path: path.to_path_buf(),
                    source,
                })?;
            if read == 0 {
                break;
            }
            filled = filled.saturating_add(read);
        }
        if filled == 0 {
            break;
        }
        builder.push_chunk(buffer.get(..filled).unwrap_or(&[]));
        if filled < chunk_size {
            break;
        }
    }
    Ok(to_hex(&builder.finish()))
}

/// Validate the textual form of a root hash: 40 hex digits.
#[must_use]
pub fn is_root_hash(value: &str) -> bool {
    value.len() == HASH_LEN.saturating_mul(2) && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn to_hex(hash: &[u8; HASH_LEN]) -> String {
    hash.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, AppResult};

    const TEST_CHUNK: u64 = 1024;

    #[test]
    fn empty_payload_has_zero_root() -> AppResult<()> {
        let hex = root_hash_of_bytes(&[], TEST_CHUNK)?;
        if hex != "0".repeat(40) {
            return Err(AppError::meta("Empty payload should hash to zero"));
        }
        Ok(())
    }

    #[test]
    fn root_is_deterministic_and_content_sensitive() -> AppResult<()> {
        let payload_a = vec![7_u8; 3000];
        let payload_b = vec![8_u8; 3000];
        let first = root_hash_of_bytes(&payload_a, TEST_CHUNK)?;
        let second = root_hash_of_bytes(&payload_a, TEST_CHUNK)?;
        let other = root_hash_of_bytes(&payload_b, TEST_CHUNK)?;
        if first != second {
            return Err(AppError::meta("Same payload must give same root"));
        }
        if first == other {
            return Err(AppError::meta("Different payloads must differ"));
        }
        if !is_root_hash(&first) {
            return Err(AppError::meta("Root hash must be 40 hex digits"));
        }
        Ok(())
    }

    #[test]
    fn single_chunk_root_combines_with_zero() -> AppResult<()> {
        // One chunk: level 0 holds its hash, every level up pairs with zero.
        let payload = vec![1_u8; 1024];
        let leaf: [u8; HASH_LEN] = Sha1::digest(&payload).into();
        let mut expected = hash_pair(&leaf, &ZERO_HASH);
        for _ in 1..63 {
            expected = hash_pair(&expected, &ZERO_HASH);
        }
        let hex = root_hash_of_bytes(&payload, TEST_CHUNK)?;
        if hex != to_hex(&expected) {
            return Err(AppError::meta("Single-chunk root mismatch"));
        }
        Ok(())
    }

    #[test]
    fn file_and_bytes_agree() -> AppResult<()> {
        let dir = tempfile::tempdir()
            .map_err(|err| AppError::meta(format!("tempdir failed: {}", err)))?;
        let path = dir.path().join("payload.bin");
        let payload: Vec<u8> = (0_u32..700).flat_map(u32::to_be_bytes).collect();
        std::fs::write(&path, &payload)
            .map_err(|err| AppError::meta(format!("write failed: {}", err)))?;
        let from_file = root_hash_of_file(&path, TEST_CHUNK)?;
        let from_bytes = root_hash_of_bytes(&payload, TEST_CHUNK)?;
        if from_file != from_bytes {
            return Err(AppError::meta("File and byte hashing disagree"));
        }
        Ok(())
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(matches!(
            root_hash_of_bytes(&[1, 2, 3], 0),
            Err(MetaError::PieceLengthZero)
        ));
    }

    #[test]
    fn validates_hash_syntax() {
        assert!(is_root_hash(&"a".repeat(40)));
        assert!(!is_root_hash(&"a".repeat(39)));
        assert!(!is_root_hash(&"g".repeat(40)));
    }
}
