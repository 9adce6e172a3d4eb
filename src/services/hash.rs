use image_hasher::{HashAlg, HasherConfig, ImageHash};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// Version tag prefixing every stored perceptual hash. Bumped whenever the
/// algorithm or hash size changes, so stale hashes are never compared against
/// fresh ones.
pub const PERCEPTUAL_HASH_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum HashError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid perceptual hash encoding: {value}")]
    InvalidPerceptualHash { value: String },

    #[error("Perceptual hash version mismatch: {left} vs {right}")]
    VersionMismatch { left: String, right: String },
}

/// Injected hashing dependency for the backfill worker.
pub trait ContentHasher: Send + Sync {
    /// Cryptographic digest over the file bytes; exact-duplicate identity.
    fn compute_content_hash(&self, path: &Path) -> Result<String, HashError>;

    /// Perceptual hash for images; `Ok(None)` for media the hasher cannot
    /// decode (videos, raw formats). Absence is tolerated downstream.
    fn compute_perceptual_hash(&self, path: &Path) -> Result<Option<String>, HashError>;
}

/// Default hasher: streamed SHA-256 content hash plus a 64-bit gradient
/// perceptual hash.
pub struct FileHasher;

impl FileHasher {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FileHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher for FileHasher {
    fn compute_content_hash(&self, path: &Path) -> Result<String, HashError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();
        let mut buffer = [0; 8192]; // 8KB buffer for efficient reading

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        let result = hasher.finalize();
        Ok(format!("{:x}", result))
    }

    fn compute_perceptual_hash(&self, path: &Path) -> Result<Option<String>, HashError> {
        // An unreadable file is a transient error; a file the decoder does
        // not understand is simply not an image.
        let reader = match image::ImageReader::open(path) {
            Ok(reader) => reader,
            Err(e) => return Err(HashError::Io(e)),
        };
        let img = match reader.decode() {
            Ok(img) => img,
            Err(_) => return Ok(None),
        };

        let hasher = HasherConfig::new().hash_alg(HashAlg::Gradient).to_hasher();
        let hash = hasher.hash_image(&img);
        Ok(Some(format!(
            "{}:{}",
            PERCEPTUAL_HASH_VERSION,
            hash.to_base64()
        )))
    }
}

fn decode(tagged: &str) -> Result<(&str, ImageHash<Box<[u8]>>), HashError> {
    let (version, encoded) =
        tagged
            .split_once(':')
            .ok_or_else(|| HashError::InvalidPerceptualHash {
                value: tagged.to_string(),
            })?;
    let hash =
        ImageHash::from_base64(encoded).map_err(|_| HashError::InvalidPerceptualHash {
            value: tagged.to_string(),
        })?;
    Ok((version, hash))
}

/// Hamming distance between two version-tagged perceptual hashes, plus the
/// bit length they were compared over.
pub fn hamming_distance(left: &str, right: &str) -> Result<(u32, u32), HashError> {
    let (left_version, left_hash) = decode(left)?;
    let (right_version, right_hash) = decode(right)?;

    if left_version != right_version {
        return Err(HashError::VersionMismatch {
            left: left_version.to_string(),
            right: right_version.to_string(),
        });
    }

    let left_bytes = left_hash.as_bytes();
    let right_bytes = right_hash.as_bytes();
    if left_bytes.len() != right_bytes.len() {
        return Err(HashError::InvalidPerceptualHash {
            value: right.to_string(),
        });
    }

    let distance = left_hash.dist(&right_hash);
    Ok((distance, (left_bytes.len() * 8) as u32))
}

/// Raw hash bytes without the version tag, for bucketing.
pub fn perceptual_hash_bytes(tagged: &str) -> Result<Vec<u8>, HashError> {
    let (_, hash) = decode(tagged)?;
    Ok(hash.as_bytes().to_vec())
}
