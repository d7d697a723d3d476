//! Checksum verification oracle.
//!
//! Hashing a multi-gigabyte file is CPU and disk bound, so it runs on a
//! blocking worker thread and reports back through the manager's mailbox.
//! Algorithm detection by digest length mirrors what users paste from
//! release pages (no algorithm named, just a hex string).

use std::path::Path;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::io::Read;
use tracing::debug;

/// Hash read buffer (1 MiB).
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Canonical display name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    /// Parses a user-supplied algorithm name (case-insensitive). Returns
    /// `None` for anything unsupported.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_uppercase().as_str() {
            "MD5" => Some(Self::Md5),
            "SHA1" | "SHA-1" => Some(Self::Sha1),
            "SHA256" | "SHA-256" => Some(Self::Sha256),
            "SHA512" | "SHA-512" => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Detects the algorithm from the hex digest length.
    #[must_use]
    pub fn detect(expected: &str) -> Option<Self> {
        match normalize_checksum(expected).len() {
            32 => Some(Self::Md5),
            40 => Some(Self::Sha1),
            64 => Some(Self::Sha256),
            128 => Some(Self::Sha512),
            _ => None,
        }
    }
}

/// Verification lifecycle of a task's checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumState {
    /// No checksum configured.
    #[default]
    None,
    /// An expected digest is set but not yet verified.
    Pending,
    /// Hashing is in progress.
    Verifying,
    /// Digest matched the expectation.
    Ok,
    /// Digest did not match the expectation.
    Mismatch,
    /// Digest computed with no expectation to compare against.
    Computed,
    /// The file could not be hashed.
    Failed,
    /// The configured algorithm is not supported.
    Unknown,
}

impl ChecksumState {
    /// Stable string form (persisted and surfaced).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Pending => "Pending",
            Self::Verifying => "Verifying",
            Self::Ok => "OK",
            Self::Mismatch => "Mismatch",
            Self::Computed => "Computed",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }
}

/// Lowercases and strips whitespace from a pasted digest.
#[must_use]
pub fn normalize_checksum(value: &str) -> String {
    value
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

/// Hashes `path` with `algorithm`, returning the lowercase hex digest.
///
/// Blocking; call from `spawn_blocking`.
pub fn hash_file_sync(path: &Path, algorithm: ChecksumAlgorithm) -> std::io::Result<String> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    fn drive<D: Digest>(
        reader: &mut impl Read,
        buffer: &mut [u8],
    ) -> std::io::Result<String> {
        let mut hasher = D::new();
        loop {
            let n = reader.read(buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hex_digest(&hasher.finalize()))
    }

    let digest = match algorithm {
        ChecksumAlgorithm::Md5 => drive::<Md5>(&mut reader, &mut buffer)?,
        ChecksumAlgorithm::Sha1 => drive::<Sha1>(&mut reader, &mut buffer)?,
        ChecksumAlgorithm::Sha256 => drive::<Sha256>(&mut reader, &mut buffer)?,
        ChecksumAlgorithm::Sha512 => drive::<Sha512>(&mut reader, &mut buffer)?,
    };
    debug!(path = %path.display(), algorithm = algorithm.as_str(), "hash complete");
    Ok(digest)
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
