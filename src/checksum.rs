// src/checksum.rs
//
// Algorithm-tagged checksums and incremental hashers.
//
// Each backend reports integrity data in its own flavour:
// - GCS: crc32c, base64 of the big-endian u32
// - Azure / HTTP Content-MD5: md5, base64 of the digest
// - HTTP ETag: hex md5 (single-part uploads only)
// Comparisons are only meaningful between checksums of the same algorithm.

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Crc32c,
    Md5,
    ETag,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Crc32c => "crc32c",
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::ETag => "etag",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A digest string tagged with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub value: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, value: impl Into<String>) -> Self {
        Self { algorithm, value: value.into() }
    }

    pub fn crc32c(value: impl Into<String>) -> Self {
        Self::new(ChecksumAlgorithm::Crc32c, value)
    }

    pub fn md5(value: impl Into<String>) -> Self {
        Self::new(ChecksumAlgorithm::Md5, value)
    }

    /// Build an ETag checksum from a raw header value.
    ///
    /// Returns `None` for weak or multipart ETags, which are not content digests.
    pub fn from_etag(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.starts_with("W/") {
            return None;
        }
        let value = raw.trim_matches('"').to_ascii_lowercase();
        if value.len() != 32 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self::new(ChecksumAlgorithm::ETag, value))
    }

    /// Compute a checksum over an in-memory buffer.
    pub fn of(algorithm: ChecksumAlgorithm, data: &[u8]) -> Self {
        let mut hasher = ChecksumHasher::new(algorithm);
        hasher.update(data);
        hasher.finalize()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

impl FromStr for Checksum {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (alg, value) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("checksum must look like <algorithm>:<value>, got {}", s))?;
        let algorithm = match alg {
            "crc32c" => ChecksumAlgorithm::Crc32c,
            "md5" => ChecksumAlgorithm::Md5,
            "etag" => ChecksumAlgorithm::ETag,
            other => anyhow::bail!("unknown checksum algorithm: {}", other),
        };
        Ok(Checksum::new(algorithm, value))
    }
}

enum HasherState {
    Crc32c(u32),
    Md5(md5::Context),
}

/// Incremental hasher fed part by part during a transfer.
pub struct ChecksumHasher {
    algorithm: ChecksumAlgorithm,
    state: HasherState,
}

impl ChecksumHasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        let state = match algorithm {
            ChecksumAlgorithm::Crc32c => HasherState::Crc32c(0),
            ChecksumAlgorithm::Md5 | ChecksumAlgorithm::ETag => HasherState::Md5(md5::Context::new()),
        };
        Self { algorithm, state }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Crc32c(crc) => *crc = crc32c::crc32c_append(*crc, data),
            HasherState::Md5(ctx) => ctx.consume(data),
        }
    }

    pub fn finalize(self) -> Checksum {
        let value = match (self.algorithm, self.state) {
            (_, HasherState::Crc32c(crc)) => STANDARD.encode(crc.to_be_bytes()),
            (ChecksumAlgorithm::ETag, HasherState::Md5(ctx)) => format!("{:x}", ctx.compute()),
            (_, HasherState::Md5(ctx)) => STANDARD.encode(ctx.compute().0),
        };
        Checksum::new(self.algorithm, value)
    }
}
