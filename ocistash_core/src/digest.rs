//! Content digests in the OCI `<algorithm>:<hex>` form.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Algorithm {
    /// SHA-256, the canonical OCI algorithm.
    #[default]
    Sha256,
    /// SHA-512.
    Sha512,
}

impl Algorithm {
    /// Returns the string representation used in digests and blob paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Parse algorithm from string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            _ => Err(Error::unsupported_algorithm(s)),
        }
    }

    /// Length of the hex-encoded digest.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

/// A content digest, e.g. `sha256:2cf24dba...`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(s: &str) -> Result<Self> {
        let (algo, hex_str) = s
            .split_once(':')
            .ok_or_else(|| Error::invalid_digest(format!("{s:?} is missing the algorithm prefix")))?;
        let algorithm = Algorithm::parse(algo)?;

        if hex_str.len() != algorithm.hex_len() {
            return Err(Error::invalid_digest(format!(
                "Expected {} hex characters for {}, got {}",
                algorithm.hex_len(),
                algorithm.as_str(),
                hex_str.len()
            )));
        }
        if !hex_str
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(Error::invalid_digest(format!(
                "{hex_str:?} is not lowercase hex"
            )));
        }

        Ok(Self {
            algorithm,
            hex: hex_str.to_string(),
        })
    }

    /// Hash raw bytes with the given algorithm.
    pub fn from_bytes(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut digester = Digester::new(algorithm);
        digester.update(data);
        digester.finish()
    }

    /// Hash raw bytes with SHA-256.
    pub fn sha256(data: &[u8]) -> Self {
        Self::from_bytes(Algorithm::Sha256, data)
    }

    /// Hash everything a reader yields.
    pub fn from_reader<R: Read>(algorithm: Algorithm, mut reader: R) -> Result<Self> {
        let mut digester = Digester::new(algorithm);
        io::copy(&mut reader, &mut digester)?;
        Ok(digester.finish())
    }

    /// The algorithm component.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The hex component.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Get the first 2 hex characters (for directory sharding).
    pub fn prefix(&self) -> &str {
        &self.hex[..2]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// A write sink that hashes and counts everything written to it.
pub struct Digester {
    algorithm: Algorithm,
    hasher: Hasher,
    written: u64,
}

impl Digester {
    pub fn new(algorithm: Algorithm) -> Self {
        let hasher = match algorithm {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        };
        Self {
            algorithm,
            hasher,
            written: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
        self.written += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(self) -> Digest {
        let hex = match self.hasher {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        };
        Digest {
            algorithm: self.algorithm,
            hex,
        }
    }

    /// Finish and compare against the expected digest and size.
    pub fn verify(self, expected: &Digest, expected_size: Option<u64>) -> Result<()> {
        let written = self.written;
        let actual = self.finish();
        if actual != *expected {
            return Err(Error::digest_mismatch(expected.to_string(), actual.to_string()));
        }
        if let Some(size) = expected_size
            && size != written
        {
            return Err(Error::SizeMismatch {
                digest: expected.to_string(),
                expected: size,
                actual: written,
            });
        }
        Ok(())
    }
}

impl Write for Digester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
