//! Content digests (`<algorithm>:<hex>`) and the storage paths derived from them.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use camino::Utf8PathBuf;
use regex::Regex;
use sha2::{Digest as _, Sha256};

static DIGEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-zA-Z0-9=_-]+$").expect("digest pattern")
});

/// The only algorithm this registry computes.
pub const SHA256: &str = "sha256";

/// An algorithm-prefixed content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

/// Why a string is not a usable digest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    /// Not of the form `algorithm:encoded`.
    #[error("malformed digest: {0}")]
    Malformed(String),

    /// Well-formed, but not an algorithm we can verify.
    #[error("unsupported digest algorithm: {0}")]
    Unsupported(String),
}

impl Digest {
    /// Digest of `data` with SHA-256.
    pub fn sha256(data: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    /// Finish a running SHA-256 hash.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self {
            algorithm: SHA256.to_owned(),
            hex: hex::encode(hasher.finalize()),
        }
    }

    /// The algorithm name, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The lower-case hex encoding.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Where the committed blob with this digest lives in object storage.
    ///
    /// `blobs/<algo>/<h0h1>/<h2h3>/<h4h5>/<hex>`
    pub fn blob_path(&self) -> Utf8PathBuf {
        let mut path = Utf8PathBuf::from("blobs");
        path.push(&self.algorithm);
        for chunk in 0..3 {
            path.push(&self.hex[chunk * 2..chunk * 2 + 2]);
        }
        path.push(&self.hex);
        path
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if !DIGEST.is_match(value) {
            return Err(DigestError::Malformed(value.to_owned()));
        }
        let (algorithm, hex) = value
            .split_once(':')
            .ok_or_else(|| DigestError::Malformed(value.to_owned()))?;

        if algorithm != SHA256 {
            return Err(DigestError::Unsupported(algorithm.to_owned()));
        }
        if hex.len() != 64 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(DigestError::Malformed(value.to_owned()));
        }

        Ok(Self {
            algorithm: algorithm.to_owned(),
            hex: hex.to_owned(),
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn hashes_bytes() {
        assert_eq!(Digest::sha256(b"hello").to_string(), HELLO);
    }

    #[test]
    fn parses_and_splits_path() {
        let digest: Digest = HELLO.parse().unwrap();
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(
            digest.blob_path().as_str(),
            "blobs/sha256/2c/f2/4d/2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(
            "sha256".parse::<Digest>(),
            Err(DigestError::Malformed(_))
        ));
        assert!(matches!(
            "sha256:abc".parse::<Digest>(),
            Err(DigestError::Malformed(_))
        ));
        assert!(matches!(
            "md5:abcdef".parse::<Digest>(),
            Err(DigestError::Unsupported(_))
        ));
    }
}
