//! SHA-256 content hashing for the object cache

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::{Error, Result};

/// Suffix marking a hash that addresses a directory manifest
pub const DIR_SUFFIX: &str = ".dir";

/// Length of a hex-encoded SHA-256 digest
const HEX_LEN: usize = 64;

/// Read buffer for streaming file hashes
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Content-addressed identifier for a cached object
///
/// File objects are addressed by the SHA-256 of their bytes. Directory
/// objects are addressed by the SHA-256 of their manifest and carry the
/// `.dir` suffix so the cache knows to follow their children.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash {
    hex: String,
    dir: bool,
}

impl ContentHash {
    /// Build a file hash from a raw digest
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self {
            hex: hex::encode(digest),
            dir: false,
        }
    }

    /// Parse a hash from its textual form (`<hex>` or `<hex>.dir`)
    pub fn parse(value: &str) -> Result<Self> {
        let (hex_part, dir) = match value.strip_suffix(DIR_SUFFIX) {
            Some(stripped) => (stripped, true),
            None => (value, false),
        };

        if hex_part.len() != HEX_LEN || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidHash {
                value: value.to_string(),
            });
        }

        Ok(Self {
            hex: hex_part.to_ascii_lowercase(),
            dir,
        })
    }

    /// Mark this hash as addressing a directory manifest
    pub fn into_dir(mut self) -> Self {
        self.dir = true;
        self
    }

    /// Hex digest without the directory suffix
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Whether this hash addresses a directory manifest
    pub fn is_dir(&self) -> bool {
        self.dir
    }

    /// Abbreviated form used in listings
    pub fn short(&self) -> &str {
        &self.hex[..7]
    }

    /// Relative object path with a two-character fan-out directory
    pub fn object_path(&self) -> String {
        let suffix = if self.dir { DIR_SUFFIX } else { "" };
        format!("{}/{}{}", &self.hex[..2], &self.hex[2..], suffix)
    }

    /// Reverse of [`ContentHash::object_path`]
    pub fn from_object_path(path: &str) -> Option<Self> {
        let mut parts = path.trim_start_matches('/').splitn(2, '/');
        let prefix = parts.next()?;
        let rest = parts.next()?;
        if prefix.len() != 2 {
            return None;
        }
        Self::parse(&format!("{}{}", prefix, rest)).ok()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dir {
            write!(f, "{}{}", self.hex, DIR_SUFFIX)
        } else {
            write!(f, "{}", self.hex)
        }
    }
}

impl TryFrom<String> for ContentHash {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_string()
    }
}

/// Hash an in-memory buffer
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    ContentHash::from_digest(Sha256::digest(data).into())
}

/// Hash everything a reader yields
pub fn hash_reader<R: Read>(mut reader: R) -> Result<(ContentHash, u64)> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }

    Ok((ContentHash::from_digest(hasher.finalize().into()), size))
}

/// Hash a file on disk without loading it into memory
pub fn hash_file(path: &Path) -> Result<ContentHash> {
    let file = File::open(path)?;
    let (hash, _) = hash_reader(BufReader::new(file))?;
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // sha256("hello")
    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_hash_bytes_known_vector() {
        assert_eq!(hash_bytes(b"hello").to_string(), HELLO);
    }

    #[test]
    fn test_hash_file_matches_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        assert_eq!(hash_file(file.path()).unwrap(), hash_bytes(b"hello"));
    }

    #[test]
    fn test_parse_and_dir_suffix() {
        let hash = ContentHash::parse(&format!("{}.dir", HELLO.to_uppercase())).unwrap();
        assert!(hash.is_dir());
        assert_eq!(hash.hex(), HELLO);
        assert_eq!(hash.to_string(), format!("{}.dir", HELLO));
        assert_eq!(hash.short(), "2cf24db");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ContentHash::parse("abc").is_err());
        assert!(ContentHash::parse(&"z".repeat(64)).is_err());
    }

    #[test]
    fn test_object_path_fan_out() {
        let hash = hash_bytes(b"hello");
        let path = hash.object_path();
        assert_eq!(path, format!("2c/{}", &HELLO[2..]));
        assert_eq!(ContentHash::from_object_path(&path), Some(hash.clone()));

        let dir = hash.into_dir();
        assert!(dir.object_path().ends_with(".dir"));
        assert_eq!(ContentHash::from_object_path(&dir.object_path()), Some(dir));
    }

    #[test]
    fn test_serde_uses_string_form() {
        let hash = hash_bytes(b"hello").into_dir();
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}.dir\"", HELLO));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
