//! Core type definitions shared across DVX crates

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::hash::{hash_bytes, ContentHash};
use crate::{Error, Result};

/// Identifier types
pub type CheckpointId = String;
pub type ExperimentName = String;
pub type RemoteName = String;

/// Position of a checkpoint in a training run
pub type Step = u64;

/// Flattened metric observations (`"train.loss" -> 0.12`)
pub type MetricRecord = BTreeMap<String, f64>;

/// Storage scheme of a location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Filesystem path, inside or outside the workspace
    Local,

    /// Amazon S3 or S3-compatible object storage
    S3,

    /// Remote filesystem reached over SSH
    Ssh,

    /// Hadoop distributed filesystem
    Hdfs,

    /// HDFS over its HTTP REST gateway
    WebHdfs,
}

impl Scheme {
    /// URL scheme prefix for this storage kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Local => "local",
            Scheme::S3 => "s3",
            Scheme::Ssh => "ssh",
            Scheme::Hdfs => "hdfs",
            Scheme::WebHdfs => "webhdfs",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "file" => Ok(Scheme::Local),
            "s3" => Ok(Scheme::S3),
            "ssh" => Ok(Scheme::Ssh),
            "hdfs" => Ok(Scheme::Hdfs),
            "webhdfs" => Ok(Scheme::WebHdfs),
            other => Err(Error::InvalidLocation {
                location: other.to_string(),
                reason: "unknown scheme".to_string(),
            }),
        }
    }
}

/// Kind of a tracked artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    #[default]
    File,
    Directory,
}

/// One file inside a tracked directory
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirEntry {
    /// Path relative to the tracked directory, `/`-separated
    pub relpath: String,

    /// Hash of the file content
    pub hash: ContentHash,

    /// File size in bytes
    pub size: u64,
}

/// Listing of a tracked directory, stored as its own object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirManifest {
    pub entries: Vec<DirEntry>,
}

impl DirManifest {
    /// Build a manifest with entries in canonical (path) order
    pub fn new(mut entries: Vec<DirEntry>) -> Self {
        entries.sort_by(|a, b| a.relpath.cmp(&b.relpath));
        Self { entries }
    }

    /// Canonical serialized form; the manifest hash is taken over these bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.entries)?)
    }

    /// Parse a manifest object
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let entries: Vec<DirEntry> = serde_json::from_slice(data)?;
        Ok(Self::new(entries))
    }

    /// Directory hash (manifest digest with the `.dir` marker)
    pub fn hash(&self) -> Result<ContentHash> {
        Ok(hash_bytes(&self.to_bytes()?).into_dir())
    }

    /// Total bytes of all files in the directory
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// Change of one metric between two records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDiff {
    /// Dotted metric key
    pub key: String,

    /// Value in the older record
    pub old: Option<f64>,

    /// Value in the newer record
    pub new: Option<f64>,

    /// `new - old` when both sides are present
    pub change: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_parsing() {
        assert_eq!("S3".parse::<Scheme>().unwrap(), Scheme::S3);
        assert_eq!("file".parse::<Scheme>().unwrap(), Scheme::Local);
        assert_eq!(Scheme::WebHdfs.to_string(), "webhdfs");
        assert!("ftp".parse::<Scheme>().is_err());
    }

    #[test]
    fn test_dir_manifest_hash_is_order_independent() {
        let a = DirEntry {
            relpath: "a.txt".to_string(),
            hash: hash_bytes(b"a"),
            size: 1,
        };
        let b = DirEntry {
            relpath: "sub/b.txt".to_string(),
            hash: hash_bytes(b"b"),
            size: 1,
        };

        let m1 = DirManifest::new(vec![a.clone(), b.clone()]);
        let m2 = DirManifest::new(vec![b, a]);
        assert_eq!(m1.hash().unwrap(), m2.hash().unwrap());
        assert!(m1.hash().unwrap().is_dir());
        assert_eq!(m1.total_size(), 2);

        let parsed = DirManifest::from_bytes(&m1.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, m1);
    }
}
