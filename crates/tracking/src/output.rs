//! Tracked artifacts and `.dvx` tracking files

use std::path::{Component, Path, PathBuf};

use dvx_core::{ArtifactKind, ContentHash, Error, Result};
use serde::{Deserialize, Serialize};
use storage::Location;
use tracing::debug;

/// Suffix of tracking files written next to tracked targets
pub const TRACKING_SUFFIX: &str = ".dvx";

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_file(kind: &ArtifactKind) -> bool {
    *kind == ArtifactKind::File
}

/// A tracked output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    /// Workspace-relative path (`/`-separated), absolute path or URL
    pub path: String,

    /// Content hash of the last committed version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,

    /// Size in bytes of the last committed version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default, skip_serializing_if = "is_file")]
    pub kind: ArtifactKind,

    /// Store the content in the object cache
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub cache: bool,

    /// Snapshotted on every checkpoint of an experiment
    #[serde(default, skip_serializing_if = "is_false")]
    pub checkpoint: bool,

    /// Left in place before the producing command runs
    #[serde(default, skip_serializing_if = "is_false")]
    pub persist: bool,
}

impl Output {
    /// A not yet committed output
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            hash: None,
            size: None,
            kind: ArtifactKind::File,
            cache: true,
            checkpoint: false,
            persist: false,
        }
    }

    /// Whether the output lives outside the workspace rooted at `root`
    ///
    /// URLs are always external; absolute paths are external unless they
    /// point inside the workspace.
    pub fn is_external(&self, root: &Path) -> bool {
        match Location::parse(&self.path) {
            Ok(Location::Local(path)) => path.is_absolute() && !path.starts_with(root),
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Storage location of the output
    pub fn location(&self, root: &Path) -> Result<Location> {
        match Location::parse(&self.path)? {
            Location::Local(path) if path.is_relative() => Ok(Location::Local(root.join(path))),
            location => Ok(location),
        }
    }

    /// Path of a workspace output on disk
    pub fn workspace_path(&self, root: &Path) -> PathBuf {
        root.join(&self.path)
    }

    /// Whether the output has been committed
    pub fn is_committed(&self) -> bool {
        self.hash.is_some()
    }
}

/// A tracked dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Workspace-relative path, absolute path or URL
    pub path: String,

    /// Content hash when the dependency was last recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,
}

/// Contents of a `<target>.dvx` file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingFile {
    #[serde(default)]
    pub outs: Vec<Output>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<Dependency>,
}

impl TrackingFile {
    /// Tracking file for a single output
    pub fn for_output(output: Output) -> Self {
        Self {
            outs: vec![output],
            deps: Vec::new(),
        }
    }

    /// Tracking file path for a target (`data/raw.csv` -> `data/raw.csv.dvx`)
    pub fn path_for(target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(TRACKING_SUFFIX);
        target.with_file_name(name)
    }

    /// Whether a path names a tracking file
    pub fn is_tracking_file(path: &Path) -> bool {
        path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.len() > TRACKING_SUFFIX.len() && n.ends_with(TRACKING_SUFFIX))
                .unwrap_or(false)
    }

    /// Load a tracking file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotTracked {
                target: path.display().to_string(),
            },
            _ => Error::Io(e),
        })?;
        Ok(serde_yaml::from_slice(&data)?)
    }

    /// Write the tracking file
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        std::fs::write(path, data)?;
        debug!(path = %path.display(), "Wrote tracking file");
        Ok(())
    }
}

/// Normalize a workspace-relative path to `/`-separated form
///
/// Rejects paths that escape the workspace.
pub fn normalize_relative(path: &Path) -> Result<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(Error::InvalidTarget {
                        target: path.display().to_string(),
                        reason: "path escapes the workspace".to_string(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidTarget {
                    target: path.display().to_string(),
                    reason: "expected a relative path".to_string(),
                })
            }
        }
    }
    if parts.is_empty() {
        return Err(Error::InvalidTarget {
            target: path.display().to_string(),
            reason: "empty path".to_string(),
        });
    }
    Ok(parts.join("/"))
}
