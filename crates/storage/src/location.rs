//! Storage locations
//!
//! Parses the URLs used for remotes, external caches and external outputs
//! (`s3://bucket/key`, `ssh://user@host:22/path`, `hdfs://..`,
//! `webhdfs://..`, `file:///abs` or plain paths).

use std::fmt;
use std::path::{Path, PathBuf};

use dvx_core::{Error, Result, Scheme};

/// A parsed storage location
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    /// Filesystem path
    Local(PathBuf),

    /// Object in an S3 bucket
    S3 { bucket: String, key: String },

    /// Path on a host reached through a network protocol
    Host {
        scheme: Scheme,
        user: Option<String>,
        host: String,
        port: Option<u16>,
        path: String,
    },
}

impl Location {
    /// Parse a URL or plain filesystem path
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(invalid(input, "empty location"));
        }

        let Some((scheme, rest)) = input.split_once("://") else {
            return Ok(Location::Local(PathBuf::from(input)));
        };

        match scheme.parse::<Scheme>().map_err(|_| invalid(input, "unknown scheme"))? {
            Scheme::Local => {
                if rest.is_empty() {
                    return Err(invalid(input, "missing path"));
                }
                Ok(Location::Local(PathBuf::from(rest)))
            }
            Scheme::S3 => {
                let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(invalid(input, "missing bucket"));
                }
                Ok(Location::S3 {
                    bucket: bucket.to_string(),
                    key: key.trim_matches('/').to_string(),
                })
            }
            scheme => {
                let (authority, path) = match rest.find('/') {
                    Some(idx) => (&rest[..idx], &rest[idx..]),
                    None => (rest, "/"),
                };
                let (user, host_port) = match authority.rsplit_once('@') {
                    Some((user, host_port)) => (Some(user.to_string()), host_port),
                    None => (None, authority),
                };
                let (host, port) = match host_port.rsplit_once(':') {
                    Some((host, port)) => {
                        let port = port
                            .parse::<u16>()
                            .map_err(|_| invalid(input, "invalid port"))?;
                        (host, Some(port))
                    }
                    None => (host_port, None),
                };
                if host.is_empty() {
                    return Err(invalid(input, "missing host"));
                }
                Ok(Location::Host {
                    scheme,
                    user,
                    host: host.to_string(),
                    port,
                    path: path.to_string(),
                })
            }
        }
    }

    /// Storage scheme of this location
    pub fn scheme(&self) -> Scheme {
        match self {
            Location::Local(_) => Scheme::Local,
            Location::S3 { .. } => Scheme::S3,
            Location::Host { scheme, .. } => *scheme,
        }
    }

    /// Whether this location lives on another machine
    pub fn is_remote(&self) -> bool {
        !matches!(self, Location::Local(_))
    }

    /// Location of a child path
    pub fn join(&self, relative: &str) -> Location {
        let relative = relative.trim_matches('/');
        match self {
            Location::Local(path) => Location::Local(path.join(relative)),
            Location::S3 { bucket, key } => Location::S3 {
                bucket: bucket.clone(),
                key: join_key(key, relative),
            },
            Location::Host {
                scheme,
                user,
                host,
                port,
                path,
            } => Location::Host {
                scheme: *scheme,
                user: user.clone(),
                host: host.clone(),
                port: *port,
                path: format!("/{}", join_key(path.trim_matches('/'), relative)),
            },
        }
    }

    /// Last path segment
    pub fn file_name(&self) -> Option<String> {
        match self {
            Location::Local(path) => path.file_name().map(|n| n.to_string_lossy().to_string()),
            Location::S3 { key, .. } => last_segment(key),
            Location::Host { path, .. } => last_segment(path),
        }
    }

    /// Split into a backend root and the object path within it
    ///
    /// A local file splits into its parent directory and file name; remote
    /// locations split into their bucket/host root and the full key.
    pub fn split_root(&self) -> (Location, String) {
        match self {
            Location::Local(path) => {
                let parent = path.parent().unwrap_or_else(|| Path::new("/"));
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                (Location::Local(parent.to_path_buf()), name)
            }
            Location::S3 { bucket, key } => (
                Location::S3 {
                    bucket: bucket.clone(),
                    key: String::new(),
                },
                key.clone(),
            ),
            Location::Host {
                scheme,
                user,
                host,
                port,
                path,
            } => (
                Location::Host {
                    scheme: *scheme,
                    user: user.clone(),
                    host: host.clone(),
                    port: *port,
                    path: "/".to_string(),
                },
                path.trim_start_matches('/').to_string(),
            ),
        }
    }

    /// Filesystem path for local locations
    pub fn as_local_path(&self) -> Option<&Path> {
        match self {
            Location::Local(path) => Some(path),
            _ => None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::S3 { bucket, key } if key.is_empty() => write!(f, "s3://{}", bucket),
            Location::S3 { bucket, key } => write!(f, "s3://{}/{}", bucket, key),
            Location::Host {
                scheme,
                user,
                host,
                port,
                path,
            } => {
                write!(f, "{}://", scheme)?;
                if let Some(user) = user {
                    write!(f, "{}@", user)?;
                }
                write!(f, "{}", host)?;
                if let Some(port) = port {
                    write!(f, ":{}", port)?;
                }
                write!(f, "{}", path)
            }
        }
    }
}

fn join_key(base: &str, relative: &str) -> String {
    match (base.is_empty(), relative.is_empty()) {
        (true, _) => relative.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{}/{}", base.trim_end_matches('/'), relative),
    }
}

fn last_segment(path: &str) -> Option<String> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn invalid(location: &str, reason: &str) -> Error {
    Error::InvalidLocation {
        location: location.to_string(),
        reason: reason.to_string(),
    }
}
