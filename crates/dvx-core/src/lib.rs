//! DVX Core - Foundation for data versioning and experiment tracking
//!
//! Provides configuration, error handling, content hashing and the core
//! types shared by the storage, tracking and checkpoint crates.

pub mod config;
pub mod error;
pub mod hash;
pub mod types;

pub use config::{RemoteConfig, RepoConfig, RetryConfig, StorageConfig};
pub use error::{Error, Result};
pub use hash::{hash_bytes, hash_file, ContentHash};
pub use types::*;
