//! Repository handle and data-tracking operations
//!
//! A repository is a workspace directory holding a `.dvx/` directory:
//!
//! ```text
//! .dvx/
//!   config.json     repository configuration
//!   cache/          local object cache
//!   tmp/            hash memo, checkpoint signal files
//!   refs/           experiment references
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dvx_core::{
    hash_bytes, ArtifactKind, ContentHash, DirEntry, DirManifest, Error, RepoConfig, Result,
    Scheme,
};
use storage::{open_backend, open_remote, Location};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::cache::{local_cache, CacheGcStats, ObjectCache};
use crate::output::{normalize_relative, Dependency, Output, TrackingFile, TRACKING_SUFFIX};
use crate::pipeline::LOCK_FILE;
use crate::state::HashState;
use crate::transfer::{transfer, TransferSummary};

/// Name of the repository metadata directory
pub const DVX_DIR: &str = ".dvx";

/// Configuration file inside `.dvx/`
pub const CONFIG_FILE: &str = "config.json";

const STATE_FILE: &str = "tmp/state.json";

/// State of a tracked output relative to its committed version
///
/// Ordered by how urgently it needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputStatus {
    /// Not present in the workspace
    Missing,

    /// Workspace content differs from the committed hash
    Modified,

    /// Committed content is absent from the cache
    NotInCache,

    Unchanged,
}

impl fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OutputStatus::Missing => "missing",
            OutputStatus::Modified => "modified",
            OutputStatus::NotInCache => "not in cache",
            OutputStatus::Unchanged => "unchanged",
        };
        f.write_str(label)
    }
}

/// Status of one tracked output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub path: String,
    pub status: OutputStatus,
}

/// Result of `add`
#[derive(Debug, Clone)]
pub struct AddOutcome {
    /// The committed output
    pub output: Output,

    /// Tracking file written for it
    pub tracking_file: PathBuf,

    /// Objects newly written to the cache
    pub objects_written: usize,
}

/// Result of a checkout
#[derive(Debug, Clone, Default)]
pub struct CheckoutSummary {
    /// Outputs rewritten from the cache
    pub restored: Vec<String>,

    /// Outputs already matching their committed version
    pub unchanged: usize,

    /// Outputs that could not be restored, with the reason
    pub skipped: Vec<(String, String)>,
}

/// Hashed state of a workspace file or directory
struct Snapshot {
    hash: ContentHash,
    size: u64,
    kind: ArtifactKind,
    files: Vec<(PathBuf, ContentHash)>,
    manifest: Option<DirManifest>,
}

/// An opened DVX repository
pub struct Repo {
    root: PathBuf,
    dvx_dir: PathBuf,
    config: RepoConfig,
    cache: ObjectCache,
    state: Arc<HashState>,
}

impl Repo {
    /// Create `.dvx/` in `root` and open the new repository
    pub fn init(root: &Path) -> Result<Self> {
        let root = root.canonicalize()?;
        let dvx_dir = root.join(DVX_DIR);
        if dvx_dir.exists() {
            return Err(Error::AlreadyInitialized {
                path: root.display().to_string(),
            });
        }

        for sub in ["cache", "tmp", "refs"] {
            std::fs::create_dir_all(dvx_dir.join(sub))?;
        }
        RepoConfig::default().save(&dvx_dir.join(CONFIG_FILE))?;
        std::fs::write(dvx_dir.join(".gitignore"), "/cache\n/tmp\n")?;

        info!(root = %root.display(), "Initialized DVX repository");
        Self::open(&root)
    }

    /// Open the repository containing `path`
    pub fn open(path: &Path) -> Result<Self> {
        let root = Self::find_root(path)?;
        let dvx_dir = root.join(DVX_DIR);
        let config = RepoConfig::load(&dvx_dir.join(CONFIG_FILE))?;
        config.validate()?;

        let cache = local_cache(&dvx_dir.join(&config.cache.dir));
        let state = Arc::new(HashState::load(&dvx_dir.join(STATE_FILE)));
        debug!(root = %root.display(), "Opened repository");

        Ok(Self {
            root,
            dvx_dir,
            config,
            cache,
            state,
        })
    }

    /// Nearest ancestor of `start` (inclusive) holding a `.dvx/` directory
    pub fn find_root(start: &Path) -> Result<PathBuf> {
        let not_initialized = || Error::NotInitialized {
            path: start.display().to_string(),
        };
        let start = start.canonicalize().map_err(|_| not_initialized())?;
        start
            .ancestors()
            .find(|dir| dir.join(DVX_DIR).is_dir())
            .map(Path::to_path_buf)
            .ok_or_else(not_initialized)
    }

    /// Workspace root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `.dvx/` directory
    pub fn dvx_dir(&self) -> &Path {
        &self.dvx_dir
    }

    /// Experiment reference directory
    pub fn refs_dir(&self) -> PathBuf {
        self.dvx_dir.join("refs")
    }

    /// Scratch directory for transient files
    pub fn tmp_dir(&self) -> PathBuf {
        self.dvx_dir.join("tmp")
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Local object cache
    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// Modify, validate and persist the configuration
    pub fn update_config<F>(&mut self, update: F) -> Result<()>
    where
        F: FnOnce(&mut RepoConfig),
    {
        let mut config = self.config.clone();
        update(&mut config);
        config.save(&self.dvx_dir.join(CONFIG_FILE))?;
        self.config = config;
        Ok(())
    }

    /// Persist the file hash memo
    pub fn save_state(&self) -> Result<()> {
        self.state.save()
    }

    /// Workspace-relative form of a target path
    ///
    /// Relative targets are taken relative to the workspace root.
    pub fn relative(&self, target: &Path) -> Result<String> {
        let absolute = if target.is_absolute() {
            target.to_path_buf()
        } else {
            self.root.join(target)
        };

        let stripped = match absolute.strip_prefix(&self.root) {
            Ok(stripped) => stripped.to_path_buf(),
            Err(_) => absolute
                .canonicalize()
                .ok()
                .and_then(|c| c.strip_prefix(&self.root).ok().map(Path::to_path_buf))
                .ok_or_else(|| Error::InvalidTarget {
                    target: target.display().to_string(),
                    reason: "outside the workspace".to_string(),
                })?,
        };

        let relative = normalize_relative(&stripped)?;
        let first = relative.split('/').next().unwrap_or_default();
        if first == DVX_DIR || first == ".git" {
            let reason = format!("paths inside {} are managed internally", first);
            return Err(Error::InvalidTarget {
                target: relative,
                reason,
            });
        }
        Ok(relative)
    }

    async fn hash_path(&self, file: &Path) -> Result<ContentHash> {
        let state = Arc::clone(&self.state);
        let file = file.to_path_buf();
        tokio::task::spawn_blocking(move || state.hash_file_cached(&file))
            .await
            .map_err(|e| Error::Internal {
                message: format!("hash task failed: {}", e),
            })?
    }

    /// Files below `dir` as `(absolute path, relative path, size)`
    fn walk_dir(dir: &Path) -> Result<Vec<(PathBuf, String, u64)>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| Error::Internal {
                    message: format!("walked outside {}: {}", dir.display(), e),
                })?;
            let size = entry.metadata().map_err(std::io::Error::from)?.len();
            files.push((
                entry.path().to_path_buf(),
                normalize_relative(relative)?,
                size,
            ));
        }
        Ok(files)
    }

    async fn snapshot(&self, path: &Path) -> Result<Snapshot> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_dir() {
            let hash = self.hash_path(path).await?;
            return Ok(Snapshot {
                hash: hash.clone(),
                size: metadata.len(),
                kind: ArtifactKind::File,
                files: vec![(path.to_path_buf(), hash)],
                manifest: None,
            });
        }

        let mut entries = Vec::new();
        let mut files = Vec::new();
        for (file, relpath, size) in Self::walk_dir(path)? {
            let hash = self.hash_path(&file).await?;
            entries.push(DirEntry {
                relpath,
                hash: hash.clone(),
                size,
            });
            files.push((file, hash));
        }
        let manifest = DirManifest::new(entries);
        Ok(Snapshot {
            hash: manifest.hash()?,
            size: manifest.total_size(),
            kind: ArtifactKind::Directory,
            files,
            manifest: Some(manifest),
        })
    }

    // ---- external locations ----

    async fn external_cache(&self, scheme: Scheme) -> Result<ObjectCache> {
        let (name, remote) = self.config.external_cache(scheme)?;
        debug!(%scheme, cache = name, "Opening external cache");
        Ok(ObjectCache::new(
            open_remote(remote, &self.config.storage).await?,
        ))
    }

    async fn open_external(&self, location: &Location) -> Result<(storage::BackendHandle, String)> {
        let (root, key) = location.split_root();
        let remote = self
            .config
            .external_cache(location.scheme())
            .ok()
            .map(|(_, remote)| remote);
        let backend = open_backend(&root, remote, &self.config.storage).await?;
        Ok((backend, key))
    }

    async fn read_external(&self, location: &Location) -> Result<Bytes> {
        let (backend, key) = self.open_external(location).await?;
        backend.read(&key).await
    }

    async fn commit_external(&self, output: &Output) -> Result<(Output, usize)> {
        let location = output.location(&self.root)?;
        let cache = self.external_cache(location.scheme()).await?;
        let data = self.read_external(&location).await?;

        let size = data.len() as u64;
        let hash = hash_bytes(&data);
        let mut written = 0;
        if output.cache && !cache.contains(&hash).await? {
            cache.put_bytes(data).await?;
            written = 1;
        }

        info!(%location, hash = hash.short(), "Committed external output");
        let mut committed = output.clone();
        committed.hash = Some(hash);
        committed.size = Some(size);
        committed.kind = ArtifactKind::File;
        Ok((committed, written))
    }

    async fn restore_external(&self, output: &Output, hash: &ContentHash) -> Result<bool> {
        let location = output.location(&self.root)?;
        let cache = self.external_cache(location.scheme()).await?;
        let (backend, key) = self.open_external(&location).await?;

        if let Ok(current) = backend.read(&key).await {
            if hash_bytes(&current).hex() == hash.hex() {
                return Ok(false);
            }
        }
        backend.write(&key, cache.get(hash).await?).await?;
        info!(%location, "Restored external output");
        Ok(true)
    }

    /// Track a file that lives outside the workspace
    ///
    /// The content is read from its location and copied into the external
    /// cache configured for the location's scheme; the tracking file is named
    /// after the location's file name.
    #[instrument(skip(self))]
    pub async fn add_external(&self, url: &str) -> Result<AddOutcome> {
        let output = Output::new(url);
        if !output.is_external(&self.root) {
            return Err(Error::InvalidTarget {
                target: url.to_string(),
                reason: "not outside the workspace, use add".to_string(),
            });
        }
        let name = output
            .location(&self.root)?
            .file_name()
            .ok_or_else(|| Error::InvalidTarget {
                target: url.to_string(),
                reason: "location has no file name".to_string(),
            })?;

        let (output, objects_written) = self.commit_one(&output).await?;
        let tracking_file = self.root.join(format!("{}{}", name, TRACKING_SUFFIX));
        TrackingFile::for_output(output.clone()).save(&tracking_file)?;

        Ok(AddOutcome {
            output,
            tracking_file,
            objects_written,
        })
    }

    /// Current hash of a dependency; external locations are read, not cached
    pub async fn track_external_dependency(&self, url: &str) -> Result<Dependency> {
        let location = Output::new(url).location(&self.root)?;
        let data = self.read_external(&location).await?;
        Ok(Dependency {
            path: url.to_string(),
            hash: Some(hash_bytes(&data)),
        })
    }

    /// Current hash of any dependency, `None` when it doesn't exist
    pub async fn dependency_state(&self, path: &str) -> Result<Dependency> {
        if Output::new(path).is_external(&self.root) {
            return self.track_external_dependency(path).await;
        }
        let full = self.root.join(path);
        let hash = if full.exists() {
            Some(self.snapshot(&full).await?.hash)
        } else {
            None
        };
        Ok(Dependency {
            path: path.to_string(),
            hash,
        })
    }

    // ---- workspace outputs ----

    /// Start tracking a workspace file or directory
    #[instrument(skip(self), fields(target = %target.display()))]
    pub async fn add(&self, target: &Path) -> Result<AddOutcome> {
        let relative = self.relative(target)?;
        let full = self.root.join(&relative);
        if !full.exists() {
            return Err(Error::InvalidTarget {
                target: relative,
                reason: "does not exist".to_string(),
            });
        }
        if TrackingFile::is_tracking_file(&full) {
            return Err(Error::InvalidTarget {
                target: relative,
                reason: "is a tracking file".to_string(),
            });
        }

        let (output, objects_written) = self.commit_one(&Output::new(relative)).await?;
        let tracking_file = TrackingFile::path_for(&full);
        TrackingFile::for_output(output.clone()).save(&tracking_file)?;
        self.ignore_in_git(&full)?;
        self.state.save()?;

        Ok(AddOutcome {
            output,
            tracking_file,
            objects_written,
        })
    }

    /// Add `/name` to the `.gitignore` next to a tracked path
    fn ignore_in_git(&self, full: &Path) -> Result<()> {
        let (Some(parent), Some(name)) = (full.parent(), full.file_name()) else {
            return Ok(());
        };
        let gitignore = parent.join(".gitignore");
        let entry = format!("/{}", name.to_string_lossy());

        let mut contents = std::fs::read_to_string(&gitignore).unwrap_or_default();
        if contents.lines().any(|line| line.trim() == entry) {
            return Ok(());
        }
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&entry);
        contents.push('\n');
        std::fs::write(&gitignore, contents)?;
        Ok(())
    }

    async fn commit_one(&self, output: &Output) -> Result<(Output, usize)> {
        if output.is_external(&self.root) {
            return self.commit_external(output).await;
        }

        let full = output.workspace_path(&self.root);
        if !full.exists() {
            return Err(Error::InvalidTarget {
                target: output.path.clone(),
                reason: "does not exist".to_string(),
            });
        }

        let snapshot = self.snapshot(&full).await?;
        let mut written = 0;
        if output.cache {
            for (file, hash) in &snapshot.files {
                if self.cache.put_file_with_hash(file, hash).await? {
                    written += 1;
                }
            }
            if let Some(manifest) = &snapshot.manifest {
                self.cache.put_dir_manifest(manifest).await?;
            }
        }

        info!(
            path = %output.path,
            hash = snapshot.hash.short(),
            objects = written,
            "Committed output"
        );
        let mut committed = output.clone();
        committed.hash = Some(snapshot.hash);
        committed.size = Some(snapshot.size);
        committed.kind = snapshot.kind;
        Ok((committed, written))
    }

    /// Hash outputs and store their content, returning the committed versions
    pub async fn commit_output(&self, output: &Output) -> Result<Output> {
        Ok(self.commit_one(output).await?.0)
    }

    /// Commit several outputs
    pub async fn commit_outputs(&self, outputs: &[Output]) -> Result<Vec<Output>> {
        let mut committed = Vec::with_capacity(outputs.len());
        for output in outputs {
            committed.push(self.commit_output(output).await?);
        }
        Ok(committed)
    }

    /// Present hashes of outputs without storing anything
    ///
    /// Missing workspace outputs come back with no hash.
    pub async fn current_outputs(&self, outputs: &[Output]) -> Result<Vec<Output>> {
        let mut current = Vec::with_capacity(outputs.len());
        for output in outputs {
            let mut state = output.clone();
            state.hash = None;
            state.size = None;
            if output.is_external(&self.root) {
                let location = output.location(&self.root)?;
                if let Ok(data) = self.read_external(&location).await {
                    state.size = Some(data.len() as u64);
                    state.hash = Some(hash_bytes(&data));
                }
            } else {
                let full = output.workspace_path(&self.root);
                if full.exists() {
                    let snapshot = self.snapshot(&full).await?;
                    state.hash = Some(snapshot.hash);
                    state.size = Some(snapshot.size);
                    state.kind = snapshot.kind;
                }
            }
            current.push(state);
        }
        Ok(current)
    }

    /// Re-commit every output named by a tracking file
    pub async fn commit_all(&self) -> Result<Vec<Output>> {
        let mut committed = Vec::new();
        for file in self.tracking_files()? {
            let mut tracking = TrackingFile::load(&file)?;
            let outs = self.commit_outputs(&tracking.outs).await?;
            if outs != tracking.outs {
                tracking.outs = outs.clone();
                tracking.save(&file)?;
            }
            committed.extend(outs);
        }
        self.state.save()?;
        Ok(committed)
    }

    /// Every tracking file in the workspace, sorted
    pub fn tracking_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name();
                !(e.depth() > 0 && e.file_type().is_dir() && (name == DVX_DIR || name == ".git"))
            });
        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            if TrackingFile::is_tracking_file(entry.path()) {
                files.push(entry.path().to_path_buf());
            }
        }
        Ok(files)
    }

    /// Outputs of every tracking file
    pub fn tracked_outputs(&self) -> Result<Vec<Output>> {
        let mut outputs = Vec::new();
        for file in self.tracking_files()? {
            outputs.extend(TrackingFile::load(&file)?.outs);
        }
        Ok(outputs)
    }

    /// Outputs of tracking files and the lock file, deduplicated by path
    fn all_committed_outputs(&self) -> Result<Vec<Output>> {
        let mut by_path: BTreeMap<String, Output> = BTreeMap::new();
        let lock = crate::pipeline::LockFile::load(&self.root.join(LOCK_FILE))?;
        for output in lock.outputs().cloned().chain(self.tracked_outputs()?) {
            by_path.insert(output.path.clone(), output);
        }
        Ok(by_path.into_values().collect())
    }

    async fn objects_present(&self, cache: &ObjectCache, hash: &ContentHash) -> Result<bool> {
        if !cache.contains(hash).await? {
            return Ok(false);
        }
        if hash.is_dir() {
            for entry in cache.get_dir_manifest(hash).await?.entries {
                if !cache.contains(&entry.hash).await? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Status of one output
    pub async fn output_status(&self, output: &Output) -> Result<OutputStatus> {
        let Some(hash) = &output.hash else {
            return Ok(OutputStatus::Modified);
        };

        if output.is_external(&self.root) {
            let location = output.location(&self.root)?;
            let data = match self.read_external(&location).await {
                Ok(data) => data,
                Err(Error::StoragePathNotFound { .. }) => return Ok(OutputStatus::Missing),
                Err(e) => return Err(e),
            };
            if hash_bytes(&data) != *hash {
                return Ok(OutputStatus::Modified);
            }
            let cache = self.external_cache(location.scheme()).await?;
            return Ok(if !output.cache || cache.contains(hash).await? {
                OutputStatus::Unchanged
            } else {
                OutputStatus::NotInCache
            });
        }

        let full = output.workspace_path(&self.root);
        if !full.exists() {
            return Ok(OutputStatus::Missing);
        }
        if self.snapshot(&full).await?.hash != *hash {
            return Ok(OutputStatus::Modified);
        }
        if output.cache && !self.objects_present(&self.cache, hash).await? {
            return Ok(OutputStatus::NotInCache);
        }
        Ok(OutputStatus::Unchanged)
    }

    /// Status of every committed output, most urgent first
    pub async fn status(&self) -> Result<Vec<StatusEntry>> {
        let mut entries = Vec::new();
        for output in self.all_committed_outputs()? {
            let status = self.output_status(&output).await?;
            entries.push(StatusEntry {
                path: output.path,
                status,
            });
        }
        entries.sort_by(|a, b| a.status.cmp(&b.status).then_with(|| a.path.cmp(&b.path)));
        self.state.save()?;
        Ok(entries)
    }

    async fn restore_file(&self, full: &Path, hash: &ContentHash) -> Result<bool> {
        if full.is_file() && self.hash_path(full).await? == *hash {
            return Ok(false);
        }
        if full.is_dir() {
            tokio::fs::remove_dir_all(full).await?;
        }
        self.cache.checkout_file(hash, full).await?;
        self.state.invalidate(full);
        Ok(true)
    }

    async fn restore_dir(&self, full: &Path, hash: &ContentHash) -> Result<bool> {
        let manifest = self.cache.get_dir_manifest(hash).await?;
        if full.is_file() {
            tokio::fs::remove_file(full).await?;
        }
        tokio::fs::create_dir_all(full).await?;

        let mut changed = false;
        let mut expected = HashSet::new();
        for entry in &manifest.entries {
            let dest = full.join(&entry.relpath);
            if self.restore_file(&dest, &entry.hash).await? {
                changed = true;
            }
            expected.insert(dest);
        }
        for (file, _, _) in Self::walk_dir(full)? {
            if !expected.contains(&file) {
                tokio::fs::remove_file(&file).await?;
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Write the committed version of one output; true when anything changed
    pub async fn restore_output(&self, output: &Output) -> Result<bool> {
        let Some(hash) = &output.hash else {
            return Ok(false);
        };
        if output.is_external(&self.root) {
            return self.restore_external(output, hash).await;
        }
        if !output.cache {
            return Ok(false);
        }

        let full = output.workspace_path(&self.root);
        let changed = if hash.is_dir() {
            self.restore_dir(&full, hash).await?
        } else {
            self.restore_file(&full, hash).await?
        };
        if changed {
            debug!(path = %output.path, "Restored output");
        }
        Ok(changed)
    }

    /// Write given output versions into the workspace
    pub async fn restore_outputs(&self, outputs: &[Output]) -> Result<usize> {
        let mut restored = 0;
        for output in outputs {
            if self.restore_output(output).await? {
                restored += 1;
            }
        }
        self.state.save()?;
        Ok(restored)
    }

    async fn checkout_outputs(&self, outputs: &[Output], lenient: bool) -> Result<CheckoutSummary> {
        let mut summary = CheckoutSummary::default();
        for output in outputs {
            match self.restore_output(output).await {
                Ok(true) => summary.restored.push(output.path.clone()),
                Ok(false) => summary.unchanged += 1,
                Err(e @ Error::ObjectNotFound { .. }) if lenient => {
                    warn!(path = %output.path, error = %e, "Skipping output missing from cache");
                    summary.skipped.push((output.path.clone(), e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }
        self.state.save()?;
        info!(
            restored = summary.restored.len(),
            unchanged = summary.unchanged,
            skipped = summary.skipped.len(),
            "Checkout complete"
        );
        Ok(summary)
    }

    /// Restore tracked outputs from the cache
    ///
    /// With a target, only outputs at or below it are restored; the target
    /// may name the output or its tracking file.
    pub async fn checkout(&self, target: Option<&Path>) -> Result<CheckoutSummary> {
        let mut outputs = self.all_committed_outputs()?;
        if let Some(target) = target {
            let relative = self.relative(target)?;
            let relative = relative
                .strip_suffix(TRACKING_SUFFIX)
                .map(str::to_string)
                .unwrap_or(relative);
            let prefix = format!("{}/", relative);
            outputs.retain(|o| o.path == relative || o.path.starts_with(&prefix));
            if outputs.is_empty() {
                return Err(Error::NotTracked { target: relative });
            }
        }
        self.checkout_outputs(&outputs, false).await
    }

    // ---- remotes and garbage collection ----

    /// Hashes the local cache must keep for the workspace
    pub fn used_hashes(&self) -> Result<HashSet<ContentHash>> {
        Ok(self
            .all_committed_outputs()?
            .into_iter()
            .filter(|o| o.cache && !o.is_external(&self.root))
            .filter_map(|o| o.hash)
            .collect())
    }

    /// Object cache of a configured remote (default remote when `None`)
    pub async fn remote_cache(&self, name: Option<&str>) -> Result<(String, ObjectCache)> {
        let (name, remote) = self.config.resolve_remote(name)?;
        let backend = open_remote(remote, &self.config.storage).await?;
        Ok((name.to_string(), ObjectCache::new(backend)))
    }

    /// Upload workspace objects missing from a remote
    #[instrument(skip(self))]
    pub async fn push(&self, remote: Option<&str>) -> Result<TransferSummary> {
        let (name, remote_cache) = self.remote_cache(remote).await?;
        info!(remote = %name, "Pushing objects");
        transfer(&self.cache, &remote_cache, &self.used_hashes()?, &self.config.storage).await
    }

    /// Download workspace objects missing from the local cache
    #[instrument(skip(self))]
    pub async fn fetch(&self, remote: Option<&str>) -> Result<TransferSummary> {
        let (name, remote_cache) = self.remote_cache(remote).await?;
        info!(remote = %name, "Fetching objects");
        transfer(&remote_cache, &self.cache, &self.used_hashes()?, &self.config.storage).await
    }

    /// Fetch, then check out whatever arrived
    ///
    /// Outputs whose objects the remote lacks are skipped, not fatal.
    pub async fn pull(&self, remote: Option<&str>) -> Result<(TransferSummary, CheckoutSummary)> {
        let summary = self.fetch(remote).await?;
        let outputs: Vec<Output> = self
            .all_committed_outputs()?
            .into_iter()
            .filter(|o| !o.is_external(&self.root))
            .collect();
        let checkout = self.checkout_outputs(&outputs, true).await?;
        Ok((summary, checkout))
    }

    /// Remove cached objects not used by the workspace or `extra_roots`
    pub async fn gc(&self, extra_roots: &HashSet<ContentHash>) -> Result<CacheGcStats> {
        let mut keep = self.used_hashes()?;
        keep.extend(extra_roots.iter().cloned());
        self.cache.gc(&keep).await
    }
}
