use crate::compression::{ArtifactKey, ArtifactMetadata, CompressionArtifact};
use crate::error::ContextError;
use crate::tier::TierName;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default number of operation log entries kept
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

const ARTIFACT_FILE: &str = "artifact.json";
const METADATA_FILE: &str = "metadata.json";
const LOG_FILE: &str = "compression_log.json";

/// Trait for artifact storage backends
pub trait ArtifactStore: Send + Sync {
    /// Save an artifact and its metadata, replacing any previous version
    fn save_artifact(&self, artifact: &CompressionArtifact) -> Result<(), ContextError>;

    /// Load the artifact for a chapter at a tier.
    ///
    /// `Ok(None)` when nothing is stored; `CacheCorruption` when the stored
    /// artifact fails validation.
    fn load_artifact(&self, chapter: u32, tier: TierName) -> Result<Option<CompressionArtifact>, ContextError>;

    /// Delete a chapter's artifacts, at one tier or all of them. Returns the
    /// number removed.
    fn delete_artifacts(&self, chapter: u32, tier: Option<TierName>) -> Result<usize, ContextError>;

    /// Metadata of every stored artifact
    fn list_artifacts(&self) -> Result<Vec<ArtifactMetadata>, ContextError>;

    /// Append to the bounded operation log
    fn append_log(&self, entry: CompressionLogEntry) -> Result<(), ContextError>;

    /// Operation log, oldest first
    fn read_log(&self) -> Result<Vec<CompressionLogEntry>, ContextError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Compress,
    Interpolate,
}

/// One compression operation, as recorded in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub chapter: u32,
    pub tier: TierName,
    pub operation: OperationKind,
    pub duration_ms: u64,
    pub success: bool,
    pub message: String,
}

/// File-based artifact storage.
///
/// Layout: `<root>/chapter_NNNN/<tier>/{artifact,metadata}.json` plus a
/// bounded `<root>/compression_log.json`.
pub struct FileArtifactStore {
    root: PathBuf,
    log_capacity: usize,
    // serialises read-modify-write of the log file
    log_lock: Mutex<()>,
}

impl FileArtifactStore {
    /// Create a store under the user's config directory
    pub fn new() -> Result<Self, ContextError> {
        let root = Self::default_artifacts_dir()?;
        if !root.exists() {
            fs::create_dir_all(&root)
                .map_err(|e| ContextError::Storage(format!("Failed to create artifacts directory: {}", e)))?;
            info!("Created artifacts directory: {}", root.display());
        }
        Ok(Self::at(root))
    }

    /// Create a store rooted at a custom directory
    pub fn with_directory<P: AsRef<Path>>(dir: P) -> Result<Self, ContextError> {
        let root = dir.as_ref().to_path_buf();
        if !root.exists() {
            fs::create_dir_all(&root)
                .map_err(|e| ContextError::Storage(format!("Failed to create artifacts directory: {}", e)))?;
        }
        Ok(Self::at(root))
    }

    fn at(root: PathBuf) -> Self {
        Self {
            root,
            log_capacity: DEFAULT_LOG_CAPACITY,
            log_lock: Mutex::new(()),
        }
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn default_artifacts_dir() -> Result<PathBuf, ContextError> {
        let home_dir = home::home_dir()
            .ok_or_else(|| ContextError::Storage("Could not determine home directory".to_string()))?;

        #[cfg(target_os = "macos")]
        let config_dir = home_dir.join("Library").join("Application Support");

        #[cfg(target_os = "linux")]
        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir.join(".config"));

        #[cfg(target_os = "windows")]
        let config_dir = std::env::var("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir.join("AppData").join("Roaming"));

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        let config_dir = home_dir.join(".config");

        Ok(config_dir.join("saga-context").join("artifacts"))
    }

    fn chapter_dir(&self, chapter: u32) -> PathBuf {
        self.root.join(format!("chapter_{:04}", chapter))
    }

    fn tier_dir(&self, chapter: u32, tier: TierName) -> PathBuf {
        self.chapter_dir(chapter).join(tier.as_str())
    }

    fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    fn read_metadata(path: &Path) -> Result<ArtifactMetadata, ContextError> {
        let data = fs::read_to_string(path)
            .map_err(|e| ContextError::Storage(format!("Failed to read metadata file: {}", e)))?;
        Ok(serde_json::from_str(&data)?)
    }

    fn read_log_file(&self) -> Result<Vec<CompressionLogEntry>, ContextError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&path)
            .map_err(|e| ContextError::Storage(format!("Failed to read compression log: {}", e)))?;
        Ok(serde_json::from_str(&data)?)
    }
}

impl ArtifactStore for FileArtifactStore {
    fn save_artifact(&self, artifact: &CompressionArtifact) -> Result<(), ContextError> {
        let dir = self.tier_dir(artifact.chapter, artifact.tier);
        fs::create_dir_all(&dir)
            .map_err(|e| ContextError::Storage(format!("Failed to create artifact directory: {}", e)))?;

        let artifact_json = serde_json::to_string_pretty(artifact)?;
        let metadata_json = serde_json::to_string_pretty(&artifact.metadata())?;

        fs::write(dir.join(ARTIFACT_FILE), artifact_json)
            .map_err(|e| ContextError::Storage(format!("Failed to write artifact file: {}", e)))?;
        fs::write(dir.join(METADATA_FILE), metadata_json)
            .map_err(|e| ContextError::Storage(format!("Failed to write metadata file: {}", e)))?;

        debug!("Saved {} artifact for chapter {} to {}", artifact.tier, artifact.chapter, dir.display());
        Ok(())
    }

    fn load_artifact(&self, chapter: u32, tier: TierName) -> Result<Option<CompressionArtifact>, ContextError> {
        let dir = self.tier_dir(chapter, tier);
        let artifact_path = dir.join(ARTIFACT_FILE);
        if !artifact_path.exists() {
            return Ok(None);
        }

        let corrupt = |reason: String| ContextError::CacheCorruption { chapter, tier, reason };

        let data = fs::read_to_string(&artifact_path)
            .map_err(|e| ContextError::Storage(format!("Failed to read artifact file: {}", e)))?;
        let artifact: CompressionArtifact =
            serde_json::from_str(&data).map_err(|e| corrupt(format!("unreadable artifact: {}", e)))?;
        if artifact.key() != ArtifactKey::new(chapter, tier) {
            return Err(corrupt(format!(
                "file holds chapter {} ({})",
                artifact.chapter, artifact.tier
            )));
        }
        artifact.validate()?;

        let metadata = Self::read_metadata(&dir.join(METADATA_FILE))
            .map_err(|e| corrupt(format!("unreadable metadata: {}", e)))?;
        if metadata.artifact_id != artifact.id || metadata.compressed_tokens != artifact.compressed_token_count {
            return Err(corrupt("metadata does not match artifact".to_string()));
        }

        debug!("Loaded {} artifact for chapter {}", tier, chapter);
        Ok(Some(artifact))
    }

    fn delete_artifacts(&self, chapter: u32, tier: Option<TierName>) -> Result<usize, ContextError> {
        let tiers = match tier {
            Some(tier) => vec![tier],
            None => TierName::ALL.to_vec(),
        };

        let mut deleted = 0;
        for tier in tiers {
            let dir = self.tier_dir(chapter, tier);
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .map_err(|e| ContextError::Storage(format!("Failed to delete artifact directory: {}", e)))?;
                deleted += 1;
            }
        }

        let chapter_dir = self.chapter_dir(chapter);
        let chapter_empty = fs::read_dir(&chapter_dir).is_ok_and(|mut entries| entries.next().is_none());
        if chapter_empty {
            fs::remove_dir(&chapter_dir)
                .map_err(|e| ContextError::Storage(format!("Failed to delete chapter directory: {}", e)))?;
        }

        if deleted > 0 {
            info!("Deleted {} artifact(s) for chapter {}", deleted, chapter);
        }
        Ok(deleted)
    }

    fn list_artifacts(&self) -> Result<Vec<ArtifactMetadata>, ContextError> {
        let mut listed = Vec::new();

        let entries = fs::read_dir(&self.root)
            .map_err(|e| ContextError::Storage(format!("Failed to read artifacts directory: {}", e)))?;

        for entry in entries {
            let entry = entry.map_err(|e| ContextError::Storage(format!("Failed to read directory entry: {}", e)))?;
            let path = entry.path();

            let is_chapter_dir = path.is_dir()
                && path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .is_some_and(|name| name.starts_with("chapter_"));
            if !is_chapter_dir {
                continue;
            }

            for tier in TierName::ALL {
                let metadata_path = path.join(tier.as_str()).join(METADATA_FILE);
                if !metadata_path.exists() {
                    continue;
                }
                match Self::read_metadata(&metadata_path) {
                    Ok(metadata) => listed.push(metadata),
                    Err(e) => warn!("Failed to read metadata {}: {}", metadata_path.display(), e),
                }
            }
        }

        listed.sort_by_key(|m| (m.chapter, m.tier));
        debug!("Listed {} artifacts", listed.len());
        Ok(listed)
    }

    fn append_log(&self, entry: CompressionLogEntry) -> Result<(), ContextError> {
        let _guard = self.log_lock.lock();

        let mut log = match self.read_log_file() {
            Ok(log) => log,
            Err(e) => {
                warn!("Compression log unreadable, starting a new one: {}", e);
                Vec::new()
            }
        };
        log.push(entry);
        if log.len() > self.log_capacity {
            let excess = log.len() - self.log_capacity;
            log.drain(..excess);
        }

        let log_json = serde_json::to_string_pretty(&log)?;
        fs::write(self.log_path(), log_json)
            .map_err(|e| ContextError::Storage(format!("Failed to write compression log: {}", e)))?;
        Ok(())
    }

    fn read_log(&self) -> Result<Vec<CompressionLogEntry>, ContextError> {
        let _guard = self.log_lock.lock();
        self.read_log_file()
    }
}

/// In-process artifact storage
pub struct MemoryArtifactStore {
    artifacts: Mutex<BTreeMap<ArtifactKey, CompressionArtifact>>,
    log: Mutex<VecDeque<CompressionLogEntry>>,
    log_capacity: usize,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            artifacts: Mutex::new(BTreeMap::new()),
            log: Mutex::new(VecDeque::new()),
            log_capacity: capacity.max(1),
        }
    }
}

impl Default for MemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn save_artifact(&self, artifact: &CompressionArtifact) -> Result<(), ContextError> {
        self.artifacts.lock().insert(artifact.key(), artifact.clone());
        Ok(())
    }

    fn load_artifact(&self, chapter: u32, tier: TierName) -> Result<Option<CompressionArtifact>, ContextError> {
        let artifact = self.artifacts.lock().get(&ArtifactKey::new(chapter, tier)).cloned();
        if let Some(artifact) = &artifact {
            artifact.validate()?;
        }
        Ok(artifact)
    }

    fn delete_artifacts(&self, chapter: u32, tier: Option<TierName>) -> Result<usize, ContextError> {
        let mut artifacts = self.artifacts.lock();
        let before = artifacts.len();
        artifacts.retain(|key, _| key.chapter != chapter || tier.is_some_and(|t| t != key.tier));
        Ok(before - artifacts.len())
    }

    fn list_artifacts(&self) -> Result<Vec<ArtifactMetadata>, ContextError> {
        Ok(self.artifacts.lock().values().map(CompressionArtifact::metadata).collect())
    }

    fn append_log(&self, entry: CompressionLogEntry) -> Result<(), ContextError> {
        let mut log = self.log.lock();
        log.push_back(entry);
        while log.len() > self.log_capacity {
            log.pop_front();
        }
        Ok(())
    }

    fn read_log(&self) -> Result<Vec<CompressionLogEntry>, ContextError> {
        Ok(self.log.lock().iter().cloned().collect())
    }
}
