//! Three-level context cache.
//!
//! - L1: a single entry, the current chapter or the last promoted entry
//! - L2: bounded LRU of recently used components and artifacts
//! - L3: every compression artifact, backed by the [`ArtifactStore`]
//!
//! A hit at L2 promotes to L1 (the old L1 entry drops back to L2); a hit at
//! L3 promotes to L2. All operations take the cache lock once, so each is
//! atomic with respect to the others.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::component::{ContextComponent, SettingCategory};
use crate::compression::{ArtifactKey, CompressionArtifact};
use crate::error::{ContextError, Result};
use crate::storage::ArtifactStore;
use crate::tier::TierName;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Entries held in L2 before least-recently-used eviction
    pub l2_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { l2_capacity: 64 }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.l2_capacity == 0 {
            return Err(ContextError::Config("l2_capacity must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    CurrentChapter,
    Setting(SettingCategory),
    Compression(TierName),
    Memory(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub chapter: Option<u32>,
    pub content_type: ContentType,
}

impl CacheKey {
    pub fn current(chapter: u32) -> Self {
        Self {
            chapter: Some(chapter),
            content_type: ContentType::CurrentChapter,
        }
    }

    pub fn setting(category: SettingCategory) -> Self {
        Self {
            chapter: None,
            content_type: ContentType::Setting(category),
        }
    }

    pub fn compression(chapter: u32, tier: TierName) -> Self {
        Self {
            chapter: Some(chapter),
            content_type: ContentType::Compression(tier),
        }
    }

    pub fn memory(character: impl Into<String>) -> Self {
        Self {
            chapter: None,
            content_type: ContentType::Memory(character.into()),
        }
    }

    fn artifact_key(&self) -> Option<ArtifactKey> {
        match (&self.content_type, self.chapter) {
            (ContentType::Compression(tier), Some(chapter)) => Some(ArtifactKey::new(chapter, *tier)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Component(ContextComponent),
    Artifact(CompressionArtifact),
}

impl CacheValue {
    pub fn into_artifact(self) -> Option<CompressionArtifact> {
        match self {
            CacheValue::Artifact(artifact) => Some(artifact),
            CacheValue::Component(_) => None,
        }
    }

    pub fn into_component(self) -> Option<ContextComponent> {
        match self {
            CacheValue::Component(component) => Some(component),
            CacheValue::Artifact(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheLevel {
    L1,
    L2,
    L3,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: CacheValue,
    pub level: CacheLevel,
    pub last_access: DateTime<Utc>,
}

impl CacheEntry {
    fn new(key: CacheKey, value: CacheValue, level: CacheLevel) -> Self {
        Self {
            key,
            value,
            level,
            last_access: Utc::now(),
        }
    }

    fn touched(mut self, level: CacheLevel) -> Self {
        self.level = level;
        self.last_access = Utc::now();
        self
    }
}

/// Why entries are being invalidated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    /// The chapter's text changed: drop it and every artifact derived from it
    ChapterUpdate,
    /// Settings changed: drop every setting and character-memory entry
    SettingsChange,
    /// One tier's artifact is being recomputed
    CompressionUpdate(TierName),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidated: u64,
    pub corruptions: u64,
}

struct Levels {
    l1: Option<CacheEntry>,
    l2: LruCache<CacheKey, CacheEntry>,
    l3: HashMap<ArtifactKey, CompressionArtifact>,
    stats: CacheStats,
}

impl Levels {
    /// Put an entry in L2, counting an eviction if one happens
    fn push_l2(&mut self, entry: CacheEntry) {
        let key = entry.key.clone();
        if let Some((evicted, _)) = self.l2.push(key.clone(), entry.touched(CacheLevel::L2)) {
            if evicted != key {
                self.stats.evictions += 1;
                debug!("Evicted {:?} from L2", evicted);
            }
        }
    }

    /// Make `entry` the L1 entry, demoting the previous one to L2
    fn set_l1(&mut self, entry: CacheEntry) {
        self.l2.pop(&entry.key);
        if let Some(previous) = self.l1.replace(entry.touched(CacheLevel::L1)) {
            if self.l1.as_ref().is_some_and(|e| e.key != previous.key) {
                self.push_l2(previous);
            }
        }
    }

    fn remove_where(&mut self, matches: impl Fn(&CacheKey) -> bool) -> u64 {
        let mut removed = 0;
        if self.l1.as_ref().is_some_and(|e| matches(&e.key)) {
            self.l1 = None;
            removed += 1;
        }
        let doomed: Vec<CacheKey> = self.l2.iter().map(|(k, _)| k).filter(|k| matches(k)).cloned().collect();
        for key in doomed {
            self.l2.pop(&key);
            removed += 1;
        }
        let before = self.l3.len();
        self.l3.retain(|key, _| !matches(&CacheKey::compression(key.chapter, key.tier)));
        removed += (before - self.l3.len()) as u64;
        removed
    }
}

/// The shared cache of one project session
pub struct ContextCache {
    levels: Mutex<Levels>,
    store: Arc<dyn ArtifactStore>,
}

impl ContextCache {
    pub fn new(config: &CacheConfig, store: Arc<dyn ArtifactStore>) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.l2_capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            levels: Mutex::new(Levels {
                l1: None,
                l2: LruCache::new(capacity),
                l3: HashMap::new(),
                stats: CacheStats::default(),
            }),
            store,
        })
    }

    /// Look a key up through L1, L2 and L3, promoting on hit.
    ///
    /// A corrupt persisted artifact is discarded and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        let mut levels = self.levels.lock();

        if let Some(entry) = levels.l1.as_mut().filter(|e| &e.key == key) {
            entry.last_access = Utc::now();
            let value = entry.value.clone();
            levels.stats.l1_hits += 1;
            return Some(value);
        }

        if let Some(entry) = levels.l2.pop(key) {
            let value = entry.value.clone();
            levels.set_l1(entry);
            levels.stats.l2_hits += 1;
            debug!("L2 hit for {:?}, promoted to L1", key);
            return Some(value);
        }

        let Some(artifact_key) = key.artifact_key() else {
            levels.stats.misses += 1;
            return None;
        };

        let in_memory = levels.l3.get(&artifact_key).cloned();
        let artifact = match in_memory {
            Some(artifact) => Some(artifact),
            None => self.load_from_store(&mut levels, artifact_key),
        };
        match artifact {
            Some(artifact) => {
                levels.l3.insert(artifact_key, artifact.clone());
                let value = CacheValue::Artifact(artifact);
                levels.push_l2(CacheEntry::new(key.clone(), value.clone(), CacheLevel::L2));
                levels.stats.l3_hits += 1;
                debug!("L3 hit for {:?}, promoted to L2", key);
                Some(value)
            }
            None => {
                levels.stats.misses += 1;
                None
            }
        }
    }

    fn load_from_store(&self, levels: &mut Levels, key: ArtifactKey) -> Option<CompressionArtifact> {
        match self.store.load_artifact(key.chapter, key.tier) {
            Ok(artifact) => artifact,
            Err(e @ ContextError::CacheCorruption { .. }) => {
                warn!("Discarding corrupt artifact: {}", e);
                levels.stats.corruptions += 1;
                if let Err(e) = self.store.delete_artifacts(key.chapter, Some(key.tier)) {
                    warn!("Failed to delete corrupt artifact: {}", e);
                }
                None
            }
            Err(e) => {
                warn!("Failed to load artifact for chapter {} ({}): {}", key.chapter, key.tier, e);
                None
            }
        }
    }

    /// Fetch an artifact through the cache levels
    pub fn get_artifact(&self, chapter: u32, tier: TierName) -> Option<CompressionArtifact> {
        self.get(&CacheKey::compression(chapter, tier))
            .and_then(CacheValue::into_artifact)
    }

    /// Replace L1 with the current chapter
    pub fn insert_current(&self, component: ContextComponent) {
        let Some(chapter) = component.chapter else {
            return;
        };
        let entry = CacheEntry::new(
            CacheKey::current(chapter),
            CacheValue::Component(component),
            CacheLevel::L1,
        );
        self.levels.lock().set_l1(entry);
    }

    /// Cache a component (settings, memories) in L2
    pub fn insert_component(&self, key: CacheKey, component: ContextComponent) {
        let entry = CacheEntry::new(key, CacheValue::Component(component), CacheLevel::L2);
        let mut levels = self.levels.lock();
        if levels.l1.as_ref().is_some_and(|e| e.key == entry.key) {
            levels.l1 = None;
        }
        levels.push_l2(entry);
    }

    /// Record a freshly written artifact in L3 and L2, superseding any
    /// cached version with the same key
    pub fn insert_artifact(&self, artifact: CompressionArtifact) {
        let key = CacheKey::compression(artifact.chapter, artifact.tier);
        let mut levels = self.levels.lock();
        if levels.l1.as_ref().is_some_and(|e| e.key == key) {
            levels.l1 = None;
        }
        levels.l3.insert(artifact.key(), artifact.clone());
        levels.push_l2(CacheEntry::new(key, CacheValue::Artifact(artifact), CacheLevel::L2));
    }

    /// Hold an artifact that must not outlive L2, such as one interpolated
    /// for a missing chapter. It never reaches L3 or the store.
    pub fn insert_transient(&self, artifact: CompressionArtifact) {
        let key = CacheKey::compression(artifact.chapter, artifact.tier);
        let mut levels = self.levels.lock();
        if levels.l1.as_ref().is_some_and(|e| e.key == key) {
            levels.l1 = None;
        }
        levels.push_l2(CacheEntry::new(key, CacheValue::Artifact(artifact), CacheLevel::L2));
    }

    /// Coarsest artifact available for a chapter at any level, without
    /// compressing anything. Used when a deadline has passed.
    pub fn coarsest_available(&self, chapter: u32) -> Option<CompressionArtifact> {
        let mut levels = self.levels.lock();
        for tier in TierName::ALL.into_iter().rev() {
            let key = CacheKey::compression(chapter, tier);
            let in_memory = levels
                .l1
                .as_ref()
                .filter(|e| e.key == key)
                .map(|e| e.value.clone())
                .or_else(|| levels.l2.peek(&key).map(|e| e.value.clone()))
                .and_then(CacheValue::into_artifact)
                .or_else(|| levels.l3.get(&ArtifactKey::new(chapter, tier)).cloned());
            if let Some(artifact) = in_memory {
                return Some(artifact);
            }
            if let Some(artifact) = self.load_from_store(&mut levels, ArtifactKey::new(chapter, tier)) {
                levels.l3.insert(artifact.key(), artifact.clone());
                return Some(artifact);
            }
        }
        None
    }

    /// Remove the entries `reason` covers. Returns how many were removed.
    pub fn invalidate(&self, chapter: u32, reason: InvalidationReason) -> Result<u64> {
        let removed = {
            let mut levels = self.levels.lock();
            let removed = match reason {
                InvalidationReason::ChapterUpdate => levels.remove_where(|k| k.chapter == Some(chapter)),
                InvalidationReason::SettingsChange => {
                    levels.remove_where(|k| matches!(k.content_type, ContentType::Setting(_) | ContentType::Memory(_)))
                }
                InvalidationReason::CompressionUpdate(tier) => {
                    levels.remove_where(|k| k == &CacheKey::compression(chapter, tier))
                }
            };
            levels.stats.invalidated += removed;
            removed
        };

        if reason == InvalidationReason::ChapterUpdate {
            self.store.delete_artifacts(chapter, None)?;
        }
        debug!("Invalidated {} entries for chapter {} ({:?})", removed, chapter, reason);
        Ok(removed)
    }

    pub fn clear(&self) {
        let mut levels = self.levels.lock();
        levels.l1 = None;
        levels.l2.clear();
        levels.l3.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.levels.lock().stats
    }

    /// Level a key currently sits at, without touching recency
    pub fn level_of(&self, key: &CacheKey) -> Option<CacheLevel> {
        let levels = self.levels.lock();
        if levels.l1.as_ref().is_some_and(|e| &e.key == key) {
            return Some(CacheLevel::L1);
        }
        if levels.l2.contains(key) {
            return Some(CacheLevel::L2);
        }
        key.artifact_key()
            .filter(|k| levels.l3.contains_key(k))
            .map(|_| CacheLevel::L3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{CompressionConfig, CompressionEngine, sample_chapter};
    use crate::scoring::ContentScorer;
    use crate::source::InMemoryProject;
    use crate::storage::{FileArtifactStore, MemoryArtifactStore};
    use crate::tier::TierSet;
    use std::fs;
    use tempfile::TempDir;

    fn build(chapter: u32, tier: TierName) -> CompressionArtifact {
        let engine = CompressionEngine::new(
            TierSet::default(),
            CompressionConfig::default(),
            ContentScorer::default(),
            Arc::new(InMemoryProject::new()),
            Arc::new(MemoryArtifactStore::new()),
        )
        .unwrap();
        engine.build_artifact(chapter, &sample_chapter(chapter as usize, 300), tier, None)
    }

    fn cache_with(store: Arc<dyn ArtifactStore>, capacity: usize) -> ContextCache {
        ContextCache::new(&CacheConfig { l2_capacity: capacity }, store).unwrap()
    }

    #[test]
    fn test_read_through_promotion() {
        let store = Arc::new(MemoryArtifactStore::new());
        let artifact = build(3, TierName::Recent);
        store.save_artifact(&artifact).unwrap();
        let cache = cache_with(store, 8);
        let key = CacheKey::compression(3, TierName::Recent);

        assert_eq!(cache.level_of(&key), None);
        assert_eq!(cache.get_artifact(3, TierName::Recent).unwrap(), artifact);
        assert_eq!(cache.level_of(&key), Some(CacheLevel::L2));
        assert_eq!(cache.get_artifact(3, TierName::Recent).unwrap(), artifact);
        assert_eq!(cache.level_of(&key), Some(CacheLevel::L1));

        let stats = cache.stats();
        assert_eq!(stats.l3_hits, 1);
        assert_eq!(stats.l2_hits, 1);
    }

    #[test]
    fn test_cache_hit_matches_fresh_build() {
        let store = Arc::new(MemoryArtifactStore::new());
        let cache = cache_with(store, 8);
        cache.insert_artifact(build(5, TierName::Medium));

        let cached = cache.get_artifact(5, TierName::Medium).unwrap();
        let fresh = build(5, TierName::Medium);
        assert_eq!(cached.render(), fresh.render());
        assert_eq!(cached.compressed_token_count, fresh.compressed_token_count);
    }

    #[test]
    fn test_l1_holds_one_entry() {
        let cache = cache_with(Arc::new(MemoryArtifactStore::new()), 8);
        cache.insert_current(ContextComponent::current_chapter(1, "One."));
        cache.insert_current(ContextComponent::current_chapter(2, "Two."));
        assert_eq!(cache.level_of(&CacheKey::current(2)), Some(CacheLevel::L1));
        assert_eq!(cache.level_of(&CacheKey::current(1)), Some(CacheLevel::L2));
    }

    #[test]
    fn test_l2_evicts_least_recent() {
        let cache = cache_with(Arc::new(MemoryArtifactStore::new()), 2);
        for category in [SettingCategory::World, SettingCategory::Plot, SettingCategory::Style] {
            cache.insert_component(CacheKey::setting(category), ContextComponent::setting(category, "x"));
        }
        assert!(cache.get(&CacheKey::setting(SettingCategory::World)).is_none());
        assert!(cache.get(&CacheKey::setting(SettingCategory::Style)).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_settings_change_clears_settings_only() {
        let cache = cache_with(Arc::new(MemoryArtifactStore::new()), 16);
        for category in SettingCategory::ALL {
            cache.insert_component(CacheKey::setting(category), ContextComponent::setting(category, "rules"));
        }
        cache.insert_artifact(build(2, TierName::Recent));
        cache.insert_current(ContextComponent::current_chapter(4, "Now."));

        cache.invalidate(4, InvalidationReason::SettingsChange).unwrap();
        for category in SettingCategory::ALL {
            assert!(cache.get(&CacheKey::setting(category)).is_none());
        }
        assert!(cache.get_artifact(2, TierName::Recent).is_some());
        assert!(cache.get(&CacheKey::current(4)).is_some());
    }

    #[test]
    fn test_chapter_update_removes_persisted_artifacts() {
        let store = Arc::new(MemoryArtifactStore::new());
        for tier in TierName::ALL {
            let artifact = build(6, tier);
            store.save_artifact(&artifact).unwrap();
        }
        let cache = cache_with(store.clone(), 16);
        assert!(cache.get_artifact(6, TierName::Recent).is_some());
        cache.insert_current(ContextComponent::current_chapter(6, "Old text."));

        cache.invalidate(6, InvalidationReason::ChapterUpdate).unwrap();
        assert!(cache.get(&CacheKey::current(6)).is_none());
        for tier in TierName::ALL {
            assert!(cache.get_artifact(6, tier).is_none());
        }
        assert!(store.list_artifacts().unwrap().is_empty());
    }

    #[test]
    fn test_compression_update_is_tier_scoped() {
        let cache = cache_with(Arc::new(MemoryArtifactStore::new()), 16);
        cache.insert_artifact(build(7, TierName::Recent));
        cache.insert_artifact(build(7, TierName::Medium));

        let removed = cache
            .invalidate(7, InvalidationReason::CompressionUpdate(TierName::Recent))
            .unwrap();
        assert_eq!(removed, 2); // L2 and L3 copies
        assert_eq!(cache.level_of(&CacheKey::compression(7, TierName::Recent)), None);
        assert!(cache.level_of(&CacheKey::compression(7, TierName::Medium)).is_some());
    }

    #[test]
    fn test_corrupt_artifact_becomes_miss() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FileArtifactStore::with_directory(temp_dir.path()).unwrap());
        store.save_artifact(&build(2, TierName::Recent)).unwrap();
        fs::write(temp_dir.path().join("chapter_0002/recent/artifact.json"), "garbage").unwrap();

        let cache = cache_with(store.clone(), 4);
        assert!(cache.get_artifact(2, TierName::Recent).is_none());
        assert_eq!(cache.stats().corruptions, 1);
        assert!(store.load_artifact(2, TierName::Recent).unwrap().is_none());
    }

    #[test]
    fn test_transient_artifact_stays_in_l2() {
        let store = Arc::new(MemoryArtifactStore::new());
        let cache = cache_with(store.clone(), 8);
        cache.insert_transient(build(4, TierName::Recent));
        let key = CacheKey::compression(4, TierName::Recent);

        assert_eq!(cache.level_of(&key), Some(CacheLevel::L2));
        assert!(store.load_artifact(4, TierName::Recent).unwrap().is_none());
        assert!(cache.get_artifact(4, TierName::Recent).is_some());

        cache.invalidate(4, InvalidationReason::ChapterUpdate).unwrap();
        assert_eq!(cache.level_of(&key), None);
        assert!(cache.get_artifact(4, TierName::Recent).is_none());
    }

    #[test]
    fn test_coarsest_available_prefers_long_term() {
        let store = Arc::new(MemoryArtifactStore::new());
        store.save_artifact(&build(1, TierName::Medium)).unwrap();
        let cache = cache_with(store, 4);
        cache.insert_artifact(build(1, TierName::Recent));

        assert_eq!(cache.coarsest_available(1).unwrap().tier, TierName::Medium);
        assert!(cache.coarsest_available(2).is_none());
    }
}
