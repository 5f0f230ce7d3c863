//! Collaborator interfaces for chapter text, settings and character memories.
//!
//! The engine only reads from these stores. Two implementations are provided:
//! [`InMemoryProject`] for embedding and tests, and [`FileProject`] for the
//! on-disk manuscript layout:
//!
//! ```text
//! <root>/manuscript/chapters/chapter_NN/chapter_NN.md
//! <root>/settings/<category>/*.md
//! <root>/settings/memory/<character>.json
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::component::SettingCategory;
use crate::error::{ContextError, Result};
use crate::text::words;

/// Chapter metadata as reported by the chapter store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterMetadata {
    pub title: String,
    pub word_count: usize,
    pub status: String,
}

/// A remembered event from a character's point of view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterMemory {
    pub content: String,
    /// 1 (trivial) to 10 (defining)
    pub emotional_weight: u8,
    pub occurrence_time: DateTime<Utc>,
}

pub trait ChapterSource: Send + Sync {
    /// Full text of a chapter; `ChapterNotFound` when it does not exist
    fn chapter_text(&self, chapter: u32) -> Result<String>;

    fn chapter_metadata(&self, chapter: u32) -> Result<ChapterMetadata>;

    /// Every chapter number present, ascending
    fn chapter_numbers(&self) -> Result<Vec<u32>>;
}

pub trait SettingsSource: Send + Sync {
    /// Settings text of a category; `SettingNotFound` when absent
    fn setting(&self, category: SettingCategory) -> Result<String>;
}

pub trait MemorySource: Send + Sync {
    /// A character's memories ordered by occurrence time
    fn character_memories(&self, character: &str) -> Result<Vec<CharacterMemory>>;

    /// Characters that have memories
    fn characters(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
struct StoredChapter {
    title: String,
    text: String,
    status: String,
}

#[derive(Debug, Default)]
struct ProjectData {
    chapters: BTreeMap<u32, StoredChapter>,
    settings: BTreeMap<SettingCategory, String>,
    memories: BTreeMap<String, Vec<CharacterMemory>>,
}

/// A project held entirely in memory. Chapters and settings can be
/// replaced while the engine is running.
#[derive(Debug, Default)]
pub struct InMemoryProject {
    data: Mutex<ProjectData>,
}

impl InMemoryProject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chapter(self, chapter: u32, title: impl Into<String>, text: impl Into<String>) -> Self {
        self.data.lock().chapters.insert(
            chapter,
            StoredChapter {
                title: title.into(),
                text: text.into(),
                status: "draft".to_string(),
            },
        );
        self
    }

    pub fn with_setting(self, category: SettingCategory, text: impl Into<String>) -> Self {
        self.data.lock().settings.insert(category, text.into());
        self
    }

    pub fn with_memory(self, character: impl Into<String>, memory: CharacterMemory) -> Self {
        self.push_memory(character, memory);
        self
    }

    /// Replace a chapter's text, keeping its title
    pub fn update_chapter(&self, chapter: u32, text: impl Into<String>) {
        let mut data = self.data.lock();
        let entry = data.chapters.entry(chapter).or_insert_with(|| StoredChapter {
            title: format!("Chapter {chapter}"),
            text: String::new(),
            status: "draft".to_string(),
        });
        entry.text = text.into();
    }

    pub fn update_setting(&self, category: SettingCategory, text: impl Into<String>) {
        self.data.lock().settings.insert(category, text.into());
    }

    pub fn remove_chapter(&self, chapter: u32) {
        self.data.lock().chapters.remove(&chapter);
    }

    fn push_memory(&self, character: impl Into<String>, memory: CharacterMemory) {
        let mut data = self.data.lock();
        let memories = data.memories.entry(character.into()).or_default();
        memories.push(memory);
        memories.sort_by_key(|m| m.occurrence_time);
    }
}

impl ChapterSource for InMemoryProject {
    fn chapter_text(&self, chapter: u32) -> Result<String> {
        self.data
            .lock()
            .chapters
            .get(&chapter)
            .map(|c| c.text.clone())
            .ok_or(ContextError::ChapterNotFound(chapter))
    }

    fn chapter_metadata(&self, chapter: u32) -> Result<ChapterMetadata> {
        let data = self.data.lock();
        let stored = data.chapters.get(&chapter).ok_or(ContextError::ChapterNotFound(chapter))?;
        Ok(ChapterMetadata {
            title: stored.title.clone(),
            word_count: words(&stored.text).len(),
            status: stored.status.clone(),
        })
    }

    fn chapter_numbers(&self) -> Result<Vec<u32>> {
        Ok(self.data.lock().chapters.keys().copied().collect())
    }
}

impl SettingsSource for InMemoryProject {
    fn setting(&self, category: SettingCategory) -> Result<String> {
        self.data
            .lock()
            .settings
            .get(&category)
            .cloned()
            .ok_or_else(|| ContextError::SettingNotFound(category.to_string()))
    }
}

impl MemorySource for InMemoryProject {
    fn character_memories(&self, character: &str) -> Result<Vec<CharacterMemory>> {
        Ok(self.data.lock().memories.get(character).cloned().unwrap_or_default())
    }

    fn characters(&self) -> Result<Vec<String>> {
        Ok(self.data.lock().memories.keys().cloned().collect())
    }
}

/// Front matter fields read from a chapter file
#[derive(Debug, Default, PartialEq)]
struct FrontMatter {
    title: Option<String>,
    status: Option<String>,
}

/// Split `---`-delimited front matter from a chapter body
fn split_front_matter(raw: &str) -> (FrontMatter, &str) {
    let mut front = FrontMatter::default();
    let Some(rest) = raw.strip_prefix("---") else {
        return (front, raw);
    };
    let Some(end) = rest.find("\n---") else {
        return (front, raw);
    };

    for line in rest[..end].lines() {
        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "title" => front.title = Some(value),
                "status" => front.status = Some(value),
                _ => {}
            }
        }
    }

    let body = &rest[end + "\n---".len()..];
    let body = body.split_once('\n').map_or("", |(_, body)| body);
    (front, body.trim_start_matches('\n'))
}

/// Reads a project from the on-disk manuscript layout
#[derive(Debug, Clone)]
pub struct FileProject {
    root: PathBuf,
}

impl FileProject {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(ContextError::Storage(format!(
                "Project directory does not exist: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    fn chapters_dir(&self) -> PathBuf {
        self.root.join("manuscript").join("chapters")
    }

    fn chapter_path(&self, chapter: u32) -> PathBuf {
        let name = format!("chapter_{:02}", chapter);
        self.chapters_dir().join(&name).join(format!("{name}.md"))
    }

    fn memory_dir(&self) -> PathBuf {
        self.root.join("settings").join("memory")
    }

    fn read_chapter(&self, chapter: u32) -> Result<String> {
        let path = self.chapter_path(chapter);
        if !path.exists() {
            return Err(ContextError::ChapterNotFound(chapter));
        }
        fs::read_to_string(&path)
            .map_err(|e| ContextError::Storage(format!("Failed to read chapter {}: {}", chapter, e)))
    }
}

impl ChapterSource for FileProject {
    fn chapter_text(&self, chapter: u32) -> Result<String> {
        let raw = self.read_chapter(chapter)?;
        let (_, body) = split_front_matter(&raw);
        Ok(body.to_string())
    }

    fn chapter_metadata(&self, chapter: u32) -> Result<ChapterMetadata> {
        let raw = self.read_chapter(chapter)?;
        let (front, body) = split_front_matter(&raw);
        Ok(ChapterMetadata {
            title: front.title.unwrap_or_else(|| format!("Chapter {chapter}")),
            word_count: words(body).len(),
            status: front.status.unwrap_or_else(|| "draft".to_string()),
        })
    }

    fn chapter_numbers(&self) -> Result<Vec<u32>> {
        let dir = self.chapters_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir)
            .map_err(|e| ContextError::Storage(format!("Failed to read chapters directory: {}", e)))?;
        let mut numbers = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ContextError::Storage(format!("Failed to read directory entry: {}", e)))?;
            let number = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("chapter_"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(number) = number {
                if self.chapter_path(number).exists() {
                    numbers.push(number);
                }
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }
}

impl SettingsSource for FileProject {
    fn setting(&self, category: SettingCategory) -> Result<String> {
        let dir = self.root.join("settings").join(category.as_str());
        let single = self.root.join("settings").join(format!("{}.md", category.as_str()));

        let mut files: Vec<PathBuf> = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("md"))
                .collect(),
            Err(_) => Vec::new(),
        };
        if single.exists() {
            files.push(single);
        }
        files.sort();

        let mut parts = Vec::with_capacity(files.len());
        for path in &files {
            match fs::read_to_string(path) {
                Ok(text) if !text.trim().is_empty() => parts.push(text.trim().to_string()),
                Ok(_) => {}
                Err(e) => warn!("Failed to read settings file {}: {}", path.display(), e),
            }
        }
        if parts.is_empty() {
            return Err(ContextError::SettingNotFound(category.to_string()));
        }
        debug!("Loaded {} settings file(s) for {}", parts.len(), category);
        Ok(parts.join("\n\n"))
    }
}

impl MemorySource for FileProject {
    fn character_memories(&self, character: &str) -> Result<Vec<CharacterMemory>> {
        let path = self.memory_dir().join(format!("{character}.json"));
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&path)
            .map_err(|e| ContextError::Storage(format!("Failed to read memories of {}: {}", character, e)))?;
        let mut memories: Vec<CharacterMemory> = serde_json::from_str(&data)?;
        memories.sort_by_key(|m| m.occurrence_time);
        Ok(memories)
    }

    fn characters(&self) -> Result<Vec<String>> {
        let dir = self.memory_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir)
            .map_err(|e| ContextError::Storage(format!("Failed to read memory directory: {}", e)))?;
        let mut characters: Vec<String> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("json"))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        characters.sort();
        Ok(characters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory(content: &str, weight: u8, day: u32) -> CharacterMemory {
        CharacterMemory {
            content: content.to_string(),
            emotional_weight: weight,
            occurrence_time: format!("2024-03-{day:02}T12:00:00Z").parse().unwrap(),
        }
    }

    #[test]
    fn test_front_matter_is_stripped() {
        let raw = "---\ntitle: \"The Bridge\"\nstatus: final\n---\n\nArden crossed the river.";
        let (front, body) = split_front_matter(raw);
        assert_eq!(front.title.as_deref(), Some("The Bridge"));
        assert_eq!(front.status.as_deref(), Some("final"));
        assert_eq!(body, "Arden crossed the river.");

        let (front, body) = split_front_matter("No front matter here.");
        assert_eq!(front, FrontMatter::default());
        assert_eq!(body, "No front matter here.");
    }

    #[test]
    fn test_in_memory_project() {
        let project = InMemoryProject::new()
            .with_chapter(1, "Dawn", "Arden woke early.")
            .with_setting(SettingCategory::World, "magic: forbidden")
            .with_memory("Mira", memory("Lost her brother", 9, 5))
            .with_memory("Mira", memory("First sword", 4, 1));

        assert_eq!(project.chapter_text(1).unwrap(), "Arden woke early.");
        assert!(project.chapter_text(2).unwrap_err().is_missing_source());
        assert_eq!(project.chapter_metadata(1).unwrap().word_count, 3);
        assert!(matches!(
            project.setting(SettingCategory::Plot),
            Err(ContextError::SettingNotFound(_))
        ));

        let memories = project.character_memories("Mira").unwrap();
        assert_eq!(memories[0].content, "First sword");
        assert!(project.character_memories("Nobody").unwrap().is_empty());

        project.update_chapter(1, "Arden slept in.");
        assert_eq!(project.chapter_text(1).unwrap(), "Arden slept in.");
    }

    #[test]
    fn test_file_project_layout() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        for (chapter, body) in [(1, "The first chapter."), (2, "The second chapter.")] {
            let dir = root.join(format!("manuscript/chapters/chapter_{chapter:02}"));
            fs::create_dir_all(&dir).unwrap();
            fs::write(
                dir.join(format!("chapter_{chapter:02}.md")),
                format!("---\ntitle: Part {chapter}\nstatus: draft\n---\n{body}"),
            )
            .unwrap();
        }
        fs::create_dir_all(root.join("manuscript/chapters/notes")).unwrap();

        fs::create_dir_all(root.join("settings/world")).unwrap();
        fs::write(root.join("settings/world/b.md"), "season: winter").unwrap();
        fs::write(root.join("settings/world/a.md"), "magic: forbidden").unwrap();

        fs::create_dir_all(root.join("settings/memory")).unwrap();
        let memories = vec![memory("Saw the fire", 8, 2)];
        fs::write(
            root.join("settings/memory/Arden.json"),
            serde_json::to_string(&memories).unwrap(),
        )
        .unwrap();

        let project = FileProject::new(root).unwrap();
        assert_eq!(project.chapter_numbers().unwrap(), vec![1, 2]);
        assert_eq!(project.chapter_text(2).unwrap(), "The second chapter.");
        assert_eq!(project.chapter_metadata(1).unwrap().title, "Part 1");
        assert!(matches!(project.chapter_text(9), Err(ContextError::ChapterNotFound(9))));

        assert_eq!(
            project.setting(SettingCategory::World).unwrap(),
            "magic: forbidden\n\nseason: winter"
        );
        assert!(project.setting(SettingCategory::Style).is_err());

        assert_eq!(project.characters().unwrap(), vec!["Arden".to_string()]);
        assert_eq!(project.character_memories("Arden").unwrap(), memories);
    }
}
