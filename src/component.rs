//! Context components: the units the allocator budgets and the assembler
//! concatenates.

use serde::{Deserialize, Serialize};

use crate::text::split_segments;
use crate::tier::TierName;
use crate::tokens::estimate_tokens;

/// Kind of content carried by a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    CurrentChapter,
    Setting,
    Memory,
    Bridge,
    RecentCompression,
    MediumCompression,
    LongTermCompression,
}

impl ComponentKind {
    /// Position in the assembled context; lower comes first.
    pub fn priority(self) -> u8 {
        match self {
            ComponentKind::CurrentChapter => 0,
            ComponentKind::Setting => 1,
            ComponentKind::Memory => 2,
            ComponentKind::Bridge => 3,
            ComponentKind::RecentCompression => 4,
            ComponentKind::MediumCompression => 5,
            ComponentKind::LongTermCompression => 6,
        }
    }

    /// Component kind produced by artifacts of the given tier
    pub fn for_tier(tier: TierName) -> Self {
        match tier {
            TierName::Recent => ComponentKind::RecentCompression,
            TierName::Medium => ComponentKind::MediumCompression,
            TierName::LongTerm => ComponentKind::LongTermCompression,
        }
    }

    pub fn tier(self) -> Option<TierName> {
        match self {
            ComponentKind::RecentCompression => Some(TierName::Recent),
            ComponentKind::MediumCompression => Some(TierName::Medium),
            ComponentKind::LongTermCompression => Some(TierName::LongTerm),
            _ => None,
        }
    }
}

/// Settings categories served by the settings store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingCategory {
    World,
    Characters,
    Environments,
    Plot,
    Style,
}

impl SettingCategory {
    pub const ALL: [SettingCategory; 5] = [
        SettingCategory::World,
        SettingCategory::Characters,
        SettingCategory::Environments,
        SettingCategory::Plot,
        SettingCategory::Style,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SettingCategory::World => "world",
            SettingCategory::Characters => "characters",
            SettingCategory::Environments => "environments",
            SettingCategory::Plot => "plot",
            SettingCategory::Style => "style",
        }
    }
}

impl std::fmt::Display for SettingCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of candidate context.
///
/// Components are never edited in place; `truncated_to` and the `with_*`
/// builders return new values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextComponent {
    pub kind: ComponentKind,
    /// Setting category, character name or tier label
    pub label: String,
    pub content: String,
    pub token_count: usize,
    /// Importance in [0, 1]
    pub importance: f64,
    pub chapter: Option<u32>,
    pub compressible: bool,
    /// Soft minimum honoured by the allocator when the budget allows
    pub min_tokens: usize,
}

impl ContextComponent {
    /// Create a component, estimating its token count from the content
    pub fn new(kind: ComponentKind, label: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            kind,
            label: label.into(),
            token_count: estimate_tokens(&content),
            content,
            importance: 0.0,
            chapter: None,
            compressible: kind != ComponentKind::CurrentChapter,
            min_tokens: 0,
        }
    }

    pub fn current_chapter(chapter: u32, content: impl Into<String>) -> Self {
        Self::new(ComponentKind::CurrentChapter, format!("chapter {chapter}"), content).with_chapter(chapter)
    }

    pub fn setting(category: SettingCategory, content: impl Into<String>) -> Self {
        Self::new(ComponentKind::Setting, category.as_str(), content)
    }

    pub fn with_chapter(mut self, chapter: u32) -> Self {
        self.chapter = Some(chapter);
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_min_tokens(mut self, min_tokens: usize) -> Self {
        self.min_tokens = min_tokens;
        self
    }

    /// Distance from the chapter being assembled, if the component is tied
    /// to a chapter
    pub fn distance_from(&self, current_chapter: u32) -> Option<u32> {
        self.chapter.map(|c| c.abs_diff(current_chapter))
    }

    /// Keep the longest prefix of whole segments that fits in `max_tokens`.
    ///
    /// Returns `None` when not even the first segment fits. Segments are
    /// sentences or lines, so the content is never cut mid-sentence; for
    /// rendered artifacts the trailing segments are the lowest ranked ones.
    pub fn truncated_to(&self, max_tokens: usize) -> Option<ContextComponent> {
        if self.token_count <= max_tokens {
            return Some(self.clone());
        }

        let mut kept_end = 0;
        let mut offset = 0;
        for segment in split_segments(&self.content) {
            offset += segment.len();
            let candidate = self.content[..offset].trim_end();
            if estimate_tokens(candidate) > max_tokens {
                break;
            }
            kept_end = offset;
        }

        let kept = self.content[..kept_end].trim_end();
        if kept.is_empty() {
            return None;
        }

        let mut truncated = self.clone();
        truncated.content = kept.to_string();
        truncated.token_count = estimate_tokens(kept);
        Some(truncated)
    }
}

/// Sort components into assembly order: by kind priority, then chapter
/// (oldest first), then label.
pub fn sort_by_priority(components: &mut [ContextComponent]) {
    components.sort_by(|a, b| {
        a.kind
            .priority()
            .cmp(&b.kind.priority())
            .then_with(|| a.chapter.cmp(&b.chapter))
            .then_with(|| a.label.cmp(&b.label))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_estimates_tokens() {
        let component = ContextComponent::setting(SettingCategory::World, "abcd".repeat(10));
        assert_eq!(component.token_count, 10);
        assert!(component.compressible);
        assert!(!ContextComponent::current_chapter(3, "x").compressible);
    }

    #[test]
    fn test_truncation_keeps_whole_sentences() {
        let content = "The gate fell at dawn. Arden ran for the river. Mira stayed behind to hold the bridge.";
        let component = ContextComponent::new(ComponentKind::RecentCompression, "recent", content);
        let truncated = component.truncated_to(12).unwrap();
        assert!(truncated.token_count <= 12);
        assert!(truncated.content.ends_with('.'));
        assert!(content.starts_with(&truncated.content));
        assert!(component.truncated_to(2).is_none());
    }

    #[test]
    fn test_priority_order() {
        let mut components = vec![
            ContextComponent::new(ComponentKind::LongTermCompression, "long_term", "a").with_chapter(1),
            ContextComponent::new(ComponentKind::RecentCompression, "recent", "b").with_chapter(9),
            ContextComponent::new(ComponentKind::RecentCompression, "recent", "c").with_chapter(8),
            ContextComponent::setting(SettingCategory::Plot, "d"),
            ContextComponent::current_chapter(10, "e"),
        ];
        sort_by_priority(&mut components);
        let order: Vec<&str> = components.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(order, vec!["e", "d", "c", "b", "a"]);
    }
}
