//! Compression tiers and the content categories each tier retains.

use serde::{Deserialize, Serialize};

use crate::error::{ContextError, Result};
use crate::text::{self, Lexicon};

/// Named compression tier, finest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierName {
    Recent,
    Medium,
    LongTerm,
}

impl TierName {
    pub const ALL: [TierName; 3] = [TierName::Recent, TierName::Medium, TierName::LongTerm];

    pub fn as_str(self) -> &'static str {
        match self {
            TierName::Recent => "recent",
            TierName::Medium => "medium",
            TierName::LongTerm => "long_term",
        }
    }

    /// Next coarser tier, if any
    pub fn coarser(self) -> Option<TierName> {
        match self {
            TierName::Recent => Some(TierName::Medium),
            TierName::Medium => Some(TierName::LongTerm),
            TierName::LongTerm => None,
        }
    }

    /// Next finer tier, if any
    pub fn finer(self) -> Option<TierName> {
        match self {
            TierName::Recent => None,
            TierName::Medium => Some(TierName::Recent),
            TierName::LongTerm => Some(TierName::Medium),
        }
    }
}

impl std::fmt::Display for TierName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content categories extracted from chapter text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentCategory {
    PlotSummary,
    CharacterActions,
    KeyDialogue,
    SceneChanges,
    EmotionalBeats,
    TimelineMarkers,
    MajorEvents,
    CharacterDevelopment,
    PlotAdvancements,
    KeyRelationships,
    MajorArc,
    StoryImpact,
    CharacterDestinations,
    ThematicElements,
    LegacyNotes,
}

impl ContentCategory {
    /// Categories in the order they are sacrificed when an artifact is over
    /// its ceiling.
    pub const REMOVAL_ORDER: [ContentCategory; 15] = [
        ContentCategory::LegacyNotes,
        ContentCategory::ThematicElements,
        ContentCategory::TimelineMarkers,
        ContentCategory::EmotionalBeats,
        ContentCategory::SceneChanges,
        ContentCategory::KeyDialogue,
        ContentCategory::CharacterActions,
        ContentCategory::KeyRelationships,
        ContentCategory::PlotAdvancements,
        ContentCategory::CharacterDevelopment,
        ContentCategory::CharacterDestinations,
        ContentCategory::StoryImpact,
        ContentCategory::MajorEvents,
        ContentCategory::MajorArc,
        ContentCategory::PlotSummary,
    ];

    pub fn heading(self) -> &'static str {
        match self {
            ContentCategory::PlotSummary => "Plot summary",
            ContentCategory::CharacterActions => "Character actions",
            ContentCategory::KeyDialogue => "Key dialogue",
            ContentCategory::SceneChanges => "Scene changes",
            ContentCategory::EmotionalBeats => "Emotional beats",
            ContentCategory::TimelineMarkers => "Timeline",
            ContentCategory::MajorEvents => "Major events",
            ContentCategory::CharacterDevelopment => "Character development",
            ContentCategory::PlotAdvancements => "Plot advancements",
            ContentCategory::KeyRelationships => "Relationships",
            ContentCategory::MajorArc => "Story arc",
            ContentCategory::StoryImpact => "Story impact",
            ContentCategory::CharacterDestinations => "Character end-states",
            ContentCategory::ThematicElements => "Themes",
            ContentCategory::LegacyNotes => "Foreshadowing",
        }
    }

    /// Position in the removal order; lower is removed first.
    pub fn removal_rank(self) -> usize {
        Self::REMOVAL_ORDER
            .iter()
            .position(|c| *c == self)
            .unwrap_or(Self::REMOVAL_ORDER.len())
    }

    /// General categories consider every sentence, so a tier always has
    /// something to retain.
    pub fn is_general(self) -> bool {
        matches!(self, ContentCategory::PlotSummary | ContentCategory::MajorArc)
    }

    fn lexicon(self) -> Option<Lexicon> {
        match self {
            ContentCategory::CharacterActions => Some(text::ACTION_VERBS),
            ContentCategory::SceneChanges => Some(text::SCENE_MARKERS),
            ContentCategory::EmotionalBeats => Some(text::EMOTION_WORDS),
            ContentCategory::TimelineMarkers => Some(text::TIME_MARKERS),
            ContentCategory::MajorEvents => Some(text::MAJOR_EVENTS),
            ContentCategory::CharacterDevelopment => Some(text::DEVELOPMENT),
            ContentCategory::PlotAdvancements => Some(text::ADVANCEMENT),
            ContentCategory::KeyRelationships => Some(text::RELATIONSHIP),
            ContentCategory::StoryImpact => Some(text::IMPACT),
            ContentCategory::CharacterDestinations => Some(text::DESTINATION),
            ContentCategory::ThematicElements => Some(text::THEMES),
            ContentCategory::LegacyNotes => Some(text::FORESHADOWING),
            ContentCategory::PlotSummary | ContentCategory::MajorArc | ContentCategory::KeyDialogue => None,
        }
    }

    /// Whether a sentence belongs to this category
    pub fn accepts(self, sentence: &str, lowered: &str) -> bool {
        if self.is_general() {
            return true;
        }
        if self == ContentCategory::KeyDialogue {
            return text::is_dialogue(sentence);
        }
        self.lexicon().is_some_and(|lexicon| lexicon.matches(lowered))
    }

    /// Keyword hits used when ranking a sentence within this category
    pub fn keyword_hits(self, lowered: &str) -> usize {
        match self {
            ContentCategory::PlotSummary | ContentCategory::MajorArc => {
                text::PLOT_INDICATORS.hits(lowered) + text::MAJOR_EVENTS.hits(lowered)
            }
            ContentCategory::KeyDialogue => text::PLOT_INDICATORS.hits(lowered),
            other => other.lexicon().map_or(0, |lexicon| lexicon.hits(lowered)),
        }
    }
}

/// A category retained by a tier, with its share of the tier's budget
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetainedCategory {
    pub category: ContentCategory,
    pub weight: f64,
}

impl RetainedCategory {
    pub fn new(category: ContentCategory, weight: f64) -> Self {
        Self { category, weight }
    }
}

/// Compression policy for one tier.
///
/// `min_distance..max_distance` is measured in chapters back from the
/// chapter being assembled; `max_distance = None` means unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierPolicy {
    pub name: TierName,
    pub min_distance: u32,
    pub max_distance: Option<u32>,
    pub target_ratio: f64,
    /// Absolute ceiling regardless of chapter length
    pub max_tokens: usize,
    /// Retained categories, highest priority first
    pub retained: Vec<RetainedCategory>,
}

impl TierPolicy {
    pub fn contains(&self, distance: u32) -> bool {
        distance >= self.min_distance && self.max_distance.is_none_or(|max| distance < max)
    }

    /// Target size for an artifact of a chapter with `original_tokens`
    pub fn target_tokens(&self, original_tokens: usize) -> usize {
        let by_ratio = (original_tokens as f64 * self.target_ratio).floor() as usize;
        by_ratio.min(self.max_tokens)
    }

    /// Hard ceiling: target plus the configured tolerance
    pub fn ceiling(&self, original_tokens: usize, tolerance: f64) -> usize {
        (self.target_tokens(original_tokens) as f64 * (1.0 + tolerance)).floor() as usize
    }

    pub fn retains(&self, category: ContentCategory) -> bool {
        self.retained.iter().any(|r| r.category == category)
    }

    fn total_weight(&self) -> f64 {
        self.retained.iter().map(|r| r.weight).sum()
    }

    /// Share of `budget` given to `category`
    pub fn category_budget(&self, category: ContentCategory, budget: usize) -> usize {
        let total = self.total_weight();
        if total <= 0.0 {
            return 0;
        }
        self.retained
            .iter()
            .find(|r| r.category == category)
            .map_or(0, |r| (budget as f64 * r.weight / total).floor() as usize)
    }
}

/// The three tier policies of a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierSet {
    pub recent: TierPolicy,
    pub medium: TierPolicy,
    pub long_term: TierPolicy,
}

impl Default for TierSet {
    fn default() -> Self {
        use ContentCategory::*;
        Self {
            recent: TierPolicy {
                name: TierName::Recent,
                min_distance: 1,
                max_distance: Some(10),
                target_ratio: 0.10,
                max_tokens: 2000,
                retained: vec![
                    RetainedCategory::new(PlotSummary, 0.30),
                    RetainedCategory::new(CharacterActions, 0.20),
                    RetainedCategory::new(KeyDialogue, 0.15),
                    RetainedCategory::new(EmotionalBeats, 0.15),
                    RetainedCategory::new(SceneChanges, 0.10),
                    RetainedCategory::new(TimelineMarkers, 0.10),
                ],
            },
            medium: TierPolicy {
                name: TierName::Medium,
                min_distance: 10,
                max_distance: Some(50),
                target_ratio: 0.025,
                max_tokens: 500,
                retained: vec![
                    RetainedCategory::new(PlotSummary, 0.35),
                    RetainedCategory::new(MajorEvents, 0.25),
                    RetainedCategory::new(CharacterDevelopment, 0.15),
                    RetainedCategory::new(PlotAdvancements, 0.15),
                    RetainedCategory::new(KeyRelationships, 0.10),
                ],
            },
            long_term: TierPolicy {
                name: TierName::LongTerm,
                min_distance: 50,
                max_distance: None,
                target_ratio: 0.005,
                max_tokens: 100,
                retained: vec![
                    RetainedCategory::new(MajorArc, 0.35),
                    RetainedCategory::new(StoryImpact, 0.20),
                    RetainedCategory::new(CharacterDestinations, 0.20),
                    RetainedCategory::new(ThematicElements, 0.15),
                    RetainedCategory::new(LegacyNotes, 0.10),
                ],
            },
        }
    }
}

impl TierSet {
    pub fn policy(&self, name: TierName) -> &TierPolicy {
        match name {
            TierName::Recent => &self.recent,
            TierName::Medium => &self.medium,
            TierName::LongTerm => &self.long_term,
        }
    }

    /// Tier applicable to a chapter `distance` chapters back. Distance 0 is
    /// the current chapter and has no tier.
    pub fn resolve(&self, distance: u32) -> Option<TierName> {
        TierName::ALL
            .into_iter()
            .find(|name| self.policy(*name).contains(distance))
    }

    /// Check that the ranges partition `[1, ∞)` in tier order and that
    /// coarser tiers never keep a larger share of the source.
    pub fn validate(&self) -> Result<()> {
        let mut expected_min = 1;
        for name in TierName::ALL {
            let policy = self.policy(name);
            if policy.name != name {
                return Err(ContextError::Config(format!(
                    "tier slot {name} holds a policy named {}",
                    policy.name
                )));
            }
            if policy.min_distance != expected_min {
                return Err(ContextError::Config(format!(
                    "{name} tier starts at distance {}, expected {expected_min}",
                    policy.min_distance
                )));
            }
            match (name, policy.max_distance) {
                (TierName::LongTerm, None) => {}
                (TierName::LongTerm, Some(_)) => {
                    return Err(ContextError::Config("long_term tier must be unbounded".to_string()));
                }
                (_, None) => {
                    return Err(ContextError::Config(format!("{name} tier must have a max_distance")));
                }
                (_, Some(max)) if max <= policy.min_distance => {
                    return Err(ContextError::Config(format!("{name} tier has an empty range")));
                }
                (_, Some(max)) => expected_min = max,
            }
            if !(policy.target_ratio > 0.0 && policy.target_ratio <= 1.0) {
                return Err(ContextError::Config(format!(
                    "{name} target_ratio {} is outside (0, 1]",
                    policy.target_ratio
                )));
            }
            if policy.retained.is_empty() || policy.total_weight() <= 0.0 {
                return Err(ContextError::Config(format!("{name} tier retains no categories")));
            }
            if policy.retained.iter().any(|r| r.weight < 0.0) {
                return Err(ContextError::Config(format!("{name} tier has a negative category weight")));
            }
        }

        for name in [TierName::Recent, TierName::Medium] {
            let coarser = name.coarser().map(|c| self.policy(c));
            if let Some(coarser) = coarser {
                if coarser.target_ratio > self.policy(name).target_ratio {
                    return Err(ContextError::Config(format!(
                        "{} target_ratio must not exceed {name}'s",
                        coarser.name
                    )));
                }
            }
        }
        Ok(())
    }
}
