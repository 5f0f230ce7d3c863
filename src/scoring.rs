//! Importance scoring for context components and ranking of sentences
//! inside a chapter.
//!
//! Every sub-score is a named function returning a value in `[0, 1]` so it
//! can be tested on its own. The composite scores are fixed convex
//! combinations whose weights come from [`ScoringConfig`].

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::component::{ComponentKind, ContextComponent};
use crate::error::{ContextError, Result};
use crate::text::{self, is_complete_sentence, split_sentences, words};
use crate::tier::ContentCategory;
use crate::tokens::estimate_tokens;

/// Base weight per component kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BaseWeights {
    pub memory: f64,
    pub bridge: f64,
    pub recent: f64,
    pub medium: f64,
    pub long_term: f64,
}

impl Default for BaseWeights {
    fn default() -> Self {
        Self {
            memory: 0.7,
            bridge: 0.85,
            recent: 0.8,
            medium: 0.6,
            long_term: 0.4,
        }
    }
}

/// Weights of the four quality heuristics; must sum to 1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QualityWeights {
    pub information_density: f64,
    pub structural_completeness: f64,
    pub topical_relevance: f64,
    pub language_fluency: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            information_density: 0.3,
            structural_completeness: 0.2,
            topical_relevance: 0.3,
            language_fluency: 0.2,
        }
    }
}

/// Weights of the sentence ranking signals; must sum to 1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SegmentWeights {
    pub keywords: f64,
    pub emotion: f64,
    pub action: f64,
    pub position: f64,
}

impl Default for SegmentWeights {
    fn default() -> Self {
        Self {
            keywords: 0.35,
            emotion: 0.2,
            action: 0.2,
            position: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringConfig {
    pub base_weights: BaseWeights,
    /// Importance lost per chapter of distance
    pub decay_slope: f64,
    /// Lowest value distance decay can reach
    pub decay_floor: f64,
    /// Fixed score for the current chapter
    pub pinned_current: f64,
    /// Fixed score for settings
    pub pinned_setting: f64,
    pub quality: QualityWeights,
    pub segments: SegmentWeights,
    /// Sentence lengths (in words) considered fluent
    pub fluent_sentence_words: (usize, usize),
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_weights: BaseWeights::default(),
            decay_slope: 0.02,
            decay_floor: 0.1,
            pinned_current: 1.0,
            pinned_setting: 0.9,
            quality: QualityWeights::default(),
            segments: SegmentWeights::default(),
            fluent_sentence_words: (6, 40),
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<()> {
        let q = &self.quality;
        check_convex(
            "quality",
            &[
                q.information_density,
                q.structural_completeness,
                q.topical_relevance,
                q.language_fluency,
            ],
        )?;
        let s = &self.segments;
        check_convex("segment", &[s.keywords, s.emotion, s.action, s.position])?;

        let b = &self.base_weights;
        let unit = [
            b.memory,
            b.bridge,
            b.recent,
            b.medium,
            b.long_term,
            self.decay_floor,
            self.pinned_current,
            self.pinned_setting,
        ];
        if unit.iter().any(|w| !(0.0..=1.0).contains(w)) {
            return Err(ContextError::Config("scoring weights must lie in [0, 1]".to_string()));
        }
        if self.decay_slope < 0.0 {
            return Err(ContextError::Config("decay_slope must not be negative".to_string()));
        }
        let (min_words, max_words) = self.fluent_sentence_words;
        if min_words == 0 || min_words > max_words {
            return Err(ContextError::Config("fluent_sentence_words must be a non-empty range".to_string()));
        }
        Ok(())
    }
}

fn check_convex(name: &str, weights: &[f64]) -> Result<()> {
    if weights.iter().any(|w| *w < 0.0) {
        return Err(ContextError::Config(format!("{name} weights must not be negative")));
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > 1e-6 {
        return Err(ContextError::Config(format!("{name} weights sum to {sum}, expected 1")));
    }
    Ok(())
}

/// A sentence of a chapter with its ranking score
#[derive(Debug, Clone, PartialEq)]
pub struct RankedSegment {
    /// Position of the sentence in the source
    pub index: usize,
    pub text: String,
    pub score: f64,
    pub tokens: usize,
}

/// Scores components and ranks sentences
#[derive(Debug, Clone, Default)]
pub struct ContentScorer {
    config: ScoringConfig,
    focus_terms: BTreeSet<String>,
}

impl ContentScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            config,
            focus_terms: BTreeSet::new(),
        }
    }

    /// Terms (usually character and place names from the current chapter)
    /// that make content topically relevant
    pub fn with_focus_terms(mut self, terms: impl IntoIterator<Item = String>) -> Self {
        self.focus_terms = terms.into_iter().collect();
        self
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Importance of a component relative to the chapter being assembled.
    ///
    /// The current chapter and settings are pinned regardless of distance.
    pub fn score(&self, component: &ContextComponent, current_chapter: u32) -> f64 {
        let weights = &self.config.base_weights;
        let base = match component.kind {
            ComponentKind::CurrentChapter => return self.config.pinned_current,
            ComponentKind::Setting => return self.config.pinned_setting,
            ComponentKind::Memory => weights.memory,
            ComponentKind::Bridge => weights.bridge,
            ComponentKind::RecentCompression => weights.recent,
            ComponentKind::MediumCompression => weights.medium,
            ComponentKind::LongTermCompression => weights.long_term,
        };
        let decay = component
            .distance_from(current_chapter)
            .map_or(1.0, |d| self.distance_decay(d));
        (base * decay * self.quality(&component.content)).clamp(0.0, 1.0)
    }

    /// `max(floor, 1 - slope × distance)`
    pub fn distance_decay(&self, distance: u32) -> f64 {
        (1.0 - self.config.decay_slope * f64::from(distance)).max(self.config.decay_floor)
    }

    /// Convex combination of the four quality heuristics
    pub fn quality(&self, content: &str) -> f64 {
        let w = &self.config.quality;
        let score = w.information_density * information_density(content)
            + w.structural_completeness * structural_completeness(content)
            + w.topical_relevance * self.topical_relevance(content)
            + w.language_fluency * self.language_fluency(content);
        score.clamp(0.0, 1.0)
    }

    /// Share of focus terms the content mentions; neutral without focus
    pub fn topical_relevance(&self, content: &str) -> f64 {
        if self.focus_terms.is_empty() {
            return 0.5;
        }
        let wanted = self.focus_terms.len().min(5);
        let hits = self
            .focus_terms
            .iter()
            .filter(|term| text::mentions(content, term))
            .count();
        (hits as f64 / wanted as f64).min(1.0)
    }

    /// 1 inside the fluent sentence-length band, falling off outside it
    pub fn language_fluency(&self, content: &str) -> f64 {
        let sentences = split_sentences(content);
        if sentences.is_empty() {
            return 0.0;
        }
        let total_words: usize = sentences.iter().map(|s| words(s).len()).sum();
        let average = total_words as f64 / sentences.len() as f64;
        let (min_words, max_words) = self.config.fluent_sentence_words;
        if average < min_words as f64 {
            average / min_words as f64
        } else if average > max_words as f64 {
            max_words as f64 / average
        } else {
            1.0
        }
    }

    /// Rank every sentence that belongs to `category`.
    ///
    /// `entities` are names found anywhere in the chapter; mentioning them
    /// counts as keyword presence. Results are sorted by descending score,
    /// ties broken by source order.
    pub fn rank_segments(
        &self,
        sentences: &[String],
        category: ContentCategory,
        entities: &BTreeSet<String>,
    ) -> Vec<RankedSegment> {
        let total = sentences.len();
        let mut ranked: Vec<RankedSegment> = sentences
            .iter()
            .enumerate()
            .filter_map(|(index, sentence)| {
                let lowered = sentence.to_lowercase();
                if !category.accepts(sentence, &lowered) {
                    return None;
                }
                Some(RankedSegment {
                    index,
                    text: sentence.clone(),
                    score: self.segment_score(sentence, &lowered, index, total, category, entities),
                    tokens: estimate_tokens(sentence),
                })
            })
            .collect();

        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.index.cmp(&b.index)));
        ranked
    }

    fn segment_score(
        &self,
        sentence: &str,
        lowered: &str,
        index: usize,
        total: usize,
        category: ContentCategory,
        entities: &BTreeSet<String>,
    ) -> f64 {
        let w = &self.config.segments;
        let entity_hits = entities.iter().filter(|e| text::mentions(sentence, e)).count();
        let keywords = ((category.keyword_hits(lowered) + entity_hits) as f64 / 3.0).min(1.0);
        w.keywords * keywords
            + w.emotion * emotional_intensity(sentence, lowered)
            + w.action * action_density(sentence, lowered)
            + w.position * position_weight(index, total)
    }
}

/// Lexical diversity: distinct words over total words
pub fn information_density(content: &str) -> f64 {
    let all = words(content);
    if all.is_empty() {
        return 0.0;
    }
    let distinct: HashSet<String> = all.iter().map(|w| w.to_lowercase()).collect();
    distinct.len() as f64 / all.len() as f64
}

/// Share of segments that are complete sentences or structured lines
pub fn structural_completeness(content: &str) -> f64 {
    let sentences = split_sentences(content);
    if sentences.is_empty() {
        return 0.0;
    }
    let complete = sentences
        .iter()
        .filter(|s| is_complete_sentence(s) || s.starts_with('#') || s.starts_with("- "))
        .count();
    complete as f64 / sentences.len() as f64
}

/// Emotion keywords and exclamations, saturating at two signals
pub fn emotional_intensity(sentence: &str, lowered: &str) -> f64 {
    let exclamations = sentence.matches(['!', '！']).count();
    ((text::EMOTION_WORDS.hits(lowered) + exclamations) as f64 / 2.0).min(1.0)
}

/// Action verbs per word, scaled so one verb in five words saturates
pub fn action_density(sentence: &str, lowered: &str) -> f64 {
    let word_count = words(sentence).len();
    if word_count == 0 {
        return 0.0;
    }
    (text::ACTION_VERBS.hits(lowered) as f64 * 5.0 / word_count as f64).min(1.0)
}

/// Openings and closings of a chapter carry more weight
pub fn position_weight(index: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let edge = (total / 10).max(1);
    if index < edge || index >= total.saturating_sub(edge) {
        1.0
    } else {
        0.4
    }
}
