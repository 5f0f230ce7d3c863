//! Context assembly: the engine's primary entry point.
//!
//! [`ContextAssembler::build_context`] loads the current chapter, settings,
//! character memories and compressed history, scores them, fits them into
//! the token budget and concatenates them in priority order. It never fails:
//! anything that goes wrong along the way becomes a [`ContextIssue`] on the
//! response and marks it degraded.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::budget::{Allocation, TokenBudgetAllocator};
use crate::cache::{CacheKey, CacheStats, ContextCache, InvalidationReason};
use crate::component::{ComponentKind, ContextComponent, SettingCategory};
use crate::compression::{
    BatchReport, ChapterCompressionStatus, CompletionReport, CompressTarget, CompressionArtifact, CompressionEngine,
    ProjectCompressionStatus,
};
use crate::config::Config;
use crate::continuity::{ConsistencyValidator, ContinuityIssue, ContinuityReport};
use crate::error::{ContextError, Result};
use crate::scoring::ContentScorer;
use crate::source::{ChapterSource, MemorySource, SettingsSource};
use crate::storage::ArtifactStore;
use crate::text::extract_entities;
use crate::tier::TierName;
use crate::tokens::estimate_tokens;

/// Chapters recapped at most by one bridge component
const MAX_BRIDGE_CHAPTERS: usize = 8;

/// What the assembled context is for; selects the footer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    #[default]
    Writing,
    Review,
    Raw,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextRequest {
    pub chapter: u32,
    pub mode: GenerationMode,
    /// Falls back to the configured default budget
    pub total_budget: Option<usize>,
    /// Chapter the writer navigated from; a non-adjacent one is a jump
    pub previous_chapter: Option<u32>,
    /// Time allowed before compression misses fall back to cached artifacts
    pub deadline: Option<Duration>,
}

impl ContextRequest {
    pub fn new(chapter: u32) -> Self {
        Self {
            chapter,
            mode: GenerationMode::Writing,
            total_budget: None,
            previous_chapter: None,
            deadline: None,
        }
    }

    pub fn with_mode(mut self, mode: GenerationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_budget(mut self, total_budget: usize) -> Self {
        self.total_budget = Some(total_budget);
        self
    }

    pub fn from_chapter(mut self, previous_chapter: u32) -> Self {
        self.previous_chapter = Some(previous_chapter);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Whether the request navigates to a non-adjacent chapter
    pub fn is_jump(&self) -> bool {
        self.previous_chapter
            .is_some_and(|previous| previous != self.chapter && previous.checked_add(1) != Some(self.chapter))
    }
}

/// A soft failure reported alongside an assembled context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextIssue {
    /// Non-compressible content alone exceeds the budget
    BudgetInfeasible { required: usize, budget: usize },
    ContinuityViolation { issue: ContinuityIssue },
    /// An artifact fell back to a coarser policy or was accepted over budget
    DegradedCompression { chapter: u32, tier: TierName, quality: f64 },
    /// The deadline passed and an older artifact was used instead
    StaleArtifact { chapter: u32, wanted: TierName, used: TierName },
    /// Synthesised from neighbouring chapters because the source is missing
    InterpolatedArtifact { chapter: u32, tier: TierName },
    MissingHistory { chapter: u32, reason: String },
    MissingCurrentChapter { chapter: u32, reason: String },
    SourceUnavailable { source: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub chapter: u32,
    pub mode: GenerationMode,
    pub content: String,
    pub token_count: usize,
    pub budget: usize,
    /// Included components in priority order
    pub components: Vec<ContextComponent>,
    pub degraded: bool,
    pub issues: Vec<ContextIssue>,
    pub continuity: Option<ContinuityReport>,
}

impl AssembledContext {
    pub fn component(&self, kind: ComponentKind, chapter: Option<u32>) -> Option<&ContextComponent> {
        self.components
            .iter()
            .find(|c| c.kind == kind && (chapter.is_none() || c.chapter == chapter))
    }
}

/// Orchestrates sources, compression, cache and allocation for one project
pub struct ContextAssembler {
    config: Config,
    chapters: Arc<dyn ChapterSource>,
    settings: Arc<dyn SettingsSource>,
    memories: Arc<dyn MemorySource>,
    engine: Arc<CompressionEngine>,
    cache: Arc<ContextCache>,
    validator: ConsistencyValidator,
    scorer: ContentScorer,
    allocator: TokenBudgetAllocator,
}

impl ContextAssembler {
    /// Build an assembler over a project that serves chapters, settings and
    /// memories
    pub fn new<P>(config: Config, project: Arc<P>, store: Arc<dyn ArtifactStore>) -> Result<Self>
    where
        P: ChapterSource + SettingsSource + MemorySource + 'static,
    {
        Self::from_parts(config, project.clone(), project.clone(), project, store)
    }

    pub fn from_parts(
        config: Config,
        chapters: Arc<dyn ChapterSource>,
        settings: Arc<dyn SettingsSource>,
        memories: Arc<dyn MemorySource>,
        store: Arc<dyn ArtifactStore>,
    ) -> Result<Self> {
        config.validate()?;
        let scorer = ContentScorer::new(config.scoring.clone());
        let engine = Arc::new(CompressionEngine::new(
            config.tiers.clone(),
            config.compression.clone(),
            scorer.clone(),
            chapters.clone(),
            store.clone(),
        )?);
        let cache = Arc::new(ContextCache::new(&config.cache, store)?);
        Ok(Self {
            allocator: TokenBudgetAllocator::new(config.allocation.clone()),
            validator: ConsistencyValidator::new(cache.clone()),
            config,
            chapters,
            settings,
            memories,
            engine,
            cache,
            scorer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &Arc<CompressionEngine> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<ContextCache> {
        &self.cache
    }

    /// Assemble the context for a chapter
    pub fn build_context(&self, request: &ContextRequest) -> AssembledContext {
        let started = Instant::now();
        let chapter = request.chapter;
        let budget = request.total_budget.unwrap_or(self.config.default_budget);
        let mut issues = Vec::new();

        let current = self.load_current(chapter, &mut issues);
        let focus: BTreeSet<String> = current
            .as_ref()
            .map(|c| extract_entities(&c.content))
            .unwrap_or_default();
        let scorer = self.scorer.clone().with_focus_terms(focus.iter().cloned());

        let mut candidates: Vec<ContextComponent> = current.into_iter().collect();
        candidates.extend(self.load_settings(&mut issues));
        candidates.extend(self.load_memories(&focus, &mut issues));
        candidates.extend(self.load_history(request, started, &mut issues));
        let candidates: Vec<ContextComponent> = candidates
            .into_iter()
            .map(|c| {
                let importance = scorer.score(&c, chapter);
                c.with_importance(importance)
            })
            .collect();

        let mut allocation = self.fit(candidates.clone(), request, budget);
        let mut continuity = None;

        if let Some(from) = request.previous_chapter.filter(|_| request.is_jump()) {
            let report = self.validator.validate_continuity(from, chapter, &allocation.components);
            if !report.is_continuous {
                issues.extend(
                    report
                        .issues
                        .iter()
                        .cloned()
                        .map(|issue| ContextIssue::ContinuityViolation { issue }),
                );
                if let Some(bridge) = self.bridge(from, chapter) {
                    let importance = scorer.score(&bridge, chapter);
                    let mut with_bridge = candidates;
                    with_bridge.push(bridge.with_importance(importance));
                    allocation = self.fit(with_bridge, request, budget);
                }
            }
            continuity = Some(report);
        }

        if allocation.is_infeasible() || framing_cost(request, &allocation.components) > budget {
            issues.push(ContextIssue::BudgetInfeasible {
                required: allocation.required + framing_cost(request, &allocation.components),
                budget,
            });
        }

        let content = render(request, &allocation.components);
        let token_count = estimate_tokens(&content);
        let degraded = !issues.is_empty();
        if degraded {
            warn!(
                "Context for chapter {} is degraded: {} issue(s)",
                chapter,
                issues.len()
            );
        }
        info!(
            "Assembled context for chapter {}: {} components, {} of {} tokens in {:?}",
            chapter,
            allocation.components.len(),
            token_count,
            budget,
            started.elapsed()
        );

        AssembledContext {
            chapter,
            mode: request.mode,
            content,
            token_count,
            budget,
            components: allocation.components,
            degraded,
            issues,
            continuity,
        }
    }

    /// Allocate what is left after the header, footer and headings
    fn fit(&self, candidates: Vec<ContextComponent>, request: &ContextRequest, budget: usize) -> Allocation {
        let reserve = framing_cost(request, &candidates);
        self.allocator.allocate(candidates, budget.saturating_sub(reserve))
    }

    fn load_current(&self, chapter: u32, issues: &mut Vec<ContextIssue>) -> Option<ContextComponent> {
        let key = CacheKey::current(chapter);
        if let Some(component) = self.cache.get(&key).and_then(|v| v.into_component()) {
            return Some(component);
        }

        match self.chapters.chapter_text(chapter) {
            Ok(text) => {
                let component = ContextComponent::current_chapter(chapter, text);
                self.cache.insert_current(component.clone());
                Some(component)
            }
            Err(e) => {
                warn!("Current chapter {} unavailable: {}", chapter, e);
                issues.push(ContextIssue::MissingCurrentChapter {
                    chapter,
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    fn load_settings(&self, issues: &mut Vec<ContextIssue>) -> Vec<ContextComponent> {
        let mut components = Vec::new();
        for category in SettingCategory::ALL {
            let key = CacheKey::setting(category);
            if let Some(component) = self.cache.get(&key).and_then(|v| v.into_component()) {
                components.push(component);
                continue;
            }

            let text = match self.settings.setting(category) {
                Ok(text) if !text.trim().is_empty() => text,
                Ok(_) | Err(ContextError::SettingNotFound(_)) => {
                    debug!("No {} settings", category);
                    continue;
                }
                Err(e) => {
                    issues.push(ContextIssue::SourceUnavailable {
                        source: format!("{} settings", category),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let full = ContextComponent::setting(category, text).with_min_tokens(self.config.settings.min_tokens);
            let Some(component) = full.truncated_to(self.config.settings.budget(category)) else {
                debug!("{} settings do not fit their sub-budget", category);
                continue;
            };
            self.cache.insert_component(key, component.clone());
            components.push(component);
        }
        components
    }

    /// Memories of characters named in the current chapter
    fn load_memories(&self, focus: &BTreeSet<String>, issues: &mut Vec<ContextIssue>) -> Vec<ContextComponent> {
        if focus.is_empty() || self.config.memory.per_character == 0 {
            return Vec::new();
        }
        let characters = match self.memories.characters() {
            Ok(characters) => characters,
            Err(e) => {
                issues.push(ContextIssue::SourceUnavailable {
                    source: "character memories".to_string(),
                    reason: e.to_string(),
                });
                return Vec::new();
            }
        };

        let mut components = Vec::new();
        for character in characters.into_iter().filter(|c| focus.contains(c)) {
            let key = CacheKey::memory(character.clone());
            if let Some(component) = self.cache.get(&key).and_then(|v| v.into_component()) {
                components.push(component);
                continue;
            }

            let mut memories = match self.memories.character_memories(&character) {
                Ok(memories) => memories,
                Err(e) => {
                    issues.push(ContextIssue::SourceUnavailable {
                        source: format!("memories of {}", character),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            memories.retain(|m| m.emotional_weight >= self.config.memory.min_emotional_weight);
            memories.sort_by(|a, b| {
                b.emotional_weight
                    .cmp(&a.emotional_weight)
                    .then_with(|| a.occurrence_time.cmp(&b.occurrence_time))
            });
            memories.truncate(self.config.memory.per_character);
            memories.sort_by_key(|m| m.occurrence_time);
            if memories.is_empty() {
                continue;
            }

            let content = memories
                .iter()
                .map(|m| format!("- {} (weight {}/10)", m.content, m.emotional_weight))
                .collect::<Vec<_>>()
                .join("\n");
            let component = ContextComponent::new(ComponentKind::Memory, character, content);
            self.cache.insert_component(key, component.clone());
            components.push(component);
        }
        components
    }

    /// Compressed history for every earlier chapter, at the tier its
    /// distance calls for
    fn load_history(&self, request: &ContextRequest, started: Instant, issues: &mut Vec<ContextIssue>) -> Vec<ContextComponent> {
        let chapter = request.chapter;
        let stride = self.config.compression.long_term_stride;
        let mut components = Vec::new();

        for past in 1..chapter {
            let Some(tier) = self.config.tiers.resolve(chapter - past) else {
                continue;
            };
            if tier == TierName::LongTerm && past % stride != 0 {
                continue;
            }
            let past_deadline = request.deadline.is_some_and(|deadline| started.elapsed() >= deadline);
            let Some(artifact) = self.history_artifact(past, tier, past_deadline, issues) else {
                continue;
            };
            if artifact.is_empty() {
                continue;
            }
            components.push(artifact_component(&artifact));
        }
        components
    }

    fn history_artifact(
        &self,
        chapter: u32,
        tier: TierName,
        past_deadline: bool,
        issues: &mut Vec<ContextIssue>,
    ) -> Option<CompressionArtifact> {
        if let Some(artifact) = self.cache.get_artifact(chapter, tier) {
            if artifact.low_confidence {
                issues.push(ContextIssue::InterpolatedArtifact { chapter, tier });
            }
            return Some(artifact);
        }

        if past_deadline {
            return match self.cache.coarsest_available(chapter) {
                Some(artifact) => {
                    warn!("Deadline passed; using {} artifact for chapter {}", artifact.tier, chapter);
                    issues.push(ContextIssue::StaleArtifact {
                        chapter,
                        wanted: tier,
                        used: artifact.tier,
                    });
                    Some(artifact)
                }
                None => {
                    issues.push(ContextIssue::MissingHistory {
                        chapter,
                        reason: "deadline passed before compression".to_string(),
                    });
                    None
                }
            };
        }

        match self.engine.compress_chapter(chapter, tier) {
            Ok(artifact) => {
                if artifact.policy != tier || artifact.quality_score == 0.0 {
                    issues.push(ContextIssue::DegradedCompression {
                        chapter,
                        tier,
                        quality: artifact.quality_score,
                    });
                }
                self.cache.insert_artifact(artifact.clone());
                Some(artifact)
            }
            Err(e) if e.is_missing_source() => match self.engine.interpolate(chapter, tier) {
                Ok(artifact) => {
                    issues.push(ContextIssue::InterpolatedArtifact { chapter, tier });
                    self.cache.insert_transient(artifact.clone());
                    Some(artifact)
                }
                Err(e) => {
                    issues.push(ContextIssue::MissingHistory {
                        chapter,
                        reason: e.to_string(),
                    });
                    None
                }
            },
            Err(e) => {
                warn!("Compression of chapter {} failed: {}", chapter, e);
                issues.push(ContextIssue::MissingHistory {
                    chapter,
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    /// Short recap of the chapters skipped by a jump, from the finest
    /// artifacts available for them
    fn bridge(&self, from: u32, to: u32) -> Option<ContextComponent> {
        let gap: Vec<u32> = if from < to {
            (from + 1..to).collect()
        } else {
            (to.saturating_sub(3).max(1)..to).collect()
        };
        if gap.is_empty() {
            return None;
        }

        let step = gap.len().div_ceil(MAX_BRIDGE_CHAPTERS);
        let mut lines = Vec::new();
        for &chapter in gap.iter().step_by(step) {
            let assembled_tier = self.config.tiers.resolve(to.abs_diff(chapter)).unwrap_or(TierName::Recent);
            let preferred = assembled_tier.finer().unwrap_or(assembled_tier);
            let mut order = vec![preferred];
            order.extend(TierName::ALL.into_iter().filter(|t| *t != preferred));

            let line = order
                .into_iter()
                .find_map(|tier| self.cache.get_artifact(chapter, tier))
                .and_then(|artifact| artifact.sections.iter().flat_map(|s| s.lines.first()).next().cloned());
            if let Some(line) = line {
                lines.push(format!("- Chapter {chapter}: {line}"));
            }
        }
        if lines.is_empty() {
            return None;
        }

        let first = gap[0];
        let last = gap[gap.len() - 1];
        let content = format!("Recap of chapters {first} to {last}:\n{}", lines.join("\n"));
        debug!("Built bridge over chapters {}-{}", first, last);
        Some(ContextComponent::new(
            ComponentKind::Bridge,
            format!("chapters {first}-{last}"),
            content,
        ))
    }

    /// Compress one chapter, superseding any cached version
    pub fn compress_chapter(&self, chapter: u32, tier: TierName) -> Result<CompressionArtifact> {
        let artifact = self.engine.compress_chapter(chapter, tier)?;
        self.supersede(&artifact);
        Ok(artifact)
    }

    /// Compress a chapter or a range; failures are reported per chapter
    pub fn compress(&self, target: CompressTarget, tier: TierName) -> BatchReport {
        let report = self.engine.compress_range(target.chapters(), tier);
        for artifact in &report.artifacts {
            self.supersede(artifact);
        }
        report
    }

    /// Compress a range on the engine's worker pool
    pub async fn compress_concurrent(&self, chapters: RangeInclusive<u32>, tier: TierName) -> BatchReport {
        let report = Arc::clone(&self.engine).compress_range_concurrent(chapters, tier).await;
        for artifact in &report.artifacts {
            self.supersede(artifact);
        }
        report
    }

    fn supersede(&self, artifact: &CompressionArtifact) {
        self.invalidate_cache(artifact.chapter, InvalidationReason::CompressionUpdate(artifact.tier));
        self.cache.insert_artifact(artifact.clone());
    }

    /// Run the automatic compression checkpoints for a completed chapter
    pub fn chapter_completed(&self, chapter: u32) -> CompletionReport {
        let report = self.engine.chapter_completed(chapter);
        let batches = std::iter::once(&report.recent)
            .chain(report.medium.as_ref())
            .chain(report.long_term.as_ref());
        for batch in batches {
            for artifact in &batch.artifacts {
                self.supersede(artifact);
            }
        }
        report
    }

    /// Notification hook for edits made outside the engine
    pub fn invalidate_cache(&self, chapter: u32, reason: InvalidationReason) {
        if let Err(e) = self.cache.invalidate(chapter, reason) {
            warn!("Cache invalidation for chapter {} failed: {}", chapter, e);
        }
    }

    pub fn compression_status(&self, chapter: u32) -> Result<ChapterCompressionStatus> {
        self.engine.chapter_status(chapter)
    }

    pub fn project_status(&self) -> Result<ProjectCompressionStatus> {
        self.engine.project_status()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

fn artifact_component(artifact: &CompressionArtifact) -> ContextComponent {
    ContextComponent::new(
        ComponentKind::for_tier(artifact.tier),
        format!("chapter {} {}", artifact.chapter, artifact.tier),
        artifact.render(),
    )
    .with_chapter(artifact.chapter)
}

fn header(chapter: u32) -> String {
    format!("# Context for chapter {chapter}")
}

fn heading(component: &ContextComponent) -> String {
    match component.kind {
        ComponentKind::CurrentChapter => "## Current chapter".to_string(),
        ComponentKind::Setting => format!("## Settings: {}", component.label),
        ComponentKind::Memory => format!("## Memories of {}", component.label),
        ComponentKind::Bridge => format!("## Recap: {}", component.label),
        ComponentKind::RecentCompression | ComponentKind::MediumCompression | ComponentKind::LongTermCompression => {
            let tier = component.kind.tier().map_or("", TierName::as_str);
            match component.chapter {
                Some(chapter) => format!("## Chapter {chapter} ({tier} summary)"),
                None => format!("## {tier} summary"),
            }
        }
    }
}

fn footer(request: &ContextRequest) -> Option<String> {
    let chapter = request.chapter;
    match request.mode {
        GenerationMode::Writing => Some(format!(
            "## Writing guidance\nContinue chapter {chapter} from the context above. Keep continuity with \
             earlier chapters and stay true to the established world and characters."
        )),
        GenerationMode::Review => Some(format!(
            "## Review guidance\nReview chapter {chapter} against the context above for continuity errors \
             and departures from the settings."
        )),
        GenerationMode::Raw => None,
    }
}

fn block_prefix(component: &ContextComponent) -> String {
    format!("\n\n{}\n", heading(component))
}

/// Tokens spent on everything but component content. The estimator is
/// subadditive, so the rendered context never costs more than this plus
/// the components' own counts.
fn framing_cost(request: &ContextRequest, components: &[ContextComponent]) -> usize {
    let headings: usize = components.iter().map(|c| estimate_tokens(&block_prefix(c))).sum();
    let footer = footer(request).map_or(0, |f| estimate_tokens(&format!("\n\n{f}")));
    estimate_tokens(&header(request.chapter)) + headings + footer
}

fn render(request: &ContextRequest, components: &[ContextComponent]) -> String {
    let mut out = header(request.chapter);
    for component in components {
        out.push_str(&block_prefix(component));
        out.push_str(&component.content);
    }
    if let Some(footer) = footer(request) {
        out.push_str("\n\n");
        out.push_str(&footer);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{plain_chapter, sample_chapter};
    use crate::source::{CharacterMemory, InMemoryProject};
    use crate::storage::{MemoryArtifactStore, OperationKind};
    use crate::tier::{ContentCategory, RetainedCategory};

    fn project(chapters: u32) -> InMemoryProject {
        let mut project = InMemoryProject::new()
            .with_setting(SettingCategory::World, "Magic: forbidden\nCapital: Stonehold")
            .with_setting(SettingCategory::Characters, "Arden: a wary knight.\nMira: a swordswoman.")
            .with_memory(
                "Mira",
                CharacterMemory {
                    content: "Watched her brother fall at the bridge".to_string(),
                    emotional_weight: 9,
                    occurrence_time: "2024-01-01T00:00:00Z".parse().unwrap(),
                },
            );
        for chapter in 1..=chapters {
            project = project.with_chapter(chapter, format!("Chapter {chapter}"), sample_chapter(chapter as usize, 120));
        }
        project
    }

    fn assembler_for(project: Arc<InMemoryProject>) -> ContextAssembler {
        ContextAssembler::new(Config::default(), project, Arc::new(MemoryArtifactStore::new())).unwrap()
    }

    #[test]
    fn test_build_context_layout() {
        let assembler = assembler_for(Arc::new(project(12)));
        let context = assembler.build_context(&ContextRequest::new(12));

        assert!(context.content.starts_with("# Context for chapter 12"));
        assert!(context.content.contains("## Current chapter"));
        assert!(context.content.contains("## Settings: world"));
        assert!(context.content.contains("## Memories of Mira"));
        assert!(context.content.contains("## Chapter 11 (recent summary)"));
        assert!(context.content.contains("## Chapter 1 (medium summary)"));
        assert!(context.content.ends_with("established world and characters."));
        assert_eq!(context.components[0].kind, ComponentKind::CurrentChapter);
        assert!(context.token_count <= context.budget);

        let positions: Vec<u8> = context.components.iter().map(|c| c.kind.priority()).collect();
        assert!(positions.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_budget_invariant_across_budgets() {
        let assembler = assembler_for(Arc::new(project(15)));
        for budget in [2_000, 2_500, 3_000, 5_000, 8_000, 20_000] {
            let context = assembler.build_context(&ContextRequest::new(15).with_budget(budget));
            if context.issues.iter().any(|i| matches!(i, ContextIssue::BudgetInfeasible { .. })) {
                continue;
            }
            assert!(context.token_count <= budget, "budget {budget}: {}", context.token_count);
        }
    }

    #[test]
    fn test_oversized_current_chapter_is_kept() {
        let project = Arc::new(InMemoryProject::new().with_chapter(1, "Huge", sample_chapter(0, 2000)));
        let assembler = assembler_for(project);
        let context = assembler.build_context(&ContextRequest::new(1).with_budget(1000));

        assert!(context.degraded);
        assert!(context
            .issues
            .iter()
            .any(|i| matches!(i, ContextIssue::BudgetInfeasible { .. })));
        assert_eq!(context.components.len(), 1);
        assert!(context.token_count > 1000);
    }

    #[test]
    fn test_second_build_is_served_from_cache() {
        let assembler = assembler_for(Arc::new(project(8)));
        let request = ContextRequest::new(8).with_budget(30_000);
        let first = assembler.build_context(&request);
        let compressions = assembler.engine().store().read_log().unwrap().len();
        let second = assembler.build_context(&request);

        assert_eq!(first.content, second.content);
        assert_eq!(assembler.engine().store().read_log().unwrap().len(), compressions);
        assert!(assembler.cache_stats().l2_hits + assembler.cache_stats().l1_hits > 0);
    }

    #[test]
    fn test_chapter_update_invalidates_history() {
        let project = Arc::new(project(6));
        let assembler = assembler_for(project.clone());
        let request = ContextRequest::new(6).with_budget(30_000);
        let before = assembler.build_context(&request);
        let old = before.component(ComponentKind::RecentCompression, Some(3)).unwrap().content.clone();

        project.update_chapter(3, "Zephyrine sailed alone to the isle of Qarth. ".repeat(40));
        assembler.invalidate_cache(3, InvalidationReason::ChapterUpdate);

        let after = assembler.build_context(&request);
        let new = &after.component(ComponentKind::RecentCompression, Some(3)).unwrap().content;
        assert_ne!(&old, new);
        assert!(new.contains("Zephyrine"));
    }

    #[test]
    fn test_settings_change_reloads_settings() {
        let project = Arc::new(project(2));
        let assembler = assembler_for(project.clone());
        let request = ContextRequest::new(2);
        assembler.build_context(&request);

        project.update_setting(SettingCategory::World, "Magic: common");
        let stale = assembler.build_context(&request);
        assert!(stale.content.contains("Magic: forbidden"));

        assembler.invalidate_cache(2, InvalidationReason::SettingsChange);
        let fresh = assembler.build_context(&request);
        assert!(fresh.content.contains("Magic: common"));
    }

    #[test]
    fn test_jump_inserts_bridge() {
        let project = Arc::new(
            project(10)
                .with_chapter(2, "Chapter 2", "Arden was killed at the bridge.")
                .with_chapter(10, "Chapter 10", "Arden survived the winter and rode south to Stonehold."),
        );
        let assembler = assembler_for(project);
        let context = assembler.build_context(&ContextRequest::new(10).with_budget(40_000).from_chapter(1));

        let report = context.continuity.as_ref().unwrap();
        assert!(!report.is_continuous);
        assert!(context.degraded);
        assert!(context
            .issues
            .iter()
            .any(|i| matches!(i, ContextIssue::ContinuityViolation { .. })));
        let bridge = context.component(ComponentKind::Bridge, None).unwrap();
        assert!(bridge.content.starts_with("Recap of chapters 2 to 9"));
        assert!(context.token_count <= 40_000);
    }

    #[test]
    fn test_sequential_navigation_skips_validation() {
        let assembler = assembler_for(Arc::new(project(5)));
        let context = assembler.build_context(&ContextRequest::new(5).from_chapter(4));
        assert!(context.continuity.is_none());
    }

    #[test]
    fn test_deadline_falls_back_to_cached_artifact() {
        let project = Arc::new(project(30));
        let assembler = assembler_for(project);
        assembler.compress_chapter(1, TierName::Recent).unwrap();

        let request = ContextRequest::new(30).with_deadline(Duration::ZERO);
        let context = assembler.build_context(&request);
        assert!(context.degraded);
        assert!(context.issues.iter().any(|i| matches!(
            i,
            ContextIssue::StaleArtifact { chapter: 1, wanted: TierName::Medium, used: TierName::Recent }
        )));
        assert!(context.component(ComponentKind::RecentCompression, Some(1)).is_some());
    }

    #[test]
    fn test_missing_chapter_is_interpolated() {
        let project = Arc::new(project(5));
        project.remove_chapter(3);
        let assembler = assembler_for(project);
        let context = assembler.build_context(&ContextRequest::new(5));

        assert!(context
            .issues
            .iter()
            .any(|i| matches!(i, ContextIssue::InterpolatedArtifact { chapter: 3, .. })));
        let interpolated = context.component(ComponentKind::RecentCompression, Some(3)).unwrap();
        assert!(interpolated.content.contains("from chapter 2"));
    }

    #[test]
    fn test_interpolated_artifact_is_reused_until_chapter_update() {
        let project = Arc::new(project(5));
        project.remove_chapter(3);
        let assembler = assembler_for(project.clone());
        let request = ContextRequest::new(5);
        let interpolations = |assembler: &ContextAssembler| {
            let log = assembler.engine().store().read_log().unwrap();
            log.iter().filter(|e| e.operation == OperationKind::Interpolate).count()
        };

        assembler.build_context(&request);
        let again = assembler.build_context(&request);
        assert_eq!(interpolations(&assembler), 1);
        assert!(again
            .issues
            .iter()
            .any(|i| matches!(i, ContextIssue::InterpolatedArtifact { chapter: 3, .. })));
        assert!(assembler.engine().store().load_artifact(3, TierName::Recent).unwrap().is_none());

        project.update_chapter(3, "Zephyrine sailed alone to the isle of Qarth. ".repeat(40));
        assembler.invalidate_cache(3, InvalidationReason::ChapterUpdate);
        let restored = assembler.build_context(&request);
        assert!(!restored
            .issues
            .iter()
            .any(|i| matches!(i, ContextIssue::InterpolatedArtifact { .. })));
        let component = restored.component(ComponentKind::RecentCompression, Some(3)).unwrap();
        assert!(component.content.contains("Zephyrine"));
    }

    #[test]
    fn test_plain_prose_history_is_not_degraded() {
        let mut project = InMemoryProject::new();
        for chapter in 1..=62 {
            project = project.with_chapter(chapter, format!("Chapter {chapter}"), plain_chapter(chapter as usize, 400));
        }
        let assembler = assembler_for(Arc::new(project));
        let context = assembler.build_context(&ContextRequest::new(62));

        assert!(!context.degraded, "{:?}", context.issues);
        let long_term = context.component(ComponentKind::LongTermCompression, Some(5)).unwrap();
        assert!(long_term.content.starts_with("Story arc:"));
    }

    #[test]
    fn test_policy_fallback_is_reported() {
        let mut config = Config::default();
        config.tiers.recent.retained = vec![RetainedCategory::new(ContentCategory::KeyDialogue, 1.0)];
        let mut project = InMemoryProject::new();
        for chapter in 1..=3 {
            project = project.with_chapter(chapter, format!("Chapter {chapter}"), plain_chapter(chapter as usize, 200));
        }
        let assembler = ContextAssembler::new(config, Arc::new(project), Arc::new(MemoryArtifactStore::new())).unwrap();
        let context = assembler.build_context(&ContextRequest::new(3));

        assert!(context.degraded);
        let degraded: Vec<(u32, f64)> = context
            .issues
            .iter()
            .filter_map(|i| match i {
                ContextIssue::DegradedCompression { chapter, tier: TierName::Recent, quality } => Some((*chapter, *quality)),
                _ => None,
            })
            .collect();
        assert_eq!(degraded.len(), 2);
        assert!(degraded.iter().all(|(_, quality)| *quality > 0.0 && *quality < 1.0));
    }

    #[test]
    fn test_modes_select_footer() {
        let assembler = assembler_for(Arc::new(project(2)));
        let review = assembler.build_context(&ContextRequest::new(2).with_mode(GenerationMode::Review));
        assert!(review.content.contains("## Review guidance"));
        let raw = assembler.build_context(&ContextRequest::new(2).with_mode(GenerationMode::Raw));
        assert!(!raw.content.contains("guidance"));
    }

    #[test]
    fn test_long_term_stride() {
        let assembler = assembler_for(Arc::new(project(62)));
        let context = assembler.build_context(&ContextRequest::new(62));
        let long_term: Vec<u32> = context
            .components
            .iter()
            .filter(|c| c.kind == ComponentKind::LongTermCompression)
            .filter_map(|c| c.chapter)
            .collect();
        assert_eq!(long_term, vec![5, 10]);
    }

    #[test]
    fn test_compress_supersedes_cached_artifact() {
        let project = Arc::new(project(4));
        let assembler = assembler_for(project.clone());
        let first = assembler.compress_chapter(2, TierName::Recent).unwrap();

        project.update_chapter(2, "Zephyrine sailed alone to the isle of Qarth. ".repeat(40));
        let report = assembler.compress(CompressTarget::Range(1..=2), TierName::Recent);
        assert_eq!(report.successful, 2);

        let cached = assembler.cache().get_artifact(2, TierName::Recent).unwrap();
        assert_ne!(cached.id, first.id);
        assert!(cached.render().contains("Zephyrine"));
    }

    #[test]
    fn test_concurrent_compression_through_assembler() {
        let assembler = assembler_for(Arc::new(project(6)));
        let report = tokio_test::block_on(assembler.compress_concurrent(1..=6, TierName::Medium));
        assert_eq!(report.successful, 6);
        assert!(assembler.cache().get_artifact(4, TierName::Medium).is_some());
        assert_eq!(assembler.project_status().unwrap().compressed_chapters, 6);
    }
}
