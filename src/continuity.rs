//! Continuity checks for non-sequential chapter navigation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::ContextCache;
use crate::component::{ComponentKind, ContextComponent};
use crate::compression::CompressionArtifact;
use crate::text::{self, CharacterState, extract_entities, mentions, state_claims, world_facts};
use crate::tier::TierName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuityIssueKind {
    CharacterState,
    DroppedThread,
    SettingsConflict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityIssue {
    pub kind: ContinuityIssueKind,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinuityReport {
    pub is_continuous: bool,
    pub issues: Vec<ContinuityIssue>,
}

/// Validates an assembled context across a chapter jump
pub struct ConsistencyValidator {
    cache: Arc<ContextCache>,
}

impl ConsistencyValidator {
    pub fn new(cache: Arc<ContextCache>) -> Self {
        Self { cache }
    }

    /// Check the components assembled for `to_chapter` after navigating from
    /// `from_chapter`.
    pub fn validate_continuity(
        &self,
        from_chapter: u32,
        to_chapter: u32,
        components: &[ContextComponent],
    ) -> ContinuityReport {
        let mut issues = character_state_issues(to_chapter, components);

        let boundaries = boundary_chapters(from_chapter, to_chapter);
        let artifacts: Vec<CompressionArtifact> = boundaries
            .into_iter()
            .filter_map(|chapter| self.finest_artifact(chapter))
            .collect();
        issues.extend(dropped_thread_issues(&artifacts, components));
        issues.extend(settings_conflicts(components));

        if issues.is_empty() {
            debug!("Jump from chapter {} to {} is continuous", from_chapter, to_chapter);
        } else {
            warn!(
                "Jump from chapter {} to {} has {} continuity issue(s)",
                from_chapter,
                to_chapter,
                issues.len()
            );
        }

        ContinuityReport {
            is_continuous: issues.is_empty(),
            issues,
        }
    }

    fn finest_artifact(&self, chapter: u32) -> Option<CompressionArtifact> {
        TierName::ALL
            .into_iter()
            .find_map(|tier| self.cache.get_artifact(chapter, tier))
    }
}

/// Chapters whose artifacts bound the gap. Backward jumps only look at the
/// chapter just before the target.
fn boundary_chapters(from_chapter: u32, to_chapter: u32) -> Vec<u32> {
    let mut chapters = BTreeSet::new();
    if from_chapter < to_chapter && from_chapter > 0 {
        chapters.insert(from_chapter);
    }
    if to_chapter > 1 {
        chapters.insert(to_chapter - 1);
    }
    chapters.into_iter().collect()
}

/// A character known dead in history must not be claimed alive now
fn character_state_issues(to_chapter: u32, components: &[ContextComponent]) -> Vec<ContinuityIssue> {
    let current: Vec<&ContextComponent> = components
        .iter()
        .filter(|c| c.kind == ComponentKind::CurrentChapter)
        .collect();
    let mut history: Vec<&ContextComponent> = components
        .iter()
        .filter(|c| c.kind != ComponentKind::CurrentChapter && c.chapter.is_some_and(|ch| ch < to_chapter))
        .collect();
    history.sort_by_key(|c| c.chapter);

    let mut names = BTreeSet::new();
    for component in components {
        names.extend(extract_entities(&component.content));
        if component.kind == ComponentKind::Memory {
            names.insert(component.label.clone());
        }
    }

    let mut latest: BTreeMap<String, (CharacterState, u32)> = BTreeMap::new();
    for component in &history {
        let chapter = component.chapter.unwrap_or_default();
        for (name, state) in state_claims(&component.content, &names) {
            latest.insert(name, (state, chapter));
        }
    }

    let mut issues = Vec::new();
    for component in current {
        for (name, state) in state_claims(&component.content, &names) {
            if let Some((previous, chapter)) = latest.get(&name) {
                if *previous == CharacterState::Dead && state != CharacterState::Dead {
                    issues.push(ContinuityIssue {
                        kind: ContinuityIssueKind::CharacterState,
                        description: format!(
                            "{name} is {state:?} in chapter {to_chapter} but died in chapter {chapter}"
                        ),
                    });
                }
            }
        }
    }
    issues.dedup();
    issues
}

/// Open threads in the boundary artifacts whose characters appear nowhere
/// in the assembled context
fn dropped_thread_issues(artifacts: &[CompressionArtifact], components: &[ContextComponent]) -> Vec<ContinuityIssue> {
    let mut issues = Vec::new();
    for artifact in artifacts {
        for line in artifact.sections.iter().flat_map(|s| &s.lines) {
            let lowered = line.to_lowercase();
            if !text::UNRESOLVED.matches(&lowered) && !text::FORESHADOWING.matches(&lowered) {
                continue;
            }
            let involved = extract_entities(line);
            if involved.is_empty() {
                continue;
            }
            let carried = involved
                .iter()
                .any(|name| components.iter().any(|c| mentions(&c.content, name)));
            if !carried {
                issues.push(ContinuityIssue {
                    kind: ContinuityIssueKind::DroppedThread,
                    description: format!("chapter {}: unresolved thread dropped: {}", artifact.chapter, line),
                });
            }
        }
    }
    issues
}

/// The same world fact asserted with different values
fn settings_conflicts(components: &[ContextComponent]) -> Vec<ContinuityIssue> {
    let mut seen: BTreeMap<String, (String, &str)> = BTreeMap::new();
    let mut issues = Vec::new();
    for component in components.iter().filter(|c| c.kind == ComponentKind::Setting) {
        for (key, value) in world_facts(&component.content) {
            match seen.get(&key) {
                Some((existing, source)) if *existing != value => issues.push(ContinuityIssue {
                    kind: ContinuityIssueKind::SettingsConflict,
                    description: format!(
                        "{key}: '{existing}' ({source}) conflicts with '{value}' ({})",
                        component.label
                    ),
                }),
                Some(_) => {}
                None => {
                    seen.insert(key, (value, component.label.as_str()));
                }
            }
        }
    }
    issues
}
