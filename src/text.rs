//! Lightweight text heuristics: sentence segmentation, keyword lexicons,
//! entity mentions and character state claims.
//!
//! Everything here is deterministic and language-agnostic enough to work on
//! both English and Chinese prose. None of it attempts real language
//! understanding.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::tokens::is_cjk;

const SENTENCE_TERMINATORS: &[char] = &['。', '！', '？', '!', '?', '…'];

/// Split text into trimmed, non-empty sentences. Terminal punctuation stays
/// attached to its sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    split_segments(text)
        .into_iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split text into contiguous slices that concatenate back to the input.
///
/// A segment ends after a sentence terminator (including `.` followed by
/// whitespace) or after a newline, so cutting between segments never cuts a
/// sentence in half.
pub fn split_segments(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        let end = idx + c.len_utf8();
        let boundary = match c {
            '\n' => true,
            '.' => chars.peek().is_none_or(|(_, next)| next.is_whitespace()),
            c if SENTENCE_TERMINATORS.contains(&c) => {
                // keep closing quotes with the sentence they close
                !matches!(chars.peek(), Some((_, '"' | '”' | '」' | '’')))
            }
            '"' | '”' | '」' | '’' => text[start..idx]
                .chars()
                .last()
                .is_some_and(|prev| SENTENCE_TERMINATORS.contains(&prev) || prev == '.'),
            _ => false,
        };

        if boundary {
            // swallow trailing spaces into the segment
            let mut stop = end;
            while let Some(&(next_idx, next)) = chars.peek() {
                if next == ' ' || next == '\t' {
                    stop = next_idx + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            segments.push(&text[start..stop]);
            start = stop;
        }
    }

    if start < text.len() {
        segments.push(&text[start..]);
    }
    segments
}

/// Word-like units: alphanumeric runs, plus each CJK ideograph on its own.
pub fn words(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if is_cjk(c) {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            out.push(c.to_string());
        } else if c.is_alphanumeric() || c == '\'' {
            current.push(c);
        } else if !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Whether a sentence ends like a complete sentence.
pub fn is_complete_sentence(sentence: &str) -> bool {
    let trimmed = sentence.trim_end_matches(['"', '”', '」', '’', ' ']);
    trimmed
        .chars()
        .last()
        .is_some_and(|c| c == '.' || SENTENCE_TERMINATORS.contains(&c))
}

/// A static keyword list, matched case-insensitively against ASCII text.
#[derive(Debug, Clone, Copy)]
pub struct Lexicon(pub &'static [&'static str]);

impl Lexicon {
    /// Number of distinct keywords present in `lowered`, which must already
    /// be lowercased.
    pub fn hits(&self, lowered: &str) -> usize {
        self.0.iter().filter(|kw| lowered.contains(*kw)).count()
    }

    pub fn matches(&self, lowered: &str) -> bool {
        self.0.iter().any(|kw| lowered.contains(kw))
    }

    /// First byte offset at which any keyword occurs.
    pub fn first_position(&self, lowered: &str) -> Option<usize> {
        self.0.iter().filter_map(|kw| lowered.find(kw)).min()
    }
}

pub const PLOT_INDICATORS: Lexicon = Lexicon(&[
    "suddenly", "decided", "decides", "discovered", "revealed", "began to", "realized",
    "chose to", "set out", "turned out", "突然", "忽然", "瞬间", "决定", "发现", "开始", "揭开",
]);

pub const ACTION_VERBS: Lexicon = Lexicon(&[
    "ran", "fought", "struck", "grabbed", "drew", "fled", "attacked", "opened", "walked",
    "stood", "turned", "threw", "climbed", "rode", "killed", "saved", "走", "跑", "站起",
    "坐下", "拔剑", "冲", "抓住", "推开", "攻击",
]);

pub const EMOTION_WORDS: Lexicon = Lexicon(&[
    "happy", "joy", "excited", "sad", "grief", "tears", "wept", "angry", "rage", "furious",
    "afraid", "fear", "terrified", "anxious", "shocked", "stunned", "surprised", "despair",
    "高兴", "兴奋", "满意", "悲伤", "难过", "失望", "沮丧", "愤怒", "生气", "暴怒", "恐惧",
    "害怕", "紧张", "焦虑", "惊讶", "震惊", "困惑",
]);

pub const SCENE_MARKERS: Lexicon = Lexicon(&[
    "entered", "arrived at", "inside the", "outside the", "in the forest", "in the city",
    "the palace", "the street", "the room", "the hall", "房间", "街道", "森林", "宫殿", "学校",
    "大厅", "来到",
]);

pub const TIME_MARKERS: Lexicon = Lexicon(&[
    "morning", "noon", "afternoon", "evening", "night", "dawn", "dusk", "midnight",
    "spring", "summer", "autumn", "winter", "yesterday", "tomorrow", "years later",
    "days later", "早上", "上午", "中午", "下午", "晚上", "深夜", "春天", "夏天", "秋天",
    "冬天", "昨天", "今天", "明天",
]);

pub const MAJOR_EVENTS: Lexicon = Lexicon(&[
    "battle", "died", "death", "born", "married", "wedding", "betrayed", "betrayal",
    "rescued", "victory", "defeat", "reunited", "separated", "discovered", "destroyed",
    "战斗", "死亡", "出生", "结婚", "分离", "重逢", "发现", "胜利", "失败", "背叛", "拯救",
]);

pub const DEVELOPMENT: Lexicon = Lexicon(&[
    "realized", "understood", "learned", "grew", "changed", "became", "no longer", "for the first time",
    "成长", "变化", "改变", "蜕变", "明白", "领悟", "醒悟", "意识到", "学会", "掌握", "获得", "失去",
]);

pub const ADVANCEMENT: Lexicon = Lexicon(&[
    "clue", "secret", "truth", "plan", "plot against", "conspiracy", "goal", "the key to",
    "线索", "秘密", "真相", "计划", "阴谋", "目标", "愿望",
]);

pub const RELATIONSHIP: Lexicon = Lexicon(&[
    "friend", "enemy", "ally", "lover", "brother", "sister", "father", "mother", "trust",
    "betray", "forgive", "rival", "朋友", "敌人", "恋人", "家人", "信任", "背叛", "支持",
    "误解", "相遇", "离别",
]);

pub const IMPACT: Lexicon = Lexicon(&[
    "turning point", "everything changed", "crucial", "decisive", "would never", "forever",
    "转折点", "关键", "重要", "决定性", "深远影响",
]);

pub const DESTINATION: Lexicon = Lexicon(&[
    "destiny", "fate", "future", "dream", "hope", "would become", "命运", "未来", "前景",
    "希望", "梦想", "目标",
]);

pub const THEMES: Lexicon = Lexicon(&[
    "love", "hatred", "justice", "evil", "sacrifice", "redemption", "freedom", "duty",
    "family", "friendship", "loyalty", "爱", "恨", "正义", "邪恶", "牺牲", "成长", "救赎",
    "自由", "命运", "选择", "责任", "家庭", "友谊",
]);

pub const FORESHADOWING: Lexicon = Lexicon(&[
    "someday", "one day", "would later", "little did", "promised", "vowed", "swore",
    "remember this", "伏笔", "将来", "总有一天", "发誓", "约定",
]);

/// Markers of a plot thread that is still open at the end of a chapter.
pub const UNRESOLVED: Lexicon = Lexicon(&[
    "promised", "vowed", "swore", "secret", "mystery", "plans to", "planned to", "will return",
    "someday", "clue", "unanswered", "unknown", "线索", "秘密", "计划", "誓言", "发誓", "约定",
    "伏笔", "谜",
]);

/// Whether a sentence looks like quoted speech worth keeping.
pub fn is_dialogue(sentence: &str) -> bool {
    let quoted = sentence.contains('"')
        || sentence.contains('“')
        || sentence.contains('「')
        || sentence.contains('：');
    quoted && sentence.chars().count() >= 20
}

const NON_ENTITY_WORDS: &[&str] = &[
    "The", "A", "An", "He", "She", "It", "They", "We", "I", "You", "His", "Her", "Their",
    "But", "And", "Or", "When", "Then", "There", "This", "That", "These", "Those", "In",
    "On", "At", "As", "If", "So", "What", "Why", "How", "Who", "Where", "After", "Before",
    "Chapter", "Suddenly", "Yes", "No", "Not", "One", "Now", "For", "With", "From", "By",
];

/// Capitalised words that look like names of people or places.
pub fn extract_entities(text: &str) -> BTreeSet<String> {
    words(text)
        .into_iter()
        .filter(|w| {
            let mut chars = w.chars();
            chars.next().is_some_and(|c| c.is_ascii_uppercase())
                && w.len() >= 2
                && chars.all(|c| c.is_alphabetic() || c == '\'')
                && !NON_ENTITY_WORDS.contains(&w.as_str())
        })
        .collect()
}

/// Whether `text` mentions `name` as a whole word (or anywhere, for CJK names).
pub fn mentions(text: &str, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    if name.chars().any(is_cjk) {
        return text.contains(name);
    }
    words(text).iter().any(|w| w == name)
}

/// A coarse claim about a character's condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterState {
    Dead,
    Alive,
    Captive,
    Free,
}

impl CharacterState {
    const ALL: [CharacterState; 4] = [
        CharacterState::Dead,
        CharacterState::Alive,
        CharacterState::Captive,
        CharacterState::Free,
    ];

    fn lexicon(self) -> Lexicon {
        match self {
            CharacterState::Dead => Lexicon(&[
                " died", " dies", " is dead", " was dead", " was killed", " was slain",
                " perished", "死了", "死去", "身亡", "牺牲了",
            ]),
            CharacterState::Alive => Lexicon(&[
                " is alive", " was alive", " still alive", " survived", " survives", "活着", "幸存",
            ]),
            CharacterState::Captive => Lexicon(&[
                " was captured", " is captured", " imprisoned", " taken prisoner", "被俘", "被囚",
            ]),
            CharacterState::Free => Lexicon(&[" escaped", " was freed", " was released", "逃脱", "获救"]),
        }
    }

    /// Whether two states cannot both hold at the same time.
    pub fn contradicts(self, other: CharacterState) -> bool {
        matches!(
            (self, other),
            (CharacterState::Dead, CharacterState::Alive)
                | (CharacterState::Alive, CharacterState::Dead)
                | (CharacterState::Captive, CharacterState::Free)
                | (CharacterState::Free, CharacterState::Captive)
        )
    }
}

/// Extract `(character, state)` claims from text. A claim is attributed to
/// the character mentioned closest before the state phrase in its sentence.
pub fn state_claims(text: &str, characters: &BTreeSet<String>) -> Vec<(String, CharacterState)> {
    let mut claims = Vec::new();
    for sentence in split_sentences(text) {
        let lowered = format!(" {}", sentence.to_lowercase());
        for state in CharacterState::ALL {
            let Some(pos) = state.lexicon().first_position(&lowered) else {
                continue;
            };
            // positions are in `lowered`, which has one leading space
            let prefix_end = pos.saturating_sub(1).min(sentence.len());
            let prefix = sentence.get(..prefix_end).unwrap_or(&sentence);
            let subject = characters
                .iter()
                .filter_map(|name| prefix.rfind(name.as_str()).map(|at| (at, name)))
                .max_by_key(|(at, _)| *at)
                .map(|(_, name)| name.clone());
            if let Some(name) = subject {
                claims.push((name, state));
            }
        }
    }
    claims
}

/// Parse `key: value` style facts out of settings text. Keys and values are
/// normalised to lowercase.
pub fn world_facts(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim().trim_start_matches(['-', '*', '#', ' ']);
            let (key, value) = line
                .split_once(':')
                .or_else(|| line.split_once('：'))
                .or_else(|| line.split_once(" = "))?;
            let key = key.trim().trim_matches('*').trim().to_lowercase();
            let value = value.trim().trim_matches('*').trim().to_lowercase();
            if key.is_empty() || value.is_empty() || key.chars().count() > 40 {
                return None;
            }
            Some((key, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_reassemble() {
        let text = "Lin drew his sword. The wolf lunged!\n他突然决定离开。 \"Run,\" she said.";
        let segments = split_segments(text);
        assert_eq!(segments.concat(), text);
        assert!(segments.len() >= 4);
    }

    #[test]
    fn test_sentences_keep_terminators() {
        let sentences = split_sentences("He left. 她哭了。Why?");
        assert_eq!(sentences, vec!["He left.", "她哭了。", "Why?"]);
        assert!(sentences.iter().all(|s| is_complete_sentence(s)));
    }

    #[test]
    fn test_decimal_point_is_not_a_boundary() {
        let sentences = split_sentences("The price was 3.5 coins. Fine.");
        assert_eq!(sentences.len(), 2);
    }

    #[test]
    fn test_entities_skip_function_words() {
        let entities = extract_entities("The knight Arden met Mira at Stonehold. He smiled.");
        assert!(entities.contains("Arden"));
        assert!(entities.contains("Mira"));
        assert!(entities.contains("Stonehold"));
        assert!(!entities.contains("The"));
        assert!(!entities.contains("He"));
    }

    #[test]
    fn test_state_claims_attribute_nearest_subject() {
        let names: BTreeSet<String> = ["Arden".to_string(), "Mira".to_string()].into();
        let claims = state_claims("Mira watched as Arden was killed by the wraith.", &names);
        assert_eq!(claims, vec![("Arden".to_string(), CharacterState::Dead)]);
        assert!(CharacterState::Dead.contradicts(CharacterState::Alive));
        assert!(!CharacterState::Dead.contradicts(CharacterState::Captive));
    }

    #[test]
    fn test_world_facts() {
        let facts = world_facts("# Magic\n- Magic source: the moon\nCapital = Veyra\nplain prose line");
        assert_eq!(
            facts,
            vec![
                ("magic source".to_string(), "the moon".to_string()),
                ("capital".to_string(), "veyra".to_string()),
            ]
        );
    }

    #[test]
    fn test_lexicon_hits() {
        let lowered = "suddenly she decided to run".to_string();
        assert_eq!(PLOT_INDICATORS.hits(&lowered), 2);
        assert!(is_dialogue("\"We leave at dawn,\" said the captain quietly."));
        assert!(!is_dialogue("\"Go.\""));
    }
}
