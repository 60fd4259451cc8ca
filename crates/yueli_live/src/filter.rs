//! Danmaku scoring.

use yueli_core::config::LiveConfig;

const BASE_SCORE: i32 = 10;
/// Comfortable reading length, in characters.
const GOOD_LENGTH: std::ops::RangeInclusive<usize> = 5..=20;
const GOOD_LENGTH_BONUS: i32 = 20;
const MENTION_BONUS: i32 = 30;
const QUESTION_BONUS: i32 = 10;

/// Scores chat lines so that spam and noise never reach the dialogue core.
#[derive(Debug, Clone)]
pub struct DanmakuFilter {
    persona_names: Vec<String>,
    max_chars: usize,
    min_score: i32,
}

impl DanmakuFilter {
    pub fn new(config: &LiveConfig) -> Self {
        Self {
            persona_names: config
                .persona_names
                .iter()
                .filter(|n| !n.trim().is_empty())
                .cloned()
                .collect(),
            max_chars: config.max_content_chars,
            min_score: config.min_danmaku_score,
        }
    }

    /// 0 for anything over the length limit; otherwise a base score plus
    /// bonuses for a readable length, addressing the avatar, and asking a
    /// question.
    pub fn score(&self, content: &str) -> i32 {
        let chars = content.chars().count();
        if chars > self.max_chars {
            return 0;
        }

        let mut score = BASE_SCORE;
        if GOOD_LENGTH.contains(&chars) {
            score += GOOD_LENGTH_BONUS;
        }
        if self.persona_names.iter().any(|n| content.contains(n.as_str())) {
            score += MENTION_BONUS;
        }
        if content.contains('?') || content.contains('？') {
            score += QUESTION_BONUS;
        }
        score
    }

    pub fn accepts(&self, score: i32) -> bool {
        score >= self.min_score
    }
}
