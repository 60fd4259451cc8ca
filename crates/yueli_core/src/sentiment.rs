//! Simple keyword-based Chinese/English sentiment analysis.
//!
//! Used for the avatar's self-feedback (what it says nudges how it feels) and
//! to turn live chat into coarse intent signals. In production this should be
//! replaced with a model.

use crate::affect::EmotionDelta;

const POSITIVE: &[&str] = &[
    "哈哈", "喜欢", "爱", "开心", "棒", "好", "嘿嘿", "嘻嘻", "谢谢", "haha", "love", "great",
    "thanks", "😊", "❤️", "👍",
];

const NEGATIVE: &[&str] = &[
    "哼", "讨厌", "滚", "不理你", "生气", "烦", "死", "笨蛋", "hate", "stupid", "angry", "😡",
];

/// Per-keyword contribution. Negative words weigh a little more.
const POSITIVE_WEIGHT: f32 = 0.3;
const NEGATIVE_WEIGHT: f32 = 0.4;

/// How strongly a sentence moves the speaker's own emotion.
const SELF_FEEDBACK_GAIN: f32 = 0.5;

/// Keyword sentiment of a piece of text.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sentiment {
    /// `[0.0, 1.0]`
    pub positive: f32,
    /// `[0.0, 1.0]`
    pub negative: f32,
    /// `[0.0, 1.0]`
    pub intensity: f32,
}

impl Sentiment {
    pub fn is_neutral(&self) -> bool {
        self.intensity <= f32::EPSILON
    }

    /// Emotion change caused by saying (or hearing) this text.
    pub fn to_delta(&self) -> EmotionDelta {
        let mut delta = EmotionDelta::new();
        if self.positive > 0.0 {
            delta = delta.with("joy", self.positive * SELF_FEEDBACK_GAIN);
        }
        if self.negative > 0.0 {
            delta = delta.with("anger", self.negative * SELF_FEEDBACK_GAIN);
        }
        delta
    }

    /// Coarse intent tag with a confidence, when the polarity is clear enough.
    pub fn intent(&self) -> Option<(&'static str, f32)> {
        if self.negative > 0.3 && self.negative >= self.positive {
            Some(("angry", self.negative))
        } else if self.positive > 0.3 {
            Some(("happy", self.positive))
        } else {
            None
        }
    }
}

pub fn analyze_sentiment(text: &str) -> Sentiment {
    let lower = text.to_lowercase();
    let pos = POSITIVE.iter().filter(|w| lower.contains(*w)).count() as f32;
    let neg = NEGATIVE.iter().filter(|w| lower.contains(*w)).count() as f32;

    let positive = (pos * POSITIVE_WEIGHT).min(1.0);
    let negative = (neg * NEGATIVE_WEIGHT).min(1.0);

    Sentiment {
        positive,
        negative,
        intensity: (positive + negative).min(1.0),
    }
}
