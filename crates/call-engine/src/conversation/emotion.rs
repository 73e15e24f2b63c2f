//! Emotion signal at the recognition boundary.
//!
//! The emotion analyzer is an external collaborator; the engine only
//! sees its verdict as a label plus confidence and decides whether the
//! conversation has to adapt.

use serde::{Deserialize, Serialize};

/// Emotion categories reported by the analyzer collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmotionLabel {
    Neutral,
    Happy,
    Sad,
    Angry,
    Frustrated,
}

impl EmotionLabel {
    /// Whether this emotion, when confident enough, should force
    /// objection handling.
    pub fn is_negative(&self) -> bool {
        matches!(
            self,
            EmotionLabel::Angry | EmotionLabel::Frustrated | EmotionLabel::Sad
        )
    }
}

/// One detected emotion with its confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionSignal {
    pub label: EmotionLabel,
    /// Analyzer confidence in `0.0..=1.0`.
    pub confidence: f32,
}

impl EmotionSignal {
    pub fn new(label: EmotionLabel, confidence: f32) -> Self {
        Self { label, confidence }
    }

    /// Neutral with full confidence; the analyzer's fallback when it
    /// cannot tell.
    pub fn neutral() -> Self {
        Self::new(EmotionLabel::Neutral, 1.0)
    }

    /// A strongly negative signal above the threshold forces the
    /// conversation into objection handling regardless of state.
    pub fn requires_adaptation(&self, threshold: f32) -> bool {
        self.label.is_negative() && self.confidence >= threshold
    }
}
