//! The fixed, ordered challenge table.

use crate::config::Thresholds;
use crate::geometry::FrameGeometry;
use crate::types::{FrameAnalysis, EXPRESSION_HAPPY};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a challenge. Declaration order is evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeKey {
    Front,
    Left,
    Right,
    Smile,
    Blink,
}

impl ChallengeKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Front => "front",
            Self::Left => "left",
            Self::Right => "right",
            Self::Smile => "smile",
            Self::Blink => "blink",
        }
    }
}

impl fmt::Display for ChallengeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one challenge within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeState {
    Pending,
    Active,
    Satisfied,
}

/// Everything a predicate may look at for one frame.
#[derive(Debug, Clone, Copy)]
pub struct PredicateInput<'a> {
    pub analysis: &'a FrameAnalysis,
    pub geometry: &'a FrameGeometry,
    pub thresholds: &'a Thresholds,
    /// A blink closure edge fired on this frame.
    pub blink_event: bool,
}

pub struct ChallengeDefinition {
    pub key: ChallengeKey,
    pub label: &'static str,
    /// Instruction shown to the user while the challenge is active.
    pub prompt: &'static str,
    pub predicate: fn(&PredicateInput<'_>) -> bool,
}

impl fmt::Debug for ChallengeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeDefinition")
            .field("key", &self.key)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

fn faces_forward(input: &PredicateInput<'_>) -> bool {
    input.analysis.face_detected && input.geometry.head_rotation.is_some_and(|r| r.is_center)
}

fn turned_left(input: &PredicateInput<'_>) -> bool {
    input.geometry.head_rotation.is_some_and(|r| r.is_left)
}

fn turned_right(input: &PredicateInput<'_>) -> bool {
    input.geometry.head_rotation.is_some_and(|r| r.is_right)
}

fn smiling(input: &PredicateInput<'_>) -> bool {
    input.analysis.expression(EXPRESSION_HAPPY) > input.thresholds.smile_score
}

fn blinked(input: &PredicateInput<'_>) -> bool {
    input.blink_event
}

pub static CHALLENGES: [ChallengeDefinition; 5] = [
    ChallengeDefinition {
        key: ChallengeKey::Front,
        label: "Face forward",
        prompt: "Look straight at the camera",
        predicate: faces_forward,
    },
    ChallengeDefinition {
        key: ChallengeKey::Left,
        label: "Turn left",
        prompt: "Turn your head to the left",
        predicate: turned_left,
    },
    ChallengeDefinition {
        key: ChallengeKey::Right,
        label: "Turn right",
        prompt: "Turn your head to the right",
        predicate: turned_right,
    },
    ChallengeDefinition {
        key: ChallengeKey::Smile,
        label: "Smile",
        prompt: "Smile at the camera",
        predicate: smiling,
    },
    ChallengeDefinition {
        key: ChallengeKey::Blink,
        label: "Blink",
        prompt: "Blink your eyes",
        predicate: blinked,
    },
];

pub fn definition(key: ChallengeKey) -> &'static ChallengeDefinition {
    // The table is ordered by key, so the discriminant is the index.
    &CHALLENGES[key as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::fixtures;
    use crate::geometry::GeometryAnalyzer;

    fn evaluate(key: ChallengeKey, analysis: &FrameAnalysis, blink_event: bool) -> bool {
        let thresholds = Thresholds::default();
        let geometry = GeometryAnalyzer::new(thresholds.clone()).analyze(analysis);
        let input = PredicateInput {
            analysis,
            geometry: &geometry,
            thresholds: &thresholds,
            blink_event,
        };
        (definition(key).predicate)(&input)
    }

    #[test]
    fn test_table_order_matches_keys() {
        let keys: Vec<_> = CHALLENGES.iter().map(|c| c.key).collect();
        assert_eq!(
            keys,
            vec![
                ChallengeKey::Front,
                ChallengeKey::Left,
                ChallengeKey::Right,
                ChallengeKey::Smile,
                ChallengeKey::Blink,
            ]
        );
        for (i, c) in CHALLENGES.iter().enumerate() {
            assert_eq!(c.key as usize, i);
        }
    }

    #[test]
    fn test_front_requires_face_and_center() {
        assert!(evaluate(ChallengeKey::Front, &fixtures::frame(0.0), false));
        assert!(!evaluate(ChallengeKey::Front, &fixtures::frame(-15.0), false));
        assert!(!evaluate(ChallengeKey::Front, &FrameAnalysis::no_face(), false));
    }

    #[test]
    fn test_turn_predicates() {
        assert!(evaluate(ChallengeKey::Left, &fixtures::frame(-15.0), false));
        assert!(!evaluate(ChallengeKey::Left, &fixtures::frame(15.0), false));
        assert!(evaluate(ChallengeKey::Right, &fixtures::frame(15.0), false));
        assert!(!evaluate(ChallengeKey::Right, &fixtures::frame(0.0), false));
    }

    #[test]
    fn test_smile_threshold_is_exclusive() {
        assert!(evaluate(ChallengeKey::Smile, &fixtures::smiling(0.9), false));
        assert!(!evaluate(ChallengeKey::Smile, &fixtures::smiling(0.8), false));
        assert!(!evaluate(ChallengeKey::Smile, &fixtures::frame(0.0), false));
    }

    #[test]
    fn test_blink_follows_event_flag() {
        assert!(evaluate(ChallengeKey::Blink, &fixtures::frame(0.0), true));
        assert!(!evaluate(ChallengeKey::Blink, &fixtures::frame(0.0), false));
    }

    #[test]
    fn test_key_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ChallengeKey::Smile).unwrap(), "\"smile\"");
        assert_eq!(ChallengeKey::Left.to_string(), "left");
    }
}
