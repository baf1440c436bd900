use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A 2D landmark position in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Facial landmark groups used by the challenge predicates.
///
/// Point ordering follows the 68-point iBUG convention:
///
/// * `left_eye` / `right_eye` — six contour points `p1..p6`, starting at the
///   outer corner for the left eye and the inner corner for the right eye,
///   running clockwise. `p1`/`p4` are the horizontal corners.
/// * `nose` — bridge from top to tip (`nose[3]`), then the nostril base.
/// * `jaw` — jaw line, left to right. Carried for callers; no predicate
///   reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub left_eye: [Point; 6],
    pub right_eye: [Point; 6],
    pub nose: Vec<Point>,
    #[serde(default)]
    pub jaw: Vec<Point>,
}

/// Expression key that the smile challenge reads.
pub const EXPRESSION_HAPPY: &str = "happy";

/// Per-frame output of the landmark detector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameAnalysis {
    pub face_detected: bool,
    #[serde(default)]
    pub landmarks: Option<FaceLandmarks>,
    /// Expression classifier scores in `[0, 1]`, keyed by expression name.
    #[serde(default)]
    pub expression_scores: HashMap<String, f32>,
}

impl FrameAnalysis {
    /// A frame in which the detector found a face.
    pub fn face(landmarks: FaceLandmarks, expression_scores: HashMap<String, f32>) -> Self {
        Self {
            face_detected: true,
            landmarks: Some(landmarks),
            expression_scores,
        }
    }

    /// A frame in which the detector found nothing.
    pub fn no_face() -> Self {
        Self::default()
    }

    /// Score for a named expression; absent expressions score zero.
    pub fn expression(&self, name: &str) -> f32 {
        self.expression_scores.get(name).copied().unwrap_or(0.0)
    }
}

/// A raw camera frame, packed RGB8.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Monotonic sample counter assigned by the frame source.
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    /// Uniform grey frame; useful for sources that have no pixels to offer.
    pub fn blank(sequence: u64, width: u32, height: u32) -> Self {
        Self {
            sequence,
            width,
            height,
            data: vec![128; width as usize * height as usize * 3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_distance() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_expression_scores_zero() {
        let analysis = FrameAnalysis::no_face();
        assert!(!analysis.face_detected);
        assert_eq!(analysis.expression(EXPRESSION_HAPPY), 0.0);
    }

    #[test]
    fn test_blank_frame_size() {
        let frame = Frame::blank(7, 4, 2);
        assert_eq!(frame.data.len(), 4 * 2 * 3);
        assert_eq!(frame.sequence, 7);
    }

    #[test]
    fn test_analysis_deserializes_without_optional_fields() {
        let analysis: FrameAnalysis = serde_json::from_str(r#"{"face_detected":false}"#).unwrap();
        assert_eq!(analysis, FrameAnalysis::no_face());
    }
}
