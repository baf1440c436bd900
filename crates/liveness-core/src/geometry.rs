//! Geometric signals derived from facial landmarks.
//!
//! Two signals drive the challenges:
//!
//! - **Head rotation**: the horizontal offset of the nose tip from the
//!   midpoint of the two outer eye corners. A frontal face puts the nose tip
//!   close to that midpoint; turning the head slides it towards one side.
//! - **Eye aspect ratio (EAR)**: eye height over eye width from the six eye
//!   contour points (Soukupová & Čech, 2016). It collapses towards zero as
//!   the lid closes.
//!
//! Both return `None` when the landmarks are degenerate (missing points or a
//! near-zero eye width). A degenerate frame is skipped, never an error.

use crate::config::Thresholds;
use crate::types::{FaceLandmarks, FrameAnalysis, Point};
use serde::Serialize;

/// Index of the nose tip within [`FaceLandmarks::nose`].
pub const NOSE_TIP: usize = 3;
/// Index of the outer corner within [`FaceLandmarks::left_eye`].
pub const LEFT_EYE_OUTER: usize = 0;
/// Index of the outer corner within [`FaceLandmarks::right_eye`].
pub const RIGHT_EYE_OUTER: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeadRotationSignal {
    /// Nose tip x minus the outer-eye-corner midpoint x, in pixels.
    pub offset: f32,
    pub is_left: bool,
    pub is_right: bool,
    pub is_center: bool,
}

impl HeadRotationSignal {
    /// Classify a raw offset against the centre dead band.
    pub fn classify(offset: f32, center_offset_px: f32) -> Self {
        Self {
            offset,
            is_left: offset < -center_offset_px,
            is_right: offset > center_offset_px,
            is_center: offset.abs() <= center_offset_px,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EyeAspectRatio {
    pub left: f32,
    pub right: f32,
    pub average: f32,
}

/// Which eyes a closure involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EyeClosure {
    Both,
    Left,
    Right,
}

impl EyeAspectRatio {
    /// Classify this frame's eye state.
    ///
    /// Both eyes are closed when the average drops below `ear_both_closed`.
    /// A single closed eye (below `ear_single_closed`, the other at or above
    /// it) counts only when `accept_single_eye_closure` is set.
    pub fn closure(&self, thresholds: &Thresholds) -> Option<EyeClosure> {
        if self.average < thresholds.ear_both_closed {
            return Some(EyeClosure::Both);
        }
        if !thresholds.accept_single_eye_closure {
            return None;
        }
        let single = thresholds.ear_single_closed;
        if self.left < single && self.right >= single {
            Some(EyeClosure::Left)
        } else if self.right < single && self.left >= single {
            Some(EyeClosure::Right)
        } else {
            None
        }
    }
}

/// Horizontal head rotation from the nose tip and outer eye corners.
///
/// Returns `None` if the nose group is too short to contain a tip or any
/// coordinate is non-finite.
pub fn compute_head_rotation(
    landmarks: &FaceLandmarks,
    center_offset_px: f32,
) -> Option<HeadRotationSignal> {
    let nose_tip = landmarks.nose.get(NOSE_TIP)?;
    let left_outer = landmarks.left_eye[LEFT_EYE_OUTER];
    let right_outer = landmarks.right_eye[RIGHT_EYE_OUTER];

    let mid_x = (left_outer.x + right_outer.x) / 2.0;
    let offset = nose_tip.x - mid_x;
    if !offset.is_finite() {
        return None;
    }
    Some(HeadRotationSignal::classify(offset, center_offset_px))
}

/// EAR of a single eye: `(|p2−p6| + |p3−p5|) / (2·|p1−p4|)`.
///
/// Returns `None` when the eye width `|p1−p4|` is below `epsilon`.
pub fn compute_ear(eye: &[Point; 6], epsilon: f32) -> Option<f32> {
    let [p1, p2, p3, p4, p5, p6] = eye;
    let width = p1.distance(p4);
    if !width.is_finite() || width < epsilon {
        return None;
    }
    let ear = (p2.distance(p6) + p3.distance(p5)) / (2.0 * width);
    ear.is_finite().then_some(ear)
}

/// Per-eye and average EAR. `None` if either eye is degenerate.
pub fn compute_eye_aspect_ratio(landmarks: &FaceLandmarks, epsilon: f32) -> Option<EyeAspectRatio> {
    let left = compute_ear(&landmarks.left_eye, epsilon)?;
    let right = compute_ear(&landmarks.right_eye, epsilon)?;
    Some(EyeAspectRatio {
        left,
        right,
        average: (left + right) / 2.0,
    })
}

/// Signals derived from one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameGeometry {
    pub head_rotation: Option<HeadRotationSignal>,
    pub eye_aspect_ratio: Option<EyeAspectRatio>,
}

/// Derives [`FrameGeometry`] from detector output using a fixed calibration.
#[derive(Debug, Clone)]
pub struct GeometryAnalyzer {
    thresholds: Thresholds,
}

impl GeometryAnalyzer {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn analyze(&self, analysis: &FrameAnalysis) -> FrameGeometry {
        let Some(landmarks) = analysis.landmarks.as_ref().filter(|_| analysis.face_detected)
        else {
            return FrameGeometry::default();
        };
        FrameGeometry {
            head_rotation: compute_head_rotation(landmarks, self.thresholds.center_offset_px),
            eye_aspect_ratio: compute_eye_aspect_ratio(landmarks, self.thresholds.ear_epsilon),
        }
    }
}
