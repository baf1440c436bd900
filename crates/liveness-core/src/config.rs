//! Engine calibration.
//!
//! Every threshold here is an empirical calibration against a typical
//! 640×480 webcam stream and the 68-point landmark layout. They are
//! resolution- and detector-dependent, not universal constants: a 1080p
//! source produces proportionally larger pixel offsets, and a different
//! landmark model shifts the EAR baseline.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be a finite, non-negative number (got {value})")]
    InvalidThreshold { name: &'static str, value: f32 },
    #[error("ear_epsilon must be positive (got {0})")]
    InvalidEpsilon(f32),
    #[error("frame_interval_ms must be at least 1")]
    ZeroFrameInterval,
    #[error("jpeg_quality must be within 1..=100 (got {0})")]
    InvalidJpegQuality(u8),
}

/// Geometric and expression thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Horizontal nose-to-eye-midpoint offset (pixels) within which the head
    /// counts as facing forward. Beyond it, the sign picks left or right.
    pub center_offset_px: f32,
    /// Average EAR below which both eyes count as closed.
    pub ear_both_closed: f32,
    /// Single-eye EAR below which that eye counts as closed.
    pub ear_single_closed: f32,
    /// Minimum `happy` expression score for the smile challenge (exclusive).
    pub smile_score: f32,
    /// Eye widths (pixels) below this make EAR not computable for the frame.
    pub ear_epsilon: f32,
    /// Whether a one-eyed closure (wink) satisfies the blink challenge.
    /// A held single-eye-closed photo can pass when this is on.
    pub accept_single_eye_closure: bool,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            center_offset_px: 10.0,
            ear_both_closed: 0.40,
            ear_single_closed: 0.35,
            smile_score: 0.80,
            ear_epsilon: 1e-3,
            accept_single_eye_closure: true,
        }
    }
}

/// Delays of the settle and blink-debounce timers and the sampling rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Pause between satisfying a challenge and capturing its still.
    pub settle_delay_ms: u64,
    /// Time after a blink closure before the eye state returns to open.
    pub blink_reset_delay_ms: u64,
    /// Interval between frame samples.
    pub frame_interval_ms: u64,
    /// Optional caller-imposed session deadline. `None` waits indefinitely.
    pub session_timeout_ms: Option<u64>,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            settle_delay_ms: 1000,
            blink_reset_delay_ms: 300,
            frame_interval_ms: 100,
            session_timeout_ms: None,
        }
    }
}

impl Timings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn blink_reset_delay(&self) -> Duration {
        Duration::from_millis(self.blink_reset_delay_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    Jpeg,
    Png,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub format: CaptureFormat,
    pub jpeg_quality: u8,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            format: CaptureFormat::Jpeg,
            jpeg_quality: 85,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub thresholds: Thresholds,
    pub timings: Timings,
    pub capture: CaptureSettings,
}

impl LivenessConfig {
    /// Reject calibrations that would make a challenge unreachable or
    /// trivially satisfied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        for (name, value) in [
            ("center_offset_px", t.center_offset_px),
            ("ear_both_closed", t.ear_both_closed),
            ("ear_single_closed", t.ear_single_closed),
            ("smile_score", t.smile_score),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }
        if !(t.ear_epsilon.is_finite() && t.ear_epsilon > 0.0) {
            return Err(ConfigError::InvalidEpsilon(t.ear_epsilon));
        }
        if self.timings.frame_interval_ms == 0 {
            return Err(ConfigError::ZeroFrameInterval);
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(ConfigError::InvalidJpegQuality(self.capture.jpeg_quality));
        }
        Ok(())
    }
}
