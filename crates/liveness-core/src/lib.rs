//! liveness-core — challenge-response liveness verification.
//!
//! Walks a user through a fixed sequence of head-pose and expression
//! challenges (face forward, turn left, turn right, smile, blink), decides
//! per frame whether the active challenge is met from landmark geometry,
//! captures one confirming still per challenge, and produces a pass/fail
//! [`VerificationResult`].
//!
//! The face/landmark detector and the camera are external: plug them in
//! through [`LandmarkDetector`] and [`FrameSource`].

pub mod capture;
pub mod challenge;
pub mod config;
pub mod engine;
pub mod geometry;
pub mod machine;
pub mod pipeline;
pub mod result;
pub mod timers;
pub mod types;

pub use capture::{CaptureStore, CapturedImage};
pub use challenge::{ChallengeKey, ChallengeState, CHALLENGES};
pub use config::LivenessConfig;
pub use engine::{spawn_engine, EngineError, EngineHandle};
pub use machine::{ChallengeStateMachine, Phase, SessionHandle, SessionProgress};
pub use pipeline::{
    CancelReason, DetectorError, FrameSource, FrameSourceError, LandmarkDetector, SessionOutcome,
};
pub use result::VerificationResult;
pub use types::{FaceLandmarks, Frame, FrameAnalysis, Point};
