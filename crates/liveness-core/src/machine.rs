//! Challenge state machine.
//!
//! `Idle -(start)-> Running(challenge[0]) -(predicate)-> Settling
//! -(settle timer, capture)-> Running(challenge[i+1]) ... -> Completed`.
//!
//! The machine does no I/O and owns no clock. Deferred work (the settle
//! delay and the blink debounce) is handed back to the caller as
//! [`TimerRequest`]s; the caller fires them later through
//! [`ChallengeStateMachine::on_timer`]. Each ticket carries the
//! [`SessionHandle`] it was issued for, and a ticket whose handle or
//! expected state no longer matches is dropped as stale.

use crate::capture::{CaptureError, CaptureStore, CapturedImage};
use crate::challenge::{definition, ChallengeKey, ChallengeState, PredicateInput, CHALLENGES};
use crate::config::{CaptureSettings, LivenessConfig};
use crate::geometry::{FrameGeometry, GeometryAnalyzer};
use crate::result::{build_result, VerificationResult};
use crate::types::{Frame, FrameAnalysis};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MachineError {
    #[error("a session is already in progress")]
    AlreadyStarted,
    #[error("capture failed for challenge '{challenge}': {source}")]
    Capture {
        challenge: ChallengeKey,
        #[source]
        source: CaptureError,
    },
}

/// Identity of one session incarnation. `reset()` keeps the id and bumps
/// the epoch, which invalidates every ticket issued before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionHandle {
    pub id: Uuid,
    pub epoch: u32,
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.epoch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Running,
    /// Quiesced between a satisfying frame and the confirming capture.
    Settling,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlinkState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Capture the still for this challenge and advance.
    Settle(ChallengeKey),
    /// Return the blink state to open.
    BlinkReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerTicket {
    pub session: SessionHandle,
    pub kind: TimerKind,
}

/// Deferred work the caller must deliver back after `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub ticket: TimerTicket,
    pub delay: Duration,
}

/// The single mutable entity of a verification attempt.
#[derive(Debug, Clone)]
pub struct VerificationSession {
    pub(crate) handle: SessionHandle,
    pub(crate) current_index: usize,
    pub(crate) per_challenge_result: BTreeMap<ChallengeKey, bool>,
    pub(crate) captures: CaptureStore,
    pub(crate) blink_state: BlinkState,
    pub(crate) blink_event_count: u32,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
}

impl VerificationSession {
    pub(crate) fn new(capture: CaptureSettings, started_at: DateTime<Utc>) -> Self {
        Self::with_handle(
            SessionHandle {
                id: Uuid::new_v4(),
                epoch: 0,
            },
            capture,
            started_at,
        )
    }

    fn with_handle(
        handle: SessionHandle,
        capture: CaptureSettings,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            handle,
            current_index: 0,
            per_challenge_result: BTreeMap::new(),
            captures: CaptureStore::new(capture),
            blink_state: BlinkState::Open,
            blink_event_count: 0,
            started_at,
            completed_at: None,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn per_challenge_result(&self) -> &BTreeMap<ChallengeKey, bool> {
        &self.per_challenge_result
    }

    pub fn captured_images(&self) -> &BTreeMap<ChallengeKey, CapturedImage> {
        self.captures.images()
    }

    pub fn blink_state(&self) -> BlinkState {
        self.blink_state
    }

    pub fn blink_event_count(&self) -> u32 {
        self.blink_event_count
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    fn current_key(&self) -> Option<ChallengeKey> {
        CHALLENGES.get(self.current_index).map(|c| c.key)
    }
}

/// What processing one frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// No session is running.
    Inactive,
    /// Settling; frames are ignored until the capture is taken.
    Quiesced,
    /// The detector found no face. The active challenge keeps waiting.
    NoFace,
    /// The signal the active challenge needs could not be computed.
    Degenerate(ChallengeKey),
    Waiting(ChallengeKey),
    Satisfied(ChallengeKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameStep {
    pub status: FrameStatus,
    pub timers: Vec<TimerRequest>,
}

impl FrameStep {
    fn status(status: FrameStatus) -> Self {
        Self {
            status,
            timers: Vec::new(),
        }
    }
}

/// What delivering a timer ticket did.
#[derive(Debug, Clone, PartialEq)]
pub enum TimerStep {
    /// The ticket belonged to a superseded session or state; nothing changed.
    Stale,
    /// A settle ticket arrived without a frame to capture; still settling.
    Deferred,
    BlinkReopened,
    Advanced {
        captured: ChallengeKey,
        next: ChallengeKey,
    },
    Completed(Box<VerificationResult>),
}

/// Snapshot for progress displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionProgress {
    pub phase: Phase,
    pub current: Option<ChallengeKey>,
    pub prompt: Option<&'static str>,
    pub completed: usize,
    pub total: usize,
}

impl Default for SessionProgress {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            current: None,
            prompt: None,
            completed: 0,
            total: CHALLENGES.len(),
        }
    }
}

pub struct ChallengeStateMachine {
    config: LivenessConfig,
    analyzer: GeometryAnalyzer,
    phase: Phase,
    session: Option<VerificationSession>,
}

impl ChallengeStateMachine {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            analyzer: GeometryAnalyzer::new(config.thresholds.clone()),
            config,
            phase: Phase::Idle,
            session: None,
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> Option<&VerificationSession> {
        self.session.as_ref()
    }

    pub fn handle(&self) -> Option<SessionHandle> {
        self.session.as_ref().map(|s| s.handle)
    }

    /// The challenge currently Active or settling, if any.
    pub fn current_challenge(&self) -> Option<ChallengeKey> {
        match self.phase {
            Phase::Running | Phase::Settling => self.session.as_ref()?.current_key(),
            _ => None,
        }
    }

    pub fn is_quiesced(&self) -> bool {
        self.phase == Phase::Settling
    }

    /// Derived state of one challenge. At most one is ever Active.
    pub fn challenge_state(&self, key: ChallengeKey) -> ChallengeState {
        let index = key as usize;
        let current = self.session.as_ref().map_or(0, |s| s.current_index);
        match self.phase {
            Phase::Idle | Phase::Cancelled => ChallengeState::Pending,
            Phase::Completed => ChallengeState::Satisfied,
            Phase::Running if index == current => ChallengeState::Active,
            Phase::Running | Phase::Settling if index <= current => ChallengeState::Satisfied,
            Phase::Running | Phase::Settling => ChallengeState::Pending,
        }
    }

    pub fn progress(&self) -> SessionProgress {
        let current = self.current_challenge();
        SessionProgress {
            phase: self.phase,
            current,
            prompt: current.map(|k| definition(k).prompt),
            completed: CHALLENGES
                .iter()
                .filter(|c| self.challenge_state(c.key) == ChallengeState::Satisfied)
                .count(),
            total: CHALLENGES.len(),
        }
    }

    /// Begin a session at the first challenge.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<SessionHandle, MachineError> {
        if matches!(self.phase, Phase::Running | Phase::Settling) {
            return Err(MachineError::AlreadyStarted);
        }
        let session = VerificationSession::new(self.config.capture.clone(), now);
        let handle = session.handle;
        self.session = Some(session);
        self.phase = Phase::Running;
        tracing::info!(session = %handle, "liveness session started");
        Ok(handle)
    }

    /// Clear all progress and restart at the first challenge.
    ///
    /// Works from any phase. The new epoch makes every outstanding ticket
    /// stale; the caller should still drop its pending timers.
    pub fn reset(&mut self, now: DateTime<Utc>) -> SessionHandle {
        let handle = match &self.session {
            Some(old) => SessionHandle {
                id: old.handle.id,
                epoch: old.handle.epoch.wrapping_add(1),
            },
            None => SessionHandle {
                id: Uuid::new_v4(),
                epoch: 0,
            },
        };
        self.session = Some(VerificationSession::with_handle(
            handle,
            self.config.capture.clone(),
            now,
        ));
        self.phase = Phase::Running;
        tracing::info!(session = %handle, "liveness session reset");
        handle
    }

    /// Abort a session that has not completed. Returns whether anything was
    /// aborted; cancelling an idle or finished machine is a no-op.
    pub fn cancel(&mut self) -> bool {
        if !matches!(self.phase, Phase::Running | Phase::Settling) {
            return false;
        }
        if let Some(session) = self.session.take() {
            tracing::info!(
                session = %session.handle,
                reached = ?session.current_key(),
                "liveness session cancelled"
            );
        }
        self.phase = Phase::Cancelled;
        true
    }

    /// Evaluate the active challenge against one frame.
    pub fn process_frame(&mut self, analysis: &FrameAnalysis) -> FrameStep {
        match self.phase {
            Phase::Running => {}
            Phase::Settling => return FrameStep::status(FrameStatus::Quiesced),
            Phase::Idle | Phase::Completed | Phase::Cancelled => {
                return FrameStep::status(FrameStatus::Inactive)
            }
        }
        let Some(session) = self.session.as_mut() else {
            return FrameStep::status(FrameStatus::Inactive);
        };
        let Some(key) = session.current_key() else {
            return FrameStep::status(FrameStatus::Inactive);
        };

        if !analysis.face_detected {
            tracing::trace!(challenge = %key, "no face in frame");
            return FrameStep::status(FrameStatus::NoFace);
        }

        let thresholds = self.analyzer.thresholds();
        let geometry = self.analyzer.analyze(analysis);
        if !signal_available(key, &geometry) {
            tracing::debug!(challenge = %key, "degenerate landmarks, frame skipped");
            return FrameStep::status(FrameStatus::Degenerate(key));
        }

        let mut timers = Vec::new();
        let mut blink_event = false;
        if key == ChallengeKey::Blink && session.blink_state == BlinkState::Open {
            let closure = geometry
                .eye_aspect_ratio
                .and_then(|ear| ear.closure(thresholds).map(|c| (ear, c)));
            if let Some((ear, closure)) = closure {
                session.blink_state = BlinkState::Closed;
                session.blink_event_count += 1;
                blink_event = true;
                timers.push(TimerRequest {
                    ticket: TimerTicket {
                        session: session.handle,
                        kind: TimerKind::BlinkReset,
                    },
                    delay: self.config.timings.blink_reset_delay(),
                });
                tracing::debug!(
                    ?closure,
                    left = ear.left,
                    right = ear.right,
                    events = session.blink_event_count,
                    "blink closure detected"
                );
            }
        }

        let input = PredicateInput {
            analysis,
            geometry: &geometry,
            thresholds,
            blink_event,
        };
        if !(definition(key).predicate)(&input) {
            return FrameStep { status: FrameStatus::Waiting(key), timers };
        }

        session.per_challenge_result.insert(key, true);
        timers.push(TimerRequest {
            ticket: TimerTicket {
                session: session.handle,
                kind: TimerKind::Settle(key),
            },
            delay: self.config.timings.settle_delay(),
        });
        self.phase = Phase::Settling;
        tracing::info!(
            session = %session.handle,
            challenge = %key,
            offset = geometry.head_rotation.map(|r| r.offset),
            "challenge satisfied, settling"
        );
        FrameStep {
            status: FrameStatus::Satisfied(key),
            timers,
        }
    }

    /// Whether `ticket` still refers to the live session in the state it
    /// was issued for.
    pub fn accepts(&self, ticket: &TimerTicket) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        if session.handle != ticket.session {
            return false;
        }
        match ticket.kind {
            TimerKind::Settle(key) => {
                self.phase == Phase::Settling
                    && session.current_key() == Some(key)
                    && !session.captures.contains(key)
            }
            TimerKind::BlinkReset => {
                matches!(self.phase, Phase::Running | Phase::Settling)
                    && session.blink_state == BlinkState::Closed
            }
        }
    }

    /// Deliver a due timer. Settle tickets need the current frame for the
    /// capture; without one the machine keeps settling.
    pub fn on_timer(
        &mut self,
        ticket: TimerTicket,
        frame: Option<&Frame>,
        now: DateTime<Utc>,
    ) -> Result<TimerStep, MachineError> {
        if !self.accepts(&ticket) {
            tracing::debug!(session = %ticket.session, kind = ?ticket.kind, "stale timer ignored");
            return Ok(TimerStep::Stale);
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(TimerStep::Stale);
        };

        let key = match ticket.kind {
            TimerKind::BlinkReset => {
                session.blink_state = BlinkState::Open;
                tracing::debug!(session = %session.handle, "blink state reopened");
                return Ok(TimerStep::BlinkReopened);
            }
            TimerKind::Settle(key) => key,
        };

        let Some(frame) = frame else {
            return Ok(TimerStep::Deferred);
        };
        match session.captures.capture(key, frame, now) {
            Ok(_) => {}
            Err(CaptureError::AlreadyCaptured(key)) => {
                tracing::error!(challenge = %key, "refused duplicate capture");
            }
            Err(source) => {
                return Err(MachineError::Capture {
                    challenge: key,
                    source,
                })
            }
        }

        session.current_index += 1;
        if let Some(next) = session.current_key() {
            self.phase = Phase::Running;
            tracing::info!(session = %session.handle, captured = %key, next = %next, "advanced");
            return Ok(TimerStep::Advanced { captured: key, next });
        }

        session.completed_at = Some(now);
        self.phase = Phase::Completed;
        let result = build_result(session, now);
        tracing::info!(
            session = %session.handle,
            success = result.success(),
            images = result.captured_images().len(),
            "liveness session completed"
        );
        Ok(TimerStep::Completed(Box::new(result)))
    }
}

/// The active challenge's signal must be computable for the frame to count.
fn signal_available(key: ChallengeKey, geometry: &FrameGeometry) -> bool {
    match key {
        ChallengeKey::Front | ChallengeKey::Left | ChallengeKey::Right => {
            geometry.head_rotation.is_some()
        }
        ChallengeKey::Blink => geometry.eye_aspect_ratio.is_some(),
        ChallengeKey::Smile => true,
    }
}
