//! Frame sampling loop: FrameSource → LandmarkDetector → state machine.
//!
//! The runner is strictly sequential: a frame is pulled, detected and fed
//! to the machine before the next one is sampled, so there is never more
//! than one detection in flight. Timers live in a [`TimerQueue`] owned by
//! the runner and are dropped on every exit path together with the frame
//! source's stream.

use crate::challenge::ChallengeKey;
use crate::config::LivenessConfig;
use crate::machine::{ChallengeStateMachine, SessionProgress, TimerKind, TimerStep, TimerTicket};
use crate::result::VerificationResult;
use crate::timers::TimerQueue;
use crate::types::{Frame, FrameAnalysis};
use chrono::Utc;
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("landmark model failed to load: {0}")]
    ModelLoad(String),
    #[error("landmark inference failed: {0}")]
    Inference(String),
}

#[derive(Error, Debug)]
pub enum FrameSourceError {
    #[error("camera unavailable: {0}")]
    CameraAccess(String),
    #[error("frame capture failed: {0}")]
    Capture(String),
    #[error("frame source exhausted")]
    Exhausted,
}

/// Face and landmark detector. Returns `None` when no face is in the frame.
pub trait LandmarkDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Option<FrameAnalysis>, DetectorError>;
}

/// Camera or other frame producer.
pub trait FrameSource: Send {
    /// Begin streaming. Called once per session before the first frame.
    fn start(&mut self) -> Result<(), FrameSourceError> {
        Ok(())
    }

    fn current_frame(&mut self) -> Result<Frame, FrameSourceError>;

    /// Release the stream. Called on every session exit path.
    fn stop(&mut self) {}
}

/// External requests observed by the runner between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Reset,
    Cancel,
    /// Nobody is waiting for the outcome any more.
    Disconnected,
}

pub trait SessionControl {
    fn poll(&mut self) -> Option<ControlSignal>;
}

/// A session with no external control.
pub struct NoControl;

impl SessionControl for NoControl {
    fn poll(&mut self) -> Option<ControlSignal> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Caller,
    TimedOut,
    Disconnected,
    SourceExhausted,
}

/// How a session ended. Produced exactly once per run.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed(Box<VerificationResult>),
    /// Aborted before completion; no result exists.
    Cancelled {
        reason: CancelReason,
        reached: Option<ChallengeKey>,
    },
}

pub struct SessionRunner<S, D> {
    source: S,
    detector: D,
    machine: ChallengeStateMachine,
    timers: TimerQueue,
    frame_interval: Duration,
    session_timeout: Option<Duration>,
}

impl<S: FrameSource, D: LandmarkDetector> SessionRunner<S, D> {
    pub fn new(source: S, detector: D, config: LivenessConfig) -> Self {
        Self {
            source,
            detector,
            frame_interval: config.timings.frame_interval(),
            session_timeout: config.timings.session_timeout(),
            machine: ChallengeStateMachine::new(config),
            timers: TimerQueue::new(),
        }
    }

    pub fn machine(&self) -> &ChallengeStateMachine {
        &self.machine
    }

    /// Run one session to completion or cancellation.
    ///
    /// Fails only if the frame source cannot start; that blocks the session
    /// before any state is created.
    pub fn run(
        &mut self,
        control: &mut impl SessionControl,
        mut on_progress: impl FnMut(&SessionProgress),
    ) -> Result<SessionOutcome, FrameSourceError> {
        self.source.start()?;
        let outcome = self.drive(control, &mut on_progress);
        self.timers.clear();
        self.source.stop();
        on_progress(&self.machine.progress());
        Ok(outcome)
    }

    fn drive(
        &mut self,
        control: &mut impl SessionControl,
        on_progress: &mut impl FnMut(&SessionProgress),
    ) -> SessionOutcome {
        if self.machine.cancel() {
            tracing::warn!("previous session was still running; cancelled");
        }
        if let Err(e) = self.machine.start(Utc::now()) {
            tracing::error!(error = %e, "session start refused");
        }
        // Measured from the latest start or reset, like the result's started_at.
        let mut deadline = self.session_timeout.map(|t| Instant::now() + t);
        let mut next_sample = Instant::now();
        let mut last_progress = self.machine.progress();
        on_progress(&last_progress);

        loop {
            while let Some(signal) = control.poll() {
                match signal {
                    ControlSignal::Reset => {
                        self.timers.clear();
                        self.machine.reset(Utc::now());
                        next_sample = Instant::now();
                        deadline = self.session_timeout.map(|t| next_sample + t);
                    }
                    ControlSignal::Cancel => return self.cancelled(CancelReason::Caller),
                    ControlSignal::Disconnected => {
                        return self.cancelled(CancelReason::Disconnected)
                    }
                }
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return self.cancelled(CancelReason::TimedOut);
            }

            for ticket in self.timers.take_due(Instant::now()) {
                match self.deliver(ticket) {
                    Ok(Some(outcome)) => return outcome,
                    Ok(None) => {}
                    Err(reason) => return self.cancelled(reason),
                }
            }

            let now = Instant::now();
            if now >= next_sample {
                next_sample = now + self.frame_interval;
                if !self.machine.is_quiesced() {
                    if let Err(reason) = self.sample() {
                        return self.cancelled(reason);
                    }
                }
            }

            let progress = self.machine.progress();
            if progress != last_progress {
                on_progress(&progress);
                last_progress = progress;
            }

            let mut wake = next_sample;
            if let Some(due) = self.timers.next_due() {
                wake = wake.min(due);
            }
            if let Some(d) = deadline {
                wake = wake.min(d);
            }
            let now = Instant::now();
            if wake > now {
                std::thread::sleep(wake - now);
            }
        }
    }

    /// Pull, detect, and feed one frame.
    fn sample(&mut self) -> Result<(), CancelReason> {
        let frame = match self.source.current_frame() {
            Ok(frame) => frame,
            Err(FrameSourceError::Exhausted) => return Err(CancelReason::SourceExhausted),
            Err(e) => {
                tracing::warn!(error = %e, "frame unavailable, skipping");
                return Ok(());
            }
        };
        let analysis = match self.detector.detect(&frame) {
            Ok(Some(analysis)) => analysis,
            Ok(None) => FrameAnalysis::no_face(),
            Err(e) => {
                tracing::warn!(error = %e, frame = frame.sequence, "detection failed, skipping");
                return Ok(());
            }
        };
        let step = self.machine.process_frame(&analysis);
        let now = Instant::now();
        for request in step.timers {
            self.timers.schedule(request, now);
        }
        Ok(())
    }

    /// Fire one due timer. Settle timers capture a fresh frame; if none can
    /// be had, or the capture fails, the ticket is retried a frame later.
    fn deliver(&mut self, ticket: TimerTicket) -> Result<Option<SessionOutcome>, CancelReason> {
        let frame = if matches!(ticket.kind, TimerKind::Settle(_)) && self.machine.accepts(&ticket) {
            match self.source.current_frame() {
                Ok(frame) => Some(frame),
                Err(FrameSourceError::Exhausted) => return Err(CancelReason::SourceExhausted),
                Err(e) => {
                    tracing::warn!(error = %e, "no frame for capture, retrying");
                    None
                }
            }
        } else {
            None
        };

        let retry_at = Instant::now() + self.frame_interval;
        match self.machine.on_timer(ticket, frame.as_ref(), Utc::now()) {
            Ok(TimerStep::Completed(result)) => Ok(Some(SessionOutcome::Completed(result))),
            Ok(TimerStep::Deferred) => {
                self.timers.schedule_at(ticket, retry_at);
                Ok(None)
            }
            Ok(TimerStep::Stale | TimerStep::BlinkReopened | TimerStep::Advanced { .. }) => Ok(None),
            Err(e) => {
                tracing::warn!(error = %e, "capture failed, retrying");
                self.timers.schedule_at(ticket, retry_at);
                Ok(None)
            }
        }
    }

    fn cancelled(&mut self, reason: CancelReason) -> SessionOutcome {
        let reached = self.machine.current_challenge();
        self.machine.cancel();
        tracing::info!(?reason, ?reached, "session ended without result");
        SessionOutcome::Cancelled { reason, reached }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Blank frames, optionally ending after `limit` pulls.
    pub struct CountingSource {
        pub next: u64,
        pub limit: Option<u64>,
        pub stopped: Arc<AtomicBool>,
        pub fail_start: bool,
    }

    impl CountingSource {
        pub fn new() -> Self {
            Self {
                next: 0,
                limit: None,
                stopped: Arc::new(AtomicBool::new(false)),
                fail_start: false,
            }
        }
    }

    impl FrameSource for CountingSource {
        fn start(&mut self) -> Result<(), FrameSourceError> {
            if self.fail_start {
                return Err(FrameSourceError::CameraAccess("permission denied".into()));
            }
            self.stopped.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn current_frame(&mut self) -> Result<Frame, FrameSourceError> {
            if self.limit.is_some_and(|l| self.next >= l) {
                return Err(FrameSourceError::Exhausted);
            }
            self.next += 1;
            Ok(Frame::blank(self.next, 4, 4))
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    /// Replays a script of detections; the last entry repeats forever.
    pub struct ScriptedDetector {
        pub script: VecDeque<Option<FrameAnalysis>>,
        pub last: Option<FrameAnalysis>,
        pub calls: Arc<AtomicUsize>,
    }

    impl ScriptedDetector {
        pub fn new(script: Vec<Option<FrameAnalysis>>) -> Self {
            Self {
                script: script.into(),
                last: None,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl LandmarkDetector for ScriptedDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Option<FrameAnalysis>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(next) = self.script.pop_front() {
                self.last = next;
            }
            Ok(self.last.clone())
        }
    }

    pub fn fast_config() -> LivenessConfig {
        let mut config = LivenessConfig::default();
        config.timings.settle_delay_ms = 5;
        config.timings.blink_reset_delay_ms = 2;
        config.timings.frame_interval_ms = 1;
        config
    }

    pub fn passing_script() -> Vec<Option<FrameAnalysis>> {
        use crate::geometry::fixtures::{self, CLOSED, OPEN};
        vec![
            Some(fixtures::frame(0.0)),
            Some(fixtures::frame(-15.0)),
            Some(fixtures::frame(15.0)),
            Some(fixtures::smiling(0.9)),
            Some(fixtures::frame_with_eyes(OPEN, OPEN)),
            Some(fixtures::frame_with_eyes(CLOSED, CLOSED)),
        ]
    }
}
