use crate::config::{ConfigError, LivenessConfig};
use crate::machine::SessionProgress;
use crate::pipeline::{
    ControlSignal, DetectorError, FrameSource, FrameSourceError, LandmarkDetector, SessionControl,
    SessionOutcome, SessionRunner,
};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("landmark detector failed to initialize: {0}")]
    ModelLoad(#[source] DetectorError),
    #[error("camera unavailable: {0}")]
    CameraAccess(#[source] FrameSourceError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("a liveness session is already running")]
    SessionBusy,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from handles to the engine thread.
enum EngineRequest {
    Run {
        reply: oneshot::Sender<Result<SessionOutcome, EngineError>>,
    },
    Reset,
    Cancel,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    progress: watch::Receiver<SessionProgress>,
}

impl EngineHandle {
    /// Run one liveness session and wait for its single outcome.
    ///
    /// Dropping the returned future before it resolves aborts the session
    /// with [`CancelReason::Disconnected`](crate::pipeline::CancelReason).
    pub async fn run_session(&self) -> Result<SessionOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Run { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Restart the running session at its first challenge. Ignored when no
    /// session is running.
    pub async fn reset(&self) -> Result<(), EngineError> {
        self.tx
            .send(EngineRequest::Reset)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Abort the running session. Ignored when no session is running.
    pub async fn cancel(&self) -> Result<(), EngineError> {
        self.tx
            .send(EngineRequest::Cancel)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Live view of the active challenge.
    pub fn progress(&self) -> watch::Receiver<SessionProgress> {
        self.progress.clone()
    }
}

/// Engine-side view of the request channel while a session runs.
struct RequestControl<'a> {
    rx: &'a mut mpsc::Receiver<EngineRequest>,
    waiter: &'a oneshot::Sender<Result<SessionOutcome, EngineError>>,
}

impl SessionControl for RequestControl<'_> {
    fn poll(&mut self) -> Option<ControlSignal> {
        if self.waiter.is_closed() {
            return Some(ControlSignal::Disconnected);
        }
        loop {
            match self.rx.try_recv() {
                Ok(EngineRequest::Run { reply }) => {
                    let _ = reply.send(Err(EngineError::SessionBusy));
                }
                Ok(EngineRequest::Reset) => return Some(ControlSignal::Reset),
                Ok(EngineRequest::Cancel) => return Some(ControlSignal::Cancel),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => return Some(ControlSignal::Disconnected),
            }
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Validates the configuration, opens the frame source and loads the
/// detector synchronously, then enters a request loop. Fails fast if any
/// of them is unavailable.
pub fn spawn_engine<S, D>(
    open_source: impl FnOnce() -> Result<S, FrameSourceError>,
    load_detector: impl FnOnce() -> Result<D, DetectorError>,
    config: LivenessConfig,
) -> Result<EngineHandle, EngineError>
where
    S: FrameSource + 'static,
    D: LandmarkDetector + 'static,
{
    config.validate()?;

    let source = open_source().map_err(EngineError::CameraAccess)?;
    tracing::info!("frame source opened");

    let detector = load_detector().map_err(EngineError::ModelLoad)?;
    tracing::info!("landmark detector loaded");

    tracing::info!(
        center_offset_px = config.thresholds.center_offset_px,
        ear_both_closed = config.thresholds.ear_both_closed,
        ear_single_closed = config.thresholds.ear_single_closed,
        accept_wink = config.thresholds.accept_single_eye_closure,
        settle_ms = config.timings.settle_delay_ms,
        "liveness calibration"
    );

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let (progress_tx, progress_rx) = watch::channel(SessionProgress::default());
    let mut runner = SessionRunner::new(source, detector, config);

    std::thread::Builder::new()
        .name("liveness-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Run { reply } => {
                        let outcome = {
                            let mut control = RequestControl {
                                rx: &mut rx,
                                waiter: &reply,
                            };
                            runner.run(&mut control, |p| {
                                progress_tx.send_replace(p.clone());
                            })
                        };
                        let _ = reply.send(outcome.map_err(EngineError::CameraAccess));
                    }
                    EngineRequest::Reset | EngineRequest::Cancel => {
                        tracing::debug!("no session running; control request ignored");
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok(EngineHandle {
        tx,
        progress: progress_rx,
    })
}
