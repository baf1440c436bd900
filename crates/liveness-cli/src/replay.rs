//! Recorded landmark traces as a frame source and detector.
//!
//! A trace is JSON lines, one record per frame pull:
//!
//! ```text
//! {"face_detected": true, "landmarks": {...}, "expression_scores": {"happy": 0.9}}
//! {"face_detected": false, "image": "frames/0002.png"}
//! ```
//!
//! Both sampled frames and settle captures pull a record, so a settle
//! capture consumes the record that follows the satisfying frame. Blank
//! lines and lines starting with `#` are skipped.

use anyhow::{Context, Result};
use liveness_core::pipeline::{DetectorError, FrameSource, FrameSourceError, LandmarkDetector};
use liveness_core::{Frame, FrameAnalysis};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct TraceRecord {
    #[serde(flatten)]
    pub analysis: FrameAnalysis,
    /// Still to hand out for this record; blank frame when absent.
    #[serde(default)]
    pub image: Option<PathBuf>,
}

pub fn load_trace(path: &Path) -> Result<Vec<TraceRecord>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading trace {}", path.display()))?;
    parse_trace(&text, path.parent().unwrap_or(Path::new(".")))
}

/// Parse trace text; relative image paths resolve against `base`.
pub fn parse_trace(text: &str, base: &Path) -> Result<Vec<TraceRecord>> {
    let mut records = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut record: TraceRecord =
            serde_json::from_str(line).with_context(|| format!("trace line {}", i + 1))?;
        if let Some(image) = record.image.take() {
            record.image = Some(base.join(image));
        }
        records.push(record);
    }
    Ok(records)
}

/// Hands out one trace record per pull, then reports exhaustion.
pub struct TraceSource {
    trace: Arc<Vec<TraceRecord>>,
    cursor: usize,
    width: u32,
    height: u32,
}

impl TraceSource {
    pub fn new(trace: Arc<Vec<TraceRecord>>, width: u32, height: u32) -> Self {
        Self {
            trace,
            cursor: 0,
            width,
            height,
        }
    }
}

impl FrameSource for TraceSource {
    fn start(&mut self) -> Result<(), FrameSourceError> {
        if self.trace.is_empty() {
            return Err(FrameSourceError::CameraAccess("trace has no frames".into()));
        }
        self.cursor = 0;
        Ok(())
    }

    fn current_frame(&mut self) -> Result<Frame, FrameSourceError> {
        let record = self.trace.get(self.cursor).ok_or(FrameSourceError::Exhausted)?;
        let sequence = self.cursor as u64;
        self.cursor += 1;

        let Some(path) = &record.image else {
            return Ok(Frame::blank(sequence, self.width, self.height));
        };
        let img = image::open(path)
            .map_err(|e| FrameSourceError::Capture(format!("{}: {e}", path.display())))?
            .to_rgb8();
        Ok(Frame {
            sequence,
            width: img.width(),
            height: img.height(),
            data: img.into_raw(),
        })
    }
}

/// Returns the recorded analysis for the frame's trace position.
pub struct TraceDetector {
    trace: Arc<Vec<TraceRecord>>,
}

impl TraceDetector {
    pub fn new(trace: Arc<Vec<TraceRecord>>) -> Self {
        Self { trace }
    }
}

impl LandmarkDetector for TraceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Option<FrameAnalysis>, DetectorError> {
        let record = self.trace.get(frame.sequence as usize).ok_or_else(|| {
            DetectorError::Inference(format!("frame {} is outside the trace", frame.sequence))
        })?;
        Ok(record
            .analysis
            .face_detected
            .then(|| record.analysis.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liveness_core::pipeline::SessionOutcome;
    use liveness_core::{spawn_engine, FaceLandmarks, LivenessConfig, Point};
    use std::collections::HashMap;

    fn eye(x0: f32, half_height: f32) -> [Point; 6] {
        [
            Point::new(x0, 100.0),
            Point::new(x0 + 10.0, 100.0 - half_height),
            Point::new(x0 + 20.0, 100.0 - half_height),
            Point::new(x0 + 30.0, 100.0),
            Point::new(x0 + 20.0, 100.0 + half_height),
            Point::new(x0 + 10.0, 100.0 + half_height),
        ]
    }

    fn face(offset: f32, half_height: f32, happy: f32) -> FrameAnalysis {
        let landmarks = FaceLandmarks {
            left_eye: eye(100.0, half_height),
            right_eye: eye(170.0, half_height),
            nose: vec![
                Point::new(150.0, 100.0),
                Point::new(150.0, 115.0),
                Point::new(150.0, 130.0),
                Point::new(150.0 + offset, 145.0),
            ],
            jaw: Vec::new(),
        };
        let mut scores = HashMap::new();
        scores.insert("happy".to_string(), happy);
        FrameAnalysis::face(landmarks, scores)
    }

    fn trace_text(frames: &[FrameAnalysis]) -> String {
        frames
            .iter()
            .map(|f| serde_json::to_string(f).unwrap())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Satisfying frame followed by the capture frame, per challenge.
    fn passing_frames() -> Vec<FrameAnalysis> {
        vec![
            face(0.0, 9.0, 0.0),
            face(0.0, 9.0, 0.0),
            face(-15.0, 9.0, 0.0),
            face(-15.0, 9.0, 0.0),
            face(15.0, 9.0, 0.0),
            face(15.0, 9.0, 0.0),
            face(0.0, 9.0, 0.95),
            face(0.0, 9.0, 0.95),
            face(0.0, 9.0, 0.0),
            face(0.0, 3.0, 0.0),
            face(0.0, 9.0, 0.0),
        ]
    }

    fn fast_config() -> LivenessConfig {
        let mut config = LivenessConfig::default();
        config.timings.settle_delay_ms = 5;
        config.timings.blink_reset_delay_ms = 2;
        config.timings.frame_interval_ms = 1;
        config
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let text = format!(
            "# recorded 2026-10-01\n\n{}\n{{\"face_detected\": false, \"image\": \"f.png\"}}\n",
            serde_json::to_string(&face(0.0, 9.0, 0.0)).unwrap()
        );
        let records = parse_trace(&text, Path::new("/data")).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].analysis.face_detected);
        assert_eq!(records[1].image.as_deref(), Some(Path::new("/data/f.png")));
    }

    #[test]
    fn test_parse_reports_line_number() {
        let err = parse_trace("{\"face_detected\": true}\nnot json\n", Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("trace line 2"));
    }

    #[test]
    fn test_source_exhausts_after_trace() {
        let trace = Arc::new(parse_trace(&trace_text(&[face(0.0, 9.0, 0.0)]), Path::new(".")).unwrap());
        let mut source = TraceSource::new(trace, 8, 6);
        source.start().unwrap();
        let frame = source.current_frame().unwrap();
        assert_eq!((frame.sequence, frame.width, frame.height), (0, 8, 6));
        assert!(matches!(source.current_frame(), Err(FrameSourceError::Exhausted)));
    }

    #[test]
    fn test_empty_trace_refuses_start() {
        let mut source = TraceSource::new(Arc::new(Vec::new()), 8, 6);
        assert!(matches!(source.start(), Err(FrameSourceError::CameraAccess(_))));
    }

    #[test]
    fn test_detector_maps_no_face_to_none() {
        let trace = Arc::new(parse_trace("{\"face_detected\": false}", Path::new(".")).unwrap());
        let mut detector = TraceDetector::new(trace);
        assert!(detector.detect(&Frame::blank(0, 2, 2)).unwrap().is_none());
        assert!(detector.detect(&Frame::blank(5, 2, 2)).is_err());
    }

    #[tokio::test]
    async fn test_replay_full_trace_passes() {
        let trace = Arc::new(parse_trace(&trace_text(&passing_frames()), Path::new(".")).unwrap());
        let source_trace = trace.clone();
        let handle = spawn_engine(
            move || Ok(TraceSource::new(source_trace, 16, 12)),
            move || Ok(TraceDetector::new(trace)),
            fast_config(),
        )
        .unwrap();

        let SessionOutcome::Completed(result) = handle.run_session().await.unwrap() else {
            panic!("expected completion");
        };
        assert!(result.success());
        assert_eq!(result.captured_images().len(), 5);
    }

    #[tokio::test]
    async fn test_replay_truncated_trace_is_cancelled() {
        let mut frames = passing_frames();
        frames.truncate(5);
        let trace = Arc::new(parse_trace(&trace_text(&frames), Path::new(".")).unwrap());
        let source_trace = trace.clone();
        let handle = spawn_engine(
            move || Ok(TraceSource::new(source_trace, 16, 12)),
            move || Ok(TraceDetector::new(trace)),
            fast_config(),
        )
        .unwrap();

        let outcome = handle.run_session().await.unwrap();
        assert!(matches!(outcome, SessionOutcome::Cancelled { .. }));
    }
}
