//! One confirming still per satisfied challenge.

use crate::challenge::ChallengeKey;
use crate::config::{CaptureFormat, CaptureSettings};
use crate::types::Frame;
use base64::Engine;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("an image for challenge '{0}' was already captured")]
    AlreadyCaptured(ChallengeKey),
    #[error("frame buffer of {len} bytes does not match {width}x{height} RGB8")]
    InvalidFrame { width: u32, height: u32, len: usize },
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("captured image payload is not valid base64")]
    Payload(#[from] base64::DecodeError),
    #[error("captured image digest mismatch\n  expected: {expected}\n  got:      {got}")]
    DigestMismatch { expected: String, got: String },
}

/// An encoded still image confirming one challenge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapturedImage {
    pub challenge: ChallengeKey,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
    /// Encoded image bytes, standard base64.
    pub data_base64: String,
    /// SHA-256 hex digest of the encoded (pre-base64) bytes.
    pub sha256: String,
    pub captured_at: DateTime<Utc>,
}

impl CapturedImage {
    /// Decode the payload and check it against the recorded digest.
    pub fn verify_integrity(&self) -> Result<Vec<u8>, CaptureError> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(&self.data_base64)?;
        let got = format!("{:x}", Sha256::digest(&bytes));
        if got != self.sha256 {
            return Err(CaptureError::DigestMismatch {
                expected: self.sha256.clone(),
                got,
            });
        }
        Ok(bytes)
    }
}

/// Write-once image storage keyed by challenge.
#[derive(Debug, Clone)]
pub struct CaptureStore {
    settings: CaptureSettings,
    images: BTreeMap<ChallengeKey, CapturedImage>,
}

impl CaptureStore {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            images: BTreeMap::new(),
        }
    }

    /// Encode `frame` and store it under `challenge`.
    ///
    /// Refuses to overwrite: a second capture for the same key is an error
    /// and leaves the first image in place.
    pub fn capture(
        &mut self,
        challenge: ChallengeKey,
        frame: &Frame,
        captured_at: DateTime<Utc>,
    ) -> Result<&CapturedImage, CaptureError> {
        if self.images.contains_key(&challenge) {
            return Err(CaptureError::AlreadyCaptured(challenge));
        }

        let bytes = encode_frame(frame, &self.settings)?;
        let image = CapturedImage {
            challenge,
            mime_type: match self.settings.format {
                CaptureFormat::Jpeg => "image/jpeg",
                CaptureFormat::Png => "image/png",
            },
            width: frame.width,
            height: frame.height,
            sha256: format!("{:x}", Sha256::digest(&bytes)),
            data_base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
            captured_at,
        };

        tracing::debug!(
            challenge = %challenge,
            bytes = bytes.len(),
            frame = frame.sequence,
            "captured challenge image"
        );
        Ok(&*self.images.entry(challenge).or_insert(image))
    }

    pub fn get(&self, challenge: ChallengeKey) -> Option<&CapturedImage> {
        self.images.get(&challenge)
    }

    pub fn contains(&self, challenge: ChallengeKey) -> bool {
        self.images.contains_key(&challenge)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn images(&self) -> &BTreeMap<ChallengeKey, CapturedImage> {
        &self.images
    }

    pub fn clear(&mut self) {
        self.images.clear();
    }
}

fn encode_frame(frame: &Frame, settings: &CaptureSettings) -> Result<Vec<u8>, CaptureError> {
    let invalid = || CaptureError::InvalidFrame {
        width: frame.width,
        height: frame.height,
        len: frame.data.len(),
    };
    if frame.width == 0 || frame.height == 0 {
        return Err(invalid());
    }
    let img = RgbImage::from_raw(frame.width, frame.height, frame.data.clone()).ok_or_else(invalid)?;

    let mut bytes = Vec::new();
    match settings.format {
        CaptureFormat::Jpeg => JpegEncoder::new_with_quality(&mut bytes, settings.jpeg_quality)
            .write_image(img.as_raw(), img.width(), img.height(), ExtendedColorType::Rgb8)?,
        CaptureFormat::Png => PngEncoder::new(&mut bytes).write_image(
            img.as_raw(),
            img.width(),
            img.height(),
            ExtendedColorType::Rgb8,
        )?,
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CaptureStore {
        CaptureStore::new(CaptureSettings::default())
    }

    #[test]
    fn test_capture_stores_jpeg() {
        let mut store = store();
        let image = store
            .capture(ChallengeKey::Front, &Frame::blank(1, 8, 8), Utc::now())
            .unwrap();
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!((image.width, image.height), (8, 8));
        let bytes = image.verify_integrity().unwrap();
        // JPEG SOI marker
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_capture_png() {
        let mut store = CaptureStore::new(CaptureSettings {
            format: CaptureFormat::Png,
            ..CaptureSettings::default()
        });
        let image = store
            .capture(ChallengeKey::Smile, &Frame::blank(1, 4, 4), Utc::now())
            .unwrap();
        assert_eq!(image.mime_type, "image/png");
        let bytes = image.verify_integrity().unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
    }

    #[test]
    fn test_refuses_overwrite() {
        let mut store = store();
        store
            .capture(ChallengeKey::Left, &Frame::blank(1, 4, 4), Utc::now())
            .unwrap();
        let first_digest = store.get(ChallengeKey::Left).unwrap().sha256.clone();

        let mut other = Frame::blank(2, 4, 4);
        other.data.fill(0);
        let err = store.capture(ChallengeKey::Left, &other, Utc::now()).unwrap_err();
        assert!(matches!(err, CaptureError::AlreadyCaptured(ChallengeKey::Left)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(ChallengeKey::Left).unwrap().sha256, first_digest);
    }

    #[test]
    fn test_rejects_short_buffer() {
        let mut store = store();
        let mut frame = Frame::blank(1, 4, 4);
        frame.data.truncate(10);
        let err = store.capture(ChallengeKey::Front, &frame, Utc::now()).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidFrame { len: 10, .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_tampered_payload_fails_integrity() {
        let mut store = store();
        let mut image = store
            .capture(ChallengeKey::Front, &Frame::blank(1, 4, 4), Utc::now())
            .unwrap()
            .clone();
        image.sha256 = "00".to_string();
        assert!(matches!(
            image.verify_integrity(),
            Err(CaptureError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_clear_allows_recapture() {
        let mut store = store();
        store
            .capture(ChallengeKey::Blink, &Frame::blank(1, 4, 4), Utc::now())
            .unwrap();
        store.clear();
        assert!(!store.contains(ChallengeKey::Blink));
        assert!(store
            .capture(ChallengeKey::Blink, &Frame::blank(2, 4, 4), Utc::now())
            .is_ok());
    }
}
