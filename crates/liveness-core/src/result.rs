use crate::capture::CapturedImage;
use crate::challenge::{ChallengeKey, CHALLENGES};
use crate::machine::{SessionHandle, VerificationSession};
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// Immutable outcome of a completed session.
///
/// There is no stored success flag: [`VerificationResult::success`] is
/// derived from the per-challenge outcomes every time it is asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationResult {
    session: SessionHandle,
    per_challenge_result: BTreeMap<ChallengeKey, bool>,
    captured_images: BTreeMap<ChallengeKey, CapturedImage>,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
}

impl VerificationResult {
    /// True iff every challenge in the table has a `true` outcome.
    pub fn success(&self) -> bool {
        CHALLENGES
            .iter()
            .all(|c| self.per_challenge_result.get(&c.key).copied().unwrap_or(false))
    }

    pub fn session(&self) -> SessionHandle {
        self.session
    }

    pub fn per_challenge_result(&self) -> &BTreeMap<ChallengeKey, bool> {
        &self.per_challenge_result
    }

    pub fn captured_images(&self) -> &BTreeMap<ChallengeKey, CapturedImage> {
        &self.captured_images
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }
}

impl Serialize for VerificationResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("VerificationResult", 6)?;
        s.serialize_field("session_id", &self.session.id)?;
        s.serialize_field("success", &self.success())?;
        s.serialize_field("per_challenge_result", &self.per_challenge_result)?;
        s.serialize_field("captured_images", &self.captured_images)?;
        s.serialize_field("started_at", &self.started_at)?;
        s.serialize_field("completed_at", &self.completed_at)?;
        s.end()
    }
}

/// Snapshot a session into a result. Images and timestamps are copied, so
/// later resets of the session cannot reach into the result.
pub fn build_result(session: &VerificationSession, completed_at: DateTime<Utc>) -> VerificationResult {
    VerificationResult {
        session: session.handle,
        per_challenge_result: session.per_challenge_result.clone(),
        captured_images: session.captures.images().clone(),
        started_at: session.started_at,
        completed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureSettings;
    use crate::types::Frame;

    fn session_with(outcomes: &[(ChallengeKey, bool)]) -> VerificationSession {
        let mut session = VerificationSession::new(CaptureSettings::default(), Utc::now());
        for (key, ok) in outcomes {
            session.per_challenge_result.insert(*key, *ok);
        }
        session
    }

    fn all(ok: bool) -> Vec<(ChallengeKey, bool)> {
        CHALLENGES.iter().map(|c| (c.key, ok)).collect()
    }

    #[test]
    fn test_success_when_all_true() {
        let result = build_result(&session_with(&all(true)), Utc::now());
        assert!(result.success());
    }

    #[test]
    fn test_single_false_fails() {
        let mut outcomes = all(true);
        outcomes[2].1 = false;
        let result = build_result(&session_with(&outcomes), Utc::now());
        assert!(!result.success());
    }

    #[test]
    fn test_empty_outcomes_fail() {
        let result = build_result(&session_with(&[]), Utc::now());
        assert!(!result.success());
    }

    #[test]
    fn test_result_is_detached_from_session() {
        let mut session = session_with(&all(true));
        session
            .captures
            .capture(ChallengeKey::Front, &Frame::blank(1, 4, 4), Utc::now())
            .unwrap();
        let result = build_result(&session, Utc::now());

        session.captures.clear();
        session.per_challenge_result.clear();

        assert_eq!(result.captured_images().len(), 1);
        assert!(result.success());
    }

    #[test]
    fn test_serialized_success_matches_derived() {
        let result = build_result(&session_with(&all(true)), Utc::now());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], serde_json::Value::Bool(true));
        assert_eq!(json["per_challenge_result"]["blink"], serde_json::Value::Bool(true));
    }
}
