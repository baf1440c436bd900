use anyhow::{Context, Result};
use liveness_core::LivenessConfig;
use std::path::Path;

/// Load configuration: defaults, then an optional TOML file, then
/// `LIVENESS_*` environment variables.
pub fn load(path: Option<&Path>) -> Result<LivenessConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => LivenessConfig::default(),
    };
    apply_env(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Override fields from environment-style lookups. Unparseable values are
/// ignored and leave the current value in place.
pub fn apply_env(config: &mut LivenessConfig, lookup: impl Fn(&str) -> Option<String>) {
    let t = &mut config.thresholds;
    t.center_offset_px = env_f32(&lookup, "LIVENESS_CENTER_OFFSET_PX", t.center_offset_px);
    t.ear_both_closed = env_f32(&lookup, "LIVENESS_EAR_BOTH_CLOSED", t.ear_both_closed);
    t.ear_single_closed = env_f32(&lookup, "LIVENESS_EAR_SINGLE_CLOSED", t.ear_single_closed);
    t.smile_score = env_f32(&lookup, "LIVENESS_SMILE_SCORE", t.smile_score);
    t.accept_single_eye_closure = lookup("LIVENESS_ACCEPT_WINK")
        .map(|v| v != "0")
        .unwrap_or(t.accept_single_eye_closure);

    let timings = &mut config.timings;
    timings.settle_delay_ms = env_u64(&lookup, "LIVENESS_SETTLE_DELAY_MS", timings.settle_delay_ms);
    timings.blink_reset_delay_ms = env_u64(
        &lookup,
        "LIVENESS_BLINK_RESET_DELAY_MS",
        timings.blink_reset_delay_ms,
    );
    timings.frame_interval_ms =
        env_u64(&lookup, "LIVENESS_FRAME_INTERVAL_MS", timings.frame_interval_ms);
    if let Some(ms) = lookup("LIVENESS_SESSION_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        timings.session_timeout_ms = Some(ms);
    }
}

fn env_f32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
