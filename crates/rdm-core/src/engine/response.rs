//! HTTP response interpretation helpers
//!
//! Pure functions used by the executor to turn status codes and headers into
//! task statuses, redirect targets and retry delays.

use rand::Rng;
use rdm_types::{Settings, TaskStatus};
use std::time::Duration;
use url::Url;

/// Redirect statuses the executor follows itself
pub fn is_redirect(code: u16) -> bool {
    matches!(code, 301 | 302 | 303 | 307)
}

/// Redirects whose target replaces the stored source URI
pub fn is_permanent_redirect(code: u16) -> bool {
    matches!(code, 301 | 303)
}

/// Lowercase, trim and drop any parameters from a `Content-Type` value.
///
/// Returns `None` when nothing is left.
pub fn sanitize_mime_type(raw: &str) -> Option<String> {
    let essence = raw.split(';').next().unwrap_or_default().trim().to_lowercase();
    if essence.is_empty() {
        None
    } else {
        Some(essence)
    }
}

/// Advisory delay for a 503 response.
///
/// A missing or unparseable header yields zero, a negative value clamps to
/// zero. Anything else is clamped to the configured bounds and gets a jitter
/// of up to `min_retry_after_secs` added.
pub fn compute_retry_after<R: Rng + ?Sized>(
    header: Option<&str>,
    settings: &Settings,
    rng: &mut R,
) -> Duration {
    let Some(seconds) = header.and_then(|v| v.trim().parse::<i64>().ok()) else {
        return Duration::ZERO;
    };
    if seconds < 0 {
        return Duration::ZERO;
    }

    let min = settings.min_retry_after_secs;
    let max = settings.max_retry_after_secs.max(min);
    let clamped = (seconds as u64).clamp(min, max);
    let jitter = rng.gen_range(0..=min);
    Duration::from_secs(clamped + jitter)
}

/// Resolve a `Location` header against the current URI
pub fn resolve_location(current: &str, location: &str) -> Option<String> {
    match Url::parse(current) {
        Ok(base) => base.join(location).ok().map(String::from),
        Err(_) => Url::parse(location).ok().map(String::from),
    }
}

/// Final status for a response that is neither the expected one nor handled
/// as a 503 or redirect
pub fn classify_unexpected_status(code: u16, continuing: bool) -> TaskStatus {
    if (400..600).contains(&code) {
        TaskStatus::from_code(code).unwrap_or(TaskStatus::UnhandledHttpCode)
    } else if (300..400).contains(&code) {
        TaskStatus::UnhandledRedirect
    } else if continuing && code == 200 {
        TaskStatus::CannotResume
    } else {
        TaskStatus::UnhandledHttpCode
    }
}
