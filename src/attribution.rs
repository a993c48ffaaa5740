//! Landing-capture cache: remembers which affiliate code brought a visitor
//! in, so a later signup or purchase can credit the right promoter even
//! when the code is no longer in the URL.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::ATTRIBUTION_TTL_DAYS;

#[derive(Debug, Clone)]
struct CapturedCode {
    code: String,
    captured_at: DateTime<Utc>,
}

/// Single-visitor capture slot with a sliding expiry. A later capture
/// overwrites an earlier one (last-touch attribution).
#[derive(Debug, Default)]
pub struct AttributionCache {
    slot: Mutex<Option<CapturedCode>>,
}

impl AttributionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the affiliate code carried by a landing URL, if any.
    /// Recognizes the `aff` query parameter and the `/r/{code}` path form.
    pub fn capture_from_url(&self, url: &str) -> Option<String> {
        self.capture_from_url_at(url, Utc::now())
    }

    pub fn capture_from_url_at(&self, url: &str, now: DateTime<Utc>) -> Option<String> {
        let code = extract_code(url)?;
        debug!(code, "affiliate code captured from landing url");
        self.set_code_at(&code, now);
        Some(code)
    }

    pub fn set_code(&self, code: &str) {
        self.set_code_at(code, Utc::now());
    }

    pub fn set_code_at(&self, code: &str, now: DateTime<Utc>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(CapturedCode {
                code: code.to_string(),
                captured_at: now,
            });
        }
    }

    /// The captured code, unless it has aged past the attribution TTL. An
    /// expired capture is dropped on read.
    pub fn get_code(&self) -> Option<String> {
        self.get_code_at(Utc::now())
    }

    pub fn get_code_at(&self, now: DateTime<Utc>) -> Option<String> {
        let mut slot = self.slot.lock().ok()?;
        match slot.as_ref() {
            Some(captured)
                if now <= captured.captured_at + Duration::days(ATTRIBUTION_TTL_DAYS) =>
            {
                Some(captured.code.clone())
            }
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }

    pub fn clear_code(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

/// Pulls an affiliate code out of a landing URL.
fn extract_code(url: &str) -> Option<String> {
    let (path, query) = match url.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (url, None),
    };
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("aff=")
                && !value.is_empty()
            {
                return Some(value.to_string());
            }
        }
    }
    let (_, rest) = path.split_once("/r/")?;
    let code = rest.split('/').next().unwrap_or_default();
    (!code.is_empty()).then(|| code.to_string())
}
