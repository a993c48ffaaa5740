//! Device fingerprinting for click deduplication.
//!
//! The fingerprint is a weak pseudo-identity: same-device repeat visits
//! must collide, distinct devices should rarely collide. It is never used
//! for authentication or payouts.

use serde::Deserialize;

/// Browser/device signals reported by the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSignals {
    pub user_agent: String,
    pub language: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub timezone_offset_minutes: i32,
    pub canvas_digest: String,
    #[serde(default)]
    pub hardware_concurrency: u32,
    #[serde(default)]
    pub max_touch_points: u32,
}

/// Derives the opaque fingerprint string: order-sensitive concatenation of
/// the signals folded through a polynomial rolling hash, absolute value,
/// base-36.
pub fn fingerprint(signals: &DeviceSignals) -> String {
    let joined = [
        signals.user_agent.clone(),
        signals.language.clone(),
        format!("{}x{}", signals.screen_width, signals.screen_height),
        signals.timezone_offset_minutes.to_string(),
        signals.canvas_digest.clone(),
        signals.hardware_concurrency.to_string(),
        signals.max_touch_points.to_string(),
    ]
    .join("|");
    to_base36((hash_code(&joined) as i64).unsigned_abs())
}

/// Polynomial hash over UTF-16 code units, `h = 31*h + c`, wrapping at 32
/// bits (Java `String.hashCode` semantics).
fn hash_code(s: &str) -> i32 {
    let mut h: i32 = 0;
    for unit in s.encode_utf16() {
        h = h.wrapping_mul(31).wrapping_add(unit as i32);
    }
    h
}

pub(crate) fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals() -> DeviceSignals {
        DeviceSignals {
            user_agent: "Mozilla/5.0".into(),
            language: "id-ID".into(),
            screen_width: 1080,
            screen_height: 2400,
            timezone_offset_minutes: -420,
            canvas_digest: "data:image/png;base64,abc".into(),
            hardware_concurrency: 8,
            max_touch_points: 5,
        }
    }

    #[test]
    fn hash_code_matches_reference_values() {
        assert_eq!(hash_code(""), 0);
        assert_eq!(hash_code("hello"), 99162322);
    }

    #[test]
    fn base36_encodes_digits() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn same_device_always_collides() {
        assert_eq!(fingerprint(&signals()), fingerprint(&signals()));
    }

    #[test]
    fn different_signals_produce_different_fingerprints() {
        let a = fingerprint(&signals());
        let mut other = signals();
        other.screen_width = 1440;
        assert_ne!(a, fingerprint(&other));
    }

    #[test]
    fn fingerprint_is_base36() {
        let fp = fingerprint(&signals());
        assert!(fp.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }
}
