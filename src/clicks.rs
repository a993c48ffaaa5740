//! The click ledger: records referral-link clicks, deduplicated by device
//! fingerprint per code.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::error::Error;
use crate::store::{AttributionStore, Document, ListQuery, StoreError, encode};
use crate::types::{ClickEvent, REFERRAL_CLICKS, REFERRALS, ReferralLink, ReferralStatus};

/// Retry budget for the per-code read-modify-write. Contention here means
/// concurrent clicks on one code, which is rare and short-lived.
const CAS_MAX_ATTEMPTS: usize = 5;

#[derive(Debug)]
pub struct ClickOutcome {
    /// False when the fingerprint was already known (idempotent no-op).
    pub accepted: bool,
    pub referrer_display_name: String,
}

/// Looks up the referral document for a code.
pub(crate) async fn find_link_by_code(
    store: &dyn AttributionStore,
    code: &str,
) -> Result<Option<(Document, ReferralLink)>, Error> {
    let docs = store
        .list(REFERRALS, ListQuery::new().eq("code", code).limit(1))
        .await?;
    match docs.into_iter().next() {
        Some(doc) => {
            let link: ReferralLink = doc.decode()?;
            Ok(Some((doc, link)))
        }
        None => Ok(None),
    }
}

/// Lazy expiry: a link past its expiry is pinned to `expired` the moment an
/// operation touches it, and every touch afterwards keeps failing the same
/// way. There is no background sweep.
pub(crate) async fn check_expiry(
    store: &dyn AttributionStore,
    doc: &Document,
    link: &ReferralLink,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    if link.status == ReferralStatus::Expired {
        return Err(Error::Expired);
    }
    if now > link.expires_at {
        warn!(code = %link.code, "referral link expired, pinning status");
        store
            .update(REFERRALS, &doc.id, json!({"status": ReferralStatus::Expired}))
            .await?;
        return Err(Error::Expired);
    }
    Ok(())
}

pub async fn record_click(
    store: &dyn AttributionStore,
    code: &str,
    fingerprint: &str,
    ip_address: Option<String>,
    user_agent: Option<String>,
) -> Result<ClickOutcome, Error> {
    record_click_at(store, code, fingerprint, ip_address, user_agent, Utc::now()).await
}

/// Records a click. The fingerprint-membership check and the append are one
/// logical read-modify-write per code, done as a compare-and-swap on the
/// referral document revision so concurrent clicks from one new device
/// cannot double-increment the counter.
pub async fn record_click_at(
    store: &dyn AttributionStore,
    code: &str,
    fingerprint: &str,
    ip_address: Option<String>,
    user_agent: Option<String>,
    now: DateTime<Utc>,
) -> Result<ClickOutcome, Error> {
    for _ in 0..CAS_MAX_ATTEMPTS {
        let (doc, link) = find_link_by_code(store, code)
            .await?
            .ok_or(Error::NotFound)?;
        check_expiry(store, &doc, &link, now).await?;

        if link.device_fingerprints.iter().any(|fp| fp == fingerprint) {
            // Repeat click from a known device: accept silently, count nothing.
            return Ok(ClickOutcome {
                accepted: false,
                referrer_display_name: link.referrer_display_name,
            });
        }

        let status = if link.status == ReferralStatus::Pending {
            ReferralStatus::Clicked
        } else {
            link.status
        };
        let mut fingerprints = link.device_fingerprints.clone();
        fingerprints.push(fingerprint.to_string());
        let patch = json!({
            "status": status,
            "clickCount": link.click_count + 1,
            "deviceFingerprints": fingerprints,
            "firstClickedAt": link.first_clicked_at.unwrap_or(now),
        });

        match store.update_checked(REFERRALS, &doc.id, doc.rev, patch).await {
            Ok(_) => {
                let event = ClickEvent {
                    code: code.to_string(),
                    device_fingerprint: fingerprint.to_string(),
                    ip_address,
                    user_agent,
                    clicked_at: now,
                    converted_to_signup: false,
                    converted_user_id: None,
                };
                store.create(REFERRAL_CLICKS, None, encode(&event)?).await?;
                info!(code, fingerprint, "referral click recorded");
                return Ok(ClickOutcome {
                    accepted: true,
                    referrer_display_name: link.referrer_display_name,
                });
            }
            // Someone else won the revision race; re-read and retry.
            Err(StoreError::Conflict) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Store(anyhow::anyhow!(
        "click ledger contention on code {code}"
    )))
}

/// Returns the accepted click for (code, fingerprint), if any. Re-reads the
/// store rather than trusting anything cached, so a signup observes every
/// click that causally preceded it.
pub(crate) async fn find_click(
    store: &dyn AttributionStore,
    code: &str,
    fingerprint: &str,
) -> Result<Option<Document>, Error> {
    let docs = store
        .list(
            REFERRAL_CLICKS,
            ListQuery::new()
                .eq("code", code)
                .eq("deviceFingerprint", fingerprint)
                .limit(1),
        )
        .await?;
    Ok(docs.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn link_fixture(code: &str, now: DateTime<Utc>) -> ReferralLink {
        ReferralLink {
            referrer_id: "user-1".into(),
            referrer_display_name: "Sari".into(),
            referrer_contact: "+628123456789".into(),
            referee_id: None,
            referee_display_name: None,
            referee_contact: None,
            code: code.into(),
            canonical_url: format!("https://example.test/signup?ref={code}"),
            status: ReferralStatus::Pending,
            click_count: 0,
            device_fingerprints: vec![],
            created_at: now,
            first_clicked_at: None,
            signed_up_at: None,
            completed_at: None,
            expires_at: now + Duration::days(90),
        }
    }

    async fn seed(store: &MemoryStore, link: &ReferralLink) {
        store
            .create(REFERRALS, None, encode(link).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn repeat_clicks_from_one_device_count_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        seed(&store, &link_fixture("SARI1234ABCD", now)).await;

        for i in 0..3 {
            let out = record_click_at(&store, "SARI1234ABCD", "fp-1", None, None, now)
                .await
                .unwrap();
            assert_eq!(out.accepted, i == 0);
            assert_eq!(out.referrer_display_name, "Sari");
        }

        let (_, link) = find_link_by_code(&store, "SARI1234ABCD")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.click_count, 1);
        assert_eq!(link.device_fingerprints, vec!["fp-1".to_string()]);
        assert_eq!(link.status, ReferralStatus::Clicked);
        assert_eq!(link.first_clicked_at, Some(now));
    }

    #[tokio::test]
    async fn distinct_devices_each_count() {
        let store = MemoryStore::new();
        let now = Utc::now();
        seed(&store, &link_fixture("CODE", now)).await;

        record_click_at(&store, "CODE", "fp-1", None, None, now)
            .await
            .unwrap();
        let later = now + Duration::minutes(5);
        record_click_at(&store, "CODE", "fp-2", None, None, later)
            .await
            .unwrap();

        let (_, link) = find_link_by_code(&store, "CODE").await.unwrap().unwrap();
        assert_eq!(link.click_count, 2);
        assert_eq!(link.device_fingerprints.len(), 2);
        // First-click timestamp is set once and never moves.
        assert_eq!(link.first_clicked_at, Some(now));
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        let store = MemoryStore::new();
        let err = record_click_at(&store, "NOPE", "fp", None, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn expired_link_is_pinned_and_stays_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut link = link_fixture("OLD", now - Duration::days(120));
        link.expires_at = now - Duration::days(30);
        seed(&store, &link).await;

        for _ in 0..2 {
            let err = record_click_at(&store, "OLD", "fp", None, None, now)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Expired));
            let (_, stored) = find_link_by_code(&store, "OLD").await.unwrap().unwrap();
            assert_eq!(stored.status, ReferralStatus::Expired);
        }
        // No accounting happened on the expired link.
        let (_, stored) = find_link_by_code(&store, "OLD").await.unwrap().unwrap();
        assert_eq!(stored.click_count, 0);
    }

    #[tokio::test]
    async fn accepted_click_creates_a_click_event() {
        let store = MemoryStore::new();
        let now = Utc::now();
        seed(&store, &link_fixture("CODE", now)).await;

        record_click_at(
            &store,
            "CODE",
            "fp-1",
            Some("10.0.0.1".into()),
            Some("Mozilla/5.0".into()),
            now,
        )
        .await
        .unwrap();

        let doc = find_click(&store, "CODE", "fp-1").await.unwrap().unwrap();
        let event: ClickEvent = doc.decode().unwrap();
        assert!(!event.converted_to_signup);
        assert_eq!(event.ip_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(event.clicked_at, now);
    }
}
