//! The referral state machine: link creation, the anti-fraud signup gate,
//! and completion.
//!
//! Two reward models consume this machine. The peer-invite flow settles on
//! completion (the `Option` returned by [`complete_referral`] is its
//! trigger); the membership-commission flow settles at purchase time via
//! `commission::record_membership_referral`. The lifecycle shape is shared,
//! the settlement is not.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::info;

use crate::REFERRAL_TTL_DAYS;
use crate::clicks::{check_expiry, find_click, find_link_by_code};
use crate::error::Error;
use crate::fingerprint::to_base36;
use crate::store::{AttributionStore, ListQuery, encode};
use crate::types::{REFERRAL_CLICKS, REFERRALS, ReferralLink, ReferralStats, ReferralStatus};

/// Normalizes a phone contact to `+62` form: strip non-digits, then
/// `62…` keeps its prefix, `0…` swaps the zero for `+62`, anything else is
/// prefixed. Valid when 8-12 digits follow the country code.
pub fn normalize_contact(raw: &str) -> Result<String, Error> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let normalized = if let Some(rest) = digits.strip_prefix("62") {
        format!("+62{rest}")
    } else if let Some(rest) = digits.strip_prefix('0') {
        format!("+62{rest}")
    } else {
        format!("+62{digits}")
    };
    let subscriber = &normalized[3..];
    if (8..=12).contains(&subscriber.len()) && subscriber.chars().all(|c| c.is_ascii_digit()) {
        Ok(normalized)
    } else {
        Err(Error::InvalidContact)
    }
}

/// Public referral code: up to 6 alphanumerics of the display name, the
/// last 4 of the referrer id, and the tail of the current unix-millis in
/// base-36, all uppercased.
pub fn generate_referral_code(referrer_id: &str, display_name: &str, now: DateTime<Utc>) -> String {
    let name: String = display_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(6)
        .collect::<String>()
        .to_uppercase();
    let id_tail: String = referrer_id
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<String>()
        .to_uppercase();
    let ts = to_base36(now.timestamp_millis().unsigned_abs()).to_uppercase();
    let ts_tail: String = ts
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{name}{id_tail}{ts_tail}")
}

pub async fn create_referral_link(
    store: &dyn AttributionStore,
    referrer_id: &str,
    display_name: &str,
    contact: &str,
    base_url: &str,
) -> Result<ReferralLink, Error> {
    create_referral_link_at(store, referrer_id, display_name, contact, base_url, Utc::now()).await
}

/// Creates the referrer's link, or refreshes the existing one: exactly one
/// active link per referrer, so a repeat request rotates code, URL and
/// expiry on the same row instead of inserting a sibling.
pub async fn create_referral_link_at(
    store: &dyn AttributionStore,
    referrer_id: &str,
    display_name: &str,
    contact: &str,
    base_url: &str,
    now: DateTime<Utc>,
) -> Result<ReferralLink, Error> {
    let normalized = normalize_contact(contact)?;
    let code = generate_referral_code(referrer_id, display_name, now);
    let canonical_url = format!("{base_url}/signup?ref={code}");
    let expires_at = now + Duration::days(REFERRAL_TTL_DAYS);

    let existing = store
        .list(
            REFERRALS,
            ListQuery::new().eq("referrerId", referrer_id).limit(1),
        )
        .await?;

    if let Some(doc) = existing.into_iter().next() {
        let updated = store
            .update(
                REFERRALS,
                &doc.id,
                json!({
                    "referrerContact": normalized,
                    "code": code,
                    "canonicalUrl": canonical_url,
                    "expiresAt": expires_at,
                }),
            )
            .await?;
        info!(referrer_id, code = %code, "referral link refreshed");
        return Ok(updated.decode()?);
    }

    let link = ReferralLink {
        referrer_id: referrer_id.to_string(),
        referrer_display_name: display_name.to_string(),
        referrer_contact: normalized,
        referee_id: None,
        referee_display_name: None,
        referee_contact: None,
        code: code.clone(),
        canonical_url,
        status: ReferralStatus::Pending,
        click_count: 0,
        device_fingerprints: vec![],
        created_at: now,
        first_clicked_at: None,
        signed_up_at: None,
        completed_at: None,
        expires_at,
    };
    store.create(REFERRALS, None, encode(&link)?).await?;
    info!(referrer_id, code = %code, "referral link created");
    Ok(link)
}

pub async fn process_signup(
    store: &dyn AttributionStore,
    code: &str,
    referee_id: &str,
    referee_display_name: &str,
    referee_contact: &str,
    fingerprint: &str,
) -> Result<ReferralLink, Error> {
    process_signup_at(
        store,
        code,
        referee_id,
        referee_display_name,
        referee_contact,
        fingerprint,
        Utc::now(),
    )
    .await
}

/// Validates and records a referred signup. Checks run fail-fast in a fixed
/// order and nothing is written on failure:
/// contact format, code resolution, expiry, spent link, self-referral,
/// duplicate referral, and finally the click-gate (the signup device must
/// have a recorded click for this code - the anti-bot check).
pub async fn process_signup_at(
    store: &dyn AttributionStore,
    code: &str,
    referee_id: &str,
    referee_display_name: &str,
    referee_contact: &str,
    fingerprint: &str,
    now: DateTime<Utc>,
) -> Result<ReferralLink, Error> {
    let normalized = normalize_contact(referee_contact)?;

    let (doc, link) = find_link_by_code(store, code)
        .await?
        .ok_or(Error::NotFound)?;
    check_expiry(store, &doc, &link, now).await?;

    // A link that already carries a signup is spent; status never moves
    // backwards from signed_up or completed.
    if !matches!(
        link.status,
        ReferralStatus::Pending | ReferralStatus::Clicked
    ) {
        return Err(Error::DuplicateReferral);
    }

    if link.referrer_contact == normalized {
        info!(code, "self-referral attempt blocked");
        return Err(Error::SelfReferral);
    }

    let prior = store
        .list(
            REFERRALS,
            ListQuery::new()
                .eq("referrerId", link.referrer_id.as_str())
                .eq("refereeContact", normalized.as_str())
                .limit(1),
        )
        .await?;
    if !prior.is_empty() {
        return Err(Error::DuplicateReferral);
    }

    let click = find_click(store, code, fingerprint)
        .await?
        .ok_or(Error::MissingClickProof)?;

    let updated = store
        .update(
            REFERRALS,
            &doc.id,
            json!({
                "refereeId": referee_id,
                "refereeDisplayName": referee_display_name,
                "refereeContact": normalized,
                "status": ReferralStatus::SignedUp,
                "signedUpAt": now,
            }),
        )
        .await?;
    store
        .update(
            REFERRAL_CLICKS,
            &click.id,
            json!({"convertedToSignup": true, "convertedUserId": referee_id}),
        )
        .await?;
    info!(code, referee_id, "referral signup recorded");
    Ok(updated.decode()?)
}

pub async fn complete_referral(
    store: &dyn AttributionStore,
    referee_id: &str,
) -> Result<Option<ReferralLink>, Error> {
    complete_referral_at(store, referee_id, Utc::now()).await
}

/// Marks the referee's referral completed on their first completed action.
/// Not every user was referred, so a missing `signed_up` row is a logged
/// no-op, not an error. The returned link, when present, is the trigger for
/// reward models that settle on completion.
pub async fn complete_referral_at(
    store: &dyn AttributionStore,
    referee_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<ReferralLink>, Error> {
    let docs = store
        .list(
            REFERRALS,
            ListQuery::new()
                .eq("refereeId", referee_id)
                .eq("status", "signed_up")
                .limit(1),
        )
        .await?;
    let Some(doc) = docs.into_iter().next() else {
        info!(referee_id, "no signed-up referral for user, skipping");
        return Ok(None);
    };
    let updated = store
        .update(
            REFERRALS,
            &doc.id,
            json!({"status": ReferralStatus::Completed, "completedAt": now}),
        )
        .await?;
    info!(referee_id, "referral completed");
    Ok(Some(updated.decode()?))
}

/// Per-referrer aggregate, derived from the referral rows on demand.
pub async fn referral_stats(
    store: &dyn AttributionStore,
    referrer_id: &str,
) -> Result<ReferralStats, Error> {
    let docs = store
        .list(REFERRALS, ListQuery::new().eq("referrerId", referrer_id))
        .await?;
    let links: Vec<ReferralLink> = docs
        .iter()
        .map(|d| d.decode())
        .collect::<Result<_, _>>()?;

    let total_clicks: i64 = links.iter().map(|l| l.click_count).sum();
    let completed = links
        .iter()
        .filter(|l| l.status == ReferralStatus::Completed)
        .count() as u64;
    let pending = links
        .iter()
        .filter(|l| matches!(l.status, ReferralStatus::Pending | ReferralStatus::SignedUp))
        .count() as u64;
    let conversion_rate = if total_clicks > 0 {
        completed as f64 / total_clicks as f64 * 100.0
    } else {
        0.0
    };
    Ok(ReferralStats {
        total_referrals: links.len() as u64,
        completed_referrals: completed,
        pending_referrals: pending,
        total_clicks,
        conversion_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clicks::record_click_at;
    use crate::store::MemoryStore;

    const BASE: &str = "https://example.test";

    #[test]
    fn contact_normalization_table() {
        assert_eq!(normalize_contact("08123456789").unwrap(), "+628123456789");
        assert_eq!(normalize_contact("628123456789").unwrap(), "+628123456789");
        assert_eq!(normalize_contact("8123456789").unwrap(), "+628123456789");
        assert_eq!(
            normalize_contact("+62 812-3456-789").unwrap(),
            "+628123456789"
        );
        assert!(matches!(
            normalize_contact("123").unwrap_err(),
            Error::InvalidContact
        ));
        assert!(matches!(
            normalize_contact("no digits").unwrap_err(),
            Error::InvalidContact
        ));
    }

    #[test]
    fn referral_code_shape() {
        let now = Utc::now();
        let code = generate_referral_code("user-9876", "Sari Dewi!", now);
        assert!(code.starts_with("SARIDE9876"));
        assert_eq!(code.len(), 14);
        assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn one_active_link_per_referrer() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first =
            create_referral_link_at(&store, "user-1", "Sari", "08123456789", BASE, now)
                .await
                .unwrap();
        let second = create_referral_link_at(
            &store,
            "user-1",
            "Sari",
            "08123456789",
            BASE,
            now + Duration::hours(1),
        )
        .await
        .unwrap();

        assert_ne!(first.code, second.code);
        assert_eq!(second.expires_at, now + Duration::hours(1) + Duration::days(90));
        let docs = store
            .list(REFERRALS, ListQuery::new().eq("referrerId", "user-1"))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
    }

    async fn seeded_link(store: &MemoryStore, now: DateTime<Utc>) -> ReferralLink {
        create_referral_link_at(store, "user-1", "Sari", "08123456789", BASE, now)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn signup_requires_click_proof_from_same_device() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let link = seeded_link(&store, now).await;

        let err = process_signup_at(&store, &link.code, "u2", "Budi", "08551234567", "fp-1", now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingClickProof));

        // A click from a different device does not satisfy the gate.
        record_click_at(&store, &link.code, "fp-other", None, None, now)
            .await
            .unwrap();
        let err = process_signup_at(&store, &link.code, "u2", "Budi", "08551234567", "fp-1", now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingClickProof));
    }

    #[tokio::test]
    async fn signup_happy_path_marks_click_converted() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let link = seeded_link(&store, now).await;
        record_click_at(&store, &link.code, "fp-1", None, None, now)
            .await
            .unwrap();

        let updated =
            process_signup_at(&store, &link.code, "u2", "Budi", "08551234567", "fp-1", now)
                .await
                .unwrap();
        assert_eq!(updated.status, ReferralStatus::SignedUp);
        assert_eq!(updated.referee_contact.as_deref(), Some("+628551234567"));
        assert_eq!(updated.signed_up_at, Some(now));

        let click = find_click(&store, &link.code, "fp-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(click.fields["convertedToSignup"], serde_json::json!(true));
        assert_eq!(click.fields["convertedUserId"], serde_json::json!("u2"));
    }

    #[tokio::test]
    async fn signup_rejects_invalid_contact_before_lookup() {
        let store = MemoryStore::new();
        let err = process_signup_at(&store, "ANY", "u2", "Budi", "123", "fp", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidContact));
    }

    #[tokio::test]
    async fn signup_rejects_unknown_code() {
        let store = MemoryStore::new();
        let err = process_signup_at(&store, "NOPE", "u2", "Budi", "08551234567", "fp", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn signup_rejects_self_referral() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let link = seeded_link(&store, now).await;
        record_click_at(&store, &link.code, "fp-1", None, None, now)
            .await
            .unwrap();

        // Referrer's own contact, differently formatted.
        let err = process_signup_at(&store, &link.code, "u2", "Budi", "8123456789", "fp-1", now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SelfReferral));
    }

    #[tokio::test]
    async fn signup_rejects_duplicate_referee_contact() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let link = seeded_link(&store, now).await;
        record_click_at(&store, &link.code, "fp-1", None, None, now)
            .await
            .unwrap();
        process_signup_at(&store, &link.code, "u2", "Budi", "08551234567", "fp-1", now)
            .await
            .unwrap();

        // Referrer rotates the link and the same contact tries again.
        let refreshed = create_referral_link_at(
            &store,
            "user-1",
            "Sari",
            "08123456789",
            BASE,
            now + Duration::hours(2),
        )
        .await
        .unwrap();
        record_click_at(&store, &refreshed.code, "fp-2", None, None, now + Duration::hours(2))
            .await
            .unwrap();
        let err = process_signup_at(
            &store,
            &refreshed.code,
            "u3",
            "Budi",
            "08551234567",
            "fp-2",
            now + Duration::hours(2),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateReferral));
    }

    #[tokio::test]
    async fn signup_on_a_spent_link_is_rejected() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let link = seeded_link(&store, now).await;
        record_click_at(&store, &link.code, "fp-1", None, None, now)
            .await
            .unwrap();
        process_signup_at(&store, &link.code, "u2", "Budi", "08551234567", "fp-1", now)
            .await
            .unwrap();
        complete_referral_at(&store, "u2", now).await.unwrap();

        // Another device clicks the same code and tries to sign up.
        record_click_at(&store, &link.code, "fp-2", None, None, now)
            .await
            .unwrap();
        let err = process_signup_at(&store, &link.code, "u3", "Citra", "08561234567", "fp-2", now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateReferral));

        // The completed link is untouched: same referee, terminal status.
        let (_, stored) = find_link_by_code(&store, &link.code).await.unwrap().unwrap();
        assert_eq!(stored.status, ReferralStatus::Completed);
        assert_eq!(stored.referee_id.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn second_signup_on_a_signed_up_link_is_rejected() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let link = seeded_link(&store, now).await;
        record_click_at(&store, &link.code, "fp-1", None, None, now)
            .await
            .unwrap();
        process_signup_at(&store, &link.code, "u2", "Budi", "08551234567", "fp-1", now)
            .await
            .unwrap();

        // Different contact, different device: the link is still spent.
        record_click_at(&store, &link.code, "fp-2", None, None, now)
            .await
            .unwrap();
        let err = process_signup_at(&store, &link.code, "u3", "Citra", "08561234567", "fp-2", now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateReferral));
        let (_, stored) = find_link_by_code(&store, &link.code).await.unwrap().unwrap();
        assert_eq!(stored.referee_id.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn signup_on_expired_link_fails_and_pins() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let link = seeded_link(&store, now).await;
        let after_expiry = now + Duration::days(91);
        let err = process_signup_at(
            &store,
            &link.code,
            "u2",
            "Budi",
            "08551234567",
            "fp",
            after_expiry,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Expired));
    }

    #[tokio::test]
    async fn completion_is_a_noop_for_unreferred_users() {
        let store = MemoryStore::new();
        let out = complete_referral_at(&store, "stranger", Utc::now()).await.unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn completion_settles_the_signed_up_referral() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let link = seeded_link(&store, now).await;
        record_click_at(&store, &link.code, "fp-1", None, None, now)
            .await
            .unwrap();
        process_signup_at(&store, &link.code, "u2", "Budi", "08551234567", "fp-1", now)
            .await
            .unwrap();

        let done = complete_referral_at(&store, "u2", now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, ReferralStatus::Completed);
        assert_eq!(done.completed_at, Some(now));

        // Terminal: a second completion finds nothing to do.
        let again = complete_referral_at(&store, "u2", now).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn stats_aggregate_clicks_and_conversions() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let link = seeded_link(&store, now).await;
        record_click_at(&store, &link.code, "fp-1", None, None, now)
            .await
            .unwrap();
        record_click_at(&store, &link.code, "fp-2", None, None, now)
            .await
            .unwrap();
        process_signup_at(&store, &link.code, "u2", "Budi", "08551234567", "fp-1", now)
            .await
            .unwrap();
        complete_referral_at(&store, "u2", now).await.unwrap();

        let stats = referral_stats(&store, "user-1").await.unwrap();
        assert_eq!(stats.total_referrals, 1);
        assert_eq!(stats.completed_referrals, 1);
        assert_eq!(stats.pending_referrals, 0);
        assert_eq!(stats.total_clicks, 2);
        assert!((stats.conversion_rate - 50.0).abs() < f64::EPSILON);
    }
}
