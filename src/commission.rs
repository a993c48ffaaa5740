//! The commission calculator: per-event amounts and derived monthly tiers.
//!
//! Tier state is recomputed from the raw records on every evaluation rather
//! than cached, so backfilled or corrected records change past-month
//! eligibility without a migration step. The cost is a full per-promoter
//! scan, which is fine at realistic volumes.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::error::Error;
use crate::payout::payout_tz;
use crate::store::{AttributionStore, ListQuery, encode};
use crate::types::{MEMBERSHIP_REFERRALS, MembershipReferralRecord, SettlementStatus};
use crate::{
    COMMISSION_BASE_RATE, COMMISSION_RECURRING_RATE, COMMISSION_STREAK_BONUS,
    MONTHLY_SIGNUP_TARGET, STREAK_WINDOW_MONTHS,
};

/// Integer commission amount, rounding half-up.
pub fn commission_amount(plan_price: i64, rate: f64) -> i64 {
    (plan_price as f64 * rate).round() as i64
}

/// Calendar month key (`YYYY-MM`) in the pinned payout timezone.
pub fn month_key(at: DateTime<Utc>) -> String {
    let local = at.with_timezone(&payout_tz());
    format!("{:04}-{:02}", local.year(), local.month())
}

fn month_key_back(now: DateTime<Utc>, back: u32) -> String {
    let local = now.with_timezone(&payout_tz());
    let total = local.year() * 12 + local.month() as i32 - 1 - back as i32;
    format!("{:04}-{:02}", total.div_euclid(12), total.rem_euclid(12) + 1)
}

pub async fn record_membership_referral(
    store: &dyn AttributionStore,
    affiliate_code: &str,
    referred_entity_id: &str,
    referred_entity_type: &str,
    plan_id: &str,
    plan_price: i64,
) -> Result<(String, MembershipReferralRecord), Error> {
    record_membership_referral_at(
        store,
        affiliate_code,
        referred_entity_id,
        referred_entity_type,
        plan_id,
        plan_price,
        Utc::now(),
    )
    .await
}

/// Creates the commission record for a referred membership purchase. The
/// rate is resolved from the base tier at creation and the amount is never
/// recalculated afterwards, whatever later happens to the rate constants.
pub async fn record_membership_referral_at(
    store: &dyn AttributionStore,
    affiliate_code: &str,
    referred_entity_id: &str,
    referred_entity_type: &str,
    plan_id: &str,
    plan_price: i64,
    now: DateTime<Utc>,
) -> Result<(String, MembershipReferralRecord), Error> {
    let record = MembershipReferralRecord {
        affiliate_code: affiliate_code.to_string(),
        referred_entity_id: referred_entity_id.to_string(),
        referred_entity_type: referred_entity_type.to_string(),
        plan_id: plan_id.to_string(),
        plan_price,
        commission_rate: COMMISSION_BASE_RATE,
        commission_amount: commission_amount(plan_price, COMMISSION_BASE_RATE),
        status: SettlementStatus::Pending,
        created_at: now,
        approved_at: None,
        paid_at: None,
    };
    let doc = store
        .create(MEMBERSHIP_REFERRALS, None, encode(&record)?)
        .await?;
    info!(
        affiliate_code,
        amount = record.commission_amount,
        "membership referral recorded"
    );
    Ok((doc.id, record))
}

/// Settlement actor: `pending -> approved`. Forward-only.
pub async fn approve_record(
    store: &dyn AttributionStore,
    record_id: &str,
    now: DateTime<Utc>,
) -> Result<MembershipReferralRecord, Error> {
    advance_record(store, record_id, SettlementStatus::Approved, now).await
}

/// Settlement actor: `approved -> paid`. Forward-only.
pub async fn mark_record_paid(
    store: &dyn AttributionStore,
    record_id: &str,
    now: DateTime<Utc>,
) -> Result<MembershipReferralRecord, Error> {
    advance_record(store, record_id, SettlementStatus::Paid, now).await
}

async fn advance_record(
    store: &dyn AttributionStore,
    record_id: &str,
    to: SettlementStatus,
    now: DateTime<Utc>,
) -> Result<MembershipReferralRecord, Error> {
    let doc = store
        .get(MEMBERSHIP_REFERRALS, record_id)
        .await?
        .ok_or(Error::NotFound)?;
    let record: MembershipReferralRecord = doc.decode()?;
    let patch = match (record.status, to) {
        (SettlementStatus::Pending, SettlementStatus::Approved) => {
            json!({"status": to, "approvedAt": now})
        }
        (SettlementStatus::Approved, SettlementStatus::Paid) => {
            json!({"status": to, "paidAt": now})
        }
        (from, to) => {
            return Err(Error::Store(anyhow::anyhow!(
                "invalid settlement transition {from:?} -> {to:?} for record {record_id}"
            )));
        }
    };
    let updated = store.update(MEMBERSHIP_REFERRALS, record_id, patch).await?;
    Ok(updated.decode()?)
}

/// Histogram of record creation months for one affiliate code.
pub async fn monthly_histogram(
    store: &dyn AttributionStore,
    affiliate_code: &str,
) -> Result<BTreeMap<String, u32>, Error> {
    let docs = store
        .list(
            MEMBERSHIP_REFERRALS,
            ListQuery::new().eq("affiliateCode", affiliate_code),
        )
        .await?;
    let mut histogram: BTreeMap<String, u32> = BTreeMap::new();
    for doc in &docs {
        let record: MembershipReferralRecord = doc.decode()?;
        *histogram.entry(month_key(record.created_at)).or_default() += 1;
    }
    Ok(histogram)
}

/// Derived tier state for a promoter at a point in time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierEvaluation {
    /// Month key the evaluation applies to.
    pub month: String,
    /// New qualifying records in the current month.
    pub new_signups: u32,
    /// The 10% recurring stream is active this month.
    pub recurring_active: bool,
    /// Three consecutive qualifying months precede this one.
    pub streak_bonus: bool,
    pub new_signup_rate: f64,
    pub recurring_rate: f64,
}

/// Evaluates recurring eligibility and the streak bonus from a monthly
/// histogram, always relative to "now".
///
/// Recurring: active iff the current month has reached the target; a
/// qualifying past month never carries over. Streak: the three calendar
/// months immediately before the current one must each be present at or
/// above target, which unlocks the +3% bonus in this (fourth) month.
pub fn evaluate_tier(histogram: &BTreeMap<String, u32>, now: DateTime<Utc>) -> TierEvaluation {
    let month = month_key(now);
    let new_signups = histogram.get(&month).copied().unwrap_or(0);
    let recurring_active = new_signups >= MONTHLY_SIGNUP_TARGET;
    let streak_bonus = (1..=STREAK_WINDOW_MONTHS).all(|back| {
        histogram
            .get(&month_key_back(now, back))
            .is_some_and(|&count| count >= MONTHLY_SIGNUP_TARGET)
    });
    TierEvaluation {
        month,
        new_signups,
        recurring_active,
        streak_bonus,
        new_signup_rate: COMMISSION_BASE_RATE + if streak_bonus { COMMISSION_STREAK_BONUS } else { 0.0 },
        recurring_rate: if recurring_active {
            COMMISSION_RECURRING_RATE
        } else {
            0.0
        },
    }
}

/// Scans the promoter's records and evaluates the current tier.
pub async fn tier_for(
    store: &dyn AttributionStore,
    affiliate_code: &str,
    now: DateTime<Utc>,
) -> Result<TierEvaluation, Error> {
    let histogram = monthly_histogram(store, affiliate_code).await?;
    Ok(evaluate_tier(&histogram, now))
}
