//! The payout scheduler: settlement windows and request gating, pinned to
//! one civil timezone so payouts are unambiguous across a distributed user
//! base.

use chrono::{DateTime, Days, Duration, FixedOffset, NaiveTime, TimeZone, Utc, Weekday};
use chrono::Datelike;
use serde_json::json;
use tracing::info;

use crate::TRANSFER_ETA_HOURS;
use crate::error::Error;
use crate::store::{AttributionStore, Document, ListQuery, encode};
use crate::types::{
    MEMBERSHIP_REFERRALS, PAYOUT_REQUESTS, PROMOTERS, MembershipReferralRecord, PayoutRequest,
    PayoutStatus, PromoterProfile,
};

/// All civil-time payout math happens in UTC+7 (Asia/Jakarta), regardless
/// of server or client local time.
pub fn payout_tz() -> FixedOffset {
    FixedOffset::east_opt(7 * 3600).expect("UTC+7 is a valid fixed offset")
}

/// The settlement window containing `now`: Saturday 00:00:00 through the
/// following Friday 23:59:59, inclusive, in the pinned timezone.
pub fn settlement_window(now: DateTime<Utc>) -> (DateTime<FixedOffset>, DateTime<FixedOffset>) {
    let tz = payout_tz();
    let local = now.with_timezone(&tz);
    // weekday 0=Sunday; Saturday maps to offset 0.
    let days_back = (local.weekday().num_days_from_sunday() + 1) % 7;
    let start_date = local.date_naive() - Days::new(days_back as u64);
    let start_naive_utc =
        start_date.and_time(NaiveTime::MIN) - Duration::seconds(tz.local_minus_utc() as i64);
    let start = tz.from_utc_datetime(&start_naive_utc);
    let end = start + Duration::days(7) - Duration::seconds(1);
    (start, end)
}

/// Payout requests open only on the pinned-timezone Friday.
pub fn is_request_day(now: DateTime<Utc>) -> bool {
    now.with_timezone(&payout_tz()).weekday() == Weekday::Fri
}

pub async fn register_promoter(
    store: &dyn AttributionStore,
    user_id: &str,
    agent_code: &str,
    bank_name: Option<String>,
    bank_account_number: Option<String>,
    bank_account_name: Option<String>,
) -> Result<PromoterProfile, Error> {
    register_promoter_at(
        store,
        user_id,
        agent_code,
        bank_name,
        bank_account_number,
        bank_account_name,
        Utc::now(),
    )
    .await
}

pub async fn register_promoter_at(
    store: &dyn AttributionStore,
    user_id: &str,
    agent_code: &str,
    bank_name: Option<String>,
    bank_account_number: Option<String>,
    bank_account_name: Option<String>,
    now: DateTime<Utc>,
) -> Result<PromoterProfile, Error> {
    let profile = PromoterProfile {
        user_id: user_id.to_string(),
        agent_code: agent_code.to_string(),
        is_active: true,
        new_sign_ups_this_month: 0,
        streak_months: 0,
        bank_name,
        bank_account_number,
        bank_account_name,
        created_at: now,
    };
    store.create(PROMOTERS, None, encode(&profile)?).await?;
    info!(user_id, agent_code, "promoter registered");
    Ok(profile)
}

pub async fn get_promoter(
    store: &dyn AttributionStore,
    user_id: &str,
) -> Result<Option<(Document, PromoterProfile)>, Error> {
    let docs = store
        .list(PROMOTERS, ListQuery::new().eq("userId", user_id).limit(1))
        .await?;
    match docs.into_iter().next() {
        Some(doc) => {
            let profile: PromoterProfile = doc.decode()?;
            Ok(Some((doc, profile)))
        }
        None => Ok(None),
    }
}

/// Settlement-actor switch; an inactive promoter keeps earning reportable
/// commission but cannot request payouts.
pub async fn set_promoter_active(
    store: &dyn AttributionStore,
    user_id: &str,
    active: bool,
) -> Result<(), Error> {
    let (doc, _) = get_promoter(store, user_id).await?.ok_or(Error::NotFound)?;
    store
        .update(PROMOTERS, &doc.id, json!({"isActive": active}))
        .await?;
    Ok(())
}

pub async fn request_payout(
    store: &dyn AttributionStore,
    user_id: &str,
    affiliate_code: &str,
) -> Result<PayoutRequest, Error> {
    request_payout_at(store, user_id, affiliate_code, Utc::now()).await
}

/// Creates a payout request. Inactivity is reported regardless of the day;
/// the day gate applies only to active promoters. The transfer ETA is
/// wall-clock 48 hours, not business hours.
pub async fn request_payout_at(
    store: &dyn AttributionStore,
    user_id: &str,
    affiliate_code: &str,
    now: DateTime<Utc>,
) -> Result<PayoutRequest, Error> {
    let (_, profile) = get_promoter(store, user_id).await?.ok_or(Error::NotFound)?;
    if !profile.is_active {
        return Err(Error::AccountInactive);
    }
    if !is_request_day(now) {
        return Err(Error::OutsideRequestWindow);
    }
    let request = PayoutRequest {
        user_id: user_id.to_string(),
        affiliate_code: affiliate_code.to_string(),
        requested_at: now,
        transfer_eta: now + Duration::hours(TRANSFER_ETA_HOURS),
        status: PayoutStatus::Requested,
    };
    store.create(PAYOUT_REQUESTS, None, encode(&request)?).await?;
    info!(user_id, affiliate_code, "payout requested");
    Ok(request)
}

/// Sum of approved commission created in `[start, end)`.
pub async fn approved_total_in_window(
    store: &dyn AttributionStore,
    affiliate_code: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<i64, Error> {
    let docs = store
        .list(
            MEMBERSHIP_REFERRALS,
            ListQuery::new()
                .eq("affiliateCode", affiliate_code)
                .eq("status", "approved")
                .gte("createdAt", encode(&window_start)?)
                .lt("createdAt", encode(&window_end)?),
        )
        .await?;
    let mut total = 0i64;
    for doc in &docs {
        let record: MembershipReferralRecord = doc.decode()?;
        total += record.commission_amount;
    }
    Ok(total)
}
