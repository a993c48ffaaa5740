use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    middleware,
    routing::{get, post},
};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::clicks::{ClickOutcome, record_click};
use crate::commission::{
    TierEvaluation, approve_record, mark_record_paid, record_membership_referral, tier_for,
};
use crate::config::Config;
use crate::error::{Error, ErrorWithMeta};
use crate::fingerprint::{DeviceSignals, fingerprint};
use crate::payout::{
    approved_total_in_window, get_promoter, register_promoter, request_payout,
    set_promoter_active, settlement_window,
};
use crate::referral::{
    complete_referral, create_referral_link, process_signup, referral_stats,
};
use crate::responses::{ApiOk, RequestMeta, meta_middleware};
use crate::store::AttributionStore;
use crate::types::{
    MembershipReferralRecord, PayoutRequest, PromoterProfile, ReferralLink, ReferralStats,
};

/// The application state.
#[derive(Clone)]
pub struct AppState {
    /// The attribution store backing every engine operation.
    pub store: Arc<dyn AttributionStore>,
    /// The application configuration.
    pub config: Config,
}

pub fn init_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/referrals", post(create_referral_handler))
        .route("/referrals/{referrer_id}/stats", get(referral_stats_handler))
        .route("/referrals/complete", post(complete_referral_handler))
        .route("/clicks", post(record_click_handler))
        .route("/signups", post(signup_handler))
        .route("/memberships", post(record_membership_handler))
        .route("/memberships/{id}/approve", post(approve_membership_handler))
        .route("/memberships/{id}/pay", post(pay_membership_handler))
        .route("/promoters", post(register_promoter_handler))
        .route("/promoters/{user_id}", get(get_promoter_handler))
        .route("/promoters/{user_id}/active", post(set_promoter_active_handler))
        .route("/commission/{affiliate_code}/tier", get(tier_handler))
        .route(
            "/commission/{affiliate_code}/approved-total",
            get(approved_total_handler),
        )
        .route("/payouts", post(request_payout_handler))
        .route("/payouts/window", get(payout_window_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

/// The request to create (or refresh) a referral link.
#[derive(Deserialize)]
pub struct CreateReferralRequest {
    pub referrer_id: String,
    pub display_name: String,
    pub contact: String,
}

async fn create_referral_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CreateReferralRequest>,
) -> Result<ApiOk<ReferralLink>, ErrorWithMeta> {
    let link = create_referral_link(
        st.store.as_ref(),
        &req.referrer_id,
        &req.display_name,
        &req.contact,
        &st.config.base_url,
    )
    .await
    .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::created("referral link ready", link, meta))
}

async fn referral_stats_handler(
    State(st): State<AppState>,
    Path(referrer_id): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<ReferralStats>, ErrorWithMeta> {
    let stats = referral_stats(st.store.as_ref(), &referrer_id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("referral stats fetched", stats, meta))
}

/// The request to record a click. The caller either sends raw device
/// signals, or a fingerprint it derived itself.
#[derive(Deserialize)]
pub struct RecordClickRequest {
    pub code: String,
    pub fingerprint: Option<String>,
    pub signals: Option<DeviceSignals>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// The response after recording a click.
#[derive(Serialize)]
pub struct RecordClickResponse {
    /// False when the device had already clicked this code.
    pub counted: bool,
    pub referrer_display_name: String,
}

async fn record_click_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<RecordClickRequest>,
) -> Result<ApiOk<RecordClickResponse>, ErrorWithMeta> {
    let fp = match (req.fingerprint, req.signals.as_ref()) {
        (Some(fp), _) => fp,
        (None, Some(signals)) => fingerprint(signals),
        (None, None) => {
            return Err(Error::BadRequest(
                "either fingerprint or signals is required".into(),
            )
            .with_meta(meta));
        }
    };
    let ClickOutcome {
        accepted,
        referrer_display_name,
    } = record_click(st.store.as_ref(), &req.code, &fp, req.ip_address, req.user_agent)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok(
        "click recorded",
        RecordClickResponse {
            counted: accepted,
            referrer_display_name,
        },
        meta,
    ))
}

/// The request to record a referred signup.
#[derive(Deserialize)]
pub struct SignupRequest {
    pub code: String,
    pub referee_id: String,
    pub referee_display_name: String,
    pub referee_contact: String,
    pub fingerprint: String,
}

async fn signup_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<SignupRequest>,
) -> Result<ApiOk<ReferralLink>, ErrorWithMeta> {
    let link = process_signup(
        st.store.as_ref(),
        &req.code,
        &req.referee_id,
        &req.referee_display_name,
        &req.referee_contact,
        &req.fingerprint,
    )
    .await
    .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("signup recorded", link, meta))
}

#[derive(Deserialize)]
pub struct CompleteReferralRequest {
    pub referee_id: String,
}

/// The response after a completion attempt.
#[derive(Serialize)]
pub struct CompleteReferralResponse {
    /// False when the user had no signed-up referral (not an error).
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referral: Option<ReferralLink>,
}

async fn complete_referral_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CompleteReferralRequest>,
) -> Result<ApiOk<CompleteReferralResponse>, ErrorWithMeta> {
    let referral = complete_referral(st.store.as_ref(), &req.referee_id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok(
        "completion processed",
        CompleteReferralResponse {
            completed: referral.is_some(),
            referral,
        },
        meta,
    ))
}

/// The request to record a referred membership purchase.
#[derive(Deserialize)]
pub struct RecordMembershipRequest {
    pub affiliate_code: String,
    pub referred_entity_id: String,
    pub referred_entity_type: String,
    pub plan_id: String,
    /// Integer currency units; must be >= 0.
    pub plan_price: i64,
}

/// The response after recording a commission record.
#[derive(Serialize)]
pub struct RecordMembershipResponse {
    pub id: String,
    pub record: MembershipReferralRecord,
}

async fn record_membership_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<RecordMembershipRequest>,
) -> Result<ApiOk<RecordMembershipResponse>, ErrorWithMeta> {
    if req.plan_price < 0 {
        return Err(Error::BadRequest("plan_price must be >= 0".into()).with_meta(meta));
    }
    let (id, record) = record_membership_referral(
        st.store.as_ref(),
        &req.affiliate_code,
        &req.referred_entity_id,
        &req.referred_entity_type,
        &req.plan_id,
        req.plan_price,
    )
    .await
    .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::created(
        "membership referral recorded",
        RecordMembershipResponse { id, record },
        meta,
    ))
}

async fn approve_membership_handler(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<MembershipReferralRecord>, ErrorWithMeta> {
    let record = approve_record(st.store.as_ref(), &id, Utc::now())
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("commission approved", record, meta))
}

async fn pay_membership_handler(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<MembershipReferralRecord>, ErrorWithMeta> {
    let record = mark_record_paid(st.store.as_ref(), &id, Utc::now())
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("commission paid", record, meta))
}

/// The request to register a promoter.
#[derive(Deserialize)]
pub struct RegisterPromoterRequest {
    pub user_id: String,
    pub agent_code: String,
    pub bank_name: Option<String>,
    pub bank_account_number: Option<String>,
    pub bank_account_name: Option<String>,
}

async fn register_promoter_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<RegisterPromoterRequest>,
) -> Result<ApiOk<PromoterProfile>, ErrorWithMeta> {
    let profile = register_promoter(
        st.store.as_ref(),
        &req.user_id,
        &req.agent_code,
        req.bank_name,
        req.bank_account_number,
        req.bank_account_name,
    )
    .await
    .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::created("promoter registered", profile, meta))
}

async fn get_promoter_handler(
    State(st): State<AppState>,
    Path(user_id): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<PromoterProfile>, ErrorWithMeta> {
    let found = get_promoter(st.store.as_ref(), &user_id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    match found {
        Some((_, profile)) => Ok(ApiOk::ok("promoter fetched", profile, meta)),
        None => Err(Error::NotFound.with_meta(meta)),
    }
}

#[derive(Deserialize)]
pub struct SetPromoterActiveRequest {
    pub active: bool,
}

#[derive(Serialize)]
pub struct SetPromoterActiveResponse {
    pub user_id: String,
    pub active: bool,
}

async fn set_promoter_active_handler(
    State(st): State<AppState>,
    Path(user_id): Path<String>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<SetPromoterActiveRequest>,
) -> Result<ApiOk<SetPromoterActiveResponse>, ErrorWithMeta> {
    set_promoter_active(st.store.as_ref(), &user_id, req.active)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok(
        "promoter updated",
        SetPromoterActiveResponse {
            user_id,
            active: req.active,
        },
        meta,
    ))
}

async fn tier_handler(
    State(st): State<AppState>,
    Path(affiliate_code): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<TierEvaluation>, ErrorWithMeta> {
    let tier = tier_for(st.store.as_ref(), &affiliate_code, Utc::now())
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok("tier evaluated", tier, meta))
}

/// The current settlement window, in the pinned payout timezone.
#[derive(Serialize)]
pub struct PayoutWindowResponse {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

async fn payout_window_handler(
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<PayoutWindowResponse>, ErrorWithMeta> {
    let (start, end) = settlement_window(Utc::now());
    Ok(ApiOk::ok(
        "settlement window",
        PayoutWindowResponse { start, end },
        meta,
    ))
}

/// The response for an approved-commission total over the current window.
#[derive(Serialize)]
pub struct ApprovedTotalResponse {
    pub affiliate_code: String,
    pub window_start: DateTime<FixedOffset>,
    pub window_end: DateTime<FixedOffset>,
    pub total: i64,
}

async fn approved_total_handler(
    State(st): State<AppState>,
    Path(affiliate_code): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<ApprovedTotalResponse>, ErrorWithMeta> {
    let (start, end) = settlement_window(Utc::now());
    // The window end is inclusive; the total query takes an exclusive bound.
    let total = approved_total_in_window(
        st.store.as_ref(),
        &affiliate_code,
        start.with_timezone(&Utc),
        (end + chrono::Duration::seconds(1)).with_timezone(&Utc),
    )
    .await
    .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::ok(
        "approved commission total",
        ApprovedTotalResponse {
            affiliate_code,
            window_start: start,
            window_end: end,
            total,
        },
        meta,
    ))
}

#[derive(Deserialize)]
pub struct RequestPayoutRequest {
    pub user_id: String,
    pub affiliate_code: String,
}

async fn request_payout_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<RequestPayoutRequest>,
) -> Result<ApiOk<PayoutRequest>, ErrorWithMeta> {
    let request = request_payout(st.store.as_ref(), &req.user_id, &req.affiliate_code)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    Ok(ApiOk::created("payout requested", request, meta))
}
