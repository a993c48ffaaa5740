//! Affiliate attribution and commission settlement engine.
//!
//! Referral links with device-fingerprint click deduplication, an
//! anti-fraud signup gate, per-purchase commission records with a
//! forward-only settlement lifecycle, derived monthly tier evaluation, and
//! Friday-gated payout scheduling in a pinned civil timezone.

mod api;
mod attribution;
mod clicks;
mod commission;
mod config;
mod error;
mod fingerprint;
mod payout;
mod referral;
mod responses;
mod store;
mod types;

pub use api::{AppState, init_router};
pub use attribution::AttributionCache;
pub use clicks::{ClickOutcome, record_click, record_click_at};
pub use commission::{
    TierEvaluation, approve_record, commission_amount, evaluate_tier, mark_record_paid,
    monthly_histogram, record_membership_referral, record_membership_referral_at, tier_for,
};
pub use config::Config;
pub use error::{Error, ErrorWithMeta};
pub use fingerprint::{DeviceSignals, fingerprint};
pub use payout::{
    approved_total_in_window, get_promoter, is_request_day, payout_tz, register_promoter,
    request_payout, request_payout_at, set_promoter_active, settlement_window,
};
pub use referral::{
    complete_referral, create_referral_link, generate_referral_code, normalize_contact,
    process_signup, referral_stats,
};
pub use store::{
    AttributionStore, Document, Filter, ListQuery, MemoryStore, Order, PgStore, StoreError,
};
pub use types::{
    ClickEvent, MembershipReferralRecord, PayoutRequest, PayoutStatus, PromoterProfile,
    ReferralLink, ReferralStats, ReferralStatus, SettlementStatus,
};

/// Base commission rate on a referred membership purchase.
pub const COMMISSION_BASE_RATE: f64 = 0.20;
/// Recurring rate, active only in months where the signup target is met.
pub const COMMISSION_RECURRING_RATE: f64 = 0.10;
/// Added to the base rate after three consecutive qualifying months.
pub const COMMISSION_STREAK_BONUS: f64 = 0.03;
/// New signups per calendar month needed to qualify.
pub const MONTHLY_SIGNUP_TARGET: u32 = 20;
/// Consecutive qualifying months that unlock the streak bonus.
pub const STREAK_WINDOW_MONTHS: u32 = 3;
/// Referral links expire this many days after (re)creation.
pub const REFERRAL_TTL_DAYS: i64 = 90;
/// A captured affiliate code attributes conversions for this many days.
pub const ATTRIBUTION_TTL_DAYS: i64 = 30;
/// Wall-clock transfer SLA for an accepted payout request.
pub const TRANSFER_ETA_HOURS: i64 = 48;
