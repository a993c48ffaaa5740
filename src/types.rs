use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Collection names on the attribution store.
pub const REFERRALS: &str = "referrals";
pub const REFERRAL_CLICKS: &str = "referral_clicks";
pub const MEMBERSHIP_REFERRALS: &str = "membership_referrals";
pub const PROMOTERS: &str = "promoters";
pub const PAYOUT_REQUESTS: &str = "payout_requests";

/// Lifecycle of a referral link. Transitions only move forward; `expired`
/// is reachable from any non-terminal state once the link is past its
/// expiry. `completed` and `expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Pending,
    Clicked,
    SignedUp,
    Completed,
    Expired,
}

impl ReferralStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReferralStatus::Completed | ReferralStatus::Expired)
    }
}

/// One referral link per referrer. Never physically deleted; creating a new
/// link for the same referrer refreshes the existing row instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralLink {
    pub referrer_id: String,
    pub referrer_display_name: String,
    /// Normalized phone contact of the referrer.
    pub referrer_contact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referee_display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referee_contact: Option<String>,
    pub code: String,
    pub canonical_url: String,
    pub status: ReferralStatus,
    pub click_count: i64,
    /// Grows only; one entry per distinct device that clicked the link.
    pub device_fingerprints: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_clicked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_up_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// One accepted click per (code, fingerprint) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickEvent {
    pub code: String,
    pub device_fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub clicked_at: DateTime<Utc>,
    pub converted_to_signup: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converted_user_id: Option<String>,
}

/// Settlement status of a commission record. Advanced only by the
/// settlement actor, never by the referrer-facing API, and forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Approved,
    Paid,
}

/// One record per qualifying referred membership purchase. The amount is
/// computed once at creation and never recalculated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipReferralRecord {
    pub affiliate_code: String,
    pub referred_entity_id: String,
    pub referred_entity_type: String,
    pub plan_id: String,
    /// Integer currency units (IDR).
    pub plan_price: i64,
    /// Fraction, e.g. 0.20.
    pub commission_rate: f64,
    pub commission_amount: i64,
    pub status: SettlementStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
}

/// Registered affiliate/promoter. `is_active == false` blocks payout
/// requests; commission is still reported but not payable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoterProfile {
    pub user_id: String,
    pub agent_code: String,
    pub is_active: bool,
    pub new_sign_ups_this_month: i64,
    pub streak_months: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_account_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_account_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Requested,
    Transferred,
}

/// One payout request per settlement cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutRequest {
    pub user_id: String,
    pub affiliate_code: String,
    pub requested_at: DateTime<Utc>,
    /// Wall-clock SLA, not business hours.
    pub transfer_eta: DateTime<Utc>,
    pub status: PayoutStatus,
}

/// Per-referrer aggregate derived on demand from the referral rows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralStats {
    pub total_referrals: u64,
    pub completed_referrals: u64,
    pub pending_referrals: u64,
    pub total_clicks: i64,
    /// Completed referrals per click, as a percentage.
    pub conversion_rate: f64,
}
