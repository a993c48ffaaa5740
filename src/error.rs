use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::responses::RequestMeta;
use crate::store::StoreError;

pub const E_NOT_FOUND: &str = "NOT_FOUND";
pub const E_EXPIRED: &str = "EXPIRED";
pub const E_INVALID_CONTACT: &str = "INVALID_CONTACT";
pub const E_SELF_REFERRAL: &str = "SELF_REFERRAL";
pub const E_DUPLICATE_REFERRAL: &str = "DUPLICATE_REFERRAL";
pub const E_MISSING_CLICK_PROOF: &str = "MISSING_CLICK_PROOF";
pub const E_OUTSIDE_REQUEST_WINDOW: &str = "OUTSIDE_REQUEST_WINDOW";
pub const E_ACCOUNT_INACTIVE: &str = "ACCOUNT_INACTIVE";
pub const E_STORE_UNAVAILABLE: &str = "STORE_UNAVAILABLE";
pub const E_BAD_REQUEST: &str = "BAD_REQUEST";

/// Engine error kinds. The validation variants never mutate state and are
/// never retried; `Store` is the only retryable class, and only for reads
/// or idempotent writes.
#[derive(Debug)]
pub enum Error {
    NotFound,
    Expired,
    InvalidContact,
    SelfReferral,
    DuplicateReferral,
    MissingClickProof,
    OutsideRequestWindow,
    AccountInactive,
    BadRequest(String),
    Store(anyhow::Error),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound => E_NOT_FOUND,
            Error::Expired => E_EXPIRED,
            Error::InvalidContact => E_INVALID_CONTACT,
            Error::SelfReferral => E_SELF_REFERRAL,
            Error::DuplicateReferral => E_DUPLICATE_REFERRAL,
            Error::MissingClickProof => E_MISSING_CLICK_PROOF,
            Error::OutsideRequestWindow => E_OUTSIDE_REQUEST_WINDOW,
            Error::AccountInactive => E_ACCOUNT_INACTIVE,
            Error::BadRequest(_) => E_BAD_REQUEST,
            Error::Store(_) => E_STORE_UNAVAILABLE,
        }
    }

    /// Coarse, user-safe message. Never echoes another user's contact.
    pub fn message(&self) -> &str {
        match self {
            Error::NotFound => "referral code not found",
            Error::Expired => "link expired",
            Error::InvalidContact => "invalid contact number",
            Error::SelfReferral => "cannot refer yourself",
            Error::DuplicateReferral => "already referred",
            Error::MissingClickProof => "please click the link before signing up",
            Error::OutsideRequestWindow => "payout requests open on Friday",
            Error::AccountInactive => "promoter account is inactive",
            Error::BadRequest(msg) => msg,
            Error::Store(_) => "service temporarily unavailable",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Expired => StatusCode::GONE,
            Error::InvalidContact | Error::MissingClickProof | Error::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::SelfReferral | Error::DuplicateReferral | Error::OutsideRequestWindow => {
                StatusCode::CONFLICT
            }
            Error::AccountInactive => StatusCode::FORBIDDEN,
            Error::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn with_meta(self, meta: RequestMeta) -> ErrorWithMeta {
        ErrorWithMeta { error: self, meta }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for Error {}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Error::NotFound,
            StoreError::Conflict => Error::Store(anyhow::anyhow!("document revision conflict")),
            StoreError::Unavailable(inner) => Error::Store(inner),
        }
    }
}

#[derive(Debug)]
pub struct ErrorWithMeta {
    error: Error,
    meta: RequestMeta,
}

impl IntoResponse for ErrorWithMeta {
    fn into_response(self) -> Response {
        if let Error::Store(e) = &self.error {
            error!("store error: {:?}", e);
        }
        let body = json!({
            "request_id": self.meta.request_id,
            "error": self.error.message(),
            "code": self.error.code(),
        });
        (self.error.status(), Json(body)).into_response()
    }
}
