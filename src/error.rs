//! Closed error taxonomy for the engagement runtime, matching the category
//! list used throughout the component design: validation, contactability,
//! model-transient/permanent, carrier-transient/permanent, store-transient/
//! permanent, breaker-open, idempotency-conflict.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverlordError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("lead {lead_id} has no usable channel")]
    Contactability { lead_id: String },

    #[error("model call failed transiently: {0}")]
    ModelTransient(String),

    #[error("model call failed permanently: {0}")]
    ModelPermanent(String),

    #[error("carrier call failed transiently on {channel}: {message}")]
    CarrierTransient { channel: String, message: String },

    #[error("carrier call failed permanently on {channel}: {message}")]
    CarrierPermanent { channel: String, message: String },

    #[error("store operation failed transiently: {0}")]
    StoreTransient(String),

    #[error("store operation failed permanently: {0}")]
    StorePermanent(String),

    #[error("circuit breaker open for service {service}")]
    BreakerOpen { service: String },

    #[error("duplicate request, already applied: {0}")]
    IdempotencyConflict(String),

    #[error("router exhausted all models: {0}")]
    RouterExhausted(String),

    #[error("requested entity not found: {0}")]
    NotFound(String),
}

impl OverlordError {
    /// Stable machine-readable error code for the `{code, message, retryable,
    /// requestId}` API envelope.
    pub fn code(&self) -> &'static str {
        match self {
            OverlordError::Validation(_) => "validation",
            OverlordError::Contactability { .. } => "contactability",
            OverlordError::ModelTransient(_) => "model_transient",
            OverlordError::ModelPermanent(_) => "model_permanent",
            OverlordError::CarrierTransient { .. } => "carrier_transient",
            OverlordError::CarrierPermanent { .. } => "carrier_permanent",
            OverlordError::StoreTransient(_) => "store_transient",
            OverlordError::StorePermanent(_) => "store_permanent",
            OverlordError::BreakerOpen { .. } => "breaker_open",
            OverlordError::IdempotencyConflict(_) => "idempotency_conflict",
            OverlordError::RouterExhausted(_) => "router_exhausted",
            OverlordError::NotFound(_) => "not_found",
        }
    }

    /// Whether the *caller* should retry the same operation unchanged.
    /// Idempotency conflicts are reported as success per the recovery
    /// policy, not as a retryable failure.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            OverlordError::ModelTransient(_)
                | OverlordError::CarrierTransient { .. }
                | OverlordError::StoreTransient(_)
                | OverlordError::BreakerOpen { .. }
        )
    }
}

impl From<overlord_store::StoreError> for OverlordError {
    fn from(err: overlord_store::StoreError) -> Self {
        if err.is_transient() {
            OverlordError::StoreTransient(err.to_string())
        } else {
            OverlordError::StorePermanent(err.to_string())
        }
    }
}

/// Uniform envelope surfaced at the API boundary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub request_id: String,
}

impl ErrorEnvelope {
    pub fn from_error(err: &OverlordError, request_id: impl Into<String>) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.retryable(),
            request_id: request_id.into(),
        }
    }
}

pub type OverlordResult<T> = Result<T, OverlordError>;
