//! Outbound carrier adapters: a closed trait object rather than concrete
//! per-vendor structs wired into the engine, so the engine's dispatch path
//! never needs to know which vendor backs a channel.

#[cfg(feature = "email-carrier")]
pub mod email;
pub mod logging;
pub mod sms;

use async_trait::async_trait;
use overlord_store::id::{ConversationId, LeadId};
use overlord_store::models::Channel;

#[cfg(feature = "email-carrier")]
pub use email::SmtpEmailCarrier;
pub use logging::LoggingCarrier;
pub use sms::RestSmsCarrier;

/// An outbound message ready to hand to a carrier, independent of whether
/// the carrier is email, SMS, or chat.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    pub lead_id: LeadId,
    pub conversation_id: ConversationId,
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
}

/// Confirmation of a successful dispatch, carrying the carrier's opaque
/// message id so later webhooks can be correlated back to this send.
#[derive(Debug, Clone)]
pub struct CarrierReceipt {
    pub external_id: String,
}

/// Whether a carrier failure should be retried with backoff
/// (transient: network, 5xx) or treated as terminal (permanent: invalid
/// address, unsubscribed, blocked).
#[derive(Debug, thiserror::Error)]
pub enum CarrierError {
    #[error("carrier call failed transiently: {0}")]
    Transient(String),
    #[error("carrier call failed permanently: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait Carrier: Send + Sync {
    fn channel(&self) -> Channel;
    async fn send(&self, envelope: OutboundEnvelope) -> Result<CarrierReceipt, CarrierError>;
}
