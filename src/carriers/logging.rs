//! A trivial carrier that records the envelope and returns a synthetic
//! receipt. Unconditionally compiled (no feature gate) and used in tests
//! and as the default when no real carrier is configured, so the engine
//! always has somewhere to send a message without API keys on hand.

use crate::carriers::{Carrier, CarrierError, CarrierReceipt, OutboundEnvelope};
use async_trait::async_trait;
use overlord_store::models::Channel;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct LoggingCarrier {
    channel: Channel,
    counter: AtomicU64,
    sent: Arc<Mutex<Vec<OutboundEnvelope>>>,
}

impl LoggingCarrier {
    pub fn new(channel: Channel) -> Self {
        Self { channel, counter: AtomicU64::new(0), sent: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Envelopes recorded so far, for test assertions.
    pub async fn sent(&self) -> Vec<OutboundEnvelope> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Carrier for LoggingCarrier {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, envelope: OutboundEnvelope) -> Result<CarrierReceipt, CarrierError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        tracing::info!(channel = ?self.channel, to = %envelope.to, "logging carrier recorded send");
        let external_id = format!("log-{:?}-{n}", self.channel).to_lowercase();
        self.sent.lock().await.push(envelope);
        Ok(CarrierReceipt { external_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_every_send_and_returns_unique_ids() {
        let carrier = LoggingCarrier::new(Channel::Email);
        let envelope = OutboundEnvelope {
            lead_id: overlord_store::id::LeadId::new(),
            conversation_id: overlord_store::id::ConversationId::new(),
            to: "a@b.com".to_string(),
            subject: Some("hi".to_string()),
            body: "hello".to_string(),
        };
        let r1 = carrier.send(envelope.clone()).await.unwrap();
        let r2 = carrier.send(envelope).await.unwrap();
        assert_ne!(r1.external_id, r2.external_id);
        assert_eq!(carrier.sent().await.len(), 2);
    }
}
