//! Runtime event system.
//!
//! A callback-based observability layer covering ingress, routing, dispatch,
//! reply handling, and handover. A single [`EventHandler`] trait receives
//! [`OverlordEvent`]s; the default method is a no-op so callers only
//! override what they care about. The handler is shared via
//! `Arc<dyn EventHandler>` across every worker task.

use crate::model::RouterOutcome;
use async_trait::async_trait;
use overlord_store::id::{CampaignId, CommunicationId, ConversationId, HandoverId, LeadId};
use overlord_store::models::Channel;

/// Events emitted across the engagement pipeline.
///
/// Every variant carries `lead_id` so handlers can follow one lead's whole
/// journey without external state.
#[derive(Debug, Clone)]
pub enum OverlordEvent {
    /// A lead was ingested (either freshly created or recognized as a
    /// duplicate of a prior submission).
    LeadIngested { lead_id: LeadId, duplicate: bool, source: String },

    /// The Overlord produced a routing decision for a lead.
    RoutingDecided { lead_id: LeadId, channel: Option<Channel>, reasoning: String },

    /// A channel agent composed an outbound message (initial or reply).
    MessageComposed { lead_id: LeadId, conversation_id: ConversationId, channel: Channel },

    /// A dispatch job was accepted onto the job queue.
    DispatchQueued { lead_id: LeadId, communication_id: CommunicationId, channel: Channel },

    /// A carrier confirmed (or failed) delivery of a dispatched message.
    DispatchCompleted { lead_id: LeadId, communication_id: CommunicationId, succeeded: bool },

    /// An inbound reply was matched to a lead and conversation.
    ReplyMatched { lead_id: LeadId, conversation_id: ConversationId, channel: Channel },

    /// An inbound message could not be matched to any lead.
    ReplyOrphaned { channel: Channel },

    /// A model call completed, successfully or not, through the router.
    ModelInvoked { lead_id: LeadId, outcome: RouterOutcome },

    /// A circuit breaker changed state.
    BreakerTransitioned { service: String, to_open: bool },

    /// A scheduled touch step fired (or was deferred/canceled).
    TouchFired { lead_id: LeadId, campaign_id: CampaignId, step_index: i64 },

    /// The handover evaluator tripped for a conversation.
    HandoverTriggered { lead_id: LeadId, handover_id: HandoverId, reason: String },

    /// A lead reached a terminal state.
    LeadArchived { lead_id: LeadId, reason: String },
}

/// Trait for receiving runtime events. The default implementation is a
/// no-op, so implementers only override the events they observe.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, _event: &OverlordEvent) {}
}

/// An [`EventHandler`] that forwards every event to a `tracing` span at
/// `info` level. Used as the default handler when no observer is
/// configured, so the runtime is observable out of the box with no extra
/// setup.
pub struct TracingEventHandler;

#[async_trait]
impl EventHandler for TracingEventHandler {
    async fn on_event(&self, event: &OverlordEvent) {
        tracing::info!(?event, "overlord event");
    }
}
