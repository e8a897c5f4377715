//! Reply Ingester: resolves carrier webhook deliveries to a
//! lead and conversation, enqueues matched replies onto the Engagement
//! Engine, and stores anything that can't be matched as an orphan for
//! operator review.
//!
//! Two kinds of inbound event:
//! - status-only events (`delivered`, `opened`, `clicked`, `bounced`,
//!   `unsubscribed`) update a `Communication` row directly;
//! - reply events (`replied`, `inbound_sms`) are matched to a lead and fed
//!   to [`crate::engine::Engine::enqueue_handle_reply`].
//!
//! Both the carrier webhook endpoints and the IMAP scanner funnel through
//! here so the matching rules live in one place.

use chrono::{DateTime, Utc};

use overlord_store::models::{Channel, CommunicationStatus, ConversationStatus, LeadStatus};
use overlord_store::Store;

use crate::engine::Engine;
use crate::error::OverlordResult;
use crate::event::{EventHandler, OverlordEvent};

/// A carrier-defined email webhook delivery, already decoded from whatever
/// envelope the carrier posts (the `POST /webhooks/email`).
#[derive(Debug, Clone)]
pub struct EmailWebhookEvent {
    /// The carrier's stable external message id for *this* event — used
    /// both for the 24h duplicate-delivery guard and, on a reply, as the
    /// id a later bounce/open event would reference back.
    pub external_message_id: String,
    pub kind: EmailEventKind,
}

#[derive(Debug, Clone)]
pub enum EmailEventKind {
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Unsubscribed,
    Replied {
        from: String,
        body: String,
        /// `In-Reply-To` header value, when the carrier forwards it —
        /// the 's tie-break for leads sharing an email address.
        in_reply_to: Option<String>,
        received_at: DateTime<Utc>,
    },
}

/// A carrier-defined SMS webhook delivery (the `POST /webhooks/sms`
/// — `{from, to, body, messageSid, status?}`). Presence of `body` means a
/// reply; otherwise `status` carries a delivery status update.
#[derive(Debug, Clone)]
pub struct SmsWebhookEvent {
    pub message_sid: String,
    pub from: String,
    pub body: Option<String>,
    pub status: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Window within which a repeated `external_message_id` is treated as a
/// carrier redelivery rather than a second reply (the "Duplicate
/// webhook deliveries ... within a 24h window produce at most one inbound
/// Message row").
const DUPLICATE_WINDOW: chrono::Duration = chrono::Duration::hours(24);

pub async fn handle_email_webhook(
    store: &Store,
    engine: &Engine,
    events: &dyn EventHandler,
    event: EmailWebhookEvent,
) -> OverlordResult<()> {
    match event.kind {
        EmailEventKind::Delivered => {
            update_status_by_external_id(store, &event.external_message_id, CommunicationStatus::Delivered, false).await
        }
        EmailEventKind::Opened | EmailEventKind::Clicked => {
            // Engagement-tracking events with no `Communication` status of
            // their own; logged for observability, nothing to persist.
            tracing::info!(external_id = %event.external_message_id, kind = ?event_kind_label(&event.kind), "email engagement event");
            Ok(())
        }
        EmailEventKind::Bounced => {
            mark_carrier_permanent(store, events, &event.external_message_id, CommunicationStatus::Bounced, "bounced").await
        }
        EmailEventKind::Unsubscribed => {
            mark_carrier_permanent(store, events, &event.external_message_id, CommunicationStatus::Failed, "opt_out").await
        }
        EmailEventKind::Replied { from, body, in_reply_to, received_at } => {
            if store.has_recent_external_message(&event.external_message_id, Utc::now() - DUPLICATE_WINDOW).await? {
                return Ok(());
            }
            match resolve_email_reply(store, &from, in_reply_to.as_deref()).await? {
                Some((lead_id, conversation_id)) => {
                    engine
                        .enqueue_handle_reply(lead_id, conversation_id, body, Some(event.external_message_id), received_at)
                        .await
                }
                None => orphan(store, events, Channel::Email, serde_json::json!({ "from": from, "body": body })).await,
            }
        }
    }
}

pub async fn handle_sms_webhook(
    store: &Store,
    engine: &Engine,
    events: &dyn EventHandler,
    event: SmsWebhookEvent,
) -> OverlordResult<()> {
    if let Some(body) = event.body {
        if store.has_recent_external_message(&event.message_sid, Utc::now() - DUPLICATE_WINDOW).await? {
            return Ok(());
        }
        let normalized = normalize_e164(&event.from);
        return match resolve_sms_reply(store, &normalized).await? {
            Some((lead_id, conversation_id)) => {
                engine
                    .enqueue_handle_reply(lead_id, conversation_id, body, Some(event.message_sid), event.received_at)
                    .await
            }
            None => orphan(store, events, Channel::Sms, serde_json::json!({ "from": event.from, "body": body })).await,
        };
    }

    match event.status.as_deref() {
        Some("delivered") => update_status_by_external_id(store, &event.message_sid, CommunicationStatus::Delivered, false).await,
        Some("failed") | Some("undelivered") => {
            mark_carrier_permanent(store, events, &event.message_sid, CommunicationStatus::Failed, "carrier_rejected").await
        }
        _ => {
            tracing::warn!(sid = %event.message_sid, status = ?event.status, "unrecognized sms status webhook");
            Ok(())
        }
    }
}

/// Email reply matching : sender address match against
/// leads' email, tie-broken by `In-Reply-To` when more than one lead
/// shares the address.
async fn resolve_email_reply(
    store: &Store,
    from: &str,
    in_reply_to: Option<&str>,
) -> OverlordResult<Option<(overlord_store::id::LeadId, overlord_store::id::ConversationId)>> {
    if let Some(reference) = in_reply_to {
        if let Some(communication) = store.find_communication_by_external_id(reference).await? {
            return Ok(Some((communication.lead_id, communication.conversation_id)));
        }
    }

    let leads = store.find_leads_by_email(from).await?;
    if leads.len() != 1 {
        // Either nobody has this address, or it's ambiguous without a
        // decisive `In-Reply-To` tie-break — either way, can't match.
        return Ok(None);
    }
    let lead = &leads[0];
    match store.find_active_conversation(lead.id, Channel::Email).await? {
        Some(conversation) => Ok(Some((lead.id, conversation.id))),
        None => Ok(None),
    }
}

/// SMS reply matching : E.164-normalized sender against
/// leads' phone numbers.
async fn resolve_sms_reply(
    store: &Store,
    from_e164: &str,
) -> OverlordResult<Option<(overlord_store::id::LeadId, overlord_store::id::ConversationId)>> {
    let leads = store.find_leads_by_phone(from_e164).await?;
    let Some(lead) = leads.into_iter().next() else { return Ok(None) };
    match store.find_active_conversation(lead.id, Channel::Sms).await? {
        Some(conversation) => Ok(Some((lead.id, conversation.id))),
        None => Ok(None),
    }
}

/// Best-effort E.164 normalization: strips whitespace/punctuation and
/// ensures a leading `+`. Carriers are expected to send E.164 already;
/// this only guards against cosmetic formatting differences.
pub fn normalize_e164(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("+{digits}")
}

async fn update_status_by_external_id(
    store: &Store,
    external_id: &str,
    new_status: CommunicationStatus,
    _reply_event: bool,
) -> OverlordResult<()> {
    if let Some(communication) = store.find_communication_by_external_id(external_id).await? {
        store
            .update_communication_status(communication.id, new_status, None, communication.version)
            .await?;
    }
    Ok(())
}

/// carrier-permanent terminal event: mark the communication terminal, close
/// the conversation, and archive the lead (the "carrier-permanent
/// ... Marks communication terminal; closes conversation where appropriate").
async fn mark_carrier_permanent(
    store: &Store,
    events: &dyn EventHandler,
    external_id: &str,
    new_status: CommunicationStatus,
    reason: &str,
) -> OverlordResult<()> {
    let Some(communication) = store.find_communication_by_external_id(external_id).await? else {
        return Ok(());
    };
    store
        .update_communication_status(communication.id, new_status, None, communication.version)
        .await?;

    let conversation = store.get_conversation(communication.conversation_id).await?;
    if conversation.status != ConversationStatus::Closed {
        store
            .update_conversation_status(conversation.id, ConversationStatus::Closed, conversation.version)
            .await?;
    }
    let lead = store.get_lead(communication.lead_id).await?;
    if !lead.status.is_terminal() {
        store.update_lead_status(lead.id, LeadStatus::Archived, lead.version).await?;
        events
            .on_event(&OverlordEvent::LeadArchived { lead_id: lead.id, reason: reason.to_string() })
            .await;
    }
    Ok(())
}

async fn orphan(store: &Store, events: &dyn EventHandler, channel: Channel, raw_payload: serde_json::Value) -> OverlordResult<()> {
    store.create_orphan_reply(channel, raw_payload).await?;
    events.on_event(&OverlordEvent::ReplyOrphaned { channel }).await;
    Ok(())
}

fn event_kind_label(kind: &EmailEventKind) -> &'static str {
    match kind {
        EmailEventKind::Delivered => "delivered",
        EmailEventKind::Opened => "opened",
        EmailEventKind::Clicked => "clicked",
        EmailEventKind::Bounced => "bounced",
        EmailEventKind::Unsubscribed => "unsubscribed",
        EmailEventKind::Replied { .. } => "replied",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_e164_keeps_leading_plus() {
        assert_eq!(normalize_e164("+1 (555) 123-4567"), "+15551234567");
    }

    #[test]
    fn normalize_e164_adds_missing_plus() {
        assert_eq!(normalize_e164("15551234567"), "+15551234567");
    }
}
