//! Handover Evaluator: per-message qualification criteria,
//! dossier construction, and per-destination fan-out dispatch.

use crate::agents::SignalEvaluation;
use crate::carriers::{Carrier, OutboundEnvelope};
use crate::resilience::circuit_breaker::{BreakerConfig, CircuitBreakerRegistry, GuardError};
use overlord_store::id::{ConversationId, LeadId};
use overlord_store::models::{Attempt, Destination, Direction, HandoverCriteria, Lead, Message, Recipient};
use overlord_store::Store;
use std::collections::HashSet;
use std::sync::Arc;

pub const WEBHOOK_DESTINATION_SERVICE_PREFIX: &str = "handover-webhook";

/// Which single criterion tripped the handover, out of five possible
/// triggers; any one trips it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerReason {
    QualificationScore,
    ConversationLength,
    TimeThreshold,
    KeywordTrigger(String),
    GoalCompletion,
}

impl TriggerReason {
    fn label(&self) -> String {
        match self {
            TriggerReason::QualificationScore => "qualification_score".to_string(),
            TriggerReason::ConversationLength => "conversation_length".to_string(),
            TriggerReason::TimeThreshold => "time_threshold".to_string(),
            TriggerReason::KeywordTrigger(kw) => format!("keyword_trigger:{kw}"),
            TriggerReason::GoalCompletion => "goal_completion".to_string(),
        }
    }
}

/// Evaluate `criteria` against the current conversation state. Returns every
/// criterion that tripped, which the dossier carries as `criteriaTripped`,
/// or `None` if nothing did.
pub fn evaluate(
    criteria: &HandoverCriteria,
    messages: &[Message],
    conversation_started_at: chrono::DateTime<chrono::Utc>,
    signals: &SignalEvaluation,
    completed_goals: &HashSet<String>,
) -> Vec<TriggerReason> {
    let mut tripped = Vec::new();

    if signals.qualification_score >= criteria.qualification_score_threshold {
        tripped.push(TriggerReason::QualificationScore);
    }
    if messages.len() as i64 >= criteria.conversation_length_threshold {
        tripped.push(TriggerReason::ConversationLength);
    }
    let elapsed = (chrono::Utc::now() - conversation_started_at).num_seconds();
    if elapsed >= criteria.time_threshold_seconds {
        tripped.push(TriggerReason::TimeThreshold);
    }
    if let Some(latest_inbound) = messages.iter().rev().find(|m| m.direction == Direction::Inbound) {
        let lowered = latest_inbound.content.to_lowercase();
        let words: HashSet<&str> = lowered.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()).collect();
        for keyword in &criteria.keyword_triggers {
            if words.contains(keyword.to_lowercase().as_str()) {
                tripped.push(TriggerReason::KeywordTrigger(keyword.clone()));
            }
        }
    }
    if !criteria.goal_completion_required.is_empty() {
        let achieved: HashSet<String> = signals.buying_signals.union(completed_goals).cloned().collect();
        if criteria.goal_completion_required.iter().all(|goal| achieved.contains(goal)) {
            tripped.push(TriggerReason::GoalCompletion);
        }
    }

    tripped
}

/// Structured handover payload. Round-trips through
/// `serde_json::Value` (the store's `dossier` column) so a queued fan-out
/// job or a delayed follow-up can reconstruct it without re-deriving it
/// from the conversation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Dossier {
    pub context: String,
    pub lead_snapshot: LeadSnapshot,
    pub communication_summary: CommunicationSummary,
    pub profile_analysis: ProfileAnalysis,
    pub trigger: TriggerSummary,
    pub recommended_actions: RecommendedActions,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LeadSnapshot {
    pub name: String,
    pub contact: String,
    pub origin: String,
    pub timing: String,
    pub interests: Vec<String>,
    pub notes: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommunicationSummary {
    pub highlights: Vec<String>,
    pub tone: String,
    pub engagement_pattern: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProfileAnalysis {
    pub buyer_type: String,
    pub key_hooks: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TriggerSummary {
    pub reason: String,
    pub score: f64,
    pub urgency: String,
    pub criteria_tripped: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RecommendedActions {
    pub approach: String,
    pub timeline: String,
    pub urgent_actions: Vec<String>,
}

/// Build the dossier handed to every configured destination.
pub fn build_dossier(lead: &Lead, messages: &[Message], signals: &SignalEvaluation, tripped: &[TriggerReason]) -> Dossier {
    let highlights: Vec<String> = messages
        .iter()
        .filter(|m| m.direction == Direction::Inbound)
        .rev()
        .take(3)
        .map(|m| m.content.clone())
        .collect();

    let urgency = if signals.qualification_score >= 8.0 { "high" } else if signals.qualification_score >= 5.0 { "medium" } else { "low" };

    Dossier {
        context: format!("Lead {} from {} reached handover criteria", lead.name, lead.source),
        lead_snapshot: LeadSnapshot {
            name: lead.name.clone(),
            contact: lead.email.clone().or_else(|| lead.phone.clone()).unwrap_or_default(),
            origin: lead.source.clone(),
            timing: lead.created_at.to_rfc3339(),
            interests: signals.buying_signals.iter().cloned().collect(),
            notes: format!("{} messages exchanged", messages.len()),
        },
        communication_summary: CommunicationSummary {
            highlights,
            tone: format!("{:?}", signals.sentiment).to_lowercase(),
            engagement_pattern: format!("{} inbound replies", messages.iter().filter(|m| m.direction == Direction::Inbound).count()),
        },
        profile_analysis: ProfileAnalysis {
            buyer_type: if signals.buying_signals.contains("pricing_inquiry") { "price-sensitive".to_string() } else { "exploratory".to_string() },
            key_hooks: signals.keywords_hit.iter().cloned().collect(),
        },
        trigger: TriggerSummary {
            reason: tripped.first().map(|t| t.label()).unwrap_or_default(),
            score: signals.qualification_score,
            urgency: urgency.to_string(),
            criteria_tripped: tripped.iter().map(TriggerReason::label).collect(),
        },
        recommended_actions: RecommendedActions {
            approach: "Personalized follow-up referencing their stated interest".to_string(),
            timeline: "within 1 business day".to_string(),
            urgent_actions: if urgency == "high" { vec!["Contact within the hour".to_string()] } else { vec![] },
        },
    }
}

/// Per-destination dossier delivery, each independently circuit-breaker
/// guarded so one failing destination never blocks the others.
pub struct HandoverDispatcher {
    store: Store,
    breakers: CircuitBreakerRegistry,
    http: reqwest::Client,
    /// The same per-channel carrier the engine dispatches ordinary outbound
    /// touches through — a trait object, so the dispatcher never needs to
    /// know whether it's SMTP, a vendor API, or (no credentials configured)
    /// the logging carrier.
    email_carrier: Arc<dyn Carrier>,
}

impl HandoverDispatcher {
    pub fn new(store: Store, breakers: CircuitBreakerRegistry, email_carrier: Arc<dyn Carrier>) -> Self {
        Self { store, breakers, http: reqwest::Client::new(), email_carrier }
    }

    /// Dispatch `dossier` to every recipient, ordered high-priority first.
    /// Per-destination failures are recorded but never abort the loop —
    /// partial failures during fan-out surface per-destination status
    /// without blocking other destinations.
    pub async fn fan_out(
        &self,
        handover_id: overlord_store::id::HandoverId,
        lead_id: LeadId,
        conversation_id: ConversationId,
        recipients: &[Recipient],
        dossier: &Dossier,
    ) -> Vec<Attempt> {
        let mut ordered: Vec<&Recipient> = recipients.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut attempts = Vec::new();
        for recipient in ordered {
            let attempt = self.dispatch_one(lead_id, conversation_id, recipient, dossier).await;
            let _ = self.store.record_handover_attempt(handover_id, attempt.clone()).await;
            attempts.push(attempt);
        }
        attempts
    }

    async fn dispatch_one(&self, lead_id: LeadId, conversation_id: ConversationId, recipient: &Recipient, dossier: &Dossier) -> Attempt {
        let service = match &recipient.destination {
            Destination::Email { .. } => "handover-email".to_string(),
            Destination::Webhook { .. } => format!("{WEBHOOK_DESTINATION_SERVICE_PREFIX}-{}", recipient.name),
            Destination::Crm { .. } => "handover-crm".to_string(),
        };

        let config = BreakerConfig::default();
        let result = self
            .breakers
            .guard(&service, &config, || self.send_to_destination(lead_id, conversation_id, &recipient.destination, dossier))
            .await;

        match result {
            Ok(()) => Attempt { destination_name: recipient.name.clone(), succeeded: true, error: None, attempted_at: chrono::Utc::now() },
            Err(err) => Attempt { destination_name: recipient.name.clone(), succeeded: false, error: Some(err.to_string()), attempted_at: chrono::Utc::now() },
        }
    }

    async fn send_to_destination(
        &self,
        lead_id: LeadId,
        conversation_id: ConversationId,
        destination: &Destination,
        dossier: &Dossier,
    ) -> Result<(), DestinationError> {
        match destination {
            Destination::Email { address } => {
                let envelope = OutboundEnvelope {
                    lead_id,
                    conversation_id,
                    to: address.clone(),
                    subject: Some(format!("Handover: {}", dossier.context)),
                    body: render_dossier_text(dossier),
                };
                self.email_carrier.send(envelope).await.map_err(|e| DestinationError(e.to_string()))?;
                Ok(())
            }
            Destination::Webhook { url, secret } => {
                let body = serde_json::to_vec(dossier).map_err(|e| DestinationError(e.to_string()))?;
                let signature = sign_payload(secret, &body);
                self.http
                    .post(url)
                    .header("X-Signature", signature)
                    .header("Content-Type", "application/json")
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| DestinationError(e.to_string()))?
                    .error_for_status()
                    .map_err(|e| DestinationError(e.to_string()))?;
                Ok(())
            }
            Destination::Crm { endpoint, field_mapping } => {
                let dossier_value = serde_json::to_value(dossier).map_err(|e| DestinationError(e.to_string()))?;
                let payload = resolve_field_mapping(field_mapping, &dossier_value);
                self.http
                    .post(endpoint)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|e| DestinationError(e.to_string()))?
                    .error_for_status()
                    .map_err(|e| DestinationError(e.to_string()))?;
                Ok(())
            }
        }
    }
}

/// Plain-text rendering of the dossier for the email destination.
/// `SmtpEmailCarrier` turns this into a multipart HTML+text body the same
/// way it does for ordinary outbound touches.
fn render_dossier_text(dossier: &Dossier) -> String {
    format!(
        "{context}\n\nLead: {name} ({contact})\nOrigin: {origin}\nNotes: {notes}\n\nTrigger: {reason} (score {score}, urgency {urgency})\n\nRecommended approach: {approach}\nTimeline: {timeline}",
        context = dossier.context,
        name = dossier.lead_snapshot.name,
        contact = dossier.lead_snapshot.contact,
        origin = dossier.lead_snapshot.origin,
        notes = dossier.lead_snapshot.notes,
        reason = dossier.trigger.reason,
        score = dossier.trigger.score,
        urgency = dossier.trigger.urgency,
        approach = dossier.recommended_actions.approach,
        timeline = dossier.recommended_actions.timeline,
    )
}

/// Resolves a CRM destination's `field_mapping` descriptor against the
/// dossier at send time: each mapping value is a dotted path into the
/// serialized dossier (e.g. `"trigger.score"`); anything that isn't a
/// string path is sent through as a literal constant.
fn resolve_field_mapping(mapping: &serde_json::Value, dossier: &serde_json::Value) -> serde_json::Value {
    let mut resolved = serde_json::Map::new();
    if let Some(fields) = mapping.as_object() {
        for (crm_field, source) in fields {
            let value = match source.as_str() {
                Some(path) => lookup_dossier_path(dossier, path).unwrap_or(serde_json::Value::Null),
                None => source.clone(),
            };
            resolved.insert(crm_field.clone(), value);
        }
    }
    serde_json::Value::Object(resolved)
}

fn lookup_dossier_path(root: &serde_json::Value, dotted_path: &str) -> Option<serde_json::Value> {
    let pointer = format!("/{}", dotted_path.replace('.', "/"));
    root.pointer(&pointer).cloned()
}

/// Genuine HMAC-SHA256 over the dossier body, keyed on the destination's
/// configured secret.
fn sign_payload(secret: &str, body: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256={hex}")
}

#[derive(Debug, thiserror::Error)]
#[error("destination delivery failed: {0}")]
struct DestinationError(String);

impl From<GuardError<DestinationError>> for crate::error::OverlordError {
    fn from(err: GuardError<DestinationError>) -> Self {
        match err {
            GuardError::Open(e) => crate::error::OverlordError::BreakerOpen { service: e.service },
            GuardError::Timeout => crate::error::OverlordError::CarrierTransient { channel: "handover".to_string(), message: "timeout".to_string() },
            GuardError::Call(e) => crate::error::OverlordError::CarrierTransient { channel: "handover".to_string(), message: e.to_string() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn msg(direction: Direction, content: &str) -> Message {
        Message {
            id: overlord_store::id::MessageId::new(),
            conversation_id: overlord_store::id::ConversationId::new(),
            sequence: 0,
            direction,
            content: content.to_string(),
            timestamp: chrono::Utc::now(),
            external_id: None,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn keyword_trigger_is_whole_word_case_insensitive() {
        let criteria = HandoverCriteria {
            qualification_score_threshold: 100.0,
            conversation_length_threshold: 1000,
            time_threshold_seconds: i64::MAX,
            keyword_triggers: ["demo".to_string()].into_iter().collect(),
            goal_completion_required: HashSet::new(),
            handover_recipients: vec![],
        };
        let messages = vec![msg(Direction::Inbound, "Can we schedule a DEMO next week?")];
        let signals = crate::agents::SignalEvaluation {
            qualification_score: 0.0,
            sentiment: crate::agents::Sentiment::Neutral,
            buying_signals: HashSet::new(),
            keywords_hit: HashSet::new(),
        };
        let tripped = evaluate(&criteria, &messages, chrono::Utc::now(), &signals, &HashSet::new());
        assert!(tripped.contains(&TriggerReason::KeywordTrigger("demo".to_string())));
    }

    #[test]
    fn single_condition_is_sufficient() {
        let criteria = HandoverCriteria {
            qualification_score_threshold: 5.0,
            conversation_length_threshold: 1000,
            time_threshold_seconds: i64::MAX,
            keyword_triggers: HashSet::new(),
            goal_completion_required: HashSet::new(),
            handover_recipients: vec![],
        };
        let signals = crate::agents::SignalEvaluation {
            qualification_score: 9.0,
            sentiment: crate::agents::Sentiment::Positive,
            buying_signals: HashSet::new(),
            keywords_hit: HashSet::new(),
        };
        let tripped = evaluate(&criteria, &[], chrono::Utc::now(), &signals, &HashSet::new());
        assert_eq!(tripped, vec![TriggerReason::QualificationScore]);
    }
}
