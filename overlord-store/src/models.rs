//! Persisted entity shapes.
//!
//! These mirror the data model for the engagement engine: `Lead`, `Conversation`,
//! `Message`, `Campaign`, `Template`, `Decision`, `Communication`,
//! `HandoverExecution`, `ScheduledStep`, `OrphanReply`, and
//! `CircuitBreakerState`. Every row carries `created_at`, `updated_at`, and
//! (where a compare-and-set update is needed) `version`.

use crate::id::{
    AgentId, CampaignId, CommunicationId, ConversationId, DeadLetterId, HandoverId, LeadId,
    MessageId, TemplateId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Where a [`Lead`] currently sits in its engagement lifecycle.
///
/// Transitions are monotonic except `Engaged <-> Qualified`, which may
/// oscillate until a terminal state is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Engaged,
    Qualified,
    HandedOver,
    Completed,
    Rejected,
    Archived,
}

impl LeadStatus {
    /// Whether this status has no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LeadStatus::HandedOver | LeadStatus::Completed | LeadStatus::Rejected | LeadStatus::Archived
        )
    }
}

/// A prospective contact with at least one reachable identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub source: String,
    pub campaign_id: Option<CampaignId>,
    pub status: LeadStatus,
    /// Unconstrained key/value map for domain-specific extension fields.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Lead {
    /// A minimal, fully-populated `Lead` for unit tests that only care
    /// about a couple of fields (callers override what they need).
    #[cfg(any(test, feature = "test-util"))]
    pub fn new_test_stub() -> Self {
        Self {
            id: LeadId::new(),
            name: "Test Lead".to_string(),
            email: None,
            phone: None,
            source: "web".to_string(),
            campaign_id: None,
            status: LeadStatus::New,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            version: 1,
        }
    }

    /// Whether the lead has any identifier an outbound message can be sent to.
    pub fn is_contactable(&self) -> bool {
        self.email.is_some() || self.phone.is_some()
    }

    /// Which channels are reachable given the lead's identifiers.
    pub fn contactable_channels(&self) -> Vec<Channel> {
        let mut channels = Vec::new();
        if self.email.is_some() {
            channels.push(Channel::Email);
        }
        if self.phone.is_some() {
            channels.push(Channel::Sms);
        }
        channels
    }
}

/// Outbound/inbound channel a [`Conversation`] runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Chat,
}

/// Lifecycle of a [`Conversation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    AwaitingReply,
    Replied,
    Closed,
}

/// Direction of a single [`Message`] within a [`Conversation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A single turn in a [`Conversation`]. Messages are append-only and
/// strictly ordered by `sequence` (no gaps, no reordering).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sequence: i64,
    pub direction: Direction,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub external_id: Option<String>,
    pub metadata: serde_json::Value,
}

/// Exactly one active conversation may exist per `(lead_id, channel)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub lead_id: LeadId,
    pub channel: Channel,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

/// How a [`Campaign`] decides whether replies get templated or AI-composed
/// responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    /// Send templated touches until the first inbound reply, then switch to
    /// AI-generated responses.
    Auto,
    /// Never switch to AI composition; only templated touches are sent.
    TemplateOnly,
    /// Only `ComposeInitial` runs; the lead is not enrolled in the touch
    /// sequence scheduler.
    AiOnly,
}

/// A unit of time used by [`TouchStep::delay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    pub fn to_duration(self, amount: i64) -> chrono::Duration {
        match self {
            DelayUnit::Minutes => chrono::Duration::minutes(amount),
            DelayUnit::Hours => chrono::Duration::hours(amount),
            DelayUnit::Days => chrono::Duration::days(amount),
        }
    }
}

/// One scheduled outbound step in a campaign's touch sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouchStep {
    pub template_id: TemplateId,
    pub delay_amount: i64,
    pub delay_unit: DelayUnit,
    /// Optional condition expressions evaluated against lead/conversation
    /// context before the step fires; an empty set always fires.
    pub conditions: Vec<String>,
}

/// A CRM recipient or webhook/email destination for handover dossiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub name: String,
    pub destination: Destination,
    /// Higher fires first. Ties broken by declaration order.
    pub priority: i32,
}

/// A concrete handover destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    Email { address: String },
    Webhook { url: String, secret: String },
    Crm { endpoint: String, field_mapping: serde_json::Value },
}

/// Qualification/escalation thresholds evaluated by the handover evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoverCriteria {
    pub qualification_score_threshold: f64,
    pub conversation_length_threshold: i64,
    pub time_threshold_seconds: i64,
    pub keyword_triggers: HashSet<String>,
    pub goal_completion_required: HashSet<String>,
    pub handover_recipients: Vec<Recipient>,
}

/// Business-hours / day-of-week / daily-cap constraints applied by the
/// touch sequence scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSettings {
    pub handover_criteria: HandoverCriteria,
    pub start_hour: u8,
    pub end_hour: u8,
    pub allowed_weekdays: HashSet<chrono::Weekday>,
    pub daily_send_cap: Option<u32>,
    pub send_time_optimization: bool,
    pub timezone: String,
}

/// Primary/fallback channel preference consulted by the Overlord agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelPreferences {
    pub primary: Option<Channel>,
    pub fallback: Option<Channel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub agent_id: AgentId,
    pub conversation_mode: ConversationMode,
    pub touch_sequence: Vec<TouchStep>,
    pub channel_preferences: ChannelPreferences,
    pub settings: CampaignSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// A minimal, fully-populated `Campaign` for unit tests exercising
    /// routing/scheduling logic that only inspects a couple of fields.
    #[cfg(any(test, feature = "test-util"))]
    pub fn new_test_stub() -> Self {
        Self {
            id: CampaignId::new(),
            name: "test-campaign".to_string(),
            agent_id: AgentId::new(),
            conversation_mode: ConversationMode::Auto,
            touch_sequence: vec![],
            channel_preferences: ChannelPreferences::default(),
            settings: CampaignSettings {
                handover_criteria: HandoverCriteria {
                    qualification_score_threshold: 7.0,
                    conversation_length_threshold: 10,
                    time_threshold_seconds: 86400,
                    keyword_triggers: Default::default(),
                    goal_completion_required: Default::default(),
                    handover_recipients: vec![],
                },
                start_hour: 0,
                end_hour: 23,
                allowed_weekdays: Default::default(),
                daily_send_cap: None,
                send_time_optimization: false,
                timezone: "UTC".to_string(),
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

/// The four agent kinds in the agent kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Overlord,
    Email,
    Sms,
    Chat,
}

/// Dos/don'ts behavioral constraints folded into generated prompts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentInstructions {
    pub dos: Vec<String>,
    pub donts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: AgentId,
    pub kind: AgentKind,
    pub end_goal: String,
    pub personality: String,
    pub instructions: AgentInstructions,
    pub domain_expertise: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub subject: Option<String>,
    pub body: String,
    pub variables: HashSet<String>,
    pub category: String,
}

/// An immutable audit-log entry. Chained via [`crate::decision_ledger`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: DecisionId,
    pub lead_id: LeadId,
    pub agent_kind: AgentKind,
    pub action: String,
    pub reasoning: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

/// Delivery status of a dispatched [`Communication`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CommunicationStatus {
    Queued,
    Sent,
    Delivered,
    Bounced,
    Failed,
}

impl CommunicationStatus {
    /// A dispatch is considered "already happened" for idempotency purposes
    /// once it has reached `Sent` or `Delivered`.
    pub fn is_dispatched(self) -> bool {
        matches!(self, CommunicationStatus::Sent | CommunicationStatus::Delivered)
    }
}

/// A single outbound dispatch attempt, keyed by a deterministic idempotency
/// key so queue retries never double-send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Communication {
    pub id: CommunicationId,
    pub lead_id: LeadId,
    pub conversation_id: ConversationId,
    pub channel: Channel,
    pub external_id: Option<String>,
    pub status: CommunicationStatus,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

/// Per-destination delivery attempt recorded inside a [`HandoverExecution`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub destination_name: String,
    pub succeeded: bool,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoverExecution {
    pub id: HandoverId,
    pub lead_id: LeadId,
    pub conversation_id: ConversationId,
    pub reason: String,
    pub dossier: serde_json::Value,
    pub attempts: Vec<Attempt>,
    pub created_at: DateTime<Utc>,
    /// Set once `POST /webhooks/handover/confirmation` acknowledges receipt.
    pub confirmed_at: Option<DateTime<Utc>>,
    /// When the follow-up re-check should fire if still unconfirmed.
    pub follow_up_at: Option<DateTime<Utc>>,
    /// Whether the one allowed follow-up nudge has already been sent.
    pub follow_up_sent: bool,
}

/// Scheduler-owned next-fire state for a lead enrolled in a campaign's
/// touch sequence. Keyed by `(lead_id, campaign_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledStep {
    pub lead_id: LeadId,
    pub campaign_id: CampaignId,
    pub current_index: i64,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub canceled: bool,
    pub version: i64,
}

/// An inbound message that could not be matched to any lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanReply {
    pub id: MessageId,
    pub channel: Channel,
    pub raw_payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Shared circuit breaker state for a single named external service, so
/// multiple worker processes observe the same open/half-open/closed
/// decision. See `overlord::resilience::circuit_breaker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub service: String,
    pub consecutive_failures: i64,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_successes: i64,
    pub updated_at: DateTime<Utc>,
}

/// A job that exhausted its retry budget, persisted for operator
/// inspection. See `overlord::resilience::job_queue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: DeadLetterId,
    pub job_type: String,
    pub lead_id: Option<LeadId>,
    pub payload: serde_json::Value,
    pub attempts_made: i64,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}
