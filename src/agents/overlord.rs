//! The Overlord agent: routing-decision logic.
//!
//! A stateless function over `(lead, campaign)` — no session, no mutable
//! per-agent state, constructed fresh per call.

use crate::model::{AgentKind as ModelAgentKind, DecisionType, ModelRouter, RouterError, RouterRequest};
use overlord_store::models::{Campaign, Channel, Lead};

/// Closed decision variant, replacing the source's loosely-typed JSON
/// output per the "Duck-typed decisions" — downstream code
/// cannot branch on an undefined field because there are no undefined
/// fields to branch on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlordDecision {
    AssignChannel { channel: Channel, focus: String },
    Skip { reason: String },
    ManualReview { reason: String },
}

pub struct OverlordOutcome {
    pub decision: OverlordDecision,
    pub reasoning: String,
    /// `None` when the deterministic fallback was used (model unavailable
    /// or router exhausted) rather than an actual model call.
    pub router_outcome: Option<crate::model::RouterOutcome>,
}

/// Stateless routing agent. Zero fields: every call is independent.
pub struct OverlordAgent;

impl OverlordAgent {
    /// Decide which channel (if any) to engage `lead` on for `campaign`.
    ///
    /// Consults, in order: lead contactability, the campaign's
    /// `conversation_mode` (forces channel policy for non-`auto` modes is
    /// *not* the case here — mode affects touch scheduling, not channel
    /// choice), the campaign's primary/fallback channel preference, and
    /// source heuristics. When `router` is `None` or every model call in
    /// it fails, falls back to a deterministic channel-preference rule.
    pub async fn decide(lead: &Lead, campaign: &Campaign, router: Option<&ModelRouter>) -> OverlordOutcome {
        let contactable = lead.contactable_channels();
        if contactable.is_empty() {
            return OverlordOutcome {
                decision: OverlordDecision::Skip { reason: "lead has no usable channel".to_string() },
                reasoning: "no email or phone on file".to_string(),
                router_outcome: None,
            };
        }

        if let Some(router) = router {
            let prompt = format!(
                "Lead {name} (source: {source}) is contactable via {channels:?}. Campaign {campaign} prefers {primary:?} with fallback {fallback:?}. \
                 Decide the initial engagement channel and a one-sentence focus for the opening message. \
                 Respond as JSON: {{\"action\": \"assign_channel|skip|manual_review\", \"channel\": \"email|sms|chat\"|null, \"focus\": \"...\", \"reasoning\": \"...\"}}",
                name = lead.name,
                source = lead.source,
                channels = contactable,
                campaign = campaign.name,
                primary = campaign.channel_preferences.primary,
                fallback = campaign.channel_preferences.fallback,
            );

            let request = RouterRequest {
                prompt,
                system_prompt: Some("You are the routing controller for an outbound lead-engagement system.".to_string()),
                agent_kind: ModelAgentKind::Overlord,
                decision_type: DecisionType::Routing,
                conversation_history: vec![],
                requires_reasoning: false,
                business_critical: false,
                response_format: Some(crate::model::ResponseFormat::Json {
                    schema: serde_json::json!({"action": "string", "channel": "string?", "focus": "string", "reasoning": "string"}),
                    depth: 1,
                }),
                temperature: 0.3,
                max_tokens: Some(300),
                response_validator: Some({
                    let contactable = contactable.clone();
                    std::sync::Arc::new(move |content: &str| parse_model_decision(content, &contactable).is_some())
                }),
            };

            match router.route(request).await {
                Ok((response, outcome)) => {
                    if let Some(decision) = parse_model_decision(&response.content, &contactable) {
                        return OverlordOutcome {
                            reasoning: decision.1.clone(),
                            decision: decision.0,
                            router_outcome: Some(outcome),
                        };
                    }
                    tracing::warn!("overlord model response did not parse as a decision, falling back to deterministic rule");
                }
                Err(RouterError::BreakerOpen) => {
                    tracing::info!("model provider breaker open, overlord using deterministic fallback");
                }
                Err(RouterError::Exhausted(err)) => {
                    tracing::warn!(%err, "overlord router exhausted, using deterministic fallback");
                }
            }
        }

        deterministic_fallback(lead, campaign, &contactable)
    }
}

fn parse_model_decision(content: &str, contactable: &[Channel]) -> Option<(OverlordDecision, String)> {
    let parsed: serde_json::Value = serde_json::from_str(content).ok()?;
    let action = parsed.get("action")?.as_str()?;
    let reasoning = parsed.get("reasoning").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    match action {
        "assign_channel" => {
            let channel = parse_channel(parsed.get("channel")?.as_str()?)?;
            if !contactable.contains(&channel) {
                return None;
            }
            let focus = parsed.get("focus").and_then(|v| v.as_str()).unwrap_or("general introduction").to_string();
            Some((OverlordDecision::AssignChannel { channel, focus }, reasoning))
        }
        "skip" => Some((OverlordDecision::Skip { reason: reasoning.clone() }, reasoning)),
        "manual_review" => Some((OverlordDecision::ManualReview { reason: reasoning.clone() }, reasoning)),
        _ => None,
    }
}

fn parse_channel(s: &str) -> Option<Channel> {
    match s.to_lowercase().as_str() {
        "email" => Some(Channel::Email),
        "sms" => Some(Channel::Sms),
        "chat" => Some(Channel::Chat),
        _ => None,
    }
}

/// Deterministic rule applied when model inference is unavailable: primary
/// preference if contactable, else first fallback, else manual review.
fn deterministic_fallback(_lead: &Lead, campaign: &Campaign, contactable: &[Channel]) -> OverlordOutcome {
    let prefs = &campaign.channel_preferences;
    let pick = prefs
        .primary
        .filter(|c| contactable.contains(c))
        .or_else(|| prefs.fallback.filter(|c| contactable.contains(c)))
        .or_else(|| contactable.first().copied());

    let decision = match pick {
        Some(channel) => OverlordDecision::AssignChannel { channel, focus: "general introduction".to_string() },
        None => OverlordDecision::ManualReview { reason: "no contactable channel matches campaign preferences".to_string() },
    };
    let reasoning = "deterministic fallback: primary preference, else first fallback, else manual review".to_string();
    OverlordOutcome { decision, reasoning, router_outcome: None }
}

/// Applies when Overlord fails after the router exhausts fallbacks
/// (the `Routing -> Sending` transition): email if present, else
/// sms if present, else archive.
pub fn engine_level_fallback(lead: &Lead) -> Option<Channel> {
    if lead.email.is_some() {
        Some(Channel::Email)
    } else if lead.phone.is_some() {
        Some(Channel::Sms)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlord_store::models::{AgentId, CampaignSettings, ChannelPreferences, ConversationMode, HandoverCriteria, LeadStatus};

    fn lead_with(email: Option<&str>, phone: Option<&str>) -> Lead {
        Lead {
            id: overlord_store::id::LeadId::new(),
            name: "Test Lead".to_string(),
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            source: "web".to_string(),
            campaign_id: None,
            status: LeadStatus::New,
            metadata: serde_json::json!({}),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            version: 1,
        }
    }

    fn campaign_with(primary: Option<Channel>, fallback: Option<Channel>) -> Campaign {
        Campaign {
            id: overlord_store::id::CampaignId::new(),
            name: "saas-demo".to_string(),
            agent_id: AgentId::new(),
            conversation_mode: ConversationMode::Auto,
            touch_sequence: vec![],
            channel_preferences: ChannelPreferences { primary, fallback },
            settings: CampaignSettings {
                handover_criteria: HandoverCriteria {
                    qualification_score_threshold: 7.0,
                    conversation_length_threshold: 10,
                    time_threshold_seconds: 86400,
                    keyword_triggers: Default::default(),
                    goal_completion_required: Default::default(),
                    handover_recipients: vec![],
                },
                start_hour: 8,
                end_hour: 18,
                allowed_weekdays: Default::default(),
                daily_send_cap: None,
                send_time_optimization: false,
                timezone: "UTC".to_string(),
            },
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn lead_without_contact_is_skipped() {
        let lead = lead_with(None, None);
        let campaign = campaign_with(Some(Channel::Email), None);
        let outcome = OverlordAgent::decide(&lead, &campaign, None).await;
        assert!(matches!(outcome.decision, OverlordDecision::Skip { .. }));
    }

    #[tokio::test]
    async fn email_only_lead_never_routed_to_sms() {
        let lead = lead_with(Some("a@b.com"), None);
        let campaign = campaign_with(Some(Channel::Sms), None);
        let outcome = OverlordAgent::decide(&lead, &campaign, None).await;
        match outcome.decision {
            OverlordDecision::AssignChannel { channel, .. } => assert_eq!(channel, Channel::Email),
            other => panic!("expected assign_channel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deterministic_fallback_prefers_primary_then_fallback() {
        let lead = lead_with(Some("a@b.com"), Some("+15551234567"));
        let campaign = campaign_with(Some(Channel::Sms), Some(Channel::Email));
        let outcome = OverlordAgent::decide(&lead, &campaign, None).await;
        match outcome.decision {
            OverlordDecision::AssignChannel { channel, .. } => assert_eq!(channel, Channel::Sms),
            other => panic!("expected assign_channel, got {other:?}"),
        }
    }

    #[test]
    fn engine_fallback_prefers_email_over_sms() {
        let lead = lead_with(Some("a@b.com"), Some("+15551234567"));
        assert_eq!(engine_level_fallback(&lead), Some(Channel::Email));
    }
}
