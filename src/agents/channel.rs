//! Per-channel agents : email, sms, chat. Each composes
//! outbound messages and evaluates conversation signals; none holds
//! mutable state between calls.

use crate::agents::templates;
use crate::model::{AgentKind as ModelAgentKind, DecisionType, ModelRouter, ResponseFormat, Role, RouterRequest};
use async_trait::async_trait;
use overlord_store::models::{AgentDefinition, Campaign, Channel, Conversation, Direction, Lead, Message, Template};
use std::collections::HashSet;

/// A composed outbound message body, ready for the carrier adapter.
#[derive(Debug, Clone)]
pub struct ComposedMessage {
    pub subject: Option<String>,
    pub body: String,
}

/// Why a channel agent declined to produce a message ("agents may refuse
/// with `cannot_continue`").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRefusal {
    ContentPolicy(String),
    OptOutDetected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

/// Output of `EvaluateSignals`.
#[derive(Debug, Clone)]
pub struct SignalEvaluation {
    pub qualification_score: f64,
    pub sentiment: Sentiment,
    pub buying_signals: HashSet<String>,
    pub keywords_hit: HashSet<String>,
}

/// Everything an agent needs to compose or evaluate, bundled so call sites
/// don't pass five positional arguments.
pub struct AgentContext<'a> {
    pub lead: &'a Lead,
    pub campaign: &'a Campaign,
    pub conversation: &'a Conversation,
    pub agent_definition: &'a AgentDefinition,
}

const OPT_OUT_KEYWORDS: &[&str] = &["stop", "unsubscribe", "cancel"];
const OPT_OUT_SCAN_WINDOW: usize = 40;

/// Whole-word, case-insensitive match of any opt-out keyword within the
/// first [`OPT_OUT_SCAN_WINDOW`] characters of `reply`.
pub fn is_opt_out(reply: &str) -> bool {
    let window: String = reply.chars().take(OPT_OUT_SCAN_WINDOW).collect();
    let lowered = window.to_lowercase();
    let words: HashSet<&str> = lowered.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()).collect();
    OPT_OUT_KEYWORDS.iter().any(|kw| words.contains(kw))
}

#[async_trait]
pub trait ChannelAgentKernel: Send + Sync {
    fn channel(&self) -> Channel;
    fn model_kind(&self) -> ModelAgentKind;

    async fn compose_initial(
        &self,
        ctx: &AgentContext<'_>,
        focus: &str,
        template: Option<&Template>,
        router: Option<&ModelRouter>,
    ) -> Result<(ComposedMessage, Option<crate::model::RouterOutcome>), AgentRefusal> {
        if let Some(template) = template {
            let tctx = templates::build_context(ctx.lead, Some(ctx.campaign), Some(ctx.conversation));
            return Ok((
                ComposedMessage { subject: template.subject.as_ref().map(|s| templates::render(s, &tctx)), body: templates::render(&template.body, &tctx) },
                None,
            ));
        }

        let Some(router) = router else {
            return Ok((
                ComposedMessage {
                    subject: default_subject(self.channel()),
                    body: format!("Hi {}, reaching out about {}.", ctx.lead.name, focus),
                },
                None,
            ));
        };

        let prompt = format!(
            "Compose an opening outbound {channel:?} message to {name} (source: {source}). Focus: {focus}. \
             Agent persona: {personality}. End goal: {goal}. Domain expertise: {expertise}. \
             Dos: {dos:?}. Don'ts: {donts:?}. Keep it concise and natural.",
            channel = self.channel(),
            name = ctx.lead.name,
            source = ctx.lead.source,
            focus = focus,
            personality = ctx.agent_definition.personality,
            goal = ctx.agent_definition.end_goal,
            expertise = ctx.agent_definition.domain_expertise,
            dos = ctx.agent_definition.instructions.dos,
            donts = ctx.agent_definition.instructions.donts,
        );

        let request = RouterRequest {
            prompt,
            system_prompt: Some(format!("You are a {:?} outreach agent.", self.channel())),
            agent_kind: self.model_kind(),
            decision_type: DecisionType::Generation,
            conversation_history: vec![],
            requires_reasoning: false,
            business_critical: false,
            response_format: Some(ResponseFormat::PlainText),
            temperature: 0.7,
            max_tokens: Some(400),
            response_validator: None,
        };

        match router.route(request).await {
            Ok((response, outcome)) => Ok((ComposedMessage { subject: default_subject(self.channel()), body: response.content }, Some(outcome))),
            Err(_) => Ok((
                ComposedMessage {
                    subject: default_subject(self.channel()),
                    body: format!("Hi {}, reaching out about {}.", ctx.lead.name, focus),
                },
                None,
            )),
        }
    }

    async fn compose_reply(
        &self,
        ctx: &AgentContext<'_>,
        history: &[Message],
        incoming: &str,
        router: Option<&ModelRouter>,
    ) -> Result<(ComposedMessage, Option<crate::model::RouterOutcome>), AgentRefusal> {
        if is_opt_out(incoming) {
            return Err(AgentRefusal::OptOutDetected);
        }

        let Some(router) = router else {
            return Ok((
                ComposedMessage { subject: None, body: "Thanks for the reply — someone from our team will follow up shortly.".to_string() },
                None,
            ));
        };

        let conversation_history: Vec<(Role, String)> = history
            .iter()
            .map(|m| (if m.direction == Direction::Inbound { Role::User } else { Role::Assistant }, m.content.clone()))
            .collect();

        let prompt = format!(
            "Continue this {channel:?} conversation with {name}. Their latest message: \"{incoming}\". \
             Persona: {personality}. End goal: {goal}.",
            channel = self.channel(),
            name = ctx.lead.name,
            incoming = incoming,
            personality = ctx.agent_definition.personality,
            goal = ctx.agent_definition.end_goal,
        );

        let request = RouterRequest {
            prompt,
            system_prompt: Some(format!("You are a {:?} outreach agent replying to an inbound message.", self.channel())),
            agent_kind: self.model_kind(),
            decision_type: DecisionType::Conversation,
            conversation_history,
            requires_reasoning: false,
            business_critical: false,
            response_format: Some(ResponseFormat::PlainText),
            temperature: 0.7,
            max_tokens: Some(400),
            response_validator: None,
        };

        match router.route(request).await {
            Ok((response, outcome)) => Ok((ComposedMessage { subject: None, body: response.content }, Some(outcome))),
            Err(_) => Ok((
                ComposedMessage { subject: None, body: "Thanks for the reply — someone from our team will follow up shortly.".to_string() },
                None,
            )),
        }
    }

    /// Heuristic signal extraction, used when no router is configured and
    /// as the basis every concrete agent shares; callers wanting
    /// model-driven evaluation should prefer [`evaluate_signals_with_router`].
    fn evaluate_signals(&self, messages: &[Message]) -> SignalEvaluation {
        let mut keywords_hit = HashSet::new();
        let mut buying_signals = HashSet::new();
        let mut score = 0.0_f64;

        for message in messages.iter().filter(|m| m.direction == Direction::Inbound) {
            let lowered = message.content.to_lowercase();
            for kw in ["pricing", "price", "cost", "budget"] {
                if lowered.contains(kw) {
                    keywords_hit.insert(kw.to_string());
                    buying_signals.insert("pricing_inquiry".to_string());
                    score += 2.0;
                }
            }
            for kw in ["demo", "trial", "call", "meeting"] {
                if lowered.contains(kw) {
                    keywords_hit.insert(kw.to_string());
                    buying_signals.insert("scheduling_intent".to_string());
                    score += 1.5;
                }
            }
            if lowered.contains("not interested") || lowered.contains("no thanks") {
                score -= 2.0;
            }
        }

        let inbound_count = messages.iter().filter(|m| m.direction == Direction::Inbound).count();
        score += (inbound_count as f64) * 0.5;

        let sentiment = if score >= 3.0 {
            Sentiment::Positive
        } else if score <= -1.0 {
            Sentiment::Negative
        } else {
            Sentiment::Neutral
        };

        SignalEvaluation { qualification_score: score.clamp(0.0, 10.0), sentiment, buying_signals, keywords_hit }
    }
}

fn default_subject(channel: Channel) -> Option<String> {
    match channel {
        Channel::Email => Some("Quick question".to_string()),
        Channel::Sms | Channel::Chat => None,
    }
}

/// Model-driven signal evaluation; falls back to the heuristic when the
/// router is unavailable or the response doesn't parse as the expected
/// JSON shape.
pub async fn evaluate_signals_with_router(
    agent: &dyn ChannelAgentKernel,
    messages: &[Message],
    router: Option<&ModelRouter>,
) -> SignalEvaluation {
    let heuristic = agent.evaluate_signals(messages);
    let Some(router) = router else { return heuristic };

    let transcript: String = messages
        .iter()
        .map(|m| format!("{:?}: {}", m.direction, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    let request = RouterRequest {
        prompt: format!(
            "Evaluate this conversation transcript for sales qualification. Respond as JSON: \
             {{\"qualification_score\": 0-10, \"sentiment\": \"positive|neutral|negative\", \"buying_signals\": [...], \"keywords_hit\": [...]}}\n\n{transcript}"
        ),
        system_prompt: Some("You are a conversation qualification evaluator.".to_string()),
        agent_kind: agent.model_kind(),
        decision_type: DecisionType::Qualification,
        conversation_history: vec![],
        requires_reasoning: true,
        business_critical: true,
        response_format: Some(ResponseFormat::Json { schema: serde_json::json!({}), depth: 1 }),
        temperature: 0.2,
        max_tokens: Some(300),
        response_validator: Some(std::sync::Arc::new(|content: &str| parse_evaluation(content).is_some())),
    };

    match router.route(request).await {
        Ok((response, _)) => parse_evaluation(&response.content).unwrap_or(heuristic),
        Err(_) => heuristic,
    }
}

fn parse_evaluation(content: &str) -> Option<SignalEvaluation> {
    let parsed: serde_json::Value = serde_json::from_str(content).ok()?;
    let qualification_score = parsed.get("qualification_score")?.as_f64()?;
    let sentiment = match parsed.get("sentiment")?.as_str()? {
        "positive" => Sentiment::Positive,
        "negative" => Sentiment::Negative,
        _ => Sentiment::Neutral,
    };
    let buying_signals = parsed.get("buying_signals")?.as_array()?.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
    let keywords_hit = parsed.get("keywords_hit")?.as_array()?.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
    Some(SignalEvaluation { qualification_score, sentiment, buying_signals, keywords_hit })
}

pub struct EmailAgent;
#[async_trait]
impl ChannelAgentKernel for EmailAgent {
    fn channel(&self) -> Channel {
        Channel::Email
    }
    fn model_kind(&self) -> ModelAgentKind {
        ModelAgentKind::Email
    }
}

pub struct SmsAgent;
#[async_trait]
impl ChannelAgentKernel for SmsAgent {
    fn channel(&self) -> Channel {
        Channel::Sms
    }
    fn model_kind(&self) -> ModelAgentKind {
        ModelAgentKind::Sms
    }
}

pub struct ChatAgent;
#[async_trait]
impl ChannelAgentKernel for ChatAgent {
    fn channel(&self) -> Channel {
        Channel::Chat
    }
    fn model_kind(&self) -> ModelAgentKind {
        ModelAgentKind::Chat
    }
}

/// Resolve the concrete agent kernel for a channel.
pub fn agent_for_channel(channel: Channel) -> Box<dyn ChannelAgentKernel> {
    match channel {
        Channel::Email => Box::new(EmailAgent),
        Channel::Sms => Box::new(SmsAgent),
        Channel::Chat => Box::new(ChatAgent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opt_out_matches_whole_word_case_insensitive() {
        assert!(is_opt_out("STOP"));
        assert!(is_opt_out("please Unsubscribe me"));
        assert!(is_opt_out("cancel this"));
        assert!(!is_opt_out("I'd like to stoppage this inquiry"));
        assert!(!is_opt_out("this is not a cancellation"));
    }

    #[test]
    fn opt_out_only_scans_first_window() {
        let padding = "x".repeat(50);
        let reply = format!("{padding} STOP");
        assert!(!is_opt_out(&reply));
    }

    #[test]
    fn pricing_keyword_raises_qualification_score() {
        let agent = EmailAgent;
        let conversation_id = overlord_store::id::ConversationId::new();
        let message = Message {
            id: overlord_store::id::MessageId::new(),
            conversation_id,
            sequence: 0,
            direction: Direction::Inbound,
            content: "Can you tell me about pricing?".to_string(),
            timestamp: chrono::Utc::now(),
            external_id: None,
            metadata: serde_json::json!({}),
        };
        let evaluation = agent.evaluate_signals(&[message]);
        assert!(evaluation.qualification_score > 0.0);
        assert!(evaluation.keywords_hit.contains("pricing"));
    }
}
