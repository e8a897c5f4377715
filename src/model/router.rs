//! Model Router: complexity scoring, tier selection, primary/fallback
//! invocation, and cost/latency recording.

use crate::model::client::{
    AgentKind, DecisionType, ModelCallError, ModelClient, ModelRequest, ModelResponse, ResponseFormat,
};
use crate::resilience::circuit_breaker::{BreakerConfig, CircuitBreakerRegistry, GuardError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const MODEL_PROVIDER_SERVICE: &str = "model-provider";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Simple,
    Medium,
    Complex,
}

/// Inputs to the complexity scorer — one field per term in the scoring formula.
#[derive(Clone)]
pub struct RouterRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub agent_kind: AgentKind,
    pub decision_type: DecisionType,
    pub conversation_history: Vec<(crate::model::client::Role, String)>,
    pub requires_reasoning: bool,
    pub business_critical: bool,
    pub response_format: Option<ResponseFormat>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Checked against the raw response content when `response_format` is
    /// structured. A caller expecting a parseable shape (the Overlord's
    /// decision JSON, the qualification evaluator's JSON) sets this so a
    /// response that parses fine at the transport level but fails to match
    /// the expected schema gets the same one fallback-model retry a timeout
    /// or 5xx would get, instead of falling straight through to the
    /// caller's own deterministic fallback.
    pub response_validator: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for RouterRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterRequest")
            .field("prompt", &self.prompt)
            .field("system_prompt", &self.system_prompt)
            .field("agent_kind", &self.agent_kind)
            .field("decision_type", &self.decision_type)
            .field("conversation_history", &self.conversation_history)
            .field("requires_reasoning", &self.requires_reasoning)
            .field("business_critical", &self.business_critical)
            .field("response_format", &self.response_format)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("response_validator", &self.response_validator.is_some())
            .finish()
    }
}

/// A pair of models backing one complexity tier.
#[derive(Debug, Clone)]
pub struct TierModels {
    pub primary: String,
    pub fallback: String,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub simple: TierModels,
    pub medium: TierModels,
    pub complex: TierModels,
    pub fallback_model: String,
    pub per_agent_override: HashMap<AgentKind, String>,
    pub timeout: Duration,
}

/// Record of one invocation, independent of success/failure, for cost and
/// latency accounting.
#[derive(Debug, Clone)]
pub struct RouterOutcome {
    pub model: String,
    pub complexity: u32,
    pub tier: Tier,
    pub latency_ms: u64,
    pub input_tokens: Option<usize>,
    pub output_tokens: Option<usize>,
    pub cost_estimate: f64,
    pub used_fallback: bool,
    pub succeeded: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("router exhausted primary and fallback models: {0}")]
    Exhausted(String),
    #[error("circuit breaker open for model provider")]
    BreakerOpen,
}

/// Per-1k-token cost table consulted for the `costEstimate` field. Rough
/// placeholders; a real deployment would load these from a pricing config.
fn cost_per_1k(model: &str) -> f64 {
    if model.contains("mini") || model.contains("nano") {
        0.00015
    } else if model.contains("o1") {
        0.015
    } else {
        0.0025
    }
}

/// Complexity scoring and tier/model selection, invoking the client behind
/// the model-provider circuit breaker with a single fallback retry.
pub struct ModelRouter {
    config: RouterConfig,
    primary_client: Arc<dyn ModelClient>,
    fallback_client: Arc<dyn ModelClient>,
    breakers: CircuitBreakerRegistry,
}

impl ModelRouter {
    pub fn new(
        config: RouterConfig,
        primary_client: Arc<dyn ModelClient>,
        fallback_client: Arc<dyn ModelClient>,
        breakers: CircuitBreakerRegistry,
    ) -> Self {
        Self { config, primary_client, fallback_client, breakers }
    }

    /// Complexity score, clamped to `0..=100`. Each term below is summed
    /// then the total clamped.
    pub fn score_complexity(request: &RouterRequest) -> u32 {
        let mut score: i64 = 0;
        score += (request.prompt.len() as i64 / 100).min(25);
        score += request.decision_type.weight() as i64;

        if let Some(ResponseFormat::Json { depth, .. }) = &request.response_format {
            score += ((*depth as i64) * 8).min(20);
        }

        let turns = request.conversation_history.len() as i64;
        score += (turns * 3).min(15);

        if request.requires_reasoning {
            score += 20;
        }
        if request.decision_type.is_multi_step() {
            score += 15;
        }
        if request.business_critical {
            score += 25;
        }
        if !request.conversation_history.is_empty() {
            score += 10;
        }

        score += match request.agent_kind {
            AgentKind::Overlord => 15,
            AgentKind::Email => -5,
            AgentKind::Sms => -10,
            AgentKind::Chat => 0,
        };

        score.clamp(0, 100) as u32
    }

    pub fn tier_for(complexity: u32) -> Tier {
        if complexity < 30 {
            Tier::Simple
        } else if complexity < 70 {
            Tier::Medium
        } else {
            Tier::Complex
        }
    }

    fn tier_models(&self, tier: Tier) -> &TierModels {
        match tier {
            Tier::Simple => &self.config.simple,
            Tier::Medium => &self.config.medium,
            Tier::Complex => &self.config.complex,
        }
    }

    /// Resolve the model to use: an explicit per-agent override supersedes
    /// the tier pick entirely.
    fn primary_model_for(&self, request: &RouterRequest, tier: Tier) -> String {
        if let Some(model) = self.config.per_agent_override.get(&request.agent_kind) {
            return model.clone();
        }
        self.tier_models(tier).primary.clone()
    }

    pub async fn route(
        &self,
        request: RouterRequest,
    ) -> Result<(ModelResponse, RouterOutcome), RouterError> {
        let complexity = Self::score_complexity(&request);
        let tier = Self::tier_for(complexity);
        let primary_model = self.primary_model_for(&request, tier);
        let fallback_model = self.tier_models(tier).fallback.clone();

        let breaker_config = BreakerConfig { per_call_timeout: self.config.timeout, ..Default::default() };

        let model_request = |model: String| ModelRequest {
            model,
            system_prompt: request.system_prompt.clone(),
            prompt: request.prompt.clone(),
            conversation_history: request.conversation_history.clone(),
            response_format: request.response_format.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let started = Instant::now();
        let primary_req = model_request(primary_model.clone());
        let primary_result = self
            .breakers
            .guard(MODEL_PROVIDER_SERVICE, &breaker_config, || {
                let client = self.primary_client.clone();
                let req = primary_req.clone();
                async move { client.complete(&req).await }
            })
            .await;

        match primary_result {
            Ok(response) if Self::passes_validation(&request, &response) => {
                let outcome = RouterOutcome {
                    model: primary_model,
                    complexity,
                    tier,
                    latency_ms: started.elapsed().as_millis() as u64,
                    input_tokens: response.usage.as_ref().map(|u| u.input_tokens),
                    output_tokens: response.usage.as_ref().map(|u| u.output_tokens),
                    cost_estimate: estimate_cost(&response, tier, &self.tier_models(tier).primary),
                    used_fallback: false,
                    succeeded: true,
                };
                Ok((response, outcome))
            }
            Ok(_) => {
                tracing::warn!(model = %primary_model, "primary model response failed structured validation, retrying on fallback model");
                self.try_fallback(&request, fallback_model, complexity, tier, started, &breaker_config)
                    .await
            }
            Err(GuardError::Open(_)) => Err(RouterError::BreakerOpen),
            Err(GuardError::Timeout) | Err(GuardError::Call(ModelCallError::Transient(_))) => {
                self.try_fallback(&request, fallback_model, complexity, tier, started, &breaker_config)
                    .await
            }
            Err(GuardError::Call(ModelCallError::Permanent(err))) => {
                Err(RouterError::Exhausted(err.to_string()))
            }
        }
    }

    async fn try_fallback(
        &self,
        request: &RouterRequest,
        fallback_model: String,
        complexity: u32,
        tier: Tier,
        started: Instant,
        breaker_config: &BreakerConfig,
    ) -> Result<(ModelResponse, RouterOutcome), RouterError> {
        let req = ModelRequest {
            model: fallback_model.clone(),
            system_prompt: request.system_prompt.clone(),
            prompt: request.prompt.clone(),
            conversation_history: request.conversation_history.clone(),
            response_format: request.response_format.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let result = self
            .breakers
            .guard(MODEL_PROVIDER_SERVICE, breaker_config, || {
                let client = self.fallback_client.clone();
                let req = req.clone();
                async move { client.complete(&req).await }
            })
            .await;

        match result {
            Ok(response) if Self::passes_validation(request, &response) => {
                let outcome = RouterOutcome {
                    model: fallback_model,
                    complexity,
                    tier,
                    latency_ms: started.elapsed().as_millis() as u64,
                    input_tokens: response.usage.as_ref().map(|u| u.input_tokens),
                    output_tokens: response.usage.as_ref().map(|u| u.output_tokens),
                    cost_estimate: estimate_cost(&response, tier, &fallback_model),
                    used_fallback: true,
                    succeeded: true,
                };
                Ok((response, outcome))
            }
            Ok(_) => Err(RouterError::Exhausted(format!("fallback model {fallback_model} response also failed structured validation"))),
            Err(err) => Err(RouterError::Exhausted(err.to_string())),
        }
    }

    fn passes_validation(request: &RouterRequest, response: &ModelResponse) -> bool {
        request.response_validator.as_ref().map_or(true, |validator| validator(&response.content))
    }
}

fn estimate_cost(response: &ModelResponse, _tier: Tier, model: &str) -> f64 {
    let Some(usage) = &response.usage else { return 0.0 };
    (usage.total() as f64 / 1000.0) * cost_per_1k(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::client::Role;

    fn base_request() -> RouterRequest {
        RouterRequest {
            prompt: "hello".to_string(),
            system_prompt: None,
            agent_kind: AgentKind::Chat,
            decision_type: DecisionType::Conversation,
            conversation_history: vec![],
            requires_reasoning: false,
            business_critical: false,
            response_format: None,
            temperature: 0.7,
            max_tokens: None,
            response_validator: None,
        }
    }

    #[test]
    fn identical_factors_score_identically() {
        let r1 = base_request();
        let r2 = base_request();
        assert_eq!(ModelRouter::score_complexity(&r1), ModelRouter::score_complexity(&r2));
    }

    #[test]
    fn overlord_modifier_pushes_toward_complex_tier() {
        let mut overlord = base_request();
        overlord.agent_kind = AgentKind::Overlord;
        overlord.decision_type = DecisionType::Strategy;
        overlord.requires_reasoning = true;
        overlord.business_critical = true;
        let score = ModelRouter::score_complexity(&overlord);
        assert_eq!(ModelRouter::tier_for(score), Tier::Complex);
    }

    #[test]
    fn short_chat_prompt_lands_in_simple_tier() {
        let request = base_request();
        let score = ModelRouter::score_complexity(&request);
        assert_eq!(ModelRouter::tier_for(score), Tier::Simple);
    }

    #[test]
    fn sms_modifier_pulls_score_down() {
        let mut sms = base_request();
        sms.agent_kind = AgentKind::Sms;
        let mut chat = base_request();
        chat.agent_kind = AgentKind::Chat;
        assert!(ModelRouter::score_complexity(&sms) < ModelRouter::score_complexity(&chat));
    }

    struct ScriptedClient {
        content: String,
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ModelClient for ScriptedClient {
        async fn complete(&self, _request: &ModelRequest) -> Result<ModelResponse, ModelCallError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(ModelResponse { content: self.content.clone(), usage: None })
        }

        fn provider_name(&self) -> &str {
            "scripted"
        }
    }

    fn tier_models(primary: &str, fallback: &str) -> TierModels {
        TierModels { primary: primary.to_string(), fallback: fallback.to_string() }
    }

    #[tokio::test]
    async fn content_parse_failure_on_primary_retries_fallback_model() {
        let primary_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fallback_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let primary: Arc<dyn ModelClient> = Arc::new(ScriptedClient { content: "not json".to_string(), calls: primary_calls.clone() });
        let fallback: Arc<dyn ModelClient> = Arc::new(ScriptedClient { content: "{\"ok\":true}".to_string(), calls: fallback_calls.clone() });

        let router = ModelRouter::new(
            RouterConfig {
                simple: tier_models("p-simple", "f-simple"),
                medium: tier_models("p-medium", "f-medium"),
                complex: tier_models("p-complex", "f-complex"),
                fallback_model: "f-default".to_string(),
                per_agent_override: HashMap::new(),
                timeout: Duration::from_secs(5),
            },
            primary,
            fallback,
            CircuitBreakerRegistry::new(),
        );

        let mut request = base_request();
        request.response_format = Some(ResponseFormat::Json { schema: serde_json::json!({}), depth: 1 });
        request.response_validator = Some(Arc::new(|content: &str| serde_json::from_str::<serde_json::Value>(content).is_ok()));

        let (response, outcome) = router.route(request).await.expect("fallback model response should validate");
        assert_eq!(response.content, "{\"ok\":true}");
        assert!(outcome.used_fallback);
        assert_eq!(primary_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(fallback_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn content_parse_failure_on_both_models_is_exhausted() {
        let primary: Arc<dyn ModelClient> =
            Arc::new(ScriptedClient { content: "not json".to_string(), calls: Arc::new(std::sync::atomic::AtomicUsize::new(0)) });
        let fallback: Arc<dyn ModelClient> =
            Arc::new(ScriptedClient { content: "still not json".to_string(), calls: Arc::new(std::sync::atomic::AtomicUsize::new(0)) });

        let router = ModelRouter::new(
            RouterConfig {
                simple: tier_models("p-simple", "f-simple"),
                medium: tier_models("p-medium", "f-medium"),
                complex: tier_models("p-complex", "f-complex"),
                fallback_model: "f-default".to_string(),
                per_agent_override: HashMap::new(),
                timeout: Duration::from_secs(5),
            },
            primary,
            fallback,
            CircuitBreakerRegistry::new(),
        );

        let mut request = base_request();
        request.response_format = Some(ResponseFormat::Json { schema: serde_json::json!({}), depth: 1 });
        request.response_validator = Some(Arc::new(|content: &str| serde_json::from_str::<serde_json::Value>(content).is_ok()));

        let result = router.route(request).await;
        assert!(matches!(result, Err(RouterError::Exhausted(_))));
    }
}
