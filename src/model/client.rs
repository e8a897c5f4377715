//! Provider-agnostic model client contract.
//!
//! Deliberately narrow: no native tool calling, no streaming — the router
//! only ever needs "send a prompt, get text plus token accounting back".
//! Conversation bookkeeping has no analogue here; the engagement engine
//! already owns per-lead conversation state in `overlord-store`.

use async_trait::async_trait;
use std::error::Error;
use std::fmt;

/// How many tokens were spent on prompt vs. completion.
#[derive(Clone, Debug, Default)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

/// Which channel agent is issuing this request — feeds the router's agent
/// modifier term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    Overlord,
    Email,
    Sms,
    Chat,
}

/// What kind of decision this call is making — feeds the router's
/// decision-type weight term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionType {
    Routing,
    Generation,
    Analysis,
    Strategy,
    Evaluation,
    Conversation,
    Qualification,
    Other,
}

impl DecisionType {
    pub fn weight(self) -> u32 {
        match self {
            DecisionType::Routing => 20,
            DecisionType::Generation => 25,
            DecisionType::Analysis => 45,
            DecisionType::Strategy => 65,
            DecisionType::Evaluation => 55,
            DecisionType::Conversation => 35,
            DecisionType::Qualification => 40,
            DecisionType::Other => 30,
        }
    }

    pub fn is_multi_step(self) -> bool {
        matches!(self, DecisionType::Strategy | DecisionType::Evaluation)
    }
}

/// A fully-formed request to a model, already routed to a concrete model
/// name by the [`crate::model::router::ModelRouter`].
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub conversation_history: Vec<(Role, String)>,
    pub response_format: Option<ResponseFormat>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub enum ResponseFormat {
    PlainText,
    /// A JSON schema the response must validate against; `depth` is the
    /// schema's nesting depth, used by the complexity scorer.
    Json { schema: serde_json::Value, depth: u32 },
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// Whether a model-call failure should be retried on the fallback model
/// (transient) or surfaced immediately (permanent: invalid auth, content
/// policy reject, quota exceeded).
#[derive(Debug)]
pub enum ModelCallError {
    Transient(Box<dyn Error + Send + Sync>),
    Permanent(Box<dyn Error + Send + Sync>),
}

impl fmt::Display for ModelCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelCallError::Transient(e) => write!(f, "transient model error: {e}"),
            ModelCallError::Permanent(e) => write!(f, "permanent model error: {e}"),
        }
    }
}

impl Error for ModelCallError {}

/// Trait-driven abstraction over a concrete model provider. All
/// implementations must be thread-safe so they can be shared across worker
/// tasks behind an `Arc`.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelCallError>;

    fn provider_name(&self) -> &str;
}
