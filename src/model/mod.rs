//! Agent-to-model routing: complexity scoring, tier selection, and the
//! provider-agnostic client contract the router drives.

pub mod client;
pub mod openai_client;
pub mod router;

pub use client::{AgentKind, DecisionType, ModelCallError, ModelClient, ModelRequest, ModelResponse, ResponseFormat, Role, TokenUsage};
pub use router::{ModelRouter, RouterConfig, RouterError, RouterOutcome, RouterRequest, Tier, TierModels};
