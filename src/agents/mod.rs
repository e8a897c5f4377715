//! The Agent Kernel : four agent
//! kinds — overlord, email, sms, chat — each a stateless function over
//! `(lead, conversation, campaign)`.

pub mod channel;
pub mod overlord;
pub mod templates;

pub use channel::{agent_for_channel, AgentContext, AgentRefusal, ChannelAgentKernel, ComposedMessage, Sentiment, SignalEvaluation};
pub use overlord::{engine_level_fallback, OverlordAgent, OverlordDecision, OverlordOutcome};
