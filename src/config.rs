//! Environment-driven configuration.
//!
//! One `from_env` constructor per subsystem, each with documented
//! defaults: carriers, IMAP scanning, the marketplace ingress, and the job
//! queue.

use std::collections::HashSet;
use std::env;
use std::time::Duration;

/// Top-level configuration, assembled once at startup from environment
/// variables (optionally loaded from a `.env` file in development via
/// `dotenvy`).
#[derive(Debug, Clone)]
pub struct OverlordConfig {
    pub model: ModelConfig,
    pub email: EmailConfig,
    pub sms: SmsConfig,
    pub imap: Option<ImapConfig>,
    pub marketplace: MarketplaceConfig,
    pub queue: QueueConfig,
    pub runtime: RuntimeConfig,
}

impl OverlordConfig {
    /// Load configuration from the process environment, applying
    /// `.env` overrides first if a file is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            model: ModelConfig::from_env()?,
            email: EmailConfig::from_env(),
            sms: SmsConfig::from_env(),
            imap: ImapConfig::from_env(),
            marketplace: MarketplaceConfig::from_env(),
            queue: QueueConfig::from_env(),
            runtime: RuntimeConfig::from_env(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
}

fn env_var(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Which model backs each complexity tier, plus the provider key and
/// per-agent overrides consulted by the router before falling back to the
/// tier pick.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub provider_key: String,
    pub simple_model: String,
    pub medium_model: String,
    pub complex_model: String,
    pub fallback_model: String,
    pub request_timeout: Duration,
    /// Per-agent-kind model override, keyed by lowercase agent kind name
    /// (`overlord`, `email`, `sms`, `chat`), e.g. `AGENT_OVERRIDE_SMS=gpt-4o-mini`.
    pub per_agent_override: std::collections::HashMap<String, String>,
}

impl ModelConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let mut per_agent_override = std::collections::HashMap::new();
        for kind in ["overlord", "email", "sms", "chat"] {
            let key = format!("AGENT_OVERRIDE_{}", kind.to_uppercase());
            if let Some(model) = env_opt(&key) {
                per_agent_override.insert(kind.to_string(), model);
            }
        }

        Ok(Self {
            provider_key: env_var("MODEL_PROVIDER_KEY")?,
            simple_model: env::var("SIMPLE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            medium_model: env::var("MEDIUM_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            complex_model: env::var("COMPLEX_MODEL").unwrap_or_else(|_| "o1".to_string()),
            fallback_model: env::var("FALLBACK_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            request_timeout: Duration::from_secs(env_u64("MODEL_TIMEOUT_SECS", 15)),
            per_agent_override,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct EmailConfig {
    pub api_key: Option<String>,
    pub domain: Option<String>,
    pub from_email: Option<String>,
    pub send_timeout: Duration,
}

impl EmailConfig {
    fn from_env() -> Self {
        Self {
            api_key: env_opt("EMAIL_API_KEY"),
            domain: env_opt("EMAIL_DOMAIN"),
            from_email: env_opt("FROM_EMAIL"),
            send_timeout: Duration::from_secs(env_u64("EMAIL_TIMEOUT_SECS", 10)),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() && self.from_email.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SmsConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub outbound_phone_number: Option<String>,
    pub send_timeout: Duration,
}

impl SmsConfig {
    fn from_env() -> Self {
        Self {
            account_sid: env_opt("SMS_ACCOUNT_SID"),
            auth_token: env_opt("SMS_AUTH_TOKEN"),
            outbound_phone_number: env_opt("OUTBOUND_PHONE_NUMBER"),
            send_timeout: Duration::from_secs(env_u64("SMS_TIMEOUT_SECS", 10)),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.account_sid.is_some() && self.auth_token.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub poll_interval: Duration,
}

impl ImapConfig {
    fn from_env() -> Option<Self> {
        Some(Self {
            host: env_opt("IMAP_HOST")?,
            port: env::var("IMAP_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(993),
            user: env_opt("IMAP_USER")?,
            password: env_opt("IMAP_PASSWORD")?,
            poll_interval: Duration::from_secs(env_u64("IMAP_POLL_INTERVAL_SECS", 30)),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarketplaceConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub valid_api_keys: HashSet<String>,
    pub request_timeout: Duration,
}

impl MarketplaceConfig {
    fn from_env() -> Self {
        let valid_api_keys = env::var("MARKETPLACE_VALID_API_KEYS")
            .ok()
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        Self {
            api_url: env_opt("MARKETPLACE_API_URL"),
            api_key: env_opt("MARKETPLACE_API_KEY"),
            valid_api_keys,
            request_timeout: Duration::from_secs(env_u64("MARKETPLACE_TIMEOUT_SECS", 20)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent: u32,
    pub retry_delay_ms: u64,
    pub max_retries: u32,
    pub route_concurrency: u32,
    pub dispatch_concurrency: u32,
    pub handle_reply_concurrency: u32,
    pub scheduled_send_concurrency: u32,
    pub handover_fanout_concurrency: u32,
}

impl QueueConfig {
    fn from_env() -> Self {
        let max_concurrent = env_u32("QUEUE_MAX_CONCURRENT", 32);
        Self {
            max_concurrent,
            retry_delay_ms: env_u64("QUEUE_RETRY_DELAY_MS", 1000),
            max_retries: env_u32("QUEUE_MAX_RETRIES", 5),
            route_concurrency: env_u32("QUEUE_ROUTE_CONCURRENCY", max_concurrent),
            dispatch_concurrency: env_u32("QUEUE_DISPATCH_CONCURRENCY", max_concurrent),
            handle_reply_concurrency: env_u32("QUEUE_HANDLE_REPLY_CONCURRENCY", max_concurrent),
            scheduled_send_concurrency: env_u32("QUEUE_SCHEDULED_SEND_CONCURRENCY", max_concurrent),
            handover_fanout_concurrency: env_u32("QUEUE_HANDOVER_FANOUT_CONCURRENCY", max_concurrent),
        }
    }

    /// Per-job-type worker pool sizes for `JobQueue::start`. Each job type
    /// is read from its own env var (falling back to `max_concurrent`) so a
    /// deployment can size, say, the dispatch pool to its carrier's rate
    /// limit without starving reply handling or handover fan-out of
    /// workers.
    pub fn job_type_concurrency(&self) -> crate::resilience::JobTypeConcurrency {
        crate::resilience::JobTypeConcurrency {
            route: self.route_concurrency as usize,
            dispatch: self.dispatch_concurrency as usize,
            handle_reply: self.handle_reply_concurrency as usize,
            scheduled_send: self.scheduled_send_concurrency as usize,
            handover_fanout: self.handover_fanout_concurrency as usize,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub memory_limit_mb: Option<u64>,
    pub enable_agents: bool,
    pub enable_websocket: bool,
    pub database_url: String,
    /// HTTP ingress bind address, e.g. `0.0.0.0:8080`.
    pub bind_addr: String,
    /// Days after an unconfirmed handover before the follow-up re-check
    /// fires.
    pub handover_followup_days: i64,
    /// Seconds a lead's conversation must sit quiet, after its touch
    /// sequence is exhausted, before `AwaitingReply -> Completed` fires.
    pub completion_quiescence_seconds: i64,
    pub tick_interval: Duration,
}

impl RuntimeConfig {
    fn from_env() -> Self {
        Self {
            memory_limit_mb: env::var("MEMORY_LIMIT_MB").ok().and_then(|v| v.parse().ok()),
            enable_agents: env::var("ENABLE_AGENTS").map(|v| v != "0" && v.to_lowercase() != "false").unwrap_or(true),
            enable_websocket: env::var("ENABLE_WEBSOCKET").map(|v| v == "1" || v.to_lowercase() == "true").unwrap_or(false),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://overlord.db".to_string()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            handover_followup_days: env::var("HANDOVER_FOLLOWUP_DAYS").ok().and_then(|v| v.parse().ok()).unwrap_or(3),
            completion_quiescence_seconds: env::var("COMPLETION_QUIESCENCE_SECONDS").ok().and_then(|v| v.parse().ok()).unwrap_or(86_400),
            tick_interval: Duration::from_secs(env_u64("TICK_INTERVAL_SECS", 30)),
        }
    }
}
