//! Binary entry point: loads configuration, wires the store, circuit
//! breaker registry, model router, carriers, job queue, and HTTP surface
//! together, then runs the server alongside the tick loop and (when
//! configured) the IMAP scanner loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use overlord::carriers::Carrier;
use overlord::config::OverlordConfig;
use overlord::engine::Engine;
use overlord::event::TracingEventHandler;
use overlord::http::{self, AppState};
use overlord::model::client::{AgentKind as ModelAgentKind, ModelClient};
use overlord::model::openai_client::OpenAiModelClient;
use overlord::model::{ModelRouter, RouterConfig, TierModels};
use overlord::resilience::{CircuitBreakerRegistry, JobQueue};
use overlord_store::models::Channel;
use overlord_store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = OverlordConfig::from_env()?;
    let store = Store::connect(&config.runtime.database_url).await?;

    let breakers = CircuitBreakerRegistry::new();
    let events = Arc::new(TracingEventHandler);

    let router = build_router(&config, &breakers);
    let carriers = build_carriers(&config);

    let engine = Engine::new(
        store.clone(),
        router,
        breakers,
        carriers,
        events.clone(),
        config.runtime.handover_followup_days,
        config.runtime.completion_quiescence_seconds,
    );

    let queue = JobQueue::start(
        config.queue.job_type_concurrency(),
        config.queue.max_concurrent as usize * 4,
        engine.clone(),
        store.clone(),
    );
    engine.set_queue(queue);

    let app_state = AppState {
        engine: engine.clone(),
        store: store.clone(),
        marketplace: config.marketplace.clone(),
        events: events.clone(),
        email_webhook_secret: std::env::var("EMAIL_WEBHOOK_SECRET").ok(),
        sms_webhook_secret: std::env::var("SMS_WEBHOOK_SECRET").ok(),
    };
    let app = http::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.runtime.bind_addr).await?;
    tracing::info!(addr = %config.runtime.bind_addr, "overlord listening");

    let tick_engine = engine.clone();
    let tick_interval = config.runtime.tick_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = tick_engine.tick().await {
                tracing::warn!(error = %err, "engine tick failed");
            }
        }
    });

    #[cfg(feature = "email-carrier")]
    if let Some(imap_config) = config.imap.clone() {
        let imap_engine = engine.clone();
        let imap_events = events.clone();
        tokio::spawn(async move {
            let rules: Vec<overlord::imap_scanner::MailboxRule> = Vec::new();
            let mut ticker = tokio::time::interval(imap_config.poll_interval);
            loop {
                ticker.tick().await;
                match overlord::imap_scanner::poll_once(&imap_config, &rules, &imap_engine, imap_events.as_ref()).await {
                    Ok(count) if count > 0 => tracing::info!(count, "imap scan processed inbound mail"),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "imap poll failed"),
                }
            }
        });
    }

    axum::serve(listener, app).await?;
    Ok(())
}

/// Builds the model router from `MODEL_PROVIDER_KEY` and friends. Both the
/// primary and fallback client slots point at the same OpenAI-compatible
/// endpoint today (the router's fallback path exists for model-name
/// failover and breaker exhaustion, not a second provider); a deployment
/// wanting a genuinely distinct fallback provider only needs to swap this
/// second `Arc` for a different `ModelClient` impl.
fn build_router(config: &OverlordConfig, breakers: &CircuitBreakerRegistry) -> Option<ModelRouter> {
    let client: Arc<dyn ModelClient> = Arc::new(OpenAiModelClient::new(config.model.provider_key.clone(), config.model.request_timeout));
    let fallback_client = client.clone();

    let per_agent_override = config
        .model
        .per_agent_override
        .iter()
        .filter_map(|(kind, model)| agent_kind_from_label(kind).map(|k| (k, model.clone())))
        .collect::<HashMap<_, _>>();

    let router_config = RouterConfig {
        simple: TierModels { primary: config.model.simple_model.clone(), fallback: config.model.fallback_model.clone() },
        medium: TierModels { primary: config.model.medium_model.clone(), fallback: config.model.fallback_model.clone() },
        complex: TierModels { primary: config.model.complex_model.clone(), fallback: config.model.fallback_model.clone() },
        fallback_model: config.model.fallback_model.clone(),
        per_agent_override,
        timeout: config.model.request_timeout,
    };

    Some(ModelRouter::new(router_config, client, fallback_client, breakers.clone()))
}

fn agent_kind_from_label(label: &str) -> Option<ModelAgentKind> {
    match label {
        "overlord" => Some(ModelAgentKind::Overlord),
        "email" => Some(ModelAgentKind::Email),
        "sms" => Some(ModelAgentKind::Sms),
        "chat" => Some(ModelAgentKind::Chat),
        _ => None,
    }
}

/// Wires a real carrier for each channel whose credentials are configured,
/// falling back to [`overlord::carriers::LoggingCarrier`] so the engine
/// always has somewhere to send a composed message, even in a development
/// environment with no SMTP/Twilio account on hand.
fn build_carriers(config: &OverlordConfig) -> HashMap<Channel, Arc<dyn Carrier>> {
    let mut carriers: HashMap<Channel, Arc<dyn Carrier>> = HashMap::new();

    #[cfg(feature = "email-carrier")]
    {
        if config.email.is_configured() {
            let smtp_host = config.email.domain.clone().unwrap_or_default();
            match overlord::carriers::SmtpEmailCarrier::new(
                &smtp_host,
                config.email.from_email.as_deref().unwrap_or_default(),
                config.email.api_key.as_deref().unwrap_or_default(),
                config.email.from_email.as_deref().unwrap_or_default(),
            ) {
                Ok(carrier) => {
                    carriers.insert(Channel::Email, Arc::new(carrier));
                }
                Err(err) => tracing::warn!(error = %err, "failed to construct smtp email carrier, falling back to logging"),
            }
        }
    }
    carriers.entry(Channel::Email).or_insert_with(|| Arc::new(overlord::carriers::LoggingCarrier::new(Channel::Email)));

    if config.sms.is_configured() {
        let carrier = overlord::carriers::RestSmsCarrier::new(
            config.sms.account_sid.clone().unwrap_or_default(),
            config.sms.auth_token.clone().unwrap_or_default(),
            config.sms.outbound_phone_number.clone().unwrap_or_default(),
            config.sms.send_timeout,
        );
        carriers.insert(Channel::Sms, Arc::new(carrier));
    } else {
        carriers.insert(Channel::Sms, Arc::new(overlord::carriers::LoggingCarrier::new(Channel::Sms)));
    }

    carriers.insert(Channel::Chat, Arc::new(overlord::carriers::LoggingCarrier::new(Channel::Chat)));
    carriers
}
