//! Shared fixtures for the end-to-end engagement tests: an in-memory
//! store plus raw inserts for the rows the engine reads but has no public
//! write path for (`Campaign`/`Template`/`AgentDefinition` CRUD is out of
//! scope here, so tests seed them directly).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;

use overlord::carriers::{Carrier, LoggingCarrier};
use overlord::engine::Engine;
use overlord::event::TracingEventHandler;
use overlord::resilience::{CircuitBreakerRegistry, JobQueue, JobTypeConcurrency};
use overlord_store::id::{AgentId, CampaignId, TemplateId};
use overlord_store::models::{
    AgentKind, Channel, ChannelPreferences, ConversationMode, HandoverCriteria, Recipient,
};
use overlord_store::Store;

/// A pool of exactly one connection: `sqlite::memory:` hands each new
/// connection a distinct, private database, so a pool with more than one
/// connection would silently fragment test state across requests.
pub async fn test_store() -> Store {
    let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./overlord-store/migrations").run(&pool).await.unwrap();
    Store::from_pool(pool)
}

pub async fn seed_agent(store: &Store, kind: AgentKind) -> AgentId {
    let id = AgentId::new();
    sqlx::query(
        "INSERT INTO agent_definitions (id, kind, end_goal, personality, instructions, domain_expertise) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(format!("{kind:?}").to_lowercase())
    .bind("book a qualified demo")
    .bind("warm, concise, consultative")
    .bind(serde_json::to_string(&serde_json::json!({ "dos": ["be concise"], "donts": ["be pushy"] })).unwrap())
    .bind("b2b saas outreach")
    .execute(store.pool())
    .await
    .unwrap();
    id
}

pub async fn seed_template(store: &Store, subject: &str, body: &str) -> TemplateId {
    let id = TemplateId::new();
    sqlx::query("INSERT INTO templates (id, name, subject, body, variables, category) VALUES (?, ?, ?, ?, ?, ?)")
        .bind(id.to_string())
        .bind("welcome")
        .bind(subject)
        .bind(body)
        .bind(serde_json::to_string(&HashSet::<String>::from(["name".to_string()])).unwrap())
        .bind("outbound")
        .execute(store.pool())
        .await
        .unwrap();
    id
}

pub struct CampaignSpec {
    pub conversation_mode: ConversationMode,
    pub channel_preferences: ChannelPreferences,
    pub touch_sequence: Vec<overlord_store::models::TouchStep>,
    pub handover_criteria: HandoverCriteria,
}

pub async fn seed_campaign(store: &Store, agent_id: AgentId, spec: CampaignSpec) -> CampaignId {
    let id = CampaignId::new();
    let settings = overlord_store::models::CampaignSettings {
        handover_criteria: spec.handover_criteria,
        start_hour: 0,
        end_hour: 23,
        allowed_weekdays: HashSet::new(),
        daily_send_cap: None,
        send_time_optimization: false,
        timezone: "UTC".to_string(),
    };
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO campaigns (id, name, agent_id, conversation_mode, touch_sequence, channel_preferences, settings, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind("saas-demo")
    .bind(agent_id.to_string())
    .bind(serde_json::to_string(&spec.conversation_mode).unwrap())
    .bind(serde_json::to_string(&spec.touch_sequence).unwrap())
    .bind(serde_json::to_string(&spec.channel_preferences).unwrap())
    .bind(serde_json::to_string(&settings).unwrap())
    .bind(&now)
    .bind(&now)
    .execute(store.pool())
    .await
    .unwrap();
    id
}

pub fn default_handover_criteria(keyword_triggers: &[&str]) -> HandoverCriteria {
    HandoverCriteria {
        qualification_score_threshold: 100.0, // unreachable via signal scoring alone in these tests
        conversation_length_threshold: 1_000,
        time_threshold_seconds: i64::MAX,
        keyword_triggers: keyword_triggers.iter().map(|s| s.to_string()).collect(),
        goal_completion_required: HashSet::new(),
        handover_recipients: Vec::<Recipient>::new(),
    }
}

/// A fully wired engine with `LoggingCarrier`s on every channel (no real
/// SMTP/Twilio credentials, no model router — routing falls back to the
/// deterministic rule and composition falls back to template rendering).
pub struct Harness {
    pub store: Store,
    pub engine: Arc<Engine>,
    pub email_carrier: Arc<LoggingCarrier>,
    pub sms_carrier: Arc<LoggingCarrier>,
}

pub async fn harness() -> Harness {
    let store = test_store().await;
    let breakers = CircuitBreakerRegistry::new();
    let events = Arc::new(TracingEventHandler);

    let email_carrier = Arc::new(LoggingCarrier::new(Channel::Email));
    let sms_carrier = Arc::new(LoggingCarrier::new(Channel::Sms));
    let mut carriers: HashMap<Channel, Arc<dyn Carrier>> = HashMap::new();
    carriers.insert(Channel::Email, email_carrier.clone());
    carriers.insert(Channel::Sms, sms_carrier.clone());
    carriers.insert(Channel::Chat, Arc::new(LoggingCarrier::new(Channel::Chat)));

    let engine = Engine::new(store.clone(), None, breakers, carriers, events, 3, 86_400);
    let queue = JobQueue::start(JobTypeConcurrency::uniform(4), 64, engine.clone(), store.clone());
    engine.set_queue(queue);

    Harness { store, engine, email_carrier, sms_carrier }
}

/// Polls `check` every 20ms until it returns `Some`, or panics after
/// `timeout` — the job queue processes everything asynchronously, so
/// tests observe store state rather than awaiting a direct return value.
pub async fn wait_until<T, F, Fut>(timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
