//! End-to-end tests for the Quarry pipeline.
//!
//! These run the full stack from request to event stream: a scripted
//! completion provider, a seeded SQLite database behind the read-only
//! executor, the orchestrator, the chat service and the HTTP gateway.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request as HttpRequest, StatusCode};
use futures::StreamExt;
use http_body_util::BodyExt;
use quarry_agent::{ChatService, LlmClient, Orchestrator, Request, prompts};
use quarry_config::PipelineConfig;
use quarry_core::error::ProviderError;
use quarry_core::event::{EventKind, StreamEvent};
use quarry_core::message::Message;
use quarry_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use quarry_core::storage::{ChatStore, QueryExecutor};
use quarry_gateway::{GatewayState, build_router};
use quarry_storage::{InMemoryChatStore, SqliteChatStore, SqliteExecutor};
use tower::ServiceExt;

// ── Scripted provider ────────────────────────────────────────────────────

/// Replies per pipeline stage, keyed by the stage's role line. The last
/// reply of a stage repeats once its queue runs dry.
#[derive(Default)]
struct ScriptedProvider {
    replies: Mutex<HashMap<&'static str, Vec<String>>>,
    calls: Mutex<Vec<&'static str>>,
    prompts: Mutex<Vec<String>>,
}

const ROLES: [&str; 11] = [
    prompts::DEPENDENCY_ROLE,
    prompts::LIGHT_REWRITE_ROLE,
    prompts::CONTEXT_EXTRACTION_ROLE,
    prompts::CONTEXT_REWRITE_ROLE,
    prompts::ROUTER_ROLE,
    prompts::DIRECT_ANSWER_ROLE,
    prompts::GENERATOR_ROLE,
    prompts::VALIDATOR_ROLE,
    prompts::ANALYST_ROLE,
    prompts::GATE_ROLE,
    prompts::TEMPLATES_ROLE,
];

impl ScriptedProvider {
    fn on(self, role: &'static str, reply: &str) -> Self {
        self.replies.lock().unwrap().entry(role).or_default().push(reply.to_string());
        self
    }

    fn generator_prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn calls_to(&self, role: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|r| **r == role).count()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let system = &request.messages[0].content;
        let Some(role) = ROLES.iter().copied().find(|role| system.contains(role)) else {
            panic!("unexpected prompt: {system}");
        };
        self.calls.lock().unwrap().push(role);
        if role == prompts::GENERATOR_ROLE {
            self.prompts.lock().unwrap().push(request.messages[1].content.clone());
        }

        let mut replies = self.replies.lock().unwrap();
        let queue = replies.get_mut(role).ok_or_else(|| ProviderError::ApiError {
            status_code: 500,
            message: format!("no reply scripted for: {role}"),
        })?;
        let reply = if queue.len() > 1 { queue.remove(0) } else { queue[0].clone() };

        Ok(ProviderResponse {
            message: Message::assistant(reply),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            model: request.model,
        })
    }
}

const NO_CONTEXT: &str = r#"{"needs_context": false, "confidence": 0.95, "reasoning": "standalone"}"#;
const TO_SQL: &str = r#"{"should_use_sql_agent": true, "reasoning": "needs customer data", "confidence_score": 0.9, "query_type": "campaign"}"#;
const APPROVED: &str = r#"{"is_valid": true, "confidence_score": 0.92, "validation_details": "Matches the request"}"#;
const NO_MESSAGES: &str = r#"{"needs_marketing_messages": false, "reasoning": "audience only"}"#;

fn generated(sql: &str, confidence: f64) -> String {
    serde_json::json!({
        "sql_query": sql,
        "explanation": "Customers who accept marketing",
        "confidence_score": confidence,
        "tables_used": ["customers"]
    })
    .to_string()
}

// ── Fixtures ─────────────────────────────────────────────────────────────

async fn crm() -> Arc<SqliteExecutor> {
    let pool = quarry_storage::sqlite::open_pool("sqlite::memory:").await.unwrap();
    sqlx::raw_sql(
        r#"
        CREATE TABLE customers (
            id INTEGER PRIMARY KEY,
            email TEXT NOT NULL,
            phone TEXT,
            data_source TEXT NOT NULL,
            first_name TEXT,
            last_name TEXT,
            total_value REAL,
            accepts_marketing BOOLEAN,
            preferred_channels TEXT
        );
        INSERT INTO customers VALUES
            (1, 'jane@example.com', '+15550100', 'shopify', 'Jane', 'Doe', 820.0, 1, '["email","sms"]'),
            (2, 'raj@example.com', NULL, 'klaviyo', 'Raj', 'Patel', 640.5, 1, NULL),
            (3, 'lee@example.com', '+15550102', 'shopify', 'Lee', 'Wong', 35.0, 0, NULL);
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();
    Arc::new(SqliteExecutor::from_pool(pool))
}

fn service(
    provider: Arc<ScriptedProvider>,
    executor: Arc<dyn QueryExecutor>,
    chat_store: Arc<dyn ChatStore>,
) -> ChatService {
    let llm = LlmClient::new(provider, "e2e-model", Duration::from_secs(5));
    let orchestrator = Orchestrator::new(llm, executor, chat_store, PipelineConfig::default());
    ChatService::new(Arc::new(orchestrator), Duration::from_millis(5))
}

async fn collect(service: &ChatService, request: Request) -> Vec<StreamEvent> {
    service.start(request).collect().await
}

fn payload<'a>(events: &'a [StreamEvent], kind: EventKind) -> &'a serde_json::Map<String, serde_json::Value> {
    events
        .iter()
        .find(|e| e.kind == kind)
        .and_then(|e| e.payload.as_ref())
        .unwrap_or_else(|| panic!("no {kind} event with a payload"))
}

async fn wait_for_turns(store: &dyn ChatStore, n: usize) -> bool {
    for _ in 0..200 {
        if store.all().await.unwrap().len() >= n {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn campaign_request_runs_against_real_rows_and_personalizes() {
    let provider = Arc::new(
        ScriptedProvider::default()
            .on(prompts::DEPENDENCY_ROLE, NO_CONTEXT)
            .on(prompts::ROUTER_ROLE, TO_SQL)
            .on(
                prompts::GENERATOR_ROLE,
                &generated(
                    "SELECT id, email, phone, data_source, first_name, last_name, preferred_channels \
                     FROM customers WHERE accepts_marketing = 1 ORDER BY id",
                    0.9,
                ),
            )
            .on(prompts::VALIDATOR_ROLE, APPROVED)
            .on(prompts::ANALYST_ROLE, "Two marketable customers found.")
            .on(prompts::GATE_ROLE, r#"{"needs_marketing_messages": true}"#)
            .on(
                prompts::TEMPLATES_ROLE,
                r#"```json
                [
                  {"channel": "email", "subject": "A gift for {{first_name}}", "message": "Hi {{first_name}}, thanks for shopping with us."},
                  {"channel": "sms", "message": "{{first_name}}, 20% off this week only."}
                ]
                ```"#,
            ),
    );
    let store = Arc::new(InMemoryChatStore::new());
    let service = service(provider.clone(), crm().await, store.clone());

    let events = collect(
        &service,
        Request::new("Write a win-back email for customers who accept marketing").with_session("s-1"),
    )
    .await;

    assert_eq!(events.last().unwrap().kind, EventKind::EndOfStream);
    assert!(!events.iter().any(|e| e.kind == EventKind::Error));

    let data = payload(&events, EventKind::DataRetrieved);
    assert_eq!(data["count"], 2);
    assert_eq!(data["rows"][0]["first_name"], "Jane");
    assert_eq!(data["rows"][1]["email"], "raj@example.com");

    let channels = payload(&events, EventKind::ChannelContent)["channels"].as_array().unwrap();
    assert_eq!(channels.len(), 2);

    let email = &channels[0];
    assert_eq!(email["channel"], "email");
    assert_eq!(email["total"], 2);
    assert_eq!(email["recipients"][0]["subject"], "A gift for Jane");
    assert_eq!(email["recipients"][1]["message"], "Hi Raj, thanks for shopping with us.");
    assert_eq!(email["recipients"][0]["contact"], "jane@example.com");

    // Raj has no phone; Jane prefers sms.
    let sms = &channels[1];
    assert_eq!(sms["channel"], "sms");
    assert_eq!(sms["total"], 1);
    assert_eq!(sms["recipients"][0]["message"], "Jane, 20% off this week only.");

    let answer: String = events
        .iter()
        .filter(|e| e.kind == EventKind::PartialAnswer)
        .map(|e| e.content.as_str())
        .collect();
    assert!(answer.contains("Two marketable customers found."));

    assert!(wait_for_turns(store.as_ref(), 1).await);
    let turns = store.all().await.unwrap();
    assert_eq!(turns[0].message, "Write a win-back email for customers who accept marketing");
    assert!(turns[0].response.starts_with("```sql\nSELECT id, email"));
    assert_eq!(provider.calls_to(prompts::GENERATOR_ROLE), 1);
}

#[tokio::test]
async fn write_statement_is_refused_before_reaching_the_database() {
    let provider = Arc::new(
        ScriptedProvider::default()
            .on(prompts::DEPENDENCY_ROLE, NO_CONTEXT)
            .on(prompts::ROUTER_ROLE, TO_SQL)
            .on(prompts::GENERATOR_ROLE, &generated("DELETE FROM customers WHERE accepts_marketing = 0", 0.99)),
    );
    let executor = crm().await;
    let store = Arc::new(InMemoryChatStore::new());
    let service = service(provider.clone(), executor.clone(), store.clone());

    let mut stream = service.start(Request::new("Remove customers who opted out"));
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    let result = stream.finish().await.unwrap();

    assert!(!result.success);
    assert_eq!(result.attempts, 1);
    assert!(result.error.unwrap().starts_with("SECURITY VIOLATION: DELETE"));
    assert_eq!(provider.calls_to(prompts::VALIDATOR_ROLE), 0);
    assert!(events.iter().any(|e| e.kind == EventKind::Error));
    assert_eq!(events.last().unwrap().kind, EventKind::EndOfStream);

    let rows = executor.execute("SELECT COUNT(*) AS n FROM customers").await.unwrap();
    assert_eq!(rows[0]["n"], 3);
    assert!(store.all().await.unwrap().is_empty());
}

#[tokio::test]
async fn database_errors_feed_the_next_attempt() {
    let provider = Arc::new(
        ScriptedProvider::default()
            .on(prompts::DEPENDENCY_ROLE, NO_CONTEXT)
            .on(prompts::ROUTER_ROLE, TO_SQL)
            .on(prompts::GENERATOR_ROLE, &generated("SELECT emial FROM customers", 0.8))
            .on(prompts::GENERATOR_ROLE, &generated("SELECT email, data_source FROM customers", 0.9))
            .on(prompts::VALIDATOR_ROLE, APPROVED)
            .on(prompts::ANALYST_ROLE, "Three customers.")
            .on(prompts::GATE_ROLE, NO_MESSAGES),
    );
    let service = service(provider.clone(), crm().await, Arc::new(InMemoryChatStore::new()));

    let mut stream = service.start(Request::new("List every customer email"));
    while stream.next().await.is_some() {}
    let result = stream.finish().await.unwrap();

    assert!(result.success);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.statement.as_deref(), Some("SELECT email, data_source FROM customers"));
    assert_eq!(result.outcome.unwrap().rows.len(), 3);
    assert!(result.steps[0].contains("emial"));
    // The failed execution never reached the judge.
    assert_eq!(provider.calls_to(prompts::VALIDATOR_ROLE), 1);

    let retry = provider.generator_prompts();
    assert!(retry[1].contains("emial"));
}

#[tokio::test]
async fn follow_up_uses_the_persisted_transcript() {
    let provider = Arc::new(
        ScriptedProvider::default()
            .on(prompts::DEPENDENCY_ROLE, NO_CONTEXT)
            .on(
                prompts::DEPENDENCY_ROLE,
                r#"{"needs_context": true, "confidence": 0.9, "reasoning": "refers to them"}"#,
            )
            .on(prompts::CONTEXT_EXTRACTION_ROLE, "Customers from Shopify")
            .on(prompts::CONTEXT_REWRITE_ROLE, "How many Shopify customers accept marketing?")
            .on(prompts::ROUTER_ROLE, TO_SQL)
            .on(prompts::GENERATOR_ROLE, &generated("SELECT email, data_source FROM customers WHERE data_source = 'shopify'", 0.9))
            .on(prompts::VALIDATOR_ROLE, APPROVED)
            .on(prompts::ANALYST_ROLE, "Done.")
            .on(prompts::GATE_ROLE, NO_MESSAGES),
    );
    let store = Arc::new(SqliteChatStore::new("sqlite::memory:").await.unwrap());
    let service = service(provider.clone(), crm().await, store.clone());

    collect(&service, Request::new("Show customers from Shopify")).await;
    assert!(wait_for_turns(store.as_ref(), 1).await);

    let events = collect(&service, Request::new("Which of them accept marketing?")).await;
    assert!(events.iter().any(|e| e.content.contains("How many Shopify customers accept marketing?")));
    assert!(wait_for_turns(store.as_ref(), 2).await);

    // The transcript keeps what the user typed.
    let turns = service.history().await.unwrap();
    assert_eq!(turns[1].message, "Which of them accept marketing?");

    service.clear_history().await.unwrap();
    assert!(service.history().await.unwrap().is_empty());
}

#[tokio::test]
async fn gateway_streams_sse_frames_for_a_request() {
    let provider = Arc::new(
        ScriptedProvider::default()
            .on(prompts::DEPENDENCY_ROLE, NO_CONTEXT)
            .on(
                prompts::ROUTER_ROLE,
                r#"{"should_use_sql_agent": false, "reasoning": "greeting", "confidence_score": 0.95, "query_type": "general"}"#,
            )
            .on(prompts::DIRECT_ANSWER_ROLE, "Hello! Ask me about your customers."),
    );
    let service = service(provider, crm().await, Arc::new(InMemoryChatStore::new()));
    let app = build_router(Arc::new(GatewayState { service }));

    let response = app
        .oneshot(
            HttpRequest::builder()
                .uri("/stream?message=hello&session_id=web-7")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    let kinds: Vec<&str> = body.lines().filter_map(|l| l.strip_prefix("event: ")).collect();

    assert_eq!(kinds.last(), Some(&"end_of_stream"));
    assert!(kinds.contains(&"partial_answer"));
    assert!(!kinds.contains(&"query_emitted"));
    assert!(body.contains("\"correlation_id\":\"web-7\""));
}
