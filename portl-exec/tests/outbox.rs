mod support;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use portl_exec::connectors::StaticResolver;
use portl_exec::outbox::{OutboxIntent, OutboxRecord, OutboxRelay, OutboxStatus, OutboxStore, RelayConfig};
use portl_exec::{ConnectorError, RunStatus};
use serde_json::json;
use support::{engine, job, response, seed, FakeDb, FakeHttp};

const OUTBOX_JOB: &str = r#"
id: orders
connections:
  db: { type: postgres, config: { host: localhost } }
  hooks:
    type: http
    config:
      base_url: "https://hooks.example.com"
      headers: { X-Tenant: acme, Authorization: "Bearer ${API_TOKEN}" }
steps:
  - id: save
    type: db.upsert
    connection: db
    table: orders
    key: [id]
    mapping: { id: "{{ order_id }}", total: 42 }
  - id: announce
    type: outbox.enqueue
    connection: db
    target: hooks
    path: "/orders/{{ steps.save.id }}"
    body: { id: "{{ steps.save.id }}", total: "{{ steps.save.total }}" }
    dedup_key: "order-{{ steps.save.id }}"
"#;

#[tokio::test]
async fn enqueue_writes_inside_the_transaction() {
    let db = FakeDb::new();
    let resolver = StaticResolver::new().with("db", db.handle());
    let (engine, _) = engine(resolver);
    let job = job(OUTBOX_JOB);

    let report = engine.run(&job, seed(json!({ "order_id": 7 })), false).await.unwrap();

    assert_eq!(report.status, RunStatus::Committed);
    assert_eq!(report.outputs["announce"], json!({ "enqueued": true, "dedup_key": "order-7" }));
    assert_eq!(db.count("execute outbox"), 1);

    let stored = db.state.lock().unwrap().outbox.clone();
    let intent: OutboxIntent = serde_json::from_value(stored["order-7"].clone()).unwrap();
    assert_eq!(intent.url, "https://hooks.example.com/orders/7");
    assert_eq!(intent.method, "POST");
    assert!(intent.headers.is_empty(), "{:?}", intent.headers);
    assert_eq!(intent.target.as_deref(), Some("hooks"));
    assert_eq!(intent.body, json!({ "id": 7, "total": 42 }));
    assert_eq!(intent.step_id, "announce");
    assert_eq!(intent.run_id, report.run_id);
    let written = format!("{:?}", db.executed());
    assert!(!written.contains("tok-secret-123"), "{written}");

    let again = engine.run(&job, seed(json!({ "order_id": 7 })), false).await.unwrap();
    assert_eq!(again.outputs["announce"]["enqueued"], json!(false));
    assert_eq!(db.state.lock().unwrap().outbox.len(), 1);
}

#[tokio::test]
async fn rolled_back_runs_leave_no_intent() {
    let db = FakeDb::new();
    let resolver = StaticResolver::new().with("db", db.handle());
    let (engine, _) = engine(resolver);
    let yaml = format!(
        "{OUTBOX_JOB}  - id: dup
    type: db.insert
    connection: db
    table: orders
    mapping: {{ id: \"{{{{ order_id }}}}\" }}
"
    );

    let report = engine.run(&job(&yaml), seed(json!({ "order_id": 7 })), false).await.unwrap();

    assert_eq!(report.status, RunStatus::RolledBack);
    assert_eq!(report.error.unwrap().step_id, "dup");
    assert!(db.state.lock().unwrap().outbox.is_empty());
}

#[tokio::test]
async fn secret_step_headers_are_not_enqueued() {
    let db = FakeDb::new();
    let resolver = StaticResolver::new().with("db", db.handle());
    let (engine, _) = engine(resolver);
    let yaml = OUTBOX_JOB.replace(
        "    dedup_key:",
        "    headers: { X-Upstream-Key: \"${API_TOKEN}\" }\n    dedup_key:",
    );

    let report = engine.run(&job(&yaml), seed(json!({ "order_id": 7 })), false).await.unwrap();

    assert_eq!(report.status, RunStatus::RolledBack);
    let error = report.error.unwrap();
    assert_eq!(error.step_id, "announce");
    assert_eq!(error.error, "config");
    assert!(error.message.contains("X-Upstream-Key"), "{}", error.message);
    assert_eq!(db.count("execute outbox"), 0);
    assert!(db.state.lock().unwrap().outbox.is_empty());
}

#[derive(Default)]
struct MemoryStore {
    records: Mutex<Vec<OutboxRecord>>,
}

impl MemoryStore {
    fn with(intents: Vec<OutboxIntent>) -> Self {
        let records = intents
            .into_iter()
            .enumerate()
            .map(|(i, intent)| OutboxRecord {
                id: i as i64 + 1,
                intent,
                status: OutboxStatus::Pending,
                attempts: 0,
                last_error: None,
            })
            .collect();
        Self {
            records: Mutex::new(records),
        }
    }

    fn status(&self, id: i64) -> (OutboxStatus, u32, Option<String>) {
        let records = self.records.lock().unwrap();
        let r = records.iter().find(|r| r.id == id).unwrap();
        (r.status, r.attempts, r.last_error.clone())
    }

    fn update(&self, id: i64, f: impl FnOnce(&mut OutboxRecord)) {
        let mut records = self.records.lock().unwrap();
        if let Some(r) = records.iter_mut().find(|r| r.id == id) {
            f(r);
        }
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn claim_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, ConnectorError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|r| r.status == OutboxStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_delivered(&self, id: i64) -> Result<(), ConnectorError> {
        self.update(id, |r| {
            r.status = OutboxStatus::Delivered;
            r.attempts += 1;
        });
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), ConnectorError> {
        self.update(id, |r| {
            r.attempts += 1;
            r.last_error = Some(error.to_string());
        });
        Ok(())
    }

    async fn move_to_dead_letter(&self, id: i64, error: &str) -> Result<(), ConnectorError> {
        self.update(id, |r| {
            r.status = OutboxStatus::DeadLetter;
            r.attempts += 1;
            r.last_error = Some(error.to_string());
        });
        Ok(())
    }
}

fn intent(key: &str) -> OutboxIntent {
    OutboxIntent {
        dedup_key: key.to_string(),
        job_id: "orders".to_string(),
        run_id: uuid::Uuid::new_v4(),
        step_id: "announce".to_string(),
        target: Some("hooks".to_string()),
        method: "POST".to_string(),
        url: format!("https://hooks.example.com/{key}"),
        headers: Default::default(),
        body: json!({ "key": key }),
    }
}

fn relay(store: &Arc<MemoryStore>, http: &FakeHttp, max_attempts: u32) -> OutboxRelay {
    let env = BTreeMap::from([("API_TOKEN".to_string(), "hook-token-1".to_string())]);
    OutboxRelay::new(
        store.clone(),
        Arc::new(http.clone()),
        RelayConfig {
            max_attempts,
            ..RelayConfig::default()
        },
    )
    .with_targets(&job(OUTBOX_JOB).connections, env)
}

#[tokio::test]
async fn relay_delivers_with_the_dedup_key() {
    let store = Arc::new(MemoryStore::with(vec![intent("a"), intent("b")]));
    let http = FakeHttp::ok(json!({}));

    let stats = relay(&store, &http, 3).relay_once().await.unwrap();

    assert_eq!(stats.claimed, 2);
    assert_eq!(stats.delivered, 2);
    assert_eq!(store.status(1).0, OutboxStatus::Delivered);
    let requests = http.requests();
    assert_eq!(requests[0].headers["Idempotency-Key"], "a");
    assert_eq!(requests[0].headers["content-type"], "application/json");
    assert_eq!(requests[1].url.as_str(), "https://hooks.example.com/b");
    assert_eq!(requests[0].headers["X-Tenant"], "acme");
    assert_eq!(requests[0].headers["Authorization"], "Bearer hook-token-1");

    let stats = relay(&store, &http, 3).relay_once().await.unwrap();
    assert_eq!(stats.claimed, 0);
}

#[tokio::test]
async fn failed_delivery_stays_pending_then_succeeds() {
    let store = Arc::new(MemoryStore::with(vec![intent("a")]));
    let http = FakeHttp::ok(json!({})).then(Ok(response(503, json!({}))));
    let relay = relay(&store, &http, 3);

    let first = relay.relay_once().await.unwrap();
    assert_eq!(first.failed, 1);
    let (status, attempts, last_error) = store.status(1);
    assert_eq!(status, OutboxStatus::Pending);
    assert_eq!(attempts, 1);
    assert_eq!(last_error.as_deref(), Some("HTTP 503"));

    let second = relay.relay_once().await.unwrap();
    assert_eq!(second.delivered, 1);
    assert_eq!(store.status(1).0, OutboxStatus::Delivered);
}

#[tokio::test]
async fn repeated_failures_dead_letter_the_intent() {
    let store = Arc::new(MemoryStore::with(vec![intent("a")]));
    let http = FakeHttp::with_handler(|_| Ok(response(500, json!({}))));
    let relay = relay(&store, &http, 2);

    relay.relay_once().await.unwrap();
    let stats = relay.relay_once().await.unwrap();

    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(store.status(1).0, OutboxStatus::DeadLetter);
    assert_eq!(relay.relay_once().await.unwrap().claimed, 0);
}

#[tokio::test(start_paused = true)]
async fn relay_loop_stops_on_cancel() {
    let store = Arc::new(MemoryStore::with(vec![intent("a")]));
    let http = FakeHttp::ok(json!({}));
    let relay = relay(&store, &http, 3);
    let cancel = tokio_util::sync::CancellationToken::new();

    let (total, _) = tokio::join!(relay.run(&cancel), async {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        cancel.cancel();
    });

    let total = total.unwrap();
    assert_eq!(total.delivered, 1);
    assert_eq!(http.requests().len(), 1);
}

#[tokio::test]
async fn unknown_target_fails_the_delivery() {
    let mut orphan = intent("a");
    orphan.target = Some("gone".to_string());
    let store = Arc::new(MemoryStore::with(vec![orphan]));
    let http = FakeHttp::ok(json!({}));

    let stats = relay(&store, &http, 3).relay_once().await.unwrap();

    assert_eq!(stats.failed, 1);
    let (status, _, last_error) = store.status(1);
    assert_eq!(status, OutboxStatus::Pending);
    assert!(last_error.unwrap().contains("'gone'"));
    assert!(http.requests().is_empty());
}
