mod support;

use std::sync::Arc;

use portl_exec::connectors::StaticResolver;
use portl_exec::{RunReport, RunStatus};
use serde_json::json;
use support::{engine, job, seed, FakeDb, FakeFunction, FakeHttp, FakeRowSource};

const PREVIEW_JOB: &str = r#"
id: preview
connections:
  db: { type: postgres, config: { host: localhost, password: "${DB_PASSWORD:-pw-secret-xyz}" } }
  api:
    type: http
    config:
      base_url: "https://api.example.com"
      headers: { Authorization: "Bearer ${API_TOKEN}" }
  fn: { type: lambda, config: { function_name: pricing } }
steps:
  - id: read
    type: csv.read
    path: items.csv
  - id: upsert
    type: db.upsert
    connection: db
    table: items
    key: [sku]
    mapping: { sku: "{{ row.sku }}", region: "${REGION}" }
    batch: { from: steps.read.rows, as: row }
  - id: notify
    type: conditional
    when: "steps.upsert[idx].was_inserted"
    batch: { from: steps.read.rows, as: row }
    then:
      - id: announce
        type: api.call
        connection: api
        method: POST
        path: "/items/{{ row.sku }}"
        body: { sku: "{{ row.sku }}" }
  - id: total
    type: db.query
    connection: db
    query: "SELECT count(*) AS n FROM items WHERE region = ${REGION}"
  - id: price
    type: lambda.invoke
    connection: fn
    payload: { rows: "{{ r }}", note: "{{ missing_value }}" }
    batch: { from: steps.total.rows, as: r }
  - id: enqueue
    type: outbox.enqueue
    connection: db
    target: api
    path: /done
    dedup_key: "preview-{{ length(steps.read.rows) }}"
"#;

struct Fixture {
    db: FakeDb,
    http: FakeHttp,
    function: FakeFunction,
    rows: FakeRowSource,
}

async fn preview() -> (Fixture, RunReport) {
    let fixture = Fixture {
        db: FakeDb::new(),
        http: FakeHttp::ok(json!({})),
        function: FakeFunction::new(|_, _| Ok(json!({}))),
        rows: FakeRowSource::new((1..=5).map(|i| json!({ "sku": format!("S{i}") })).collect()),
    };
    let resolver = StaticResolver::new()
        .with("db", fixture.db.handle())
        .with("api", fixture.http.handle())
        .with("fn", fixture.function.handle());
    let (engine, _) = engine(resolver);
    let engine = engine.with_files(Arc::new(fixture.rows.clone()));

    let report = engine.run(&job(PREVIEW_JOB), seed(json!({})), true).await.unwrap();
    (fixture, report)
}

#[tokio::test]
async fn dry_run_makes_no_mutating_calls() {
    let (fx, report) = preview().await;

    assert_eq!(report.status, RunStatus::DryRunComplete);
    assert!(!report.committed);
    assert!(report.error.is_none());
    assert!(fx.db.calls().is_empty());
    assert!(fx.http.requests().is_empty());
    assert!(fx.function.calls().is_empty());
    assert_eq!(report.transaction.begins, 0);
}

#[tokio::test]
async fn file_reads_are_real_but_sampled() {
    let (fx, report) = preview().await;

    assert_eq!(fx.rows.reads().len(), 1);
    assert_eq!(report.outputs["read"]["count"], json!(3));

    let plan = report.plan.unwrap();
    let upserts: Vec<_> = plan.operations().filter(|s| s.id == "upsert").collect();
    assert_eq!(upserts.len(), 3);
    assert_eq!(upserts.iter().map(|s| s.idx).collect::<Vec<_>>(), vec![Some(0), Some(1), Some(2)]);
}

#[tokio::test]
async fn simulated_condition_plans_the_then_branch() {
    let (_, report) = preview().await;
    let plan = report.plan.unwrap();

    let announces: Vec<_> = plan.operations().filter(|s| s.id == "announce").collect();
    assert_eq!(announces.len(), 3);
    let op = announces[0].operation.as_ref().unwrap();
    assert_eq!(op["method"], json!("POST"));
    assert_eq!(op["url"], json!("https://api.example.com/items/S1"));
    assert!(plan
        .warnings
        .iter()
        .any(|w| w.step_id == "notify" && w.message.contains("simulated")));
}

#[tokio::test]
async fn env_placeholders_in_sql_are_bound_parameters() {
    let (_, report) = preview().await;
    let plan = report.plan.unwrap();

    let total = plan.operations().find(|s| s.id == "total").unwrap();
    let op = total.operation.as_ref().unwrap();
    assert!(op["statement"].as_str().unwrap().contains("region = $1"));
    assert_eq!(op["params"], json!(["eu-west-1"]));
}

#[tokio::test]
async fn simulated_batch_source_plans_one_item() {
    let (_, report) = preview().await;
    let plan = report.plan.unwrap();

    assert_eq!(plan.operations().filter(|s| s.id == "price").count(), 1);
    assert!(plan
        .warnings
        .iter()
        .any(|w| w.step_id == "price" && w.message.contains("one item")));
}

#[tokio::test]
async fn unresolved_references_become_warnings() {
    let (_, report) = preview().await;
    let plan = report.plan.unwrap();

    assert!(plan
        .warnings
        .iter()
        .any(|w| w.step_id == "price" && w.message.contains("missing_value")));
}

#[tokio::test]
async fn plan_never_contains_secrets() {
    let (_, report) = preview().await;

    let text = serde_json::to_string(&report).unwrap();
    assert!(!text.contains("tok-secret-123"), "{text}");
    assert!(!text.contains("pw-secret-xyz"), "{text}");
    assert!(text.contains("<redacted>"));

    let plan = report.plan.unwrap();
    let enqueue = plan.operations().find(|s| s.id == "enqueue").unwrap();
    assert!(enqueue.operation.as_ref().unwrap()["statement"]
        .as_str()
        .unwrap()
        .contains("portl_outbox"));
}

#[tokio::test]
async fn template_errors_still_fail_a_dry_run() {
    let (engine, _) = engine(StaticResolver::new());
    let yaml = r#"
id: broken
steps:
  - id: read
    type: file.read
    path: "{{ 1 / 0 }}"
"#;

    let report = engine.run(&job(yaml), seed(json!({})), true).await.unwrap();

    assert_eq!(report.status, RunStatus::DryRunComplete);
    assert_eq!(report.error.unwrap().error, "template");
    assert!(report.plan.is_some());
}
