use portl_core::types::{ConnectionKind, ErrorPolicy, FailureKind, StepKind, TransactionScope};
use portl_core::{load_job_str, parse_job_str, validate_job, DocumentFormat, PortlError};

fn sync_job_yaml() -> &'static str {
    r#"
id: sync_versions
connections:
  warehouse:
    type: postgres
    config:
      host: ${PGHOST:-localhost}
      password: ${env:PGPASSWORD}
  versions_api:
    type: http
    config:
      base_url: https://api.example.com
steps:
  - id: read
    type: csv.read
    path: data/items.csv
  - id: upsert
    type: db.upsert
    connection: warehouse
    table: items
    key: [sku]
    mapping:
      sku: "{{ row.sku }}"
      payload: "{{ row | tojson }}"
      digest: "{{ row | hash }}"
    batch:
      from: "{{ steps.read.rows }}"
      as: row
    save_as: upserted
  - id: notify_new
    type: conditional
    when: "{{ upserted[idx].was_inserted }}"
    batch:
      from: steps.read.rows
      as: row
    then:
      - id: announce
        type: api.call
        connection: versions_api
        method: POST
        path: /versions
        idempotency_key: "{{ row.sku }}-{{ length(upserted) }}"
        body:
          sku: "{{ row.sku }}"
        retry:
          max_attempts: 4
          backoff_ms: 250
          retry_on: [timeout, http_5xx]
"#
}

#[test]
fn parse_yaml_and_validate_ok() {
    let parsed = parse_job_str(sync_job_yaml(), DocumentFormat::Yaml).unwrap();
    validate_job(&parsed.job).unwrap();

    let job = parsed.job;
    assert_eq!(job.id, "sync_versions");
    assert_eq!(job.transaction.scope, TransactionScope::Db);
    assert_eq!(job.on_error, ErrorPolicy::Halt);
    assert_eq!(job.connections["warehouse"].kind, ConnectionKind::Postgres);
    assert_eq!(job.walk_steps().len(), 4);

    let announce = job.find_step("announce").unwrap();
    let retry = announce.retry.as_ref().unwrap();
    assert_eq!(retry.max_attempts, 4);
    assert_eq!(retry.retry_on.as_deref(), Some(&[FailureKind::Timeout, FailureKind::Http5xx][..]));
    assert!(matches!(job.steps[0].kind, StepKind::FileRead(_)));
}

#[test]
fn parse_auto_detects_yaml() {
    let parsed = parse_job_str(sync_job_yaml(), DocumentFormat::Auto).unwrap();
    assert_eq!(parsed.format, DocumentFormat::Yaml);
}

#[test]
fn parse_auto_detects_json() {
    let json = r#"{ "id": "j", "steps": [ { "id": "r", "type": "file.read", "path": "a.csv" } ] }"#;
    let parsed = parse_job_str(json, DocumentFormat::Auto).unwrap();
    assert_eq!(parsed.format, DocumentFormat::Json);
    validate_job(&parsed.job).unwrap();
}

#[test]
fn unknown_step_type_fails_to_parse() {
    let bad = r#"
steps:
  - id: s1
    type: shell.exec
    command: rm -rf /
"#;
    let err = parse_job_str(bad, DocumentFormat::Yaml).unwrap_err();
    assert!(format!("{err}").contains("YAML"));
}

#[test]
fn empty_job_is_rejected() {
    let err = load_job_str("id: empty\nsteps: []\n", DocumentFormat::Yaml).unwrap_err();
    match err {
        PortlError::Validation(v) => assert!(v.has_path("$.steps")),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn duplicate_ids_are_rejected_across_nesting() {
    let bad = r#"
steps:
  - id: a
    type: file.read
    path: x.csv
  - id: branch
    type: conditional
    when: "true"
    then:
      - id: a
        type: file.read
        path: y.csv
"#;
    let parsed = parse_job_str(bad, DocumentFormat::Yaml).unwrap();
    let err = validate_job(&parsed.job).unwrap_err();
    assert!(err.has_path("$.steps[1].then[0].id"));
}

#[test]
fn reserved_names_cannot_be_bound() {
    let bad = r#"
steps:
  - id: read
    type: file.read
    path: x.csv
    save_as: steps
  - id: again
    type: file.read
    path: "{{ item }}"
    batch:
      from: "[1, 2]"
      as: idx
"#;
    let parsed = parse_job_str(bad, DocumentFormat::Yaml).unwrap();
    let err = validate_job(&parsed.job).unwrap_err();
    assert!(err.has_path("$.steps[0].save_as"));
    assert!(err.has_path("$.steps[1].batch.as"));
}

#[test]
fn db_steps_need_a_known_postgres_connection() {
    let bad = r#"
connections:
  api:
    type: http
    config: {}
steps:
  - id: no_conn
    type: db.query
    query: select 1
  - id: wrong_kind
    type: db.insert
    connection: api
    table: t
    mapping: { a: 1 }
  - id: dangling
    type: db.update
    connection: nope
    table: t
    key: [a]
    mapping: { a: 1, b: 2 }
"#;
    let parsed = parse_job_str(bad, DocumentFormat::Yaml).unwrap();
    let err = validate_job(&parsed.job).unwrap_err();
    assert!(err.has_path("$.steps[0].connection"));
    assert!(err.has_path("$.steps[1].connection"));
    assert!(err.has_path("$.steps[2].connection"));
}

#[test]
fn api_call_needs_a_connection_only_without_an_absolute_url() {
    let doc = r#"
steps:
  - id: ping
    type: api.call
    method: GET
    url: https://status.example.com/health
  - id: relative
    type: api.call
    path: /items
"#;
    let parsed = parse_job_str(doc, DocumentFormat::Yaml).unwrap();
    let err = validate_job(&parsed.job).unwrap_err();
    assert!(!err.has_path("$.steps[0].connection"));
    assert!(err.has_path("$.steps[1].connection"));
}

#[test]
fn shared_transaction_requires_one_database() {
    let bad = r#"
connections:
  a: { type: postgres }
  b: { type: postgres }
steps:
  - id: q1
    type: db.query
    connection: a
    query: select 1
  - id: q2
    type: db.query
    connection: b
    query: select 2
"#;
    let parsed = parse_job_str(bad, DocumentFormat::Yaml).unwrap();
    let err = validate_job(&parsed.job).unwrap_err();
    assert!(err.has_path("$.transaction.scope"));

    let relaxed = format!("transaction:\n  scope: none\n{bad}");
    let parsed = parse_job_str(&relaxed, DocumentFormat::Yaml).unwrap();
    validate_job(&parsed.job).unwrap();
}

#[test]
fn never_retryable_kinds_are_a_config_error() {
    let bad = r#"
connections:
  db: { type: postgres }
steps:
  - id: ins
    type: db.insert
    connection: db
    table: t
    mapping: { a: 1 }
    retry:
      max_attempts: 0
      retry_on: [db_deadlock, db_constraint]
"#;
    let parsed = parse_job_str(bad, DocumentFormat::Yaml).unwrap();
    let err = validate_job(&parsed.job).unwrap_err();
    assert!(err.has_path("$.steps[0].retry.max_attempts"));
    assert!(err.has_path("$.steps[0].retry.retry_on[1]"));
    assert!(!err.has_path("$.steps[0].retry.retry_on[0]"));
}

#[test]
fn templates_are_checked_for_syntax_functions_and_step_refs() {
    let bad = r#"
steps:
  - id: read
    type: file.read
    path: "{{ open('/etc/passwd') }}"
  - id: read2
    type: file.read
    path: "{{ steps.missing.rows }}"
  - id: read3
    type: file.read
    path: "{{ 1 + }}"
    when: "steps.read.count > 0"
"#;
    let parsed = parse_job_str(bad, DocumentFormat::Yaml).unwrap();
    let err = validate_job(&parsed.job).unwrap_err();
    let messages: Vec<String> = err.violations.iter().map(|v| v.to_string()).collect();
    assert!(messages.iter().any(|m| m.contains("unknown function 'open'")), "{messages:?}");
    assert!(messages.iter().any(|m| m.contains("unknown step 'missing'")), "{messages:?}");
    assert!(err.has_path("$.steps[2].path"));
    assert!(!err.has_path("$.steps[2].when"));
}

#[test]
fn upsert_key_must_be_mapped() {
    let bad = r#"
connections:
  db: { type: postgres }
steps:
  - id: up
    type: db.upsert
    connection: db
    table: "items; drop table x"
    key: [id]
    mapping: { sku: "{{ 1 }}" }
"#;
    let parsed = parse_job_str(bad, DocumentFormat::Yaml).unwrap();
    let err = validate_job(&parsed.job).unwrap_err();
    assert!(err.has_path("$.steps[0].table"));
    assert!(err.has_path("$.steps[0].key[0]"));
}

#[test]
fn connection_config_rejects_expressions() {
    let bad = r#"
connections:
  db:
    type: postgres
    config:
      host: "{{ steps.x }}"
steps:
  - id: q
    type: db.query
    connection: db
    query: select 1
"#;
    let parsed = parse_job_str(bad, DocumentFormat::Yaml).unwrap();
    let err = validate_job(&parsed.job).unwrap_err();
    assert!(err.has_path("$.connections.db.config.host"));
}
