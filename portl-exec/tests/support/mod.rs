//! In-memory connectors shared by the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use portl_core::types::{ConflictAction, FailureKind};
use portl_core::{parse_job_str, DocumentFormat, JobDefinition};
use portl_exec::connectors::{
    ConnectionHandle, FunctionInvoker, HttpClient, HttpError, HttpRequestParts, HttpResponseParts, ReadSpec, Row,
    RowSource, RowStream, SqlCommand, SqlConnector, SqlOutcome, SqlSession, StaticResolver,
};
use portl_exec::executor::MemoryEventSink;
use portl_exec::{ConnectorError, Engine, EngineConfig};
use serde_json::{json, Map, Value as JsonValue};

pub fn job(yaml: &str) -> JobDefinition {
    parse_job_str(yaml, DocumentFormat::Yaml).expect("job parses").job
}

pub fn engine(resolver: StaticResolver) -> (Engine, Arc<MemoryEventSink>) {
    engine_with(resolver, EngineConfig::default())
}

pub fn engine_with(resolver: StaticResolver, config: EngineConfig) -> (Engine, Arc<MemoryEventSink>) {
    let events = Arc::new(MemoryEventSink::new());
    let mut env = BTreeMap::new();
    env.insert("API_TOKEN".to_string(), "tok-secret-123".to_string());
    env.insert("REGION".to_string(), "eu-west-1".to_string());
    let engine = Engine::new(config, Arc::new(resolver))
        .with_events(events.clone())
        .with_env(env);
    (engine, events)
}

fn row(value: JsonValue) -> Row {
    value.as_object().cloned().unwrap_or_default()
}

fn key_of(table: &str, key: &[String], row: &Row) -> String {
    let parts: Vec<String> = key
        .iter()
        .map(|k| row.get(k).map(|v| v.to_string()).unwrap_or_default())
        .collect();
    format!("{table}:{}", parts.join(","))
}

/// Tables keyed by `table:key`, with visible commit/rollback semantics.
#[derive(Default)]
pub struct FakeDbState {
    pub committed: BTreeMap<String, Row>,
    pub outbox: BTreeMap<String, JsonValue>,
    /// `begin`, `savepoint portl_sp_1`, `execute upsert`, `commit`, ...
    pub calls: Vec<String>,
    pub executed: Vec<SqlCommand>,
    /// Failures returned by the next `execute` calls, in order.
    pub failures: VecDeque<ConnectorError>,
    /// Rows returned by the next `db.query`/`db.query_one`.
    pub query_rows: VecDeque<Vec<Row>>,
    /// Returned by the next `commit`.
    pub commit_error: Option<ConnectorError>,
    /// Serial `id` handed to upserted rows that arrive without one.
    pub next_id: Option<i64>,
}

#[derive(Clone, Default)]
pub struct FakeDb {
    pub state: Arc<Mutex<FakeDbState>>,
}

impl FakeDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::Sql(Arc::new(self.clone()))
    }

    pub fn fail_next(&self, err: ConnectorError) {
        self.state.lock().unwrap().failures.push_back(err);
    }

    pub fn answer_query(&self, rows: Vec<JsonValue>) {
        let rows = rows.into_iter().map(row).collect();
        self.state.lock().unwrap().query_rows.push_back(rows);
    }

    pub fn assign_ids_from(&self, first: i64) {
        self.state.lock().unwrap().next_id = Some(first);
    }

    pub fn fail_commit(&self, err: ConnectorError) {
        self.state.lock().unwrap().commit_error = Some(err);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn committed(&self) -> BTreeMap<String, Row> {
        self.state.lock().unwrap().committed.clone()
    }

    pub fn executed(&self) -> Vec<SqlCommand> {
        self.state.lock().unwrap().executed.clone()
    }
}

#[async_trait]
impl SqlConnector for FakeDb {
    async fn begin(&self) -> Result<Box<dyn SqlSession>, ConnectorError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("begin".to_string());
        let pending = st.committed.clone();
        let outbox = st.outbox.clone();
        Ok(Box::new(FakeSession {
            db: self.clone(),
            pending,
            outbox,
            savepoints: Vec::new(),
        }))
    }
}

type Snapshot = (BTreeMap<String, Row>, BTreeMap<String, JsonValue>);

struct FakeSession {
    db: FakeDb,
    pending: BTreeMap<String, Row>,
    outbox: BTreeMap<String, JsonValue>,
    savepoints: Vec<(String, Snapshot)>,
}

impl FakeSession {
    fn log(&self, call: String) {
        self.db.state.lock().unwrap().calls.push(call);
    }

    fn apply(&mut self, command: &SqlCommand) -> Result<SqlOutcome, ConnectorError> {
        match command {
            SqlCommand::Upsert { table, key, row: values } => {
                let k = key_of(table, key, values);
                let inserted = !self.pending.contains_key(&k);
                let mut stored = self.pending.get(&k).cloned().unwrap_or_default();
                if inserted && !values.contains_key("id") {
                    let mut st = self.db.state.lock().unwrap();
                    if let Some(id) = st.next_id.as_mut() {
                        stored.insert("id".to_string(), json!(*id));
                        *id += 1;
                    }
                }
                for (c, v) in values {
                    stored.insert(c.clone(), v.clone());
                }
                self.pending.insert(k, stored.clone());
                let mut out = stored;
                out.insert("was_inserted".to_string(), json!(inserted));
                Ok(SqlOutcome {
                    rows: vec![out],
                    affected: 1,
                })
            }
            SqlCommand::Insert {
                table,
                row: values,
                on_conflict,
                conflict_key,
            } => {
                let key = if conflict_key.is_empty() {
                    vec!["id".to_string()]
                } else {
                    conflict_key.clone()
                };
                let k = key_of(table, &key, values);
                if self.pending.contains_key(&k) {
                    return match on_conflict {
                        ConflictAction::Ignore => Ok(SqlOutcome::default()),
                        ConflictAction::Fail => Err(ConnectorError::permanent(
                            FailureKind::DbConstraint,
                            format!("duplicate key value violates unique constraint on {table}"),
                        )),
                    };
                }
                self.pending.insert(k, values.clone());
                Ok(SqlOutcome {
                    rows: vec![values.clone()],
                    affected: 1,
                })
            }
            SqlCommand::Update { table, key, row: values } => {
                let k = key_of(table, key, values);
                match self.pending.get_mut(&k) {
                    Some(existing) => {
                        for (c, v) in values {
                            existing.insert(c.clone(), v.clone());
                        }
                        Ok(SqlOutcome {
                            rows: vec![existing.clone()],
                            affected: 1,
                        })
                    }
                    None => Ok(SqlOutcome::default()),
                }
            }
            SqlCommand::Query { .. } => {
                let rows = self.db.state.lock().unwrap().query_rows.pop_front().unwrap_or_default();
                let affected = rows.len() as u64;
                Ok(SqlOutcome { rows, affected })
            }
            SqlCommand::OutboxInsert { intent, .. } => {
                if self.outbox.contains_key(&intent.dedup_key) {
                    return Ok(SqlOutcome::default());
                }
                let id = self.outbox.len() as i64 + 1;
                self.outbox
                    .insert(intent.dedup_key.clone(), serde_json::to_value(intent).unwrap());
                Ok(SqlOutcome {
                    rows: vec![row(json!({ "id": id }))],
                    affected: 1,
                })
            }
        }
    }
}

fn op_name(command: &SqlCommand) -> &'static str {
    match command {
        SqlCommand::Upsert { .. } => "upsert",
        SqlCommand::Insert { .. } => "insert",
        SqlCommand::Update { .. } => "update",
        SqlCommand::Query { .. } => "query",
        SqlCommand::OutboxInsert { .. } => "outbox",
    }
}

#[async_trait]
impl SqlSession for FakeSession {
    async fn execute(&mut self, command: &SqlCommand) -> Result<SqlOutcome, ConnectorError> {
        self.log(format!("execute {}", op_name(command)));
        let injected = {
            let mut st = self.db.state.lock().unwrap();
            st.executed.push(command.clone());
            st.failures.pop_front()
        };
        if let Some(err) = injected {
            return Err(err);
        }
        self.apply(command)
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), ConnectorError> {
        self.log(format!("savepoint {name}"));
        self.savepoints
            .push((name.to_string(), (self.pending.clone(), self.outbox.clone())));
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), ConnectorError> {
        self.log(format!("release {name}"));
        self.savepoints.retain(|(n, _)| n != name);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), ConnectorError> {
        self.log(format!("rollback_to {name}"));
        if let Some(pos) = self.savepoints.iter().position(|(n, _)| n == name) {
            let (pending, outbox) = self.savepoints[pos].1.clone();
            self.pending = pending;
            self.outbox = outbox;
            self.savepoints.truncate(pos + 1);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), ConnectorError> {
        let FakeSession { db, pending, outbox, .. } = *self;
        let mut st = db.state.lock().unwrap();
        st.calls.push("commit".to_string());
        if let Some(err) = st.commit_error.take() {
            return Err(err);
        }
        st.committed = pending;
        st.outbox = outbox;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), ConnectorError> {
        self.db.state.lock().unwrap().calls.push("rollback".to_string());
        Ok(())
    }
}

pub type HttpHandler = dyn Fn(&HttpRequestParts) -> Result<HttpResponseParts, HttpError> + Send + Sync;

/// Records requests; answers from a script first, then from the handler.
/// Non-GET requests sharing an idempotency key count as one effect.
#[derive(Clone)]
pub struct FakeHttp {
    requests: Arc<Mutex<Vec<HttpRequestParts>>>,
    script: Arc<Mutex<VecDeque<Result<HttpResponseParts, HttpError>>>>,
    handler: Arc<HttpHandler>,
}

pub fn response(status: u16, body: JsonValue) -> HttpResponseParts {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    HttpResponseParts {
        status,
        headers,
        body: serde_json::to_vec(&body).unwrap(),
    }
}

impl FakeHttp {
    pub fn ok(body: JsonValue) -> Self {
        Self::with_handler(move |_| Ok(response(200, body.clone())))
    }

    pub fn with_handler(
        handler: impl Fn(&HttpRequestParts) -> Result<HttpResponseParts, HttpError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            handler: Arc::new(handler),
        }
    }

    pub fn then(self, answer: Result<HttpResponseParts, HttpError>) -> Self {
        self.script.lock().unwrap().push_back(answer);
        self
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::Http(Arc::new(self.clone()))
    }

    pub fn requests(&self) -> Vec<HttpRequestParts> {
        self.requests.lock().unwrap().clone()
    }

    pub fn effects(&self, idempotency_header: &str) -> usize {
        let mut keys = std::collections::BTreeSet::new();
        let mut unkeyed = 0;
        for req in self.requests() {
            if req.method == "GET" {
                continue;
            }
            match req.headers.get(idempotency_header) {
                Some(k) => {
                    keys.insert(k.clone());
                }
                None => unkeyed += 1,
            }
        }
        keys.len() + unkeyed
    }
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn send(
        &self,
        req: HttpRequestParts,
        _timeout: Duration,
        _max_response_bytes: usize,
    ) -> Result<HttpResponseParts, HttpError> {
        self.requests.lock().unwrap().push(req.clone());
        if let Some(answer) = self.script.lock().unwrap().pop_front() {
            return answer;
        }
        (self.handler)(&req)
    }
}

pub type FunctionHandler = dyn Fn(&str, &JsonValue) -> Result<JsonValue, ConnectorError> + Send + Sync;

#[derive(Clone)]
pub struct FakeFunction {
    calls: Arc<Mutex<Vec<(String, JsonValue)>>>,
    handler: Arc<FunctionHandler>,
}

impl FakeFunction {
    pub fn new(handler: impl Fn(&str, &JsonValue) -> Result<JsonValue, ConnectorError> + Send + Sync + 'static) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            handler: Arc::new(handler),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::Function(Arc::new(self.clone()))
    }

    pub fn calls(&self) -> Vec<(String, JsonValue)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FunctionInvoker for FakeFunction {
    async fn invoke(&self, function: &str, payload: &JsonValue) -> Result<JsonValue, ConnectorError> {
        self.calls.lock().unwrap().push((function.to_string(), payload.clone()));
        (self.handler)(function, payload)
    }
}

/// Serves fixed rows regardless of path, honouring `limit`.
#[derive(Clone, Default)]
pub struct FakeRowSource {
    rows: Vec<JsonValue>,
    reads: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeRowSource {
    pub fn new(rows: Vec<JsonValue>) -> Self {
        Self {
            rows,
            reads: Arc::default(),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::Files(Arc::new(self.clone()))
    }

    pub fn reads(&self) -> Vec<PathBuf> {
        self.reads.lock().unwrap().clone()
    }
}

#[async_trait]
impl RowSource for FakeRowSource {
    async fn read(&self, spec: &ReadSpec) -> Result<RowStream, ConnectorError> {
        self.reads.lock().unwrap().push(spec.path.clone());
        let limit = spec.limit.unwrap_or(usize::MAX);
        let rows: Vec<Result<JsonValue, ConnectorError>> = self.rows.iter().take(limit).cloned().map(Ok).collect();
        Ok(stream::iter(rows).boxed())
    }
}

pub fn seed(value: JsonValue) -> Map<String, JsonValue> {
    value.as_object().cloned().unwrap_or_default()
}
