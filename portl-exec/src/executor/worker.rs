use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use portl_core::types::FailureKind;
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connectors::{
    ConnectionHandle, FunctionInvoker, HttpClient, HttpRequestParts, ReadSpec, RowSource, SqlCommand, SqlConnector,
};
use crate::error::{ConnectorError, StepError};
use crate::executor::events::EventSink;
use crate::executor::render::{status_error, HttpCall, PreparedCall, SqlShape};
use crate::executor::types::RunLimits;
use crate::retry::{parse_retry_after, Attempt, Observer, RetryController, RetryOutcome, RetryPolicy};
use crate::transaction::TransactionManager;

/// Everything one step execution needs to drive its connector under a retry
/// policy. Cheap to copy; concurrent batch items each get their own.
#[derive(Clone, Copy)]
pub struct Worker<'a> {
    pub run_id: Uuid,
    pub step_id: &'a str,
    pub idx: Option<usize>,
    pub policy: &'a RetryPolicy,
    pub events: &'a dyn EventSink,
    pub cancel: &'a CancellationToken,
    pub limits: &'a RunLimits,
}

impl<'a> Worker<'a> {
    fn controller(&self) -> RetryController<'a> {
        RetryController::new(self.policy, self.cancel).observed(Observer {
            sink: self.events,
            run_id: self.run_id,
            step_id: self.step_id,
            idx: self.idx,
        })
    }

    pub async fn read(&self, source: &dyn RowSource, spec: &ReadSpec) -> RetryOutcome<JsonValue> {
        let mut op = ReadAttempt { source, spec };
        self.controller().run(&mut op).await
    }

    pub async fn sql(
        &self,
        tx: &mut TransactionManager,
        connection: &str,
        connector: &dyn SqlConnector,
        command: &SqlCommand,
        shape: &SqlShape,
    ) -> RetryOutcome<JsonValue> {
        let mut op = SqlAttempt {
            tx,
            connection,
            connector,
            command,
            shape,
        };
        self.controller().run(&mut op).await
    }

    /// `lambda.invoke` and `api.call`; anything else is a wiring mistake.
    pub async fn external(&self, handle: &ConnectionHandle, call: &PreparedCall) -> RetryOutcome<JsonValue> {
        match (handle, call) {
            (ConnectionHandle::Function(invoker), PreparedCall::Function { function, payload, .. }) => {
                let mut op = FunctionAttempt {
                    invoker: invoker.as_ref(),
                    function,
                    payload,
                    timeout: self.limits.call_timeout,
                };
                self.controller().run(&mut op).await
            }
            (ConnectionHandle::Http(client), PreparedCall::Http { call, .. }) => {
                let request = match call.to_request() {
                    Ok(r) => r,
                    Err(e) => return RetryOutcome { result: Err(e), attempts: 0 },
                };
                let mut op = HttpAttempt {
                    client: client.as_ref(),
                    call,
                    request,
                    timeout: self.limits.call_timeout,
                    max_bytes: self.limits.max_response_bytes,
                };
                self.controller().run(&mut op).await
            }
            (handle, _) => RetryOutcome {
                result: Err(StepError::Config(format!(
                    "step '{}': connection resolved to a {} handle",
                    self.step_id,
                    handle.kind_name()
                ))),
                attempts: 0,
            },
        }
    }
}

struct ReadAttempt<'a> {
    source: &'a dyn RowSource,
    spec: &'a ReadSpec,
}

#[async_trait]
impl Attempt for ReadAttempt<'_> {
    type Output = JsonValue;

    async fn attempt(&mut self, _attempt_no: u32) -> Result<JsonValue, ConnectorError> {
        let rows: Vec<JsonValue> = self.source.read(self.spec).await?.try_collect().await?;
        Ok(json!({ "count": rows.len(), "rows": rows }))
    }
}

struct SqlAttempt<'a> {
    tx: &'a mut TransactionManager,
    connection: &'a str,
    connector: &'a dyn SqlConnector,
    command: &'a SqlCommand,
    shape: &'a SqlShape,
}

#[async_trait]
impl Attempt for SqlAttempt<'_> {
    type Output = JsonValue;

    async fn attempt(&mut self, _attempt_no: u32) -> Result<JsonValue, ConnectorError> {
        let outcome = self.tx.execute(self.connection, self.connector, self.command).await?;
        Ok(self.shape.apply(&outcome))
    }
}

struct FunctionAttempt<'a> {
    invoker: &'a dyn FunctionInvoker,
    function: &'a str,
    payload: &'a JsonValue,
    timeout: Duration,
}

#[async_trait]
impl Attempt for FunctionAttempt<'_> {
    type Output = JsonValue;

    async fn attempt(&mut self, _attempt_no: u32) -> Result<JsonValue, ConnectorError> {
        match tokio::time::timeout(self.timeout, self.invoker.invoke(self.function, self.payload)).await {
            Ok(res) => res,
            Err(_) => Err(ConnectorError::new(
                FailureKind::Timeout,
                format!("function '{}' did not answer within {:?}", self.function, self.timeout),
            )),
        }
    }
}

struct HttpAttempt<'a> {
    client: &'a dyn HttpClient,
    call: &'a HttpCall,
    request: HttpRequestParts,
    timeout: Duration,
    max_bytes: usize,
}

#[async_trait]
impl Attempt for HttpAttempt<'_> {
    type Output = JsonValue;

    async fn attempt(&mut self, attempt_no: u32) -> Result<JsonValue, ConnectorError> {
        tracing::debug!(method = %self.call.method, attempt_no, "sending request");
        let resp = self
            .client
            .send(self.request.clone(), self.timeout, self.max_bytes)
            .await
            .map_err(ConnectorError::from)?;
        if !self.call.accepts(resp.status) {
            let retry_after = parse_retry_after(&resp.headers, SystemTime::now());
            return Err(status_error(self.call, resp.status, retry_after));
        }
        Ok(json!({
            "status": resp.status,
            "headers": resp.headers,
            "body": resp.body_value(),
        }))
    }
}
