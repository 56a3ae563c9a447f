use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ConnectorError, StepError};
use crate::executor::events::{Event, EventSink};
use crate::retry::config::RetryPolicy;
use crate::retry::decision::{decide_retry, RetryDecision, RetryReason};

/// One connector call that may be repeated.
#[async_trait]
pub trait Attempt: Send {
    type Output: Send;

    async fn attempt(&mut self, attempt_no: u32) -> Result<Self::Output, ConnectorError>;
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, StepError>,
    pub attempts: u32,
}

/// Where attempt and retry events go.
#[derive(Clone, Copy)]
pub struct Observer<'a> {
    pub sink: &'a dyn EventSink,
    pub run_id: Uuid,
    pub step_id: &'a str,
    pub idx: Option<usize>,
}

/// Runs an [`Attempt`] until it succeeds, fails permanently, runs out of
/// attempts or the run is cancelled.
pub struct RetryController<'a> {
    policy: &'a RetryPolicy,
    cancel: &'a CancellationToken,
    observer: Option<Observer<'a>>,
}

impl<'a> RetryController<'a> {
    pub fn new(policy: &'a RetryPolicy, cancel: &'a CancellationToken) -> Self {
        Self {
            policy,
            cancel,
            observer: None,
        }
    }

    pub fn observed(mut self, observer: Observer<'a>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub async fn run<A: Attempt>(&self, op: &mut A) -> RetryOutcome<A::Output> {
        let mut attempt_no = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(StepError::Cancelled),
                    attempts: attempt_no,
                };
            }
            attempt_no += 1;
            self.emit(|run_id, step_id, idx| Event::AttemptStarted {
                run_id,
                step_id,
                idx,
                attempt_no,
            })
            .await;

            let res = op.attempt(attempt_no).await;
            let succeeded = res.is_ok();
            self.emit(|run_id, step_id, idx| Event::AttemptFinished {
                run_id,
                step_id,
                idx,
                attempt_no,
                succeeded,
            })
            .await;

            let err = match res {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt_no,
                    }
                }
                Err(err) => err,
            };

            match decide_retry(self.policy, attempt_no, &err, || fastrand::u64(..)) {
                RetryDecision::RetryAfter { delay, .. } => {
                    tracing::debug!(kind = %err.kind, attempt_no, delay_ms = delay.as_millis() as u64, "retrying");
                    let kind = err.kind;
                    self.emit(|run_id, step_id, idx| Event::StepRetryScheduled {
                        run_id,
                        step_id,
                        idx,
                        delay_ms: delay.as_millis() as u64,
                        kind,
                    })
                    .await;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            return RetryOutcome { result: Err(StepError::Cancelled), attempts: attempt_no };
                        }
                    }
                }
                RetryDecision::Stop {
                    reason: RetryReason::AttemptsExhausted,
                } => {
                    return RetryOutcome {
                        result: Err(StepError::RetryExhausted {
                            attempts: attempt_no,
                            last: err,
                        }),
                        attempts: attempt_no,
                    }
                }
                RetryDecision::Stop { .. } => {
                    return RetryOutcome {
                        result: Err(StepError::Connector(err)),
                        attempts: attempt_no,
                    }
                }
            }
        }
    }

    async fn emit(&self, make: impl FnOnce(Uuid, String, Option<usize>) -> Event) {
        if let Some(obs) = &self.observer {
            obs.sink.emit(make(obs.run_id, obs.step_id.to_string(), obs.idx)).await;
        }
    }
}
