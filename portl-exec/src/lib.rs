#![forbid(unsafe_code)]

//! Execution engine for portl jobs.
//!
//! Job documents are parsed and validated by `portl-core`; this crate renders
//! each step against the run context, drives the connectors under retry
//! policies and keeps every DB write in one transaction that commits only
//! when the whole run succeeds.

pub mod connectors;
pub mod context;
pub mod dry_run;
pub mod error;
pub mod executor;
pub mod outbox;
pub mod retry;
pub mod secrets;
pub mod transaction;

pub use crate::dry_run::{DryRunPlan, PlanWarning, PlannedStep};
pub use crate::error::{ConnectorError, ErrorClass, RunError, StepError};
pub use crate::executor::{Engine, EngineConfig, FailureReport, RunLimits, RunReport, RunStatus, StepReport, StepStatus};
