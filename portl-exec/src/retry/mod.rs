mod config;
mod controller;
mod decision;
mod headers;

pub use config::{RetryDefaults, RetryPolicy};
pub use controller::{Attempt, Observer, RetryController, RetryOutcome};
pub use decision::{decide_retry, RetryDecision, RetryReason};
pub use headers::parse_retry_after;
pub(crate) use headers::get_header_ci;
