mod rules;
mod validator;

use crate::error::ValidationError;
use crate::expressions::EvalLimits;
use crate::types::JobDefinition;
pub use validator::Validator;

pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

impl Validate for JobDefinition {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_job(self)
    }
}

/// Check a job's structure, references and templates, collecting every violation.
pub fn validate_job(job: &JobDefinition) -> Result<(), ValidationError> {
    validate_job_with(job, &EvalLimits::default())
}

pub fn validate_job_with(job: &JobDefinition, limits: &EvalLimits) -> Result<(), ValidationError> {
    let mut v = Validator::new(*limits);
    v.validate_job(job);
    v.finish()
}
