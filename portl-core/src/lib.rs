#![forbid(unsafe_code)]

pub mod error;
pub mod expressions;
pub mod parser;
pub mod types;
pub mod validate;

pub use crate::error::{ParseError, PortlError, ValidationError, Violation};
pub use crate::parser::{parse_job_str, DocumentFormat, ParsedJob};
pub use crate::types::JobDefinition;
pub use crate::validate::{validate_job, validate_job_with, Validate};

/// Parse and validate in one go.
pub fn load_job_str(input: &str, format: DocumentFormat) -> Result<JobDefinition, PortlError> {
    let parsed = parse_job_str(input, format)?;
    validate_job(&parsed.job)?;
    Ok(parsed.job)
}
