mod redact;
mod value;

pub use redact::{looks_secret, redact_headers, RedactionPolicy, Redactor, REDACTED};
pub use value::SecretValue;
