use crate::error::ParseError;
use crate::types::JobDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
    Auto,
}

impl DocumentFormat {
    /// Guess from a file extension; anything unknown falls back to `Auto`.
    pub fn from_path(path: &std::path::Path) -> Self {
        match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()) {
            Some(ext) if ext == "json" => DocumentFormat::Json,
            Some(ext) if ext == "yaml" || ext == "yml" => DocumentFormat::Yaml,
            _ => DocumentFormat::Auto,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedJob {
    pub job: JobDefinition,
    pub format: DocumentFormat,
}

pub fn parse_job_str(input: &str, format: DocumentFormat) -> Result<ParsedJob, ParseError> {
    match format {
        DocumentFormat::Json => Ok(ParsedJob {
            job: serde_json::from_str::<JobDefinition>(input)?,
            format,
        }),
        DocumentFormat::Yaml => Ok(ParsedJob {
            job: serde_yaml::from_str::<JobDefinition>(input)?,
            format,
        }),
        DocumentFormat::Auto => parse_job_auto(input),
    }
}

fn parse_job_auto(input: &str) -> Result<ParsedJob, ParseError> {
    if input.trim().is_empty() {
        return Err(ParseError::UnknownFormat);
    }

    // JSON always starts with `{` or `[` after trimming.
    let trimmed = input.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return match serde_json::from_str::<JobDefinition>(input) {
            Ok(job) => Ok(ParsedJob {
                job,
                format: DocumentFormat::Json,
            }),
            Err(e) => serde_yaml::from_str::<JobDefinition>(input)
                .map(|job| ParsedJob {
                    job,
                    format: DocumentFormat::Yaml,
                })
                .map_err(|_| ParseError::Json(e)),
        };
    }

    match serde_yaml::from_str::<JobDefinition>(input) {
        Ok(job) => Ok(ParsedJob {
            job,
            format: DocumentFormat::Yaml,
        }),
        Err(e) => serde_json::from_str::<JobDefinition>(input)
            .map(|job| ParsedJob {
                job,
                format: DocumentFormat::Json,
            })
            .map_err(|_| ParseError::Yaml(e)),
    }
}
