/// Classification of a connector failure, used by `retry_on` lists and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    #[serde(rename = "timeout", alias = "TimeoutError")]
    Timeout,
    #[serde(rename = "network", alias = "ConnectionError")]
    Network,
    #[serde(rename = "http_429")]
    Http429,
    #[serde(rename = "http_5xx", alias = "HTTPError")]
    Http5xx,
    #[serde(rename = "http_4xx")]
    Http4xx,
    #[serde(rename = "function")]
    Function,
    #[serde(rename = "db_connection")]
    DbConnection,
    #[serde(rename = "db_serialization")]
    DbSerialization,
    #[serde(rename = "db_deadlock")]
    DbDeadlock,
    #[serde(rename = "db_lock_timeout")]
    DbLockTimeout,
    #[serde(rename = "db_constraint")]
    DbConstraint,
    #[serde(rename = "data")]
    Data,
    #[serde(rename = "io")]
    Io,
    #[serde(rename = "other")]
    Other,
}

impl FailureKind {
    /// Retried by default for HTTP calls and function invokes.
    pub const DEFAULT_EXTERNAL: &'static [FailureKind] = &[
        FailureKind::Timeout,
        FailureKind::Network,
        FailureKind::Http429,
        FailureKind::Http5xx,
    ];

    /// Retried by default for DB statements. Each of these leaves the
    /// transaction recoverable through `ROLLBACK TO SAVEPOINT`.
    pub const DEFAULT_DB: &'static [FailureKind] = &[
        FailureKind::DbSerialization,
        FailureKind::DbDeadlock,
        FailureKind::DbLockTimeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Network => "network",
            FailureKind::Http429 => "http_429",
            FailureKind::Http5xx => "http_5xx",
            FailureKind::Http4xx => "http_4xx",
            FailureKind::Function => "function",
            FailureKind::DbConnection => "db_connection",
            FailureKind::DbSerialization => "db_serialization",
            FailureKind::DbDeadlock => "db_deadlock",
            FailureKind::DbLockTimeout => "db_lock_timeout",
            FailureKind::DbConstraint => "db_constraint",
            FailureKind::Data => "data",
            FailureKind::Io => "io",
            FailureKind::Other => "other",
        }
    }

    /// Constraint and data-validation failures are deterministic; no policy may retry them.
    pub fn is_never_retryable(&self) -> bool {
        matches!(self, FailureKind::DbConstraint | FailureKind::Data)
    }

    pub fn from_http_status(status: u16) -> Option<FailureKind> {
        match status {
            429 => Some(FailureKind::Http429),
            500..=599 => Some(FailureKind::Http5xx),
            400..=499 => Some(FailureKind::Http4xx),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
