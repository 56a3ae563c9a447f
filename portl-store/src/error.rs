use portl_exec::ConnectorError;

use crate::postgres::classify;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid connection config: {0}")]
    Config(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<StoreError> for ConnectorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Database(e) => classify(&e),
            other => ConnectorError::permanent(portl_core::types::FailureKind::Other, other.to_string()),
        }
    }
}
