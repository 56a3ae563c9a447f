//! The single database transaction of a run.

use portl_core::types::{FailureKind, TransactionScope};

use crate::connectors::{SqlCommand, SqlConnector, SqlOutcome, SqlSession};
use crate::error::ConnectorError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransactionStats {
    pub begins: u32,
    pub commits: u32,
    pub rollbacks: u32,
    pub savepoints: u32,
}

/// Owns the run's DB session.
///
/// With `scope: db` the session is opened before the first statement and kept
/// until [`commit`](Self::commit) or [`rollback`](Self::rollback); every
/// statement runs inside its own savepoint so a failed attempt can be undone
/// without losing earlier work. With `scope: none` each statement gets a short
/// transaction of its own.
pub struct TransactionManager {
    scope: TransactionScope,
    session: Option<Box<dyn SqlSession>>,
    bound: Option<String>,
    next_savepoint: u64,
    stats: TransactionStats,
}

impl TransactionManager {
    pub fn new(scope: TransactionScope) -> Self {
        Self {
            scope,
            session: None,
            bound: None,
            next_savepoint: 0,
            stats: TransactionStats::default(),
        }
    }

    pub fn scope(&self) -> TransactionScope {
        self.scope
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn stats(&self) -> TransactionStats {
        self.stats
    }

    /// The connection the shared transaction is pinned to, once opened.
    pub fn bound_connection(&self) -> Option<&str> {
        self.bound.as_deref()
    }

    /// Run one statement attempt.
    pub async fn execute(
        &mut self,
        connection: &str,
        connector: &dyn SqlConnector,
        command: &SqlCommand,
    ) -> Result<SqlOutcome, ConnectorError> {
        match self.scope {
            TransactionScope::None => self.execute_autocommit(connector, command).await,
            TransactionScope::Db => self.execute_shared(connection, connector, command).await,
        }
    }

    async fn execute_autocommit(
        &mut self,
        connector: &dyn SqlConnector,
        command: &SqlCommand,
    ) -> Result<SqlOutcome, ConnectorError> {
        let mut session = connector.begin().await?;
        self.stats.begins += 1;
        match session.execute(command).await {
            Ok(outcome) => {
                session.commit().await?;
                self.stats.commits += 1;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rb) = session.rollback().await {
                    tracing::warn!(error = %rb, "rollback after failed statement failed");
                }
                self.stats.rollbacks += 1;
                Err(e)
            }
        }
    }

    async fn execute_shared(
        &mut self,
        connection: &str,
        connector: &dyn SqlConnector,
        command: &SqlCommand,
    ) -> Result<SqlOutcome, ConnectorError> {
        if let Some(bound) = &self.bound {
            if bound != connection {
                return Err(ConnectorError::permanent(
                    FailureKind::Other,
                    format!("shared transaction is bound to connection '{bound}', not '{connection}'"),
                ));
            }
        }

        if self.session.is_none() {
            let session = connector.begin().await?;
            tracing::debug!(connection, "transaction opened");
            self.session = Some(session);
            self.bound = Some(connection.to_string());
            self.stats.begins += 1;
        }
        let Some(session) = self.session.as_mut() else {
            return Err(ConnectorError::permanent(FailureKind::Other, "transaction is not open"));
        };

        self.next_savepoint += 1;
        let savepoint = format!("portl_sp_{}", self.next_savepoint);
        session.savepoint(&savepoint).await?;
        self.stats.savepoints += 1;

        match session.execute(command).await {
            Ok(outcome) => {
                session.release_savepoint(&savepoint).await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(sp) = session.rollback_to_savepoint(&savepoint).await {
                    return Err(ConnectorError::permanent(
                        FailureKind::DbConnection,
                        format!("{e}; rollback to savepoint failed: {sp}"),
                    ));
                }
                Err(e)
            }
        }
    }

    /// Commit the shared transaction. `Ok(false)` when none was opened.
    pub async fn commit(&mut self) -> Result<bool, ConnectorError> {
        let Some(session) = self.session.take() else {
            return Ok(false);
        };
        session.commit().await?;
        self.stats.commits += 1;
        tracing::debug!("transaction committed");
        Ok(true)
    }

    /// Roll back the shared transaction. `Ok(false)` when none was opened.
    pub async fn rollback(&mut self) -> Result<bool, ConnectorError> {
        let Some(session) = self.session.take() else {
            return Ok(false);
        };
        self.stats.rollbacks += 1;
        session.rollback().await?;
        tracing::debug!("transaction rolled back");
        Ok(true)
    }
}
