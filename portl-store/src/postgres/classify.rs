use portl_core::types::FailureKind;
use portl_exec::ConnectorError;

/// Map a driver error onto the engine's failure kinds. Database errors are
/// classified by SQLSTATE; transport and pool errors count as lost connections.
pub fn classify(err: &sqlx::Error) -> ConnectorError {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            match db.code() {
                Some(code) => ConnectorError::new(kind_for_sqlstate(&code), format!("{message} (SQLSTATE {code})")),
                None => ConnectorError::new(FailureKind::Other, message),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ConnectorError::new(FailureKind::DbConnection, err.to_string()),
        sqlx::Error::Configuration(_) => ConnectorError::permanent(FailureKind::DbConnection, err.to_string()),
        sqlx::Error::RowNotFound
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::Encode(_) => ConnectorError::new(FailureKind::Data, err.to_string()),
        _ => ConnectorError::new(FailureKind::Other, err.to_string()),
    }
}

pub fn kind_for_sqlstate(code: &str) -> FailureKind {
    match code {
        "40001" => FailureKind::DbSerialization,
        "40P01" => FailureKind::DbDeadlock,
        // lock_not_available, and query_canceled (raised by statement_timeout)
        "55P03" | "57014" => FailureKind::DbLockTimeout,
        // admin_shutdown, crash_shutdown, cannot_connect_now
        "57P01" | "57P02" | "57P03" => FailureKind::DbConnection,
        c if c.starts_with("08") => FailureKind::DbConnection,
        c if c.starts_with("23") => FailureKind::DbConstraint,
        c if c.starts_with("22") => FailureKind::Data,
        _ => FailureKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portl_exec::ErrorClass;

    #[test]
    fn sqlstates_map_to_failure_kinds() {
        let cases = [
            ("40001", FailureKind::DbSerialization),
            ("40P01", FailureKind::DbDeadlock),
            ("55P03", FailureKind::DbLockTimeout),
            ("57014", FailureKind::DbLockTimeout),
            ("08006", FailureKind::DbConnection),
            ("57P01", FailureKind::DbConnection),
            ("23505", FailureKind::DbConstraint),
            ("23503", FailureKind::DbConstraint),
            ("22P02", FailureKind::Data),
            ("42601", FailureKind::Other),
            ("42P01", FailureKind::Other),
        ];
        for (code, kind) in cases {
            assert_eq!(kind_for_sqlstate(code), kind, "{code}");
        }
    }

    #[test]
    fn pool_exhaustion_is_a_transient_connection_failure() {
        let e = classify(&sqlx::Error::PoolTimedOut);
        assert_eq!(e.kind, FailureKind::DbConnection);
        assert_eq!(e.class, ErrorClass::Transient);
    }

    #[test]
    fn bad_configuration_is_permanent() {
        let e = classify(&sqlx::Error::Configuration("bad".into()));
        assert_eq!(e.kind, FailureKind::DbConnection);
        assert_eq!(e.class, ErrorClass::Permanent);
    }

    #[test]
    fn missing_rows_are_data_failures() {
        assert_eq!(classify(&sqlx::Error::RowNotFound).kind, FailureKind::Data);
    }
}
