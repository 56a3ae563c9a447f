#![forbid(unsafe_code)]

//! Postgres adapters for the portl engine: the SQL connector behind
//! `postgres` connections, and the outbox table the relay drains.

pub mod config;
pub mod error;
pub mod postgres;

pub use crate::config::PgSettings;
pub use crate::error::StoreError;
pub use crate::postgres::{
    classify, run_migrations, PgConnector, PgConnectorFactory, PgOutboxStore, PgSession,
};
