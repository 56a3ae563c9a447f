mod classify;
mod connector;
mod migrate;
mod outbox;
mod session;

pub use classify::{classify, kind_for_sqlstate};
pub use connector::{PgConnector, PgConnectorFactory};
pub use migrate::run_migrations;
pub use outbox::PgOutboxStore;
pub use session::PgSession;
