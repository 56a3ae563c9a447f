pub mod config;
pub mod migrate;
pub mod outbox;
pub mod run;
pub mod validate;
