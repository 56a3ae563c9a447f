mod common;
mod connection;
mod failure;
mod job;
mod step;

pub use common::*;
pub use connection::*;
pub use failure::*;
pub use job::*;
pub use step::*;
