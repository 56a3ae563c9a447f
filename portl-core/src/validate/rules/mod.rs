pub(crate) mod job;
pub(crate) mod step;
pub(crate) mod templates;
