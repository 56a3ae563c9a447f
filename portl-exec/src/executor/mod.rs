pub mod events;
pub mod render;
mod result;
mod scheduler;
mod step_runner;
mod types;
pub mod worker;

pub use events::{
    CompositeEventSink, Event, EventSink, MemoryEventSink, NoOpEventSink, StdoutEventSink, TracingEventSink,
};
pub use result::{summarize, FailureReport, RunReport, RunStatus, StepReport, StepStatus};
pub use scheduler::{Engine, COMMIT_STEP};
pub use types::{EngineConfig, RunLimits};
