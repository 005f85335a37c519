pub mod broadcast;
pub mod config;
pub mod digest;
pub mod error;
pub mod notebook;
pub mod observability;
pub mod phases;
pub mod pipeline;
pub mod queue;
pub mod run;
pub mod serving;
pub mod source;
pub mod store;
pub mod tracker;
pub mod trigger;

pub use pipeline::{Attempt, Collaborators, PipelineEngine, RunOutcome, ShutdownSignal};
pub use run::{PipelineRun, RunStatus};
