//! Background execution of analysis jobs.
//!
//! The API creates the job row and hands it to [`JobOrchestrator::dispatch`];
//! everything after that (status transitions, engine invocation, outcome
//! writes) happens on a task the orchestrator owns.

mod orchestrator;

pub use orchestrator::{JobHandle, JobOrchestrator, OrchestratorConfig};
