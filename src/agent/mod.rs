//! In-guest agent: receives a sample, runs the analysis tasks and reports back to the host.

pub mod catalogue;
mod filetype;
mod orchestrator;
mod server;
pub mod tasks;

pub use catalogue::{ARTIFACTS, BEHAVIOR_OUTPUT, CAPTURE_OUTPUT};
pub use filetype::FileType;
pub use orchestrator::{Orchestrator, SessionReport, SessionRequest};
pub use server::{AgentServer, AgentState, StagedSample, router};
pub use tasks::{TaskKind, TaskOutcome, TaskStatus};
