//! forgeflow: resumable, budget-bounded orchestration of multi-phase agent workflows.
//!
//! The engine is split into small layers. Leaves first:
//! - [`context`]: truncation and compaction of the conversation
//! - [`checkpoint`]: git tags before each phase, rollback on rejection
//! - [`session`]: one JSON file per session for resumability
//! - [`hooks`]: named pre/post-phase checks
//! - [`budget`]: pure spend accounting
//! - [`orchestrator`]: the phase state machine composing all of the above

pub mod agent;
pub mod budget;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod context;
pub mod hooks;
pub mod orchestrator;
pub mod session;
pub mod utils;
pub mod work_item;
pub mod workflow;

pub use orchestrator::{EngineError, Orchestrator, RecoveryPolicy, RunOptions, WorkflowRun};
