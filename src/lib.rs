//! codeforge: a code-generation workflow engine.
//!
//! Given a task and a connected repository, the engine plans a set of file
//! changes with a remote reasoning backend, optionally pauses for human
//! approval, generates the file content, and publishes the result as a
//! branch and pull request. Admission is rate-limited per credential owner:
//! rolling token windows, bounded concurrency, and classified retries.
//!
//! Construction is explicit: build an [`engine::Engine`] from an
//! [`config::EngineConfig`] and your collaborators (workflow store, task
//! store, version control, notifier, optional preview deployer, reasoning
//! backends) and call [`engine::Engine::enqueue`].

pub mod budget;
pub mod config;
pub mod deploy;
pub mod engine;
pub mod error;
pub mod github;
pub mod notify;
pub mod parsers;
pub mod queue;
pub mod reasoning;
pub mod store;
mod util;
pub mod workflow;

pub use config::EngineConfig;
pub use engine::{Engine, EngineCollaborators};
pub use queue::{EnqueueOutcome, QueueStats, TaskQueueStatus};
pub use reasoning::Provider;
pub use workflow::{Workflow, WorkflowStatus};
