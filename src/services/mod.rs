//! Job discovery and orchestration services.

pub mod notifier;
pub mod orchestrator;
pub mod resolver;

pub use notifier::{ConsoleNotifier, MemoryNotifier, Notifier};
pub use orchestrator::{Orchestrator, RollbackOptions, RunOptions};
pub use resolver::JobResolver;
