//! Orchestration around the `qmd` markdown search engine: per-workspace
//! subprocess invocation with locking, retries and repair, debounced
//! indexing, and an optional HTTP sidecar bridge.

pub mod classify;
pub mod client;
pub mod config;
pub mod error;
pub mod invoker;
pub mod lock;
pub mod model_cache;
pub mod parse;
pub mod proto;
pub mod registrar;
pub mod runner;
mod scheduler;
pub mod service;
pub mod sidecar;
#[cfg(test)]
mod test_support;
pub mod watch;
pub mod workspace;

pub use classify::Classification;
pub use classify::FailureClassifier;
pub use client::SidecarClient;
pub use config::QmdConfig;
pub use error::CommandError;
pub use error::QmdError;
pub use error::Result;
pub use lock::AdvisoryLock;
pub use lock::FlockAdvisoryLock;
pub use lock::NoopAdvisoryLock;
pub use parse::SearchResult;
pub use parse::parse_search_results;
pub use runner::CommandOutput;
pub use runner::CommandRunner;
pub use runner::EngineCommand;
pub use runner::ProcessRunner;
pub use scheduler::EmbedExclusions;
pub use service::OpenResult;
pub use service::QmdService;
pub use service::Status;
pub use sidecar::SidecarOptions;
pub use sidecar::run_sidecar;
pub use watch::WorkspaceWatcher;
pub use workspace::WorkspaceResolver;
