//! The error taxonomy raised by this crate's own logic, layered underneath
//! [`stacked_errors::Error`] via `.stack_err(...)` exactly like any other
//! foreign error type.

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors specific to container orchestration, as opposed to the generic
/// I/O/serialization errors that `stacked_errors` already carries.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("container {name:?} exited with code {code}")]
    ContainerExit {
        name: String,
        code: i64,
        logs: String,
    },

    #[error("image build failed{}", .intermediate_container.as_ref().map(|c| format!(" (intermediate container {c})")).unwrap_or_default())]
    BuildFailed {
        intermediate_container: Option<String>,
        error_lines: Vec<String>,
    },

    #[error("container {name:?} did not stop in time")]
    StopFailed { name: String },

    #[error("{} of {} containers failed", .failures.len(), .failures.len() + .successes)]
    Aggregate {
        failures: Vec<(String, stacked_errors::Error)>,
        successes: usize,
        logs: BTreeMap<String, String>,
    },

    #[error("dependency cycle among containers: {members:?}")]
    Cycle { members: Vec<String> },
}
