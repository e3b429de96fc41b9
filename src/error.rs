use std::sync::Arc;

pub use anyhow::Error as RuntimeError;
use thiserror::Error;

use crate::core::TaskId;

/// Failure value reported by a task action.
///
/// The engine never branches on what went wrong inside an action, it only
/// carries the error to the outcome stream and the final result. Wrapped in
/// an `Arc` so every reporter can hold on to it.
#[derive(Debug, Error, Clone)]
#[error("{0:#}")]
pub struct ActionFailure(pub(crate) Arc<anyhow::Error>);

impl ActionFailure {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for ActionFailure {
    fn from(e: anyhow::Error) -> Self {
        ActionFailure(Arc::new(e))
    }
}

/// Misuse of the graph construction API, or an invalid topology.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task '{0}' is already declared")]
    DuplicateNode(TaskId),

    #[error("Task '{0}' is not declared")]
    UnknownNode(TaskId),

    #[error("Circular dependency between tasks: {}", format_cycle(.0))]
    Cycle(Vec<TaskId>),
}

fn format_cycle(path: &[TaskId]) -> String {
    path.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Failure while taking a snapshot of declared inputs or outputs.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Couldn't read '{0}'.\n{1}")]
    FileSystem(camino::Utf8PathBuf, std::io::Error),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Couldn't access fingerprint storage.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't decode fingerprint for '{0}'.\n{1}")]
    Decode(TaskId, String),

    #[error("Couldn't encode fingerprint for '{0}'.\n{1}")]
    Encode(TaskId, String),
}

/// Top level error of [`Engine::run`](crate::Engine::run). Anything that
/// goes wrong inside a single task is not an error here, it ends up in the
/// [`BuildResult`](crate::BuildResult) instead.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid task graph.\n{0}")]
    Graph(#[from] GraphError),

    #[error("Failed to build the worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Raised by a [`ModuleRegistry`](crate::module::ModuleRegistry) when no
/// module with the requested name is known.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Cannot locate {kind} module '{name}'")]
pub struct UnknownModuleError {
    pub kind: &'static str,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message() {
        let err = GraphError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(
            err.to_string(),
            "Circular dependency between tasks: a -> b -> a"
        );
    }

    #[test]
    fn test_action_failure_is_shared() {
        let failure = ActionFailure::new(anyhow::anyhow!("boom"));
        let clone = failure.clone();
        assert_eq!(clone.to_string(), "boom");
        assert!(Arc::ptr_eq(&failure.0, &clone.0));
    }
}
