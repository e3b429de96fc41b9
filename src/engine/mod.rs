//! Execution engine.
//!
//! [`Engine::run`] validates the requested part of a [`TaskGraph`], then
//! drives every selected node to a terminal state: skipped by predicate,
//! skipped because it is up to date, executed on the worker pool, or skipped
//! because something it depends on failed.

mod result;
mod runner;
pub mod uptodate;

use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::Settings;
use crate::error::BuildError;
use crate::graph::TaskGraph;
use crate::report::Reporter;
use crate::store::FingerprintStore;

pub use result::{BuildResult, Counts, FailedTask, Summary};
pub use uptodate::{Reason, Verdict};

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunPhase {
    Validating,
    Scheduling,
    Draining,
    Completed,
    Aborted,
}

impl Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunPhase::Validating => "VALIDATING",
            RunPhase::Scheduling => "SCHEDULING",
            RunPhase::Draining => "DRAINING",
            RunPhase::Completed => "COMPLETED",
            RunPhase::Aborted => "ABORTED",
        })
    }
}

/// Wall clock of a dispatched action, as measured on the worker.
#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Runs task graphs against a fingerprint store.
///
/// The same engine can run any number of graphs one after another, the store
/// carries the history between them.
pub struct Engine {
    settings: Settings,
    store: FingerprintStore,
    reporter: Arc<dyn Reporter>,
}

impl Engine {
    /// Creates an engine persisting fingerprints below
    /// [`Settings::cache_dir`].
    pub fn new(settings: Settings) -> Self {
        let store = FingerprintStore::on_disk(settings.cache_dir.clone());
        Self {
            settings,
            store,
            reporter: Arc::new(()),
        }
    }

    pub fn with_store(mut self, store: FingerprintStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &FingerprintStore {
        &self.store
    }

    /// Brings `targets` and everything they depend on up to date. An empty
    /// target list runs the whole graph.
    ///
    /// Only an invalid graph or a worker pool which can't be started is an
    /// error; failing tasks are reported in the returned [`BuildResult`].
    pub fn run(&self, graph: &TaskGraph, targets: &[&str]) -> Result<BuildResult, BuildError> {
        runner::run(self, graph, targets)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Settings::default()).with_store(FingerprintStore::in_memory())
    }
}
