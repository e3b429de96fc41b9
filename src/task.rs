//! The task node model.
//!
//! A [`TaskNode`] is the unit of work: identity, declared inputs and outputs,
//! scalar properties, skip predicates and an action. Nodes are inert data;
//! the engine decides when (and whether) the action runs.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::core::{Hash32, TaskId};
use crate::error::ActionFailure;

/// Result from a single executed task action.
pub type TaskResult<T = ()> = anyhow::Result<T, anyhow::Error>;

/// The externally supplied unit of work. Everything it needs is captured at
/// construction time.
pub(crate) type ActionFn = Arc<dyn Fn() -> TaskResult + Send + Sync>;

/// Zero-argument boolean check, evaluated on the coordinating thread.
pub(crate) type PredicateFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Lazily evaluated property signature.
pub(crate) type PropertyFn = Arc<dyn Fn() -> Hash32 + Send + Sync>;

/// A single place whose state is fingerprinted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// A single file, hashed by content.
    File(Utf8PathBuf),
    /// A directory, hashed recursively by relative path and content.
    Dir(Utf8PathBuf),
    /// Every file matched by a glob pattern.
    Glob(String),
    /// A literal value, e.g. a version string or a flag.
    Value(String),
}

/// Named collections of locations, e.g. `"sources" -> [src/, build.rs]`.
#[derive(Debug, Clone, Default)]
pub struct Collections(pub(crate) BTreeMap<String, Vec<Location>>);

impl Collections {
    pub(crate) fn push(&mut self, name: impl Into<String>, location: Location) {
        self.0.entry(name.into()).or_default().push(location);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Location])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Execution state of a node within a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    SkippedUpToDate,
    SkippedByPredicate,
    SkippedFailedDependency,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Ready | Self::Running)
    }

    /// Terminal states which poison every dependent.
    pub fn is_failing(self) -> bool {
        matches!(self, Self::Failed | Self::SkippedFailedDependency)
    }

    /// Terminal states which let dependents proceed.
    pub fn is_resolved(self) -> bool {
        self.is_terminal() && !self.is_failing()
    }
}

/// What happened to a node, as pushed to reporters.
#[derive(Debug, Clone)]
pub enum Outcome {
    Executed,
    UpToDate,
    SkippedByPredicate,
    SkippedFailedDependency,
    Failed(ActionFailure),
}

impl Outcome {
    pub fn state(&self) -> TaskState {
        match self {
            Outcome::Executed => TaskState::Succeeded,
            Outcome::UpToDate => TaskState::SkippedUpToDate,
            Outcome::SkippedByPredicate => TaskState::SkippedByPredicate,
            Outcome::SkippedFailedDependency => TaskState::SkippedFailedDependency,
            Outcome::Failed(_) => TaskState::Failed,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.state().is_failing()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Executed => "executed",
            Outcome::UpToDate => "up-to-date",
            Outcome::SkippedByPredicate => "skipped",
            Outcome::SkippedFailedDependency => "skipped (failed dependency)",
            Outcome::Failed(_) => "failed",
        }
    }
}

/// A declared unit of work.
///
/// Usually assembled through [`Blueprint::task`](crate::Blueprint::task),
/// but can be built by hand and added to a [`TaskGraph`](crate::TaskGraph)
/// directly.
#[derive(Clone)]
pub struct TaskNode {
    pub(crate) id: TaskId,
    pub(crate) inputs: Collections,
    pub(crate) outputs: Collections,
    pub(crate) properties: BTreeMap<String, PropertyFn>,
    pub(crate) only_if: Vec<PredicateFn>,
    pub(crate) up_to_date_when: Vec<PredicateFn>,
    pub(crate) cacheable: bool,
    pub(crate) action: ActionFn,
}

impl TaskNode {
    pub fn new<F>(id: impl Into<TaskId>, action: F) -> Self
    where
        F: Fn() -> TaskResult + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            inputs: Collections::default(),
            outputs: Collections::default(),
            properties: BTreeMap::new(),
            only_if: Vec::new(),
            up_to_date_when: Vec::new(),
            cacheable: false,
            action: Arc::new(action),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn inputs(&self) -> &Collections {
        &self.inputs
    }

    pub fn outputs(&self) -> &Collections {
        &self.outputs
    }

    pub fn with_input(mut self, name: impl Into<String>, location: Location) -> Self {
        self.inputs.push(name, location);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, location: Location) -> Self {
        self.outputs.push(name, location);
        self
    }

    /// Folds a fixed value into the fingerprint under `name`.
    pub fn with_property<T>(mut self, name: impl Into<String>, value: T) -> Self
    where
        T: Hash,
    {
        let hash = Hash32::of(&value);
        self.properties.insert(name.into(), Arc::new(move || hash));
        self
    }

    /// Folds a value computed at fingerprint time into the fingerprint.
    pub fn with_property_fn<F, T>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: Hash,
    {
        self.properties
            .insert(name.into(), Arc::new(move || Hash32::of(&func())));
        self
    }

    /// The node is skipped unless every predicate holds.
    pub fn with_only_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.only_if.push(Arc::new(predicate));
        self
    }

    /// Extra check for an otherwise up-to-date node; `false` forces a run.
    pub fn with_up_to_date_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.up_to_date_when.push(Arc::new(predicate));
        self
    }

    /// Allows a node without outputs to be skipped when its inputs match.
    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub(crate) fn should_run(&self) -> bool {
        self.only_if.iter().all(|predicate| predicate())
    }

    pub(crate) fn run(&self) -> TaskResult {
        (self.action)()
    }
}

impl Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .field("only_if", &self.only_if.len())
            .field("cacheable", &self.cacheable)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classes() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::SkippedUpToDate.is_resolved());
        assert!(TaskState::SkippedByPredicate.is_resolved());
        assert!(TaskState::Failed.is_failing());
        assert!(TaskState::SkippedFailedDependency.is_failing());
        assert!(!TaskState::SkippedFailedDependency.is_resolved());
    }

    #[test]
    fn test_only_if_all_must_hold() {
        let node = TaskNode::new("a", || Ok(()))
            .with_only_if(|| true)
            .with_only_if(|| false);
        assert!(!node.should_run());

        let node = TaskNode::new("b", || Ok(()));
        assert!(node.should_run());
    }

    #[test]
    fn test_property_hash_is_stable() {
        let a = TaskNode::new("a", || Ok(())).with_property("level", 3u8);
        let b = TaskNode::new("b", || Ok(())).with_property("level", 3u8);
        let c = TaskNode::new("c", || Ok(())).with_property("level", 4u8);

        let get = |n: &TaskNode| (n.properties["level"])();
        assert_eq!(get(&a), get(&b));
        assert_ne!(get(&a), get(&c));
    }
}
