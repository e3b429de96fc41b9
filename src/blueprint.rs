use std::hash::Hash;
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::core::TaskId;
use crate::error::GraphError;
use crate::graph::TaskGraph;
use crate::task::{Location, TaskNode, TaskResult};

/// Declarative description of a task graph.
///
/// Tasks can be declared in any order and refer to their dependencies by id.
/// Ids are only resolved in [`Blueprint::finish`].
///
/// # Example
///
/// ```rust,no_run
/// use kiln::Blueprint;
///
/// let mut blueprint = Blueprint::new();
///
/// blueprint
///     .task("package")
///     .depends_on("compile")
///     .input_file("manifest", "Manifest.toml")
///     .output_file("archive", "dist/app.tar")
///     .run(|| Ok(()));
///
/// blueprint
///     .task("compile")
///     .input_dir("sources", "src")
///     .output_dir("classes", "build/classes")
///     .run(|| Ok(()));
///
/// let graph = blueprint.finish().unwrap();
/// ```
#[derive(Default)]
pub struct Blueprint {
    declared: Vec<Declaration>,
}

struct Declaration {
    node: TaskNode,
    dependencies: Vec<TaskId>,
}

impl Blueprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts declaring a task. Nothing is added until [`TaskBuilder::run`].
    pub fn task(&mut self, id: impl Into<TaskId>) -> TaskBuilder<'_> {
        TaskBuilder {
            blueprint: self,
            node: TaskNode::new(id, || Ok(())),
            dependencies: Vec::new(),
        }
    }

    /// Adds an already assembled node.
    pub fn node(&mut self, node: TaskNode, dependencies: &[&str]) {
        self.declared.push(Declaration {
            node,
            dependencies: dependencies.iter().map(|&id| id.into()).collect(),
        });
    }

    pub fn len(&self) -> usize {
        self.declared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }

    /// Resolves every declaration into a [`TaskGraph`].
    ///
    /// Fails on the first duplicated id, or on a dependency that was never
    /// declared. Cycles are left for [`TaskGraph::validate`].
    pub fn finish(self) -> Result<TaskGraph, GraphError> {
        let mut graph = TaskGraph::new();
        let mut edges = Vec::new();

        for Declaration { node, dependencies } in self.declared {
            let id = node.id().clone();
            graph.add_node(node)?;
            edges.extend(dependencies.into_iter().map(|dep| (dep, id.clone())));
        }

        for (dependency, dependent) in edges {
            graph.add_edge(dependency.as_str(), dependent.as_str())?;
        }

        Ok(graph)
    }
}

/// Fluent declaration of a single task.
#[must_use = "a task is only declared once `run` is called"]
pub struct TaskBuilder<'a> {
    blueprint: &'a mut Blueprint,
    node: TaskNode,
    dependencies: Vec<TaskId>,
}

impl<'a> TaskBuilder<'a> {
    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn input_file(self, name: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        self.input(name, Location::File(path.into()))
    }

    pub fn input_dir(self, name: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        self.input(name, Location::Dir(path.into()))
    }

    pub fn input_glob(self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.input(name, Location::Glob(pattern.into()))
    }

    pub fn input_value(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.input(name, Location::Value(value.into()))
    }

    pub fn output_file(mut self, name: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        self.node = self.node.with_output(name, Location::File(path.into()));
        self
    }

    pub fn output_dir(mut self, name: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        self.node = self.node.with_output(name, Location::Dir(path.into()));
        self
    }

    pub fn property<T: Hash>(mut self, name: impl Into<String>, value: T) -> Self {
        self.node = self.node.with_property(name, value);
        self
    }

    /// Property computed each time the task is fingerprinted, for values
    /// which may change between runs without anything on disk changing.
    pub fn property_with<F, T>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: Hash,
    {
        self.node = self.node.with_property_fn(name, func);
        self
    }

    pub fn only_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.node = self.node.with_only_if(predicate);
        self
    }

    pub fn up_to_date_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.node = self.node.with_up_to_date_when(predicate);
        self
    }

    /// Lets a task without outputs be skipped when nothing else changed.
    pub fn cacheable(mut self) -> Self {
        self.node = self.node.with_cacheable(true);
        self
    }

    /// Sets the action and adds the task to the blueprint.
    pub fn run<F>(self, action: F)
    where
        F: Fn() -> TaskResult + Send + Sync + 'static,
    {
        let TaskBuilder {
            blueprint,
            mut node,
            dependencies,
        } = self;

        node.action = Arc::new(action);
        blueprint.declared.push(Declaration { node, dependencies });
    }

    fn input(mut self, name: impl Into<String>, location: Location) -> Self {
        self.node = self.node.with_input(name, location);
        self
    }
}
