use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::TaskId;
use crate::engine::{RunPhase, TaskExecution};
use crate::error::ActionFailure;
use crate::graph::TaskGraph;
use crate::task::TaskState;

/// Everything known about a finished run.
#[derive(Debug)]
pub struct BuildResult {
    pub phase: RunPhase,
    /// Final state of every node taking part in the run.
    pub states: BTreeMap<TaskId, TaskState>,
    /// Timing of every action that was dispatched.
    pub executions: BTreeMap<TaskId, TaskExecution>,
    /// When each terminal outcome was decided.
    pub finished_at: BTreeMap<TaskId, Instant>,
    /// Failed nodes in the order they failed.
    pub failures: Vec<(TaskId, ActionFailure)>,
    /// Nodes left untouched after a fail-fast abort.
    pub not_executed: Vec<TaskId>,
    pub elapsed: Duration,
}

/// Node counts by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub total: usize,
    pub succeeded: usize,
    pub up_to_date: usize,
    /// Skipped by predicate or because of a failed dependency.
    pub skipped: usize,
    pub failed: usize,
    pub not_executed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedTask {
    pub id: TaskId,
    pub error: String,
}

/// Serializable digest of a [`BuildResult`].
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub phase: RunPhase,
    pub success: bool,
    pub counts: Counts,
    pub failed: Vec<FailedTask>,
    pub skipped_failed_dependency: Vec<TaskId>,
    pub not_executed: Vec<TaskId>,
    pub elapsed: Duration,
}

impl Summary {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl BuildResult {
    pub fn state(&self, id: &str) -> Option<TaskState> {
        self.states.get(id).copied()
    }

    /// `true` when the run completed and nothing failed.
    pub fn is_success(&self) -> bool {
        self.phase == RunPhase::Completed && self.failures.is_empty()
    }

    pub fn failure(&self, id: &str) -> Option<&ActionFailure> {
        self.failures
            .iter()
            .find(|(task, _)| task.as_str() == id)
            .map(|(_, failure)| failure)
    }

    /// Ids of the nodes in `state`.
    pub fn in_state(&self, state: TaskState) -> Vec<TaskId> {
        self.states
            .iter()
            .filter(|&(_, &s)| s == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn counts(&self) -> Counts {
        let mut counts = Counts {
            total: self.states.len(),
            not_executed: self.not_executed.len(),
            ..Default::default()
        };

        for state in self.states.values() {
            match state {
                TaskState::Succeeded => counts.succeeded += 1,
                TaskState::SkippedUpToDate => counts.up_to_date += 1,
                TaskState::SkippedByPredicate | TaskState::SkippedFailedDependency => {
                    counts.skipped += 1
                }
                TaskState::Failed => counts.failed += 1,
                TaskState::Pending | TaskState::Ready | TaskState::Running => {}
            }
        }

        counts
    }

    pub fn summary(&self) -> Summary {
        Summary {
            phase: self.phase,
            success: self.is_success(),
            counts: self.counts(),
            failed: self
                .failures
                .iter()
                .map(|(id, failure)| FailedTask {
                    id: id.clone(),
                    error: failure.to_string(),
                })
                .collect(),
            skipped_failed_dependency: self.in_state(TaskState::SkippedFailedDependency),
            not_executed: self.not_executed.clone(),
            elapsed: self.elapsed,
        }
    }

    /// Renders the graph as a Mermaid diagram, colored by outcome.
    ///
    /// * **Green**: executed, labelled with the duration
    /// * **Blue**: up to date
    /// * **Grey**: skipped by predicate
    /// * **Orange**: skipped because a dependency failed
    /// * **Red**: failed
    ///
    /// Nodes which did not take part in the run stay uncolored.
    pub fn render_mermaid(&self, graph: &TaskGraph) -> String {
        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        for index in graph.graph.node_indices() {
            let id = graph.node(index).id();
            let name = id.as_str().replace('"', "\\\"");

            let Some(&state) = self.states.get(id) else {
                writeln!(f, "    {:?}[\"{}\"]", index.index(), name).unwrap();
                continue;
            };

            let (label, color) = match state {
                TaskState::Succeeded => {
                    let duration = self
                        .executions
                        .get(id)
                        .map(|exec| format!("{:.2?}", exec.duration))
                        .unwrap_or_default();
                    (duration, "#90EE90")
                }
                TaskState::SkippedUpToDate => ("Up to date".to_string(), "#ADD8E6"),
                TaskState::SkippedByPredicate => ("Skipped".to_string(), "#D3D3D3"),
                TaskState::SkippedFailedDependency => ("Blocked".to_string(), "#FFB347"),
                TaskState::Failed => ("Failed".to_string(), "#FF6961"),
                TaskState::Pending | TaskState::Ready | TaskState::Running => {
                    ("Not executed".to_string(), "#FFFFFF")
                }
            };

            writeln!(f, "    {:?}[\"{}\\n{}\"]", index.index(), name, label).unwrap();
            writeln!(f, "    style {:?} fill:{}", index.index(), color).unwrap();
        }

        for edge in graph.graph.raw_edges() {
            writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            )
            .unwrap();
        }

        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskNode;

    fn result() -> BuildResult {
        let failure = ActionFailure::new(anyhow::anyhow!("exit code 1"));
        BuildResult {
            phase: RunPhase::Completed,
            states: [
                ("a", TaskState::Failed),
                ("b", TaskState::SkippedFailedDependency),
                ("c", TaskState::SkippedUpToDate),
                ("d", TaskState::Succeeded),
            ]
            .into_iter()
            .map(|(id, state)| (TaskId::from(id), state))
            .collect(),
            executions: BTreeMap::new(),
            finished_at: BTreeMap::new(),
            failures: vec![("a".into(), failure)],
            not_executed: Vec::new(),
            elapsed: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_counts_and_summary() {
        let result = result();
        assert!(!result.is_success());
        assert_eq!(
            result.counts(),
            Counts {
                total: 4,
                succeeded: 1,
                up_to_date: 1,
                skipped: 1,
                failed: 1,
                not_executed: 0,
            }
        );

        let json = result.summary().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["phase"], "Completed");
        assert_eq!(value["success"], false);
        assert_eq!(value["failed"][0]["id"], "a");
        assert_eq!(value["failed"][0]["error"], "exit code 1");
        assert_eq!(value["skipped_failed_dependency"][0], "b");
    }

    #[test]
    fn test_render_mermaid() {
        let mut graph = TaskGraph::new();
        for id in ["a", "b", "c", "d", "e"] {
            graph.add_node(TaskNode::new(id, || Ok(()))).unwrap();
        }
        graph.add_edge("a", "b").unwrap();

        let rendered = result().render_mermaid(&graph);
        assert!(rendered.contains("style 0 fill:#FF6961"));
        assert!(rendered.contains("style 1 fill:#FFB347"));
        assert!(rendered.contains("style 2 fill:#ADD8E6"));
        assert!(rendered.contains("4[\"e\"]"));
        assert!(!rendered.contains("style 4"));
        assert!(rendered.contains("0 --> 1"));
    }
}
