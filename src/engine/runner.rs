use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::LazyLock;
use std::sync::mpsc::{Sender, channel};
use std::time::Instant;

use indicatif::ProgressStyle;
use petgraph::graph::NodeIndex;
use rayon::{Scope, ThreadPoolBuilder};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{FailurePolicy, Hash32, TaskId};
use crate::engine::uptodate::{self, Verdict};
use crate::engine::{BuildResult, Engine, RunPhase, TaskExecution};
use crate::error::{ActionFailure, BuildError, SnapshotError};
use crate::fingerprint::{Fingerprint, signature_of, snapshot};
use crate::graph::{States, TaskGraph};
use crate::task::{Outcome, TaskState};

static TASK_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed}] {msg}")
        .expect("Error setting progress bar template")
});

/// Sent back by a worker once an action returns.
struct Completion {
    index: NodeIndex,
    /// Fingerprint to record, outputs taken after the action.
    result: anyhow::Result<Fingerprint>,
    execution: TaskExecution,
}

/// What the coordinator decided for a ready node.
enum Decision {
    Resolved(Outcome),
    Dispatch(Fingerprint),
}

/// State of one run, owned by the coordinating thread.
struct ExecutionContext<'a> {
    engine: &'a Engine,
    graph: &'a TaskGraph,
    workers: usize,
    phase: RunPhase,
    states: States,
    /// Dependencies of each pending node not resolved yet.
    remaining: HashMap<NodeIndex, usize>,
    /// Pending nodes whose dependencies are all resolved.
    unlocked: BTreeSet<NodeIndex>,
    /// Nodes decided out of date, waiting for a free worker.
    queue: BTreeMap<NodeIndex, Fingerprint>,
    /// Nodes neither running nor terminal.
    waiting: usize,
    running: usize,
    /// Set once a failure stops admission under fail-fast.
    aborted: bool,
    /// Output signature of every node resolved without failure.
    signatures: HashMap<NodeIndex, Hash32>,
    executions: BTreeMap<TaskId, TaskExecution>,
    finished_at: BTreeMap<TaskId, Instant>,
    failures: Vec<(TaskId, ActionFailure)>,
}

/// Executes the selected part of the graph.
///
/// The calling thread coordinates: it owns the state table, decides what can
/// be skipped, and admits out-of-date nodes to the worker pool in declaration
/// order while fewer than `workers` actions are running. Workers send their
/// results back over a channel, and each completion may unlock dependents.
pub(crate) fn run(
    engine: &Engine,
    graph: &TaskGraph,
    targets: &[&str],
) -> Result<BuildResult, BuildError> {
    let started = Instant::now();

    engine.reporter.on_phase(RunPhase::Validating);
    let selected = match graph.validate(targets).and_then(|()| graph.closure(targets)) {
        Ok(selected) => selected,
        Err(e) => {
            tracing::error!("{e}");
            engine.reporter.on_phase(RunPhase::Aborted);
            return Err(e.into());
        }
    };

    let workers = engine.settings.effective_workers();
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("kiln-worker-{i}"))
        .build()?;

    let mut ctx = ExecutionContext::new(engine, graph, workers, selected);
    tracing::info!(
        "Running {} task(s) on {} worker(s)",
        ctx.states.len(),
        workers
    );
    engine.reporter.on_build_started(ctx.states.len());
    ctx.set_phase(RunPhase::Scheduling);

    let (sender, receiver) = channel::<Completion>();

    pool.in_place_scope(|scope| {
        loop {
            ctx.schedule(scope, &sender);

            if ctx.aborted || !ctx.has_pending() {
                ctx.set_phase(RunPhase::Draining);
            }

            if ctx.running == 0 {
                break;
            }

            let Ok(completion) = receiver.recv() else {
                break;
            };

            ctx.complete(completion);
        }
    });

    let phase = match ctx.aborted {
        true => RunPhase::Aborted,
        false => RunPhase::Completed,
    };
    ctx.set_phase(phase);

    let result = ctx.finish(started);
    let counts = result.counts();
    tracing::info!(
        "Build {} in {:.2?}: {} executed, {} up to date, {} skipped, {} failed",
        if result.is_success() { "finished" } else { "failed" },
        result.elapsed,
        counts.succeeded,
        counts.up_to_date,
        counts.skipped,
        counts.failed,
    );

    engine.reporter.on_build_finished(&result.summary());
    Ok(result)
}

impl<'a> ExecutionContext<'a> {
    fn new(
        engine: &'a Engine,
        graph: &'a TaskGraph,
        workers: usize,
        selected: BTreeSet<NodeIndex>,
    ) -> Self {
        let remaining: HashMap<_, _> = selected
            .iter()
            .map(|&index| {
                let count = graph
                    .dependencies(index)
                    .into_iter()
                    .filter(|dependency| selected.contains(dependency))
                    .count();
                (index, count)
            })
            .collect();

        let unlocked = remaining
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&index, _)| index)
            .collect();

        Self {
            engine,
            graph,
            workers,
            phase: RunPhase::Validating,
            waiting: selected.len(),
            states: selected
                .into_iter()
                .map(|index| (index, TaskState::Pending))
                .collect(),
            remaining,
            unlocked,
            queue: BTreeMap::new(),
            running: 0,
            aborted: false,
            signatures: HashMap::new(),
            executions: BTreeMap::new(),
            finished_at: BTreeMap::new(),
            failures: Vec::new(),
        }
    }

    fn set_phase(&mut self, phase: RunPhase) {
        if self.phase != phase {
            tracing::info!("Entering phase {phase}");
            self.phase = phase;
            self.engine.reporter.on_phase(phase);
        }
    }

    /// Whether any node still waits to be decided or admitted.
    fn has_pending(&self) -> bool {
        self.waiting > 0
    }

    /// Decides every unlocked node, then fills the free workers.
    fn schedule<'s>(&mut self, scope: &Scope<'s>, sender: &Sender<Completion>)
    where
        'a: 's,
    {
        // Skips resolve synchronously and may unlock more nodes.
        while !self.aborted {
            let Some(index) = self.unlocked.pop_first() else {
                break;
            };

            self.states.insert(index, TaskState::Ready);
            match self.decide(index) {
                Decision::Resolved(outcome) => self.resolve(index, outcome),
                Decision::Dispatch(fingerprint) => {
                    self.queue.insert(index, fingerprint);
                }
            }
        }

        while !self.aborted && self.running < self.workers {
            let Some((index, fingerprint)) = self.queue.pop_first() else {
                break;
            };
            self.dispatch(index, fingerprint, scope, sender);
        }
    }

    fn decide(&mut self, index: NodeIndex) -> Decision {
        let graph = self.graph;
        let node = graph.node(index);

        if !node.should_run() {
            tracing::debug!("Skipping {}, a predicate does not hold", node.id());
            return Decision::Resolved(Outcome::SkippedByPredicate);
        }

        let current = self
            .upstream(index)
            .and_then(|upstream| Fingerprint::capture(node, upstream))
            .and_then(|fingerprint| fingerprint.with_outputs(node));

        let current = match current {
            Ok(current) => current,
            Err(e) => return Decision::Resolved(Outcome::Failed(ActionFailure::new(e))),
        };

        let previous = self.engine.store.previous(node.id());

        match uptodate::evaluate(node, previous.as_ref(), &current, self.engine.settings.rerun) {
            Verdict::UpToDate => {
                self.signatures.insert(index, current.output_signature());
                Decision::Resolved(Outcome::UpToDate)
            }
            Verdict::NoHistory => {
                tracing::debug!("{} has no recorded history", node.id());
                Decision::Dispatch(current)
            }
            Verdict::OutOfDate(reasons) => {
                for reason in &reasons {
                    tracing::debug!("{} is out of date: {}", node.id(), reason);
                }
                Decision::Dispatch(current)
            }
        }
    }

    /// Output signatures of the dependencies of `index`.
    ///
    /// Dependencies skipped by a predicate never recorded one, their outputs
    /// are taken as they are on disk now.
    fn upstream(&mut self, index: NodeIndex) -> Result<BTreeMap<String, Hash32>, SnapshotError> {
        let graph = self.graph;
        let mut upstream = BTreeMap::new();

        for dependency in graph.dependencies(index) {
            let node = graph.node(dependency);
            let signature = match self.signatures.get(&dependency) {
                Some(&signature) => signature,
                None => {
                    let signature = signature_of(&snapshot(node.outputs())?);
                    self.signatures.insert(dependency, signature);
                    signature
                }
            };
            upstream.insert(node.id().to_string(), signature);
        }

        Ok(upstream)
    }

    fn dispatch<'s>(
        &mut self,
        index: NodeIndex,
        fingerprint: Fingerprint,
        scope: &Scope<'s>,
        sender: &Sender<Completion>,
    ) where
        'a: 's,
    {
        let graph = self.graph;
        let node = graph.node(index);
        tracing::debug!("Dispatching {}", node.id());

        self.states.insert(index, TaskState::Running);
        self.waiting -= 1;
        self.running += 1;

        let sender = sender.clone();

        scope.spawn(move |_| {
            let span = tracing::span!(Level::INFO, "task", id = %node.id());
            span.pb_set_style(&TASK_STYLE);
            span.pb_set_message(&format!("Running {}", node.id()));
            let _enter = span.enter();

            let start = Instant::now();

            // The action only sees what it captured itself; a panic can't
            // leave engine state half updated.
            let result = match catch_unwind(AssertUnwindSafe(|| node.run())) {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!(panic_message(panic))),
            };

            let result = result.and_then(|()| {
                fingerprint
                    .with_outputs(node)
                    .map_err(anyhow::Error::from)
            });

            let duration = start.elapsed();

            // The receiver lives until every worker is done.
            let _ = sender.send(Completion {
                index,
                result,
                execution: TaskExecution { start, duration },
            });
        });
    }

    fn complete(&mut self, completion: Completion) {
        let Completion {
            index,
            result,
            execution,
        } = completion;

        self.running -= 1;

        let id = self.graph.node(index).id();
        self.executions.insert(id.clone(), execution);

        match result {
            Ok(fingerprint) => {
                tracing::debug!("{} finished in {:.2?}", id, execution.duration);
                self.signatures.insert(index, fingerprint.output_signature());
                if let Err(e) = self.engine.store.record(id, fingerprint) {
                    tracing::warn!("Couldn't record fingerprint of {}: {}", id, e);
                }
                self.resolve(index, Outcome::Executed);
            }
            Err(e) => self.resolve(index, Outcome::Failed(e.into())),
        }
    }

    /// Moves a node to its terminal state and reports it, then updates its
    /// dependents. A failing outcome skips every pending transitive
    /// dependent, also after a fail-fast abort.
    fn resolve(&mut self, index: NodeIndex, outcome: Outcome) {
        let mut blocked = VecDeque::new();
        self.settle(index, &outcome, &mut blocked);

        while let Some(index) = blocked.pop_front() {
            if self.states.get(&index) == Some(&TaskState::Pending) {
                self.settle(index, &Outcome::SkippedFailedDependency, &mut blocked);
            }
        }
    }

    fn settle(
        &mut self,
        index: NodeIndex,
        outcome: &Outcome,
        blocked: &mut VecDeque<NodeIndex>,
    ) {
        let graph = self.graph;
        let id = graph.node(index).id();
        let at = Instant::now();
        let state = outcome.state();

        let previous = self.states.insert(index, state);
        if matches!(previous, Some(TaskState::Pending | TaskState::Ready)) {
            self.waiting -= 1;
        }
        self.finished_at.insert(id.clone(), at);

        match outcome {
            Outcome::Failed(failure) => {
                tracing::error!("Task {} failed: {}", id, failure);
                self.failures.push((id.clone(), failure.clone()));

                if self.engine.settings.failure == FailurePolicy::FailFast && !self.aborted {
                    tracing::info!("Fail-fast: no further tasks will be started");
                    self.aborted = true;
                }
            }
            Outcome::SkippedFailedDependency => {
                tracing::info!("Skipping {}, a dependency failed", id);
            }
            _ => {}
        }

        self.engine.reporter.on_node_outcome(id, outcome, at);

        for dependent in graph.dependents(index) {
            if self.states.get(&dependent) != Some(&TaskState::Pending) {
                continue;
            }

            if state.is_failing() {
                blocked.push_back(dependent);
            } else if let Some(count) = self.remaining.get_mut(&dependent) {
                *count -= 1;
                if *count == 0 {
                    self.unlocked.insert(dependent);
                }
            }
        }
    }

    fn finish(self, started: Instant) -> BuildResult {
        let mut states = BTreeMap::new();
        let mut not_executed = Vec::new();

        for (&index, &state) in &self.states {
            let id = self.graph.node(index).id().clone();
            if !state.is_terminal() {
                not_executed.push(id.clone());
            }
            states.insert(id, state);
        }

        BuildResult {
            phase: self.phase,
            states,
            executions: self.executions,
            finished_at: self.finished_at,
            failures: self.failures,
            not_executed,
            elapsed: started.elapsed(),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}
