//! Outcome reporting.
//!
//! The engine pushes every decision it makes to a [`Reporter`]. Reporters are
//! called from the coordinating thread only, but they are shared through an
//! `Arc` and may be inspected from anywhere, so they synchronize internally.

use std::sync::{Arc, LazyLock, Mutex};
use std::time::Instant;

use console::style;
use indicatif::ProgressStyle;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::TaskId;
use crate::engine::{RunPhase, Summary};
use crate::task::Outcome;

static BAR_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

/// Receives the outcome stream of a run.
pub trait Reporter: Send + Sync {
    /// Called once scheduling begins, with the number of nodes taking part.
    fn on_build_started(&self, _total: usize) {}

    fn on_phase(&self, _phase: RunPhase) {}

    /// Called exactly once for every node that reaches a terminal state, in
    /// the order the engine decided them.
    fn on_node_outcome(&self, id: &TaskId, outcome: &Outcome, at: Instant);

    fn on_build_finished(&self, _summary: &Summary) {}
}

/// Discards everything.
impl Reporter for () {
    fn on_node_outcome(&self, _: &TaskId, _: &Outcome, _: Instant) {}
}

/// A single recorded reporter call.
#[derive(Debug, Clone)]
pub enum Event {
    Started(usize),
    Phase(RunPhase),
    Outcome {
        id: TaskId,
        outcome: Outcome,
        at: Instant,
    },
    Finished(Summary),
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Node outcomes in the order they were reported.
    pub fn outcomes(&self) -> Vec<(TaskId, Outcome)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Outcome { id, outcome, .. } => Some((id, outcome)),
                _ => None,
            })
            .collect()
    }

    /// The outcome reported for `id`, if any.
    pub fn outcome(&self, id: &str) -> Option<Outcome> {
        self.outcomes()
            .into_iter()
            .find(|(task, _)| task.as_str() == id)
            .map(|(_, outcome)| outcome)
    }

    /// Time at which the outcome of `id` was reported.
    pub fn reported_at(&self, id: &str) -> Option<Instant> {
        self.events().into_iter().find_map(|event| match event {
            Event::Outcome { id: task, at, .. } if task.as_str() == id => Some(at),
            _ => None,
        })
    }

    pub fn phases(&self) -> Vec<RunPhase> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Phase(phase) => Some(phase),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn push(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

impl Reporter for Recorder {
    fn on_build_started(&self, total: usize) {
        self.push(Event::Started(total));
    }

    fn on_phase(&self, phase: RunPhase) {
        self.push(Event::Phase(phase));
    }

    fn on_node_outcome(&self, id: &TaskId, outcome: &Outcome, at: Instant) {
        self.push(Event::Outcome {
            id: id.clone(),
            outcome: outcome.clone(),
            at,
        });
    }

    fn on_build_finished(&self, summary: &Summary) {
        self.push(Event::Finished(summary.clone()));
    }
}

/// Forwards every call to several reporters, in insertion order.
#[derive(Default)]
pub struct Fanout {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }
}

impl Reporter for Fanout {
    fn on_build_started(&self, total: usize) {
        for reporter in &self.reporters {
            reporter.on_build_started(total);
        }
    }

    fn on_phase(&self, phase: RunPhase) {
        for reporter in &self.reporters {
            reporter.on_phase(phase);
        }
    }

    fn on_node_outcome(&self, id: &TaskId, outcome: &Outcome, at: Instant) {
        for reporter in &self.reporters {
            reporter.on_node_outcome(id, outcome, at);
        }
    }

    fn on_build_finished(&self, summary: &Summary) {
        for reporter in &self.reporters {
            reporter.on_build_finished(summary);
        }
    }
}

/// Drives a `tracing-indicatif` progress bar attached to a `build` span.
///
/// The bar only shows up when an `IndicatifLayer` is installed, which is what
/// `init_logging` does with the `logging` feature enabled.
pub struct ProgressBar {
    span: tracing::Span,
}

impl ProgressBar {
    pub fn new() -> Self {
        let span = tracing::info_span!("build");
        span.pb_set_style(&BAR_STYLE);
        span.pb_set_message("Building tasks...");
        Self { span }
    }
}

impl Default for ProgressBar {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for ProgressBar {
    fn on_build_started(&self, total: usize) {
        self.span.pb_set_length(total as u64);
        // The bar is drawn once the span is first entered. An entered guard
        // is not `Send`, so it can't be kept on a reporter.
        self.span.in_scope(|| {});
    }

    fn on_phase(&self, phase: RunPhase) {
        self.span.pb_set_message(&format!("{phase}"));
    }

    fn on_node_outcome(&self, id: &TaskId, outcome: &Outcome, _: Instant) {
        self.span.pb_inc(1);
        if outcome.is_failure() {
            tracing::error!(parent: &self.span, "{id}: {}", outcome.label());
        }
    }

    fn on_build_finished(&self, summary: &Summary) {
        self.span.pb_set_message(&format!(
            "{} task(s) in {:.2?}",
            summary.counts.total, summary.elapsed
        ));
    }
}

/// The status line as last rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub phase: RunPhase,
    pub percent: usize,
    pub failing: bool,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "> Progress: {} {}%", self.phase, self.percent)?;
        if self.failing {
            write!(f, " (FAILING)")?;
        }
        Ok(())
    }
}

type Sink = Box<dyn Fn(&Status) + Send + Sync>;

struct Progress {
    phase: RunPhase,
    total: usize,
    completed: usize,
    failing: bool,
    last: Option<Status>,
}

/// One-line console progress: `> Progress: DRAINING 75% (FAILING)`.
///
/// A line is only emitted when the phase, the percentage or the failing flag
/// differ from the previously emitted one.
pub struct StatusLine {
    progress: Mutex<Progress>,
    sink: Sink,
}

impl StatusLine {
    /// Writes to standard error.
    pub fn new() -> Self {
        Self::with_sink(|status| {
            let line = status.to_string();
            let line = match status.failing {
                true => style(line).red().bold(),
                false => style(line).green(),
            };
            eprintln!("{line}");
        })
    }

    pub fn with_sink<F>(sink: F) -> Self
    where
        F: Fn(&Status) + Send + Sync + 'static,
    {
        Self {
            progress: Mutex::new(Progress {
                phase: RunPhase::Validating,
                total: 0,
                completed: 0,
                failing: false,
                last: None,
            }),
            sink: Box::new(sink),
        }
    }

    fn update(&self, change: impl FnOnce(&mut Progress)) {
        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        change(&mut progress);

        if progress.completed > progress.total {
            tracing::warn!(
                "more progress logged than there is total work ({} > {})",
                progress.completed,
                progress.total
            );
        }

        let percent = match progress.total {
            0 => 0,
            total => (progress.completed * 100 / total).min(100),
        };

        let status = Status {
            phase: progress.phase,
            percent,
            failing: progress.failing,
        };

        if progress.last != Some(status) {
            progress.last = Some(status);
            (self.sink)(&status);
        }
    }
}

impl Default for StatusLine {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for StatusLine {
    fn on_build_started(&self, total: usize) {
        self.update(|p| {
            p.total = total;
            p.completed = 0;
            p.failing = false;
        });
    }

    fn on_phase(&self, phase: RunPhase) {
        self.update(|p| p.phase = phase);
    }

    fn on_node_outcome(&self, _: &TaskId, outcome: &Outcome, _: Instant) {
        self.update(|p| {
            p.completed += 1;
            p.failing |= outcome.is_failure();
        });
    }
}
