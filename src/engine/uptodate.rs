//! Decides whether a task action can be skipped.
//!
//! The verdict compares the fingerprint recorded after the last successful
//! run with a freshly captured one, collection by collection. A task is only
//! up to date when nothing it declared changed *and* every output it produced
//! is still present and untouched.

use std::collections::BTreeMap;
use std::fmt::Display;

use crate::fingerprint::{Fingerprint, Signature};
use crate::task::TaskNode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    UpToDate,
    OutOfDate(Vec<Reason>),
    /// First run of this task, nothing to compare against.
    NoHistory,
}

impl Verdict {
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, Verdict::UpToDate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    Rerun,
    NoOutputs,
    InputChanged(String),
    InputAdded(String),
    InputRemoved(String),
    PropertyChanged(String),
    PropertyAdded(String),
    PropertyRemoved(String),
    DependencyChanged(String),
    OutputMissing(String),
    OutputChanged(String),
    UpToDateWhen,
}

impl Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::Rerun => write!(f, "executed with rerun enabled"),
            Reason::NoOutputs => write!(f, "task has not declared any outputs"),
            Reason::InputChanged(name) => write!(f, "input '{name}' has changed"),
            Reason::InputAdded(name) => write!(f, "input '{name}' was added"),
            Reason::InputRemoved(name) => write!(f, "input '{name}' was removed"),
            Reason::PropertyChanged(name) => write!(f, "property '{name}' has changed"),
            Reason::PropertyAdded(name) => write!(f, "property '{name}' was added"),
            Reason::PropertyRemoved(name) => write!(f, "property '{name}' was removed"),
            Reason::DependencyChanged(name) => write!(f, "output of '{name}' has changed"),
            Reason::OutputMissing(name) => write!(f, "output '{name}' is missing"),
            Reason::OutputChanged(name) => write!(f, "output '{name}' has been modified"),
            Reason::UpToDateWhen => write!(f, "an up-to-date check returned false"),
        }
    }
}

/// Compares `current` against `previous` for `node`.
///
/// `current` must carry the current state of the outputs, taken before the
/// action would run.
pub fn evaluate(
    node: &TaskNode,
    previous: Option<&Fingerprint>,
    current: &Fingerprint,
    rerun: bool,
) -> Verdict {
    if rerun {
        return Verdict::OutOfDate(vec![Reason::Rerun]);
    }

    let Some(previous) = previous else {
        return Verdict::NoHistory;
    };

    let mut reasons = Vec::new();

    if node.outputs.is_empty() && !node.cacheable {
        reasons.push(Reason::NoOutputs);
    }

    compare(
        &previous.inputs,
        &current.inputs,
        &mut reasons,
        Reason::InputChanged,
        Reason::InputAdded,
        Reason::InputRemoved,
    );

    compare(
        &previous.properties,
        &current.properties,
        &mut reasons,
        Reason::PropertyChanged,
        Reason::PropertyAdded,
        Reason::PropertyRemoved,
    );

    compare(
        &previous.upstream,
        &current.upstream,
        &mut reasons,
        Reason::DependencyChanged,
        Reason::DependencyChanged,
        Reason::DependencyChanged,
    );

    check_outputs(&previous.outputs, &current.outputs, &mut reasons);

    if reasons.is_empty() && !node.up_to_date_when.iter().all(|check| check()) {
        reasons.push(Reason::UpToDateWhen);
    }

    if reasons.is_empty() {
        Verdict::UpToDate
    } else {
        Verdict::OutOfDate(reasons)
    }
}

fn compare<V: PartialEq>(
    previous: &BTreeMap<String, V>,
    current: &BTreeMap<String, V>,
    reasons: &mut Vec<Reason>,
    changed: fn(String) -> Reason,
    added: fn(String) -> Reason,
    removed: fn(String) -> Reason,
) {
    for (name, value) in current {
        match previous.get(name) {
            Some(old) if old == value => {}
            Some(_) => reasons.push(changed(name.clone())),
            None => reasons.push(added(name.clone())),
        }
    }

    for name in previous.keys() {
        if !current.contains_key(name) {
            reasons.push(removed(name.clone()));
        }
    }
}

fn check_outputs(
    previous: &BTreeMap<String, Signature>,
    current: &BTreeMap<String, Signature>,
    reasons: &mut Vec<Reason>,
) {
    for (name, signature) in current {
        if !signature.complete {
            reasons.push(Reason::OutputMissing(name.clone()));
        } else if previous.get(name) != Some(signature) {
            reasons.push(Reason::OutputChanged(name.clone()));
        }
    }

    for name in previous.keys() {
        if !current.contains_key(name) {
            reasons.push(Reason::OutputChanged(name.clone()));
        }
    }
}
