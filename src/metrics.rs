use indexmap::IndexMap;
use tracing::info;

use crate::types::StepName;

/// What happened to one record during a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Record was created or overwritten in the warehouse.
    Update,
    /// Record was removed as no longer present at the source.
    Delete,
    /// Record was ignored (missing key field, filtered, or failed).
    Skip,
}

impl Action {
    fn suffix(self) -> &'static str {
        match self {
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Skip => "Skip",
        }
    }
}

/// Per-iteration activity counters, reset at the top of every run-loop pass.
/// Labels are `<step>.<Action>`; insertion order is preserved so summaries
/// read in execution order.
#[derive(Clone, Debug, Default)]
pub struct RunCounters {
    counts: IndexMap<String, u64>,
    seconds: IndexMap<StepName, f64>,
}

impl RunCounters {
    /// Fresh counters with nothing tallied.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one record action for a step.
    pub fn tally(&mut self, step: &str, action: Action) {
        self.tally_many(step, action, 1);
    }

    /// Count `amount` record actions for a step.
    pub fn tally_many(&mut self, step: &str, action: Action, amount: u64) {
        let label = format!("{step}.{}", action.suffix());
        *self.counts.entry(label).or_insert(0) += amount;
    }

    /// Total tallied for one step/action pair.
    pub fn action_count(&self, step: &str, action: Action) -> u64 {
        self.counts
            .get(&format!("{step}.{}", action.suffix()))
            .copied()
            .unwrap_or(0)
    }

    /// Accumulate wall-clock seconds attributed to a step.
    pub fn add_seconds(&mut self, step: impl Into<StepName>, elapsed: f64) {
        *self.seconds.entry(step.into()).or_insert(0.0) += elapsed;
    }

    /// Seconds attributed to a step so far this iteration.
    pub fn seconds(&self, step: &str) -> f64 {
        self.seconds.get(step).copied().unwrap_or(0.0)
    }

    /// The canonical one-line summary for a completed step.
    pub fn step_summary(&self, step: &str) -> String {
        format!(
            "Processed {} in {:.3}/seconds: {}/updates, {}/deletes, {}/skipped",
            step,
            self.seconds(step),
            self.action_count(step, Action::Update),
            self.action_count(step, Action::Delete),
            self.action_count(step, Action::Skip),
        )
    }

    /// Log the canonical summary for a completed step.
    pub fn log_step(&self, step: &str) {
        info!("{}", self.step_summary(step));
    }

    /// All labels tallied this iteration, in first-seen order.
    pub fn labels(&self) -> Vec<(String, u64)> {
        self.counts
            .iter()
            .map(|(label, count)| (label.clone(), *count))
            .collect()
    }
}
