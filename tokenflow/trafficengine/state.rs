use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::aggregator::TrafficTotals;

/// Run phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Graph is being constructed or animated in.
    Building,
    /// Ready to start.
    Idle,
    /// Spawning traffic.
    Running,
    /// Duration elapsed; waiting for in-flight signals.
    Drain,
    /// Finished, naturally or by `stop()`.
    Done,
}

impl Phase {
    /// Label for logging.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Drain => "drain",
            Self::Done => "done",
        }
    }

    /// Whether the run state machine allows `self → to`.
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Building, Self::Idle)
                | (Self::Idle | Self::Done, Self::Running)
                | (Self::Running, Self::Drain)
                | (Self::Running | Self::Drain, Self::Done)
        )
    }

    /// Whether signals may be in flight.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Drain)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a run reached `done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunCompletion {
    /// Every in-flight signal returned.
    Drained,
    /// `stop()` ended the run; in-flight requests were abandoned.
    Stopped,
}

/// Read-only snapshot polled by renderers every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationState {
    /// Current phase.
    pub phase: Phase,
    /// Elapsed simulated seconds, capped at the duration.
    pub elapsed: f64,
    /// Configured duration.
    pub duration: f64,
    /// Totals mirrored from the aggregator.
    pub totals: TrafficTotals,
    /// Fractional spawn accumulator per group id.
    pub accumulators: IndexMap<String, f64>,
    /// Concurrency ceiling.
    pub max_concurrent: usize,
    /// Signals currently in flight.
    pub live_signals: usize,
}
