use thiserror::Error;

use crate::state::Phase;

/// Problems detected while validating a [`crate::config::SimulationConfig`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Duration is zero, negative, or not finite.
    #[error("simulation duration must be positive and finite, got {0}")]
    InvalidDuration(f64),
    /// Concurrency ceiling of zero would never admit a request.
    #[error("max_concurrent must be at least 1")]
    ZeroConcurrency,
    /// Signals need a positive speed to ever complete.
    #[error("signal speed must be positive and finite, got {0}")]
    InvalidSignalSpeed(f64),
    /// Canvas dimensions must be positive.
    #[error("canvas must have positive finite dimensions, got {width}x{height}")]
    InvalidCanvas {
        /// Width in px.
        width: f64,
        /// Height in px.
        height: f64,
    },
    /// At least one model must remain to receive traffic.
    #[error("configuration declares no models")]
    NoModels,
    /// Two entities of the same kind share an id.
    #[error("duplicate {kind} id `{id}`")]
    DuplicateId {
        /// Entity kind.
        kind: &'static str,
        /// Offending id.
        id: String,
    },
    /// A group points at a profile that does not exist.
    #[error("group `{group}` references unknown profile `{profile}`")]
    UnknownProfile {
        /// Group id.
        group: String,
        /// Missing profile id.
        profile: String,
    },
    /// A group with no users.
    #[error("group `{0}` has no users")]
    EmptyGroup(String),
    /// Numeric field out of its accepted domain.
    #[error("invalid {field} on {kind} `{id}`: {value}")]
    InvalidValue {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: String,
        /// Field name.
        field: &'static str,
        /// Rejected value.
        value: f64,
    },
    /// `total_users` needs a profile to assign derived groups to.
    #[error("total_users is set but default_profile is missing")]
    MissingDefaultProfile,
}

/// Errors surfaced by the simulation runtime.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// The requested phase change is not part of the run state machine.
    #[error("invalid phase transition from {from} to {to}")]
    InvalidTransition {
        /// Current phase.
        from: Phase,
        /// Requested phase.
        to: Phase,
    },
    /// A run record was requested before the run reached `done`.
    #[error("run is not complete (phase {0})")]
    NotComplete(Phase),
    /// A headless run needs a positive, finite step.
    #[error("invalid tick step {0}")]
    InvalidStep(f64),
    /// Configuration rejected at validation time.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
