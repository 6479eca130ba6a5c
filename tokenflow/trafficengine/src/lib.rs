#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Tokenflow traffic engine: seeded request spawning through layered routers,
//! round-trip signals and run metrics.

/// Deterministic pseudo-random generator.
#[path = "../rng.rs"]
pub mod rng;

/// Token and request-volume sampling.
#[path = "../sampler.rs"]
pub mod sampler;

/// Configuration loading and validation.
#[path = "../config.rs"]
pub mod config;

/// Request pricing and energy.
#[path = "../pricing.rs"]
pub mod pricing;

/// Routing graph and path lookup.
#[path = "../routing/main.rs"]
pub mod routing;

/// In-flight request signals and path drivers.
#[path = "../signal.rs"]
pub mod signal;

/// Run metrics and the finalized record.
#[path = "../aggregator.rs"]
pub mod aggregator;

/// Phases and state snapshots.
#[path = "../state.rs"]
pub mod state;

/// Error types.
#[path = "../error.rs"]
pub mod error;

/// Telemetry for the traffic engine.
#[path = "../helper.rs"]
pub mod helper;

/// Simulation runtime.
#[path = "../main.rs"]
pub mod runtime;

pub use aggregator::{
    EntityTotals, MetricsAggregator, RunRecord, SustainabilityEquivalents, TrafficTotals,
};
pub use config::SimulationConfig;
pub use error::{ConfigError, EngineError};
pub use helper::{SimulationTelemetry, SimulationTelemetryBuilder};
pub use pricing::{CostModel, RequestCost, StandardCostModel};
pub use rng::FlowRng;
pub use runtime::{SpawnedRequest, TickReport, TrafficSimulation, TrafficSimulationBuilder};
pub use signal::{PathDriver, SignalId, SignalPool};
pub use state::{Phase, RunCompletion, SimulationState};
