use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Value};
use shared_logging::LogLevel;
use uuid::Uuid;

use crate::{
    aggregator::{MetricsAggregator, RunRecord},
    config::{CanvasSize, SimulationConfig},
    error::{ConfigError, EngineError},
    helper::SimulationTelemetry,
    pricing::{CostModel, RequestCost, StandardCostModel},
    rng::FlowRng,
    routing::{find_request_path, Graph, GraphBuilder, RequestPath, Rgb},
    sampler::{group_rate, sample_tokens, TokenSample, TrafficProfile},
    signal::{PathDriver, SignalId, SignalPool},
    state::{Phase, RunCompletion, SimulationState},
};

/// Mixed into the configured seed so layout jitter never shares a stream with traffic.
const LAYOUT_SALT: u32 = 0x9E37_79B9;
const OUTBOUND_COLOR: Rgb = Rgb(96, 165, 250);
const RETURN_COLOR: Rgb = Rgb(52, 211, 153);

/// Summary of one request spawned during a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpawnedRequest {
    /// Signal carrying the request, `None` when it had no drawable path.
    pub signal: Option<SignalId>,
    /// Originating group.
    pub group_id: String,
    /// One router per enabled layer, in layer order.
    pub router_ids: Vec<String>,
    /// Serving model.
    pub model_id: String,
    /// Sampled tokens.
    pub tokens: TokenSample,
    /// Cost and energy.
    pub cost: RequestCost,
    /// Hops the graph could not resolve.
    pub missing_hops: u32,
}

/// What one call to [`TrafficSimulation::tick`] did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    /// Phase after the tick.
    pub phase: Phase,
    /// Requests spawned, in spawn order.
    pub spawned: Vec<SpawnedRequest>,
    /// Round trips completed.
    pub completed: usize,
    /// Whether the concurrency cap stopped spawning.
    pub capped: bool,
}

#[derive(Debug, Clone)]
struct GroupPlan {
    group_id: String,
    profile: TrafficProfile,
    rate: f64,
}

#[derive(Debug, Clone)]
struct PendingReturn {
    group_id: String,
    router_ids: Vec<String>,
    model_id: String,
}

/// Builder for [`TrafficSimulation`].
pub struct TrafficSimulationBuilder<D: PathDriver = SignalPool> {
    config: SimulationConfig,
    driver: D,
    cost_model: Box<dyn CostModel>,
    telemetry: SimulationTelemetry,
    canvas: Option<CanvasSize>,
    drain_limit: Option<f64>,
}

impl TrafficSimulationBuilder<SignalPool> {
    fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            driver: SignalPool::new(),
            cost_model: Box::new(StandardCostModel),
            telemetry: SimulationTelemetry::disabled(),
            canvas: None,
            drain_limit: None,
        }
    }
}

impl<D: PathDriver> TrafficSimulationBuilder<D> {
    /// Replaces the path driver.
    #[must_use]
    pub fn driver<E: PathDriver>(self, driver: E) -> TrafficSimulationBuilder<E> {
        TrafficSimulationBuilder {
            config: self.config,
            driver,
            cost_model: self.cost_model,
            telemetry: self.telemetry,
            canvas: self.canvas,
            drain_limit: self.drain_limit,
        }
    }

    /// Replaces the cost model.
    #[must_use]
    pub fn cost_model(mut self, cost_model: Box<dyn CostModel>) -> Self {
        self.cost_model = cost_model;
        self
    }

    /// Sets telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: SimulationTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Overrides the configured canvas.
    #[must_use]
    pub fn canvas(mut self, width: f64, height: f64) -> Self {
        self.canvas = Some(CanvasSize { width, height });
        self
    }

    /// Caps how many simulated seconds [`TrafficSimulation::run_headless`]
    /// waits in drain before stopping the run. Unset by default.
    #[must_use]
    pub fn drain_limit(mut self, seconds: f64) -> Self {
        self.drain_limit = Some(seconds);
        self
    }

    /// Validates the configuration and lays out the first graph.
    ///
    /// The simulation starts in [`Phase::Building`].
    pub fn build(self) -> Result<TrafficSimulation<D>, EngineError> {
        let mut config = self.config;
        if let Some(canvas) = self.canvas {
            config.canvas = canvas;
        }
        config.normalize();
        config.validate()?;
        let plans = plan_groups(&config)?;
        let mut simulation = TrafficSimulation {
            rng: FlowRng::new(config.seed),
            layers: config.enabled_layers(),
            plans,
            graph_builder: GraphBuilder::new(),
            graph: None,
            driver: self.driver,
            cost_model: self.cost_model,
            telemetry: self.telemetry,
            drain_limit: self.drain_limit,
            aggregator: MetricsAggregator::new(),
            phase: Phase::Building,
            elapsed: 0.0,
            accumulators: IndexMap::new(),
            pending: HashMap::new(),
            run_id: Uuid::new_v4(),
            started_at: None,
            finished_at: None,
            completion: None,
            config,
        };
        simulation.rebuild_graph(false);
        simulation.clear_run();
        Ok(simulation)
    }
}

fn plan_groups(config: &SimulationConfig) -> Result<Vec<GroupPlan>, EngineError> {
    config
        .groups
        .iter()
        .map(|group| {
            let profile = config
                .profile(&group.profile)
                .ok_or_else(|| ConfigError::UnknownProfile {
                    group: group.id.clone(),
                    profile: group.profile.clone(),
                })?;
            Ok(GroupPlan {
                group_id: group.id.clone(),
                rate: group_rate(group.size, profile.rps_per_user),
                profile: profile.clone(),
            })
        })
        .collect()
}

/// Seeded traffic simulation: spawns requests through the routing graph,
/// moves them with a [`PathDriver`], and aggregates run metrics.
///
/// Driven cooperatively by [`Self::tick`]; nothing inside runs on its own.
pub struct TrafficSimulation<D: PathDriver = SignalPool> {
    config: SimulationConfig,
    rng: FlowRng,
    layers: Vec<Vec<usize>>,
    plans: Vec<GroupPlan>,
    graph_builder: GraphBuilder,
    graph: Option<Graph>,
    driver: D,
    cost_model: Box<dyn CostModel>,
    telemetry: SimulationTelemetry,
    drain_limit: Option<f64>,
    aggregator: MetricsAggregator,
    phase: Phase,
    elapsed: f64,
    accumulators: IndexMap<String, f64>,
    pending: HashMap<SignalId, PendingReturn>,
    run_id: Uuid,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    completion: Option<RunCompletion>,
}

impl TrafficSimulation<SignalPool> {
    /// Returns a builder using the in-memory [`SignalPool`] and [`StandardCostModel`].
    #[must_use]
    pub fn builder(config: SimulationConfig) -> TrafficSimulationBuilder<SignalPool> {
        TrafficSimulationBuilder::new(config)
    }
}

impl<D: PathDriver> TrafficSimulation<D> {
    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        let _ = self.telemetry.log(level, message, metadata);
    }

    fn event(&self, topic: &str, payload: Value) {
        let _ = self.telemetry.event(topic, Some(self.run_id), payload);
    }

    fn transition(&mut self, to: Phase) -> Result<(), EngineError> {
        if !self.phase.can_transition(to) {
            return Err(EngineError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }

    fn scatter_seed(&self) -> u32 {
        self.config.seed ^ LAYOUT_SALT
    }

    fn rebuild_graph(&mut self, keep_scatter: bool) {
        let CanvasSize { width, height } = self.config.canvas;
        let scatter_seed = self.scatter_seed();
        let mut layout_rng = FlowRng::new(scatter_seed);
        self.graph = Some(self.graph_builder.build(
            &self.config,
            width,
            height,
            &mut layout_rng,
            keep_scatter,
            scatter_seed,
        ));
    }

    fn clear_run(&mut self) {
        self.driver.clear();
        self.pending.clear();
        self.aggregator.reset();
        self.accumulators = self
            .plans
            .iter()
            .map(|plan| (plan.group_id.clone(), 0.0))
            .collect();
        self.elapsed = 0.0;
        self.started_at = None;
        self.finished_at = None;
        self.completion = None;
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Id of the current (or most recent) run.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Current routing graph, for renderers.
    #[must_use]
    pub fn graph(&self) -> Option<&Graph> {
        self.graph.as_ref()
    }

    /// Path driver, for renderers.
    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Metrics of the current run.
    #[must_use]
    pub fn aggregator(&self) -> &MetricsAggregator {
        &self.aggregator
    }

    /// Marks graph construction as finished: `building → idle`.
    pub fn mark_ready(&mut self) -> Result<(), EngineError> {
        self.transition(Phase::Idle)
    }

    /// Starts a run from `idle` or `done`.
    ///
    /// Metrics, accumulators, and in-flight signals are cleared and the
    /// generator is re-seeded, so every run of a configuration replays the
    /// same traffic.
    pub fn start(&mut self) -> Result<(), EngineError> {
        self.transition(Phase::Running)?;
        self.clear_run();
        self.rng.reseed(self.config.seed);
        self.run_id = Uuid::new_v4();
        self.started_at = Some(Utc::now());
        let meta = json!({
            "run_id": self.run_id,
            "config_id": self.config.id,
            "seed": self.config.seed,
            "duration_seconds": self.config.duration_seconds,
            "groups": self.plans.len(),
            "router_layers": self.layers.len(),
            "models": self.config.models.len(),
        });
        self.log(LogLevel::Info, "simulation.run.started", meta.clone());
        self.event("simulation.run.started", meta);
        Ok(())
    }

    /// Forces the run to `done`, dropping in-flight signals.
    ///
    /// Their returns are never recorded; the record reports them as abandoned.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        self.transition(Phase::Done)?;
        let abandoned = self.pending.len();
        self.driver.clear();
        self.pending.clear();
        self.finished_at = Some(Utc::now());
        self.completion = Some(RunCompletion::Stopped);
        let meta = json!({
            "run_id": self.run_id,
            "elapsed": self.elapsed,
            "abandoned": abandoned,
            "forwards": self.aggregator.totals().forwards,
        });
        self.log(LogLevel::Warn, "simulation.run.stopped", meta.clone());
        self.event("simulation.run.stopped", meta);
        Ok(())
    }

    /// Clears counters, signals, and accumulators.
    ///
    /// Returns to `idle`, or stays in `building` if the graph was never marked ready.
    pub fn reset(&mut self) {
        self.clear_run();
        self.rng.reseed(self.config.seed);
        if self.phase != Phase::Building {
            self.phase = Phase::Idle;
        }
    }

    /// Swaps in a new configuration and returns to `building`.
    ///
    /// Rejected while a run is active; the current configuration is kept
    /// when the new one fails validation.
    pub fn update_config(&mut self, mut config: SimulationConfig) -> Result<(), EngineError> {
        if self.phase.is_active() {
            return Err(EngineError::InvalidTransition {
                from: self.phase,
                to: Phase::Building,
            });
        }
        config.normalize();
        config.validate()?;
        self.plans = plan_groups(&config)?;
        self.layers = config.enabled_layers();
        self.config = config;
        self.rng.reseed(self.config.seed);
        self.rebuild_graph(false);
        self.clear_run();
        self.phase = Phase::Building;
        let meta = json!({
            "config_id": self.config.id,
            "seed": self.config.seed,
            "generation": self.graph_builder.generation(),
        });
        self.log(LogLevel::Info, "simulation.config.updated", meta.clone());
        self.event("simulation.config.updated", meta);
        Ok(())
    }

    /// Re-lays out the graph for a new canvas, keeping the node scatter.
    ///
    /// In-flight signals keep the points they were created with.
    pub fn resize(&mut self, width: f64, height: f64) -> Result<(), EngineError> {
        if !(width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0) {
            return Err(ConfigError::InvalidCanvas { width, height }.into());
        }
        self.config.canvas = CanvasSize { width, height };
        self.rebuild_graph(true);
        Ok(())
    }

    /// `elapsed / duration` while running, 1 in drain and done, 0 otherwise.
    #[must_use]
    pub fn progress(&self) -> f64 {
        match self.phase {
            Phase::Running => (self.elapsed / self.config.duration_seconds).clamp(0.0, 1.0),
            Phase::Drain | Phase::Done => 1.0,
            Phase::Building | Phase::Idle => 0.0,
        }
    }

    /// Whether the run reached `done`.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Snapshot for renderers.
    #[must_use]
    pub fn state(&self) -> SimulationState {
        SimulationState {
            phase: self.phase,
            elapsed: self.elapsed,
            duration: self.config.duration_seconds,
            totals: self.aggregator.totals(),
            accumulators: self.accumulators.clone(),
            max_concurrent: self.config.max_concurrent,
            live_signals: self.driver.signal_count(),
        }
    }

    /// Advances the simulation by `dt` seconds.
    ///
    /// Finished signals are collected first so their slots are free for this
    /// tick's spawns. Outside `running` and `drain` this is a no-op. Non-finite
    /// or negative steps count as zero.
    pub fn tick(&mut self, dt: f64) -> TickReport {
        let dt = if dt.is_finite() { dt.max(0.0) } else { 0.0 };
        let mut report = TickReport {
            phase: self.phase,
            spawned: Vec::new(),
            completed: 0,
            capped: false,
        };
        if !self.phase.is_active() {
            return report;
        }

        for id in self.driver.step(dt) {
            if let Some(pending) = self.pending.remove(&id) {
                self.aggregator
                    .add_return(&pending.group_id, &pending.router_ids, &pending.model_id);
                report.completed += 1;
            }
        }

        if self.phase == Phase::Running {
            let step = dt.min(self.config.duration_seconds - self.elapsed).max(0.0);
            self.elapsed += step;
            for (plan, accumulator) in self.plans.iter().zip(self.accumulators.values_mut()) {
                *accumulator += plan.rate * step;
            }
            'groups: for idx in 0..self.plans.len() {
                while self.accumulators[idx] >= 1.0 {
                    if self.driver.signal_count() >= self.config.max_concurrent {
                        report.capped = true;
                        break 'groups;
                    }
                    self.accumulators[idx] -= 1.0;
                    let spawned = self.spawn_request(idx);
                    report.spawned.push(spawned);
                }
            }
            if self.elapsed >= self.config.duration_seconds {
                self.phase = Phase::Drain;
                let meta = json!({
                    "run_id": self.run_id,
                    "in_flight": self.driver.signal_count(),
                    "forwards": self.aggregator.totals().forwards,
                });
                self.log(LogLevel::Info, "simulation.run.draining", meta.clone());
                self.event("simulation.run.draining", meta);
            }
        }

        if self.phase == Phase::Drain && self.driver.signal_count() == 0 {
            self.phase = Phase::Done;
            self.finished_at = Some(Utc::now());
            self.completion = Some(RunCompletion::Drained);
            let totals = self.aggregator.totals();
            let meta = json!({
                "run_id": self.run_id,
                "forwards": totals.forwards,
                "returns": totals.returns,
                "total_tokens": totals.total_tokens,
                "model_cost": totals.model_cost,
                "commission": totals.commission,
                "energy_wh": totals.energy_wh,
                "missing_hops": totals.missing_hops,
                "unrouted": totals.unrouted,
            });
            self.log(LogLevel::Info, "simulation.run.completed", meta.clone());
            self.event("simulation.run.completed", meta);
        }

        report.phase = self.phase;
        report
    }

    fn spawn_request(&mut self, group_idx: usize) -> SpawnedRequest {
        let plan = &self.plans[group_idx];
        let tokens = sample_tokens(&plan.profile, &mut self.rng);

        let routers: Vec<_> = self
            .layers
            .iter()
            .filter_map(|layer| self.rng.choice(layer))
            .map(|&idx| &self.config.routers[idx])
            .collect();
        let models = &self.config.models;
        let model_idx = if models.len() == 1 {
            0
        } else {
            let weights: Vec<f64> = models.iter().map(|model| model.selection_weight()).collect();
            self.rng.weighted_index(&weights).unwrap_or(0)
        };
        let model = &models[model_idx];

        let cost = self.cost_model.evaluate(&tokens, model, &routers);
        let router_ids: Vec<String> = routers.iter().map(|router| router.id.clone()).collect();
        self.aggregator
            .add_forward(&plan.group_id, &router_ids, &model.id, &tokens, &cost);

        let path = match self.graph.as_ref() {
            Some(graph) => {
                let router_refs: Vec<&str> = router_ids.iter().map(String::as_str).collect();
                match (graph.group_node(&plan.group_id), graph.model_node(&model.id)) {
                    (Some(group_node), Some(model_node)) => {
                        find_request_path(graph, group_node, &router_refs, model_node)
                    }
                    _ => unresolved(&router_ids),
                }
            }
            None => unresolved(&router_ids),
        };
        if !path.is_complete() {
            self.aggregator.record_missing_hops(path.missing_hops);
            let _ = self.telemetry.log(
                LogLevel::Warn,
                "simulation.path.missing_hop",
                json!({
                    "run_id": self.run_id,
                    "group_id": plan.group_id,
                    "router_ids": router_ids,
                    "model_id": model.id,
                    "missing_hops": path.missing_hops,
                }),
            );
        }

        let signal = match self.graph.as_ref() {
            Some(graph) => {
                let edges = path.resolve(graph);
                if edges.is_empty() {
                    None
                } else {
                    self.driver.add_round_trip_signal(
                        &edges,
                        self.config.signal_speed,
                        OUTBOUND_COLOR,
                        RETURN_COLOR,
                    )
                }
            }
            None => None,
        };
        match signal {
            Some(id) => {
                self.pending.insert(
                    id,
                    PendingReturn {
                        group_id: plan.group_id.clone(),
                        router_ids: router_ids.clone(),
                        model_id: model.id.clone(),
                    },
                );
            }
            None => {
                self.aggregator.record_unrouted();
                self.aggregator
                    .add_return(&plan.group_id, &router_ids, &model.id);
            }
        }

        SpawnedRequest {
            signal,
            group_id: plan.group_id.clone(),
            router_ids,
            model_id: model.id.clone(),
            tokens,
            cost,
            missing_hops: path.missing_hops,
        }
    }

    /// Freezes the finished run into a [`RunRecord`].
    pub fn finalize(&self) -> Result<RunRecord, EngineError> {
        if self.phase != Phase::Done {
            return Err(EngineError::NotComplete(self.phase));
        }
        let now = Utc::now();
        Ok(self.aggregator.finalize(
            self.run_id,
            &self.config.id,
            self.started_at.unwrap_or(now),
            self.elapsed,
            self.finished_at.unwrap_or(now),
            self.completion.unwrap_or(RunCompletion::Drained),
            self.config.sustainability,
        ))
    }

    /// Runs start to finish with a fixed step and returns the record.
    ///
    /// The drain lasts until every signal has returned. Only a
    /// [`TrafficSimulationBuilder::drain_limit`] stops it early.
    pub fn run_headless(&mut self, dt: f64) -> Result<RunRecord, EngineError> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(EngineError::InvalidStep(dt));
        }
        if self.phase == Phase::Building {
            self.mark_ready()?;
        }
        self.start()?;
        let mut drained_for = 0.0;
        while !self.is_complete() {
            self.tick(dt);
            if self.phase == Phase::Drain {
                drained_for += dt;
                if self.drain_limit.is_some_and(|limit| drained_for > limit) {
                    self.stop()?;
                }
            }
        }
        self.finalize()
    }
}

fn unresolved(router_ids: &[String]) -> RequestPath {
    RequestPath {
        edges: Vec::new(),
        missing_hops: u32::try_from(router_ids.len() + 1).unwrap_or(u32::MAX),
    }
}
