use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::SustainabilityAssumptions, pricing::RequestCost, sampler::TokenSample,
    state::RunCompletion,
};

/// Run-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrafficTotals {
    /// Requests sent.
    pub forwards: u64,
    /// Requests whose round trip completed.
    pub returns: u64,
    /// Prompt tokens.
    pub prompt_tokens: u64,
    /// Completion tokens.
    pub completion_tokens: u64,
    /// Prompt + completion tokens.
    pub total_tokens: u64,
    /// Model cost in USD.
    pub model_cost: f64,
    /// Router commission in USD.
    pub commission: f64,
    /// Energy in Wh.
    pub energy_wh: f64,
    /// Path hops the graph could not resolve.
    pub missing_hops: u64,
    /// Requests with no drawable path at all.
    pub unrouted: u64,
}

/// Counters for one group, router, or model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityTotals {
    /// Requests sent through this entity.
    pub forwards: u64,
    /// Requests returned through this entity.
    pub returns: u64,
    /// Prompt tokens.
    pub prompt_tokens: u64,
    /// Completion tokens.
    pub completion_tokens: u64,
    /// Prompt + completion tokens.
    pub total_tokens: u64,
    /// Model cost in USD (groups and models).
    pub model_cost: f64,
    /// Commission in USD (groups, and routers by even split).
    pub commission: f64,
    /// Energy in Wh (groups and models).
    pub energy_wh: f64,
}

impl EntityTotals {
    fn add_tokens(&mut self, tokens: &TokenSample) {
        self.forwards += 1;
        self.prompt_tokens += tokens.prompt;
        self.completion_tokens += tokens.completion;
        self.total_tokens += tokens.total;
    }
}

/// Everyday equivalents of the energy a run consumed.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SustainabilityEquivalents {
    /// Grams of CO2-equivalent.
    pub co2e_grams: f64,
    /// Smartphone full charges.
    pub phone_charges: f64,
    /// Hours of average household consumption.
    pub household_hours: f64,
}

impl SustainabilityAssumptions {
    /// Converts watt-hours into equivalents.
    #[must_use]
    pub fn equivalents(&self, energy_wh: f64) -> SustainabilityEquivalents {
        let kwh = energy_wh / 1000.0;
        let ratio = |value: f64, per: f64| if per > 0.0 { value / per } else { 0.0 };
        SustainabilityEquivalents {
            co2e_grams: kwh * self.grid_g_co2e_per_kwh,
            phone_charges: ratio(energy_wh, self.phone_charge_wh),
            household_hours: ratio(kwh, self.household_kw),
        }
    }
}

/// Immutable summary of one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    id: Uuid,
    config_id: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    duration_seconds: f64,
    completion: RunCompletion,
    totals: TrafficTotals,
    abandoned: u64,
    assumptions: SustainabilityAssumptions,
    sustainability: SustainabilityEquivalents,
    by_group: IndexMap<String, EntityTotals>,
    by_router: IndexMap<String, EntityTotals>,
    by_model: IndexMap<String, EntityTotals>,
}

impl RunRecord {
    /// Run id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Configuration the run used.
    #[must_use]
    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    /// Start timestamp.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time the run reached `done`.
    #[must_use]
    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    /// Simulated seconds of spawning.
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        self.duration_seconds
    }

    /// Drained or stopped.
    #[must_use]
    pub fn completion(&self) -> RunCompletion {
        self.completion
    }

    /// Run-wide totals.
    #[must_use]
    pub fn totals(&self) -> &TrafficTotals {
        &self.totals
    }

    /// Requests forwarded but never returned.
    #[must_use]
    pub fn abandoned(&self) -> u64 {
        self.abandoned
    }

    /// Assumptions used for the equivalents.
    #[must_use]
    pub fn assumptions(&self) -> &SustainabilityAssumptions {
        &self.assumptions
    }

    /// Energy equivalents.
    #[must_use]
    pub fn sustainability(&self) -> &SustainabilityEquivalents {
        &self.sustainability
    }

    /// Per-group breakdown in first-touch order.
    #[must_use]
    pub fn by_group(&self) -> &IndexMap<String, EntityTotals> {
        &self.by_group
    }

    /// Per-router breakdown in first-touch order.
    #[must_use]
    pub fn by_router(&self) -> &IndexMap<String, EntityTotals> {
        &self.by_router
    }

    /// Per-model breakdown in first-touch order.
    #[must_use]
    pub fn by_model(&self) -> &IndexMap<String, EntityTotals> {
        &self.by_model
    }
}

/// Mutable accumulator for one run, reused across runs via [`Self::reset`].
#[derive(Debug, Clone, Default)]
pub struct MetricsAggregator {
    totals: TrafficTotals,
    by_group: IndexMap<String, EntityTotals>,
    by_router: IndexMap<String, EntityTotals>,
    by_model: IndexMap<String, EntityTotals>,
}

impl MetricsAggregator {
    /// Creates an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry<'a>(map: &'a mut IndexMap<String, EntityTotals>, id: &str) -> &'a mut EntityTotals {
        map.entry(id.to_string()).or_default()
    }

    /// Records a sent request.
    ///
    /// Commission is split evenly across the routers of this request.
    pub fn add_forward<S: AsRef<str>>(
        &mut self,
        group_id: &str,
        router_ids: &[S],
        model_id: &str,
        tokens: &TokenSample,
        cost: &RequestCost,
    ) {
        let totals = &mut self.totals;
        totals.forwards += 1;
        totals.prompt_tokens += tokens.prompt;
        totals.completion_tokens += tokens.completion;
        totals.total_tokens += tokens.total;
        totals.model_cost += cost.base_cost;
        totals.commission += cost.commission;
        totals.energy_wh += cost.energy_wh;

        let group = Self::entry(&mut self.by_group, group_id);
        group.add_tokens(tokens);
        group.model_cost += cost.base_cost;
        group.commission += cost.commission;
        group.energy_wh += cost.energy_wh;

        if !router_ids.is_empty() {
            #[allow(clippy::cast_precision_loss)]
            let share = cost.commission / router_ids.len() as f64;
            for router_id in router_ids {
                let router = Self::entry(&mut self.by_router, router_id.as_ref());
                router.add_tokens(tokens);
                router.commission += share;
            }
        }

        let model = Self::entry(&mut self.by_model, model_id);
        model.add_tokens(tokens);
        model.model_cost += cost.base_cost;
        model.energy_wh += cost.energy_wh;
    }

    /// Records a completed round trip.
    pub fn add_return<S: AsRef<str>>(&mut self, group_id: &str, router_ids: &[S], model_id: &str) {
        self.totals.returns += 1;
        Self::entry(&mut self.by_group, group_id).returns += 1;
        for router_id in router_ids {
            Self::entry(&mut self.by_router, router_id.as_ref()).returns += 1;
        }
        Self::entry(&mut self.by_model, model_id).returns += 1;
    }

    /// Counts hops the graph could not resolve.
    pub fn record_missing_hops(&mut self, hops: u32) {
        self.totals.missing_hops += u64::from(hops);
    }

    /// Counts a request that had no drawable path.
    pub fn record_unrouted(&mut self) {
        self.totals.unrouted += 1;
    }

    /// Snapshot of the run-wide totals.
    #[must_use]
    pub fn totals(&self) -> TrafficTotals {
        self.totals
    }

    /// Per-group breakdown.
    #[must_use]
    pub fn by_group(&self) -> &IndexMap<String, EntityTotals> {
        &self.by_group
    }

    /// Per-router breakdown.
    #[must_use]
    pub fn by_router(&self) -> &IndexMap<String, EntityTotals> {
        &self.by_router
    }

    /// Per-model breakdown.
    #[must_use]
    pub fn by_model(&self) -> &IndexMap<String, EntityTotals> {
        &self.by_model
    }

    /// Zeroes every counter and clears the breakdowns.
    pub fn reset(&mut self) {
        self.totals = TrafficTotals::default();
        self.by_group.clear();
        self.by_router.clear();
        self.by_model.clear();
    }

    /// Freezes the current counters into a [`RunRecord`].
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn finalize(
        &self,
        id: Uuid,
        config_id: &str,
        started_at: DateTime<Utc>,
        duration_seconds: f64,
        drained_until: DateTime<Utc>,
        completion: RunCompletion,
        assumptions: SustainabilityAssumptions,
    ) -> RunRecord {
        RunRecord {
            id,
            config_id: config_id.to_string(),
            started_at,
            finished_at: drained_until,
            duration_seconds,
            completion,
            totals: self.totals,
            abandoned: self.totals.forwards.saturating_sub(self.totals.returns),
            assumptions,
            sustainability: assumptions.equivalents(self.totals.energy_wh),
            by_group: self.by_group.clone(),
            by_router: self.by_router.clone(),
            by_model: self.by_model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_ROUTERS: [&str; 0] = [];

    fn cost(base: f64, commission: f64, energy: f64) -> RequestCost {
        RequestCost {
            base_cost: base,
            commission,
            energy_wh: energy,
        }
    }

    #[test]
    fn forward_updates_all_breakdowns() {
        let mut agg = MetricsAggregator::new();
        agg.add_forward(
            "g1",
            &["r1", "r2"],
            "m1",
            &TokenSample::new(50, 150),
            &cost(0.2, 0.02, 1.5),
        );
        let totals = agg.totals();
        assert_eq!(totals.forwards, 1);
        assert_eq!(totals.total_tokens, 200);
        assert!((totals.commission - 0.02).abs() < 1e-12);
        assert_eq!(agg.by_router().len(), 2);
        for router in agg.by_router().values() {
            assert!((router.commission - 0.01).abs() < 1e-12);
            assert_eq!(router.model_cost, 0.0);
        }
        assert!((agg.by_model()["m1"].energy_wh - 1.5).abs() < 1e-12);
        assert_eq!(agg.by_model()["m1"].commission, 0.0);
        assert!((agg.by_group()["g1"].model_cost - 0.2).abs() < 1e-12);
    }

    #[test]
    fn returns_balance_forwards() {
        let mut agg = MetricsAggregator::new();
        for _ in 0..3 {
            agg.add_forward("g1", &NO_ROUTERS, "m1", &TokenSample::new(1, 1), &cost(0.0, 0.0, 0.0));
        }
        agg.add_return("g1", &NO_ROUTERS, "m1");
        assert_eq!(agg.totals().returns, 1);
        assert!(agg.totals().forwards >= agg.totals().returns);
        agg.add_return("g1", &NO_ROUTERS, "m1");
        agg.add_return("g1", &NO_ROUTERS, "m1");
        assert_eq!(agg.by_group()["g1"].returns, 3);
        assert!(agg.by_router().is_empty());
    }

    #[test]
    fn breakdowns_keep_first_touch_order() {
        let mut agg = MetricsAggregator::new();
        for group in ["g3", "g1", "g2", "g1"] {
            agg.add_forward(group, &NO_ROUTERS, "m", &TokenSample::new(1, 1), &cost(0.0, 0.0, 0.0));
        }
        let order: Vec<_> = agg.by_group().keys().cloned().collect();
        assert_eq!(order, vec!["g3", "g1", "g2"]);
    }

    #[test]
    fn reset_clears_everything() {
        let mut agg = MetricsAggregator::new();
        agg.add_forward("g", &["r"], "m", &TokenSample::new(5, 5), &cost(1.0, 0.1, 2.0));
        agg.record_missing_hops(2);
        agg.record_unrouted();
        agg.reset();
        assert_eq!(agg.totals(), TrafficTotals::default());
        assert!(agg.by_group().is_empty());
        assert!(agg.by_router().is_empty());
        assert!(agg.by_model().is_empty());
    }

    #[test]
    fn finalize_computes_equivalents() {
        let mut agg = MetricsAggregator::new();
        agg.add_forward("g", &NO_ROUTERS, "m", &TokenSample::new(5, 5), &cost(1.0, 0.0, 24.0));
        let started = Utc::now();
        let record = agg.finalize(
            Uuid::new_v4(),
            "cfg",
            started,
            10.0,
            started,
            RunCompletion::Stopped,
            SustainabilityAssumptions::default(),
        );
        assert_eq!(record.config_id(), "cfg");
        assert_eq!(record.abandoned(), 1);
        let eq = record.sustainability();
        assert!((eq.co2e_grams - 9.6).abs() < 1e-9);
        assert!((eq.phone_charges - 2.0).abs() < 1e-9);
        assert!((eq.household_hours - 0.02).abs() < 1e-9);
        // the record is detached from later aggregation
        agg.add_return("g", &NO_ROUTERS, "m");
        assert_eq!(record.totals().returns, 0);
    }

    #[test]
    fn record_serializes_to_json() {
        let agg = MetricsAggregator::new();
        let now = Utc::now();
        let record = agg.finalize(
            Uuid::new_v4(),
            "cfg",
            now,
            1.0,
            now,
            RunCompletion::Drained,
            SustainabilityAssumptions::default(),
        );
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"completion\":\"drained\""));
        let back: RunRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id(), record.id());
    }
}
