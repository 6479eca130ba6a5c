use serde::{Deserialize, Serialize};

use crate::{
    config::{ModelConfig, RouterConfig},
    sampler::TokenSample,
};

/// Cost and energy attributed to one request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct RequestCost {
    /// Model cost in USD.
    pub base_cost: f64,
    /// Router commission in USD, summed over the path.
    pub commission: f64,
    /// Energy in watt-hours.
    pub energy_wh: f64,
}

impl RequestCost {
    /// Model cost plus commission.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.base_cost + self.commission
    }
}

/// Prices a request given its tokens, model, and router path.
pub trait CostModel: Send + Sync {
    /// Computes cost and energy for one request.
    fn evaluate(
        &self,
        tokens: &TokenSample,
        model: &ModelConfig,
        routers: &[&RouterConfig],
    ) -> RequestCost;
}

/// Per-1k-token pricing with a minimum billable size and fee-fraction commission.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCostModel;

impl CostModel for StandardCostModel {
    #[allow(clippy::cast_precision_loss)]
    fn evaluate(
        &self,
        tokens: &TokenSample,
        model: &ModelConfig,
        routers: &[&RouterConfig],
    ) -> RequestCost {
        let billable = tokens.total.max(model.min_billable_tokens.unwrap_or(0));
        let base_cost = billable as f64 / 1000.0 * model.price_per_1k;
        let fee_fraction: f64 = routers.iter().map(|router| router.fee).sum();
        let energy_wh = model.energy.map_or(0.0, |energy| {
            tokens.prompt as f64 / 1000.0 * energy.wh_per_1k_prompt
                + tokens.completion as f64 / 1000.0 * energy.wh_per_1k_completion
        });
        RequestCost {
            base_cost,
            commission: base_cost * fee_fraction,
            energy_wh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{tests::router, EnergyCoefficients};

    fn model() -> ModelConfig {
        ModelConfig {
            id: "m".into(),
            name: String::new(),
            price_per_1k: 1.0,
            min_billable_tokens: None,
            energy: None,
            weight: None,
        }
    }

    #[test]
    fn prices_per_thousand_tokens() {
        let cost = StandardCostModel.evaluate(&TokenSample::new(50, 150), &model(), &[]);
        assert!((cost.base_cost - 0.2).abs() < 1e-12);
        assert_eq!(cost.commission, 0.0);
        assert_eq!(cost.energy_wh, 0.0);
    }

    #[test]
    fn minimum_billable_tokens_apply() {
        let mut m = model();
        m.min_billable_tokens = Some(1_000);
        let cost = StandardCostModel.evaluate(&TokenSample::new(10, 10), &m, &[]);
        assert!((cost.base_cost - 1.0).abs() < 1e-12);
    }

    #[test]
    fn commission_sums_router_fees() {
        let a = router("a", 0, 0.1);
        let b = router("b", 1, 0.05);
        let cost = StandardCostModel.evaluate(&TokenSample::new(500, 500), &model(), &[&a, &b]);
        assert!((cost.commission - 0.15).abs() < 1e-12);
        assert!((cost.total() - 1.15).abs() < 1e-12);
    }

    #[test]
    fn energy_uses_split_coefficients() {
        let mut m = model();
        m.energy = Some(EnergyCoefficients {
            wh_per_1k_prompt: 0.5,
            wh_per_1k_completion: 2.0,
        });
        let cost = StandardCostModel.evaluate(&TokenSample::new(2_000, 1_000), &m, &[]);
        assert!((cost.energy_wh - 3.0).abs() < 1e-12);
    }
}
