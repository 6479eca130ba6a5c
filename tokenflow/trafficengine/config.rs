use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    helper::random_seed,
    sampler::{TrafficProfile, MAX_GROUP_SIZE},
};

/// Snapshot of everything a run needs. Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationConfig {
    /// Configuration id, copied into run records.
    #[serde(default = "default_config_id")]
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// PRNG seed. A random seed is drawn when omitted.
    #[serde(default = "random_seed")]
    pub seed: u32,
    /// Spawning window in seconds.
    pub duration_seconds: f64,
    /// Ceiling on simultaneously in-flight signals.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Signal speed in px/s.
    #[serde(default = "default_signal_speed")]
    pub signal_speed: f64,
    /// When set and `groups` is empty, groups of ten users are derived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_users: Option<u32>,
    /// Profile assigned to derived groups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,
    /// Layout canvas.
    #[serde(default)]
    pub canvas: CanvasSize,
    /// User groups.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    /// Traffic profiles.
    #[serde(default)]
    pub profiles: Vec<TrafficProfile>,
    /// Routers across all layers.
    #[serde(default)]
    pub routers: Vec<RouterConfig>,
    /// Backend models.
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    /// Factors used to translate energy into everyday equivalents.
    #[serde(default)]
    pub sustainability: SustainabilityAssumptions,
}

/// Cluster of at most ten users sharing one profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupConfig {
    /// Group id.
    pub id: String,
    /// Users in the group. Rates count at most ten.
    pub size: u32,
    /// Profile id.
    pub profile: String,
}

/// Router in one layer of the routing topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    /// Router id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Layer index, 0 being closest to users.
    pub layer: usize,
    /// Commission as a fraction of the model cost.
    #[serde(default)]
    pub fee: f64,
    /// Disabled routers receive no traffic and get no graph node.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Backend model with pricing and optional energy data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Model id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// USD per 1,000 tokens.
    pub price_per_1k: f64,
    /// Requests are billed for at least this many tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_billable_tokens: Option<u64>,
    /// Energy coefficients; requests consume no energy when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<EnergyCoefficients>,
    /// Selection weight; 1 when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl ModelConfig {
    /// Weight used for model selection.
    #[must_use]
    pub fn selection_weight(&self) -> f64 {
        self.weight.unwrap_or(1.0)
    }
}

/// Watt-hours per 1,000 tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct EnergyCoefficients {
    /// Wh per 1k prompt tokens.
    #[serde(default)]
    pub wh_per_1k_prompt: f64,
    /// Wh per 1k completion tokens.
    #[serde(default)]
    pub wh_per_1k_completion: f64,
}

/// Layout canvas size in px.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CanvasSize {
    /// Width.
    pub width: f64,
    /// Height.
    pub height: f64,
}

impl Default for CanvasSize {
    fn default() -> Self {
        Self {
            width: 1200.0,
            height: 800.0,
        }
    }
}

/// Conversion factors for sustainability equivalents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SustainabilityAssumptions {
    /// Grid carbon intensity in gCO2e per kWh.
    #[serde(default = "default_grid_intensity")]
    pub grid_g_co2e_per_kwh: f64,
    /// Energy of one smartphone charge in Wh.
    #[serde(default = "default_phone_charge_wh")]
    pub phone_charge_wh: f64,
    /// Average household draw in kW.
    #[serde(default = "default_household_kw")]
    pub household_kw: f64,
}

impl Default for SustainabilityAssumptions {
    fn default() -> Self {
        Self {
            grid_g_co2e_per_kwh: default_grid_intensity(),
            phone_charge_wh: default_phone_charge_wh(),
            household_kw: default_household_kw(),
        }
    }
}

fn default_config_id() -> String {
    "default".into()
}

const fn default_max_concurrent() -> usize {
    48
}

const fn default_signal_speed() -> f64 {
    240.0
}

const fn default_true() -> bool {
    true
}

const fn default_grid_intensity() -> f64 {
    400.0
}

const fn default_phone_charge_wh() -> f64 {
    12.0
}

const fn default_household_kw() -> f64 {
    1.2
}

fn check(
    kind: &'static str,
    id: &str,
    field: &'static str,
    value: f64,
    ok: bool,
) -> Result<(), ConfigError> {
    if value.is_finite() && ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            kind,
            id: id.to_string(),
            field,
            value,
        })
    }
}

fn unique<'a>(kind: &'static str, ids: impl Iterator<Item = &'a str>) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ConfigError::DuplicateId {
                kind,
                id: id.to_string(),
            });
        }
    }
    Ok(())
}

impl SimulationConfig {
    /// Loads a configuration file: JSON when the extension is `.json`, TOML otherwise.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading simulation config {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_toml_str(&raw)
        };
        config.with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses, normalizes, and validates a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("decoding TOML configuration")?;
        config.prepared()
    }

    /// Parses, normalizes, and validates a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).context("decoding JSON configuration")?;
        config.prepared()
    }

    fn prepared(mut self) -> Result<Self> {
        self.normalize();
        self.validate()?;
        Ok(self)
    }

    /// Derives groups from `total_users` when no explicit groups are given.
    pub fn normalize(&mut self) {
        if !self.groups.is_empty() {
            return;
        }
        if let (Some(total), Some(profile)) = (self.total_users, self.default_profile.clone()) {
            self.groups = chunk_users(total, &profile);
        }
    }

    /// Rejects configurations the engine cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.duration_seconds.is_finite() && self.duration_seconds > 0.0) {
            return Err(ConfigError::InvalidDuration(self.duration_seconds));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if !(self.signal_speed.is_finite() && self.signal_speed > 0.0) {
            return Err(ConfigError::InvalidSignalSpeed(self.signal_speed));
        }
        let CanvasSize { width, height } = self.canvas;
        if !(width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0) {
            return Err(ConfigError::InvalidCanvas { width, height });
        }
        if self.groups.is_empty() && self.total_users.is_some() && self.default_profile.is_none() {
            return Err(ConfigError::MissingDefaultProfile);
        }
        if self.models.is_empty() {
            return Err(ConfigError::NoModels);
        }
        unique("group", self.groups.iter().map(|g| g.id.as_str()))?;
        unique("profile", self.profiles.iter().map(|p| p.id.as_str()))?;
        unique("router", self.routers.iter().map(|r| r.id.as_str()))?;
        unique("model", self.models.iter().map(|m| m.id.as_str()))?;

        for profile in &self.profiles {
            let id = profile.id.as_str();
            check(
                "profile",
                id,
                "rps_per_user",
                profile.rps_per_user,
                profile.rps_per_user >= 0.0,
            )?;
            check(
                "profile",
                id,
                "prompt_tokens",
                profile.prompt_tokens,
                profile.prompt_tokens >= 0.0,
            )?;
            check(
                "profile",
                id,
                "completion_tokens",
                profile.completion_tokens,
                profile.completion_tokens >= 0.0,
            )?;
            for (field, value) in [
                ("prompt_std", profile.prompt_std),
                ("completion_std", profile.completion_std),
            ] {
                if let Some(value) = value {
                    check("profile", id, field, value, value >= 0.0)?;
                }
            }
            if let Some(ratio) = profile.prompt_completion_ratio {
                check("profile", id, "prompt_completion_ratio", ratio, ratio > 0.0)?;
            }
        }
        for group in &self.groups {
            if group.size == 0 {
                return Err(ConfigError::EmptyGroup(group.id.clone()));
            }
            if self.profile(&group.profile).is_none() {
                return Err(ConfigError::UnknownProfile {
                    group: group.id.clone(),
                    profile: group.profile.clone(),
                });
            }
        }
        for router in &self.routers {
            check("router", &router.id, "fee", router.fee, (0.0..=1.0).contains(&router.fee))?;
        }
        for model in &self.models {
            let id = model.id.as_str();
            check("model", id, "price_per_1k", model.price_per_1k, model.price_per_1k >= 0.0)?;
            if let Some(weight) = model.weight {
                check("model", id, "weight", weight, weight >= 0.0)?;
            }
            if let Some(energy) = model.energy {
                check(
                    "model",
                    id,
                    "wh_per_1k_prompt",
                    energy.wh_per_1k_prompt,
                    energy.wh_per_1k_prompt >= 0.0,
                )?;
                check(
                    "model",
                    id,
                    "wh_per_1k_completion",
                    energy.wh_per_1k_completion,
                    energy.wh_per_1k_completion >= 0.0,
                )?;
            }
        }
        Ok(())
    }

    /// Looks up a profile by id.
    #[must_use]
    pub fn profile(&self, id: &str) -> Option<&TrafficProfile> {
        self.profiles.iter().find(|profile| profile.id == id)
    }

    /// Indices into `routers` of enabled routers, one inner list per layer.
    ///
    /// Layers are ordered by index. Layers without an enabled router are
    /// skipped, so the result is always contiguous.
    #[must_use]
    pub fn enabled_layers(&self) -> Vec<Vec<usize>> {
        let mut layers: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (idx, router) in self.routers.iter().enumerate() {
            if router.enabled {
                layers.entry(router.layer).or_default().push(idx);
            }
        }
        layers.into_values().collect()
    }

    /// Total users across all groups, as configured.
    #[must_use]
    pub fn user_count(&self) -> u64 {
        self.groups.iter().map(|group| u64::from(group.size)).sum()
    }
}

/// Splits `total_users` into groups of at most ten users.
#[must_use]
pub fn chunk_users(total_users: u32, profile: &str) -> Vec<GroupConfig> {
    let mut groups = Vec::new();
    let mut remaining = total_users;
    while remaining > 0 {
        let size = remaining.min(MAX_GROUP_SIZE);
        groups.push(GroupConfig {
            id: format!("group-{}", groups.len() + 1),
            size,
            profile: profile.to_string(),
        });
        remaining -= size;
    }
    groups
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sampler::TokenDistribution;
    use tempfile::tempdir;

    pub(crate) fn scenario_config() -> SimulationConfig {
        SimulationConfig {
            id: "scenario".into(),
            name: "single group".into(),
            seed: 42,
            duration_seconds: 10.0,
            max_concurrent: 48,
            signal_speed: 240.0,
            total_users: None,
            default_profile: None,
            canvas: CanvasSize::default(),
            groups: vec![GroupConfig {
                id: "g1".into(),
                size: 5,
                profile: "steady".into(),
            }],
            profiles: vec![TrafficProfile {
                id: "steady".into(),
                name: "Steady".into(),
                rps_per_user: 0.1,
                distribution: TokenDistribution::Fixed,
                prompt_tokens: 50.0,
                completion_tokens: 150.0,
                prompt_std: None,
                completion_std: None,
                prompt_completion_ratio: None,
            }],
            routers: Vec::new(),
            models: vec![ModelConfig {
                id: "m1".into(),
                name: "Model One".into(),
                price_per_1k: 1.0,
                min_billable_tokens: None,
                energy: None,
                weight: None,
            }],
            sustainability: SustainabilityAssumptions::default(),
        }
    }

    pub(crate) fn router(id: &str, layer: usize, fee: f64) -> RouterConfig {
        RouterConfig {
            id: id.into(),
            name: id.to_uppercase(),
            layer,
            fee,
            enabled: true,
        }
    }

    const SAMPLE_TOML: &str = r#"
id = "baseline"
seed = 7
duration_seconds = 30.0
total_users = 25
default_profile = "chat"

[[profiles]]
id = "chat"
rps_per_user = 0.2
distribution = "poisson"
prompt_tokens = 300.0
completion_tokens = 500.0

[[routers]]
id = "edge-a"
layer = 0
fee = 0.02

[[routers]]
id = "core"
layer = 1
fee = 0.05
enabled = false

[[models]]
id = "small"
price_per_1k = 0.5
weight = 3.0

[[models]]
id = "large"
price_per_1k = 4.0
energy = { wh_per_1k_prompt = 0.3, wh_per_1k_completion = 0.9 }
"#;

    #[test]
    fn scenario_config_is_valid() {
        scenario_config().validate().unwrap();
    }

    #[test]
    fn toml_applies_defaults_and_derives_groups() {
        let config = SimulationConfig::from_toml_str(SAMPLE_TOML).unwrap();
        assert_eq!(config.max_concurrent, 48);
        assert_eq!(config.seed, 7);
        assert_eq!(config.groups.len(), 3);
        assert_eq!(
            config.groups.iter().map(|g| g.size).collect::<Vec<_>>(),
            vec![10, 10, 5]
        );
        assert_eq!(config.user_count(), 25);
        assert!(!config.routers[1].enabled);
        assert_eq!(config.enabled_layers(), vec![vec![0]]);
        assert_eq!(config.models[1].selection_weight(), 1.0);
    }

    #[test]
    fn load_reads_json_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scenario.json");
        fs::write(&path, serde_json::to_string(&scenario_config()).unwrap()).unwrap();
        let loaded = SimulationConfig::load(&path).unwrap();
        assert_eq!(loaded, scenario_config());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = SimulationConfig::load("/nonexistent/tokenflow.toml").unwrap_err();
        assert!(err.to_string().contains("reading simulation config"));
    }

    #[test]
    fn enabled_layers_skip_empty_layers() {
        let mut config = scenario_config();
        config.routers = vec![
            router("b", 2, 0.0),
            router("a", 0, 0.0),
            router("c", 2, 0.0),
        ];
        assert_eq!(config.enabled_layers(), vec![vec![1], vec![0, 2]]);
    }

    #[test]
    fn rejects_bad_numbers() {
        let mut config = scenario_config();
        config.duration_seconds = -1.0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidDuration(-1.0)));

        let mut config = scenario_config();
        config.profiles[0].rps_per_user = f64::NAN;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "rps_per_user", .. })
        ));

        let mut config = scenario_config();
        config.routers.push(router("r", 0, 1.5));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "fee", .. })
        ));
    }

    #[test]
    fn rejects_structural_problems() {
        let mut config = scenario_config();
        config.models.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoModels));

        let mut config = scenario_config();
        config.groups[0].profile = "missing".into();
        assert!(matches!(config.validate(), Err(ConfigError::UnknownProfile { .. })));

        let mut config = scenario_config();
        config.groups.push(config.groups[0].clone());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateId { kind: "group", .. })
        ));

        let mut config = scenario_config();
        config.max_concurrent = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroConcurrency));

        let mut config = scenario_config();
        config.groups.clear();
        config.total_users = Some(12);
        assert_eq!(config.validate(), Err(ConfigError::MissingDefaultProfile));
    }

    #[test]
    fn chunking_handles_exact_multiples() {
        assert_eq!(chunk_users(20, "p").len(), 2);
        assert!(chunk_users(0, "p").is_empty());
        assert_eq!(chunk_users(11, "p")[1].size, 1);
    }
}
