use serde::{Deserialize, Serialize};

use crate::rng::FlowRng;

/// Users per group; group rates never count more than this many users.
pub const MAX_GROUP_SIZE: u32 = 10;

const BOUNDED_NORMAL_STD_FACTOR: f64 = 0.3;
const CUSTOM_STD_FACTOR: f64 = 0.5;

/// Distribution family used for token counts and request volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TokenDistribution {
    /// Configured means, no randomness.
    #[default]
    Fixed,
    /// Poisson around the mean.
    Poisson,
    /// Rounded normal around the mean, floored at one token.
    BoundedNormal,
    /// Placeholder for user-defined shapes: a wide bounded normal
    /// (std = 0.5 × mean) for tokens and Poisson for volume.
    Custom,
}

impl TokenDistribution {
    /// Label for logging.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Poisson => "poisson",
            Self::BoundedNormal => "bounded-normal",
            Self::Custom => "custom",
        }
    }
}

/// Named traffic pattern shared by one or more groups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficProfile {
    /// Profile id referenced by groups.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Arrival rate per user in requests per second.
    pub rps_per_user: f64,
    /// Token distribution family.
    #[serde(default)]
    pub distribution: TokenDistribution,
    /// Mean prompt tokens per request.
    pub prompt_tokens: f64,
    /// Mean completion tokens per request.
    pub completion_tokens: f64,
    /// Prompt std for `bounded-normal`; defaults to 0.3 × mean.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_std: Option<f64>,
    /// Completion std for `bounded-normal`; defaults to 0.3 × mean.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_std: Option<f64>,
    /// Completion-to-prompt ratio; when set, re-splits the sampled total.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_completion_ratio: Option<f64>,
}

/// Token counts for one request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TokenSample {
    /// Prompt tokens.
    pub prompt: u64,
    /// Completion tokens.
    pub completion: u64,
    /// Prompt + completion.
    pub total: u64,
}

impl TokenSample {
    /// Builds a sample, computing the total.
    #[must_use]
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn floor_tokens(value: f64) -> u64 {
    let rounded = value.round();
    if rounded.is_finite() && rounded >= 1.0 {
        rounded as u64
    } else {
        1
    }
}

fn normal_tokens(rng: &mut FlowRng, mean: f64, std: f64) -> u64 {
    floor_tokens(rng.normal(mean, std.abs()))
}

/// Re-splits `total` so that `completion / prompt ≈ ratio`, keeping both sides ≥ 1.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn split_by_ratio(total: u64, ratio: f64) -> (u64, u64) {
    let total = total.max(2);
    let prompt = (total as f64 / (1.0 + ratio)).round() as u64;
    let prompt = prompt.clamp(1, total - 1);
    (prompt, total - prompt)
}

/// Samples prompt/completion tokens for one request.
pub fn sample_tokens(profile: &TrafficProfile, rng: &mut FlowRng) -> TokenSample {
    let prompt_mean = profile.prompt_tokens;
    let completion_mean = profile.completion_tokens;
    let (prompt, completion) = match profile.distribution {
        TokenDistribution::Fixed => (floor_tokens(prompt_mean), floor_tokens(completion_mean)),
        TokenDistribution::Poisson => {
            let prompt = rng.poisson(prompt_mean).max(1);
            let completion = rng.poisson(completion_mean).max(1);
            (prompt, completion)
        }
        TokenDistribution::BoundedNormal => {
            let prompt_std = profile
                .prompt_std
                .unwrap_or(prompt_mean * BOUNDED_NORMAL_STD_FACTOR);
            let completion_std = profile
                .completion_std
                .unwrap_or(completion_mean * BOUNDED_NORMAL_STD_FACTOR);
            let prompt = normal_tokens(rng, prompt_mean, prompt_std);
            let completion = normal_tokens(rng, completion_mean, completion_std);
            (prompt, completion)
        }
        TokenDistribution::Custom => {
            let prompt = normal_tokens(rng, prompt_mean, prompt_mean * CUSTOM_STD_FACTOR);
            let completion =
                normal_tokens(rng, completion_mean, completion_mean * CUSTOM_STD_FACTOR);
            (prompt, completion)
        }
    };
    match profile.prompt_completion_ratio {
        Some(ratio) if ratio.is_finite() && ratio > 0.0 => {
            let (prompt, completion) = split_by_ratio(prompt + completion, ratio);
            TokenSample::new(prompt, completion)
        }
        _ => TokenSample::new(prompt, completion),
    }
}

/// Samples how many requests arrive in `dt` seconds at `rate` requests/s.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn sample_requests(
    rate: f64,
    dt: f64,
    distribution: TokenDistribution,
    rng: &mut FlowRng,
) -> u64 {
    let expected = rate * dt;
    let expected = if expected.is_finite() {
        expected.max(0.0)
    } else {
        0.0
    };
    match distribution {
        TokenDistribution::Fixed => expected.floor() as u64,
        TokenDistribution::Poisson | TokenDistribution::Custom => rng.poisson(expected),
        TokenDistribution::BoundedNormal => {
            let draw = rng.normal(expected, expected.sqrt()).round();
            if draw.is_finite() && draw > 0.0 {
                draw as u64
            } else {
                0
            }
        }
    }
}

/// Effective request rate of a group; sizes above ten users are capped.
#[must_use]
pub fn group_rate(group_size: u32, profile_rps: f64) -> f64 {
    f64::from(group_size.min(MAX_GROUP_SIZE)) * profile_rps
}
