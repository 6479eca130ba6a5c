//! Deterministic pseudo-random generation.
//!
//! Every random decision made during a run flows through one [`FlowRng`]
//! seeded from the configuration. The generator is a 32-bit
//! multiply-xor-shift mixer (Mulberry32) so the same seed yields the same
//! stream on every platform, and every derived draw consumes the stream in
//! call order.

use rand::{RngCore, SeedableRng};

const MULBERRY_INCREMENT: u32 = 0x6D2B_79F5;
const TWO_POW_32: f64 = 4_294_967_296.0;
/// Largest mean handed to a single Knuth pass; `exp(-lambda)` stays normal below it.
const POISSON_CHUNK: f64 = 500.0;

/// Seeded generator producing uniform floats and derived distributions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRng {
    seed: u32,
    state: u32,
}

impl FlowRng {
    /// Creates a generator from a 32-bit seed.
    #[must_use]
    pub fn new(seed: u32) -> Self {
        Self { seed, state: seed }
    }

    /// Seed the generator was created with.
    #[must_use]
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Rewinds the stream to its initial seed.
    pub fn reseed(&mut self, seed: u32) {
        self.seed = seed;
        self.state = seed;
    }

    fn mix(&mut self) -> u32 {
        self.state = self.state.wrapping_add(MULBERRY_INCREMENT);
        let mut t = self.state;
        t = (t ^ (t >> 15)).wrapping_mul(t | 1);
        t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
        t ^ (t >> 14)
    }

    /// Uniform float in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        f64::from(self.mix()) / TWO_POW_32
    }

    /// Uniform float in `[min, max)`.
    pub fn range(&mut self, min: f64, max: f64) -> f64 {
        min + self.next_f64() * (max - min)
    }

    /// Uniform integer in `[min, max]`, both ends inclusive.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn int_range(&mut self, min: i64, max: i64) -> i64 {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        let span = (i128::from(hi) - i128::from(lo) + 1) as f64;
        let offset = (self.next_f64() * span).floor() as i128;
        i64::try_from(i128::from(lo) + offset).map_or(hi, |value| value.min(hi))
    }

    /// Uniform pick. An empty slice yields `None` without consuming a draw.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn choice<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let idx = (self.next_f64() * items.len() as f64).floor() as usize;
        items.get(idx.min(items.len() - 1))
    }

    /// Index picked by cumulative weight.
    ///
    /// Returns the first index whose cumulative weight exceeds the draw. When
    /// the weights sum to zero (or are all invalid) the last index is
    /// returned. Exactly one draw is consumed for a non-empty slice.
    pub fn weighted_index(&mut self, weights: &[f64]) -> Option<usize> {
        if weights.is_empty() {
            return None;
        }
        let sanitized = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
        let total: f64 = weights.iter().copied().map(sanitized).sum();
        let draw = self.next_f64() * total;
        let mut cumulative = 0.0;
        for (idx, weight) in weights.iter().copied().map(sanitized).enumerate() {
            cumulative += weight;
            if draw < cumulative {
                return Some(idx);
            }
        }
        Some(weights.len() - 1)
    }

    /// Item picked by cumulative weight; see [`Self::weighted_index`].
    ///
    /// Missing weights (a shorter `weights` slice) count as zero.
    pub fn weighted<'a, T>(&mut self, items: &'a [T], weights: &[f64]) -> Option<&'a T> {
        let aligned: Vec<f64> = (0..items.len())
            .map(|idx| weights.get(idx).copied().unwrap_or(0.0))
            .collect();
        self.weighted_index(&aligned).and_then(|idx| items.get(idx))
    }

    /// Poisson draw using Knuth's multiplicative method.
    ///
    /// Means above 500 are split into chunks of at most 500 and the chunk
    /// draws summed, so large means never underflow the Knuth limit.
    /// Non-finite or negative `lambda` is treated as zero.
    pub fn poisson(&mut self, lambda: f64) -> u64 {
        let mut remaining = if lambda.is_finite() { lambda.max(0.0) } else { 0.0 };
        let mut count = 0_u64;
        while remaining > POISSON_CHUNK {
            count += self.knuth(POISSON_CHUNK);
            remaining -= POISSON_CHUNK;
        }
        count + self.knuth(remaining)
    }

    fn knuth(&mut self, lambda: f64) -> u64 {
        let limit = (-lambda).exp();
        let mut count = 0_u64;
        let mut product = 1.0;
        loop {
            product *= self.next_f64();
            if product <= limit {
                return count;
            }
            count += 1;
        }
    }

    /// Normal draw via Box-Muller, consuming exactly two uniforms.
    pub fn normal(&mut self, mean: f64, std: f64) -> f64 {
        let u1 = self.next_f64().max(f64::MIN_POSITIVE);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
        mean + std * z
    }
}

impl RngCore for FlowRng {
    fn next_u32(&mut self) -> u32 {
        self.mix()
    }

    fn next_u64(&mut self) -> u64 {
        let low = u64::from(self.mix());
        let high = u64::from(self.mix());
        (high << 32) | low
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let bytes = self.mix().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for FlowRng {
    type Seed = [u8; 4];

    fn from_seed(seed: Self::Seed) -> Self {
        Self::new(u32::from_le_bytes(seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn same_seed_same_stream() {
        let mut a = FlowRng::new(42);
        let mut b = FlowRng::new(42);
        for _ in 0..1_000 {
            assert_eq!(a.next_f64().to_bits(), b.next_f64().to_bits());
        }
        let mut c = FlowRng::new(43);
        let first: Vec<u32> = (0..8).map(|_| a.next_u32()).collect();
        let other: Vec<u32> = (0..8).map(|_| c.next_u32()).collect();
        assert_ne!(first, other);
    }

    #[test]
    fn uniform_stays_in_unit_interval() {
        let mut rng = FlowRng::new(7);
        for _ in 0..10_000 {
            let x = rng.next_f64();
            assert!((0.0..1.0).contains(&x));
        }
    }

    #[test]
    fn reseed_rewinds_stream() {
        let mut rng = FlowRng::new(9);
        let first: Vec<u64> = (0..4).map(|_| rng.next_f64().to_bits()).collect();
        rng.reseed(9);
        let again: Vec<u64> = (0..4).map(|_| rng.next_f64().to_bits()).collect();
        assert_eq!(first, again);
    }

    #[test]
    fn int_range_is_inclusive() {
        let mut rng = FlowRng::new(3);
        let mut seen = [false; 3];
        for _ in 0..500 {
            let v = rng.int_range(1, 3);
            assert!((1..=3).contains(&v));
            seen[(v - 1) as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn choice_on_empty_does_not_consume() {
        let mut rng = FlowRng::new(11);
        let mut twin = rng.clone();
        let empty: [u8; 0] = [];
        assert!(rng.choice(&empty).is_none());
        assert_eq!(rng.next_f64().to_bits(), twin.next_f64().to_bits());
    }

    #[test]
    fn weighted_zero_total_falls_back_to_last() {
        let mut rng = FlowRng::new(5);
        let items = ["a", "b", "c"];
        for _ in 0..20 {
            assert_eq!(rng.weighted(&items, &[0.0, 0.0, 0.0]), Some(&"c"));
        }
    }

    #[test]
    fn weighted_skips_zero_weight_entries() {
        let mut rng = FlowRng::new(5);
        for _ in 0..1_000 {
            assert_eq!(rng.weighted_index(&[0.0, 2.0, 0.0]), Some(1));
        }
    }

    #[test]
    fn weighted_converges_to_ratio() {
        let mut rng = FlowRng::new(2024);
        let mut counts = [0_u32; 2];
        for _ in 0..10_000 {
            let idx = rng.weighted_index(&[3.0, 1.0]).unwrap();
            counts[idx] += 1;
        }
        let ratio = f64::from(counts[0]) / f64::from(counts[1]);
        assert!((2.6..3.4).contains(&ratio), "ratio {ratio}");
    }

    #[test]
    fn poisson_mean_is_close_to_lambda() {
        let mut rng = FlowRng::new(99);
        let draws = 20_000;
        let sum: u64 = (0..draws).map(|_| rng.poisson(4.0)).sum();
        let mean = sum as f64 / f64::from(draws);
        assert!((mean - 4.0).abs() < 0.15, "mean {mean}");
    }

    #[test]
    fn poisson_mean_holds_for_large_lambda() {
        let mut rng = FlowRng::new(42);
        let draws = 2_000;
        let sum: u64 = (0..draws).map(|_| rng.poisson(1_800.0)).sum();
        let mean = sum as f64 / f64::from(draws);
        assert!((mean - 1_800.0).abs() < 36.0, "mean {mean}");
    }

    #[test]
    fn poisson_large_lambda_is_reproducible() {
        let mut a = FlowRng::new(8);
        let mut b = FlowRng::new(8);
        for _ in 0..50 {
            assert_eq!(a.poisson(1_234.5), b.poisson(1_234.5));
        }
        assert_eq!(a, b);
    }

    #[test]
    fn int_range_handles_full_i64_span() {
        let mut rng = FlowRng::new(21);
        for _ in 0..1_000 {
            let v = rng.int_range(i64::MIN, i64::MAX);
            assert!((i64::MIN..=i64::MAX).contains(&v));
        }
        for _ in 0..100 {
            assert_eq!(rng.int_range(i64::MAX, i64::MAX), i64::MAX);
            assert_eq!(rng.int_range(i64::MIN, i64::MIN), i64::MIN);
        }
    }

    #[test]
    fn poisson_clamps_bad_lambda() {
        let mut rng = FlowRng::new(1);
        assert_eq!(rng.poisson(f64::NAN), 0);
        assert_eq!(rng.poisson(-3.0), 0);
        assert_eq!(rng.poisson(0.0), 0);
    }

    #[test]
    fn normal_consumes_two_draws() {
        let mut rng = FlowRng::new(17);
        let mut twin = rng.clone();
        let _ = rng.normal(0.0, 1.0);
        twin.next_f64();
        twin.next_f64();
        assert_eq!(rng, twin);
    }

    #[test]
    fn normal_moments_are_sane() {
        let mut rng = FlowRng::new(123);
        let samples: Vec<f64> = (0..20_000).map(|_| rng.normal(10.0, 2.0)).collect();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / samples.len() as f64;
        assert!((mean - 10.0).abs() < 0.1, "mean {mean}");
        assert!((var.sqrt() - 2.0).abs() < 0.1, "std {}", var.sqrt());
        assert!(samples.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn works_with_rand_traits() {
        let mut rng = FlowRng::from_seed(42_u32.to_le_bytes());
        assert_eq!(rng.seed(), 42);
        let value: u8 = rng.gen_range(0..10);
        assert!(value < 10);
        let mut buf = [0_u8; 7];
        rng.fill_bytes(&mut buf);
    }
}
