use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Standard-normal draws laid out year-major: `values[year * trials + trial]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShockMatrix {
    years: usize,
    trials: usize,
    values: Vec<f64>,
}

impl ShockMatrix {
    pub fn from_values(years: usize, trials: usize, values: Vec<f64>) -> Self {
        assert_eq!(
            values.len(),
            years * trials,
            "shock matrix needs years * trials values"
        );
        Self {
            years,
            trials,
            values,
        }
    }

    pub fn years(&self) -> usize {
        self.years
    }

    pub fn trials(&self) -> usize {
        self.trials
    }

    pub fn row(&self, year: usize) -> &[f64] {
        let start = year * self.trials;
        &self.values[start..start + self.trials]
    }
}

/// A reproducible stream of standard-normal shocks.
///
/// Implementations are seeded at construction; the engine only asks for a
/// matrix of a given shape and never inspects the generator itself.
pub trait ShockSource {
    fn standard_normal(&mut self) -> f64;

    fn standard_normal_matrix(&mut self, years: usize, trials: usize) -> ShockMatrix {
        let mut values = Vec::with_capacity(years * trials);
        for _ in 0..years * trials {
            values.push(self.standard_normal());
        }
        ShockMatrix::from_values(years, trials, values)
    }
}

/// `StdRng` with `rand_distr`'s ziggurat standard normal.
pub struct StdNormalShocks {
    rng: StdRng,
}

impl StdNormalShocks {
    pub fn from_seed(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { rng }
    }
}

impl ShockSource for StdNormalShocks {
    fn standard_normal(&mut self) -> f64 {
        self.rng.sample(StandardNormal)
    }

    fn standard_normal_matrix(&mut self, years: usize, trials: usize) -> ShockMatrix {
        let values: Vec<f64> = (&mut self.rng)
            .sample_iter(StandardNormal)
            .take(years * trials)
            .collect();
        ShockMatrix::from_values(years, trials, values)
    }
}

/// xorshift64* uniforms turned into normals by Box-Muller, caching the second
/// value of each pair. The seed is scrambled through splitmix64 so nearby
/// seeds start from unrelated states; seed 0 maps to a fixed non-zero state
/// because xorshift never leaves the all-zero state.
///
/// Use it where a stream must be reproducible without depending on `rand`'s
/// `StdRng` algorithm, which may change between `rand` releases, or to
/// cross-check engine results against a second generator.
pub struct XorShiftShocks {
    state: u64,
    cached_normal: Option<f64>,
}

impl XorShiftShocks {
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 {
            0xA5A5_A5A5_A5A5_A5A5
        } else {
            splitmix64(seed)
        };
        Self {
            state,
            cached_normal: None,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    fn next_f64(&mut self) -> f64 {
        const DENOM: f64 = (1_u64 << 53) as f64;
        let v = self.next_u64() >> 11;
        ((v as f64) + 0.5) / DENOM
    }
}

impl ShockSource for XorShiftShocks {
    fn standard_normal(&mut self) -> f64 {
        if let Some(z) = self.cached_normal.take() {
            return z;
        }

        let u1 = self.next_f64().max(1e-12);
        let u2 = self.next_f64();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * PI * u2;

        let z0 = r * theta.cos();
        let z1 = r * theta.sin();
        self.cached_normal = Some(z1);
        z0
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
