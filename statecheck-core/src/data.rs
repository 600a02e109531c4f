//! Core data types shared by the generators and the state machine engines.

use crate::error::{Result, StateError};
use std::fmt;

/// Size parameter for controlling test data generation.
///
/// Size ranges from 0 to the configured size limit (100 by default). Larger
/// sizes produce longer command sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size(pub usize);

impl Size {
    /// Get the inner size value.
    pub fn get(&self) -> usize {
        self.0
    }

    /// Size for the `test_num`th of `test_limit` trials, growing linearly
    /// up to `size_limit`.
    pub fn for_trial(test_num: usize, test_limit: usize, size_limit: usize) -> Self {
        if test_limit == 0 {
            return Size(0);
        }
        Size((test_num * size_limit) / test_limit)
    }
}

impl From<usize> for Size {
    fn from(value: usize) -> Self {
        Size(value)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Size({})", self.0)
    }
}

/// Splittable random seed for deterministic test generation.
///
/// Seeds can be split to create independent random streams, so a plan is a
/// pure function of the seed it was generated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seed(pub u64, pub u64);

impl Seed {
    /// Create a new seed from a single value.
    pub fn from_u64(value: u64) -> Self {
        let state = splitmix64_mix(value);
        let gamma = mix_gamma(state);
        Seed(state, gamma)
    }

    /// Split a seed into two independent seeds.
    /// Uses SplitMix64 splitting strategy for independence.
    pub fn split(self) -> (Self, Self) {
        let Seed(state, gamma) = self;
        let new_state = state.wrapping_add(gamma);
        let output = splitmix64_mix(new_state);
        let new_gamma = mix_gamma(output);

        (Seed(new_state, gamma), Seed(output, new_gamma))
    }

    /// Generate the next random value and advance the seed.
    pub fn next_u64(self) -> (u64, Self) {
        let Seed(state, gamma) = self;
        let new_state = state.wrapping_add(gamma);
        let output = splitmix64_mix(new_state);
        (output, Seed(new_state, gamma))
    }

    /// Generate a bounded random value [0, bound).
    pub fn next_bounded(self, bound: u64) -> (u64, Self) {
        let (value, new_seed) = self.next_u64();
        (((value as u128 * bound as u128) >> 64) as u64, new_seed)
    }

    /// Generate a random bool.
    pub fn next_bool(self) -> (bool, Self) {
        let (value, new_seed) = self.next_u64();
        (value & 1 == 1, new_seed)
    }

    /// Generate a random seed.
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        Seed(rng.gen(), rng.gen::<u64>() | 1)
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seed({}, {})", self.0, self.1)
    }
}

/// A closed range of lengths, `min..=max`.
///
/// The upper bound a trial may reach grows with its [`Size`]: small sizes
/// stay near `min`, the size limit unlocks the full range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub min: usize,
    pub max: usize,
}

impl Range {
    pub fn new(min: usize, max: usize) -> Self {
        Range { min, max }
    }

    /// A range containing exactly one length.
    pub fn singleton(value: usize) -> Self {
        Range {
            min: value,
            max: value,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min > self.max {
            return Err(StateError::InvalidRange {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    /// Upper bound available at `size` when sizes run up to `size_limit`.
    pub fn upper_at(&self, size: Size, size_limit: usize) -> usize {
        if size_limit == 0 || size.get() >= size_limit {
            return self.max;
        }
        let span = self.max.saturating_sub(self.min);
        self.min + (span * size.get()).div_ceil(size_limit)
    }

    /// Sample a length within the range, scaled by `size`.
    pub fn sample(&self, size: Size, size_limit: usize, seed: Seed) -> usize {
        let upper = self.upper_at(size, size_limit);
        let (offset, _) = seed.next_bounded((upper.saturating_sub(self.min) + 1) as u64);
        self.min + offset as usize
    }

    pub fn contains(&self, value: usize) -> bool {
        self.min <= value && value <= self.max
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.min, self.max)
    }
}

/// Configuration for state machine testing.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of trials to run.
    pub test_limit: usize,

    /// Maximum number of accepted shrinks.
    pub shrink_limit: usize,

    /// Maximum size parameter to use.
    pub size_limit: usize,

    /// Maximum number of vetoed inputs per planned step.
    pub discard_limit: usize,

    /// Fixed seed for reproducible runs.
    pub seed: Option<Seed>,

    /// Re-executions granted to each parallel shrink candidate.
    pub shrink_repeats: usize,

    /// Cap on the combined length of all parallel branches.
    pub max_branch_steps: usize,

    /// Threads the sequential driver spreads trials over.
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            test_limit: 100,
            shrink_limit: 1000,
            size_limit: 100,
            discard_limit: 100,
            seed: None,
            shrink_repeats: 4,
            max_branch_steps: 12,
            workers: 1,
        }
    }
}

impl Config {
    /// Create a new config with the given number of tests.
    pub fn with_tests(mut self, tests: usize) -> Self {
        self.test_limit = tests;
        self
    }

    /// Create a new config with the given shrink limit.
    pub fn with_shrinks(mut self, shrinks: usize) -> Self {
        self.shrink_limit = shrinks;
        self
    }

    /// Create a new config with the given size limit.
    pub fn with_size_limit(mut self, size: usize) -> Self {
        self.size_limit = size;
        self
    }

    pub fn with_discard_limit(mut self, discards: usize) -> Self {
        self.discard_limit = discards;
        self
    }

    pub fn with_seed(mut self, seed: Seed) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_shrink_repeats(mut self, repeats: usize) -> Self {
        self.shrink_repeats = repeats;
        self
    }

    pub fn with_max_branch_steps(mut self, steps: usize) -> Self {
        self.max_branch_steps = steps;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// The seed this run starts from.
    pub fn initial_seed(&self) -> Seed {
        self.seed.unwrap_or_else(Seed::random)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(StateError::InvalidConfig {
                message: "workers must be at least 1".to_string(),
            });
        }
        if self.shrink_repeats == 0 {
            return Err(StateError::InvalidConfig {
                message: "shrink_repeats must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// SplitMix64 mixing function for high-quality output.
fn splitmix64_mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

/// Generate a good gamma value for SplitMix64 splitting.
fn mix_gamma(mut z: u64) -> u64 {
    z = splitmix64_mix(z);
    // Ensure gamma is odd for maximal period
    (z | 1).wrapping_mul(0x9e3779b97f4a7c15)
}
