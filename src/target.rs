//! Targets, node identity, and exact concentration arithmetic.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{PlanError, PlanResult};

/// One mixture to prepare: an integer ratio over the shared reagent set and
/// the mixer factor for every tree level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub ratio: Vec<u64>,
    pub factors: Vec<u64>,
}

impl Target {
    pub fn new(name: impl Into<String>, ratio: Vec<u64>, factors: Vec<u64>) -> Self {
        Self {
            name: name.into(),
            ratio,
            factors,
        }
    }

    pub fn ratio_sum(&self) -> u64 {
        self.ratio.iter().sum()
    }

    /// Check the factorization invariant: positive ratio entries, factors in
    /// `2..=max_mixer_size`, and `product(factors) == sum(ratio)`.
    ///
    /// Factors of 1 are rejected: a one-input mixer is a no-op level, and
    /// `find_factors_for_sum` never produces one.
    pub fn validate(&self, max_mixer_size: u64) -> PlanResult<()> {
        let fail = |reason: String| PlanError::InvalidFactorization {
            target: self.name.clone(),
            reason,
        };

        if self.ratio.is_empty() {
            return Err(fail("ratio vector is empty".into()));
        }
        if let Some(pos) = self.ratio.iter().position(|&r| r == 0) {
            return Err(fail(format!("ratio entry {pos} is zero")));
        }
        if self.factors.is_empty() {
            return Err(fail("factor sequence is empty".into()));
        }
        for &f in &self.factors {
            if f < 2 || f > max_mixer_size {
                return Err(fail(format!(
                    "factor {f} outside mixer range 2..={max_mixer_size}"
                )));
            }
        }

        let product: u64 = self.factors.iter().product();
        let sum = self.ratio_sum();
        if product != sum {
            return Err(fail(format!(
                "factor product {product} does not equal ratio sum {sum}"
            )));
        }
        Ok(())
    }
}

/// Stable identity of a mixing node: target index, tree level, index in level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub target: usize,
    pub level: usize,
    pub index: usize,
}

impl NodeId {
    pub fn new(target: usize, level: usize, index: usize) -> Self {
        Self {
            target,
            level,
            index,
        }
    }

    pub fn is_root(&self) -> bool {
        self.level == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mixer_t{}_l{}_k{}", self.target, self.level, self.index)
    }
}

/// Exact concentration value of a node: `allocation / ratio_sum`, kept in
/// reduced form so equality and ordering work across targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Concentration {
    num: u64,
    den: u64,
}

impl Concentration {
    pub fn new(allocation: u64, ratio_sum: u64) -> Self {
        debug_assert!(allocation > 0 && ratio_sum > 0);
        let g = gcd(allocation, ratio_sum);
        Self {
            num: allocation / g,
            den: ratio_sum / g,
        }
    }

    /// Integer quotient `self / other`, if the division is exact.
    pub fn div_exact(&self, other: &Concentration) -> Option<u64> {
        // (n1/d1) / (n2/d2) = (n1 * d2) / (d1 * n2)
        let num = self.num.checked_mul(other.den)?;
        let den = self.den.checked_mul(other.num)?;
        (den != 0 && num % den == 0).then(|| num / den)
    }
}

impl fmt::Display for Concentration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

pub(crate) fn gcd(a: u64, b: u64) -> u64 {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Greedy factorization of a ratio sum into mixer factors, largest divisor
/// first. Returns `None` when some remainder has no divisor in
/// `2..=max_mixer_size`.
pub fn find_factors_for_sum(sum: u64, max_mixer_size: u64) -> Option<Vec<u64>> {
    if sum < 2 {
        return None;
    }
    let mut remaining = sum;
    let mut factors = Vec::new();
    while remaining > 1 {
        let f = (2..=max_mixer_size.min(remaining))
            .rev()
            .find(|f| remaining % f == 0)?;
        factors.push(f);
        remaining /= f;
    }
    Some(factors)
}

/// All distinct orderings of a factor sequence, sorted for determinism.
pub fn unique_permutations(factors: &[u64]) -> Vec<Vec<u64>> {
    use itertools::Itertools;

    let len = factors.len();
    let mut perms: Vec<Vec<u64>> = factors.iter().copied().permutations(len).collect();
    perms.sort();
    perms.dedup();
    perms
}

/// Generate a zero-free random ratio vector with the requested sum and
/// GCD 1, by sampling dividers. Bounded retries keep pathological sums from
/// looping forever.
pub fn random_ratios<R: Rng>(
    reagent_count: usize,
    ratio_sum: u64,
    rng: &mut R,
) -> PlanResult<Vec<u64>> {
    const MAX_RETRIES: usize = 100;

    if ratio_sum < reagent_count as u64 {
        return Err(PlanError::Config {
            message: format!(
                "ratio sum {ratio_sum} cannot be less than reagent count {reagent_count}"
            ),
        });
    }

    for _ in 0..MAX_RETRIES {
        let mut dividers: Vec<u64> = (0..reagent_count - 1)
            .map(|_| rng.gen_range(1..ratio_sum))
            .collect();
        dividers.sort_unstable();
        dividers.dedup();
        if dividers.len() != reagent_count - 1 {
            continue;
        }

        let mut ratios = Vec::with_capacity(reagent_count);
        let mut last = 0;
        for d in dividers {
            ratios.push(d - last);
            last = d;
        }
        ratios.push(ratio_sum - last);

        if ratios.iter().copied().fold(0, gcd) == 1 {
            return Ok(ratios);
        }
    }

    Err(PlanError::Config {
        message: format!(
            "could not find GCD-1 ratios for sum {ratio_sum} after {MAX_RETRIES} attempts"
        ),
    })
}
