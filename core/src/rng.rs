//! Deterministic random number generation for the simulated engine.
//!
//! RULE: the simulated engine never calls a platform RNG. Every draw
//! flows through a SimRng derived from the seed in `SimSettings`.
//!
//! Each part of the generated book gets its own stream, seeded from
//! (seed XOR stream_index). Adding a stream never shifts the others, so
//! a given seed keeps producing the same accounts and orders.

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// A named, deterministic RNG for one part of the generated book.
pub struct SimRng {
    pub name: &'static str,
    inner: Pcg64Mcg,
}

impl SimRng {
    /// The index must never change once assigned.
    pub fn new(seed: u64, stream_index: u64) -> Self {
        let derived_seed = seed ^ (stream_index.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        Self {
            name: "unnamed",
            inner: Pcg64Mcg::seed_from_u64(derived_seed),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll a u64 in [0, n). Returns 0 when `n` is 0.
    pub fn below(&mut self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }
        self.inner.next_u64() % n
    }

    /// Roll an integer in [lo, hi].
    pub fn between(&mut self, lo: i64, hi: i64) -> i64 {
        if hi <= lo {
            return lo;
        }
        lo + self.below((hi - lo + 1) as u64) as i64
    }

    /// Bernoulli trial: true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        items.get(self.below(items.len() as u64) as usize)
    }
}

/// All streams for one simulated session.
pub struct RngBank {
    seed: u64,
}

impl RngBank {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn stream(&self, slot: SimStream) -> SimRng {
        SimRng::new(self.seed, slot as u64).with_name(slot.name())
    }
}

/// Stable stream assignments. Append only: reordering changes every seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum SimStream {
    Accounts = 0,
    Commissions = 1,
    Calendar = 2,
    Orders = 3,
    Corruption = 4,
}

impl SimStream {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Accounts => "accounts",
            Self::Commissions => "commissions",
            Self::Calendar => "calendar",
            Self::Orders => "orders",
            Self::Corruption => "corruption",
        }
    }
}
