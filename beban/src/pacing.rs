//! Think time between iterations and the per-VU random streams it draws from.

use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::{duration::HumanDuration, error::ConfigError};

/// Pause a VU takes after each iteration.
///
/// ```yaml
/// think_time: 2s                       # fixed
/// think_time: { min: 2s, max: 4s }     # uniform in [min, max]
/// think_time: { cycle: [2s, 3s] }      # VU id picks d[id % len]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThinkTime {
    Fixed(HumanDuration),
    Uniform { min: HumanDuration, max: HumanDuration },
    Cycle { cycle: Vec<HumanDuration> },
}

impl Default for ThinkTime {
    fn default() -> Self {
        Self::Fixed(HumanDuration(Duration::ZERO))
    }
}

impl ThinkTime {
    pub fn fixed(duration: Duration) -> Self {
        Self::Fixed(duration.into())
    }

    pub fn uniform(min: Duration, max: Duration) -> Self {
        Self::Uniform {
            min: min.into(),
            max: max.into(),
        }
    }

    pub fn cycle(durations: impl IntoIterator<Item = Duration>) -> Self {
        Self::Cycle {
            cycle: durations.into_iter().map(HumanDuration).collect(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Fixed(_) => Ok(()),
            Self::Uniform { min, max } if min > max => Err(ConfigError::ThinkTime(format!(
                "min ({min}) is greater than max ({max})"
            ))),
            Self::Uniform { .. } => Ok(()),
            Self::Cycle { cycle } if cycle.is_empty() => {
                Err(ConfigError::ThinkTime("cycle must not be empty".into()))
            }
            Self::Cycle { .. } => Ok(()),
        }
    }

    /// The pause VU `vu` takes now.
    pub fn pause(&self, vu: u64, rng: &mut impl Rng) -> Duration {
        match self {
            Self::Fixed(d) => d.0,
            Self::Uniform { min, max } => {
                let (lo, hi) = (min.0.min(max.0), min.0.max(max.0));
                if lo == hi {
                    lo
                } else {
                    rng.random_range(lo..=hi)
                }
            }
            Self::Cycle { cycle } => {
                let len = cycle.len() as u64;
                cycle
                    .get((vu % len.max(1)) as usize)
                    .map_or(Duration::ZERO, |d| d.0)
            }
        }
    }
}

/// Salt mixed into the seed of the stream think time draws from, so pauses
/// do not consume the values a scenario draws for its payloads.
pub(crate) const THINK_SALT: u64 = 0x7468_696e_6b00_0000;

/// Deterministic RNG for one VU iteration.
///
/// The same `(seed, vu, iteration)` always yields the same stream, whatever
/// the scheduling order of the VUs.
pub fn iteration_rng(seed: u64, vu: u64, iteration: u64) -> StdRng {
    let mixed = splitmix64(splitmix64(splitmix64(seed) ^ vu) ^ iteration);
    StdRng::seed_from_u64(mixed)
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
