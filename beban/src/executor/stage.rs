use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{duration::HumanDuration, error::ConfigError};

/// A stage ramps the number of active VUs to `target` over `duration`.
///
/// Use `Stage::new(Duration::from_secs(30), 10)` to ramp to 10 VUs over 30s.
/// A zero-duration stage jumps straight to its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "human")]
    pub duration: Duration,
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

mod human {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        HumanDuration(*d).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        HumanDuration::deserialize(d).map(Duration::from)
    }
}

/// How the VU count moves between stage boundaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampPolicy {
    /// Interpolate linearly from the previous target.
    #[default]
    Linear,
    /// Jump to each stage's target as the stage begins.
    Immediate,
}

/// A validated stage list.
///
/// For a stage running from `prev` to `target` over `duration`, the target
/// `elapsed` into the stage is
///
/// ```text
/// t = elapsed / duration
/// target(t) = prev + (target - prev) * t
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Schedule {
    start_vus: u32,
    stages: Vec<Stage>,
    policy: RampPolicy,
    total: Duration,
}

impl Schedule {
    pub fn new(
        start_vus: u32,
        stages: Vec<Stage>,
        policy: RampPolicy,
    ) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::Schedule("at least one stage is required".into()));
        }
        let total: Duration = stages.iter().map(|s| s.duration).sum();
        if total.is_zero() {
            return Err(ConfigError::Schedule(
                "the stages must last longer than zero".into(),
            ));
        }
        Ok(Self {
            start_vus,
            stages,
            policy,
            total,
        })
    }

    /// `vus` VUs from the start, held for `duration`.
    pub fn constant(vus: u32, duration: Duration) -> Result<Self, ConfigError> {
        Self::new(
            0,
            vec![Stage::new(Duration::ZERO, vus), Stage::new(duration, vus)],
            RampPolicy::Linear,
        )
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn policy(&self) -> RampPolicy {
        self.policy
    }

    pub fn start_vus(&self) -> u32 {
        self.start_vus
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// The exact (fractional) VU target `elapsed` into the run.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        let mut prev = f64::from(self.start_vus);
        let mut stage_start = Duration::ZERO;

        for stage in &self.stages {
            let target = f64::from(stage.target);
            let stage_end = stage_start + stage.duration;
            if stage.duration.is_zero() {
                prev = target;
                continue;
            }
            if elapsed < stage_end {
                return match self.policy {
                    RampPolicy::Immediate => target,
                    RampPolicy::Linear => {
                        let t = (elapsed - stage_start).as_secs_f64()
                            / stage.duration.as_secs_f64();
                        prev + (target - prev) * t
                    }
                };
            }
            prev = target;
            stage_start = stage_end;
        }
        prev
    }

    /// Whole VUs the controller should have running `elapsed` into the run.
    pub fn vus_at(&self, elapsed: Duration) -> u32 {
        self.target_at(elapsed).round() as u32
    }

    /// Highest VU count the schedule ever asks for.
    pub fn max_vus(&self) -> u32 {
        self.stages
            .iter()
            .map(|s| s.target)
            .chain(std::iter::once(self.start_vus))
            .max()
            .unwrap_or(0)
    }

    /// Index of the stage active at `elapsed`, `None` once the schedule is over.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_end = Duration::ZERO;
        for (i, stage) in self.stages.iter().enumerate() {
            stage_end += stage.duration;
            if !stage.duration.is_zero() && elapsed < stage_end {
                return Some(i);
            }
        }
        None
    }
}
