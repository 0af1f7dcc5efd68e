use std::time::Duration;

use crate::error::{Error, Result};
use crate::thresholds::Threshold;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

/// How the target population moves between two consecutive stage targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum RampShape {
    /// Interpolate linearly across the stage.
    #[default]
    Linear,
    /// Jump to the stage target as soon as the stage starts.
    Step,
}

#[derive(Debug, Clone)]
pub struct RunPlan {
    pub stages: Vec<Stage>,
    /// Population before the first stage starts ramping. Defaults to 1, as in k6,
    /// so that a single `0 -> N` stage has a VU running from the start.
    pub start_vus: u64,
    pub ramp: RampShape,
    pub thresholds: Vec<Threshold>,
    /// Scheduler tick: how often the live population is reconciled with the target.
    pub tick: Duration,
    /// Pause after every iteration.
    pub think_time: Option<Duration>,
    /// How long a VU retired by a ramp-down may take to finish its iteration.
    pub graceful_ramp_down: Duration,
    /// How long VUs may take to finish their iteration at the end of the run.
    pub graceful_stop: Duration,
    /// Cadence of live threshold evaluation.
    pub threshold_interval: Duration,
    /// Ratio of failed VU spawns above which the run is aborted.
    pub max_scheduler_error_rate: f64,
}

impl Default for RunPlan {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            start_vus: 1,
            ramp: RampShape::Linear,
            thresholds: Vec::new(),
            tick: Duration::from_secs(1),
            think_time: None,
            graceful_ramp_down: Duration::from_secs(30),
            graceful_stop: Duration::from_secs(30),
            threshold_interval: Duration::from_secs(2),
            max_scheduler_error_rate: 0.5,
        }
    }
}

impl RunPlan {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            stages,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::InvalidStages);
        }

        for (index, stage) in self.stages.iter().enumerate() {
            if stage.duration.is_zero() {
                return Err(Error::InvalidStage {
                    index,
                    reason: "`duration` must be greater than zero",
                });
            }
        }

        if self.tick.is_zero() {
            return Err(Error::InvalidTick);
        }
        if self.threshold_interval.is_zero() {
            return Err(Error::InvalidThresholdInterval);
        }

        let rate = self.max_scheduler_error_rate;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(Error::InvalidErrorRate);
        }

        Ok(())
    }

    pub fn total_duration(&self) -> Duration {
        self.stages
            .iter()
            .fold(Duration::ZERO, |acc, s| acc.saturating_add(s.duration))
    }

    pub fn max_target(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start_vus, u64::max)
    }
}
