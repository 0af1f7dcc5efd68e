use std::time::Duration;

use crate::config::{RampShape, Stage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSnapshot {
    /// 0-based index of the current stage.
    pub index: usize,
    pub count: usize,
    pub stage_elapsed: Duration,
    pub stage_remaining: Duration,
    pub start_target: u64,
    pub end_target: u64,
    pub current_target: u64,
}

/// Target VU population as a function of elapsed run time.
#[derive(Debug, Clone)]
pub struct RampingSchedule {
    start: u64,
    shape: RampShape,
    stages: Vec<Stage>,
    cumulative_ends: Vec<Duration>,
}

impl RampingSchedule {
    pub fn new(start: u64, shape: RampShape, stages: Vec<Stage>) -> Self {
        let mut cumulative_ends = Vec::with_capacity(stages.len());
        let mut acc = Duration::ZERO;
        for s in &stages {
            acc = acc.saturating_add(s.duration);
            cumulative_ends.push(acc);
        }

        Self {
            start,
            shape,
            stages,
            cumulative_ends,
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.cumulative_ends
            .last()
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_done(&self, elapsed: Duration) -> bool {
        elapsed >= self.total_duration()
    }

    /// Index of the stage covering `[start, end)` that contains `elapsed`, if any.
    fn stage_index(&self, elapsed: Duration) -> Option<usize> {
        let idx = self.cumulative_ends.partition_point(|end| *end <= elapsed);
        (idx < self.stages.len()).then_some(idx)
    }

    fn stage_bounds(&self, idx: usize) -> (Duration, Duration) {
        let start = if idx == 0 {
            Duration::ZERO
        } else {
            self.cumulative_ends[idx - 1]
        };
        (start, self.cumulative_ends[idx])
    }

    fn start_target(&self, idx: usize) -> u64 {
        if idx == 0 {
            self.start
        } else {
            self.stages[idx - 1].target
        }
    }

    pub fn target_at(&self, elapsed: Duration) -> u64 {
        let Some(idx) = self.stage_index(elapsed) else {
            return self.stages.last().map(|s| s.target).unwrap_or(self.start);
        };

        let end_target = self.stages[idx].target;
        if self.shape == RampShape::Step {
            return end_target;
        }

        let (stage_start, stage_end) = self.stage_bounds(idx);
        let stage_duration = stage_end.saturating_sub(stage_start);
        if stage_duration.is_zero() {
            return end_target;
        }
        let stage_elapsed = elapsed.saturating_sub(stage_start);

        // Integer division truncates toward zero, i.e. toward the previous target.
        let start_i = self.start_target(idx) as i128;
        let delta = end_target as i128 - start_i;

        let num = stage_elapsed.as_nanos() as i128;
        let den = stage_duration.as_nanos() as i128;

        let cur = start_i + delta.saturating_mul(num) / den.max(1);
        cur.clamp(0, u64::MAX as i128) as u64
    }

    pub fn stage_snapshot_at(&self, elapsed: Duration) -> Option<StageSnapshot> {
        if self.stages.is_empty() {
            return None;
        }

        let idx = self
            .stage_index(elapsed)
            .unwrap_or(self.stages.len().saturating_sub(1));

        let (stage_start, stage_end) = self.stage_bounds(idx);
        let stage_duration = stage_end.saturating_sub(stage_start);
        let stage_elapsed = elapsed.saturating_sub(stage_start).min(stage_duration);

        Some(StageSnapshot {
            index: idx,
            count: self.stages.len(),
            stage_elapsed,
            stage_remaining: stage_duration.saturating_sub(stage_elapsed),
            start_target: self.start_target(idx),
            end_target: self.stages[idx].target,
            current_target: self.target_at(elapsed),
        })
    }
}
