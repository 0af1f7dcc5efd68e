use surge_core::{RunState, Summary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,

    /// One or more thresholds failed.
    ThresholdsFailed = 11,

    /// The run was aborted (abort-on-fail threshold, scheduler errors, Ctrl-C).
    RunAborted = 12,

    /// Invalid CLI/plan input (bad flags, invalid durations, invalid thresholds syntax, etc.).
    InvalidInput = 30,

    /// Internal/runtime error (IO errors, unexpected invariants).
    RuntimeError = 40,
}

impl ExitCode {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub fn from_summary(summary: &Summary) -> Self {
        if summary.state == RunState::Aborted {
            Self::RunAborted
        } else if !summary.overall_pass {
            Self::ThresholdsFailed
        } else {
            Self::Success
        }
    }
}
