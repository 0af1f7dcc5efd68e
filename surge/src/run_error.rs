use crate::exit_codes::ExitCode;

#[derive(Debug)]
pub enum RunError {
    InvalidInput(anyhow::Error),
    RuntimeError(anyhow::Error),
}

impl RunError {
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::InvalidInput(_) => ExitCode::InvalidInput,
            Self::RuntimeError(_) => ExitCode::RuntimeError,
        }
    }

    #[must_use]
    pub fn anyhow(&self) -> &anyhow::Error {
        match self {
            Self::InvalidInput(e) | Self::RuntimeError(e) => e,
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.anyhow())
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.anyhow().as_ref())
    }
}

/// Plan errors are the user's to fix; everything else the core reports is a runtime fault.
pub(crate) fn classify_core_error(context: &'static str, err: surge_core::Error) -> RunError {
    use surge_core::Error as CoreError;

    let kind = match &err {
        CoreError::InvalidStages
        | CoreError::InvalidStage { .. }
        | CoreError::InvalidTick
        | CoreError::InvalidThresholdInterval
        | CoreError::InvalidErrorRate
        | CoreError::InvalidThreshold { .. } => RunError::InvalidInput,

        CoreError::InvalidState(_) | CoreError::Scheduler(_) | CoreError::Metrics(_) => {
            RunError::RuntimeError
        }
    };

    kind(anyhow::Error::new(err).context(context))
}
