use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The global kill switch is off — the batch never starts.
    #[error("Autoposting is disabled")]
    Disabled,

    #[error(transparent)]
    Social(#[from] sibyl_social::SocialError),

    #[error("Generation failed: {0}")]
    Generation(String),
}

impl From<SchedulerError> for sibyl_core::SibylError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Disabled => {
                sibyl_core::SibylError::PermissionDenied {
                    reason: "autoposting is disabled".into(),
                }
            }
            SchedulerError::Social(e) => e.into(),
            SchedulerError::Generation(reason) => sibyl_core::SibylError::UpstreamUnavailable {
                service: "autopost".into(),
                reason,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
