use std::process::ExitStatus;
use thiserror::Error;

/// Failures raised while launching or tearing down a stack.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn {service}: {source}")]
    Spawn {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{service} exited unexpectedly ({status})")]
    UnexpectedExit { service: String, status: ExitStatus },

    #[error("failed to stop {service}: {reason}")]
    Shutdown { service: String, reason: String },

    #[error("invalid stack configuration: {0}")]
    InvalidConfig(String),
}

impl LaunchError {
    pub fn spawn(service: &str, source: std::io::Error) -> Self {
        Self::Spawn {
            service: service.to_string(),
            source,
        }
    }

    pub fn shutdown(service: &str, reason: impl Into<String>) -> Self {
        Self::Shutdown {
            service: service.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = LaunchError> = std::result::Result<T, E>;
