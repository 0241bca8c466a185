use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A lifecycle transition of one service, as seen by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchEvent {
    Spawning { service: String },
    Spawned { service: String, pid: Option<u32> },
    Ready { service: String, elapsed: Duration },
    TimedOut { service: String, timeout: Duration },
    Failed { service: String, reason: String },
    Interrupted { service: String },
    Cancelled { service: String },
    Skipped { service: String },
    Stopping { service: String },
    Stopped { service: String, forced: bool },
    StopFailed { service: String, error: String },
    ExitedUnexpectedly { service: String, status: String },
}

impl LaunchEvent {
    pub fn service(&self) -> &str {
        match self {
            LaunchEvent::Spawning { service }
            | LaunchEvent::Spawned { service, .. }
            | LaunchEvent::Ready { service, .. }
            | LaunchEvent::TimedOut { service, .. }
            | LaunchEvent::Failed { service, .. }
            | LaunchEvent::Interrupted { service }
            | LaunchEvent::Cancelled { service }
            | LaunchEvent::Skipped { service }
            | LaunchEvent::Stopping { service }
            | LaunchEvent::Stopped { service, .. }
            | LaunchEvent::StopFailed { service, .. }
            | LaunchEvent::ExitedUnexpectedly { service, .. } => service,
        }
    }

    fn is_problem(&self) -> bool {
        matches!(
            self,
            LaunchEvent::TimedOut { .. }
                | LaunchEvent::Failed { .. }
                | LaunchEvent::StopFailed { .. }
                | LaunchEvent::ExitedUnexpectedly { .. }
        )
    }
}

impl fmt::Display for LaunchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchEvent::Spawning { service } => write!(f, "[{service}] starting"),
            LaunchEvent::Spawned { service, pid } => match pid {
                Some(pid) => write!(f, "[{service}] spawned (pid {pid}), waiting for readiness"),
                None => write!(f, "[{service}] spawned, waiting for readiness"),
            },
            LaunchEvent::Ready { service, elapsed } => {
                write!(f, "[{service}] ready after {:.2}s", elapsed.as_secs_f64())
            }
            LaunchEvent::TimedOut { service, timeout } => write!(
                f,
                "[{service}] not ready within {:.2}s",
                timeout.as_secs_f64()
            ),
            LaunchEvent::Failed { service, reason } => write!(f, "[{service}] failed: {reason}"),
            LaunchEvent::Interrupted { service } => {
                write!(f, "[{service}] interrupted before becoming ready")
            }
            LaunchEvent::Cancelled { service } => {
                write!(f, "[{service}] cancelled after a dependency failed")
            }
            LaunchEvent::Skipped { service } => write!(f, "[{service}] not attempted"),
            LaunchEvent::Stopping { service } => write!(f, "[{service}] stopping"),
            LaunchEvent::Stopped { service, forced } => {
                if *forced {
                    write!(f, "[{service}] killed")
                } else {
                    write!(f, "[{service}] stopped")
                }
            }
            LaunchEvent::StopFailed { service, error } => {
                write!(f, "[{service}] could not be stopped: {error}")
            }
            LaunchEvent::ExitedUnexpectedly { service, status } => {
                write!(f, "[{service}] exited unexpectedly ({status})")
            }
        }
    }
}

/// Receives one event per service transition.
pub trait StatusListener: Send + Sync {
    fn on_event(&self, event: &LaunchEvent);
}

pub type SharedListener = Arc<dyn StatusListener>;

/// Writes status lines through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusListener;

impl StatusListener for LogStatusListener {
    fn on_event(&self, event: &LaunchEvent) {
        if event.is_problem() {
            log::warn!("{event}");
        } else {
            log::info!("{event}");
        }
    }
}

/// Prints status lines to stdout for an operator at a terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleStatusListener;

impl StatusListener for ConsoleStatusListener {
    fn on_event(&self, event: &LaunchEvent) {
        println!("{event}");
    }
}
