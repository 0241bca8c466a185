use tokio::time::Duration;

use crate::launcher::error::LaunchError;
use crate::launcher::events::{LaunchEvent, SharedListener};
use crate::launcher::process::{ProcessHandle, StopOutcome};
use crate::launcher::signal::InterruptListener;

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What a shutdown pass did, in stop order.
#[derive(Debug, Default)]
pub struct ShutdownSummary {
    pub stopped: Vec<String>,
    pub forced: Vec<String>,
    pub errors: Vec<LaunchError>,
}

impl ShutdownSummary {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Tears a stack down in reverse start order.
///
/// Teardown is best effort: a handle that cannot be stopped is reported in the
/// summary and the remaining handles are still stopped.
pub struct ShutdownCoordinator {
    listener: SharedListener,
    escalation: Option<InterruptListener>,
}

impl ShutdownCoordinator {
    pub fn new(listener: SharedListener) -> Self {
        Self {
            listener,
            escalation: None,
        }
    }

    /// Skip remaining grace periods if another interrupt arrives during teardown.
    pub fn with_escalation(mut self, interrupts: InterruptListener) -> Self {
        self.escalation = Some(interrupts);
        self
    }

    /// Stop every live handle, last started first.
    ///
    /// Handles whose process has already exited are left alone, so repeating a
    /// shutdown over the same handles does nothing.
    pub async fn shutdown(
        &self,
        handles: &mut [ProcessHandle],
        grace: Duration,
    ) -> ShutdownSummary {
        let mut summary = ShutdownSummary::default();
        let escalate_at = self
            .escalation
            .as_ref()
            .map(|interrupts| interrupts.count().saturating_add(1));

        let live = handles
            .iter_mut()
            .map(|handle| handle.is_alive())
            .filter(|alive| *alive)
            .count();
        if live > 0 {
            log::info!("Stopping {live} services (grace {grace:?})");
        }

        for handle in handles.iter_mut().rev() {
            if !handle.is_alive() {
                log::debug!("{} already exited, nothing to stop", handle.name());
                continue;
            }

            let service = handle.name().to_string();
            self.listener.on_event(&LaunchEvent::Stopping {
                service: service.clone(),
            });

            let result = match (&self.escalation, escalate_at) {
                (Some(interrupts), Some(threshold)) => {
                    handle
                        .stop_or_escalate(grace, interrupts.reached(threshold))
                        .await
                }
                _ => handle.stop(grace).await,
            };

            match result {
                Ok(StopOutcome::AlreadyExited) => {
                    log::debug!("{service} exited before it was signalled");
                }
                Ok(outcome) => {
                    let forced = outcome == StopOutcome::Forced;
                    self.listener.on_event(&LaunchEvent::Stopped {
                        service: service.clone(),
                        forced,
                    });
                    if forced {
                        summary.forced.push(service.clone());
                    }
                    summary.stopped.push(service);
                }
                Err(e) => {
                    log::error!("Error stopping {service}: {e}");
                    self.listener.on_event(&LaunchEvent::StopFailed {
                        service,
                        error: e.to_string(),
                    });
                    summary.errors.push(e);
                }
            }
        }

        summary
    }
}
