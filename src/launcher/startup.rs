use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Duration;

use crate::launcher::config::StackConfig;
use crate::launcher::events::{LaunchEvent, LogStatusListener, SharedListener};
use crate::launcher::process::ProcessHandle;
use crate::launcher::report::{LaunchOutcome, LaunchReport};
use crate::launcher::sequencer::{Sequencer, SequencerConfig};
use crate::launcher::service::Stack;
use crate::launcher::shutdown::{ShutdownCoordinator, ShutdownSummary, DEFAULT_SHUTDOWN_GRACE};
use crate::launcher::signal::InterruptListener;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
/// Conventional status for a run ended by SIGINT.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Process exit status for a finished launch.
pub fn exit_code(report: &LaunchReport) -> i32 {
    if report.interrupted() {
        EXIT_INTERRUPTED
    } else if report.succeeded() {
        EXIT_OK
    } else {
        EXIT_FAILED
    }
}

/// Why [`StackSession::supervise`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Interrupted,
    /// A service marked `stop_stack_on_exit` exited.
    ServiceExited(String),
    /// Nothing is left running.
    AllExited,
}

/// Builder for launching a stack with common configuration
pub struct Launcher {
    config: SequencerConfig,
    grace: Duration,
    listener: SharedListener,
    interrupts: InterruptListener,
}

impl Launcher {
    pub fn new(config: SequencerConfig) -> Self {
        Self {
            config,
            grace: DEFAULT_SHUTDOWN_GRACE,
            listener: Arc::new(LogStatusListener),
            interrupts: InterruptListener::never(),
        }
    }

    pub fn from_config(config: &StackConfig) -> Self {
        Self::new(config.sequencer_config()).with_grace(config.shutdown_grace())
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_listener(mut self, listener: SharedListener) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_interrupts(mut self, interrupts: InterruptListener) -> Self {
        self.interrupts = interrupts;
        self
    }

    /// Run the sequencer over `stack`.
    ///
    /// If a critical service did not become ready, or the operator interrupted
    /// the launch, everything that was started is torn down before this returns.
    pub async fn launch(&self, stack: &Stack) -> StackSession {
        let mut sequencer = Sequencer::new(
            self.config.clone(),
            self.listener.clone(),
            self.interrupts.clone(),
        );
        let report = sequencer.run(stack.services()).await;

        let mut session = StackSession {
            report,
            handles: sequencer.into_handles(),
            listener: self.listener.clone(),
            interrupts: self.interrupts.clone(),
            poll_interval: self.config.poll_interval,
            grace: self.grace,
            reported_exits: HashSet::new(),
        };
        session.note_launch_failures();

        if !session.report.stack_usable() {
            let summary = session.teardown().await;
            if !summary.is_clean() {
                log::warn!(
                    "{} services could not be stopped cleanly after the failed launch",
                    summary.errors.len()
                );
            }
        }

        session
    }
}

/// A launched stack: its final report plus the handles it still owns.
pub struct StackSession {
    report: LaunchReport,
    handles: Vec<ProcessHandle>,
    listener: SharedListener,
    interrupts: InterruptListener,
    poll_interval: Duration,
    grace: Duration,
    reported_exits: HashSet<String>,
}

impl StackSession {
    pub fn report(&self) -> &LaunchReport {
        &self.report
    }

    pub fn handles(&self) -> &[ProcessHandle] {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut [ProcessHandle] {
        &mut self.handles
    }

    pub fn handle(&self, service: &str) -> Option<&ProcessHandle> {
        self.handles.iter().find(|handle| handle.name() == service)
    }

    pub fn exit_code(&self) -> i32 {
        exit_code(&self.report)
    }

    /// Services that died before becoming ready already have a failed entry
    /// in the report and are not announced again.
    fn note_launch_failures(&mut self) {
        for handle in &mut self.handles {
            let failed_at_launch = !matches!(
                self.report.outcome(handle.name()),
                Some(LaunchOutcome::Ready)
            );
            if failed_at_launch && !handle.is_alive() {
                self.reported_exits.insert(handle.name().to_string());
            }
        }
    }

    /// Check every handle once and announce processes that died since the last
    /// check. Each service is announced at most once. Returns the names of the
    /// newly exited services.
    pub fn poll_exits(&mut self) -> Vec<String> {
        let mut exited = Vec::new();
        for handle in &mut self.handles {
            if handle.is_alive() || self.reported_exits.contains(handle.name()) {
                continue;
            }

            let service = handle.name().to_string();
            self.reported_exits.insert(service.clone());

            if let Some(error) = handle.unexpected_exit() {
                let clean_end = handle.spec().stop_stack_on_exit
                    && handle.exit_status().is_some_and(|status| status.success());
                if clean_end {
                    log::info!("{service} exited, ending the session");
                } else {
                    log::warn!("{error}");
                    self.listener.on_event(&LaunchEvent::ExitedUnexpectedly {
                        service: service.clone(),
                        status: handle.exit_description(),
                    });
                }
                exited.push(service);
            }
        }
        exited
    }

    /// Keep a launched stack in the foreground until the operator interrupts,
    /// a `stop_stack_on_exit` service exits, or nothing is left running.
    ///
    /// Unexpected exits are reported as they are noticed but never change the
    /// launch report.
    pub async fn supervise(&mut self) -> SessionEnd {
        loop {
            if self.interrupts.is_triggered() {
                return SessionEnd::Interrupted;
            }

            for service in self.poll_exits() {
                let stops_stack = self
                    .handle(&service)
                    .is_some_and(|handle| handle.spec().stop_stack_on_exit);
                if stops_stack {
                    return SessionEnd::ServiceExited(service);
                }
            }

            let any_alive = self
                .handles
                .iter_mut()
                .map(|handle| handle.is_alive())
                .fold(false, |any, alive| any || alive);
            if !any_alive {
                return SessionEnd::AllExited;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.interrupts.triggered() => {}
            }
        }
    }

    /// Stop whatever is still running, last started first. Safe to call again.
    pub async fn teardown(&mut self) -> ShutdownSummary {
        ShutdownCoordinator::new(self.listener.clone())
            .with_escalation(self.interrupts.clone())
            .shutdown(&mut self.handles, self.grace)
            .await
    }
}
