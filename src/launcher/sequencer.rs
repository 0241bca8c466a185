use chrono::Utc;
use std::sync::Arc;
use tokio::time::Duration;

use crate::launcher::events::{LaunchEvent, SharedListener};
use crate::launcher::output::OutputOptions;
use crate::launcher::probe::ProbeStatus;
use crate::launcher::process::ProcessHandle;
use crate::launcher::report::{LaunchOutcome, LaunchReport, ReportBuilder, ServiceReport};
use crate::launcher::service::ServiceSpec;
use crate::launcher::signal::InterruptListener;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lower bound for the network timeout of a single probe round trip.
const MIN_PROBE_IO_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    pub poll_interval: Duration,
    pub output: OutputOptions,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            output: OutputOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchResult {
    Completed,
    Aborted,
    Interrupted,
}

/// Progress of one service inside the batch being launched.
enum Slot {
    Pending { handle: usize },
    Resolved(ServiceReport),
}

/// Starts the services of a stack in order, one readiness gate at a time.
///
/// A spec with `depends_on_previous = false` is spawned together with its
/// predecessor and the two are polled side by side. The sequencer owns every
/// handle it spawns until they are handed to the shutdown coordinator.
pub struct Sequencer {
    config: SequencerConfig,
    listener: SharedListener,
    interrupts: InterruptListener,
    handles: Vec<ProcessHandle>,
}

impl Sequencer {
    pub fn new(
        config: SequencerConfig,
        listener: SharedListener,
        interrupts: InterruptListener,
    ) -> Self {
        Self {
            config,
            listener,
            interrupts,
            handles: Vec::new(),
        }
    }

    /// Handles in start order.
    pub fn handles(&self) -> &[ProcessHandle] {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut [ProcessHandle] {
        &mut self.handles
    }

    pub fn into_handles(self) -> Vec<ProcessHandle> {
        self.handles
    }

    pub async fn run(&mut self, stack: &[Arc<ServiceSpec>]) -> LaunchReport {
        let mut report = ReportBuilder::new();
        log::info!(
            "Launching stack of {} services (run {})",
            stack.len(),
            report.run_id()
        );

        let mut next = 0;
        let mut result = BatchResult::Completed;
        while next < stack.len() {
            let end = batch_end(stack, next);
            result = self.launch_batch(&stack[next..end], &mut report).await;
            next = end;
            if result != BatchResult::Completed {
                break;
            }
        }

        for spec in &stack[next..] {
            self.emit(LaunchEvent::Skipped {
                service: spec.name.clone(),
            });
            report.record(ServiceReport::not_attempted(&spec.name, spec.critical));
        }

        match result {
            BatchResult::Completed => {
                for handle in &mut self.handles {
                    handle.mark_running();
                }
            }
            BatchResult::Aborted => log::warn!("Stack launch aborted"),
            BatchResult::Interrupted => {
                log::warn!("Stack launch interrupted by operator");
                report.mark_interrupted();
            }
        }

        report.finish()
    }

    async fn launch_batch(
        &mut self,
        batch: &[Arc<ServiceSpec>],
        report: &mut ReportBuilder,
    ) -> BatchResult {
        let mut slots: Vec<Slot> = Vec::with_capacity(batch.len());
        let mut result = BatchResult::Completed;

        for spec in batch {
            if self.interrupts.is_triggered() {
                result = BatchResult::Interrupted;
                break;
            }

            self.emit(LaunchEvent::Spawning {
                service: spec.name.clone(),
            });

            match ProcessHandle::spawn(spec.clone(), &self.config.output) {
                Ok(handle) => {
                    self.emit(LaunchEvent::Spawned {
                        service: spec.name.clone(),
                        pid: handle.pid(),
                    });
                    self.handles.push(handle);
                    slots.push(Slot::Pending {
                        handle: self.handles.len() - 1,
                    });
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.emit(LaunchEvent::Failed {
                        service: spec.name.clone(),
                        reason: reason.clone(),
                    });
                    slots.push(Slot::Resolved(ServiceReport {
                        service: spec.name.clone(),
                        outcome: LaunchOutcome::Failed(reason),
                        elapsed: Duration::ZERO,
                        critical: spec.critical,
                        pid: None,
                        started_at: None,
                        resolved_at: Utc::now(),
                        last_output: None,
                    }));
                    result = BatchResult::Aborted;
                    break;
                }
            }
        }

        if result == BatchResult::Completed {
            result = self.await_readiness(batch, &mut slots).await;
        }

        let outcome_for_pending = match result {
            BatchResult::Interrupted => LaunchOutcome::Interrupted,
            _ => LaunchOutcome::Cancelled,
        };

        let mut slots = slots.into_iter();
        for spec in batch {
            let entry = match slots.next() {
                Some(Slot::Resolved(entry)) => entry,
                Some(Slot::Pending { handle }) => {
                    let event = match outcome_for_pending {
                        LaunchOutcome::Interrupted => LaunchEvent::Interrupted {
                            service: spec.name.clone(),
                        },
                        _ => LaunchEvent::Cancelled {
                            service: spec.name.clone(),
                        },
                    };
                    self.emit(event);
                    let handle = &mut self.handles[handle];
                    handle.mark_failed();
                    resolved_entry(spec, handle, outcome_for_pending.clone())
                }
                None => {
                    self.emit(LaunchEvent::Skipped {
                        service: spec.name.clone(),
                    });
                    ServiceReport::not_attempted(&spec.name, spec.critical)
                }
            };
            report.record(entry);
        }

        result
    }

    /// Poll every pending slot until each resolves, a critical one fails, or the
    /// operator interrupts.
    async fn await_readiness(
        &mut self,
        batch: &[Arc<ServiceSpec>],
        slots: &mut [Slot],
    ) -> BatchResult {
        let poll_interval = self.config.poll_interval;
        let io_timeout = poll_interval.max(MIN_PROBE_IO_TIMEOUT);

        loop {
            if self.interrupts.is_triggered() {
                return BatchResult::Interrupted;
            }

            let mut fatal = false;
            let mut next_deadline: Option<Duration> = None;

            for (spec, slot) in batch.iter().zip(slots.iter_mut()) {
                let Slot::Pending { handle: index } = *slot else {
                    continue;
                };

                let handle = &mut self.handles[index];
                let status = spec.readiness.check(handle, io_timeout).await;

                let (outcome, event) = match status {
                    ProbeStatus::Ready => {
                        handle.mark_ready();
                        let elapsed = handle.uptime();
                        (
                            LaunchOutcome::Ready,
                            LaunchEvent::Ready {
                                service: spec.name.clone(),
                                elapsed,
                            },
                        )
                    }
                    ProbeStatus::Error(reason) => {
                        handle.mark_failed();
                        (
                            LaunchOutcome::Failed(reason.clone()),
                            LaunchEvent::Failed {
                                service: spec.name.clone(),
                                reason,
                            },
                        )
                    }
                    ProbeStatus::Pending => {
                        let timeout = spec.startup_timeout();
                        let uptime = handle.uptime();
                        if uptime < timeout {
                            let remaining = timeout - uptime;
                            next_deadline =
                                Some(next_deadline.map_or(remaining, |d| d.min(remaining)));
                            continue;
                        }
                        handle.mark_failed();
                        (
                            LaunchOutcome::TimedOut,
                            LaunchEvent::TimedOut {
                                service: spec.name.clone(),
                                timeout,
                            },
                        )
                    }
                };

                if outcome != LaunchOutcome::Ready && spec.critical {
                    fatal = true;
                }

                let entry = resolved_entry(spec, handle, outcome);
                *slot = Slot::Resolved(entry);
                self.listener.on_event(&event);
            }

            if fatal {
                return BatchResult::Aborted;
            }

            let Some(remaining) = next_deadline else {
                return BatchResult::Completed;
            };

            let pause = poll_interval.min(remaining);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.interrupts.triggered() => {}
            }
        }
    }

    fn emit(&self, event: LaunchEvent) {
        self.listener.on_event(&event);
    }
}

/// Index one past the last spec that starts together with `stack[start]`.
fn batch_end(stack: &[Arc<ServiceSpec>], start: usize) -> usize {
    let mut end = start + 1;
    while end < stack.len() && !stack[end].depends_on_previous {
        end += 1;
    }
    end
}

fn resolved_entry(
    spec: &ServiceSpec,
    handle: &ProcessHandle,
    outcome: LaunchOutcome,
) -> ServiceReport {
    ServiceReport {
        service: spec.name.clone(),
        outcome,
        elapsed: handle.uptime(),
        critical: spec.critical,
        pid: handle.pid(),
        started_at: Some(handle.started_at()),
        resolved_at: Utc::now(),
        last_output: handle.last_output_line(),
    }
}
