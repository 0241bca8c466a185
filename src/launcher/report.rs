use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::fmt::Write as _;
use std::time::Duration;
use uuid::Uuid;

/// Final outcome of one service in a launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum LaunchOutcome {
    Ready,
    Failed(String),
    TimedOut,
    /// The operator interrupted the launch while this service was pending.
    Interrupted,
    /// Spawned, but abandoned because another service in its batch failed.
    Cancelled,
    /// Never spawned because the stack aborted first.
    NotAttempted,
}

impl fmt::Display for LaunchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchOutcome::Ready => f.write_str("ready"),
            LaunchOutcome::Failed(reason) => write!(f, "failed: {reason}"),
            LaunchOutcome::TimedOut => f.write_str("timed out"),
            LaunchOutcome::Interrupted => f.write_str("interrupted"),
            LaunchOutcome::Cancelled => f.write_str("cancelled"),
            LaunchOutcome::NotAttempted => f.write_str("not attempted"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub service: String,
    pub outcome: LaunchOutcome,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub critical: bool,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub resolved_at: DateTime<Utc>,
    pub last_output: Option<String>,
}

impl ServiceReport {
    pub fn not_attempted(service: &str, critical: bool) -> Self {
        Self {
            service: service.to_string(),
            outcome: LaunchOutcome::NotAttempted,
            elapsed: Duration::ZERO,
            critical,
            pid: None,
            started_at: None,
            resolved_at: Utc::now(),
            last_output: None,
        }
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// Per-service outcomes of one launch, in stack order.
///
/// Reports are only built by the sequencer and cannot be modified once returned.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    interrupted: bool,
    services: Vec<ServiceReport>,
}

impl LaunchReport {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn entries(&self) -> &[ServiceReport] {
        &self.services
    }

    pub fn entry(&self, service: &str) -> Option<&ServiceReport> {
        self.services.iter().find(|entry| entry.service == service)
    }

    pub fn outcome(&self, service: &str) -> Option<&LaunchOutcome> {
        self.entry(service).map(|entry| &entry.outcome)
    }

    pub fn ready_count(&self) -> usize {
        self.services
            .iter()
            .filter(|entry| entry.outcome == LaunchOutcome::Ready)
            .count()
    }

    /// True iff every service reached Ready.
    pub fn succeeded(&self) -> bool {
        self.services
            .iter()
            .all(|entry| entry.outcome == LaunchOutcome::Ready)
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    /// True when every critical service is Ready and nobody interrupted the
    /// launch. Failed non-critical services don't count against it.
    pub fn stack_usable(&self) -> bool {
        !self.interrupted
            && self
                .services
                .iter()
                .all(|entry| !entry.critical || entry.outcome == LaunchOutcome::Ready)
    }

    pub fn summary(&self) -> String {
        let width = self
            .services
            .iter()
            .map(|entry| entry.service.len())
            .max()
            .unwrap_or(0);

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Launch {}: {}/{} services ready",
            self.run_id,
            self.ready_count(),
            self.services.len()
        );

        for entry in &self.services {
            let _ = write!(out, "  {:<width$}  {}", entry.service, entry.outcome);
            if entry.outcome != LaunchOutcome::NotAttempted {
                let _ = write!(out, " ({:.2}s)", entry.elapsed.as_secs_f64());
            }
            if !entry.critical && entry.outcome != LaunchOutcome::Ready {
                out.push_str(" [non-critical]");
            }
            if entry.outcome != LaunchOutcome::Ready {
                if let Some(line) = &entry.last_output {
                    let _ = write!(out, "\n  {:<width$}  last output: {line}", "");
                }
            }
            out.push('\n');
        }

        let verdict = if self.succeeded() {
            "stack is up"
        } else if self.interrupted {
            "launch interrupted"
        } else if self.stack_usable() {
            "stack is up, non-critical services failed"
        } else {
            "launch FAILED"
        };
        let _ = write!(out, "Result: {verdict}");
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for LaunchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Append-only accumulator the sequencer fills while a launch is in progress.
#[derive(Debug)]
pub(crate) struct ReportBuilder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    interrupted: bool,
    services: Vec<ServiceReport>,
}

impl ReportBuilder {
    pub(crate) fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            interrupted: false,
            services: Vec::new(),
        }
    }

    pub(crate) fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub(crate) fn record(&mut self, entry: ServiceReport) {
        self.services.push(entry);
    }

    pub(crate) fn mark_interrupted(&mut self) {
        self.interrupted = true;
    }

    pub(crate) fn finish(self) -> LaunchReport {
        LaunchReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            interrupted: self.interrupted,
            services: self.services,
        }
    }
}
