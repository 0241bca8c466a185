use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::launcher::error::{LaunchError, Result};
use crate::launcher::probe::ReadinessProbe;

pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;

/// Executable plus arguments, either as an argv array or a single shell-quoted line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Argv(Vec<String>),
    Line(String),
}

impl CommandLine {
    pub fn argv(&self) -> Result<Vec<String>> {
        match self {
            CommandLine::Argv(parts) => Ok(parts.clone()),
            CommandLine::Line(line) => shlex::split(line).ok_or_else(|| {
                LaunchError::InvalidConfig(format!("unbalanced quoting in command: {line}"))
            }),
        }
    }
}

impl<S: Into<String>> FromIterator<S> for CommandLine {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        CommandLine::Argv(iter.into_iter().map(Into::into).collect())
    }
}

/// Static description of one launchable service.
///
/// Specs are read-only once a stack has been resolved; the sequencer shares
/// them with the process handles it creates through an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub command: CommandLine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub depends_on_previous: bool,
    /// A critical service that fails to become ready aborts the rest of the stack.
    #[serde(default = "default_true")]
    pub critical: bool,
    /// Tear the whole stack down when this service exits after launch.
    #[serde(default)]
    pub stop_stack_on_exit: bool,
    /// Overrides applied on top of the inherited environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub readiness: ReadinessProbe,
}

fn default_startup_timeout_ms() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

impl ServiceSpec {
    pub fn new<I, S>(name: &str, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            command: command.into_iter().collect(),
            working_dir: None,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            depends_on_previous: true,
            critical: true,
            stop_stack_on_exit: false,
            env: BTreeMap::new(),
            readiness: ReadinessProbe::default(),
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessProbe) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    /// Let this service start without waiting for the previous one to be ready.
    pub fn without_dependency(mut self) -> Self {
        self.depends_on_previous = false;
        self
    }

    pub fn stops_stack_on_exit(mut self) -> Self {
        self.stop_stack_on_exit = true;
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(LaunchError::InvalidConfig(
                "service name must not be empty".to_string(),
            ));
        }

        let argv = self.command.argv()?;
        if argv.first().map_or(true, |program| program.is_empty()) {
            return Err(LaunchError::InvalidConfig(format!(
                "service {} has an empty command",
                self.name
            )));
        }

        if self.startup_timeout_ms == 0 {
            return Err(LaunchError::InvalidConfig(format!(
                "service {}: startup_timeout_ms must be greater than 0",
                self.name
            )));
        }

        self.readiness
            .validate()
            .map_err(|e| LaunchError::InvalidConfig(format!("service {}: {e}", self.name)))
    }
}

/// An ordered, validated set of services launched together.
#[derive(Debug, Clone)]
pub struct Stack {
    services: Vec<Arc<ServiceSpec>>,
}

impl Stack {
    pub fn new(services: Vec<ServiceSpec>) -> Result<Self> {
        if services.is_empty() {
            return Err(LaunchError::InvalidConfig(
                "stack defines no services".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for spec in &services {
            spec.validate()?;
            if !seen.insert(spec.name.as_str()) {
                return Err(LaunchError::InvalidConfig(format!(
                    "duplicate service name: {}",
                    spec.name
                )));
            }
        }

        Ok(Self {
            services: services.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn services(&self) -> &[Arc<ServiceSpec>] {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Human-readable launch order, one line per service.
    pub fn plan(&self) -> String {
        let mut out = String::new();
        for (position, spec) in self.services.iter().enumerate() {
            let gate = if position > 0 && !spec.depends_on_previous {
                "with previous"
            } else {
                "after previous ready"
            };
            let argv = spec.command.argv().unwrap_or_default().join(" ");
            let _ = writeln!(
                out,
                "{}. {} [{}]: {argv}",
                position + 1,
                spec.name,
                if position == 0 { "first" } else { gate }
            );
            let _ = writeln!(
                out,
                "   ready when {} (timeout {:.1}s{})",
                spec.readiness,
                spec.startup_timeout().as_secs_f64(),
                if spec.critical { "" } else { ", non-critical" }
            );
            if let Some(dir) = &spec.working_dir {
                let _ = writeln!(out, "   in {}", dir.display());
            }
        }
        out
    }
}
