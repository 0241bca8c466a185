use anyhow::{Context, Result};
use clap::ArgMatches;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::launcher::output::{OutputOptions, DEFAULT_OUTPUT_BUFFER_LINES};
use crate::launcher::sequencer::SequencerConfig;
use crate::launcher::service::{CommandLine, ServiceSpec, Stack};

/// Stack launched when no config file is named.
pub const DEFAULT_STACK_TOML: &str = include_str!("../../config/stack.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_output_buffer_lines")]
    pub output_buffer_lines: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// Used by services that don't set their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_output_buffer_lines() -> usize {
    DEFAULT_OUTPUT_BUFFER_LINES
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            output_buffer_lines: default_output_buffer_lines(),
            log_dir: None,
            working_dir: None,
            env: BTreeMap::new(),
            services: Vec::new(),
            base_dir: None,
        }
    }
}

impl StackConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse stack definition")
    }

    pub fn embedded() -> Result<Self> {
        Self::from_toml_str(DEFAULT_STACK_TOML).context("Embedded default stack is invalid")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(anyhow::anyhow!("stack defines no services"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("poll_interval_ms must be greater than 0"));
        }

        if self.output_buffer_lines == 0 {
            return Err(anyhow::anyhow!(
                "output_buffer_lines must be greater than 0"
            ));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn sequencer_config(&self) -> SequencerConfig {
        SequencerConfig {
            poll_interval: self.poll_interval(),
            output: OutputOptions {
                buffer_lines: self.output_buffer_lines,
                log_dir: self.log_dir.as_deref().map(|dir| self.relative_to_base(dir)),
            },
        }
    }

    /// Produce the validated stack, expanding `${VAR}` from the process environment.
    pub fn resolve(&self) -> Result<Stack> {
        self.resolve_with(&|key| std::env::var(key).ok())
    }

    pub fn resolve_with(&self, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Stack> {
        self.validate()?;

        let mut specs = Vec::with_capacity(self.services.len());
        for service in &self.services {
            let mut spec = service.clone();

            let mut env = self.env.clone();
            env.extend(std::mem::take(&mut spec.env));
            spec.env = env
                .into_iter()
                .map(|(key, value)| (key, expand_vars(&value, lookup)))
                .collect();

            let argv = spec
                .command
                .argv()
                .with_context(|| format!("Invalid command for service {}", spec.name))?;
            spec.command = CommandLine::Argv(
                argv.iter()
                    .map(|arg| expand_vars(arg, lookup))
                    .collect(),
            );

            spec.working_dir = spec
                .working_dir
                .take()
                .or_else(|| self.working_dir.clone())
                .map(|dir| {
                    let expanded = expand_vars(&dir.to_string_lossy(), lookup);
                    self.relative_to_base(Path::new(&expanded))
                });

            specs.push(spec);
        }

        Stack::new(specs).context("Stack validation failed")
    }

    pub fn apply_cli_overrides(&mut self, matches: &ArgMatches) {
        if let Some(interval_str) = matches.get_one::<String>("poll-interval-ms") {
            if let Ok(interval) = interval_str.parse::<u64>() {
                self.poll_interval_ms = interval;
            }
        }

        if let Some(grace_str) = matches.get_one::<String>("grace-ms") {
            if let Ok(grace) = grace_str.parse::<u64>() {
                self.shutdown_grace_ms = grace;
            }
        }

        if let Some(log_dir) = matches.get_one::<String>("log-dir") {
            self.log_dir = Some(from_current_dir(log_dir));
        }
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(&|key| std::env::var(key).ok());
    }

    fn apply_env_overrides_from(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        if let Some(interval_str) = lookup("LABSTACK_POLL_INTERVAL_MS") {
            if let Ok(interval) = interval_str.parse::<u64>() {
                self.poll_interval_ms = interval;
            }
        }

        if let Some(grace_str) = lookup("LABSTACK_SHUTDOWN_GRACE_MS") {
            if let Ok(grace) = grace_str.parse::<u64>() {
                self.shutdown_grace_ms = grace;
            }
        }

        if let Some(lines_str) = lookup("LABSTACK_OUTPUT_BUFFER_LINES") {
            if let Ok(lines) = lines_str.parse::<usize>() {
                self.output_buffer_lines = lines;
            }
        }

        if let Some(log_dir) = lookup("LABSTACK_LOG_DIR") {
            self.log_dir = Some(from_current_dir(&log_dir));
        }
    }

    fn relative_to_base(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

// Overrides given on the command line or in the environment are relative to
// where the operator is, not to the config file.
fn from_current_dir(path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        return path;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&path))
        .unwrap_or(path)
}

/// Replace `${NAME}` references; unknown names expand to an empty string.
pub fn expand_vars(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    static VAR: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = VAR
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok())
        .as_ref()
    else {
        return input.to_string();
    };

    re.replace_all(input, |caps: &Captures| {
        let name = &caps[1];
        lookup(name).unwrap_or_else(|| {
            log::warn!("Environment variable {name} is not set, expanding to empty string");
            String::new()
        })
    })
    .into_owned()
}

/// Load configuration: CLI args > env vars > config file > embedded stack
pub fn load_config(config_path: Option<&str>, matches: &ArgMatches) -> Result<StackConfig> {
    let mut config = match config_path {
        Some(path) => {
            let path = Path::new(path);
            if !path.exists() {
                return Err(anyhow::anyhow!(
                    "Config file not found: {}",
                    path.display()
                ));
            }
            let config = StackConfig::from_file(path)?;
            log::info!("Loaded stack definition from file: {}", path.display());
            config
        }
        None => {
            log::info!("No config file given, using the built-in lab stack");
            StackConfig::embedded()?
        }
    };

    config.apply_env_overrides();
    config.apply_cli_overrides(matches);

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;

    log::info!("Configuration loaded successfully");
    log::debug!("Final config: {config:?}");

    Ok(config)
}

/// Write the built-in stack definition as a starting point
pub fn create_sample_config(path: &str) -> Result<()> {
    fs::write(path, DEFAULT_STACK_TOML)
        .with_context(|| format!("Failed to write sample config to: {path}"))?;

    println!("Sample configuration written to: {path}");
    Ok(())
}
