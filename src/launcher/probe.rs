use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::launcher::error::{LaunchError, Result};
use crate::launcher::process::ProcessHandle;

/// Delay used when a service names no better readiness signal.
pub const DEFAULT_FIXED_DELAY_MS: u64 = 2000;

/// How the sequencer decides that a just-spawned service is usable by its dependents.
///
/// Probes hold no state between polls. `FixedDelay` carries the weakest
/// guarantee: it only says that the process has been alive for a while.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadinessProbe {
    FixedDelay {
        #[serde(default)]
        delay_ms: u64,
    },
    PortOpen {
        #[serde(default = "default_host")]
        host: String,
        port: u16,
    },
    LogMatch {
        pattern: String,
    },
    HttpHealth {
        url: String,
    },
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        ReadinessProbe::FixedDelay {
            delay_ms: DEFAULT_FIXED_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Pending,
    Ready,
    Error(String),
}

impl ReadinessProbe {
    pub fn fixed_delay(delay: Duration) -> Self {
        ReadinessProbe::FixedDelay {
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn port_open(host: &str, port: u16) -> Self {
        ReadinessProbe::PortOpen {
            host: host.to_string(),
            port,
        }
    }

    pub fn log_match(pattern: &str) -> Self {
        ReadinessProbe::LogMatch {
            pattern: pattern.to_string(),
        }
    }

    pub fn http_health(url: &str) -> Self {
        ReadinessProbe::HttpHealth {
            url: url.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ReadinessProbe::FixedDelay { .. } => Ok(()),
            ReadinessProbe::PortOpen { host, port } => {
                if host.is_empty() {
                    return Err(LaunchError::InvalidConfig(
                        "port_open probe needs a host".to_string(),
                    ));
                }
                if *port == 0 {
                    return Err(LaunchError::InvalidConfig(
                        "port_open probe needs a non-zero port".to_string(),
                    ));
                }
                Ok(())
            }
            ReadinessProbe::LogMatch { .. } => self.output_marker().map(|_| ()),
            ReadinessProbe::HttpHealth { url } => {
                let parsed = reqwest::Url::parse(url).map_err(|e| {
                    LaunchError::InvalidConfig(format!("invalid health url {url}: {e}"))
                })?;
                match parsed.scheme() {
                    "http" | "https" => Ok(()),
                    other => Err(LaunchError::InvalidConfig(format!(
                        "health url {url} uses unsupported scheme {other}"
                    ))),
                }
            }
        }
    }

    /// Regex the output reader should watch for, if this probe reads service output.
    pub fn output_marker(&self) -> Result<Option<Regex>> {
        match self {
            ReadinessProbe::LogMatch { pattern } => Regex::new(pattern)
                .map(Some)
                .map_err(|e| LaunchError::InvalidConfig(format!("invalid log pattern: {e}"))),
            _ => Ok(None),
        }
    }

    /// Evaluate the probe once against `handle`.
    ///
    /// A handle whose process has already exited is reported as an error so the
    /// caller never keeps polling a dead service. `io_timeout` bounds any
    /// network round trip made by the probe.
    pub async fn check(&self, handle: &mut ProcessHandle, io_timeout: Duration) -> ProbeStatus {
        if !handle.is_alive() {
            return ProbeStatus::Error(handle.exit_description());
        }

        match self {
            ReadinessProbe::FixedDelay { delay_ms } => {
                if handle.uptime() >= Duration::from_millis(*delay_ms) {
                    ProbeStatus::Ready
                } else {
                    ProbeStatus::Pending
                }
            }
            ReadinessProbe::PortOpen { host, port } => {
                match tokio::time::timeout(io_timeout, TcpStream::connect((host.as_str(), *port)))
                    .await
                {
                    Ok(Ok(_)) => ProbeStatus::Ready,
                    Ok(Err(e)) => {
                        log::trace!("{}: {host}:{port} not accepting yet: {e}", handle.name());
                        ProbeStatus::Pending
                    }
                    Err(_) => ProbeStatus::Pending,
                }
            }
            ReadinessProbe::LogMatch { .. } => {
                if handle.marker_seen() {
                    ProbeStatus::Ready
                } else {
                    ProbeStatus::Pending
                }
            }
            ReadinessProbe::HttpHealth { url } => {
                match http_client().get(url).timeout(io_timeout).send().await {
                    Ok(response) if response.status().is_success() => ProbeStatus::Ready,
                    Ok(response) => {
                        log::trace!("{}: health check returned {}", handle.name(), response.status());
                        ProbeStatus::Pending
                    }
                    Err(e) => {
                        log::trace!("{}: health check failed: {e}", handle.name());
                        ProbeStatus::Pending
                    }
                }
            }
        }
    }
}

fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    })
}

impl fmt::Display for ReadinessProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessProbe::FixedDelay { delay_ms } => write!(f, "fixed delay {delay_ms}ms"),
            ReadinessProbe::PortOpen { host, port } => write!(f, "port {host}:{port} open"),
            ReadinessProbe::LogMatch { pattern } => write!(f, "output matching /{pattern}/"),
            ReadinessProbe::HttpHealth { url } => write!(f, "HTTP 2xx from {url}"),
        }
    }
}
