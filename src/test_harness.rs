use std::net::TcpListener as StdTcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::launcher::events::{LaunchEvent, StatusListener};
use crate::launcher::output::OutputOptions;
use crate::launcher::sequencer::SequencerConfig;
use crate::launcher::service::{ServiceSpec, Stack};
use crate::launcher::signal::{interrupt_channel, InterruptListener, InterruptTrigger};
use crate::launcher::startup::{Launcher, StackSession};

// Default configuration constants
const DEFAULT_TEST_POLL_INTERVAL_MS: u64 = 20;
const DEFAULT_TEST_GRACE_MS: u64 = 1000;
const DEFAULT_TEST_BUFFER_LINES: usize = 50;

/// Listener that keeps every event so tests can assert on order.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<LaunchEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<LaunchEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Position of the first event matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&LaunchEvent) -> bool) -> Option<usize> {
        self.events().iter().position(predicate)
    }

    /// Services in the order they received a `Stopping` event.
    pub fn stop_order(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                LaunchEvent::Stopping { service } => Some(service.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&LaunchEvent) -> bool) -> usize {
        self.events().iter().filter(|event| predicate(event)).count()
    }
}

impl StatusListener for RecordingListener {
    fn on_event(&self, event: &LaunchEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

/// Settings for a [`TestStack`]; defaults keep tests fast.
#[derive(Debug, Clone)]
pub struct TestStackConfig {
    pub poll_interval_ms: u64,
    pub grace_ms: u64,
    pub buffer_lines: usize,
}

impl Default for TestStackConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_TEST_POLL_INTERVAL_MS,
            grace_ms: DEFAULT_TEST_GRACE_MS,
            buffer_lines: DEFAULT_TEST_BUFFER_LINES,
        }
    }
}

/// Launches stacks of real processes with a recording listener and an
/// interrupt trigger the test controls.
pub struct TestStack {
    pub recorder: Arc<RecordingListener>,
    pub trigger: InterruptTrigger,
    interrupts: InterruptListener,
    config: TestStackConfig,
}

impl TestStack {
    pub fn new() -> Self {
        Self::with_config(TestStackConfig::default())
    }

    pub fn with_config(config: TestStackConfig) -> Self {
        let (trigger, interrupts) = interrupt_channel();
        Self {
            recorder: Arc::new(RecordingListener::default()),
            trigger,
            interrupts,
            config,
        }
    }

    pub fn interrupts(&self) -> InterruptListener {
        self.interrupts.clone()
    }

    pub fn sequencer_config(&self) -> SequencerConfig {
        SequencerConfig {
            poll_interval: Duration::from_millis(self.config.poll_interval_ms),
            output: OutputOptions {
                buffer_lines: self.config.buffer_lines,
                log_dir: None,
            },
        }
    }

    pub fn launcher(&self) -> Launcher {
        Launcher::new(self.sequencer_config())
            .with_grace(Duration::from_millis(self.config.grace_ms))
            .with_listener(self.recorder.clone())
            .with_interrupts(self.interrupts.clone())
    }

    pub async fn launch(&self, specs: Vec<ServiceSpec>) -> anyhow::Result<StackSession> {
        let stack = Stack::new(specs)?;
        Ok(self.launcher().launch(&stack).await)
    }
}

impl Default for TestStack {
    fn default() -> Self {
        Self::new()
    }
}

/// A service running `script` under `sh -c`.
pub fn sh(name: &str, script: &str) -> ServiceSpec {
    ServiceSpec::new(name, ["sh", "-c", script])
}

/// A service that just sleeps for `secs`.
pub fn sleeper(name: &str, secs: u64) -> ServiceSpec {
    ServiceSpec::new(name, ["sleep".to_string(), secs.to_string()])
}

/// Ask the OS for a port nobody is listening on right now.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = StdTcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Whether a process with this pid still exists. A zombie waiting for its
/// parent to reap it counts as gone.
#[cfg(unix)]
pub fn pid_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => !is_zombie(pid),
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // The state field follows the parenthesised command name.
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next().map(|state| state == "Z"))
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Minimal HTTP server answering every request with `status`.
pub async fn spawn_health_server(status: u16) -> anyhow::Result<(u16, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    Ok((port, handle))
}

pub async fn poll_until<T, F, Fut>(
    timeout: std::time::Duration,
    interval: std::time::Duration,
    mut check: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }

        if tokio::time::Instant::now() >= deadline {
            return None;
        }

        tokio::time::sleep(interval).await;
    }
}
