use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::launcher::error::{LaunchError, Result};
use crate::launcher::output::{
    capture_lines, with_output, LogSink, OutputBuffer, OutputOptions, OutputStream, SharedOutput,
};
use crate::launcher::service::ServiceSpec;

/// How long to wait for the output readers to flush after a process has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Ready,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessState::Starting => "starting",
            ProcessState::Ready => "ready",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
            ProcessState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Term,
    Kill,
}

/// How a stop request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was no longer running; nothing was signalled.
    AlreadyExited,
    /// The process exited within the grace period after SIGTERM.
    Graceful,
    /// The process had to be killed.
    Forced,
}

/// One spawned service process.
///
/// The handle owns the child; dropping it kills the process. Output is read
/// by background tasks into a bounded [`OutputBuffer`].
///
/// On unix each service leads its own process group, and stop signals go to
/// the whole group so wrapper scripts do not leave their servers behind.
pub struct ProcessHandle {
    spec: Arc<ServiceSpec>,
    child: Child,
    pid: Option<u32>,
    state: ProcessState,
    started_at: DateTime<Utc>,
    spawned_at: Instant,
    output: SharedOutput,
    exit_status: Option<ExitStatus>,
    readers: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Spawn the service described by `spec` with its resolved environment and working directory.
    pub fn spawn(spec: Arc<ServiceSpec>, options: &OutputOptions) -> Result<Self> {
        let argv = spec.command.argv()?;
        let (program, args) = argv.split_first().ok_or_else(|| {
            LaunchError::InvalidConfig(format!("service {} has an empty command", spec.name))
        })?;

        let buffer = OutputBuffer::new(&spec.name, options.buffer_lines)
            .with_marker(spec.readiness.output_marker()?);
        let sink = options.log_path(&spec.name).and_then(|path| {
            LogSink::open(&spec.name, &path)
                .map_err(|e| {
                    log::warn!(
                        "{}: cannot open output log {}: {e}",
                        spec.name,
                        path.display()
                    )
                })
                .ok()
                .map(Arc::new)
        });

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        log::debug!("Spawning {}: {program} {args:?}", spec.name);

        let mut child = cmd.spawn().map_err(|e| LaunchError::spawn(&spec.name, e))?;
        let pid = child.id();
        let output = buffer.into_shared();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                spec.name.clone(),
                stdout,
                OutputStream::Stdout,
                output.clone(),
                sink.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                spec.name.clone(),
                stderr,
                OutputStream::Stderr,
                output.clone(),
                sink,
            ));
        }

        log::info!("{} started: PID {pid:?}", spec.name);

        Ok(Self {
            spec,
            child,
            pid,
            state: ProcessState::Starting,
            started_at: Utc::now(),
            spawned_at: Instant::now(),
            output,
            exit_status: None,
            readers,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &Arc<ServiceSpec> {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub fn output(&self) -> SharedOutput {
        self.output.clone()
    }

    pub fn last_output_line(&self) -> Option<String> {
        with_output(&self.output, |buffer| buffer.last_line().map(str::to_string))
    }

    pub fn marker_seen(&self) -> bool {
        with_output(&self.output, |buffer| buffer.marker_hit().is_some())
    }

    /// Poll the OS for the process's exit without blocking.
    ///
    /// An exit observed before the handle was asked to stop moves it to `Failed`.
    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                log::warn!("{}: failed to poll process status: {e}", self.name());
                true
            }
        }
    }

    pub fn exit_description(&self) -> String {
        match self.exit_status {
            Some(status) => format!("process exited ({status})"),
            None => "process is not running".to_string(),
        }
    }

    pub fn unexpected_exit(&self) -> Option<LaunchError> {
        match (self.state, self.exit_status) {
            (ProcessState::Failed, Some(status)) => Some(LaunchError::UnexpectedExit {
                service: self.spec.name.clone(),
                status,
            }),
            _ => None,
        }
    }

    pub fn mark_ready(&mut self) {
        if self.state == ProcessState::Starting {
            self.state = ProcessState::Ready;
        }
    }

    pub fn mark_running(&mut self) {
        if self.state == ProcessState::Ready {
            self.state = ProcessState::Running;
        }
    }

    /// Readiness was never reached (timeout, cancellation or interrupt).
    pub fn mark_failed(&mut self) {
        if self.state == ProcessState::Starting {
            self.state = ProcessState::Failed;
        }
    }

    /// Stop the process: SIGTERM, wait up to `grace`, then kill.
    pub async fn stop(&mut self, grace: Duration) -> Result<StopOutcome> {
        self.stop_or_escalate(grace, std::future::pending()).await
    }

    /// Like [`stop`](Self::stop), but skips the rest of the grace period as soon as
    /// `escalate` resolves.
    pub async fn stop_or_escalate<F>(&mut self, grace: Duration, escalate: F) -> Result<StopOutcome>
    where
        F: Future<Output = ()>,
    {
        if !self.is_alive() {
            self.kill_stragglers();
            self.drain_output().await;
            return Ok(StopOutcome::AlreadyExited);
        }

        self.state = ProcessState::Stopping;

        if self.request_termination() {
            tokio::pin!(escalate);
            let waited = tokio::select! {
                status = self.child.wait() => Some(status),
                _ = tokio::time::sleep(grace) => None,
                _ = &mut escalate => {
                    log::warn!("{}: skipping remaining grace period", self.spec.name);
                    None
                }
            };

            match waited {
                Some(Ok(status)) => {
                    self.record_exit(status);
                    self.kill_stragglers();
                    self.drain_output().await;
                    return Ok(StopOutcome::Graceful);
                }
                Some(Err(e)) => {
                    log::warn!("{}: failed waiting for exit: {e}", self.spec.name);
                }
                None => {
                    log::warn!(
                        "{} did not exit within {grace:?}, killing it",
                        self.spec.name
                    );
                }
            }
        }

        self.signal_group(Signal::Kill);
        match self.child.kill().await {
            Ok(()) => {
                if let Ok(Some(status)) = self.child.try_wait() {
                    self.record_exit(status);
                }
                self.state = ProcessState::Stopped;
                self.drain_output().await;
                Ok(StopOutcome::Forced)
            }
            Err(e) => {
                if let Ok(Some(status)) = self.child.try_wait() {
                    self.record_exit(status);
                    self.drain_output().await;
                    return Ok(StopOutcome::Graceful);
                }
                Err(LaunchError::shutdown(&self.spec.name, e.to_string()))
            }
        }
    }

    /// Send SIGTERM to the service's process group; returns false when no
    /// graceful request could be delivered.
    fn request_termination(&mut self) -> bool {
        self.signal_group(Signal::Term)
    }

    /// Kill whatever is left in the process group once the leader has exited.
    fn kill_stragglers(&mut self) {
        if self.group_alive() {
            log::info!(
                "{}: killing processes left in its group after exit",
                self.spec.name
            );
            self.signal_group(Signal::Kill);
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: Signal) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal as NixSignal};

        let Some(pgid) = self.process_group() else {
            return false;
        };
        let nix_signal = match signal {
            Signal::Term => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
        };

        match killpg(pgid, nix_signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) => {
                log::debug!(
                    "{}: process group already gone before {signal:?}",
                    self.spec.name
                );
                true
            }
            Err(e) => {
                log::warn!(
                    "{}: failed to send {signal:?} to its group: {e}",
                    self.spec.name
                );
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _signal: Signal) -> bool {
        false
    }

    #[cfg(unix)]
    fn group_alive(&self) -> bool {
        self.process_group()
            .is_some_and(|pgid| nix::sys::signal::killpg(pgid, None).is_ok())
    }

    #[cfg(not(unix))]
    fn group_alive(&self) -> bool {
        false
    }

    /// The group is the one created at spawn, so its id is the leader's pid.
    #[cfg(unix)]
    fn process_group(&self) -> Option<nix::unistd::Pid> {
        self.pid
            .and_then(|pid| i32::try_from(pid).ok())
            .map(nix::unistd::Pid::from_raw)
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.exit_status = Some(status);
        self.state = match self.state {
            ProcessState::Stopping | ProcessState::Stopped => ProcessState::Stopped,
            _ => {
                log::warn!("{} exited unexpectedly ({status})", self.spec.name);
                ProcessState::Failed
            }
        };
    }

    async fn drain_output(&mut self) {
        for mut reader in self.readers.drain(..) {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader)
                .await
                .is_err()
            {
                // A grandchild still holds the pipe open.
                reader.abort();
            }
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.spec.name)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("started_at", &self.started_at)
            .field("exit_status", &self.exit_status)
            .finish()
    }
}

fn spawn_reader<R>(
    service: String,
    stream: R,
    kind: OutputStream,
    output: SharedOutput,
    sink: Option<Arc<LogSink>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        capture_lines(
            &service,
            BufReader::new(stream),
            kind,
            &output,
            sink.as_deref(),
        )
        .await;
    })
}
