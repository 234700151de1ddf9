use crate::error::SupervisorError;
use crate::events::{EventSink, LogLevel, LogSource};
use crate::registry::SharedRegistry;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Interval for polling the process table while waiting for a kill to land
const KILL_POLL_INTERVAL_MS: u64 = 50;

/// Which half of the two-tier service a process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    /// Front-end reverse proxy
    Proxy,
    /// Application server behind the proxy
    Backend,
}

impl ProcessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessRole::Proxy => "proxy",
            ProcessRole::Backend => "backend",
        }
    }

    /// Log tag for standard output lines
    pub fn output_source(&self) -> LogSource {
        match self {
            ProcessRole::Proxy => LogSource::Proxy,
            ProcessRole::Backend => LogSource::Backend,
        }
    }

    /// Log tag for standard error lines
    pub fn error_source(&self) -> LogSource {
        match self {
            ProcessRole::Proxy => LogSource::ProxyError,
            ProcessRole::Backend => LogSource::BackendError,
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a process is asked to quit before it is killed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GracefulStop {
    /// Run the same executable again with these arguments (e.g. `-s quit`)
    QuitCommand(Vec<String>),
    /// Send SIGTERM (no-op on platforms without signals)
    Terminate,
    /// Go straight to the forced kill
    None,
}

/// Everything needed to launch one supervised process
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub role: ProcessRole,
    pub executable: PathBuf,
    pub working_dir: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub graceful_stop: GracefulStop,
}

impl ProcessSpec {
    /// Name the process shows up under in the OS process table
    pub fn image_name(&self) -> String {
        self.executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Lifecycle of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    /// Exited with the given code (None when killed by a signal or unknown)
    Exited(Option<i32>),
    /// A forced kill could not be delivered
    KillFailed,
}

/// One OS process owned by the supervisor
pub struct SupervisedProcess {
    spec: ProcessSpec,
    child: Option<Child>,
    pid: Option<u32>,
    state: RunState,
    registry: SharedRegistry,
    events: EventSink,
}

impl SupervisedProcess {
    pub fn new(spec: ProcessSpec, registry: SharedRegistry, events: EventSink) -> Self {
        Self {
            spec,
            child: None,
            pid: None,
            state: RunState::NotStarted,
            registry,
            events,
        }
    }

    /// Launch the process and confirm it survives `confirm_after`
    ///
    /// A process that has already exited when that delay elapses is a spawn
    /// failure, not a running instance.
    pub async fn start(&mut self, confirm_after: Duration) -> Result<u32, SupervisorError> {
        let role = self.spec.role;
        info!(role = %role, executable = %self.spec.executable.display(), "Starting process");

        let mut cmd = Command::new(&self.spec.executable);
        cmd.args(&self.spec.args);
        cmd.current_dir(&self.spec.working_dir);
        cmd.envs(&self.spec.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| SupervisorError::Spawn {
            role,
            reason: e.to_string(),
        })?;
        let pid = child.id().unwrap_or(0);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, role.output_source(), self.events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, role.error_source(), self.events.clone()));
        }

        tokio::time::sleep(confirm_after).await;

        match child.try_wait() {
            Ok(None) => {
                self.child = Some(child);
                self.pid = Some(pid);
                self.state = RunState::Running;
                self.events
                    .info(format!("✓ {} started successfully (PID: {})", role, pid));
                Ok(pid)
            }
            Ok(Some(status)) => {
                self.state = RunState::Exited(status.code());
                Err(SupervisorError::Spawn {
                    role,
                    reason: format!("process exited immediately ({})", status),
                })
            }
            Err(e) => {
                let _ = child.start_kill();
                Err(SupervisorError::Spawn {
                    role,
                    reason: format!("could not query process state: {}", e),
                })
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Whether the process is still up
    ///
    /// Falls back to scanning the process table by executable name, so a
    /// same-named process started outside this handle also counts.
    pub fn is_alive(&mut self) -> bool {
        if self.own_child_alive() {
            return true;
        }
        !self.registry.find_by_name(&self.spec.image_name()).is_empty()
    }

    fn own_child_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(role = %self.spec.role, ?status, "Process has exited");
                self.state = RunState::Exited(status.code());
                self.child = None;
                false
            }
            Err(e) => {
                warn!(role = %self.spec.role, error = %e, "Error querying process state");
                false
            }
        }
    }

    /// Stop the process and any same-named strays
    ///
    /// With `graceful`, the quiet-shutdown mechanism runs first and gets
    /// `grace` to take effect. A forced kill always follows for whatever is
    /// left, each bounded by `kill_timeout`. Failures are logged, never
    /// returned.
    pub async fn terminate(&mut self, graceful: bool, grace: Duration, kill_timeout: Duration) {
        let role = self.spec.role;

        if graceful {
            self.request_quit(grace).await;
        }

        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!(role = %role, ?status, "Process exited gracefully");
                    self.state = RunState::Exited(status.code());
                }
                _ => {
                    if let Err(e) = child.start_kill() {
                        self.events
                            .warn(format!("Failed to kill {} process: {}", role, e));
                        self.state = RunState::KillFailed;
                    }
                    match tokio::time::timeout(kill_timeout, child.wait()).await {
                        Ok(Ok(status)) => {
                            debug!(role = %role, ?status, "Process killed");
                            self.state = RunState::Exited(status.code());
                        }
                        Ok(Err(e)) => {
                            warn!(role = %role, error = %e, "Error waiting for process to exit");
                        }
                        Err(_) => {
                            self.events.warn(format!(
                                "{} did not exit within {}ms of being killed",
                                role,
                                kill_timeout.as_millis()
                            ));
                            self.state = RunState::KillFailed;
                        }
                    }
                }
            }
        }

        let failures =
            kill_by_name(&self.registry, &self.spec.image_name(), kill_timeout, &self.events).await;
        if failures > 0 {
            self.state = RunState::KillFailed;
        } else if self.state == RunState::Running || self.state == RunState::NotStarted {
            self.state = RunState::Exited(None);
        }

        self.events.info(format!("✓ {} stopped", role));
    }

    async fn request_quit(&mut self, grace: Duration) {
        let role = self.spec.role;
        match &self.spec.graceful_stop {
            GracefulStop::None => {}
            GracefulStop::Terminate => {
                #[cfg(unix)]
                {
                    if let Some(pid) = self.child.as_ref().and_then(|c| c.id()) {
                        info!(role = %role, pid, "Sending SIGTERM");
                        unsafe {
                            libc::kill(pid as i32, libc::SIGTERM);
                        }
                    }
                }
                self.wait_own_child(grace).await;
            }
            GracefulStop::QuitCommand(args) => {
                info!(role = %role, ?args, "Requesting quiet shutdown");
                let start = Instant::now();
                let mut cmd = Command::new(&self.spec.executable);
                cmd.args(args);
                cmd.current_dir(&self.spec.working_dir);
                cmd.stdin(Stdio::null());
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
                cmd.kill_on_drop(true);

                match cmd.spawn() {
                    Ok(mut quit) => {
                        if tokio::time::timeout(grace, quit.wait()).await.is_err() {
                            self.events
                                .warn(format!("{} quit command did not finish in time", role));
                        }
                    }
                    Err(e) => {
                        self.events
                            .warn(format!("Could not run {} quit command: {}", role, e));
                    }
                }

                self.wait_own_child(grace.saturating_sub(start.elapsed())).await;
            }
        }
    }

    async fn wait_own_child(&mut self, limit: Duration) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        if let Ok(Ok(status)) = tokio::time::timeout(limit, child.wait()).await {
            debug!(role = %self.spec.role, ?status, "Process exited after quit request");
        }
    }
}

/// Kill every process listed under `name`, waiting up to `timeout` for each
///
/// Returns the number of processes that could not be killed.
pub async fn kill_by_name(
    registry: &SharedRegistry,
    name: &str,
    timeout: Duration,
    events: &EventSink,
) -> usize {
    let mut failures = 0;

    for entry in registry.find_by_name(name) {
        if !registry.kill(entry.pid) {
            events.warn(format!("Failed to kill {} process (PID: {})", name, entry.pid));
            failures += 1;
            continue;
        }

        let deadline = Instant::now() + timeout;
        while registry.is_running(entry.pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(KILL_POLL_INTERVAL_MS)).await;
        }

        if registry.is_running(entry.pid) {
            events.warn(format!(
                "{} process (PID: {}) still running after kill",
                name, entry.pid
            ));
            failures += 1;
        } else {
            events.info(format!("Killed {} process (PID: {})", name, entry.pid));
        }
    }

    failures
}

/// Forward each non-empty output line as a log event
async fn forward_lines<R>(reader: R, source: LogSource, events: EventSink)
where
    R: AsyncRead + Unpin,
{
    let level = match source {
        LogSource::ProxyError | LogSource::BackendError => LogLevel::Error,
        _ => LogLevel::Info,
    };
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    events.log(source, level, line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(source = source.as_str(), error = %e, "Output stream closed");
                break;
            }
        }
    }
}
