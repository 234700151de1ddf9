//! Event stream and status snapshot consumed by front ends
//!
//! The supervisor never assumes a delivery thread: log lines, progress,
//! state changes and alerts go out on a broadcast channel, and the latest
//! status is available through a watch channel.

use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Default capacity of the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Lifecycle state of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No processes owned
    Stopped,
    /// Start sequence in progress
    Starting,
    /// Proxy and backend both up, timers active
    Running,
    /// Backend down with proxy up, recovery in progress
    Degraded,
    /// Stop sequence in progress
    Stopping,
    /// Backend recovery exhausted; manual restart required
    Failed,
}

/// Snapshot of the supervisor for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub proxy_alive: bool,
    pub backend_alive: bool,
    pub proxy_pid: Option<u32>,
    pub backend_pid: Option<u32>,
    pub recycle_count: u64,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: SupervisorState::Stopped,
            proxy_alive: false,
            backend_alive: false,
            proxy_pid: None,
            backend_pid: None,
            recycle_count: 0,
        }
    }
}

/// Origin of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Supervisor,
    Proxy,
    ProxyError,
    Backend,
    BackendError,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Supervisor => "supervisor",
            LogSource::Proxy => "proxy",
            LogSource::ProxyError => "proxy-error",
            LogSource::Backend => "backend",
            LogSource::BackendError => "backend-error",
        }
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A timestamped log line
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub timestamp: DateTime<Local>,
    pub source: LogSource,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.source,
            self.message
        )
    }
}

/// Steps of the start sequence, reported as progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStep {
    Validate,
    Cleanup,
    PortCheck,
    WebRoot,
    ProxyConfig,
    ProxyStart,
    BackendStart,
    Timers,
    Done,
}

impl StartStep {
    pub fn percent(&self) -> u8 {
        match self {
            StartStep::Validate => 20,
            StartStep::Cleanup => 30,
            StartStep::PortCheck => 40,
            StartStep::WebRoot => 50,
            StartStep::ProxyConfig => 60,
            StartStep::ProxyStart => 70,
            StartStep::BackendStart => 80,
            StartStep::Timers => 90,
            StartStep::Done => 100,
        }
    }
}

/// High-visibility notice that needs a human
#[derive(Debug, Clone)]
pub struct Alert {
    pub timestamp: DateTime<Local>,
    pub title: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Log(LogEvent),
    Progress { step: StartStep, percent: u8 },
    StateChanged { from: SupervisorState, to: SupervisorState },
    Alert(Alert),
}

/// Publishes events to all subscribers and mirrors them into `tracing`
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }

    /// Send an event; having no subscribers is not an error
    pub fn emit(&self, event: SupervisorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn log(&self, source: LogSource, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!(source = source.as_str(), "{}", message),
            LogLevel::Warn => warn!(source = source.as_str(), "{}", message),
            LogLevel::Error => error!(source = source.as_str(), "{}", message),
        }
        self.emit(SupervisorEvent::Log(LogEvent {
            timestamp: Local::now(),
            source,
            level,
            message,
        }));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogSource::Supervisor, LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogSource::Supervisor, LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogSource::Supervisor, LogLevel::Error, message);
    }

    pub fn progress(&self, step: StartStep) {
        self.emit(SupervisorEvent::Progress {
            step,
            percent: step.percent(),
        });
    }

    pub fn alert(&self, title: impl Into<String>, message: impl Into<String>) {
        let title = title.into();
        let message = message.into();
        error!(%title, "ALERT: {}", message);
        self.emit(SupervisorEvent::Alert(Alert {
            timestamp: Local::now(),
            title,
            message,
        }));
    }
}
