//! Process supervisor: one serialized control loop owning both processes
//!
//! Every mutating operation (start, stop, recycle, health evaluation) arrives
//! as a [`Command`] on a single channel and runs to completion before the next
//! one is taken. Timers and callers only enqueue commands.

use crate::config::{Config, Timings};
use crate::error::SupervisorError;
use crate::events::{
    EventSink, StartStep, SupervisorEvent, SupervisorState, SupervisorStatus,
    EVENT_CHANNEL_CAPACITY,
};
use crate::health::HealthMonitor;
use crate::ports::{PortWaiter, SharedPortTable};
use crate::process::{
    kill_by_name, GracefulStop, ProcessRole, ProcessSpec, RunState, SupervisedProcess,
};
use crate::proxy_conf;
use crate::registry::SharedRegistry;
use crate::scheduler::{RestartScheduler, TimerHandle};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Queued commands before senders start waiting (or timers start dropping ticks)
const COMMAND_CHANNEL_CAPACITY: usize = 32;

type Reply = oneshot::Sender<Result<Outcome, SupervisorError>>;

/// Result of a successful supervisor operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Started,
    /// `start` while already running; nothing was spawned
    AlreadyRunning,
    Stopped,
    /// `stop` while already stopped
    AlreadyStopped,
    /// Backend recycled; `count` is the recycle counter after this one
    Recycled { count: u64 },
    /// Recycle requested while not running; nothing was done
    NotRunning,
}

/// What asked for a backend recycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleTrigger {
    /// Caller asked for an immediate recycle
    Manual,
    /// Periodic recycle from the restart scheduler
    Scheduled,
    /// Health check found the backend down
    Recovery,
}

impl fmt::Display for RecycleTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecycleTrigger::Manual => f.write_str("manual"),
            RecycleTrigger::Scheduled => f.write_str("scheduled"),
            RecycleTrigger::Recovery => f.write_str("recovery"),
        }
    }
}

pub(crate) enum Command {
    Start(Reply),
    Stop(Reply),
    Recycle {
        trigger: RecycleTrigger,
        reply: Option<Reply>,
    },
    HealthCheck {
        reply: Option<oneshot::Sender<SupervisorStatus>>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Non-owning way for timers to enqueue commands
///
/// Holds a weak sender so a running timer never keeps the control loop alive
/// after every [`SupervisorHandle`] is gone.
#[derive(Clone)]
pub struct Trigger {
    tx: mpsc::WeakSender<Command>,
}

impl Trigger {
    pub(crate) fn new(tx: mpsc::WeakSender<Command>) -> Self {
        Self { tx }
    }

    /// Enqueue without waiting; returns false if the command was dropped
    pub(crate) fn send(&self, command: Command) -> bool {
        let Some(tx) = self.tx.upgrade() else {
            debug!("Control loop is gone, dropping timer command");
            return false;
        };
        match tx.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Control loop is busy, dropping timer command");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Cloneable front end to a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<SupervisorStatus>,
    events: EventSink,
}

impl SupervisorHandle {
    /// Run the start sequence; a no-op while already running
    pub async fn start(&self) -> Result<Outcome, SupervisorError> {
        self.request(Command::Start).await
    }

    /// Run the stop sequence; a no-op while already stopped
    pub async fn stop(&self) -> Result<Outcome, SupervisorError> {
        self.request(Command::Stop).await
    }

    /// Recycle the backend immediately, outside the regular schedule
    pub async fn recycle_backend_now(&self) -> Result<Outcome, SupervisorError> {
        self.request(|reply| Command::Recycle {
            trigger: RecycleTrigger::Manual,
            reply: Some(reply),
        })
        .await
    }

    /// Evaluate liveness now, recovering the backend if needed
    ///
    /// Returns the status once the evaluation (and any recovery it started)
    /// has finished.
    pub async fn check_health(&self) -> Result<SupervisorStatus, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::HealthCheck { reply: Some(reply) })
            .await
            .map_err(|_| SupervisorError::LoopClosed)?;
        rx.await.map_err(|_| SupervisorError::LoopClosed)
    }

    /// Stop both processes and end the control loop
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(reply))
            .await
            .map_err(|_| SupervisorError::LoopClosed)?;
        rx.await.map_err(|_| SupervisorError::LoopClosed)
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    async fn request<F>(&self, make: F) -> Result<Outcome, SupervisorError>
    where
        F: FnOnce(Reply) -> Command,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SupervisorError::LoopClosed)?;
        rx.await.map_err(|_| SupervisorError::LoopClosed)?
    }
}

/// Periods of the health monitor and restart scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerPeriods {
    pub(crate) health: Duration,
    pub(crate) recycle: Duration,
}

impl TimerPeriods {
    fn from_config(config: &Config) -> Self {
        Self {
            health: config.supervisor.health_check_interval(),
            recycle: config.supervisor.recycle_interval(),
        }
    }
}

pub struct Supervisor {
    config: Config,
    periods: TimerPeriods,
    status: SupervisorStatus,
    proxy: Option<SupervisedProcess>,
    backend: Option<SupervisedProcess>,
    registry: SharedRegistry,
    ports: PortWaiter,
    events: EventSink,
    status_tx: watch::Sender<SupervisorStatus>,
    commands: mpsc::WeakSender<Command>,
    timers: Vec<TimerHandle>,
    health_pending: Arc<AtomicBool>,
}

impl Supervisor {
    /// Start the control loop on the current runtime
    ///
    /// The loop stops both processes and exits once every handle is dropped.
    pub fn spawn(
        config: Config,
        registry: SharedRegistry,
        port_table: SharedPortTable,
    ) -> SupervisorHandle {
        let periods = TimerPeriods::from_config(&config);
        Self::spawn_with_periods(config, registry, port_table, periods)
    }

    /// Like [`Supervisor::spawn`], with timer periods finer than the config allows
    pub(crate) fn spawn_with_periods(
        config: Config,
        registry: SharedRegistry,
        port_table: SharedPortTable,
        periods: TimerPeriods,
    ) -> SupervisorHandle {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(SupervisorStatus::default());
        let events = EventSink::new(EVENT_CHANNEL_CAPACITY);

        let supervisor = Supervisor {
            config,
            periods,
            status: SupervisorStatus::default(),
            proxy: None,
            backend: None,
            registry,
            ports: PortWaiter::new(port_table),
            events: events.clone(),
            status_tx,
            commands: tx.downgrade(),
            timers: Vec::new(),
            health_pending: Arc::new(AtomicBool::new(false)),
        };
        tokio::spawn(supervisor.run(rx));

        SupervisorHandle {
            tx,
            status: status_rx,
            events,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!("Supervisor control loop started");

        while let Some(command) = rx.recv().await {
            match command {
                Command::Start(reply) => {
                    let result = self.handle_start().await;
                    let _ = reply.send(result);
                }
                Command::Stop(reply) => {
                    let result = self.handle_stop().await;
                    let _ = reply.send(result);
                }
                Command::Recycle { trigger, reply } => {
                    let result = self.handle_recycle(trigger).await;
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                debug!(%trigger, error = %e, "Recycle finished with error");
                            }
                        }
                    }
                }
                Command::HealthCheck { reply } => {
                    self.handle_health_check().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(self.status.clone());
                    }
                }
                Command::Shutdown(reply) => {
                    if self.status.state != SupervisorState::Stopped {
                        self.stop_sequence().await;
                    }
                    let _ = reply.send(());
                    debug!("Supervisor control loop shut down");
                    return;
                }
            }
        }

        if self.status.state != SupervisorState::Stopped {
            info!("All supervisor handles dropped, stopping servers");
            self.stop_sequence().await;
        }
        debug!("Supervisor control loop finished");
    }

    async fn handle_start(&mut self) -> Result<Outcome, SupervisorError> {
        match self.status.state {
            SupervisorState::Running | SupervisorState::Degraded => {
                self.events.info("Servers are already running");
                return Ok(Outcome::AlreadyRunning);
            }
            SupervisorState::Failed => {
                self.events
                    .warn("Clearing failed state before restarting servers");
                self.stop_sequence().await;
            }
            _ => {}
        }

        self.set_state(SupervisorState::Starting);
        self.events.info("=== Starting servers ===");

        if let Err(e) = self.start_sequence().await {
            self.events.error(format!("Failed to start servers: {}", e));
            self.rollback().await;
            self.set_state(SupervisorState::Stopped);
            return Err(e);
        }

        self.start_timers();
        self.events.progress(StartStep::Timers);
        self.set_state(SupervisorState::Running);
        self.events.progress(StartStep::Done);
        self.events.info("=== All servers started successfully ===");
        Ok(Outcome::Started)
    }

    async fn start_sequence(&mut self) -> Result<(), SupervisorError> {
        let timings = self.config.timings.clone();
        let listen_port = self.config.supervisor.listen_port;
        let backend_port = self.config.supervisor.backend_port;

        self.events.progress(StartStep::Validate);
        self.validate_installation()?;

        self.events.progress(StartStep::Cleanup);
        self.events.info("Cleaning up leftover processes...");
        for role in [ProcessRole::Proxy, ProcessRole::Backend] {
            let name = self.spec_for(role).image_name();
            kill_by_name(
                &self.registry,
                &name,
                Timings::ms(timings.kill_timeout_ms),
                &self.events,
            )
            .await;
        }
        tokio::time::sleep(Timings::ms(timings.stray_settle_ms)).await;

        self.events.progress(StartStep::PortCheck);
        self.events
            .info(format!("Waiting for port {} to be available...", listen_port));
        let available = self
            .ports
            .wait_until_available(
                listen_port,
                timings.port_wait_retries,
                Timings::ms(timings.port_wait_delay_ms),
            )
            .await;
        if !available {
            return Err(SupervisorError::PortConflict { port: listen_port });
        }

        self.events.progress(StartStep::WebRoot);
        let web_root = self.config.proxy.web_root_dir();
        match proxy_conf::ensure_web_root(&web_root) {
            Ok(true) => self
                .events
                .info(format!("Created web root {}", web_root.display())),
            Ok(false) => {}
            Err(source) => {
                return Err(SupervisorError::Filesystem {
                    path: web_root,
                    source,
                })
            }
        }
        if let Err(e) = proxy_conf::grant_read_execute(&web_root) {
            self.events.warn(format!(
                "Could not set permissions on {}: {}",
                web_root.display(),
                e
            ));
        }

        self.events.progress(StartStep::ProxyConfig);
        let conf_path = self.config.proxy.config_file();
        proxy_conf::write(&conf_path, listen_port, backend_port).map_err(|source| {
            SupervisorError::Filesystem {
                path: conf_path.clone(),
                source,
            }
        })?;
        debug!(path = %conf_path.display(), "Proxy configuration written");

        self.events.progress(StartStep::ProxyStart);
        self.spawn_role(ProcessRole::Proxy).await?;
        tokio::time::sleep(Timings::ms(timings.proxy_settle_ms)).await;

        self.events.progress(StartStep::BackendStart);
        self.spawn_role(ProcessRole::Backend).await?;

        Ok(())
    }

    fn validate_installation(&self) -> Result<(), SupervisorError> {
        self.config
            .validate()
            .map_err(|e| SupervisorError::InvalidConfig(e.to_string()))?;

        let proxy = &self.config.proxy;
        let backend = &self.config.backend;
        let checks = [
            ("proxy directory", proxy.root.clone(), true),
            ("proxy executable", proxy.executable_path(), false),
            ("backend directory", backend.root.clone(), true),
            ("backend executable", backend.executable_path(), false),
        ];
        for (what, path, is_dir) in checks {
            let present = if is_dir { path.is_dir() } else { path.is_file() };
            if !present {
                return Err(SupervisorError::MissingPath { what, path });
            }
        }
        Ok(())
    }

    /// Terminate whatever the failed start sequence already launched
    async fn rollback(&mut self) {
        if self.backend.is_some() {
            self.terminate_role(ProcessRole::Backend).await;
        }
        if self.proxy.is_some() {
            self.terminate_role(ProcessRole::Proxy).await;
        }
    }

    async fn handle_stop(&mut self) -> Result<Outcome, SupervisorError> {
        if self.status.state == SupervisorState::Stopped {
            self.events.info("Servers are not running");
            return Ok(Outcome::AlreadyStopped);
        }
        self.stop_sequence().await;
        Ok(Outcome::Stopped)
    }

    /// Always reaches `Stopped`; individual failures are only logged
    async fn stop_sequence(&mut self) {
        self.set_state(SupervisorState::Stopping);
        self.events.info("=== Stopping servers ===");

        self.cancel_timers();
        self.terminate_role(ProcessRole::Backend).await;
        self.terminate_role(ProcessRole::Proxy).await;

        self.set_state(SupervisorState::Stopped);
        self.events.info("=== All servers stopped ===");
    }

    async fn handle_recycle(&mut self, trigger: RecycleTrigger) -> Result<Outcome, SupervisorError> {
        match self.status.state {
            SupervisorState::Running | SupervisorState::Degraded => {
                self.recycle_backend(trigger).await
            }
            state => {
                if trigger == RecycleTrigger::Manual {
                    self.events
                        .warn(format!("Cannot recycle backend while {:?}", state));
                } else {
                    debug!(%trigger, ?state, "Ignoring recycle while not running");
                }
                Ok(Outcome::NotRunning)
            }
        }
    }

    /// Replace the backend process, retrying the launch once
    ///
    /// The state stays `Running` (or `Degraded`) for the whole operation, so
    /// subscribers briefly see `backend_alive == false` between the old
    /// backend's termination and the new one's confirmed launch. The window
    /// closes before this returns: either the new pid is published or the
    /// state moves to `Failed`.
    async fn recycle_backend(
        &mut self,
        trigger: RecycleTrigger,
    ) -> Result<Outcome, SupervisorError> {
        let timings = self.config.timings.clone();
        let backend_port = self.config.supervisor.backend_port;

        self.status.recycle_count += 1;
        let count = self.status.recycle_count;
        self.publish();
        self.events
            .info(format!("=== Backend restart #{} ({}) ===", count, trigger));

        self.terminate_role(ProcessRole::Backend).await;
        tokio::time::sleep(Timings::ms(timings.recycle_settle_ms)).await;

        let freed = self
            .ports
            .wait_until_available(
                backend_port,
                timings.recycle_port_retries,
                Timings::ms(timings.recycle_port_delay_ms),
            )
            .await;
        if !freed {
            self.events.warn(format!(
                "Port {} may still be in use, starting backend anyway",
                backend_port
            ));
        }

        if let Err(first) = self.spawn_role(ProcessRole::Backend).await {
            self.events.warn(format!(
                "Backend restart failed ({}), retrying in {}ms",
                first, timings.recycle_retry_backoff_ms
            ));
            tokio::time::sleep(Timings::ms(timings.recycle_retry_backoff_ms)).await;

            if let Err(second) = self.spawn_role(ProcessRole::Backend).await {
                self.enter_failed(&second);
                return Err(SupervisorError::Failed(second.to_string()));
            }
        }

        if self.status.state == SupervisorState::Degraded {
            self.set_state(SupervisorState::Running);
        }
        self.events
            .info(format!("✓ Backend restart #{} complete", count));
        Ok(Outcome::Recycled { count })
    }

    fn enter_failed(&mut self, error: &SupervisorError) {
        self.cancel_timers();
        self.set_state(SupervisorState::Failed);
        self.events.alert(
            "Backend recovery failed",
            format!(
                "The backend could not be restarted: {}. Restart the servers manually.",
                error
            ),
        );
    }

    async fn handle_health_check(&mut self) {
        self.health_pending.store(false, Ordering::SeqCst);

        if !matches!(
            self.status.state,
            SupervisorState::Running | SupervisorState::Degraded
        ) {
            debug!(state = ?self.status.state, "Skipping health check while not running");
            return;
        }

        let proxy_was_alive = self.status.proxy_alive;
        let proxy_alive = self.role_alive(ProcessRole::Proxy);
        let backend_alive = self.role_alive(ProcessRole::Backend);

        self.status.proxy_alive = proxy_alive;
        self.status.backend_alive = backend_alive;
        if !proxy_alive {
            self.status.proxy_pid = None;
        }
        if !backend_alive {
            self.status.backend_pid = None;
        }
        self.publish();
        debug!(proxy_alive, backend_alive, "Health check");

        if !proxy_alive && proxy_was_alive {
            self.events
                .error("Proxy is not running; restart the servers to recover it");
        }

        if !backend_alive {
            if proxy_alive {
                self.events.warn("Backend is not running, restarting it");
                self.set_state(SupervisorState::Degraded);
                if let Err(e) = self.recycle_backend(RecycleTrigger::Recovery).await {
                    debug!(error = %e, "Backend recovery failed");
                }
            } else {
                self.events
                    .warn("Backend is not running and the proxy is down as well");
            }
        }
    }

    fn role_alive(&mut self, role: ProcessRole) -> bool {
        let slot = match role {
            ProcessRole::Proxy => &mut self.proxy,
            ProcessRole::Backend => &mut self.backend,
        };
        match slot.as_mut() {
            Some(process) => process.is_alive(),
            None => false,
        }
    }

    /// Launch one process and record it, even when the launch fails
    async fn spawn_role(&mut self, role: ProcessRole) -> Result<u32, SupervisorError> {
        let confirm_after = Timings::ms(self.config.timings.spawn_confirm_ms);
        let mut process = self.new_process(role);
        let result = process.start(confirm_after).await;

        let started = result.as_ref().ok().copied();
        match role {
            ProcessRole::Proxy => {
                self.proxy = Some(process);
                self.status.proxy_alive = started.is_some();
                self.status.proxy_pid = started;
            }
            ProcessRole::Backend => {
                self.backend = Some(process);
                self.status.backend_alive = started.is_some();
                self.status.backend_pid = started;
            }
        }
        self.publish();
        result
    }

    /// Gracefully then forcibly stop one role, sweeping same-named strays
    async fn terminate_role(&mut self, role: ProcessRole) {
        let timings = &self.config.timings;
        let kill_timeout = Timings::ms(timings.kill_timeout_ms);
        let (existing, grace) = match role {
            ProcessRole::Proxy => (self.proxy.take(), timings.proxy_quit_timeout_ms),
            ProcessRole::Backend => (self.backend.take(), timings.backend_grace_ms),
        };

        let mut process = existing.unwrap_or_else(|| self.new_process(role));
        process
            .terminate(true, Timings::ms(grace), kill_timeout)
            .await;
        if process.state() == RunState::KillFailed {
            self.events
                .warn(format!("{} may still be running after stop", role));
        }

        match role {
            ProcessRole::Proxy => {
                self.status.proxy_alive = false;
                self.status.proxy_pid = None;
            }
            ProcessRole::Backend => {
                self.status.backend_alive = false;
                self.status.backend_pid = None;
            }
        }
        self.publish();
    }

    fn new_process(&self, role: ProcessRole) -> SupervisedProcess {
        SupervisedProcess::new(
            self.spec_for(role),
            self.registry.clone(),
            self.events.clone(),
        )
    }

    fn spec_for(&self, role: ProcessRole) -> ProcessSpec {
        match role {
            ProcessRole::Proxy => {
                let proxy = &self.config.proxy;
                let graceful_stop = if proxy.quit_args.is_empty() {
                    GracefulStop::Terminate
                } else {
                    GracefulStop::QuitCommand(proxy.quit_args.clone())
                };
                ProcessSpec {
                    role,
                    executable: proxy.executable_path(),
                    working_dir: proxy.root.clone(),
                    args: proxy.args.clone(),
                    env: proxy.env.clone(),
                    graceful_stop,
                }
            }
            ProcessRole::Backend => {
                let backend = &self.config.backend;
                ProcessSpec {
                    role,
                    executable: backend.executable_path(),
                    working_dir: backend.root.clone(),
                    args: backend.resolved_args(self.config.supervisor.backend_port),
                    env: backend.resolved_env(),
                    graceful_stop: GracefulStop::Terminate,
                }
            }
        }
    }

    fn start_timers(&mut self) {
        self.cancel_timers();
        let trigger = Trigger::new(self.commands.clone());

        let health = HealthMonitor::new(
            self.periods.health,
            trigger.clone(),
            Arc::clone(&self.health_pending),
        );
        self.timers.push(health.spawn());

        let scheduler = RestartScheduler::new(self.periods.recycle, trigger);
        self.timers.push(scheduler.spawn());
    }

    fn cancel_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.cancel();
        }
        self.health_pending.store(false, Ordering::SeqCst);
    }

    fn set_state(&mut self, to: SupervisorState) {
        let from = self.status.state;
        if from == to {
            return;
        }
        self.status.state = to;
        self.publish();
        info!(?from, ?to, "Supervisor state changed");
        self.events.emit(SupervisorEvent::StateChanged { from, to });
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recycle_trigger_display() {
        assert_eq!(RecycleTrigger::Manual.to_string(), "manual");
        assert_eq!(RecycleTrigger::Scheduled.to_string(), "scheduled");
        assert_eq!(RecycleTrigger::Recovery.to_string(), "recovery");
    }

    #[tokio::test]
    async fn test_trigger_without_loop_drops_command() {
        let (tx, rx) = mpsc::channel(1);
        let trigger = Trigger::new(tx.downgrade());
        drop(rx);
        assert!(!trigger.send(Command::HealthCheck { reply: None }));

        drop(tx);
        assert!(!trigger.send(Command::HealthCheck { reply: None }));
    }

    #[tokio::test]
    async fn test_trigger_drops_when_queue_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let trigger = Trigger::new(tx.downgrade());

        assert!(trigger.send(Command::HealthCheck { reply: None }));
        assert!(!trigger.send(Command::HealthCheck { reply: None }));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
