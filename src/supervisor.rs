//! Per-instance supervisor: a single worker thread owns the lifecycle state machine
//! and consumes commands, exit notifications and timer events from one queue.
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;
use std::{
    fmt,
    mem,
    process::Child,
    sync::{
        Arc, Mutex, RwLock,
        mpsc::{self, Receiver, Sender},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, error, info, warn};

use crate::{
    config::AppSpec,
    constants::{MEMORY_SAMPLE_INTERVAL, POST_KILL_GRACE},
    cron::Ticker,
    error::{ErrorReport, ProcessManagerError},
    logs::{LogSink, instance_log_paths, open_sinks},
    metrics::{MemorySampler, SysinfoSampler},
    spawn::{launch, plan_launch, signal_group},
    watch::WatchTrigger,
};

/// Lifecycle state of one instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AppState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Errored,
    RestartBackoff,
}

/// How the last run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub at: DateTime<Utc>,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown"),
        }
    }
}

/// Why an automatic restart was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    AutorestartDisabled,
    CrashLoop { unstable_restarts: u32 },
}

/// Outcome of the restart policy for one unexpected exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Allow,
    Delay(Duration),
    DenyPermanent(DenyReason),
}

/// Run-time record for one instance. Only the owning worker mutates it.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub state: AppState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    /// Every respawn, automatic or requested.
    pub restarts: u32,
    /// Consecutive exits inside the `min_uptime` window.
    pub unstable_restarts: u32,
    pub last_exit: Option<ExitInfo>,
    pub last_error: Option<ErrorReport>,
    pub memory_bytes: Option<u64>,
}

impl Default for ProcessHandle {
    fn default() -> Self {
        Self {
            state: AppState::Stopped,
            pid: None,
            started_at: None,
            started: None,
            restarts: 0,
            unstable_restarts: 0,
            last_exit: None,
            last_error: None,
            memory_bytes: None,
        }
    }
}

impl ProcessHandle {
    /// Applies the restart policy to an unexpected exit after `uptime`.
    ///
    /// A run that outlived `min_uptime` clears the unstable counter before the
    /// exit is judged; a shorter one increments it.
    pub fn evaluate_exit(&mut self, spec: &AppSpec, uptime: Duration) -> RestartDecision {
        if uptime >= spec.limits.min_uptime {
            self.unstable_restarts = 0;
        } else {
            self.unstable_restarts += 1;
        }

        if !spec.autorestart {
            return RestartDecision::DenyPermanent(DenyReason::AutorestartDisabled);
        }
        if let Some(max) = spec.limits.max_restarts
            && self.unstable_restarts > max
        {
            return RestartDecision::DenyPermanent(DenyReason::CrashLoop {
                unstable_restarts: self.unstable_restarts,
            });
        }

        if spec.limits.restart_delay.is_zero() {
            RestartDecision::Allow
        } else {
            RestartDecision::Delay(spec.limits.restart_delay)
        }
    }
}

/// Status snapshot published by the worker after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub name: String,
    pub app: String,
    pub index: usize,
    pub state: AppState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_ms: Option<u64>,
    pub restarts: u32,
    pub unstable_restarts: u32,
    pub memory_bytes: Option<u64>,
    pub last_exit: Option<ExitInfo>,
    pub last_error: Option<ErrorReport>,
}

impl InstanceStatus {
    fn new(name: String, app: String, index: usize) -> Self {
        Self {
            name,
            app,
            index,
            state: AppState::Stopped,
            pid: None,
            started_at: None,
            uptime_ms: None,
            restarts: 0,
            unstable_restarts: 0,
            memory_bytes: None,
            last_exit: None,
            last_error: None,
        }
    }
}

/// Builds a memory sampler for each instance.
pub type SamplerFactory = Arc<dyn Fn() -> Box<dyn MemorySampler> + Send + Sync>;

/// Tunables that are not part of the app config.
#[derive(Clone)]
pub struct SupervisorOptions {
    pub memory_sample_interval: Duration,
    pub sampler: SamplerFactory,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            memory_sample_interval: MEMORY_SAMPLE_INTERVAL,
            sampler: Arc::new(|| Box::new(SysinfoSampler::default())),
        }
    }
}

impl fmt::Debug for SupervisorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorOptions")
            .field("memory_sample_interval", &self.memory_sample_interval)
            .finish_non_exhaustive()
    }
}

type Reply = Sender<Result<(), ProcessManagerError>>;

#[derive(Debug)]
enum Command {
    Start { profile: Option<String> },
    Stop,
    Restart,
    Reload {
        spec: Option<Arc<AppSpec>>,
        profile: Option<String>,
    },
    Shutdown,
}

#[derive(Debug)]
enum Message {
    Command {
        command: Command,
        reply: Option<Reply>,
    },
    Exited { run: u64, exit: ExitInfo },
    ListenElapsed { run: u64 },
    KillDeadline { run: u64 },
    Abandon { run: u64 },
    BackoffElapsed { generation: u64 },
    MemoryTick,
    CronTick,
    WatchChange,
}

/// What to do once the current stop completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterStop {
    Start,
    Restart,
    Exit,
}

/// Why an internal restart was requested.
#[derive(Debug, Clone, Copy)]
enum RestartCause {
    Memory(u64),
    Cron,
    Watch,
}

/// Handle to one instance's worker thread.
pub struct Supervisor {
    name: String,
    tx: Sender<Message>,
    status: Arc<RwLock<InstanceStatus>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Spawns the worker for instance `index` of `spec`. The instance starts stopped.
    pub fn spawn(
        spec: Arc<AppSpec>,
        index: usize,
        profile: Option<String>,
        options: SupervisorOptions,
    ) -> Self {
        let name = spec.instance_name(index);
        let status = Arc::new(RwLock::new(InstanceStatus::new(
            name.clone(),
            spec.name.clone(),
            index,
        )));
        let (tx, rx) = mpsc::channel();

        let worker = Worker {
            name: name.clone(),
            spec,
            index,
            profile,
            handle: ProcessHandle::default(),
            generation: 0,
            run: 0,
            sink: None,
            tx: tx.clone(),
            status: Arc::clone(&status),
            stop_waiters: Vec::new(),
            start_waiters: Vec::new(),
            after_stop: None,
            sampler: (options.sampler)(),
            options,
            memory_ticker: None,
            cron_ticker: None,
            watcher: None,
        };

        let thread = thread::Builder::new()
            .name(format!("awd-{name}"))
            .spawn(move || worker.run(rx))
            .ok();

        Self {
            name,
            tx,
            status,
            thread: Mutex::new(thread),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn request(&self, command: Command) -> Result<(), ProcessManagerError> {
        let (reply, response) = mpsc::channel();
        self.tx
            .send(Message::Command {
                command,
                reply: Some(reply),
            })
            .map_err(|_| ProcessManagerError::SupervisorGone(self.name.clone()))?;
        response
            .recv()
            .map_err(|_| ProcessManagerError::SupervisorGone(self.name.clone()))?
    }

    /// Spawns the program. Returns once it is starting (or failed to spawn).
    pub fn start(&self, profile: Option<String>) -> Result<(), ProcessManagerError> {
        self.request(Command::Start { profile })
    }

    /// Terminates the program and returns once it is stopped.
    pub fn stop(&self) -> Result<(), ProcessManagerError> {
        self.request(Command::Stop)
    }

    /// Stop followed by start with the current spec.
    pub fn restart(&self) -> Result<(), ProcessManagerError> {
        self.request(Command::Restart)
    }

    /// Stop followed by start with a refreshed spec and/or env profile.
    pub fn reload(
        &self,
        spec: Option<Arc<AppSpec>>,
        profile: Option<String>,
    ) -> Result<(), ProcessManagerError> {
        self.request(Command::Reload { spec, profile })
    }

    /// Latest published snapshot. Never touches the worker queue.
    pub fn status(&self) -> InstanceStatus {
        let mut snapshot = self
            .status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        snapshot.uptime_ms = match (snapshot.state, snapshot.started_at) {
            (AppState::Starting | AppState::Running | AppState::Stopping, Some(started)) => {
                Some((Utc::now() - started).num_milliseconds().max(0) as u64)
            }
            _ => None,
        };
        snapshot
    }

    /// Stops the program and ends the worker thread.
    pub fn shutdown(&self) -> Result<(), ProcessManagerError> {
        let result = self.request(Command::Shutdown);
        let worker = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
        result
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let running = self
            .thread
            .get_mut()
            .map_or(true, |worker| worker.is_some());
        if running {
            let _ = self.tx.send(Message::Command {
                command: Command::Shutdown,
                reply: None,
            });
        }
    }
}

struct Worker {
    name: String,
    spec: Arc<AppSpec>,
    index: usize,
    profile: Option<String>,
    handle: ProcessHandle,
    /// Bumped by every explicit command and every armed backoff; stale timers are dropped.
    generation: u64,
    /// Identifies the current child; bumped on every spawn.
    run: u64,
    sink: Option<Arc<LogSink>>,
    tx: Sender<Message>,
    status: Arc<RwLock<InstanceStatus>>,
    stop_waiters: Vec<Reply>,
    start_waiters: Vec<Reply>,
    after_stop: Option<AfterStop>,
    sampler: Box<dyn MemorySampler>,
    options: SupervisorOptions,
    memory_ticker: Option<Ticker>,
    cron_ticker: Option<Ticker>,
    watcher: Option<WatchTrigger>,
}

fn respond(reply: Option<Reply>, result: Result<(), ProcessManagerError>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

impl Worker {
    fn run(mut self, rx: Receiver<Message>) {
        debug!("Supervisor for '{}' ready", self.name);
        self.arm_triggers();

        while let Ok(message) = rx.recv() {
            if !self.handle_message(message) {
                break;
            }
        }

        self.memory_ticker = None;
        self.cron_ticker = None;
        self.watcher = None;
        debug!("Supervisor for '{}' exited", self.name);
    }

    /// Returns `false` once the worker should exit.
    fn handle_message(&mut self, message: Message) -> bool {
        match message {
            Message::Command { command, reply } => return self.handle_command(command, reply),
            Message::Exited { run, exit } if run == self.run => return self.on_exit(exit),
            Message::Exited { run, .. } => {
                debug!("Ignoring exit of stale run {run} for '{}'", self.name);
            }
            Message::ListenElapsed { run } => {
                if run == self.run && self.handle.state == AppState::Starting {
                    self.mark_running();
                }
            }
            Message::KillDeadline { run } => {
                if run == self.run && self.handle.state == AppState::Stopping {
                    self.escalate_kill();
                }
            }
            Message::Abandon { run } => {
                if run == self.run && self.handle.state == AppState::Stopping {
                    error!("'{}' survived SIGKILL; abandoning it", self.name);
                    self.handle.pid = None;
                    self.handle.started = None;
                    // A late exit for the abandoned child no longer matches.
                    self.run += 1;
                    return self.finish_stop();
                }
            }
            Message::BackoffElapsed { generation } => {
                if generation == self.generation
                    && self.handle.state == AppState::RestartBackoff
                {
                    self.handle.restarts += 1;
                    info!("Restarting '{}' after backoff", self.name);
                    let _ = self.spawn_child();
                } else {
                    debug!("Dropping stale restart timer for '{}'", self.name);
                }
            }
            Message::MemoryTick => self.sample_memory(),
            Message::CronTick => self.internal_restart(RestartCause::Cron),
            Message::WatchChange => self.internal_restart(RestartCause::Watch),
        }
        true
    }

    fn handle_command(&mut self, command: Command, reply: Option<Reply>) -> bool {
        debug!("'{}' received {:?} in state {}", self.name, command, self.handle.state);
        self.generation += 1;

        match command {
            Command::Start { profile } => {
                if profile.is_some() {
                    self.profile = profile;
                }
                match self.handle.state {
                    AppState::Starting | AppState::Running => {
                        debug!("'{}' is already {}", self.name, self.handle.state);
                        respond(reply, Ok(()));
                    }
                    AppState::Stopping => {
                        self.after_stop = Some(AfterStop::Start);
                        self.start_waiters.extend(reply);
                    }
                    AppState::Stopped | AppState::Errored | AppState::RestartBackoff => {
                        self.handle.unstable_restarts = 0;
                        let result = self.spawn_child();
                        respond(reply, result);
                    }
                }
            }
            Command::Stop => {
                self.supersede_start_waiters();
                self.after_stop = None;
                match self.handle.state {
                    AppState::Starting | AppState::Running => {
                        self.stop_waiters.extend(reply);
                        self.begin_stop();
                    }
                    AppState::Stopping => self.stop_waiters.extend(reply),
                    AppState::Stopped | AppState::Errored | AppState::RestartBackoff => {
                        self.transition(AppState::Stopped);
                        respond(reply, Ok(()));
                    }
                }
            }
            Command::Restart => self.request_restart(reply),
            Command::Reload { spec, profile } => {
                if let Some(spec) = spec {
                    info!("Reloading '{}' with refreshed config", self.name);
                    self.spec = spec;
                    self.arm_triggers();
                }
                if profile.is_some() {
                    self.profile = profile;
                }
                self.request_restart(reply);
            }
            Command::Shutdown => {
                self.supersede_start_waiters();
                match self.handle.state {
                    AppState::Starting | AppState::Running => {
                        self.after_stop = Some(AfterStop::Exit);
                        self.stop_waiters.extend(reply);
                        self.begin_stop();
                    }
                    AppState::Stopping => {
                        self.after_stop = Some(AfterStop::Exit);
                        self.stop_waiters.extend(reply);
                    }
                    AppState::Stopped | AppState::Errored | AppState::RestartBackoff => {
                        if self.handle.state == AppState::RestartBackoff {
                            self.transition(AppState::Stopped);
                        }
                        respond(reply, Ok(()));
                        return false;
                    }
                }
            }
        }
        true
    }

    fn request_restart(&mut self, reply: Option<Reply>) {
        match self.handle.state {
            AppState::Starting | AppState::Running => {
                self.after_stop = Some(AfterStop::Restart);
                self.start_waiters.extend(reply);
                self.begin_stop();
            }
            AppState::Stopping => {
                self.after_stop = Some(AfterStop::Restart);
                self.start_waiters.extend(reply);
            }
            AppState::Stopped | AppState::Errored | AppState::RestartBackoff => {
                self.handle.unstable_restarts = 0;
                self.handle.restarts += 1;
                let result = self.spawn_child();
                respond(reply, result);
            }
        }
    }

    /// Restart that is policy, not failure: never touches the crash-loop counter.
    fn internal_restart(&mut self, cause: RestartCause) {
        if !matches!(self.handle.state, AppState::Starting | AppState::Running) {
            debug!("Ignoring {cause:?} restart for '{}' in state {}", self.name, self.handle.state);
            return;
        }
        match cause {
            RestartCause::Memory(bytes) => warn!(
                "'{}' uses {bytes} bytes, above max_memory_restart; restarting",
                self.name
            ),
            RestartCause::Cron => info!("Scheduled cron restart of '{}'", self.name),
            RestartCause::Watch => info!("Restarting '{}' after file changes", self.name),
        }
        if self.after_stop.is_none() {
            self.after_stop = Some(AfterStop::Restart);
        }
        self.begin_stop();
    }

    fn supersede_start_waiters(&mut self) {
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(Err(ProcessManagerError::Superseded(self.name.clone())));
        }
    }

    fn transition(&mut self, next: AppState) {
        if self.handle.state != next {
            debug!("'{}': {} -> {}", self.name, self.handle.state, next);
        }
        self.handle.state = next;
        self.publish();
    }

    fn publish(&self) {
        let mut status = self
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        status.state = self.handle.state;
        status.pid = self.handle.pid;
        status.started_at = self.handle.started_at;
        status.restarts = self.handle.restarts;
        status.unstable_restarts = self.handle.unstable_restarts;
        status.memory_bytes = self.handle.memory_bytes;
        status.last_exit = self.handle.last_exit;
        status.last_error = self.handle.last_error.clone();
    }

    fn record_error(&mut self, err: &ProcessManagerError) {
        self.handle.last_error = Some(err.report());
    }

    fn schedule(&self, delay: Duration, message: Message) {
        let tx = self.tx.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            let _ = tx.send(message);
        });
    }

    /// (Re)creates the cron and watch triggers for the current spec.
    fn arm_triggers(&mut self) {
        self.cron_ticker = self.spec.cron_restart.as_ref().map(|cron| {
            info!("'{}' restarts on schedule '{}'", self.name, cron.expression);
            let tx = self.tx.clone();
            Ticker::cron(
                format!("{}-cron", self.name),
                cron.schedule.clone(),
                move || tx.send(Message::CronTick).is_ok(),
            )
        });

        self.watcher = None;
        if self.spec.watch.enabled {
            let (out, error, combined) = instance_log_paths(&self.spec, self.index);
            let ignored = [Some(out), Some(error), combined].into_iter().flatten().collect();
            let tx = self.tx.clone();
            match WatchTrigger::spawn(
                &self.name,
                &self.spec.watch,
                &self.spec.cwd,
                ignored,
                move || tx.send(Message::WatchChange).is_ok(),
            ) {
                Ok(watcher) => self.watcher = Some(watcher),
                Err(err) => {
                    warn!("{err}");
                    self.record_error(&err);
                    self.publish();
                }
            }
        }
    }

    fn spawn_child(&mut self) -> Result<(), ProcessManagerError> {
        self.run += 1;
        let run = self.run;
        self.handle.memory_bytes = None;
        self.transition(AppState::Starting);

        let (sink, failures) = open_sinks(&self.spec, self.index);
        for failure in &failures {
            self.record_error(failure);
        }
        let sink = Arc::new(sink);
        self.sink = Some(Arc::clone(&sink));

        let plan = plan_launch(&self.spec, self.index, self.profile.as_deref());
        match launch(&self.name, &plan, &sink) {
            Ok(child) => {
                let pid = child.id();
                self.handle.pid = Some(pid);
                self.handle.started = Some(Instant::now());
                self.handle.started_at = Some(Utc::now());
                info!("Started '{}' with PID {pid}", self.name);
                self.watch_child(child, run);

                if self.spec.listen_timeout.is_zero() {
                    self.mark_running();
                } else {
                    self.publish();
                    self.schedule(self.spec.listen_timeout, Message::ListenElapsed { run });
                }
                Ok(())
            }
            Err(err) => {
                error!("{err}");
                self.handle.pid = None;
                self.handle.started = None;
                self.record_error(&err);
                self.transition(AppState::Errored);
                Err(err)
            }
        }
    }

    /// Waits for the child on its own thread and reports the exit into the queue.
    fn watch_child(&self, mut child: Child, run: u64) {
        let tx = self.tx.clone();
        let name = self.name.clone();
        thread::spawn(move || {
            let exit = match child.wait() {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    signal: status.signal(),
                    at: Utc::now(),
                },
                Err(err) => {
                    error!("Failed to wait on '{name}': {err}");
                    ExitInfo {
                        code: None,
                        signal: None,
                        at: Utc::now(),
                    }
                }
            };
            let _ = tx.send(Message::Exited { run, exit });
        });
    }

    fn mark_running(&mut self) {
        self.transition(AppState::Running);
        if self.spec.limits.max_memory_bytes.is_some() {
            let tx = self.tx.clone();
            self.memory_ticker = Some(Ticker::every(
                format!("{}-memory", self.name),
                self.options.memory_sample_interval,
                move || tx.send(Message::MemoryTick).is_ok(),
            ));
        }
    }

    fn sample_memory(&mut self) {
        let (Some(limit), Some(pid)) = (self.spec.limits.max_memory_bytes, self.handle.pid) else {
            return;
        };
        if self.handle.state != AppState::Running {
            return;
        }
        let Some(bytes) = self.sampler.resident_bytes(pid) else {
            return;
        };
        self.handle.memory_bytes = Some(bytes);
        self.publish();
        if bytes > limit {
            self.internal_restart(RestartCause::Memory(bytes));
        }
    }

    fn begin_stop(&mut self) {
        self.memory_ticker = None;
        self.transition(AppState::Stopping);
        let Some(pid) = self.handle.pid else {
            return;
        };

        info!("Stopping '{}' (PID {pid})", self.name);
        if let Err(source) = signal_group(pid, Signal::SIGTERM) {
            let err = ProcessManagerError::StopError {
                instance: self.name.clone(),
                source,
            };
            warn!("{err}");
            self.record_error(&err);
        }
        self.schedule(self.spec.kill_timeout, Message::KillDeadline { run: self.run });
    }

    fn escalate_kill(&mut self) {
        let Some(pid) = self.handle.pid else {
            return;
        };
        let err = ProcessManagerError::KillTimeout {
            instance: self.name.clone(),
            timeout_ms: self.spec.kill_timeout.as_millis() as u64,
        };
        warn!("{err}");
        self.record_error(&err);
        self.publish();
        if let Err(source) = signal_group(pid, Signal::SIGKILL) {
            error!("Failed to SIGKILL '{}': {source}", self.name);
        }
        self.schedule(POST_KILL_GRACE, Message::Abandon { run: self.run });
    }

    /// Returns `false` once the worker should exit.
    fn on_exit(&mut self, exit: ExitInfo) -> bool {
        let uptime = self
            .handle
            .started
            .take()
            .map(|started| started.elapsed())
            .unwrap_or_default();
        self.handle.pid = None;
        self.handle.last_exit = Some(exit);
        self.memory_ticker = None;

        match self.handle.state {
            AppState::Stopping => self.finish_stop(),
            AppState::Starting | AppState::Running => {
                warn!("'{}' exited unexpectedly ({exit}) after {uptime:?}", self.name);
                self.transition(AppState::Errored);
                self.apply_restart_policy(uptime);
                true
            }
            other => {
                debug!("'{}' exit observed in state {other}", self.name);
                self.publish();
                true
            }
        }
    }

    fn apply_restart_policy(&mut self, uptime: Duration) {
        let spec = Arc::clone(&self.spec);
        match self.handle.evaluate_exit(&spec, uptime) {
            RestartDecision::Allow => {
                self.handle.restarts += 1;
                let _ = self.spawn_child();
            }
            RestartDecision::Delay(delay) => {
                self.generation += 1;
                debug!("'{}' restarting in {delay:?}", self.name);
                self.transition(AppState::RestartBackoff);
                self.schedule(
                    delay,
                    Message::BackoffElapsed {
                        generation: self.generation,
                    },
                );
            }
            RestartDecision::DenyPermanent(DenyReason::AutorestartDisabled) => {
                info!("'{}' has autorestart disabled; leaving it stopped", self.name);
                self.transition(AppState::Stopped);
            }
            RestartDecision::DenyPermanent(DenyReason::CrashLoop { unstable_restarts }) => {
                let err = ProcessManagerError::CrashLoop {
                    instance: self.name.clone(),
                    restarts: unstable_restarts,
                };
                error!("{err}");
                self.record_error(&err);
                self.transition(AppState::Stopped);
            }
        }
    }

    /// Returns `false` once the worker should exit.
    fn finish_stop(&mut self) -> bool {
        info!("'{}' stopped", self.name);
        self.transition(AppState::Stopped);
        for waiter in mem::take(&mut self.stop_waiters) {
            let _ = waiter.send(Ok(()));
        }

        match self.after_stop.take() {
            Some(AfterStop::Exit) => return false,
            Some(AfterStop::Start) => {
                self.handle.unstable_restarts = 0;
                let result = self.spawn_child();
                self.answer_start_waiters(result);
            }
            Some(AfterStop::Restart) => {
                self.handle.restarts += 1;
                let result = self.spawn_child();
                self.answer_start_waiters(result);
            }
            None => {}
        }
        true
    }

    fn answer_start_waiters(&mut self, result: Result<(), ProcessManagerError>) {
        let waiters = mem::take(&mut self.start_waiters);
        match result {
            Ok(()) => {
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(err) => {
                let report = err.report();
                let mut first = Some(err);
                for waiter in waiters {
                    let reply = first
                        .take()
                        .unwrap_or_else(|| ProcessManagerError::Reported(report.clone()));
                    let _ = waiter.send(Err(reply));
                }
            }
        }
    }
}
