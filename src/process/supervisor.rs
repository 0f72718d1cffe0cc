use crate::alerts::Alert;
use crate::backoff::Backoff;
use crate::context::RunContext;
use crate::errors::{Result, StreamError};
use crate::process::command::CommandLine;
use crate::process::watchdog::{CpuWatchdog, ProcStatSampler};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::collections::VecDeque;
use std::fmt;
use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const EXIT_POLL: Duration = Duration::from_millis(50);
const TAIL_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
/// A restarted process that stays up this long clears the restart backoff.
const HEALTHY_UPTIME: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    Encoder,
    Muxer,
    Gateway,
}

impl ProcessRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessRole::Encoder => "encoder",
            ProcessRole::Muxer => "muxer",
            ProcessRole::Gateway => "gateway",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Report the exit and stop monitoring. Used for the encoder: a fresh
    /// encoder is useless without re-wiring whatever feeds its input.
    Never,
    /// Relaunch the same command line after an exponential delay.
    Backoff { min: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub success: bool,
}

/// Last `capacity` lines of a process's standard error.
#[derive(Debug)]
pub struct LogTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// One launched OS process, owned by exactly one [`ProcessSupervisor`].
pub struct ManagedProcess {
    role: ProcessRole,
    command: CommandLine,
    pid: u32,
    started_at: Instant,
    child: Arc<Mutex<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    tail: Arc<Mutex<LogTail>>,
    tail_thread: Mutex<Option<JoinHandle<()>>>,
    exit: Arc<Mutex<Option<ExitReport>>>,
    exit_rx: Receiver<ExitReport>,
}

impl ManagedProcess {
    /// Launch `command` with stdin piped, stdout discarded and stderr tailed.
    pub fn spawn(role: ProcessRole, command: &CommandLine, tail_lines: usize) -> Result<Arc<Self>> {
        log::debug!("Popen [{}]: {}", role, command);

        let mut child = command
            .to_command()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StreamError::start_failure(role.as_str(), format!("{}: {}", command, e)))?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stderr = child.stderr.take();
        let tail = Arc::new(Mutex::new(LogTail::new(tail_lines)));

        let tail_thread = match stderr {
            Some(stderr) => {
                let tail = tail.clone();
                Some(
                    std::thread::Builder::new()
                        .name(format!("{}-stderr", role))
                        .spawn(move || {
                            let reader = BufReader::new(stderr);
                            for line in reader.split(b'\n') {
                                let Ok(line) = line else { break };
                                let text = String::from_utf8_lossy(&line).trim_end().to_string();
                                tail.lock().expect("lock poisoned").push(text);
                            }
                        })?,
                )
            }
            None => None,
        };

        let child = Arc::new(Mutex::new(child));
        let exit = Arc::new(Mutex::new(None));
        let (exit_tx, exit_rx) = bounded(1);

        {
            let child = child.clone();
            let exit = exit.clone();
            std::thread::Builder::new()
                .name(format!("{}-wait", role))
                .spawn(move || loop {
                    let status = child.lock().expect("lock poisoned").try_wait();
                    let report = match status {
                        Ok(Some(status)) => ExitReport {
                            code: status.code(),
                            success: status.success(),
                        },
                        Ok(None) => {
                            std::thread::sleep(EXIT_POLL);
                            continue;
                        }
                        Err(e) => {
                            log::warn!("Lost track of {} (pid {}): {}", role, pid, e);
                            ExitReport {
                                code: None,
                                success: false,
                            }
                        }
                    };
                    *exit.lock().expect("lock poisoned") = Some(report);
                    let _ = exit_tx.send(report);
                    return;
                })?;
        }

        Ok(Arc::new(Self {
            role,
            command: command.clone(),
            pid,
            started_at: Instant::now(),
            child,
            stdin: Mutex::new(stdin),
            tail,
            tail_thread: Mutex::new(tail_thread),
            exit,
            exit_rx,
        }))
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Hand the process's standard input to whoever feeds it. Only the first
    /// caller gets it.
    pub fn take_stdin(&self) -> Option<ChildStdin> {
        self.stdin.lock().expect("lock poisoned").take()
    }

    pub fn exit_report(&self) -> Option<ExitReport> {
        *self.exit.lock().expect("lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.exit_report().is_none()
    }

    pub fn tail_lines(&self) -> Vec<String> {
        self.tail.lock().expect("lock poisoned").lines()
    }

    /// Block until the process exits or `timeout` passes.
    pub fn wait_exit(&self, timeout: Duration) -> Option<ExitReport> {
        match self.exit_rx.recv_timeout(timeout) {
            Ok(report) => Some(report),
            Err(RecvTimeoutError::Disconnected) | Err(RecvTimeoutError::Timeout) => {
                self.exit_report()
            }
        }
    }

    fn wait_exit_forever(&self) -> ExitReport {
        match self.exit_rx.recv() {
            Ok(report) => report,
            // Sender is gone, so the report was stored before it was dropped.
            Err(_) => self.exit_report().unwrap_or(ExitReport {
                code: None,
                success: false,
            }),
        }
    }

    /// Give the stderr reader a moment to drain the final lines.
    fn join_tail(&self) {
        let handle = self.tail_thread.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            let start = Instant::now();
            while !handle.is_finished() && start.elapsed() < TAIL_JOIN_TIMEOUT {
                std::thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }

    /// Kill the process if it is still running.
    pub fn terminate(&self) -> Result<()> {
        self.stdin.lock().expect("lock poisoned").take();
        let mut child = self.child.lock().expect("lock poisoned");
        if child.try_wait()?.is_none() {
            log::debug!("Terminating {} (pid {})", self.role, self.pid);
            child.kill()?;
        }
        Ok(())
    }
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("role", &self.role)
            .field("pid", &self.pid)
            .field("command", &self.command.to_string())
            .finish()
    }
}

/// CPU limits watched for every process a supervisor launches.
#[derive(Debug, Clone, Copy)]
pub struct CpuLimit {
    pub max_percent: f32,
    pub interval: Duration,
}

struct Inner {
    role: ProcessRole,
    command: CommandLine,
    policy: RestartPolicy,
    tail_lines: usize,
    cpu_limit: Option<CpuLimit>,
    ctx: RunContext,
    current: Mutex<Option<Arc<ManagedProcess>>>,
    stopped: AtomicBool,
    restarts: AtomicU32,
    unexpected_exits: AtomicU32,
}

/// Launches one external command and watches it for unexpected exits.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(
        role: ProcessRole,
        command: CommandLine,
        policy: RestartPolicy,
        tail_lines: usize,
        ctx: RunContext,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                role,
                command,
                policy,
                tail_lines,
                cpu_limit: None,
                ctx,
                current: Mutex::new(None),
                stopped: AtomicBool::new(false),
                restarts: AtomicU32::new(0),
                unexpected_exits: AtomicU32::new(0),
            }),
        }
    }

    /// Sample CPU usage of every launched process. Call before `start`.
    pub fn with_cpu_limit(mut self, limit: CpuLimit) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.cpu_limit = Some(limit),
            None => log::warn!("CPU limit ignored for {}: supervisor already shared", self.inner.role),
        }
        self
    }

    pub fn role(&self) -> ProcessRole {
        self.inner.role
    }

    pub fn command(&self) -> &CommandLine {
        &self.inner.command
    }

    /// Spawn the process and its monitor thread.
    pub fn start(&self) -> Result<Arc<ManagedProcess>> {
        let process = ManagedProcess::spawn(self.inner.role, &self.inner.command, self.inner.tail_lines)?;
        self.adopt(process)
    }

    /// Like [`start`](Self::start), but the process must stay up for `grace`
    /// before it is monitored. An early exit is returned as an error and is
    /// not alerted or restarted.
    pub fn start_verified(&self, grace: Duration) -> Result<Arc<ManagedProcess>> {
        let process = ManagedProcess::spawn(self.inner.role, &self.inner.command, self.inner.tail_lines)?;
        if let Some(report) = process.wait_exit(grace) {
            process.join_tail();
            return Err(StreamError::ProcessExitedUnexpectedly {
                role: self.inner.role.to_string(),
                code: report.code,
                tail: process.tail_lines(),
            });
        }
        self.adopt(process)
    }

    fn adopt(&self, process: Arc<ManagedProcess>) -> Result<Arc<ManagedProcess>> {
        self.inner.stopped.store(false, Ordering::SeqCst);
        *self.inner.current.lock().expect("lock poisoned") = Some(process.clone());
        watch_cpu(&self.inner, &process);

        let inner = self.inner.clone();
        let first = process.clone();
        std::thread::Builder::new()
            .name(format!("{}-monitor", self.inner.role))
            .spawn(move || monitor_loop(inner, first))?;

        log::info!("Started {} (pid {})", self.inner.role, process.pid());
        Ok(process)
    }

    pub fn current(&self) -> Option<Arc<ManagedProcess>> {
        self.inner.current.lock().expect("lock poisoned").clone()
    }

    pub fn restarts(&self) -> u32 {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    pub fn unexpected_exits(&self) -> u32 {
        self.inner.unexpected_exits.load(Ordering::SeqCst)
    }

    /// Stop monitoring and kill the current process. Safe to call repeatedly.
    pub fn terminate(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let process = self.inner.current.lock().expect("lock poisoned").take();
        if let Some(process) = process {
            if let Err(e) = process.terminate() {
                log::warn!("Failed to terminate {}: {}", self.inner.role, e);
            }
        }
    }
}

fn watch_cpu(inner: &Inner, process: &Arc<ManagedProcess>) {
    if let Some(limit) = inner.cpu_limit {
        let watchdog = CpuWatchdog::new(limit.max_percent, limit.interval, inner.ctx.clone());
        if let Err(e) = watchdog.spawn(process.clone(), Box::new(ProcStatSampler::new())) {
            log::warn!("Failed to start CPU watchdog for {}: {}", inner.role, e);
        }
    }
}

fn expected_exit(inner: &Inner) -> bool {
    inner.ctx.is_shutting_down() || inner.stopped.load(Ordering::SeqCst)
}

fn monitor_loop(inner: Arc<Inner>, mut process: Arc<ManagedProcess>) {
    let mut backoff = match inner.policy {
        RestartPolicy::Backoff { min, max } => Some(Backoff::new(min, max)),
        RestartPolicy::Never => None,
    };

    loop {
        let report = process.wait_exit_forever();
        process.join_tail();

        if expected_exit(&inner) {
            log::debug!("{} exited during shutdown ({:?})", inner.role, report.code);
            return;
        }

        inner.unexpected_exits.fetch_add(1, Ordering::SeqCst);
        let tail = process.tail_lines();
        log::error!("STDERR:\n{}\n", tail.join("\n"));
        inner.ctx.alert(Alert::error(inner.role.as_str()).with_detail(format!(
            "exit code {:?}\n{}",
            report.code,
            tail.join("\n")
        )));
        inner.ctx.reporter().capture_error(&StreamError::ProcessExitedUnexpectedly {
            role: inner.role.to_string(),
            code: report.code,
            tail,
        });

        let Some(backoff) = backoff.as_mut() else {
            return;
        };
        if process.uptime() >= HEALTHY_UPTIME {
            backoff.reset();
        }

        // Relaunch, retrying spawn failures on the same backoff.
        process = loop {
            let delay = backoff.more();
            log::warn!("Restarting {} in {:?}", inner.role, delay);
            if !inner.ctx.sleep(delay) || expected_exit(&inner) {
                return;
            }
            match ManagedProcess::spawn(inner.role, &inner.command, inner.tail_lines) {
                Ok(next) => break next,
                Err(e) => log::error!("Relaunch of {} failed: {}", inner.role, e),
            }
        };

        *inner.current.lock().expect("lock poisoned") = Some(process.clone());
        inner.restarts.fetch_add(1, Ordering::SeqCst);
        watch_cpu(&inner, &process);

        // terminate() may have raced with the relaunch
        if expected_exit(&inner) {
            let _ = process.terminate();
            return;
        }
    }
}
