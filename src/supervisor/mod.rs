//! Process Supervisor.
//!
//! Owns the lifecycles of the two child processes the panel launches itself:
//! the PMHQ bridge and the LLBot runtime. The QQ client is started by the
//! bridge, so the supervisor only ever knows it by an observed PID.
//!
//! Health is inferred, not negotiated: a process is healthy while it has not
//! exited, and the bridge additionally counts as up once it has printed its
//! dynamically assigned API port. Launch failures are returned as values and
//! logged; nothing in here panics the caller.

pub mod state_machine;

pub use state_machine::ProcessStatus;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{broadcast, mpsc, watch};

use crate::process_monitor;
use state_machine::StatusCell;

/// Registry name of the bridge process.
pub const BRIDGE_NAME: &str = "pmhq";
/// Registry name of the bot runtime process.
pub const BOT_RUNTIME_NAME: &str = "llbot";

/// How long the bridge gets to print its API port before launch counts as failed.
const PORT_DISCOVERY_WAIT: Duration = Duration::from_secs(10);
/// Exit within this window after spawn is treated as a launch failure.
const EARLY_EXIT_WINDOW: Duration = Duration::from_secs(3);
/// Grace period between the polite terminate request and the forced kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("executable not found: {0}")]
    ExecutableMissing(String),
    #[error("failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },
    #[error("process '{0}' exited immediately after launch")]
    ExitedEarly(String),
    #[error("bridge did not report an API port within {0:?}")]
    PortDiscoveryTimeout(Duration),
    #[error("detached launch unavailable: {0}")]
    DetachedLaunchFailed(String),
}

/// One observed status transition, broadcast to every subscriber.
#[derive(Debug, Clone)]
pub struct ProcessStatusEvent {
    pub name: String,
    pub status: ProcessStatus,
}

struct SupervisedChild {
    pid: u32,
    running_rx: watch::Receiver<bool>,
}

pub struct ProcessSupervisor {
    children: Mutex<HashMap<String, SupervisedChild>>,
    statuses: Mutex<HashMap<String, StatusCell>>,
    status_tx: broadcast::Sender<ProcessStatusEvent>,
    bridge_port: Mutex<Option<u16>>,
    port_hint: Regex,
    port_digits: Regex,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(64);
        Self {
            children: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            status_tx,
            bridge_port: Mutex::new(None),
            // PMHQ prints e.g. "PMHQ listening on http://127.0.0.1:13000";
            // the port is the last number on the line, not the first
            port_hint: Regex::new(r"(?i)listening on|port").expect("port hint regex is valid"),
            port_digits: Regex::new(r"\d{2,5}").expect("port digits regex is valid"),
        }
    }

    /// Subscribe to status transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Current status of a registered process. Unknown names read as Stopped.
    pub fn status(&self, name: &str) -> ProcessStatus {
        self.statuses
            .lock()
            .map(|map| map.get(name).map(|c| c.status).unwrap_or_default())
            .unwrap_or_default()
    }

    /// The bridge's dynamically assigned API port, once discovered.
    pub fn bridge_port(&self) -> Option<u16> {
        self.bridge_port.lock().map(|p| *p).unwrap_or(None)
    }

    fn set_status(&self, name: &str, to: ProcessStatus) {
        let mut map = match self.statuses.lock() {
            Ok(map) => map,
            Err(e) => {
                tracing::error!("Status registry lock poisoned: {}", e);
                return;
            }
        };
        let cell = map.entry(name.to_string()).or_default();
        if cell.status == to {
            return;
        }
        match cell.transition(to) {
            Ok(()) => {
                let _ = self.status_tx.send(ProcessStatusEvent {
                    name: name.to_string(),
                    status: to,
                });
            }
            Err(e) => tracing::warn!("Ignored status update for '{}': {}", name, e),
        }
    }

    // ── Launch ───────────────────────────────────────────────

    /// Launch the PMHQ bridge and wait for it to report its local API port.
    ///
    /// The port is scraped from the bridge's stdout. Missing executable,
    /// immediate exit, and a silent bridge all come back as errors the caller
    /// reports; none of them are fatal to the panel.
    pub async fn start_bridge(
        &self,
        exe: &Path,
        client_path: &Path,
        auto_login_uin: &str,
        headless: bool,
    ) -> Result<u16, SupervisorError> {
        if !exe.exists() {
            return Err(SupervisorError::ExecutableMissing(
                exe.display().to_string(),
            ));
        }

        let mut args = vec!["--qq".to_string(), client_path.display().to_string()];
        if !auto_login_uin.is_empty() {
            args.push("--uin".to_string());
            args.push(auto_login_uin.to_string());
        }
        if headless {
            args.push("--headless".to_string());
        }

        self.set_status(BRIDGE_NAME, ProcessStatus::Starting);

        let (pid, mut running_rx, lines) = match self.spawn_child(BRIDGE_NAME, exe, &args, true).await
        {
            Ok(spawned) => spawned,
            Err(e) => {
                self.set_status(BRIDGE_NAME, ProcessStatus::Stopped);
                return Err(e);
            }
        };
        let mut lines = lines.expect("bridge stdout is captured");

        self.register_child(BRIDGE_NAME, pid, running_rx.clone());

        let discovered = tokio::time::timeout(PORT_DISCOVERY_WAIT, async {
            loop {
                tokio::select! {
                    line = lines.recv() => {
                        match line {
                            Some(line) => {
                                if let Some(port) = self.parse_port_line(&line) {
                                    return Some((port, lines));
                                }
                            }
                            None => return None, // stdout closed
                        }
                    }
                    changed = running_rx.changed() => {
                        if changed.is_err() || !*running_rx.borrow() {
                            return None;
                        }
                    }
                }
            }
        })
        .await;

        match discovered {
            Ok(Some((port, mut remaining))) => {
                // Keep draining bridge output so the pipe never fills up.
                tokio::spawn(async move {
                    while let Some(line) = remaining.recv().await {
                        tracing::debug!("[pmhq] {}", line);
                    }
                });
                if let Ok(mut slot) = self.bridge_port.lock() {
                    *slot = Some(port);
                }
                self.set_status(BRIDGE_NAME, ProcessStatus::Running);
                tracing::info!("Bridge up on 127.0.0.1:{} (pid {})", port, pid);
                Ok(port)
            }
            Ok(None) => {
                self.remove_child(BRIDGE_NAME);
                self.set_status(BRIDGE_NAME, ProcessStatus::Stopped);
                Err(SupervisorError::ExitedEarly(BRIDGE_NAME.to_string()))
            }
            Err(_) => {
                let _ = terminate_pid(pid, true);
                self.remove_child(BRIDGE_NAME);
                self.set_status(BRIDGE_NAME, ProcessStatus::Stopped);
                Err(SupervisorError::PortDiscoveryTimeout(PORT_DISCOVERY_WAIT))
            }
        }
    }

    /// Launch the LLBot entry script under the given runtime interpreter.
    /// Exit inside the early-exit window counts as a launch failure.
    pub async fn start_bot_runtime(
        &self,
        runtime: &Path,
        script: &Path,
    ) -> Result<(), SupervisorError> {
        if !runtime.exists() {
            return Err(SupervisorError::ExecutableMissing(
                runtime.display().to_string(),
            ));
        }
        if !script.exists() {
            return Err(SupervisorError::ExecutableMissing(
                script.display().to_string(),
            ));
        }

        self.set_status(BOT_RUNTIME_NAME, ProcessStatus::Starting);

        let args = vec![script.display().to_string()];
        let (pid, mut running_rx, _) =
            match self.spawn_child(BOT_RUNTIME_NAME, runtime, &args, false).await {
                Ok(spawned) => spawned,
                Err(e) => {
                    self.set_status(BOT_RUNTIME_NAME, ProcessStatus::Stopped);
                    return Err(e);
                }
            };

        self.register_child(BOT_RUNTIME_NAME, pid, running_rx.clone());

        let exited_early = tokio::time::timeout(EARLY_EXIT_WINDOW, async {
            while *running_rx.borrow() {
                if running_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok();

        if exited_early {
            self.remove_child(BOT_RUNTIME_NAME);
            self.set_status(BOT_RUNTIME_NAME, ProcessStatus::Stopped);
            return Err(SupervisorError::ExitedEarly(BOT_RUNTIME_NAME.to_string()));
        }

        self.set_status(BOT_RUNTIME_NAME, ProcessStatus::Running);
        tracing::info!("Bot runtime started (pid {})", pid);
        Ok(())
    }

    /// Launch a process detached from this process's group/job so it survives
    /// the panel exiting. Used for self-update scripts. Callers fall back to a
    /// plain shell launch when this reports failure.
    pub fn start_detached(&self, path: &Path, working_dir: &Path) -> Result<u32, SupervisorError> {
        let mut cmd = std::process::Command::new(path);
        cmd.current_dir(working_dir);

        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            use winapi::um::winbase::{CREATE_BREAKAWAY_FROM_JOB, CREATE_NEW_PROCESS_GROUP};
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_BREAKAWAY_FROM_JOB | CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        match cmd.spawn() {
            Ok(child) => Ok(child.id()),
            Err(e) => Err(SupervisorError::DetachedLaunchFailed(e.to_string())),
        }
    }

    // ── Stop ─────────────────────────────────────────────────

    /// Stop everything the supervisor knows about, leaf-first: bot runtime,
    /// then the bridge, then the externally observed QQ client PID. Idempotent;
    /// already-exited processes are skipped silently.
    pub async fn stop_all(&self, client_pid: Option<u32>) {
        self.stop_child(BOT_RUNTIME_NAME).await;
        self.stop_child(BRIDGE_NAME).await;
        if let Some(pid) = client_pid {
            self.stop_external(pid, "qq client").await;
        }
        if let Ok(mut slot) = self.bridge_port.lock() {
            *slot = None;
        }
    }

    /// Stop one supervised child: polite terminate, bounded grace wait, then
    /// forced kill. A name with no live child is a no-op.
    pub async fn stop_child(&self, name: &str) {
        let child = match self.children.lock() {
            Ok(mut map) => map.remove(name),
            Err(_) => None,
        };
        let Some(mut child) = child else {
            return;
        };

        if !*child.running_rx.borrow() {
            self.set_status(name, ProcessStatus::Stopped);
            return;
        }

        self.set_status(name, ProcessStatus::Stopping);
        if let Err(e) = terminate_pid(child.pid, false) {
            tracing::warn!("Terminate request for '{}' (pid {}) failed: {}", name, child.pid, e);
        }

        let stopped = tokio::time::timeout(STOP_GRACE, async {
            while *child.running_rx.borrow() {
                if child.running_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok();

        if !stopped {
            tracing::warn!("'{}' (pid {}) ignored terminate, killing", name, child.pid);
            let _ = terminate_pid(child.pid, true);
        }
        self.set_status(name, ProcessStatus::Stopped);
        tracing::info!("Stopped '{}'", name);
    }

    /// Stop a process the supervisor did not spawn, identified only by PID.
    async fn stop_external(&self, pid: u32, label: &str) {
        if !process_monitor::is_running_async(pid).await {
            return;
        }
        if let Err(e) = terminate_pid(pid, false) {
            tracing::warn!("Terminate request for {} (pid {}) failed: {}", label, pid, e);
        }

        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        while tokio::time::Instant::now() < deadline {
            if !process_monitor::is_running_async(pid).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        tracing::warn!("{} (pid {}) ignored terminate, killing", label, pid);
        let _ = terminate_pid(pid, true);
    }

    // ── Internals ────────────────────────────────────────────

    fn register_child(&self, name: &str, pid: u32, running_rx: watch::Receiver<bool>) {
        if let Ok(mut map) = self.children.lock() {
            map.insert(name.to_string(), SupervisedChild { pid, running_rx });
        }
    }

    fn remove_child(&self, name: &str) {
        if let Ok(mut map) = self.children.lock() {
            map.remove(name);
        }
    }

    fn parse_port_line(&self, line: &str) -> Option<u16> {
        if !self.port_hint.is_match(line) {
            return None;
        }
        self.port_digits
            .find_iter(line)
            .last()
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .filter(|p| *p > 0)
    }

    async fn spawn_child(
        &self,
        name: &str,
        program: &Path,
        args: &[String],
        capture_stdout: bool,
    ) -> Result<(u32, watch::Receiver<bool>, Option<mpsc::Receiver<String>>), SupervisorError> {
        let mut cmd = TokioCommand::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(if capture_stdout {
                std::process::Stdio::piped()
            } else {
                std::process::Stdio::null()
            })
            .stderr(std::process::Stdio::null())
            .kill_on_drop(false);

        if let Some(dir) = program.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }

        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            program: program.display().to_string(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| SupervisorError::SpawnFailed {
            program: program.display().to_string(),
            reason: "no PID for spawned process".to_string(),
        })?;

        let lines_rx = if capture_stdout {
            let stdout = child.stdout.take();
            let (tx, rx) = mpsc::channel::<String>(256);
            if let Some(stdout) = stdout {
                tokio::spawn(async move {
                    let reader = BufReader::new(stdout);
                    let mut lines = reader.lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Some(rx)
        } else {
            None
        };

        let (running_tx, running_rx) = watch::channel(true);
        let waiter_name = name.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!("'{}' exited with {}", waiter_name, status),
                Err(e) => tracing::warn!("Wait for '{}' failed: {}", waiter_name, e),
            }
            let _ = running_tx.send(false);
        });

        tracing::info!("Spawned '{}' (pid {})", name, pid);
        Ok((pid, running_rx, lines_rx))
    }
}

// ── Platform termination ─────────────────────────────────────

/// Ask a process to stop (`force = false`) or kill it outright (`force = true`).
pub fn terminate_pid(pid: u32, force: bool) -> anyhow::Result<()> {
    #[cfg(target_os = "windows")]
    {
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
        use winapi::um::winnt::PROCESS_TERMINATE;

        // Windows has no cross-process graceful signal for console-less
        // children; both paths go through TerminateProcess.
        let _ = force;
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                anyhow::bail!("failed to open process {}", pid);
            }
            let result = TerminateProcess(handle, 0);
            CloseHandle(handle);
            if result == 0 {
                anyhow::bail!("TerminateProcess failed for {}", pid);
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        signal::kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| anyhow::anyhow!("failed to signal {}: {}", pid, e))
    }
}
