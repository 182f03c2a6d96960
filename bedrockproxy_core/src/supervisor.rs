//! Process Supervisor (component C, §4.2).
//!
//! Grounded on `other_examples/duelsplus-launcher-tauri`'s `ProxyManager`:
//! `tokio::process::Command` with piped stdio, a task reading `stdout`
//! and `stderr` line-by-line via `BufReader::lines()` inside a
//! `tokio::select!`, and a graceful-then-escalated `stop()`. Player
//! join/leave detection and the bounded ring buffer are new to this
//! domain; the log-pattern matching follows the same "parse a captured
//! line, possibly emit a typed event" shape the launcher uses to recognise
//! its own child's readiness lines.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use bedrockproxy_api::model::{ConsoleLine, ConsoleStreamKind, LastExit};
use once_cell::sync::Lazy;
use regex::Regex;
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

const DEFAULT_RING_CAPACITY: usize = 1000;
const GRACEFUL_STOP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const RESTART_BETWEEN_WAIT: std::time::Duration = std::time::Duration::from_secs(15);
const AUTO_RESTART_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

static PLAYER_CONNECTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Player connected:\s*([^,]+),\s*xuid:\s*(\d+)").expect("valid regex")
});
static PLAYER_DISCONNECTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Player disconnected:\s*([^,]+),\s*xuid:\s*(\d+),").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ProcessState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    StateChanged {
        id: Uuid,
        state: ProcessState,
        last_exit: Option<LastExit>,
    },
    ConsoleOutput {
        id: Uuid,
        line: ConsoleLine,
    },
    PlayerJoined {
        id: Uuid,
        name: String,
        xuid: Option<String>,
    },
    PlayerLeft {
        id: Uuid,
        name: String,
        xuid: Option<String>,
    },
}

pub type EventCallback = Arc<dyn Fn(SupervisorEvent) + Send + Sync>;

/// Signal sent to the task that owns a managed child's `Child` handle.
/// The driving task is the only place that touches `Child` (it needs it
/// for `wait()`), so stop/escalation requests go through this channel
/// rather than fighting over a shared lock.
enum ProcessControl {
    /// Graceful terminate: SIGTERM on unix (via the child's pid), a plain
    /// kill on platforms with no separate graceful signal.
    Terminate,
    /// Escalated/forced: SIGKILL on unix, `Child::start_kill` elsewhere.
    Kill,
}

struct ManagedProcess {
    state: RwLock<ProcessState>,
    stdin: RwLock<Option<ChildStdin>>,
    ring: RwLock<VecDeque<ConsoleLine>>,
    ring_capacity: usize,
    auto_restart: AtomicBool,
    executable_path: RwLock<String>,
    args: RwLock<Vec<String>>,
    stopping: AtomicBool,
    stop_notify: Notify,
    control_tx: mpsc::UnboundedSender<ProcessControl>,
}

impl ManagedProcess {
    async fn push_line(&self, text: String, stream: ConsoleStreamKind) -> ConsoleLine {
        let line = ConsoleLine {
            timestamp: OffsetDateTime::now_utc(),
            text,
            stream,
        };
        let mut ring = self.ring.write().await;
        if ring.len() >= self.ring_capacity {
            ring.pop_front();
        }
        ring.push_back(line.clone());
        line
    }
}

/// Owns every managed child process, keyed by server record id.
pub struct ProcessSupervisor {
    processes: RwLock<HashMap<Uuid, Arc<ManagedProcess>>>,
    event_cb: RwLock<Option<EventCallback>>,
    ring_capacity: usize,
}

impl ProcessSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            processes: RwLock::new(HashMap::new()),
            event_cb: RwLock::new(None),
            ring_capacity: DEFAULT_RING_CAPACITY,
        })
    }

    pub async fn set_event_callback(&self, cb: EventCallback) {
        *self.event_cb.write().await = Some(cb);
    }

    async fn emit(&self, event: SupervisorEvent) {
        if let Some(cb) = self.event_cb.read().await.as_ref() {
            cb(event);
        }
    }

    pub async fn state_of(&self, id: Uuid) -> Option<ProcessState> {
        let processes = self.processes.read().await;
        let process = processes.get(&id)?;
        Some(*process.state.read().await)
    }

    /// Spawns the process acknowledging the request before the child has
    /// actually printed a readiness line (§4.2: "returns after the spawn is
    /// acknowledged").
    pub async fn start(
        self: &Arc<Self>,
        id: Uuid,
        executable_path: &str,
        args: &[String],
        auto_restart: bool,
    ) -> anyhow::Result<()> {
        {
            let processes = self.processes.read().await;
            if let Some(existing) = processes.get(&id) {
                let state = *existing.state.read().await;
                if matches!(state, ProcessState::Starting | ProcessState::Running) {
                    bail!("process for {} is already {}", id, state.as_str());
                }
            }
        }

        let working_dir = std::path::Path::new(executable_path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from("."));

        let mut command = Command::new(executable_path);
        command
            .args(args)
            .current_dir(&working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let process = Arc::new(ManagedProcess {
            state: RwLock::new(ProcessState::Starting),
            stdin: RwLock::new(None),
            ring: RwLock::new(VecDeque::new()),
            ring_capacity: self.ring_capacity,
            auto_restart: AtomicBool::new(auto_restart),
            executable_path: RwLock::new(executable_path.to_owned()),
            args: RwLock::new(args.to_vec()),
            stopping: AtomicBool::new(false),
            stop_notify: Notify::new(),
            control_tx,
        });
        self.processes.write().await.insert(id, process.clone());
        self.emit(SupervisorEvent::StateChanged {
            id,
            state: ProcessState::Starting,
            last_exit: None,
        })
        .await;

        let mut child: Child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", executable_path))?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;
        *process.stdin.write().await = stdin;
        *process.state.write().await = ProcessState::Running;
        self.emit(SupervisorEvent::StateChanged {
            id,
            state: ProcessState::Running,
            last_exit: None,
        })
        .await;

        tokio::spawn({
            let this = self.clone();
            let process = process.clone();
            async move {
                this.drive_process(id, process, child, stdout, stderr, control_rx)
                    .await;
            }
        });

        Ok(())
    }

    async fn drive_process(
        self: Arc<Self>,
        id: Uuid,
        process: Arc<ManagedProcess>,
        mut child: Child,
        stdout: tokio::process::ChildStdout,
        stderr: tokio::process::ChildStderr,
        mut control_rx: mpsc::UnboundedReceiver<ProcessControl>,
    ) {
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_done = false;
        let mut stderr_done = false;

        loop {
            tokio::select! {
                line = stdout_lines.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(text)) => self.handle_line(id, &process, text, ConsoleStreamKind::Stdout).await,
                        _ => stdout_done = true,
                    }
                }
                line = stderr_lines.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(text)) => self.handle_line(id, &process, text, ConsoleStreamKind::Stderr).await,
                        _ => stderr_done = true,
                    }
                }
                ctrl = control_rx.recv() => {
                    match ctrl {
                        Some(ProcessControl::Terminate) => terminate_child(&mut child),
                        Some(ProcessControl::Kill) => { let _ = child.start_kill(); }
                        None => {}
                    }
                }
                status = child.wait(), if stdout_done && stderr_done => {
                    let exit = status.ok();
                    self.clone().handle_exit(id, &process, exit).await;
                    return;
                }
            }
        }
    }

    async fn handle_line(
        &self,
        id: Uuid,
        process: &Arc<ManagedProcess>,
        raw: String,
        stream: ConsoleStreamKind,
    ) {
        if raw.trim().is_empty() {
            return;
        }
        let now = OffsetDateTime::now_utc();
        let prefixed = format!(
            "[{:02}:{:02}:{:02}] {}",
            now.hour(),
            now.minute(),
            now.second(),
            raw
        );
        let line = process.push_line(prefixed, stream).await;
        self.emit(SupervisorEvent::ConsoleOutput { id, line }).await;

        if stream != ConsoleStreamKind::Stdout {
            return;
        }
        if let Some(caps) = PLAYER_CONNECTED.captures(&raw) {
            self.emit(SupervisorEvent::PlayerJoined {
                id,
                name: caps[1].trim().to_owned(),
                xuid: Some(caps[2].to_owned()),
            })
            .await;
        } else if let Some(caps) = PLAYER_DISCONNECTED.captures(&raw) {
            self.emit(SupervisorEvent::PlayerLeft {
                id,
                name: caps[1].trim().to_owned(),
                xuid: Some(caps[2].to_owned()),
            })
            .await;
        }
    }

    async fn handle_exit(
        self: Arc<Self>,
        id: Uuid,
        process: &Arc<ManagedProcess>,
        status: Option<std::process::ExitStatus>,
    ) {
        let was_stopping = process.stopping.load(Ordering::SeqCst);
        let code = status.and_then(|s| s.code());
        #[cfg(unix)]
        let signal = status.and_then(|s| {
            use std::os::unix::process::ExitStatusExt;
            s.signal().map(|sig| sig.to_string())
        });
        #[cfg(not(unix))]
        let signal: Option<String> = None;

        let last_exit = LastExit {
            code,
            signal,
            time: OffsetDateTime::now_utc(),
        };

        let abnormal = !was_stopping && code.map(|c| c != 0).unwrap_or(true);
        let final_state = if abnormal {
            ProcessState::Error
        } else {
            ProcessState::Stopped
        };
        *process.state.write().await = final_state;
        *process.stdin.write().await = None;
        process.stop_notify.notify_waiters();
        self.emit(SupervisorEvent::StateChanged {
            id,
            state: final_state,
            last_exit: Some(last_exit),
        })
        .await;

        if abnormal && process.auto_restart.load(Ordering::SeqCst) {
            let executable_path = process.executable_path.read().await.clone();
            let args = process.args.read().await.clone();
            let supervisor = Arc::downgrade(&self);
            tokio::spawn(async move {
                tokio::time::sleep(AUTO_RESTART_DELAY).await;
                if let Some(supervisor) = supervisor.upgrade() {
                    let _ = supervisor.start(id, &executable_path, &args, true).await;
                }
            });
        }
    }

    /// Sends a graceful terminate signal, escalating to a kill after 10s.
    pub async fn stop(&self, id: Uuid, force: bool) -> anyhow::Result<()> {
        let process = {
            let processes = self.processes.read().await;
            processes.get(&id).cloned()
        };
        let Some(process) = process else {
            bail!("PROCESS_NOT_RUNNING");
        };
        {
            let state = *process.state.read().await;
            if state == ProcessState::Stopped {
                bail!("PROCESS_NOT_RUNNING");
            }
        }
        process.stopping.store(true, Ordering::SeqCst);
        *process.state.write().await = ProcessState::Stopping;
        self.emit(SupervisorEvent::StateChanged {
            id,
            state: ProcessState::Stopping,
            last_exit: None,
        })
        .await;

        if force {
            let _ = process.control_tx.send(ProcessControl::Kill);
        } else {
            let _ = process.control_tx.send(ProcessControl::Terminate);
            let process = process.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(GRACEFUL_STOP_TIMEOUT) => {
                        // Still alive past the grace period: escalate.
                        let _ = process.control_tx.send(ProcessControl::Kill);
                    }
                    _ = process.stop_notify.notified() => {}
                }
            });
        }
        Ok(())
    }

    pub async fn restart(
        self: &Arc<Self>,
        id: Uuid,
        executable_path: &str,
        args: &[String],
    ) -> anyhow::Result<()> {
        let _ = self.stop(id, false).await;
        let deadline = tokio::time::Instant::now() + RESTART_BETWEEN_WAIT;
        loop {
            if matches!(self.state_of(id).await, Some(ProcessState::Stopped) | None) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        self.start(id, executable_path, args, false).await
    }

    pub async fn send_command(&self, id: Uuid, line: &str) -> anyhow::Result<()> {
        let process = {
            let processes = self.processes.read().await;
            processes.get(&id).cloned()
        };
        let Some(process) = process else {
            bail!("PROCESS_NOT_RUNNING");
        };
        if *process.state.read().await != ProcessState::Running {
            bail!("PROCESS_NOT_RUNNING");
        }
        let mut stdin_guard = process.stdin.write().await;
        let Some(stdin) = stdin_guard.as_mut() else {
            bail!("PROCESS_NOT_RUNNING");
        };
        stdin
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .context("failed to write to child stdin")?;
        drop(stdin_guard);
        process
            .push_line(format!("> {}", line), ConsoleStreamKind::Stdin)
            .await;
        Ok(())
    }

    pub async fn get_console_output(&self, id: Uuid, n: Option<usize>) -> Option<Vec<ConsoleLine>> {
        let processes = self.processes.read().await;
        let process = processes.get(&id)?;
        let ring = process.ring.read().await;
        let lines: Vec<ConsoleLine> = match n {
            Some(n) => ring.iter().rev().take(n).rev().cloned().collect(),
            None => ring.iter().cloned().collect(),
        };
        Some(lines)
    }

    pub async fn cleanup(&self, id: Uuid) {
        if let Some(process) = self.processes.write().await.remove(&id) {
            process.stop_notify.notify_waiters();
        }
    }

    pub async fn cleanup_all(&self) {
        let ids: Vec<Uuid> = self.processes.read().await.keys().copied().collect();
        for id in ids {
            let _ = self.stop(id, true).await;
            self.cleanup(id).await;
        }
    }
}

/// Sends a graceful terminate request to a child: SIGTERM via its pid on
/// unix (grounded on `duelsplus-launcher-tauri::ProxyManager::stop`'s
/// `nix::sys::signal::kill(pid, SIGTERM)` fallback path), or an outright
/// kill on platforms without a distinct graceful signal.
fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_player_connected_line() {
        let caps = PLAYER_CONNECTED
            .captures("Player connected: Steve, xuid: 1234567890")
            .unwrap();
        assert_eq!(&caps[1], "Steve");
        assert_eq!(&caps[2], "1234567890");
    }

    #[test]
    fn matches_player_disconnected_line() {
        let caps = PLAYER_DISCONNECTED
            .captures("Player disconnected: Steve, xuid: 1234567890, reason: disconnect")
            .unwrap();
        assert_eq!(&caps[1], "Steve");
        assert_eq!(&caps[2], "1234567890");
    }

    #[tokio::test]
    async fn ring_buffer_evicts_fifo_beyond_capacity() {
        let (control_tx, _control_rx) = mpsc::unbounded_channel();
        let process = ManagedProcess {
            state: RwLock::new(ProcessState::Running),
            stdin: RwLock::new(None),
            ring: RwLock::new(VecDeque::new()),
            ring_capacity: 3,
            auto_restart: AtomicBool::new(false),
            executable_path: RwLock::new(String::new()),
            args: RwLock::new(Vec::new()),
            stopping: AtomicBool::new(false),
            stop_notify: Notify::new(),
            control_tx,
        };
        for i in 0..5 {
            process
                .push_line(format!("line {}", i), ConsoleStreamKind::Stdout)
                .await;
        }
        let ring = process.ring.read().await;
        assert_eq!(ring.len(), 3);
        assert_eq!(ring[0].text, "line 2");
        assert_eq!(ring[2].text, "line 4");
    }

    #[tokio::test]
    async fn start_rejects_unknown_executable() {
        let supervisor = ProcessSupervisor::new();
        let result = supervisor
            .start(Uuid::new_v4(), "/nonexistent/executable/path", &[], false)
            .await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn graceful_stop_terminates_a_running_child() {
        let supervisor = ProcessSupervisor::new();
        let id = Uuid::new_v4();
        supervisor
            .start(id, "/bin/sleep", &["5".to_string()], false)
            .await
            .unwrap();

        // Let the child reach `running` before asking it to stop.
        for _ in 0..20 {
            if supervisor.state_of(id).await == Some(ProcessState::Running) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(supervisor.state_of(id).await, Some(ProcessState::Running));

        supervisor.stop(id, false).await.unwrap();

        let mut final_state = None;
        for _ in 0..40 {
            let state = supervisor.state_of(id).await;
            if matches!(state, Some(ProcessState::Stopped) | Some(ProcessState::Error)) {
                final_state = state;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        // SIGTERM should end `sleep 5` well before it would exit on its own,
        // and well before the 10s kill escalation would ever fire.
        assert_eq!(final_state, Some(ProcessState::Stopped));
    }
}
