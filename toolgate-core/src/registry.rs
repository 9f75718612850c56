//! Backend registry and child-process supervisor.
//!
//! Each descriptor owns exactly one runtime state and at most one child
//! process. A monitor task owns the `Child` handle and selects between an
//! unexpected exit (which transitions the backend to `error` and destroys
//! its proxy) and an operator stop (which runs the polite escalation:
//! SIGTERM to the process group, a five second grace, then SIGKILL).
//! Registration order is preserved; `find_server_for_tool` walks it so the
//! first registered owner of a tool name wins, with a warning logged on
//! later duplicates.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::GatewayError;
use crate::proxy::{BackendClient, ToolDescriptor};

/// Interval between spawn and the first liveness check.
const SETTLE_INTERVAL: Duration = Duration::from_millis(100);

/// Grace after the polite termination signal before force kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Stderr bytes retained per backend.
const STDERR_TAIL_BYTES: usize = 500;

/// Deadline for the initialize/tools-list discovery exchange.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the optional liveness ping.
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for one liveness ping.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Supervisor-visible state of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// No process.
    Stopped,
    /// Spawned, settling or handshaking.
    Starting,
    /// Discovered and serving.
    Running,
    /// Exited abnormally or failed to start; stays until restarted.
    Error,
}

/// One backend's row in a `status()` report.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusReport {
    /// Backend id.
    pub id: String,
    /// Current supervisor state.
    pub status: ServerStatus,
    /// Discovered tool count.
    pub tool_count: usize,
    /// Seconds since the process entered `running`, when it is running.
    pub uptime_secs: Option<u64>,
    /// Last captured error text (stderr tail or exit description).
    pub last_error: Option<String>,
}

type StopRequest = oneshot::Sender<()>;

struct ServerRuntime {
    status: ServerStatus,
    proxy: Option<Arc<BackendClient>>,
    tools: Vec<ToolDescriptor>,
    last_error: Option<String>,
    started_at: Option<Instant>,
    restart_count: u32,
    ever_started: bool,
    stop_tx: Option<mpsc::Sender<StopRequest>>,
    // Monitor tasks from a previous start must not touch newer state.
    generation: u64,
}

struct ManagedServer {
    config: ServerConfig,
    runtime: Mutex<ServerRuntime>,
    stderr_tail: Arc<std::sync::Mutex<VecDeque<u8>>>,
}

impl ManagedServer {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            runtime: Mutex::new(ServerRuntime {
                status: ServerStatus::Stopped,
                proxy: None,
                tools: Vec::new(),
                last_error: None,
                started_at: None,
                restart_count: 0,
                ever_started: false,
                stop_tx: None,
                generation: 0,
            }),
            stderr_tail: Arc::new(std::sync::Mutex::new(VecDeque::new())),
        }
    }

    fn stderr_tail_text(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().ok()?;
        if tail.is_empty() {
            return None;
        }
        let bytes: Vec<u8> = tail.iter().copied().collect();
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Registry of managed backends, indexed by id, iterated in registration
/// order.
pub struct ServerRegistry {
    servers: Vec<Arc<ManagedServer>>,
}

impl ServerRegistry {
    /// Build a registry from descriptors, preserving their order.
    pub fn new(configs: Vec<ServerConfig>) -> Self {
        Self {
            servers: configs.into_iter().map(|c| Arc::new(ManagedServer::new(c))).collect(),
        }
    }

    fn find(&self, id: &str) -> Option<&Arc<ManagedServer>> {
        self.servers.iter().find(|s| s.config.id == id)
    }

    /// Registered backend ids, in order.
    pub fn server_ids(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.config.id.clone()).collect()
    }

    /// Start one backend: spawn, settle, handshake, discover.
    ///
    /// A disabled backend refuses to start; a running one returns
    /// immediately. Re-starting a previously started backend increments its
    /// restart count.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Spawn`] when the backend is unknown or
    /// disabled, the command cannot be spawned, the process dies during the
    /// settle interval, or the handshake fails.
    pub async fn start(&self, id: &str) -> Result<(), GatewayError> {
        let server = self.find(id).ok_or_else(|| GatewayError::Spawn {
            server_id: id.to_string(),
            reason: "unknown backend".to_string(),
        })?;
        if !server.config.enabled {
            return Err(GatewayError::Spawn {
                server_id: id.to_string(),
                reason: "backend is disabled".to_string(),
            });
        }

        let mut runtime = server.runtime.lock().await;
        if runtime.status == ServerStatus::Running {
            return Ok(());
        }
        if runtime.ever_started {
            runtime.restart_count += 1;
        }
        runtime.ever_started = true;
        runtime.generation += 1;
        runtime.status = ServerStatus::Starting;
        runtime.last_error = None;
        let generation = runtime.generation;
        if let Ok(mut tail) = server.stderr_tail.lock() {
            tail.clear();
        }

        info!(
            server_id = id,
            command = %server.config.command,
            restart_count = runtime.restart_count,
            "starting backend"
        );

        // The descriptor env overlays the inherited process environment; the
        // merged result stays inside the child and is never shown to callers.
        let mut command = Command::new(&server.config.command);
        command
            .args(&server.config.args)
            .envs(&server.config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                runtime.status = ServerStatus::Error;
                runtime.last_error = Some(e.to_string());
                return Err(GatewayError::Spawn {
                    server_id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.kill().await;
            runtime.status = ServerStatus::Error;
            runtime.last_error = Some("failed to capture child stdio".to_string());
            return Err(GatewayError::Spawn {
                server_id: id.to_string(),
                reason: "failed to capture child stdio".to_string(),
            });
        };
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_capture(stderr, Arc::clone(&server.stderr_tail));
        }

        let timeout = Duration::from_millis(server.config.timeout_ms);
        let proxy = Arc::new(BackendClient::new(stdout, stdin, timeout));

        // Settle: a command that dies immediately is a start failure, not a
        // crash of a running backend.
        tokio::time::sleep(SETTLE_INTERVAL).await;
        if let Ok(Some(status)) = child.try_wait() {
            proxy.shutdown();
            let tail = server.stderr_tail_text();
            let reason = format!(
                "exited during startup with {status}{}",
                tail.as_deref().map(|t| format!(": {t}")).unwrap_or_default()
            );
            runtime.status = ServerStatus::Error;
            runtime.last_error = Some(reason.clone());
            return Err(GatewayError::Spawn {
                server_id: id.to_string(),
                reason,
            });
        }

        match proxy.initialize("toolgate").await {
            Ok(_) => {}
            Err(e) => {
                proxy.shutdown();
                let _ = child.kill().await;
                let _ = child.wait().await;
                runtime.status = ServerStatus::Error;
                runtime.last_error = Some(format!("initialize failed: {e}"));
                return Err(GatewayError::Spawn {
                    server_id: id.to_string(),
                    reason: format!("initialize failed: {e}"),
                });
            }
        }

        let tools = match tokio::time::timeout(DISCOVERY_TIMEOUT, proxy.list_tools()).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(e)) => {
                warn!(server_id = id, error = %e, "tool discovery failed, starting with empty set");
                Vec::new()
            }
            Err(_) => {
                warn!(server_id = id, "tool discovery timed out, starting with empty set");
                Vec::new()
            }
        };
        self.warn_duplicate_tools(id, &tools).await;

        let (stop_tx, stop_rx) = mpsc::channel(1);
        tokio::spawn(monitor(
            child,
            Arc::clone(server),
            Arc::clone(&proxy),
            stop_rx,
            generation,
        ));
        if server.config.health_check {
            spawn_health_check(Arc::clone(server), Arc::clone(&proxy), generation);
        }

        info!(server_id = id, tool_count = tools.len(), "backend running");
        runtime.status = ServerStatus::Running;
        runtime.proxy = Some(proxy);
        runtime.tools = tools;
        runtime.started_at = Some(Instant::now());
        runtime.stop_tx = Some(stop_tx);
        Ok(())
    }

    /// Stop one backend via the polite escalation. A backend without a
    /// process is left as-is.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Spawn`] when the backend id is unknown.
    pub async fn stop(&self, id: &str) -> Result<(), GatewayError> {
        let server = self.find(id).ok_or_else(|| GatewayError::Spawn {
            server_id: id.to_string(),
            reason: "unknown backend".to_string(),
        })?;

        let stop_tx = {
            let mut runtime = server.runtime.lock().await;
            runtime.stop_tx.take()
        };
        let Some(stop_tx) = stop_tx else {
            debug!(server_id = id, "stop on backend without a process");
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if stop_tx.send(ack_tx).await.is_ok() {
            // The monitor escalates to SIGKILL within STOP_GRACE; a little
            // slack covers the final wait.
            let _ = tokio::time::timeout(STOP_GRACE + Duration::from_secs(2), ack_rx).await;
        }
        info!(server_id = id, "backend stopped");
        Ok(())
    }

    /// Start every enabled backend, logging failures instead of aborting.
    pub async fn start_enabled(&self) {
        for server in &self.servers {
            if !server.config.enabled {
                debug!(server_id = %server.config.id, "skipping disabled backend");
                continue;
            }
            if let Err(e) = self.start(&server.config.id).await {
                warn!(server_id = %server.config.id, error = %e, "backend failed to start");
            }
        }
    }

    /// Stop every backend; no child outlives this call.
    pub async fn stop_all(&self) {
        for server in &self.servers {
            let _ = self.stop(&server.config.id).await;
        }
    }

    /// Replace one backend's discovered tool set.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Spawn`] when the backend id is unknown.
    pub async fn register_tools(
        &self,
        id: &str,
        tools: Vec<ToolDescriptor>,
    ) -> Result<(), GatewayError> {
        let server = self.find(id).ok_or_else(|| GatewayError::Spawn {
            server_id: id.to_string(),
            reason: "unknown backend".to_string(),
        })?;
        self.warn_duplicate_tools(id, &tools).await;
        let mut runtime = server.runtime.lock().await;
        runtime.tools = tools;
        Ok(())
    }

    async fn warn_duplicate_tools(&self, id: &str, tools: &[ToolDescriptor]) {
        for server in &self.servers {
            if server.config.id == id {
                continue;
            }
            // Best-effort: callers may hold their own entry's lock, so a
            // contended sibling is skipped rather than waited on.
            let Ok(runtime) = server.runtime.try_lock() else {
                continue;
            };
            for tool in tools {
                if runtime.tools.iter().any(|t| t.name == tool.name) {
                    warn!(
                        tool = %tool.name,
                        owner = %server.config.id,
                        duplicate = id,
                        "duplicate tool name; first-registered backend wins"
                    );
                }
            }
        }
    }

    /// Resolve a tool name to its owning backend.
    ///
    /// Walks backends in registration order and returns the first whose
    /// discovered set contains the name, together with its proxy (when
    /// running) and its per-call deadline.
    pub async fn find_server_for_tool(
        &self,
        name: &str,
    ) -> Option<(String, Option<Arc<BackendClient>>, Duration)> {
        for server in &self.servers {
            let runtime = server.runtime.lock().await;
            if runtime.tools.iter().any(|t| t.name == name) {
                return Some((
                    server.config.id.clone(),
                    runtime.proxy.clone(),
                    Duration::from_millis(server.config.timeout_ms),
                ));
            }
        }
        None
    }

    /// All discovered tools as `(server id, descriptor)` pairs, in
    /// registration order.
    pub async fn all_tools(&self) -> Vec<(String, ToolDescriptor)> {
        let mut out = Vec::new();
        for server in &self.servers {
            let runtime = server.runtime.lock().await;
            for tool in &runtime.tools {
                out.push((server.config.id.clone(), tool.clone()));
            }
        }
        out
    }

    /// Per-backend supervisor report.
    pub async fn status(&self) -> Vec<ServerStatusReport> {
        let mut out = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            let runtime = server.runtime.lock().await;
            out.push(ServerStatusReport {
                id: server.config.id.clone(),
                status: runtime.status,
                tool_count: runtime.tools.len(),
                uptime_secs: match runtime.status {
                    ServerStatus::Running => {
                        runtime.started_at.map(|t| t.elapsed().as_secs())
                    }
                    _ => None,
                },
                last_error: runtime.last_error.clone(),
            });
        }
        out
    }

    /// Restart count for one backend (0 when unknown).
    pub async fn restart_count(&self, id: &str) -> u32 {
        match self.find(id) {
            Some(server) => server.runtime.lock().await.restart_count,
            None => 0,
        }
    }
}

/// Periodic liveness ping for backends with `health_check` enabled. A
/// backend that answers at all (even with method-not-found) is alive; only
/// a timeout or transport fault is reported. The loop ends when the backend
/// leaves the running state or is restarted into a new generation.
fn spawn_health_check(server: Arc<ManagedServer>, proxy: Arc<BackendClient>, generation: u64) {
    use crate::proxy::ProxyError;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(HEALTH_INTERVAL);
        tick.tick().await; // skip the immediate first tick
        loop {
            tick.tick().await;
            {
                let runtime = server.runtime.lock().await;
                if runtime.generation != generation || runtime.status != ServerStatus::Running {
                    break;
                }
            }
            match proxy
                .request("ping", serde_json::json!({}), Some(HEALTH_TIMEOUT))
                .await
            {
                Ok(_) | Err(ProxyError::Remote { .. }) => {}
                Err(ProxyError::Destroyed) => break,
                Err(e) => {
                    warn!(server_id = %server.config.id, error = %e, "health check failed");
                }
            }
        }
    });
}

/// Accumulate stderr into a bounded ring so crash reports carry the tail.
fn spawn_stderr_capture(
    stderr: tokio::process::ChildStderr,
    tail: Arc<std::sync::Mutex<VecDeque<u8>>>,
) {
    use tokio::io::AsyncReadExt;
    tokio::spawn(async move {
        let mut stderr = stderr;
        let mut buf = [0u8; 512];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut tail) = tail.lock() {
                        tail.extend(&buf[..n]);
                        while tail.len() > STDERR_TAIL_BYTES {
                            tail.pop_front();
                        }
                    }
                }
            }
        }
    });
}

/// Owns the child for its lifetime: observes exit, serves stop requests.
async fn monitor(
    mut child: tokio::process::Child,
    server: Arc<ManagedServer>,
    proxy: Arc<BackendClient>,
    mut stop_rx: mpsc::Receiver<StopRequest>,
    generation: u64,
) {
    tokio::select! {
        status = child.wait() => {
            proxy.shutdown();
            let mut runtime = server.runtime.lock().await;
            if runtime.generation != generation {
                return;
            }
            runtime.proxy = None;
            runtime.stop_tx = None;
            runtime.started_at = None;
            match status {
                Ok(status) if status.success() => {
                    info!(server_id = %server.config.id, "backend exited cleanly");
                    runtime.status = ServerStatus::Stopped;
                }
                Ok(status) => {
                    let tail = server.stderr_tail_text();
                    let text = format!(
                        "exited with {status}{}",
                        tail.as_deref().map(|t| format!(": {t}")).unwrap_or_default()
                    );
                    warn!(server_id = %server.config.id, %text, "backend crashed");
                    runtime.status = ServerStatus::Error;
                    runtime.last_error = Some(text);
                }
                Err(e) => {
                    warn!(server_id = %server.config.id, error = %e, "wait on backend failed");
                    runtime.status = ServerStatus::Error;
                    runtime.last_error = Some(e.to_string());
                }
            }
        }
        Some(ack) = stop_rx.recv() => {
            graceful_stop(&server.config.id, &mut child).await;
            proxy.shutdown();
            let mut runtime = server.runtime.lock().await;
            if runtime.generation == generation {
                runtime.status = ServerStatus::Stopped;
                runtime.proxy = None;
                runtime.stop_tx = None;
                runtime.started_at = None;
            }
            drop(runtime);
            let _ = ack.send(());
        }
    }
}

/// Polite termination: SIGTERM to the process group, `STOP_GRACE`, SIGKILL,
/// then collect the exit status so no zombie remains.
async fn graceful_stop(server_id: &str, child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            debug!(server_id, pid, "sending SIGTERM to process group");
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(server_id, pid, error = ?e, "killpg SIGTERM failed");
            }
        }
    }

    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(server_id, ?status, "backend exited after polite stop");
            return;
        }
        Ok(Err(e)) => {
            warn!(server_id, error = %e, "wait failed after polite stop");
        }
        Err(_) => {
            warn!(server_id, "backend ignored polite stop, killing");
        }
    }

    if let Err(e) = child.kill().await {
        warn!(server_id, error = %e, "force kill failed");
    }
    let _ = child.wait().await;
}
