//! Process supervision: the narrow start/stop/list interface the registry
//! consumes, and a local implementation built on `tokio::process`.

use crate::config::ServiceConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pause before relaunching a process that exited
const RESTART_DELAY_MS: u64 = 100;

/// How long a freshly spawned process must survive to count as launched
const DEFAULT_LAUNCH_CHECK_MS: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid command line: {0}")]
    InvalidCommand(String),

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("process exited during launch ({0})")]
    ExitedEarly(String),

    #[error("failed to stop process: {0}")]
    Stop(String),

    #[error("supervisor has been shut down")]
    ShutDown,
}

/// Everything the supervisor needs to launch one service
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub name: String,
    pub command: String,
    pub port: u16,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub instances: u32,
    pub auto_restart: bool,
    pub max_restarts: u32,
}

impl StartRequest {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            name: config.name.clone(),
            command: config.command.clone(),
            port: config.port,
            env: config.env.clone(),
            working_dir: config.working_dir.clone(),
            instances: config.instances.max(1),
            auto_restart: config.auto_restart,
            max_restarts: config.max_restarts,
        }
    }
}

/// What the supervisor knows about one launched service
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProcessInfo {
    pub name: String,
    /// Live process ids, one per instance currently alive
    pub pids: Vec<u32>,
    pub instances: usize,
    /// Automatic relaunches across all instances
    pub restarts: u32,
}

/// Launches and stops service processes by name.
///
/// A successful `start` means the process was launched, not that it is
/// accepting connections. `stop` of an unknown or already exited service
/// succeeds.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Launch the service and return the id of its first process
    async fn start(&self, request: &StartRequest) -> Result<u32, SupervisorError>;

    /// Stop every process of the service
    async fn stop(&self, name: &str) -> Result<(), SupervisorError>;

    /// Report the services currently launched
    async fn list(&self) -> Result<Vec<ProcessInfo>, SupervisorError>;

    /// Release the supervisor; later starts fail
    async fn shutdown(&self) -> Result<(), SupervisorError> {
        Ok(())
    }
}

/// Shared supervisor handle
pub type SharedSupervisor = Arc<dyn ProcessSupervisor>;

/// One launched process and the task watching it
struct InstanceHandle {
    pid: Arc<AtomicU32>,
    restarts: Arc<AtomicU32>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ProcessGroup {
    instances: Vec<InstanceHandle>,
}

/// Settings shared by the monitor task of every instance of a service
#[derive(Clone)]
struct InstanceContext {
    service: String,
    index: u32,
    argv: Arc<Vec<String>>,
    request: Arc<StartRequest>,
    grace_period: Duration,
    pid: Arc<AtomicU32>,
    restarts: Arc<AtomicU32>,
}

/// Runs services as local child processes
pub struct LocalSupervisor {
    groups: DashMap<String, ProcessGroup>,
    grace_period: Duration,
    launch_check: Duration,
    closed: AtomicBool,
}

impl LocalSupervisor {
    /// `grace_period` is the time between SIGTERM and SIGKILL on stop
    pub fn new(grace_period: Duration) -> Self {
        Self {
            groups: DashMap::new(),
            grace_period,
            launch_check: Duration::from_millis(DEFAULT_LAUNCH_CHECK_MS),
            closed: AtomicBool::new(false),
        }
    }

    /// Set how long a new process must stay alive to count as launched
    pub fn with_launch_check(mut self, window: Duration) -> Self {
        self.launch_check = window;
        self
    }

    async fn launch_group(&self, request: &StartRequest) -> Result<ProcessGroup, SupervisorError> {
        let argv = shell_words::split(&request.command)
            .map_err(|e| SupervisorError::InvalidCommand(e.to_string()))?;
        if argv.is_empty() {
            return Err(SupervisorError::InvalidCommand("empty command".to_string()));
        }
        let argv = Arc::new(argv);
        let shared_request = Arc::new(request.clone());

        ensure_port_free(request.port).await?;

        if request.instances > 1 {
            warn!(
                service = %request.name,
                instances = request.instances,
                port = request.port,
                "Instances share PORT; the service must use SO_REUSEPORT or run cluster-style"
            );
        }

        let mut instances = Vec::with_capacity(request.instances as usize);
        for index in 0..request.instances.max(1) {
            let launched = match spawn_child(&argv, request, index) {
                Ok(mut child) => match check_launch(&mut child, self.launch_check).await {
                    Ok(()) => Ok(child),
                    Err(e) => Err(e),
                },
                Err(e) => Err(SupervisorError::Spawn(e)),
            };

            let child = match launched {
                Ok(child) => child,
                Err(e) => {
                    // Don't leave half a group running
                    stop_instances(&request.name, instances).await;
                    return Err(e);
                }
            };

            let pid = child.id().unwrap_or(0);
            info!(service = %request.name, instance = index, pid, "Process spawned");

            let ctx = InstanceContext {
                service: request.name.clone(),
                index,
                argv: Arc::clone(&argv),
                request: Arc::clone(&shared_request),
                grace_period: self.grace_period,
                pid: Arc::new(AtomicU32::new(pid)),
                restarts: Arc::new(AtomicU32::new(0)),
            };
            let (stop_tx, stop_rx) = watch::channel(false);
            let pid = Arc::clone(&ctx.pid);
            let restarts = Arc::clone(&ctx.restarts);
            let task = tokio::spawn(supervise_instance(ctx, child, stop_rx));

            instances.push(InstanceHandle {
                pid,
                restarts,
                stop_tx,
                task,
            });
        }

        Ok(ProcessGroup { instances })
    }
}

#[async_trait]
impl ProcessSupervisor for LocalSupervisor {
    async fn start(&self, request: &StartRequest) -> Result<u32, SupervisorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShutDown);
        }

        if self.groups.contains_key(&request.name) {
            warn!(service = %request.name, "Stopping stale processes before start");
            self.stop(&request.name).await?;
        }

        let group = self.launch_group(request).await?;
        let pid = group
            .instances
            .first()
            .map(|i| i.pid.load(Ordering::SeqCst))
            .unwrap_or(0);
        self.groups.insert(request.name.clone(), group);
        Ok(pid)
    }

    async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let Some((_, group)) = self.groups.remove(name) else {
            debug!(service = name, "No processes to stop");
            return Ok(());
        };

        let failures = stop_instances(name, group.instances).await;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::Stop(failures.join("; ")))
        }
    }

    async fn list(&self) -> Result<Vec<ProcessInfo>, SupervisorError> {
        let mut infos: Vec<ProcessInfo> = self
            .groups
            .iter()
            .map(|entry| {
                let group = entry.value();
                ProcessInfo {
                    name: entry.key().clone(),
                    pids: group
                        .instances
                        .iter()
                        .map(|i| i.pid.load(Ordering::SeqCst))
                        .filter(|pid| *pid != 0)
                        .collect(),
                    instances: group.instances.len(),
                    restarts: group
                        .instances
                        .iter()
                        .map(|i| i.restarts.load(Ordering::SeqCst))
                        .sum(),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.closed.store(true, Ordering::SeqCst);

        let names: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                error!(
                    service = %name,
                    error = %e,
                    "Failed to stop process during supervisor shutdown"
                );
                failures.push(format!("{}: {}", name, e));
            }
        }

        info!("Process supervisor shut down");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::Stop(failures.join("; ")))
        }
    }
}

/// Signal every instance, then wait for each monitor task to finish
async fn stop_instances(service: &str, instances: Vec<InstanceHandle>) -> Vec<String> {
    for instance in &instances {
        let _ = instance.stop_tx.send(true);
    }

    let mut failures = Vec::new();
    for instance in instances {
        if let Err(e) = instance.task.await {
            error!(service, error = %e, "Process monitor task failed");
            failures.push(e.to_string());
        }
    }
    failures
}

/// Fail fast when something already listens on the service port
async fn ensure_port_free(port: u16) -> Result<(), SupervisorError> {
    match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            Err(SupervisorError::PortInUse(port))
        }
        Err(e) => Err(SupervisorError::Spawn(e)),
    }
}

/// A process that exits with a failure inside the launch window never launched
async fn check_launch(child: &mut Child, window: Duration) -> Result<(), SupervisorError> {
    if window.is_zero() {
        return Ok(());
    }

    match tokio::time::timeout(window, child.wait()).await {
        Err(_) => Ok(()),
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(SupervisorError::ExitedEarly(status.to_string())),
        Ok(Err(e)) => Err(SupervisorError::Spawn(e)),
    }
}

fn spawn_child(argv: &[String], request: &StartRequest, index: u32) -> std::io::Result<Child> {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    if let Some(ref working_dir) = request.working_dir {
        cmd.current_dir(working_dir);
    }

    for (key, value) in &request.env {
        cmd.env(key, value);
    }
    cmd.env("PORT", request.port.to_string());
    cmd.env("LAZYGATE_SERVICE", &request.name);
    cmd.env("LAZYGATE_INSTANCE", index.to_string());

    let mut child = cmd.spawn()?;
    forward_output(&request.name, index, &mut child);
    Ok(child)
}

/// Re-emit the child's stdout/stderr as log lines
fn forward_output(service: &str, instance: u32, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let service = service.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(service = %service, instance, "{}", line);
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let service = service.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(service = %service, instance, "{}", line);
            }
        });
    }
}

/// Watch one instance: relaunch it on exit when allowed, terminate it on stop
async fn supervise_instance(
    ctx: InstanceContext,
    mut child: Child,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            status = child.wait() => {
                ctx.pid.store(0, Ordering::SeqCst);
                match status {
                    Ok(status) => warn!(
                        service = %ctx.service,
                        instance = ctx.index,
                        %status,
                        "Process exited"
                    ),
                    Err(e) => error!(
                        service = %ctx.service,
                        instance = ctx.index,
                        error = %e,
                        "Failed waiting for process"
                    ),
                }

                if !ctx.request.auto_restart {
                    return;
                }
                let restarts = ctx.restarts.load(Ordering::SeqCst);
                if restarts >= ctx.request.max_restarts {
                    warn!(
                        service = %ctx.service,
                        instance = ctx.index,
                        restarts,
                        "Restart limit reached, giving up"
                    );
                    return;
                }

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(RESTART_DELAY_MS)) => {}
                    _ = stop_rx.changed() => return,
                }

                match spawn_child(&ctx.argv, &ctx.request, ctx.index) {
                    Ok(new_child) => {
                        child = new_child;
                        let pid = child.id().unwrap_or(0);
                        ctx.pid.store(pid, Ordering::SeqCst);
                        let restarts = ctx.restarts.fetch_add(1, Ordering::SeqCst) + 1;
                        info!(
                            service = %ctx.service,
                            instance = ctx.index,
                            pid,
                            restarts,
                            "Process restarted"
                        );
                    }
                    Err(e) => {
                        error!(
                            service = %ctx.service,
                            instance = ctx.index,
                            error = %e,
                            "Failed to restart process"
                        );
                        return;
                    }
                }
            }
            _ = stop_rx.changed() => {
                terminate(&ctx.service, &mut child, ctx.grace_period).await;
                ctx.pid.store(0, Ordering::SeqCst);
                return;
            }
        }
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL
async fn terminate(service: &str, child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(service, pid, "Sending SIGTERM to process");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(service, ?status, "Process exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(service, error = %e, "Error waiting for process to exit");
        }
        Err(_) => {
            warn!(
                service,
                grace_period_ms = grace_period.as_millis() as u64,
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

/// Scriptable supervisor for unit tests
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    pub(crate) struct MockSupervisor {
        pub starts: AtomicUsize,
        pub stops: AtomicUsize,
        pub start_delay: Mutex<Duration>,
        pub fail_start: Mutex<HashSet<String>>,
        pub fail_stop: Mutex<HashSet<String>>,
        pub running: Mutex<HashMap<String, u32>>,
        pub last_request: Mutex<Option<StartRequest>>,
        next_pid: AtomicU32,
    }

    impl MockSupervisor {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn start_count(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }

        pub fn stop_count(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProcessSupervisor for MockSupervisor {
        async fn start(&self, request: &StartRequest) -> Result<u32, SupervisorError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock() = Some(request.clone());

            let delay = *self.start_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if self.fail_start.lock().contains(&request.name) {
                return Err(SupervisorError::ExitedEarly("exit status: 1".to_string()));
            }
            let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.running.lock().insert(request.name.clone(), pid);
            Ok(pid)
        }

        async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop.lock().contains(name) {
                return Err(SupervisorError::Stop("kill failed".to_string()));
            }
            self.running.lock().remove(name);
            Ok(())
        }

        async fn list(&self) -> Result<Vec<ProcessInfo>, SupervisorError> {
            Ok(self
                .running
                .lock()
                .iter()
                .map(|(name, pid)| ProcessInfo {
                    name: name.clone(),
                    pids: vec![*pid],
                    instances: 1,
                    restarts: 0,
                })
                .collect())
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn request(name: &str, command: &str) -> StartRequest {
        let mut config = ServiceConfig::new(name, command, free_port());
        config.env.insert("GREETING".to_string(), "hi".to_string());
        StartRequest::from_config(&config)
    }

    fn supervisor() -> LocalSupervisor {
        LocalSupervisor::new(Duration::from_secs(1))
    }

    #[test]
    fn test_start_request_from_config() {
        let mut config = ServiceConfig::new("api", "node server.js", 3000);
        config.instances = 0;
        config.auto_restart = true;
        config.max_restarts = 4;
        let request = StartRequest::from_config(&config);
        assert_eq!(request.name, "api");
        assert_eq!(request.command, "node server.js");
        assert_eq!(request.port, 3000);
        assert_eq!(request.instances, 1);
        assert!(request.auto_restart);
        assert_eq!(request.max_restarts, 4);
    }

    #[tokio::test]
    async fn test_start_and_stop_process() {
        let supervisor = supervisor();
        let pid = supervisor.start(&request("sleeper", "sleep 30")).await.unwrap();
        assert!(pid > 0);

        let list = supervisor.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "sleeper");
        assert_eq!(list[0].pids, vec![pid]);

        supervisor.stop("sleeper").await.unwrap();
        assert!(supervisor.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_is_success() {
        let supervisor = supervisor();
        assert!(supervisor.stop("never-started").await.is_ok());
        assert!(supervisor.stop("never-started").await.is_ok());
    }

    #[tokio::test]
    async fn test_multiple_instances() {
        let supervisor = supervisor();
        let mut req = request("pair", "sleep 30");
        req.instances = 2;
        supervisor.start(&req).await.unwrap();

        let list = supervisor.list().await.unwrap();
        assert_eq!(list[0].instances, 2);
        assert_eq!(list[0].pids.len(), 2);

        supervisor.stop("pair").await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_start_failure() {
        let supervisor = supervisor();
        let err = supervisor.start(&request("broken", "sh -c 'exit 3'")).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ExitedEarly(_)));
        assert!(supervisor.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let supervisor = supervisor();
        let err = supervisor
            .start(&request("ghost", "/definitely/not/a/binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_invalid_command_line() {
        let supervisor = supervisor();
        let err = supervisor
            .start(&request("quotes", "sleep 'unterminated"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidCommand(_)));
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let supervisor = supervisor();
        let mut req = request("busy", "sleep 30");
        req.port = port;
        let err = supervisor.start(&req).await.unwrap_err();
        assert!(matches!(err, SupervisorError::PortInUse(p) if p == port));
    }

    #[tokio::test]
    async fn test_auto_restart_stops_at_limit() {
        let supervisor = supervisor();
        let mut req = request("flaky", "sh -c 'sleep 0.2'");
        req.auto_restart = true;
        req.max_restarts = 2;
        supervisor.start(&req).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let list = supervisor.list().await.unwrap();
            if list[0].restarts == 2 && list[0].pids.is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "restarts never reached limit");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        supervisor.stop("flaky").await.unwrap();
    }

    #[tokio::test]
    async fn test_env_and_port_are_passed() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let command = format!(
            "sh -c 'echo \"$PORT $GREETING $LAZYGATE_SERVICE\" > {}; sleep 30'",
            out.display()
        );
        let req = request("envcheck", &command);
        let port = req.port;

        let supervisor = supervisor();
        supervisor.start(&req).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let contents = loop {
            if let Ok(contents) = std::fs::read_to_string(&out) {
                if !contents.is_empty() {
                    break contents;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "child never wrote env file");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(contents.trim(), format!("{} hi envcheck", port));

        supervisor.stop("envcheck").await.unwrap();
    }

    #[tokio::test]
    async fn test_instances_share_port_with_distinct_index() {
        let dir = tempfile::tempdir().unwrap();
        let command = format!(
            "sh -c 'echo $PORT > {}/$LAZYGATE_INSTANCE.txt; sleep 30'",
            dir.path().display()
        );
        let mut req = request("shared", &command);
        req.instances = 2;
        let port = req.port;

        let supervisor = supervisor();
        supervisor.start(&req).await.unwrap();

        for index in 0..2 {
            let out = dir.path().join(format!("{}.txt", index));
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            let contents = loop {
                if let Ok(contents) = std::fs::read_to_string(&out) {
                    if !contents.is_empty() {
                        break contents;
                    }
                }
                assert!(tokio::time::Instant::now() < deadline, "instance {} never wrote", index);
                tokio::time::sleep(Duration::from_millis(20)).await;
            };
            assert_eq!(contents.trim(), port.to_string());
        }

        supervisor.stop("shared").await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything_and_rejects_starts() {
        let supervisor = supervisor();
        supervisor.start(&request("one", "sleep 30")).await.unwrap();
        supervisor.start(&request("two", "sleep 30")).await.unwrap();

        supervisor.shutdown().await.unwrap();
        assert!(supervisor.list().await.unwrap().is_empty());

        let err = supervisor.start(&request("three", "sleep 30")).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ShutDown));
    }
}
