//! Sandbox capability contract and backends.
//!
//! The core only depends on [`SandboxBackend`]: run one command under a
//! [`SandboxSpec`] and report output or a typed [`SandboxError`]. How the
//! ceilings are enforced is the backend's business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;

use crate::types::{Error, Result, SandboxError};

// =============================================================================
// Spec
// =============================================================================

/// Network exposure granted to a sandboxed unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    #[default]
    None,
    HostOnly,
    OutboundOnly,
    /// Outbound to these hosts or CIDRs only.
    AllowList(Vec<String>),
}

/// Resource ceilings and grants for one sandboxed invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Fraction of one CPU (0.5 = half a core).
    pub cpu_share: f64,
    pub memory_bytes: u64,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_open_files: u64,
    pub max_processes: u64,
    #[serde(default)]
    pub read_only_mounts: Vec<PathBuf>,
    #[serde(default)]
    pub read_write_mounts: Vec<PathBuf>,
    #[serde(default)]
    pub network: NetworkPolicy,
}

impl Default for SandboxSpec {
    fn default() -> Self {
        Self {
            cpu_share: 1.0,
            memory_bytes: 256 * 1024 * 1024,
            timeout: Duration::from_secs(30),
            max_open_files: 256,
            max_processes: 16,
            read_only_mounts: Vec::new(),
            read_write_mounts: Vec::new(),
            network: NetworkPolicy::None,
        }
    }
}

impl SandboxSpec {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn with_network(mut self, network: NetworkPolicy) -> Self {
        self.network = network;
        self
    }

    pub fn with_read_only(mut self, path: impl Into<PathBuf>) -> Self {
        self.read_only_mounts.push(path.into());
        self
    }

    pub fn with_read_write(mut self, path: impl Into<PathBuf>) -> Self {
        self.read_write_mounts.push(path.into());
        self
    }

    pub fn validate(&self) -> std::result::Result<(), SandboxError> {
        if !(self.cpu_share > 0.0 && self.cpu_share.is_finite()) {
            return Err(SandboxError::InvalidSpec(format!(
                "cpu_share must be positive, got {}",
                self.cpu_share
            )));
        }
        if self.memory_bytes == 0 {
            return Err(SandboxError::InvalidSpec("memory_bytes must be non-zero".into()));
        }
        if self.timeout.is_zero() {
            return Err(SandboxError::InvalidSpec("timeout must be non-zero".into()));
        }
        if self.max_open_files == 0 || self.max_processes == 0 {
            return Err(SandboxError::InvalidSpec(
                "max_open_files and max_processes must be non-zero".into(),
            ));
        }
        for path in self.read_only_mounts.iter().chain(&self.read_write_mounts) {
            if !path.is_absolute() {
                return Err(SandboxError::InvalidSpec(format!(
                    "mount {} must be absolute",
                    path.display()
                )));
            }
        }
        if let Some(dup) = self
            .read_only_mounts
            .iter()
            .find(|p| self.read_write_mounts.contains(p))
        {
            return Err(SandboxError::InvalidSpec(format!(
                "mount {} is both read-only and read-write",
                dup.display()
            )));
        }
        if let NetworkPolicy::AllowList(hosts) = &self.network {
            if hosts.iter().any(String::is_empty) {
                return Err(SandboxError::InvalidSpec("empty network allow-list entry".into()));
            }
        }
        Ok(())
    }
}

/// What a sandboxed command produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl SandboxOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// =============================================================================
// Backend trait
// =============================================================================

#[async_trait]
pub trait SandboxBackend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Whether this backend can run on the current host.
    fn available(&self) -> bool;

    /// Run `command` under `spec`. Must return `SandboxError::Timeout` once
    /// `spec.timeout` elapses.
    async fn execute(
        &self,
        spec: &SandboxSpec,
        command: &str,
    ) -> std::result::Result<SandboxOutput, SandboxError>;
}

/// Which backend the daemon should run sandboxed skills on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// Host process backend if the host supports it.
    #[default]
    Auto,
    HostProcess,
    Noop,
}

/// Build the backend named by `preference`.
pub fn select_backend(preference: BackendPreference) -> Result<Arc<dyn SandboxBackend>> {
    let backend: Arc<dyn SandboxBackend> = match preference {
        BackendPreference::Noop => Arc::new(NoopBackend::new()),
        BackendPreference::Auto | BackendPreference::HostProcess => {
            let host = HostProcessBackend::new();
            if !host.available() {
                return Err(Error::Sandbox(SandboxError::BackendUnavailable(format!(
                    "{} not found",
                    host.shell.display()
                ))));
            }
            Arc::new(host)
        }
    };
    tracing::info!(backend = backend.name(), ?preference, "sandbox_backend_selected");
    Ok(backend)
}

// =============================================================================
// Host process backend
// =============================================================================

/// Runs the command through `sh -c` as a host child process.
///
/// The command runs in its own process group, which is killed when the call
/// returns or is dropped. Enforces the wall-clock timeout and caps captured
/// output at the memory ceiling. Clears the environment apart from
/// `PATH`. There is no kernel-level isolation: file, process and network
/// limits are advisory here.
#[derive(Debug)]
pub struct HostProcessBackend {
    shell: PathBuf,
}

impl HostProcessBackend {
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl Default for HostProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxBackend for HostProcessBackend {
    fn name(&self) -> &str {
        "host-process"
    }

    fn available(&self) -> bool {
        self.shell.exists()
    }

    async fn execute(
        &self,
        spec: &SandboxSpec,
        command: &str,
    ) -> std::result::Result<SandboxOutput, SandboxError> {
        spec.validate()?;
        if command.trim().is_empty() {
            return Err(SandboxError::Execution("command must not be empty".into()));
        }
        if spec.network != NetworkPolicy::None {
            tracing::debug!(network = ?spec.network, "host_process_network_not_enforced");
        }

        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        if let Some(dir) = spec.read_write_mounts.first() {
            cmd.current_dir(dir);
        }

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Execution(format!("spawn failed: {e}")))?;
        // Every return path below, and dropping this future, kills the group.
        let _group = ProcessGroup::new(child.id());

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Execution("stdout not captured".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Execution("stderr not captured".into()))?;

        let ceiling = spec.memory_bytes;
        let run = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            tokio::try_join!(
                read_capped(&mut stdout, &mut out, ceiling),
                read_capped(&mut stderr, &mut err, ceiling),
            )?;
            if (out.len() + err.len()) as u64 > ceiling {
                return Err(over_ceiling(ceiling));
            }

            let status = child
                .wait()
                .await
                .map_err(|e| SandboxError::Execution(format!("wait failed: {e}")))?;
            Ok::<_, SandboxError>((status, out, err))
        };

        let (status, out, err) = match tokio::time::timeout(spec.timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(timeout = ?spec.timeout, "sandbox_timeout");
                return Err(SandboxError::Timeout(spec.timeout));
            }
        };

        Ok(SandboxOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
            elapsed: start.elapsed(),
        })
    }
}

/// Read until EOF, failing as soon as more than `ceiling` bytes arrive.
async fn read_capped<R>(reader: R, buf: &mut Vec<u8>, ceiling: u64) -> std::result::Result<(), SandboxError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    reader
        .take(ceiling.saturating_add(1))
        .read_to_end(buf)
        .await
        .map_err(|e| SandboxError::Execution(format!("read failed: {e}")))?;
    if buf.len() as u64 > ceiling {
        return Err(over_ceiling(ceiling));
    }
    Ok(())
}

fn over_ceiling(ceiling: u64) -> SandboxError {
    SandboxError::ResourceLimit(format!("output exceeds memory ceiling of {ceiling} bytes"))
}

/// SIGKILLs a child's process group when dropped, so nothing the command
/// started in the background outlives the call.
#[derive(Debug)]
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let Some(pgid) = self.pgid.and_then(|p| i32::try_from(p).ok()) else {
                return;
            };
            // ESRCH: the group already exited.
            match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::warn!(pgid, error = %e, "sandbox_group_kill_failed"),
            }
        }
    }
}

// =============================================================================
// No-op backend
// =============================================================================

/// Test backend. Runs nothing, records every command it was given.
///
/// By default echoes the rendered command back as stdout.
#[derive(Debug, Default)]
pub struct NoopBackend {
    canned: Option<SandboxOutput>,
    unavailable: bool,
    times_out: bool,
    delay: Option<Duration>,
    executed: Mutex<Vec<String>>,
}

impl NoopBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer with `stdout` and exit code 0.
    pub fn with_output(mut self, stdout: impl Into<String>) -> Self {
        self.canned = Some(SandboxOutput {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
        });
        self
    }

    /// Report `BackendUnavailable` on every call.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Report `Timeout` on every call.
    pub fn timing_out(mut self) -> Self {
        self.times_out = true;
        self
    }

    /// Take this long per call. Still bounded by `SandboxSpec::timeout`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Commands received so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl SandboxBackend for NoopBackend {
    fn name(&self) -> &str {
        "noop"
    }

    fn available(&self) -> bool {
        !self.unavailable
    }

    async fn execute(
        &self,
        spec: &SandboxSpec,
        command: &str,
    ) -> std::result::Result<SandboxOutput, SandboxError> {
        if self.unavailable {
            return Err(SandboxError::BackendUnavailable("noop backend disabled".into()));
        }
        spec.validate()?;
        self.executed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(command.to_string());

        if self.times_out {
            return Err(SandboxError::Timeout(spec.timeout));
        }
        if let Some(delay) = self.delay {
            if delay >= spec.timeout {
                tokio::time::sleep(spec.timeout).await;
                return Err(SandboxError::Timeout(spec.timeout));
            }
            tokio::time::sleep(delay).await;
        }

        Ok(self.canned.clone().unwrap_or_else(|| SandboxOutput {
            exit_code: 0,
            stdout: command.to_string(),
            stderr: String::new(),
            elapsed: self.delay.unwrap_or_default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spec_is_valid() {
        assert!(SandboxSpec::default().validate().is_ok());
    }

    #[test]
    fn test_spec_rejects_bad_values() {
        let spec = SandboxSpec::default().with_timeout(Duration::ZERO);
        assert!(matches!(spec.validate(), Err(SandboxError::InvalidSpec(_))));

        let spec = SandboxSpec::default().with_read_only("relative/path");
        assert!(spec.validate().is_err());

        let spec = SandboxSpec::default()
            .with_read_only("/data")
            .with_read_write("/data");
        assert!(spec.validate().unwrap_err().to_string().contains("/data"));

        let spec = SandboxSpec::default().with_network(NetworkPolicy::AllowList(vec!["".into()]));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_spec_deserializes_humantime() {
        let spec: SandboxSpec = serde_json::from_value(serde_json::json!({
            "cpu_share": 0.5,
            "memory_bytes": 1048576,
            "timeout": "2s",
            "max_open_files": 32,
            "max_processes": 4,
            "network": {"allow_list": ["10.0.0.0/8"]}
        }))
        .unwrap();
        assert_eq!(spec.timeout, Duration::from_secs(2));
        assert_eq!(spec.network, NetworkPolicy::AllowList(vec!["10.0.0.0/8".into()]));
        assert!(spec.read_only_mounts.is_empty());
    }

    #[tokio::test]
    async fn test_noop_records_and_echoes() {
        let backend = NoopBackend::new();
        let out = backend.execute(&SandboxSpec::default(), "echo hi").await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "echo hi");
        assert_eq!(backend.executed(), vec!["echo hi"]);
    }

    #[tokio::test]
    async fn test_noop_simulated_failures() {
        let spec = SandboxSpec::default().with_timeout(Duration::from_millis(20));

        let err = NoopBackend::new().unavailable().execute(&spec, "x").await.unwrap_err();
        assert_eq!(err.code(), "SANDBOX_UNAVAILABLE");

        let err = NoopBackend::new().timing_out().execute(&spec, "x").await.unwrap_err();
        assert_eq!(err, SandboxError::Timeout(Duration::from_millis(20)));

        let err = NoopBackend::new()
            .with_delay(Duration::from_secs(5))
            .execute(&spec, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }

    #[test]
    fn test_select_noop_backend() {
        let backend = select_backend(BackendPreference::Noop).unwrap();
        assert_eq!(backend.name(), "noop");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_host_process_runs_command() {
        let backend = HostProcessBackend::new();
        let out = backend
            .execute(&SandboxSpec::default(), "printf hello")
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello");
        assert!(out.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_host_process_enforces_timeout() {
        let backend = HostProcessBackend::new();
        let spec = SandboxSpec::default().with_timeout(Duration::from_millis(100));
        let err = backend.execute(&spec, "sleep 5").await.unwrap_err();
        assert_eq!(err, SandboxError::Timeout(Duration::from_millis(100)));
    }

    #[cfg(unix)]
    fn marker_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("warden-sandbox-{tag}-{}", uuid::Uuid::new_v4()))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_host_process_timeout_kills_background_jobs() {
        let backend = HostProcessBackend::new();
        let marker = marker_path("timeout");
        let spec = SandboxSpec::default().with_timeout(Duration::from_millis(200));
        let command = format!("(sleep 1; touch {}) & wait", marker.display());

        let err = backend.execute(&spec, &command).await.unwrap_err();
        assert_eq!(err, SandboxError::Timeout(Duration::from_millis(200)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "background job outlived the timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_host_process_reaps_detached_jobs_on_exit() {
        let backend = HostProcessBackend::new();
        let marker = marker_path("detached");
        let command = format!("(sleep 1; touch {}) >/dev/null 2>&1 &", marker.display());

        let out = backend.execute(&SandboxSpec::default(), &command).await.unwrap();
        assert!(out.success());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "detached job outlived the call");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_host_process_caps_output_at_memory_ceiling() {
        let backend = HostProcessBackend::new();
        let spec = SandboxSpec::default()
            .with_memory(1024)
            .with_timeout(Duration::from_secs(5));

        // Endless output: the cap must trip long before the timeout.
        let err = backend.execute(&spec, "yes").await.unwrap_err();
        assert!(matches!(err, SandboxError::ResourceLimit(_)), "got {err:?}");

        let out = backend
            .execute(&SandboxSpec::default().with_memory(16), "printf 0123456789")
            .await
            .unwrap();
        assert_eq!(out.stdout, "0123456789");
    }
}
