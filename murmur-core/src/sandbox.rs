//! Resource-bounded plugin execution
//!
//! The sandbox bounds, not isolates: lifecycle calls run in-process under
//! a wall-clock timeout and, on unix, process resource limits applied for
//! the duration of the call. A static screen rejects plugins whose
//! declared surface touches denied namespaces before any code runs.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::{Duration, Instant};

use murmur_plugin_api::{PluginError, PluginInfo};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::HostError;

/// Resource bounds applied around each sandboxed call.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxLimits {
    /// Address-space ceiling in bytes
    pub max_memory: u64,
    /// CPU time ceiling
    pub max_cpu_time: Duration,
    /// Wall-clock ceiling for one call
    pub max_execution_time: Duration,
    /// Largest file a plugin may create, in bytes
    pub max_file_size: u64,
    /// Open file descriptor ceiling
    pub max_open_files: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_memory: 100 * 1024 * 1024,
            max_cpu_time: Duration::from_secs(30),
            max_execution_time: Duration::from_secs(60),
            max_file_size: 10 * 1024 * 1024,
            max_open_files: 100,
        }
    }
}

/// Applies [`SandboxLimits`] to the environment, returning a token that
/// restores the previous limits when dropped.
pub trait ResourceGuard: Send + Sync {
    fn apply(&self, limits: &SandboxLimits) -> Box<dyn Restore>;
}

/// Drop token returned by [`ResourceGuard::apply`].
pub trait Restore: Send {}

/// Guard that applies nothing. The fallback off unix, and the test double.
pub struct NoopGuard;

struct NoopRestore;
impl Restore for NoopRestore {}

impl ResourceGuard for NoopGuard {
    fn apply(&self, _limits: &SandboxLimits) -> Box<dyn Restore> {
        Box::new(NoopRestore)
    }
}

/// Unix guard backed by `setrlimit`. Soft limits only; the saved limits
/// are restored when the token drops.
#[cfg(unix)]
pub struct RlimitGuard;

#[cfg(unix)]
struct RlimitRestore {
    saved: Vec<(i32, libc::rlimit)>,
}

#[cfg(unix)]
impl Restore for RlimitRestore {}

#[cfg(unix)]
impl Drop for RlimitRestore {
    fn drop(&mut self) {
        for (resource, prev) in &self.saved {
            // SAFETY: restoring limit values previously read from getrlimit
            let rc = unsafe { libc::setrlimit(*resource as _, prev) };
            if rc != 0 {
                tracing::warn!(resource, "Failed to restore resource limit");
            }
        }
    }
}

#[cfg(unix)]
impl ResourceGuard for RlimitGuard {
    fn apply(&self, limits: &SandboxLimits) -> Box<dyn Restore> {
        let wanted: [(i32, u64); 4] = [
            (libc::RLIMIT_AS as i32, limits.max_memory),
            (libc::RLIMIT_CPU as i32, limits.max_cpu_time.as_secs()),
            (libc::RLIMIT_FSIZE as i32, limits.max_file_size),
            (libc::RLIMIT_NOFILE as i32, limits.max_open_files),
        ];

        let mut saved = Vec::with_capacity(wanted.len());
        for (resource, limit) in wanted {
            let mut prev = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            // SAFETY: prev is a valid out-pointer for this process's limit
            if unsafe { libc::getrlimit(resource as _, &mut prev) } != 0 {
                tracing::warn!(resource, "Failed to read resource limit");
                continue;
            }

            // Never raise the soft limit above the hard limit
            let next = libc::rlimit {
                rlim_cur: (limit as libc::rlim_t).min(prev.rlim_max),
                rlim_max: prev.rlim_max,
            };
            // SAFETY: next holds a valid limit pair within the hard limit
            if unsafe { libc::setrlimit(resource as _, &next) } == 0 {
                saved.push((resource, prev));
            } else {
                tracing::warn!(resource, "Failed to apply resource limit");
            }
        }

        Box::new(RlimitRestore { saved })
    }
}

/// Per-plugin execution accounting
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub last_error: Option<String>,
}

impl ExecutionStats {
    pub fn avg_duration(&self) -> Duration {
        if self.total == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.total as u32
        }
    }

    fn record(&mut self, elapsed: Duration, error: Option<String>) {
        self.total += 1;
        if let Some(error) = error {
            self.failed += 1;
            self.last_error = Some(error);
        } else {
            self.succeeded += 1;
        }
        self.total_duration += elapsed;
        self.min_duration = Some(self.min_duration.map_or(elapsed, |d| d.min(elapsed)));
        self.max_duration = Some(self.max_duration.map_or(elapsed, |d| d.max(elapsed)));
    }
}

/// Snapshot of the sandbox configuration
#[derive(Debug, Clone, Serialize)]
pub struct SandboxConfig {
    pub limits: SandboxLimits,
    pub allowed_namespaces: Vec<String>,
    pub denied_namespaces: Vec<String>,
}

const DEFAULT_DENIED: &[&str] = &[
    "os",
    "process",
    "subprocess",
    "socket",
    "net.raw",
    "fs.raw",
    "exec",
    "eval",
];

/// Bounds plugin lifecycle calls and screens declared capabilities.
pub struct Sandbox {
    limits: RwLock<SandboxLimits>,
    guard: Box<dyn ResourceGuard>,
    allowed: RwLock<HashSet<String>>,
    denied: RwLock<HashSet<String>>,
    stats: RwLock<HashMap<String, ExecutionStats>>,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Sandbox {
    /// Create a sandbox with the platform resource guard and default
    /// limits and deny set.
    pub fn new() -> Self {
        #[cfg(unix)]
        let guard: Box<dyn ResourceGuard> = Box::new(RlimitGuard);
        #[cfg(not(unix))]
        let guard: Box<dyn ResourceGuard> = Box::new(NoopGuard);

        Self::with_guard(guard)
    }

    /// Create a sandbox with an explicit resource guard.
    pub fn with_guard(guard: Box<dyn ResourceGuard>) -> Self {
        Self {
            limits: RwLock::new(SandboxLimits::default()),
            guard,
            allowed: RwLock::new(HashSet::new()),
            denied: RwLock::new(DEFAULT_DENIED.iter().map(|s| s.to_string()).collect()),
            stats: RwLock::new(HashMap::new()),
        }
    }

    // ─── Configuration ───────────────────────────────────────────────

    pub async fn set_limits(&self, limits: SandboxLimits) {
        *self.limits.write().await = limits;
    }

    /// Exempt a namespace from the deny set.
    pub async fn allow_namespace(&self, namespace: impl Into<String>) {
        self.allowed.write().await.insert(namespace.into());
    }

    /// Add a namespace to the deny set.
    pub async fn deny_namespace(&self, namespace: impl Into<String>) {
        self.denied.write().await.insert(namespace.into());
    }

    pub async fn config(&self) -> SandboxConfig {
        let mut allowed: Vec<_> = self.allowed.read().await.iter().cloned().collect();
        let mut denied: Vec<_> = self.denied.read().await.iter().cloned().collect();
        allowed.sort();
        denied.sort();
        SandboxConfig {
            limits: self.limits.read().await.clone(),
            allowed_namespaces: allowed,
            denied_namespaces: denied,
        }
    }

    // ─── Screening ───────────────────────────────────────────────────

    /// Statically screen a plugin's declared surface. Permissions and the
    /// entry-point file stem are checked against the deny set; an
    /// explicitly allowed namespace overrides a deny. A violation is
    /// final, the caller must not retry.
    pub async fn screen(&self, info: &PluginInfo) -> Result<(), HostError> {
        let allowed = self.allowed.read().await;
        let denied = self.denied.read().await;

        let mut tokens: Vec<&str> = info.permissions.iter().map(String::as_str).collect();
        let stem = std::path::Path::new(&info.entry_point)
            .file_stem()
            .and_then(|s| s.to_str());
        if let Some(stem) = stem {
            tokens.push(stem);
        }

        for token in tokens {
            for ns in denied.iter() {
                if !namespace_matches(ns, token) {
                    continue;
                }
                if allowed.iter().any(|a| namespace_matches(a, token)) {
                    continue;
                }
                tracing::warn!(
                    plugin = %info.name,
                    namespace = %ns,
                    token = %token,
                    "Security screen rejected plugin"
                );
                return Err(HostError::SecurityViolation {
                    plugin: info.name.clone(),
                    reason: format!("declared capability '{token}' touches denied namespace '{ns}'"),
                });
            }
        }
        Ok(())
    }

    // ─── Execution ───────────────────────────────────────────────────

    /// Run one plugin call under the configured limits. Applies the
    /// resource guard, bounds wall-clock time, restores limits regardless
    /// of outcome, and records per-plugin stats.
    pub async fn run<F, T>(&self, plugin: &str, fut: F) -> Result<T, HostError>
    where
        F: Future<Output = Result<T, PluginError>>,
    {
        let limits = self.limits.read().await.clone();
        let restore = self.guard.apply(&limits);

        let started = Instant::now();
        let outcome = tokio::time::timeout(limits.max_execution_time, fut).await;
        drop(restore);
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(value)) => {
                self.record(plugin, elapsed, None).await;
                Ok(value)
            }
            Ok(Err(e)) => {
                tracing::warn!(plugin = %plugin, error = %e, "Sandboxed call failed");
                self.record(plugin, elapsed, Some(e.to_string())).await;
                Err(HostError::Plugin(e))
            }
            Err(_) => {
                tracing::warn!(
                    plugin = %plugin,
                    timeout = ?limits.max_execution_time,
                    "Sandboxed call timed out"
                );
                self.record(plugin, elapsed, Some("execution timeout".to_string()))
                    .await;
                Err(HostError::Timeout {
                    name: plugin.to_string(),
                    timeout: limits.max_execution_time,
                })
            }
        }
    }

    // ─── Stats ───────────────────────────────────────────────────────

    pub async fn stats(&self, plugin: &str) -> Option<ExecutionStats> {
        self.stats.read().await.get(plugin).cloned()
    }

    pub async fn all_stats(&self) -> HashMap<String, ExecutionStats> {
        self.stats.read().await.clone()
    }

    pub async fn clear_stats(&self, plugin: Option<&str>) {
        let mut stats = self.stats.write().await;
        match plugin {
            Some(name) => {
                stats.remove(name);
            }
            None => stats.clear(),
        }
    }

    async fn record(&self, plugin: &str, elapsed: Duration, error: Option<String>) {
        self.stats
            .write()
            .await
            .entry(plugin.to_string())
            .or_default()
            .record(elapsed, error);
    }
}

/// Whether `token` falls inside `namespace` (exact or dotted child).
fn namespace_matches(namespace: &str, token: &str) -> bool {
    token == namespace
        || token
            .strip_prefix(namespace)
            .is_some_and(|rest| rest.starts_with('.'))
}
