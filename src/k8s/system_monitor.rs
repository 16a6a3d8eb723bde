//! Process-level diagnostics surfaced through the control API's `/diagnostics`
//! endpoint (§6, A.6 ambient diagnostics): file descriptor headroom matters
//! here specifically because every watched GVR holds its own long-lived
//! connection, so a cluster with many CRDs can approach the process limit.

use std::process::Command;

use tracing::warn;

/// Reports the process's file descriptor ulimit, warning when it looks too
/// low for a cache that may end up watching dozens of GVRs concurrently.
#[cfg(unix)]
pub fn check_file_descriptor_limits() {
    match Command::new("sh").arg("-c").arg("ulimit -n").output() {
        Ok(output) if output.status.success() => {
            let limit_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if let Ok(limit) = limit_str.parse::<u32>() {
                tracing::debug!(limit, "file descriptor limit");
                if limit < 1024 {
                    warn!(limit, "file descriptor limit is low; consider raising it with 'ulimit -n 4096'");
                }
            }
        }
        Ok(output) => {
            warn!(status = ?output.status, "ulimit -n exited non-zero");
        }
        Err(err) => {
            warn!(error = %err, "could not check file descriptor limits");
        }
    }
}

#[cfg(not(unix))]
pub fn check_file_descriptor_limits() {}

/// Counts this process's open file descriptors via `/proc/self/fd` (Linux)
/// or `/dev/fd` (BSD/macOS).
#[cfg(unix)]
pub fn get_current_fd_count() -> Option<usize> {
    use std::fs;

    for fd_path in ["/proc/self/fd", "/dev/fd"] {
        if let Ok(entries) = fs::read_dir(fd_path) {
            let count = entries.count();
            if count > 0 {
                return Some(count);
            }
        }
    }
    None
}

#[cfg(not(unix))]
pub fn get_current_fd_count() -> Option<usize> {
    None
}

pub fn monitor_fd_usage() {
    if let Some(count) = get_current_fd_count() {
        tracing::debug!(count, "open file descriptors");
        if count > 500 {
            warn!(count, "high file descriptor usage");
        }
    }
}

/// Assembled diagnostics snapshot for the control API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemDiagnostics {
    pub fd_count: Option<usize>,
}

pub fn system_diagnostics() -> SystemDiagnostics {
    check_file_descriptor_limits();
    monitor_fd_usage();
    SystemDiagnostics {
        fd_count: get_current_fd_count(),
    }
}
