use std::process::Stdio;

use rmcp::{ServiceExt, service::RunningService};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::INITIALIZE_TIMEOUT;
use crate::config::RuntimeOptions;
use crate::errors::GatewayError;
use crate::launch::LaunchPlan;

pub(crate) struct StdioConnection {
    pub service: RunningService<rmcp::RoleClient, ()>,
    pub child: Child,
}

/// Spawn the container runtime with a launch plan and complete the MCP
/// handshake over the child's stdio.
///
/// The child is spawned directly (not through the protocol library's
/// child-process transport) so the `Child` handle stays available for
/// crash-free kill-group teardown and the `-e NAME` forwarding resolves
/// against the plan's environment.
pub(crate) async fn connect(
    name: &str,
    plan: &LaunchPlan,
    options: &RuntimeOptions,
) -> Result<StdioConnection, GatewayError> {
    let mut cmd = Command::new(&options.runtime_bin);
    cmd.args(&plan.args);
    for entry in &plan.env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }

    cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
    // Backend stderr is captured only in verbose mode.
    if options.verbose {
        cmd.stderr(Stdio::inherit());
    } else {
        cmd.stderr(Stdio::null());
    }

    // Each child in its own process group for clean kill-group teardown.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| {
        GatewayError::Transport(format!("spawning {} for '{name}': {e}", options.runtime_bin))
    })?;

    let pid = child.id();
    debug!(backend = %name, pid = ?pid, "spawned container runtime");

    let stdout = child.stdout.take().ok_or_else(|| {
        GatewayError::Transport(format!("failed to capture stdout from backend '{name}'"))
    })?;
    let stdin = child.stdin.take().ok_or_else(|| {
        GatewayError::Transport(format!("failed to capture stdin to backend '{name}'"))
    })?;

    // rmcp accepts (AsyncRead, AsyncWrite) tuples as IntoTransport; serve()
    // performs the initialize handshake.
    let service = match tokio::time::timeout(INITIALIZE_TIMEOUT, ().serve((stdout, stdin))).await {
        Ok(Ok(service)) => service,
        Ok(Err(e)) => {
            kill_child(name, &mut child).await;
            return Err(GatewayError::Protocol(format!(
                "MCP handshake with backend '{name}' failed: {e}"
            )));
        }
        Err(_) => {
            kill_child(name, &mut child).await;
            return Err(GatewayError::Timeout(format!(
                "MCP handshake with backend '{name}' timed out after {}s",
                INITIALIZE_TIMEOUT.as_secs()
            )));
        }
    };

    if let Some(peer) = service.peer_info() {
        info!(
            backend = %name,
            pid = ?pid,
            server_name = %peer.server_info.name,
            server_version = %peer.server_info.version,
            "MCP handshake complete"
        );
    } else {
        info!(backend = %name, pid = ?pid, "MCP handshake complete (no peer info)");
    }

    Ok(StdioConnection { service, child })
}

/// Kill the child's entire process group (unix only), then make sure the
/// child itself is dead.
pub(crate) async fn kill_child(name: &str, child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Negative PID signals the whole group. Safety: kill accepts any pid.
        let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
        if ret == 0 {
            debug!(backend = %name, pid, "sent SIGTERM to process group");
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        } else {
            warn!(backend = %name, pid, "failed to signal process group, killing child directly");
        }
    }

    let _ = child.kill().await;
}
