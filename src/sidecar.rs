use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::RuntimeOptions;
use crate::errors::GatewayError;
use crate::launch::LABEL_PREFIX;

/// Image of the egress-firewall proxy launched next to a backend whose
/// network is disabled but which lists allowed hosts.
const FIREWALL_IMAGE: &str = "docker/mcp-egress-firewall:latest";

/// Proxy port the firewall listens on inside its network.
const FIREWALL_PORT: u16 = 3128;

/// Alias the backend container reaches the firewall under.
const FIREWALL_ALIAS: &str = "egress-proxy";

/// What the launch planner needs to wire a backend container to its
/// egress-firewall sidecar.
#[derive(Debug, Clone, PartialEq)]
pub struct EgressTarget {
    pub network: String,
    pub link: String,
    pub dns: String,
    pub env: Vec<(String, String)>,
}

/// A running egress-firewall sidecar with its cleanup handle. Teardown
/// removes the container and its dedicated network; errors during
/// teardown are logged and swallowed.
#[derive(Debug)]
pub struct EgressSidecar {
    pub target: EgressTarget,
    container: String,
    network: String,
    runtime_bin: String,
}

impl EgressSidecar {
    /// Bring up the sidecar for one backend: a dedicated network, the
    /// firewall container restricted to `allow_hosts`, and the resolved
    /// target wiring for the backend container.
    pub async fn launch(
        backend_name: &str,
        allow_hosts: &[String],
        options: &RuntimeOptions,
    ) -> Result<Self, GatewayError> {
        let network = format!("{LABEL_PREFIX}-egress-{backend_name}");
        let container = format!("{network}-proxy");
        let runtime_bin = options.runtime_bin.clone();

        run_runtime(
            &runtime_bin,
            &["network", "create", "--label", &format!("{LABEL_PREFIX}=true"), &network],
        )
        .await?;

        let allow = allow_hosts.join(",");
        let run_result = run_runtime(
            &runtime_bin,
            &[
                "run",
                "-d",
                "--rm",
                "--name",
                &container,
                "--network",
                &network,
                "--network-alias",
                FIREWALL_ALIAS,
                "-l",
                &format!("{LABEL_PREFIX}=true"),
                "-l",
                &format!("{LABEL_PREFIX}-name={backend_name}"),
                "-e",
                &format!("ALLOWED_HOSTS={allow}"),
                FIREWALL_IMAGE,
            ],
        )
        .await;
        if let Err(e) = run_result {
            remove_network(&runtime_bin, &network).await;
            return Err(e);
        }

        let dns = match run_runtime(
            &runtime_bin,
            &[
                "inspect",
                "-f",
                &format!("{{{{.NetworkSettings.Networks.{network}.IPAddress}}}}"),
                &container,
            ],
        )
        .await
        {
            Ok(ip) => ip.trim().to_string(),
            Err(e) => {
                remove_container(&runtime_bin, &container).await;
                remove_network(&runtime_bin, &network).await;
                return Err(e);
            }
        };

        let proxy_url = format!("http://{FIREWALL_ALIAS}:{FIREWALL_PORT}");
        let target = EgressTarget {
            network: network.clone(),
            link: format!("{container}:{FIREWALL_ALIAS}"),
            dns,
            env: vec![
                ("HTTP_PROXY".to_string(), proxy_url.clone()),
                ("HTTPS_PROXY".to_string(), proxy_url),
                ("NO_PROXY".to_string(), "localhost,127.0.0.1".to_string()),
            ],
        };

        info!(backend = %backend_name, network = %network, "egress firewall started");
        Ok(Self {
            target,
            container,
            network,
            runtime_bin,
        })
    }

    /// Remove the sidecar container and its network. Never fails.
    pub async fn teardown(&self) {
        remove_container(&self.runtime_bin, &self.container).await;
        remove_network(&self.runtime_bin, &self.network).await;
        debug!(container = %self.container, "egress firewall removed");
    }
}

async fn remove_container(runtime_bin: &str, container: &str) {
    if let Err(e) = run_runtime(runtime_bin, &["rm", "-f", container]).await {
        warn!(container = %container, error = %e, "error removing sidecar container");
    }
}

async fn remove_network(runtime_bin: &str, network: &str) {
    if let Err(e) = run_runtime(runtime_bin, &["network", "rm", network]).await {
        warn!(network = %network, error = %e, "error removing sidecar network");
    }
}

/// Run the container runtime with the given arguments, capturing stdout.
async fn run_runtime(runtime_bin: &str, args: &[&str]) -> Result<String, GatewayError> {
    let output = Command::new(runtime_bin)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            GatewayError::Transport(format!("running {runtime_bin} {}: {e}", args.join(" ")))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GatewayError::Transport(format!(
            "{runtime_bin} {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
