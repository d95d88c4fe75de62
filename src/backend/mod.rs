pub mod decorated_client;
pub(crate) mod http;
pub(crate) mod stdio;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rmcp::model::*;
use rmcp::service::RunningService;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::config::{BackendConfig, BackendSpec, RuntimeOptions};
use crate::credentials::CredentialStore;
use crate::errors::GatewayError;
use crate::launch::plan_launch;
use crate::sidecar::EgressSidecar;

/// Deadline for the protocol initialize handshake.
pub const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(20);

/// A live protocol session to one backend, over stdio (a container-runtime
/// child process) or HTTP. Constructed exactly once per pool slot; callers
/// share the same instance until the pool drops it.
pub struct GatewaySession {
    name: String,
    /// Image reference or URL, for error text.
    descriptor: String,
    service: RwLock<Option<RunningService<rmcp::RoleClient, ()>>>,
    child: RwLock<Option<tokio::process::Child>>,
    sidecar: RwLock<Option<EgressSidecar>>,
    closed: AtomicBool,
}

/// Construct the session for a backend spec: launch the container (with
/// its egress-firewall sidecar when configured) or connect the remote
/// transport, and complete the initialize handshake. One attempt; the
/// caller caches the result, success or failure.
pub(crate) async fn establish(
    spec: &BackendSpec,
    config: &BackendConfig,
    options: &RuntimeOptions,
    store: &CredentialStore,
    read_only: bool,
) -> Result<Arc<GatewaySession>, GatewayError> {
    let descriptor = spec.descriptor().to_string();
    match spec {
        BackendSpec::Remote(remote) => {
            let service = http::connect(&remote.name, remote, config, store)
                .await
                .map_err(|e| e.wrap(&format!("initializing {descriptor}")))?;
            Ok(Arc::new(GatewaySession {
                name: remote.name.clone(),
                descriptor,
                service: RwLock::new(Some(service)),
                child: RwLock::new(None),
                sidecar: RwLock::new(None),
                closed: AtomicBool::new(false),
            }))
        }
        BackendSpec::Image(image) => {
            // The sidecar comes up only when the network is disabled AND
            // hosts are allowed through; --network none alone otherwise.
            let sidecar = if image.disable_network && !image.allow_hosts.is_empty() {
                Some(
                    EgressSidecar::launch(&image.name, &image.allow_hosts, options)
                        .await
                        .map_err(|e| e.wrap(&format!("initializing {descriptor}")))?,
                )
            } else {
                None
            };

            let plan = plan_launch(
                image,
                config,
                options,
                sidecar.as_ref().map(|s| &s.target),
                read_only,
            );

            match stdio::connect(&image.name, &plan, options).await {
                Ok(connection) => Ok(Arc::new(GatewaySession {
                    name: image.name.clone(),
                    descriptor,
                    service: RwLock::new(Some(connection.service)),
                    child: RwLock::new(Some(connection.child)),
                    sidecar: RwLock::new(sidecar),
                    closed: AtomicBool::new(false),
                })),
                Err(e) => {
                    if let Some(sidecar) = &sidecar {
                        sidecar.teardown().await;
                    }
                    Err(e.wrap(&format!("initializing {descriptor}")))
                }
            }
        }
    }
}

impl GatewaySession {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError> {
        let guard = self.service.read().await;
        let service = self.require(&guard)?;
        service
            .list_all_tools()
            .await
            .map_err(|e| self.protocol_err("listing tools", e))
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, GatewayError> {
        let guard = self.service.read().await;
        let service = self.require(&guard)?;

        let params = CallToolRequestParam {
            meta: None,
            name: tool_name.to_string().into(),
            arguments: arguments.and_then(|v| v.as_object().cloned()),
            task: None,
        };

        debug!(backend = %self.name, tool = %tool_name, "calling tool");
        service
            .call_tool(params)
            .await
            .map_err(|e| self.protocol_err(&format!("calling tool '{tool_name}'"), e))
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, GatewayError> {
        let guard = self.service.read().await;
        let service = self.require(&guard)?;
        service
            .list_all_prompts()
            .await
            .map_err(|e| self.protocol_err("listing prompts", e))
    }

    pub async fn get_prompt(
        &self,
        prompt_name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<GetPromptResult, GatewayError> {
        let guard = self.service.read().await;
        let service = self.require(&guard)?;

        let params = GetPromptRequestParam {
            meta: None,
            name: prompt_name.to_string().into(),
            arguments,
        };
        service
            .get_prompt(params)
            .await
            .map_err(|e| self.protocol_err(&format!("getting prompt '{prompt_name}'"), e))
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, GatewayError> {
        let guard = self.service.read().await;
        let service = self.require(&guard)?;
        service
            .list_all_resources()
            .await
            .map_err(|e| self.protocol_err("listing resources", e))
    }

    pub async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>, GatewayError> {
        let guard = self.service.read().await;
        let service = self.require(&guard)?;
        service
            .list_all_resource_templates()
            .await
            .map_err(|e| self.protocol_err("listing resource templates", e))
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, GatewayError> {
        let guard = self.service.read().await;
        let service = self.require(&guard)?;

        let params = ReadResourceRequestParam {
            meta: None,
            uri: uri.to_string().into(),
        };
        service
            .read_resource(params)
            .await
            .map_err(|e| self.protocol_err(&format!("reading resource '{uri}'"), e))
    }

    /// Close the session: cancel the protocol service, kill the container
    /// child (and its process group), and tear down the sidecar. Errors
    /// are logged and swallowed; close never fails observably.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);

        if let Some(service) = self.service.write().await.take()
            && let Err(e) = service.cancel().await
        {
            error!(backend = %self.name, error = %e, "error cancelling service");
        }

        if let Some(mut child) = self.child.write().await.take() {
            stdio::kill_child(&self.name, &mut child).await;
        }

        if let Some(sidecar) = self.sidecar.write().await.take() {
            sidecar.teardown().await;
        }

        info!(backend = %self.name, "session closed");
    }

    fn require<'a>(
        &self,
        guard: &'a tokio::sync::RwLockReadGuard<'_, Option<RunningService<rmcp::RoleClient, ()>>>,
    ) -> Result<&'a RunningService<rmcp::RoleClient, ()>, GatewayError> {
        guard.as_ref().ok_or_else(|| {
            GatewayError::Protocol(format!("session to backend '{}' is closed", self.name))
        })
    }

    fn protocol_err(&self, what: &str, e: impl std::fmt::Display) -> GatewayError {
        GatewayError::Protocol(format!("{what} on backend '{}': {e}", self.name))
    }

    /// A session with no live transport, for exercising pool semantics in
    /// tests without a container runtime or network.
    #[cfg(test)]
    pub(crate) fn detached(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            descriptor: format!("test://{name}"),
            service: RwLock::new(None),
            child: RwLock::new(None),
            sidecar: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }
}
