use std::collections::HashMap;
use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    model::*,
    service::RequestContext,
};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{BackendConfig, Catalog};
use crate::pool::ClientPool;

/// Tool, prompt, and resource routing tables: item name to backend name.
/// Rebuilt on every aggregate listing and lazily on a routing miss.
#[derive(Default)]
struct Routes {
    tools: HashMap<String, String>,
    prompts: HashMap<String, String>,
    resources: HashMap<String, String>,
}

/// The single MCP surface a client sees: the union of every catalog
/// backend's tools, prompts, and resources, with calls routed through the
/// client pool so retention semantics hold per backend.
#[derive(Clone)]
pub struct GatewayServer {
    pool: Arc<ClientPool>,
    catalog: Arc<Catalog>,
    config: Arc<BackendConfig>,
    read_only: bool,
    routes: Arc<RwLock<Routes>>,
    cancel: CancellationToken,
}

impl GatewayServer {
    pub fn new(
        pool: Arc<ClientPool>,
        catalog: Arc<Catalog>,
        config: Arc<BackendConfig>,
        read_only: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            catalog,
            config,
            read_only,
            routes: Arc::new(RwLock::new(Routes::default())),
            cancel,
        }
    }

    /// Aggregate tools across all backends and rebuild the tool routes.
    /// A backend that fails to come up is skipped with a warning; one
    /// broken backend must not take the union down.
    async fn aggregate_tools(&self) -> Vec<Tool> {
        let mut tools = Vec::new();
        let mut routes = HashMap::new();

        for (name, spec) in &self.catalog.backends {
            let handle = match self
                .pool
                .acquire(&self.cancel, spec, &self.config, self.read_only)
                .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(backend = %name, error = %e, "skipping backend in tool listing");
                    continue;
                }
            };

            match handle.list_tools().await {
                Ok(backend_tools) => {
                    debug!(backend = %name, tools = backend_tools.len(), "aggregated tools");
                    for tool in backend_tools {
                        routes.insert(tool.name.to_string(), name.clone());
                        tools.push(tool);
                    }
                }
                Err(e) => warn!(backend = %name, error = %e, "tool listing failed"),
            }

            self.pool.release(handle).await;
        }

        self.routes.write().await.tools = routes;
        tools
    }

    async fn aggregate_prompts(&self) -> Vec<Prompt> {
        let mut prompts = Vec::new();
        let mut routes = HashMap::new();

        for (name, spec) in &self.catalog.backends {
            let handle = match self
                .pool
                .acquire(&self.cancel, spec, &self.config, self.read_only)
                .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(backend = %name, error = %e, "skipping backend in prompt listing");
                    continue;
                }
            };

            if let Ok(backend_prompts) = handle.list_prompts().await {
                for prompt in backend_prompts {
                    routes.insert(prompt.name.to_string(), name.clone());
                    prompts.push(prompt);
                }
            }

            self.pool.release(handle).await;
        }

        self.routes.write().await.prompts = routes;
        prompts
    }

    async fn aggregate_resources(&self) -> Vec<Resource> {
        let mut resources = Vec::new();
        let mut routes = HashMap::new();

        for (name, spec) in &self.catalog.backends {
            let handle = match self
                .pool
                .acquire(&self.cancel, spec, &self.config, self.read_only)
                .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(backend = %name, error = %e, "skipping backend in resource listing");
                    continue;
                }
            };

            if let Ok(backend_resources) = handle.list_resources().await {
                for resource in backend_resources {
                    routes.insert(resource.uri.to_string(), name.clone());
                    resources.push(resource);
                }
            }

            self.pool.release(handle).await;
        }

        self.routes.write().await.resources = routes;
        resources
    }

    async fn tool_backend(&self, tool_name: &str) -> Option<String> {
        if let Some(backend) = self.routes.read().await.tools.get(tool_name) {
            return Some(backend.clone());
        }
        // Route miss: the client may call before listing. Refresh once.
        self.aggregate_tools().await;
        self.routes.read().await.tools.get(tool_name).cloned()
    }
}

impl ServerHandler for GatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .enable_prompts()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "fedgate multiplexes a federation of backend tool servers behind one MCP \
                 endpoint. The tool list is the union of every configured backend; calls are \
                 routed to the backend that owns the tool."
                    .to_string(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _pagination: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = self.aggregate_tools().await;
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let tool_name = request.name.to_string();
        let Some(backend) = self.tool_backend(&tool_name).await else {
            return Err(McpError::invalid_params(
                format!("unknown tool '{tool_name}'"),
                None,
            ));
        };
        let spec = self
            .catalog
            .get(&backend)
            .ok_or_else(|| McpError::internal_error(format!("no spec for '{backend}'"), None))?;

        let handle = self
            .pool
            .acquire(&self.cancel, spec, &self.config, self.read_only)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;

        let result = handle
            .call_tool(&tool_name, request.arguments.map(Value::Object))
            .await;
        self.pool.release(handle).await;

        match result {
            Ok(result) => Ok(result),
            // Backend failures during a call surface as tool-error results,
            // not operational failures.
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }

    async fn list_prompts(
        &self,
        _pagination: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        let prompts = self.aggregate_prompts().await;
        Ok(ListPromptsResult {
            prompts,
            next_cursor: None,
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        let prompt_name = request.name.to_string();
        let backend = {
            let routes = self.routes.read().await;
            routes.prompts.get(&prompt_name).cloned()
        };
        let backend = match backend {
            Some(backend) => backend,
            None => {
                self.aggregate_prompts().await;
                self.routes
                    .read()
                    .await
                    .prompts
                    .get(&prompt_name)
                    .cloned()
                    .ok_or_else(|| {
                        McpError::invalid_params(format!("unknown prompt '{prompt_name}'"), None)
                    })?
            }
        };
        let spec = self
            .catalog
            .get(&backend)
            .ok_or_else(|| McpError::internal_error(format!("no spec for '{backend}'"), None))?;

        let handle = self
            .pool
            .acquire(&self.cancel, spec, &self.config, self.read_only)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;

        let result = handle.get_prompt(&prompt_name, request.arguments).await;
        self.pool.release(handle).await;

        result.map_err(|e| McpError::internal_error(e.to_string(), None))
    }

    async fn list_resources(
        &self,
        _pagination: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        let resources = self.aggregate_resources().await;
        Ok(ListResourcesResult {
            resources,
            next_cursor: None,
        })
    }

    async fn list_resource_templates(
        &self,
        _pagination: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        let mut templates = Vec::new();
        for (name, spec) in &self.catalog.backends {
            let handle = match self
                .pool
                .acquire(&self.cancel, spec, &self.config, self.read_only)
                .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(backend = %name, error = %e, "skipping backend in template listing");
                    continue;
                }
            };
            if let Ok(backend_templates) = handle.list_resource_templates().await {
                templates.extend(backend_templates);
            }
            self.pool.release(handle).await;
        }
        Ok(ListResourceTemplatesResult {
            resource_templates: templates,
            next_cursor: None,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let uri = request.uri.to_string();
        let backend = {
            let routes = self.routes.read().await;
            routes.resources.get(&uri).cloned()
        };
        let backend = match backend {
            Some(backend) => backend,
            None => {
                self.aggregate_resources().await;
                self.routes
                    .read()
                    .await
                    .resources
                    .get(&uri)
                    .cloned()
                    .ok_or_else(|| {
                        McpError::invalid_params(format!("unknown resource '{uri}'"), None)
                    })?
            }
        };
        let spec = self
            .catalog
            .get(&backend)
            .ok_or_else(|| McpError::internal_error(format!("no spec for '{backend}'"), None))?;

        let handle = self
            .pool
            .acquire(&self.cancel, spec, &self.config, self.read_only)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;

        let result = handle.read_resource(&uri).await;
        self.pool.release(handle).await;

        result.map_err(|e| McpError::internal_error(e.to_string(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendSpec, ImageSpec};
    use crate::testutil::StubBuilder;
    use std::collections::BTreeMap;

    fn catalog_of(names: &[&str]) -> Arc<Catalog> {
        let mut backends = BTreeMap::new();
        for name in names {
            backends.insert(
                name.to_string(),
                BackendSpec::Image(ImageSpec {
                    name: name.to_string(),
                    image: format!("mcp/{name}"),
                    ..Default::default()
                }),
            );
        }
        Arc::new(Catalog { backends })
    }

    fn server(catalog: Arc<Catalog>, builder: Arc<StubBuilder>) -> GatewayServer {
        GatewayServer::new(
            ClientPool::with_builder(builder, false),
            catalog,
            Arc::new(BackendConfig::default()),
            false,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_broken_backends_do_not_take_down_the_union() {
        // Detached stub sessions answer no protocol calls, so every
        // backend's listing fails; the union is empty, not an error.
        let gateway = server(catalog_of(&["a", "b"]), StubBuilder::new());
        let tools = gateway.aggregate_tools().await;
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn test_failed_construction_is_skipped_in_listing() {
        let gateway = server(catalog_of(&["down"]), StubBuilder::failing());
        let tools = gateway.aggregate_tools().await;
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_has_no_route() {
        let gateway = server(catalog_of(&["a"]), StubBuilder::new());
        assert_eq!(gateway.tool_backend("no_such_tool").await, None);
    }
}
