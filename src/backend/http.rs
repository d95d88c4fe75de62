use rmcp::{
    ServiceExt,
    service::RunningService,
    transport::{
        SseClientTransport,
        sse_client::SseClientConfig,
        streamable_http_client::{StreamableHttpClientTransport, StreamableHttpClientTransportConfig},
    },
};
use tracing::{info, warn};

use super::INITIALIZE_TIMEOUT;
use super::decorated_client::DecoratedClient;
use crate::config::{BackendConfig, RemoteSpec, RemoteTransport};
use crate::credentials::CredentialStore;
use crate::errors::GatewayError;
use crate::template;

/// Connect to a remote backend over its configured wire subtype and
/// complete the MCP handshake.
///
/// Header value templates are evaluated against the backend config, then
/// POSIX `$VAR` references resolve from the backend's secrets (exact-name
/// match) with a process-environment fallback. When the credential helper
/// holds an access token for this server and the spec did not pin an
/// `Authorization` header, the token is sent as a Bearer credential.
pub(crate) async fn connect(
    name: &str,
    spec: &RemoteSpec,
    config: &BackendConfig,
    store: &CredentialStore,
) -> Result<RunningService<rmcp::RoleClient, ()>, GatewayError> {
    let mut authorization: Option<String> = None;
    let mut accept_pinned = false;
    let mut default_headers = reqwest::header::HeaderMap::new();

    for (key, value_template) in &spec.headers {
        let value = evaluate_header(value_template, config);
        if key.eq_ignore_ascii_case("Authorization") {
            authorization = Some(value);
            continue;
        }
        if key.eq_ignore_ascii_case("Accept") {
            accept_pinned = true;
        }
        match (
            key.parse::<reqwest::header::HeaderName>(),
            value.parse::<reqwest::header::HeaderValue>(),
        ) {
            (Ok(header_name), Ok(header_value)) => {
                default_headers.insert(header_name, header_value);
            }
            _ => {
                warn!(backend = %name, header = %key, "skipping unparseable custom header");
            }
        }
    }

    // A stored access token backs the spec's Authorization header off.
    let bearer = match authorization {
        Some(value) => Some(value.strip_prefix("Bearer ").unwrap_or(&value).to_string()),
        None => match store.get_access_token(name).await {
            Ok(token) => Some(token),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(backend = %name, error = %e, "credential helper token lookup failed");
                None
            }
        },
    };

    let service = match spec.transport {
        RemoteTransport::HttpStream => {
            let client = reqwest::Client::builder()
                .default_headers(default_headers)
                .build()
                .map_err(|e| GatewayError::Transport(format!("building HTTP client: {e}")))?;

            let mut transport_config = StreamableHttpClientTransportConfig::with_uri(spec.url.as_str());
            if let Some(token) = bearer {
                transport_config = transport_config.auth_header(token);
            }

            let transport = StreamableHttpClientTransport::with_client(
                DecoratedClient::new(client, accept_pinned),
                transport_config,
            );
            await_handshake(name, &spec.url, ().serve(transport)).await?
        }
        RemoteTransport::Sse => {
            if let Some(token) = bearer
                && let Ok(value) = format!("Bearer {token}").parse::<reqwest::header::HeaderValue>()
            {
                default_headers.insert(reqwest::header::AUTHORIZATION, value);
            }
            let client = reqwest::Client::builder()
                .default_headers(default_headers)
                .build()
                .map_err(|e| GatewayError::Transport(format!("building SSE client: {e}")))?;

            let transport = SseClientTransport::start_with_client(
                client,
                SseClientConfig {
                    sse_endpoint: spec.url.clone().into(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                GatewayError::Transport(format!("connecting SSE stream to {}: {e}", spec.url))
            })?;
            await_handshake(name, &spec.url, ().serve(transport)).await?
        }
    };

    if let Some(peer) = service.peer_info() {
        info!(
            backend = %name,
            url = %spec.url,
            server_name = %peer.server_info.name,
            server_version = %peer.server_info.version,
            "remote MCP handshake complete"
        );
    } else {
        info!(backend = %name, url = %spec.url, "remote MCP handshake complete (no peer info)");
    }

    Ok(service)
}

async fn await_handshake<F, E>(
    name: &str,
    url: &str,
    handshake: F,
) -> Result<RunningService<rmcp::RoleClient, ()>, GatewayError>
where
    F: Future<Output = Result<RunningService<rmcp::RoleClient, ()>, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(INITIALIZE_TIMEOUT, handshake).await {
        Ok(Ok(service)) => Ok(service),
        Ok(Err(e)) => Err(GatewayError::Protocol(format!(
            "MCP handshake with remote backend '{name}' at {url} failed: {e}"
        ))),
        Err(_) => Err(GatewayError::Timeout(format!(
            "MCP handshake with remote backend '{name}' at {url} timed out after {}s",
            INITIALIZE_TIMEOUT.as_secs()
        ))),
    }
}

fn evaluate_header(value_template: &str, config: &BackendConfig) -> String {
    let value = template::evaluate(value_template, &config.config);
    shellexpand::env_with_context_no_errors(&value, |name| {
        config
            .secrets
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_header_template_evaluation() {
        let config = BackendConfig {
            config: json!({"linear": {"workspace": "acme"}}),
            secrets: HashMap::new(),
        };
        assert_eq!(
            evaluate_header("{{linear.workspace}}", &config),
            "acme"
        );
    }

    #[test]
    fn test_header_secret_expansion() {
        let config = BackendConfig {
            config: json!({}),
            secrets: HashMap::from([("API_TOKEN".to_string(), "tok-9".to_string())]),
        };
        assert_eq!(evaluate_header("Bearer $API_TOKEN", &config), "Bearer tok-9");
    }

    #[test]
    fn test_header_plain_value_passthrough() {
        let config = BackendConfig::default();
        assert_eq!(evaluate_header("application/json", &config), "application/json");
    }
}
