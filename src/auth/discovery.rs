use std::time::Duration;

use reqwest::header::ACCEPT;
use serde::Deserialize;
use url::Url;

use crate::auth::challenge::{AuthChallenge, find_resource_metadata_url};
use crate::errors::{GatewayError, message_from_body};

/// Deadline for metadata document fetches.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

pub const WELL_KNOWN_AUTHORIZATION_SERVER: &str = "/.well-known/oauth-authorization-server";
pub const WELL_KNOWN_PROTECTED_RESOURCE: &str = "/.well-known/oauth-protected-resource";

/// RFC 9728 protected-resource metadata, normalized: the wire form carries
/// either a scalar `authorization_server` or a list, never both meanings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectedResourceMetadata {
    pub resource_url: String,
    pub authorization_servers: Vec<String>,
    pub scopes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProtectedResourceWire {
    #[serde(default)]
    resource: String,
    #[serde(default)]
    authorization_server: Option<String>,
    #[serde(default)]
    authorization_servers: Option<Vec<String>>,
    #[serde(default)]
    scopes_supported: Vec<String>,
}

/// RFC 8414 authorization-server metadata, the fields the flow consumes.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AuthorizationServerMetadata {
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub authorization_endpoint: String,
    #[serde(default)]
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    #[serde(default)]
    pub grant_types_supported: Vec<String>,
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// Merged discovery result: protected-resource plus authorization-server
/// metadata and derived capability flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthorizationDiscovery {
    pub resource_url: String,
    pub scopes: Vec<String>,
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: Option<String>,
    pub requires_oauth: bool,
    pub supports_pkce: bool,
}

/// Fetch and validate an RFC 9728 protected-resource metadata document.
pub async fn fetch_protected_resource_metadata(
    client: &reqwest::Client,
    url: &str,
) -> Result<ProtectedResourceMetadata, GatewayError> {
    let wire: ProtectedResourceWire = get_json(client, url).await?;

    if wire.resource.is_empty() {
        return Err(GatewayError::InvalidMetadata(format!(
            "protected-resource metadata at {url} has empty resource"
        )));
    }

    let authorization_servers = match (wire.authorization_server, wire.authorization_servers) {
        (_, Some(servers)) if !servers.is_empty() => servers,
        (Some(server), _) if !server.is_empty() => vec![server],
        _ => {
            return Err(GatewayError::InvalidMetadata(format!(
                "protected-resource metadata at {url} names no authorization server"
            )));
        }
    };

    Ok(ProtectedResourceMetadata {
        resource_url: wire.resource,
        authorization_servers,
        scopes: wire.scopes_supported,
    })
}

/// Fetch and validate RFC 8414 authorization-server metadata from the
/// well-known path under `base_url`. The path is appended to the base
/// exactly as given. The issuer's `(scheme, host)` must match the base's.
pub async fn fetch_authorization_server_metadata(
    client: &reqwest::Client,
    base_url: &str,
) -> Result<AuthorizationServerMetadata, GatewayError> {
    let url = format!("{base_url}{WELL_KNOWN_AUTHORIZATION_SERVER}");
    let metadata: AuthorizationServerMetadata = get_json(client, &url).await?;

    for (field, value) in [
        ("issuer", &metadata.issuer),
        ("authorization_endpoint", &metadata.authorization_endpoint),
        ("token_endpoint", &metadata.token_endpoint),
    ] {
        if value.is_empty() {
            return Err(GatewayError::InvalidMetadata(format!(
                "authorization-server metadata at {url} has empty {field}"
            )));
        }
    }

    if !same_scheme_and_host(&metadata.issuer, base_url)? {
        return Err(GatewayError::InvalidMetadata(format!(
            "issuer mismatch: metadata issuer '{}' does not match requested server '{base_url}'",
            metadata.issuer
        )));
    }

    Ok(metadata)
}

/// Run the ordered discovery strategies for a server that answered the
/// probe with a challenge: the challenge's `resource_metadata` URL first,
/// then the well-known protected-resource path on the server's origin,
/// then direct authorization-server metadata on the origin. First success
/// wins.
pub async fn discover(
    client: &reqwest::Client,
    server_url: &str,
    challenges: &[AuthChallenge],
) -> Result<AuthorizationDiscovery, GatewayError> {
    let origin = origin_of(server_url)?;

    if let Some(metadata_url) = find_resource_metadata_url(challenges)
        && let Ok(resource) = fetch_protected_resource_metadata(client, &metadata_url).await
    {
        return from_protected_resource(client, resource).await;
    }

    let well_known = format!("{origin}{WELL_KNOWN_PROTECTED_RESOURCE}");
    if let Ok(resource) = fetch_protected_resource_metadata(client, &well_known).await {
        return from_protected_resource(client, resource).await;
    }

    match fetch_authorization_server_metadata(client, &origin).await {
        Ok(server) => Ok(merge(server_url.to_string(), Vec::new(), server)),
        Err(e) => Err(GatewayError::DiscoveryFailed(format!(
            "no protected-resource or authorization-server metadata for {server_url}: {e}"
        ))),
    }
}

async fn from_protected_resource(
    client: &reqwest::Client,
    resource: ProtectedResourceMetadata,
) -> Result<AuthorizationDiscovery, GatewayError> {
    // Multiple authorization servers: the first listed is used.
    let base = resource.authorization_servers[0].clone();
    let server = fetch_authorization_server_metadata(client, &base).await?;
    Ok(merge(resource.resource_url, resource.scopes, server))
}

fn merge(
    resource_url: String,
    resource_scopes: Vec<String>,
    server: AuthorizationServerMetadata,
) -> AuthorizationDiscovery {
    let supports_pkce = server
        .code_challenge_methods_supported
        .iter()
        .any(|m| m == "S256");
    let scopes = if resource_scopes.is_empty() {
        server.scopes_supported.clone()
    } else {
        resource_scopes
    };

    AuthorizationDiscovery {
        resource_url,
        scopes,
        issuer: server.issuer,
        authorization_endpoint: server.authorization_endpoint,
        token_endpoint: server.token_endpoint,
        registration_endpoint: server.registration_endpoint,
        requires_oauth: true,
        supports_pkce,
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
) -> Result<T, GatewayError> {
    let response = client
        .get(url)
        .timeout(METADATA_TIMEOUT)
        .header(ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| GatewayError::Transport(format!("fetching {url}: {e}")))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| GatewayError::Transport(format!("reading {url}: {e}")))?;

    if !status.is_success() {
        return Err(GatewayError::DiscoveryFailed(format!(
            "{url} returned {status}: {}",
            message_from_body(&body)
        )));
    }

    serde_json::from_str(&body)
        .map_err(|e| GatewayError::InvalidMetadata(format!("decoding {url}: {e}")))
}

fn same_scheme_and_host(issuer: &str, base: &str) -> Result<bool, GatewayError> {
    let issuer = Url::parse(issuer)
        .map_err(|e| GatewayError::InvalidMetadata(format!("invalid issuer URL: {e}")))?;
    let base = Url::parse(base)
        .map_err(|e| GatewayError::InvalidMetadata(format!("invalid server URL: {e}")))?;
    Ok(issuer.scheme() == base.scheme() && issuer.host_str() == base.host_str())
}

/// The `scheme://host[:port]` origin of a URL.
pub fn origin_of(url: &str) -> Result<String, GatewayError> {
    let parsed = Url::parse(url)
        .map_err(|e| GatewayError::Config(format!("invalid server URL '{url}': {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| GatewayError::Config(format!("server URL '{url}' has no host")))?;
    let mut origin = format!("{}://{host}", parsed.scheme());
    if let Some(port) = parsed.port() {
        origin.push_str(&format!(":{port}"));
    }
    Ok(origin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve_router;
    use axum::Router;
    use axum::routing::get;
    use serde_json::json;

    fn http() -> reqwest::Client {
        reqwest::Client::new()
    }

    async fn serve_json(path: &'static str, body: serde_json::Value) -> std::net::SocketAddr {
        let router = Router::new().route(path, get(move || async move { axum::Json(body.clone()) }));
        serve_router(router).await
    }

    #[tokio::test]
    async fn test_protected_resource_scalar_normalized() {
        let addr = serve_json(
            "/.well-known/oauth-protected-resource",
            json!({
                "resource": "https://api.example.com/mcp",
                "authorization_server": "https://auth.example.com",
                "scopes_supported": ["read"]
            }),
        )
        .await;

        let metadata = fetch_protected_resource_metadata(
            &http(),
            &format!("http://{addr}/.well-known/oauth-protected-resource"),
        )
        .await
        .unwrap();

        assert_eq!(metadata.resource_url, "https://api.example.com/mcp");
        assert_eq!(metadata.authorization_servers, vec!["https://auth.example.com"]);
        assert_eq!(metadata.scopes, vec!["read"]);
    }

    #[tokio::test]
    async fn test_protected_resource_list_preserved() {
        let addr = serve_json(
            "/prm",
            json!({
                "resource": "https://api.example.com",
                "authorization_servers": ["https://a.example.com", "https://b.example.com"]
            }),
        )
        .await;

        let metadata =
            fetch_protected_resource_metadata(&http(), &format!("http://{addr}/prm"))
                .await
                .unwrap();
        assert_eq!(metadata.authorization_servers.len(), 2);
    }

    #[tokio::test]
    async fn test_protected_resource_empty_resource_rejected() {
        let addr = serve_json(
            "/prm",
            json!({"authorization_server": "https://auth.example.com"}),
        )
        .await;

        let err = fetch_protected_resource_metadata(&http(), &format!("http://{addr}/prm"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidMetadata(_)), "{err}");
    }

    #[tokio::test]
    async fn test_protected_resource_no_servers_rejected() {
        let addr = serve_json("/prm", json!({"resource": "https://api.example.com"})).await;

        let err = fetch_protected_resource_metadata(&http(), &format!("http://{addr}/prm"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidMetadata(_)), "{err}");
    }

    #[tokio::test]
    async fn test_authorization_server_metadata_fetched() {
        let addr_holder = std::sync::Arc::new(std::sync::OnceLock::new());
        let holder = std::sync::Arc::clone(&addr_holder);
        let router = Router::new().route(
            "/.well-known/oauth-authorization-server",
            get(move || {
                let holder = std::sync::Arc::clone(&holder);
                async move {
                    let addr: &std::net::SocketAddr = holder.get().unwrap();
                    axum::Json(json!({
                        "issuer": format!("http://{addr}"),
                        "authorization_endpoint": format!("http://{addr}/authorize"),
                        "token_endpoint": format!("http://{addr}/token"),
                        "registration_endpoint": format!("http://{addr}/register"),
                        "code_challenge_methods_supported": ["S256"]
                    }))
                }
            }),
        );
        let addr = serve_router(router).await;
        addr_holder.set(addr).unwrap();

        let metadata =
            fetch_authorization_server_metadata(&http(), &format!("http://{addr}"))
                .await
                .unwrap();
        assert_eq!(metadata.issuer, format!("http://{addr}"));
        assert!(metadata.registration_endpoint.is_some());
        assert!(metadata.code_challenge_methods_supported.contains(&"S256".to_string()));
    }

    #[tokio::test]
    async fn test_issuer_mismatch_rejected() {
        let addr = serve_json(
            "/.well-known/oauth-authorization-server",
            json!({
                "issuer": "https://other.example.com",
                "authorization_endpoint": "https://other.example.com/authorize",
                "token_endpoint": "https://other.example.com/token"
            }),
        )
        .await;

        let err = fetch_authorization_server_metadata(&http(), &format!("http://{addr}"))
            .await
            .unwrap_err();
        match err {
            GatewayError::InvalidMetadata(msg) => assert!(msg.contains("issuer mismatch"), "{msg}"),
            other => panic!("expected InvalidMetadata, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_required_field_rejected() {
        let addr = serve_json(
            "/.well-known/oauth-authorization-server",
            json!({
                "issuer": "http://127.0.0.1",
                "authorization_endpoint": "http://127.0.0.1/authorize"
            }),
        )
        .await;

        let err = fetch_authorization_server_metadata(&http(), &format!("http://{addr}"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidMetadata(_)), "{err}");
    }

    #[test]
    fn test_origin_of() {
        assert_eq!(
            origin_of("https://api.example.com/mcp/v1?x=1").unwrap(),
            "https://api.example.com"
        );
        assert_eq!(
            origin_of("http://127.0.0.1:8080/mcp").unwrap(),
            "http://127.0.0.1:8080"
        );
        assert!(origin_of("not a url").is_err());
    }
}
