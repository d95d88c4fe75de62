use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{GatewayError, message_from_body};

/// Deadline for every credential-helper call.
pub const HELPER_TIMEOUT: Duration = Duration::from_secs(10);

/// Default loopback endpoint of the credential helper.
pub const DEFAULT_HELPER_URL: &str = "http://127.0.0.1:7910";

/// A public-client registration persisted by the credential helper,
/// keyed by server name. No client secret: registration always requests
/// `token_endpoint_auth_method = "none"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientRegistration {
    pub server_name: String,
    pub client_id: String,
    pub client_name: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub provider_name: String,
    pub registered_at: DateTime<Utc>,
}

/// Short-lived PKCE flow state persisted by the credential helper, keyed
/// by `state`. Lives from authorization-URL construction until the
/// callback lands or the wait times out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PkceFlow {
    pub state: String,
    pub code_verifier: String,
    pub resource_url: String,
    pub server_name: String,
}

#[derive(Debug, Deserialize)]
struct TokenRecord {
    access_token: String,
}

#[derive(Debug, Serialize)]
struct ExchangeRequest<'a> {
    state: &'a str,
    code: &'a str,
}

/// Typed client for the credential helper: an asynchronous key-value store
/// over a loopback transport. The helper owns long-term credential storage
/// and the code-for-token exchange; the core holds only transient copies.
#[derive(Clone)]
pub struct CredentialStore {
    base_url: String,
    client: reqwest::Client,
}

impl CredentialStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(HELPER_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Transport(format!("building helper client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn default_local() -> Result<Self, GatewayError> {
        Self::new(DEFAULT_HELPER_URL)
    }

    pub async fn get_client_registration(
        &self,
        server_name: &str,
    ) -> Result<ClientRegistration, GatewayError> {
        let url = format!("{}/registrations/{server_name}", self.base_url);
        let response = self.client.get(&url).send().await.map_err(transport)?;
        decode(response, || format!("client registration for '{server_name}'")).await
    }

    pub async fn put_client_registration(
        &self,
        server_name: &str,
        registration: &ClientRegistration,
    ) -> Result<(), GatewayError> {
        let url = format!("{}/registrations/{server_name}", self.base_url);
        let response = self
            .client
            .put(&url)
            .json(registration)
            .send()
            .await
            .map_err(transport)?;
        expect_ok(response, || format!("storing registration for '{server_name}'")).await
    }

    pub async fn delete_client_registration(&self, server_name: &str) -> Result<(), GatewayError> {
        let url = format!("{}/registrations/{server_name}", self.base_url);
        let response = self.client.delete(&url).send().await.map_err(transport)?;
        // A delete of an absent key is not an error.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        expect_ok(response, || format!("deleting registration for '{server_name}'")).await
    }

    pub async fn put_pkce_flow(&self, flow: &PkceFlow) -> Result<(), GatewayError> {
        let url = format!("{}/pkce/{}", self.base_url, flow.state);
        let response = self
            .client
            .put(&url)
            .json(flow)
            .send()
            .await
            .map_err(transport)?;
        expect_ok(response, || format!("storing flow state for '{}'", flow.server_name)).await
    }

    pub async fn get_access_token(&self, server_name: &str) -> Result<String, GatewayError> {
        let url = format!("{}/tokens/{server_name}", self.base_url);
        let response = self.client.get(&url).send().await.map_err(transport)?;
        let record: TokenRecord =
            decode(response, || format!("access token for '{server_name}'")).await?;
        Ok(record.access_token)
    }

    /// Delegate the code-for-token exchange. The helper looks up the PKCE
    /// flow by `state`, redeems the code at the token endpoint with the
    /// stored verifier, and persists the token under the server name.
    pub async fn exchange_code(&self, state: &str, code: &str) -> Result<(), GatewayError> {
        let url = format!("{}/exchange", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&ExchangeRequest { state, code })
            .send()
            .await
            .map_err(transport)?;
        expect_ok(response, || "exchanging authorization code".to_string()).await
    }
}

fn transport(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(format!("credential helper: {e}"))
    } else {
        GatewayError::Transport(format!("credential helper: {e}"))
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    what: impl Fn() -> String,
) -> Result<T, GatewayError> {
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(GatewayError::NotFound(what()));
    }
    let body = response.text().await.map_err(transport)?;
    if !status.is_success() {
        return Err(GatewayError::Transport(format!(
            "credential helper returned {status} for {}: {}",
            what(),
            message_from_body(&body)
        )));
    }
    serde_json::from_str(&body)
        .map_err(|e| GatewayError::Protocol(format!("decoding {}: {e}", what())))
}

async fn expect_ok(
    response: reqwest::Response,
    what: impl Fn() -> String,
) -> Result<(), GatewayError> {
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(GatewayError::NotFound(what()));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::Transport(format!(
            "credential helper returned {status} while {}: {}",
            what(),
            message_from_body(&body)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve_router;
    use axum::Router;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, post, put};

    fn sample_registration() -> ClientRegistration {
        ClientRegistration {
            server_name: "linear".to_string(),
            client_id: "abc123".to_string(),
            client_name: "MCP Gateway - linear".to_string(),
            authorization_endpoint: "https://auth.example.com/authorize".to_string(),
            token_endpoint: "https://auth.example.com/token".to_string(),
            provider_name: "linear".to_string(),
            registered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_get_registration_roundtrip() {
        let reg = sample_registration();
        let body = serde_json::to_string(&reg).unwrap();
        let router = Router::new().route(
            "/registrations/{server}",
            get(move |Path(server): Path<String>| {
                let body = body.clone();
                async move {
                    assert_eq!(server, "linear");
                    ([(axum::http::header::CONTENT_TYPE, "application/json")], body)
                }
            }),
        );
        let addr = serve_router(router).await;

        let store = CredentialStore::new(format!("http://{addr}")).unwrap();
        let fetched = store.get_client_registration("linear").await.unwrap();
        assert_eq!(fetched, reg);
    }

    #[tokio::test]
    async fn test_missing_registration_is_not_found() {
        let router = Router::new();
        let addr = serve_router(router).await;

        let store = CredentialStore::new(format!("http://{addr}")).unwrap();
        let err = store.get_client_registration("absent").await.unwrap_err();
        assert!(err.is_not_found(), "expected NotFound, got {err}");
    }

    #[tokio::test]
    async fn test_put_pkce_flow_keyed_by_state() {
        let router = Router::new().route(
            "/pkce/{state}",
            put(|Path(state): Path<String>, axum::Json(flow): axum::Json<PkceFlow>| async move {
                assert_eq!(state, flow.state);
                StatusCode::NO_CONTENT
            }),
        );
        let addr = serve_router(router).await;

        let store = CredentialStore::new(format!("http://{addr}")).unwrap();
        let flow = PkceFlow {
            state: "st-1".to_string(),
            code_verifier: "ver".to_string(),
            resource_url: "https://api.example.com/mcp".to_string(),
            server_name: "linear".to_string(),
        };
        store.put_pkce_flow(&flow).await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_code_posts_state_and_code() {
        let router = Router::new().route(
            "/exchange",
            post(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                assert_eq!(body["state"], "st-1");
                assert_eq!(body["code"], "authcode");
                StatusCode::OK
            }),
        );
        let addr = serve_router(router).await;

        let store = CredentialStore::new(format!("http://{addr}")).unwrap();
        store.exchange_code("st-1", "authcode").await.unwrap();
    }

    #[tokio::test]
    async fn test_helper_error_message_extracted() {
        let router = Router::new().route(
            "/exchange",
            post(|| async {
                (
                    StatusCode::BAD_GATEWAY,
                    r#"{"error_description":"token endpoint unreachable"}"#,
                )
            }),
        );
        let addr = serve_router(router).await;

        let store = CredentialStore::new(format!("http://{addr}")).unwrap();
        let err = store.exchange_code("st", "code").await.unwrap_err();
        assert!(err.to_string().contains("token endpoint unreachable"));
    }
}
