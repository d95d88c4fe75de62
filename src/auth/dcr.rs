use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::auth::callback::redirect_uri;
use crate::auth::discovery::AuthorizationDiscovery;
use crate::credentials::ClientRegistration;
use crate::errors::{GatewayError, message_from_body};

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    #[serde(default)]
    client_id: String,
}

/// Register a public client at the discovered registration endpoint
/// (RFC 7591 Dynamic Client Registration).
pub async fn register(
    client: &reqwest::Client,
    discovery: &AuthorizationDiscovery,
    requested_scopes: &[String],
    server_name: &str,
    provider_name: &str,
    callback_port: u16,
) -> Result<ClientRegistration, GatewayError> {
    let endpoint = discovery.registration_endpoint.as_deref().ok_or_else(|| {
        GatewayError::RegistrationRejected(format!(
            "authorization server for '{server_name}' offers no registration endpoint"
        ))
    })?;

    let client_name = format!("MCP Gateway - {server_name}");
    let mut body = json!({
        "client_name": client_name,
        "redirect_uris": [redirect_uri(callback_port)],
        "token_endpoint_auth_method": "none",
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "software_id": env!("CARGO_PKG_NAME"),
        "software_version": env!("CARGO_PKG_VERSION"),
    });
    if !requested_scopes.is_empty() {
        body["scope"] = json!(requested_scopes.join(" "));
    }

    let response = client
        .post(endpoint)
        .json(&body)
        .send()
        .await
        .map_err(|e| GatewayError::Transport(format!("registering at {endpoint}: {e}")))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| GatewayError::Transport(format!("reading registration response: {e}")))?;

    if !matches!(status.as_u16(), 200 | 201) {
        return Err(GatewayError::RegistrationRejected(format!(
            "{endpoint} returned {status}: {}",
            message_from_body(&text)
        )));
    }

    let parsed: RegistrationResponse = serde_json::from_str(&text).map_err(|e| {
        GatewayError::RegistrationRejected(format!("decoding registration response: {e}"))
    })?;

    if parsed.client_id.is_empty() {
        return Err(GatewayError::RegistrationRejected(
            "registration response missing client_id".to_string(),
        ));
    }

    Ok(ClientRegistration {
        server_name: server_name.to_string(),
        client_id: parsed.client_id,
        client_name,
        authorization_endpoint: discovery.authorization_endpoint.clone(),
        token_endpoint: discovery.token_endpoint.clone(),
        provider_name: provider_name.to_string(),
        registered_at: Utc::now(),
    })
}
