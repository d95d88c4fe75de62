use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore as _;
use sha2::{Digest, Sha256};
use url::Url;

use crate::auth::callback::redirect_uri;
use crate::auth::discovery::AuthorizationDiscovery;
use crate::credentials::PkceFlow;
use crate::errors::GatewayError;

/// Generate a PKCE code verifier: 96 cryptographically random bytes,
/// base64url-encoded without padding (exactly 128 characters).
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 96];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate an opaque flow state: 32 random bytes, base64url-encoded.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// The S256 code challenge for a verifier.
pub fn s256_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Compose a PKCE-enabled authorization URL for a discovered server.
///
/// The returned flow state must be persisted keyed by its `state` before
/// the URL is presented; the out-of-process callback completes the
/// exchange by looking the flow up again.
pub fn build_authorization_url(
    discovery: &AuthorizationDiscovery,
    client_id: &str,
    scopes: &[String],
    server_name: &str,
    callback_port: u16,
) -> Result<(String, PkceFlow), GatewayError> {
    if discovery.authorization_endpoint.is_empty() {
        return Err(GatewayError::Config(format!(
            "no authorization endpoint discovered for '{server_name}'"
        )));
    }
    if client_id.is_empty() {
        return Err(GatewayError::Config(format!(
            "empty client_id for '{server_name}'"
        )));
    }

    let code_verifier = generate_code_verifier();
    let state = generate_state();
    let challenge = s256_challenge(&code_verifier);

    let mut url = Url::parse(&discovery.authorization_endpoint).map_err(|e| {
        GatewayError::Config(format!(
            "invalid authorization endpoint '{}': {e}",
            discovery.authorization_endpoint
        ))
    })?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("client_id", client_id);
        query.append_pair("response_type", "code");
        query.append_pair("redirect_uri", &redirect_uri(callback_port));
        query.append_pair("state", &state);
        query.append_pair("code_challenge", &challenge);
        query.append_pair("code_challenge_method", "S256");
        if !discovery.resource_url.is_empty() {
            // Audience binding: the issued token is scoped to the resource.
            query.append_pair("resource", &discovery.resource_url);
        }
        if !scopes.is_empty() {
            query.append_pair("scope", &scopes.join(" "));
        }
    }

    let flow = PkceFlow {
        state,
        code_verifier,
        resource_url: discovery.resource_url.clone(),
        server_name: server_name.to_string(),
    };

    Ok((url.to_string(), flow))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovery() -> AuthorizationDiscovery {
        AuthorizationDiscovery {
            resource_url: "https://api.example.com/mcp".to_string(),
            scopes: vec![],
            issuer: "https://auth.example.com".to_string(),
            authorization_endpoint: "https://auth.example.com/authorize".to_string(),
            token_endpoint: "https://auth.example.com/token".to_string(),
            registration_endpoint: None,
            requires_oauth: true,
            supports_pkce: true,
        }
    }

    #[test]
    fn test_verifier_is_96_bytes_and_128_chars() {
        let verifier = generate_code_verifier();
        assert_eq!(verifier.len(), 128);
        let decoded = URL_SAFE_NO_PAD.decode(&verifier).unwrap();
        assert_eq!(decoded.len(), 96);
    }

    #[test]
    fn test_verifier_is_random() {
        assert_ne!(generate_code_verifier(), generate_code_verifier());
    }

    #[test]
    fn test_state_decodes_to_32_bytes() {
        let state = generate_state();
        let decoded = URL_SAFE_NO_PAD.decode(&state).unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn test_s256_challenge_known_vector() {
        // RFC 7636 appendix B test vector.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            s256_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_authorization_url_parameters() {
        let (url, flow) =
            build_authorization_url(&discovery(), "client-1", &["read".to_string(), "write".to_string()], "linear", 7978)
                .unwrap();

        let parsed = Url::parse(&url).unwrap();
        let pairs: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();

        assert_eq!(pairs["client_id"], "client-1");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["redirect_uri"], "http://127.0.0.1:7978/callback");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["state"], flow.state);
        assert_eq!(pairs["code_challenge"], s256_challenge(&flow.code_verifier));
        assert_eq!(pairs["resource"], "https://api.example.com/mcp");
        assert_eq!(pairs["scope"], "read write");

        assert_eq!(flow.server_name, "linear");
        assert_eq!(flow.resource_url, "https://api.example.com/mcp");
    }

    #[test]
    fn test_scope_omitted_when_empty() {
        let (url, _) = build_authorization_url(&discovery(), "client-1", &[], "linear", 7978).unwrap();
        assert!(!url.contains("scope="), "{url}");
    }

    #[test]
    fn test_resource_omitted_when_empty() {
        let mut d = discovery();
        d.resource_url = String::new();
        let (url, _) = build_authorization_url(&d, "client-1", &[], "linear", 7978).unwrap();
        assert!(!url.contains("resource="), "{url}");
    }

    #[test]
    fn test_empty_endpoint_rejected() {
        let mut d = discovery();
        d.authorization_endpoint = String::new();
        let err = build_authorization_url(&d, "client-1", &[], "linear", 7978).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_empty_client_id_rejected() {
        let err = build_authorization_url(&discovery(), "", &[], "linear", 7978).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
