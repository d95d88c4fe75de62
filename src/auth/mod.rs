pub mod callback;
pub mod challenge;
pub mod dcr;
pub mod discovery;
pub mod pkce;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::callback::{CALLBACK_WAIT_TIMEOUT, CallbackServer};
use crate::auth::challenge::{AuthChallenge, find_required_scopes, parse_www_authenticate};
use crate::auth::discovery::AuthorizationDiscovery;
use crate::config::RemoteSpec;
use crate::credentials::{ClientRegistration, CredentialStore};
use crate::errors::GatewayError;

/// Deadline for the unauthenticated initialize probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the reachability HEAD probe.
pub const HEAD_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of driving the authorization flow for a remote backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizeOutcome {
    /// The server answered the probe without a challenge.
    NotRequired,
    /// The flow completed; the helper holds a token for the server.
    Completed,
}

enum ProbeOutcome {
    NoChallenge,
    Challenges(Vec<AuthChallenge>),
}

/// Glues challenge parsing, metadata discovery, client registration, PKCE,
/// and the callback receiver into the remote-backend OAuth flow. No step
/// is retried; failures carry the step that aborted the flow.
pub struct AuthOrchestrator {
    http: reqwest::Client,
    store: CredentialStore,
    callback_port: u16,
}

impl AuthOrchestrator {
    pub fn new(store: CredentialStore, callback_port: u16) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::Transport(format!("building HTTP client: {e}")))?;
        Ok(Self {
            http,
            store,
            callback_port,
        })
    }

    /// Drive the flow for one remote backend, end to end: probe, discover,
    /// register, build the authorization URL, and wait for the
    /// out-of-process callback to complete the exchange.
    pub async fn authorize(
        &self,
        ctx: &CancellationToken,
        spec: &RemoteSpec,
    ) -> Result<AuthorizeOutcome> {
        let server_name = spec.name.as_str();

        let existing = match self.store.get_client_registration(server_name).await {
            Ok(registration) => Some(registration),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e).context("loading client registration"),
        };

        let (registration, discovery, scopes) = match existing {
            Some(registration) => {
                info!(server = %server_name, client_id = %registration.client_id, "reusing client registration");
                let discovery = discovery_from_registration(&registration, &spec.url);
                (registration, discovery, Vec::new())
            }
            None => {
                let challenges = match self.probe(ctx, &spec.url).await? {
                    ProbeOutcome::NoChallenge => {
                        info!(server = %server_name, "no authorization required");
                        return Ok(AuthorizeOutcome::NotRequired);
                    }
                    ProbeOutcome::Challenges(challenges) => challenges,
                };

                let discovery = discovery::discover(&self.http, &spec.url, &challenges)
                    .await
                    .context("discovering authorization metadata")?;

                // The challenge's scope requirement wins over metadata.
                let mut scopes = find_required_scopes(&challenges);
                if scopes.is_empty() {
                    scopes = discovery.scopes.clone();
                }

                let provider = spec.oauth.first().map(String::as_str).unwrap_or_default();
                let registration = dcr::register(
                    &self.http,
                    &discovery,
                    &scopes,
                    server_name,
                    provider,
                    self.callback_port,
                )
                .await
                .context("registering client")?;

                self.store
                    .put_client_registration(server_name, &registration)
                    .await
                    .context("persisting client registration")?;

                (registration, discovery, scopes)
            }
        };

        let (url, flow) = pkce::build_authorization_url(
            &discovery,
            &registration.client_id,
            &scopes,
            server_name,
            self.callback_port,
        )
        .context("building authorization URL")?;

        // The flow state must be stored before the URL escapes this
        // process; the callback completes against the stored copy.
        self.store
            .put_pkce_flow(&flow)
            .await
            .context("persisting authorization flow state")?;

        let server = CallbackServer::bind(self.callback_port, self.store.clone())
            .await
            .context("starting callback listener")?;

        present_url(&url);

        let code = tokio::select! {
            result = server.wait_for_code(CALLBACK_WAIT_TIMEOUT) => {
                result.context("waiting for authorization code")?
            }
            _ = ctx.cancelled() => bail!("authorization of '{server_name}' cancelled"),
        };

        info!(server = %server_name, code_len = code.len(), "authorization completed");
        Ok(AuthorizeOutcome::Completed)
    }

    /// Probe the server with an unauthenticated MCP initialize POST. A
    /// non-401 answer means no OAuth; a 401 must carry a usable challenge.
    async fn probe(&self, ctx: &CancellationToken, url: &str) -> Result<ProbeOutcome> {
        // Reachability first, so connect failures read as transport
        // problems rather than missing authorization.
        let head = self.http.head(url).timeout(HEAD_PROBE_TIMEOUT).send();
        tokio::select! {
            result = head => {
                result.map_err(|e| GatewayError::Transport(format!("reaching {url}: {e}")))
                    .context("probing server reachability")?;
            }
            _ = ctx.cancelled() => bail!("probe of {url} cancelled"),
        }

        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            },
        });

        let request = self
            .http
            .post(url)
            .timeout(PROBE_TIMEOUT)
            .header(ACCEPT, "application/json")
            .json(&body)
            .send();

        let response = tokio::select! {
            result = request => result
                .map_err(|e| GatewayError::Transport(format!("probing {url}: {e}")))
                .context("probing server authorization")?,
            _ = ctx.cancelled() => bail!("probe of {url} cancelled"),
        };

        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(ProbeOutcome::NoChallenge);
        }

        let header = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                GatewayError::Unauthorized(format!("{url} returned 401 without a challenge"))
            })
            .context("probing server authorization")?;

        let challenges =
            parse_www_authenticate(header).context("parsing authorization challenge")?;
        Ok(ProbeOutcome::Challenges(challenges))
    }
}

/// A stored registration already carries the endpoints the flow needs;
/// discovery is skipped and the resource is bound to the server URL.
fn discovery_from_registration(
    registration: &ClientRegistration,
    server_url: &str,
) -> AuthorizationDiscovery {
    AuthorizationDiscovery {
        resource_url: server_url.to_string(),
        scopes: Vec::new(),
        issuer: String::new(),
        authorization_endpoint: registration.authorization_endpoint.clone(),
        token_endpoint: registration.token_endpoint.clone(),
        registration_endpoint: None,
        requires_oauth: true,
        supports_pkce: true,
    }
}

/// Best-effort platform browser spawn; the URL is printed either way so a
/// headless operator can copy it.
fn present_url(url: &str) {
    eprintln!("Open this URL to authorize the backend:\n{url}");

    #[cfg(target_os = "macos")]
    let spawned = std::process::Command::new("open").arg(url).spawn();
    #[cfg(target_os = "linux")]
    let spawned = std::process::Command::new("xdg-open").arg(url).spawn();
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    let spawned: std::io::Result<std::process::Child> =
        Err(std::io::Error::other("no browser launcher on this platform"));

    if let Err(e) = spawned {
        warn!(error = %e, "could not open browser");
    }
}
