use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::CredentialStore;
use crate::errors::GatewayError;

/// Fixed loopback port of the authorization callback receiver. Can be
/// overridden through the callback-port environment variable at startup.
pub const DEFAULT_CALLBACK_PORT: u16 = 7978;

/// How long a flow waits for the browser redirect.
pub const CALLBACK_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace period between answering the browser and shutting the listener
/// down, so the success page flushes before the socket closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const SUCCESS_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>Authorization complete</title></head>\n<body>\n<h1>Authorization complete</h1>\n<p>You can close this tab and return to the gateway.</p>\n</body>\n</html>\n";

/// The redirect URI registered for, and served by, the callback receiver.
pub fn redirect_uri(port: u16) -> String {
    format!("http://127.0.0.1:{port}/callback")
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

struct FlowShared {
    /// Single-capacity rendezvous with the waiter. Taken on the first
    /// completing request; late duplicates find it empty and get 409.
    waiter: Mutex<Option<oneshot::Sender<Result<String, GatewayError>>>>,
    store: CredentialStore,
    shutdown: CancellationToken,
}

impl FlowShared {
    fn take_waiter(&self) -> Option<oneshot::Sender<Result<String, GatewayError>>> {
        self.waiter.lock().expect("waiter lock").take()
    }

    fn schedule_shutdown(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            shutdown.cancel();
        });
    }
}

/// A scoped, single-flow HTTP receiver for the authorization response.
///
/// Constructed per flow and dropped when the flow completes: binding the
/// loopback port is the listening state, so a second concurrent flow
/// cannot start a second receiver. Accepts GET on `/`, `/callback`, and
/// `/oauth/callback`.
pub struct CallbackServer {
    port: u16,
    rx: oneshot::Receiver<Result<String, GatewayError>>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl CallbackServer {
    pub async fn bind(port: u16, store: CredentialStore) -> Result<Self, GatewayError> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| {
                GatewayError::Transport(format!("binding callback listener on port {port}: {e}"))
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| GatewayError::Transport(format!("callback listener address: {e}")))?
            .port();

        let (tx, rx) = oneshot::channel();
        let shutdown = CancellationToken::new();
        let shared = Arc::new(FlowShared {
            waiter: Mutex::new(Some(tx)),
            store,
            shutdown: shutdown.clone(),
        });

        let app = Router::new()
            .route("/", get(handle_callback))
            .route("/callback", get(handle_callback))
            .route("/oauth/callback", get(handle_callback))
            .with_state(shared);

        let server_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(server_shutdown.cancelled_owned());
            if let Err(e) = serve.await {
                warn!(error = %e, "callback listener failed");
            }
        });

        debug!(port, "callback listener started");
        Ok(Self {
            port,
            rx,
            shutdown,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Block up to `timeout` for the authorization response, then shut the
    /// listener down. Returns the authorization code on success.
    pub async fn wait_for_code(self, timeout: Duration) -> Result<String, GatewayError> {
        let outcome = tokio::time::timeout(timeout, self.rx).await;
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Transport(
                "callback listener closed before completion".to_string(),
            )),
            Err(_) => {
                self.shutdown.cancel();
                Err(GatewayError::Timeout(format!(
                    "no authorization response within {}s",
                    timeout.as_secs()
                )))
            }
        };
        // The completing handler schedules shutdown itself; wait for the
        // listener to wind down so the port is free for the next flow.
        let _ = self.task.await;
        result
    }
}

async fn handle_callback(
    State(shared): State<Arc<FlowShared>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = params.error {
        let detail = params.error_description.unwrap_or_default();
        let message = if detail.is_empty() {
            error
        } else {
            format!("{error}: {detail}")
        };
        if let Some(tx) = shared.take_waiter() {
            let _ = tx.send(Err(GatewayError::Unauthorized(format!(
                "authorization denied: {message}"
            ))));
            shared.schedule_shutdown();
        }
        return (StatusCode::BAD_REQUEST, format!("Authorization failed: {message}"))
            .into_response();
    }

    let Some(code) = params.code else {
        return (
            StatusCode::BAD_REQUEST,
            "missing 'code' and 'error' query parameters".to_string(),
        )
            .into_response();
    };

    let Some(tx) = shared.take_waiter() else {
        return (StatusCode::CONFLICT, GatewayError::AlreadyCompleted.to_string())
            .into_response();
    };

    let state = params.state.unwrap_or_default();
    match shared.store.exchange_code(&state, &code).await {
        Ok(()) => {
            info!("authorization code exchanged");
            let _ = tx.send(Ok(code));
            shared.schedule_shutdown();
            Html(SUCCESS_PAGE).into_response()
        }
        Err(e) => {
            warn!(error = %e, "code-for-token exchange failed");
            let _ = tx.send(Err(e.clone()));
            shared.schedule_shutdown();
            (StatusCode::BAD_REQUEST, format!("Token exchange failed: {e}")).into_response()
        }
    }
}
