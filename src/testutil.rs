//! Test utilities for fedgate: local HTTP fixtures and a controllable
//! session builder.
//!
//! Compiled only under `#[cfg(test)]`. The session builder implements the
//! pool's construction seam directly, so retention, identity, and one-shot
//! semantics are testable without a container runtime or network.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::backend::GatewaySession;
use crate::config::{BackendConfig, BackendSpec, ImageSpec};
use crate::errors::GatewayError;
use crate::pool::{SessionBuilder, SessionResult};

/// Serve an axum router on an ephemeral loopback port, detached for the
/// rest of the test.
pub async fn serve_router(router: axum::Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

/// An image spec for pool tests; only name and statefulness matter there.
pub fn image_spec(name: &str, stateful: bool) -> BackendSpec {
    BackendSpec::Image(ImageSpec {
        name: name.to_string(),
        image: format!("mcp/{name}"),
        stateful,
        ..Default::default()
    })
}

/// A [`SessionBuilder`] that hands out detached sessions, counting
/// constructions and optionally delaying or failing them.
pub struct StubBuilder {
    counter: Arc<AtomicUsize>,
    delay: Duration,
    fail: bool,
}

impl StubBuilder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counter: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            fail: false,
        })
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            counter: Arc::new(AtomicUsize::new(0)),
            delay,
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            counter: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            fail: true,
        })
    }

    /// How many constructions actually ran.
    pub fn constructions(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }
}

impl SessionBuilder for StubBuilder {
    fn establish(
        &self,
        spec: BackendSpec,
        _config: BackendConfig,
        _read_only: bool,
    ) -> BoxFuture<'static, SessionResult> {
        let delay = self.delay;
        let fail = self.fail;
        let counter = Arc::clone(&self.counter);
        async move {
            // Counted when construction actually runs, not when the lazy
            // session is created.
            counter.fetch_add(1, Ordering::SeqCst);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if fail {
                Err(GatewayError::Transport(format!(
                    "initializing {}: connection refused",
                    spec.descriptor()
                )))
            } else {
                Ok(GatewaySession::detached(spec.name()))
            }
        }
        .boxed()
    }
}
