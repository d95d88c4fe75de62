use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{self, GatewaySession};
use crate::config::{BackendConfig, BackendSpec, RuntimeOptions};
use crate::credentials::CredentialStore;
use crate::errors::GatewayError;

pub type SessionResult = Result<Arc<GatewaySession>, GatewayError>;

/// A compute-once promise for a backend session: whichever caller polls
/// first drives construction, every caller observes the same result, and
/// the first error is cached for good; a broken backend is not re-spawned
/// on every call.
type LazySession = Shared<BoxFuture<'static, SessionResult>>;

/// Seam between the pool and session construction, so pool semantics are
/// testable without a container runtime or network.
pub trait SessionBuilder: Send + Sync + 'static {
    fn establish(
        &self,
        spec: BackendSpec,
        config: BackendConfig,
        read_only: bool,
    ) -> BoxFuture<'static, SessionResult>;
}

/// The production builder: containers and remote transports per the spec.
pub struct RuntimeSessionBuilder {
    options: RuntimeOptions,
    store: CredentialStore,
}

impl RuntimeSessionBuilder {
    pub fn new(options: RuntimeOptions, store: CredentialStore) -> Self {
        Self { options, store }
    }
}

impl SessionBuilder for RuntimeSessionBuilder {
    fn establish(
        &self,
        spec: BackendSpec,
        config: BackendConfig,
        read_only: bool,
    ) -> BoxFuture<'static, SessionResult> {
        let options = self.options.clone();
        let store = self.store.clone();
        async move { backend::establish(&spec, &config, &options, &store, read_only).await }.boxed()
    }
}

/// One pool record: the opaque identity token, the backend name, and the
/// one-shot lazy session.
struct SessionSlot {
    id: u64,
    name: String,
    lazy: LazySession,
}

/// What `acquire` hands out: the session plus the opaque token `release`
/// uses to decide between retain and teardown. Callers never compare
/// session pointers.
pub struct SessionHandle {
    slot: Arc<SessionSlot>,
    session: Arc<GatewaySession>,
}

impl SessionHandle {
    pub fn session(&self) -> &Arc<GatewaySession> {
        &self.session
    }
}

impl Deref for SessionHandle {
    type Target = GatewaySession;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

/// Lifecycle manager for backend sessions.
///
/// Stateful backends (and everything, under the operator's force-retain
/// option) get a retained session shared by all callers until the pool
/// closes. Everything else is constructed per acquisition and closed on
/// release, so stateless containers do not leak.
pub struct ClientPool {
    builder: Arc<dyn SessionBuilder>,
    force_retain: bool,
    retained: RwLock<HashMap<String, Arc<SessionSlot>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ClientPool {
    pub fn new(options: RuntimeOptions, store: CredentialStore) -> Arc<Self> {
        let force_retain = options.force_retain;
        Self::with_builder(
            Arc::new(RuntimeSessionBuilder::new(options, store)),
            force_retain,
        )
    }

    pub fn with_builder(builder: Arc<dyn SessionBuilder>, force_retain: bool) -> Arc<Self> {
        Arc::new(Self {
            builder,
            force_retain,
            retained: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Acquire a session for a backend. The retained-set lookup and
    /// insertion happen in one writer critical section, so two concurrent
    /// acquires for the same name share one slot; construction itself runs
    /// outside the lock.
    pub async fn acquire(
        &self,
        ctx: &CancellationToken,
        spec: &BackendSpec,
        config: &BackendConfig,
        read_only: bool,
    ) -> Result<SessionHandle, GatewayError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::Config("client pool is closed".to_string()));
        }

        let name = spec.name().to_string();
        let slot = {
            let mut retained = self.retained.write().await;
            match retained.get(&name) {
                Some(slot) => Arc::clone(slot),
                None => {
                    let slot = Arc::new(SessionSlot {
                        id: self.next_id.fetch_add(1, Ordering::Relaxed),
                        name: name.clone(),
                        lazy: self
                            .builder
                            .establish(spec.clone(), config.clone(), read_only)
                            .shared(),
                    });
                    if spec.stateful() || self.force_retain {
                        debug!(backend = %name, "retaining session");
                        retained.insert(name.clone(), Arc::clone(&slot));
                    }
                    slot
                }
            }
        };

        let session = tokio::select! {
            result = slot.lazy.clone() => result?,
            _ = ctx.cancelled() => {
                // Construction keeps its progress in the shared future; a
                // later acquire resumes it rather than spawning again.
                return Err(GatewayError::Timeout(format!(
                    "acquire of backend '{name}' cancelled"
                )));
            }
        };

        Ok(SessionHandle { slot, session })
    }

    /// Return a session. Retained sessions are kept; everything else is
    /// closed. Close errors are logged and swallowed; release never fails
    /// observably.
    pub async fn release(&self, handle: SessionHandle) {
        let keep = {
            let retained = self.retained.read().await;
            retained
                .get(&handle.slot.name)
                .is_some_and(|slot| slot.id == handle.slot.id)
        };

        if keep {
            debug!(backend = %handle.slot.name, "released retained session");
            return;
        }

        debug!(backend = %handle.slot.name, "closing per-call session");
        handle.session.close().await;
    }

    /// Close the pool: atomically take the retained set and close every
    /// session that finished constructing. Final; the pool must not be
    /// acquired from afterwards.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);

        let slots: Vec<Arc<SessionSlot>> = {
            let mut retained = self.retained.write().await;
            std::mem::take(&mut *retained).into_values().collect()
        };

        for slot in slots {
            match slot.lazy.peek() {
                Some(Ok(session)) => session.close().await,
                Some(Err(e)) => {
                    warn!(backend = %slot.name, error = %e, "skipping failed session on close")
                }
                None => debug!(backend = %slot.name, "session never constructed"),
            }
        }

        info!("client pool closed");
    }
}
