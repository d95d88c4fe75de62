use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::callback::DEFAULT_CALLBACK_PORT;

/// Environment variables the gateway consumes. This set is closed; nothing
/// else in the environment affects core semantics.
pub const ENV_IN_DIND: &str = "FEDGATE_IN_DIND";
pub const ENV_DEBUG: &str = "FEDGATE_DEBUG";
pub const ENV_VERBOSE: &str = "FEDGATE_VERBOSE";
pub const ENV_CALLBACK_PORT: &str = "FEDGATE_CALLBACK_PORT";

/// Declarative definition of a backend, loaded from the catalog.
///
/// The kind tag is explicit: image backends carry no URL and remote
/// backends carry no image reference, enforced by the variant shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendSpec {
    Image(ImageSpec),
    Remote(RemoteSpec),
}

impl BackendSpec {
    pub fn name(&self) -> &str {
        match self {
            BackendSpec::Image(s) => &s.name,
            BackendSpec::Remote(s) => &s.name,
        }
    }

    /// Stateful backends must observe a continuous session across calls.
    /// Remote backends are treated as stateful: the session is a network
    /// connection, not a container to reap.
    pub fn stateful(&self) -> bool {
        match self {
            BackendSpec::Image(s) => s.stateful,
            BackendSpec::Remote(_) => true,
        }
    }

    /// The image reference or URL, for error text.
    pub fn descriptor(&self) -> &str {
        match self {
            BackendSpec::Image(s) => &s.image,
            BackendSpec::Remote(s) => &s.url,
        }
    }

    fn set_name(&mut self, name: &str) {
        match self {
            BackendSpec::Image(s) => s.name = name.to_string(),
            BackendSpec::Remote(s) => s.name = name.to_string(),
        }
    }
}

/// A containerized backend launched on demand from an image.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImageSpec {
    /// Stable identifier. Filled from the catalog key on load.
    #[serde(default)]
    pub name: String,

    /// Image reference to run.
    pub image: String,

    /// Command template strings appended after the image.
    #[serde(default)]
    pub command: Vec<String>,

    /// Volume template strings; empty evaluations are dropped.
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Ordered environment entries (name, value template).
    #[serde(default)]
    pub environment: Vec<EnvSpec>,

    /// Secrets surfaced to the child as environment variables.
    #[serde(default)]
    pub secrets: Vec<SecretSpec>,

    /// Run with --network none.
    #[serde(default)]
    pub disable_network: bool,

    /// DNS names or CIDRs reachable through the egress-firewall sidecar.
    /// Meaningful only when the network is disabled.
    #[serde(default)]
    pub allow_hosts: Vec<String>,

    /// Retain the session (and container) across calls.
    #[serde(default)]
    pub stateful: bool,
}

/// A remote backend reachable over the network.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteSpec {
    #[serde(default)]
    pub name: String,

    pub url: String,

    #[serde(default)]
    pub transport: RemoteTransport,

    /// Header name to value-template map.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Optional OAuth provider hints.
    #[serde(default)]
    pub oauth: Vec<String>,
}

/// Wire subtype for a remote backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteTransport {
    Sse,
    #[default]
    HttpStream,
}

/// One environment entry of an image backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvSpec {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// One secret mapping of an image backend: logical name to env var.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecretSpec {
    /// Logical secret name, resolved through the backend config.
    pub name: String,
    /// Environment variable the secret is surfaced as.
    pub env: String,
}

/// Runtime binding shared by all backends: a nested config tree used to
/// resolve templates, and resolved secret values keyed by logical name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "empty_object")]
    pub config: Value,

    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl BackendConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: BackendConfig = serde_yaml_ng::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn secret(&self, logical_name: &str) -> Option<&str> {
        self.secrets.get(logical_name).map(String::as_str)
    }
}

/// Read-only catalog mapping backend names to their specs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub backends: BTreeMap<String, BackendSpec>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading catalog file {}", path.display()))?;
        let mut catalog: Catalog = serde_yaml_ng::from_str(&contents)
            .with_context(|| format!("parsing catalog file {}", path.display()))?;
        for (name, spec) in catalog.backends.iter_mut() {
            spec.set_name(name);
        }
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<&BackendSpec> {
        self.backends.get(name)
    }
}

/// Operator-level options threaded explicitly through the core (never a
/// process global). The environment flags are captured once at startup so
/// downstream planning stays referentially transparent.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Widen subprocess stderr capture and log verbosity.
    pub verbose: bool,
    /// Keep containers after exit (omit --rm).
    pub static_containers: bool,
    /// Operator force-singleton: retain every session in the pool.
    pub force_retain: bool,
    /// Networks every launched container joins when networking is enabled.
    pub networks: Vec<String>,
    /// CPU limit for launched containers.
    pub cpus: u32,
    /// Memory limit for launched containers.
    pub memory: String,
    /// Running inside docker-in-docker; launched containers get --privileged.
    pub in_dind: bool,
    /// Loopback port of the authorization callback receiver.
    pub callback_port: u16,
    /// Container runtime binary.
    pub runtime_bin: String,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            static_containers: false,
            force_retain: false,
            networks: Vec::new(),
            cpus: 1,
            memory: "2Gb".to_string(),
            in_dind: false,
            callback_port: DEFAULT_CALLBACK_PORT,
            runtime_bin: "docker".to_string(),
        }
    }
}

impl RuntimeOptions {
    /// Capture the closed set of environment flags into explicit options.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        opts.in_dind = env_flag(ENV_IN_DIND);
        opts.verbose = env_flag(ENV_VERBOSE) || env_flag(ENV_DEBUG);
        if let Ok(port) = std::env::var(ENV_CALLBACK_PORT)
            && let Ok(port) = port.parse::<u16>()
        {
            opts.callback_port = port;
        }
        opts
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| !v.is_empty() && v != "0" && v != "false")
}
