//! Declarative hosting topology: hosts mapped to paths mapped to route descriptors
//!
//! Key order at both levels is the document order. Port allocation walks the
//! topology in that order, so every transform here preserves it.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Family of backend a runtime name selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    /// In-process application server (`nodejs`)
    NodeApplication,
    /// Legacy Apache virtual host runtime (`lampp`)
    LegacyApacheA,
    /// Legacy Apache virtual host runtime (`xampp`)
    LegacyApacheB,
    /// Any runtime this crate does not launch
    Other,
}

impl RuntimeKind {
    fn from_name(name: &str) -> Self {
        match name {
            "nodejs" | "node-application" => RuntimeKind::NodeApplication,
            "lampp" | "legacy-apache-a" => RuntimeKind::LegacyApacheA,
            "xampp" | "legacy-apache-b" => RuntimeKind::LegacyApacheB,
            _ => RuntimeKind::Other,
        }
    }
}

/// Backend runtime serving a route.
///
/// Keeps the name exactly as the document spelled it, so writing a
/// topology back out never rewrites `node-application` to `nodejs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Runtime {
    kind: RuntimeKind,
    name: String,
}

impl Runtime {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: RuntimeKind::from_name(&name),
            name,
        }
    }

    pub fn node() -> Self {
        Self::new("nodejs")
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    /// Name as written in the topology document
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Short name handed to launched backends (`nodejs`, `lampp`, `xampp`)
    pub fn canonical_name(&self) -> &str {
        match self.kind {
            RuntimeKind::NodeApplication => "nodejs",
            RuntimeKind::LegacyApacheA => "lampp",
            RuntimeKind::LegacyApacheB => "xampp",
            RuntimeKind::Other => &self.name,
        }
    }

    /// Whether the runtime is served through an Apache virtual host
    pub fn is_legacy(&self) -> bool {
        matches!(self.kind, RuntimeKind::LegacyApacheA | RuntimeKind::LegacyApacheB)
    }
}

impl From<String> for Runtime {
    fn from(value: String) -> Self {
        Runtime::new(value)
    }
}

impl From<Runtime> for String {
    fn from(value: Runtime) -> Self {
        value.name
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of one (host, path) route.
///
/// Field names match the topology document byte for byte. Backend wiring
/// references (`apis`, `client`, `db`, `ws`, `mailer`) are opaque here and
/// fields this crate does not know about are carried through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<Runtime>,

    /// Assigned port, overwritten by the allocator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Inbound proxy listener ports this route is reachable through
    #[serde(default, rename = "proxy")]
    pub proxy_listener_ports: Vec<u16>,

    /// Allowed CORS origins
    #[serde(default)]
    pub origins: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apis: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailer: Option<Value>,

    /// Colocated peer signaling sidecar at `{path}/peer`
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub peer: bool,

    /// Absolute URL all traffic is redirected to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,

    /// Replica path suffixes such as `/r1`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicas: Vec<String>,

    /// Replicas share one physical instance instead of one each
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub single_replica: bool,

    /// Document root override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl RouteDescriptor {
    /// Create a node application route reachable through the given proxy ports
    pub fn node(proxy: &[u16]) -> Self {
        Self {
            runtime: Some(Runtime::node()),
            proxy_listener_ports: proxy.to_vec(),
            ..Self::default()
        }
    }

    /// Set replica suffixes (builder pattern)
    pub fn with_replicas(mut self, replicas: &[&str], single_replica: bool) -> Self {
        self.replicas = replicas.iter().map(|r| r.to_string()).collect();
        self.single_replica = single_replica;
        self
    }

    /// Enable the peer sidecar (builder pattern)
    pub fn with_peer(mut self) -> Self {
        self.peer = true;
        self
    }

    /// Set the redirect target (builder pattern)
    pub fn with_redirect(mut self, url: &str) -> Self {
        self.redirect = Some(url.to_string());
        self
    }

    /// Whether this route fans replicas out over one shared instance
    pub fn shares_single_replica(&self) -> bool {
        self.single_replica && !self.replicas.is_empty()
    }
}

/// Path of the peer sibling of a route
pub fn peer_path(path: &str) -> String {
    if path == "/" {
        "/peer".to_string()
    } else {
        format!("{}/peer", path)
    }
}

pub type HostRoutes = IndexMap<String, RouteDescriptor>;

/// Mapping host -> path -> route, in document order
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerTopology {
    hosts: IndexMap<String, HostRoutes>,
}

impl ServerTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a topology document (`conf.server.json`)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| Error::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::config(format!("invalid topology document: {}", e)))
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Insert or replace a route, keeping the position of an existing key
    pub fn insert(&mut self, host: &str, path: &str, route: RouteDescriptor) {
        self.hosts
            .entry(host.to_string())
            .or_default()
            .insert(path.to_string(), route);
    }

    pub fn get(&self, host: &str, path: &str) -> Option<&RouteDescriptor> {
        self.hosts.get(host).and_then(|routes| routes.get(path))
    }

    pub fn host(&self, host: &str) -> Option<&HostRoutes> {
        self.hosts.get(host)
    }

    pub fn hosts(&self) -> impl Iterator<Item = (&str, &HostRoutes)> {
        self.hosts.iter().map(|(h, r)| (h.as_str(), r))
    }

    /// Every route as (host, path, route), hosts then paths in document order
    pub fn routes(&self) -> impl Iterator<Item = (&str, &str, &RouteDescriptor)> {
        self.hosts.iter().flat_map(|(host, routes)| {
            routes
                .iter()
                .map(move |(path, route)| (host.as_str(), path.as_str(), route))
        })
    }

    pub fn route_count(&self) -> usize {
        self.hosts.values().map(|r| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Merge another deploy's topology into this one, host by host.
    ///
    /// When the incoming host declares a root path `/` its entries override
    /// the existing ones; otherwise existing entries win. In both cases the
    /// key order is existing-first for override and incoming-first otherwise.
    pub fn merge(&mut self, incoming: &ServerTopology) {
        for (host, incoming_routes) in &incoming.hosts {
            let existing = self.hosts.get(host).cloned().unwrap_or_default();
            let merged = if incoming_routes.contains_key("/") {
                overlay(&existing, incoming_routes)
            } else {
                overlay(incoming_routes, &existing)
            };
            self.hosts.insert(host.clone(), merged);
        }
    }
}

/// `{...base, ...top}`: base key order, top values win, new top keys appended
fn overlay(base: &HostRoutes, top: &HostRoutes) -> HostRoutes {
    let mut merged = base.clone();
    for (path, route) in top {
        merged.insert(path.clone(), route.clone());
    }
    merged
}
