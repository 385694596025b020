//! Proxy routing table: inbound listener port -> `{host}{path}` -> backend target
//!
//! The table is a pure function of an [`AllocatedTopology`] and is persisted
//! as JSON so an external reverse proxy process can reload it.

use crate::error::{Error, Result};
use crate::ports::{AllocatedRoute, AllocatedTopology};
use crate::topology::peer_path;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// Backend a proxied `{host}{path}` resolves to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyTarget {
    /// Backend URL, `http://localhost:{port}`
    pub target: String,
    /// Every listener port the route is reachable through
    pub proxy: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    pub host: String,
    pub path: String,
}

/// Entries of a single listener port, in insertion order
pub type ListenerRoutes = IndexMap<String, ProxyTarget>;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyRoutingTable {
    listeners: BTreeMap<u16, ListenerRoutes>,
}

impl ProxyRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry; a repeated key replaces the earlier target in place
    pub fn insert(&mut self, listener: u16, key: String, target: ProxyTarget) -> Option<ProxyTarget> {
        self.listeners.entry(listener).or_default().insert(key, target)
    }

    pub fn get(&self, listener: u16, key: &str) -> Option<&ProxyTarget> {
        self.listeners.get(&listener).and_then(|routes| routes.get(key))
    }

    pub fn listener(&self, port: u16) -> Option<&ListenerRoutes> {
        self.listeners.get(&port)
    }

    pub fn listener_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.listeners.keys().copied()
    }

    /// Every entry as (listener, key, target)
    pub fn entries(&self) -> impl Iterator<Item = (u16, &str, &ProxyTarget)> {
        self.listeners.iter().flat_map(|(port, routes)| {
            routes
                .iter()
                .map(move |(key, target)| (*port, key.as_str(), target))
        })
    }

    pub fn len(&self) -> usize {
        self.listeners.values().map(|r| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

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

    /// Write the table atomically next to its final location
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_atomic(path.as_ref(), self.to_json_pretty().as_bytes())
    }

    /// Replace a persisted table with an empty one
    pub fn reset<P: AsRef<Path>>(path: P) -> Result<()> {
        write_atomic(path.as_ref(), b"{}")
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(content)?;
    file.flush()?;
    file.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Builds the routing table from allocated routes
#[derive(Debug, Default)]
pub struct ProxyRouterBuilder {
    collisions: usize,
}

impl ProxyRouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys overwritten by the last [`build`](Self::build)
    pub fn collisions(&self) -> usize {
        self.collisions
    }

    pub fn build(&mut self, allocated: &AllocatedTopology) -> Result<ProxyRoutingTable> {
        self.collisions = 0;
        let mut table = ProxyRoutingTable::new();

        for route in allocated.bound_routes() {
            if route.route.proxy_listener_ports.is_empty() {
                continue;
            }

            let target = ProxyTarget {
                target: localhost(route.target_port()?),
                proxy: route.route.proxy_listener_ports.clone(),
                redirect: route.route.redirect.clone(),
                host: route.host.clone(),
                path: route.path.clone(),
            };
            self.insert_all(&mut table, route, &route.key(), target);

            if let Some(peer_port) = route.peer_target_port()? {
                let path = peer_path(&route.path);
                let target = ProxyTarget {
                    target: localhost(peer_port),
                    proxy: route.route.proxy_listener_ports.clone(),
                    redirect: None,
                    host: route.host.clone(),
                    path: path.clone(),
                };
                let key = format!("{}{}", route.host, path);
                self.insert_all(&mut table, route, &key, target);
            }
        }

        info!(
            listeners = table.listeners.len(),
            entries = table.len(),
            collisions = self.collisions,
            "Proxy routing table built"
        );
        Ok(table)
    }

    fn insert_all(
        &mut self,
        table: &mut ProxyRoutingTable,
        route: &AllocatedRoute,
        key: &str,
        target: ProxyTarget,
    ) {
        // A port listed twice on one route is one listener, not a collision
        let listeners: IndexSet<u16> = route.route.proxy_listener_ports.iter().copied().collect();
        for listener in listeners {
            if let Some(previous) = table.insert(listener, key.to_string(), target.clone()) {
                self.collisions += 1;
                warn!(
                    listener,
                    key,
                    previous = %previous.target,
                    current = %target.target,
                    "Routing key declared twice, last declaration wins"
                );
            }
        }
    }
}

fn localhost(port: u16) -> String {
    format!("http://localhost:{}", port)
}

/// Convenience wrapper around [`ProxyRouterBuilder::build`]
pub fn build_routing_table(allocated: &AllocatedTopology) -> Result<ProxyRoutingTable> {
    ProxyRouterBuilder::new().build(allocated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortAllocator;
    use crate::topology::{RouteDescriptor, ServerTopology};
    use serde_json::json;

    fn table_for(topology: &ServerTopology, base_port: u16) -> ProxyRoutingTable {
        let allocated = PortAllocator::new(base_port).allocate(topology).unwrap();
        build_routing_table(&allocated).unwrap()
    }

    #[test]
    fn test_single_route_table() {
        let topology =
            ServerTopology::from_json(r#"{"a.test": {"/": {"runtime": "node-application", "proxy": [80]}}}"#)
                .unwrap();
        let table = table_for(&topology, 4000);

        let value: serde_json::Value = serde_json::from_str(&table.to_json_pretty()).unwrap();
        assert_eq!(
            value,
            json!({"80": {"a.test/": {
                "target": "http://localhost:4001",
                "proxy": [80],
                "host": "a.test",
                "path": "/"
            }}})
        );
    }

    #[test]
    fn test_peer_entry_under_same_listener() {
        let topology = ServerTopology::from_json(
            r#"{"a.test": {"/": {"runtime": "node-application", "proxy": [80], "peer": true}}}"#,
        )
        .unwrap();
        let table = table_for(&topology, 4000);

        let peer = table.get(80, "a.test/peer").unwrap();
        assert_eq!(peer.target, "http://localhost:4002");
        assert_eq!(peer.path, "/peer");
        assert_eq!(table.get(80, "a.test/").unwrap().target, "http://localhost:4001");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_nested_peer_path() {
        let mut topology = ServerTopology::new();
        topology.insert("a.test", "/game", RouteDescriptor::node(&[443]).with_peer());
        let table = table_for(&topology, 4000);
        assert!(table.get(443, "a.test/game/peer").is_some());
    }

    #[test]
    fn test_every_listener_port_gets_an_entry() {
        let mut topology = ServerTopology::new();
        topology.insert(
            "a.test",
            "/",
            RouteDescriptor::node(&[80, 443]).with_redirect("https://b.test"),
        );
        topology.insert("internal.test", "/", RouteDescriptor::node(&[]));

        let table = table_for(&topology, 4000);
        assert_eq!(table.listener_ports().collect::<Vec<_>>(), vec![80, 443]);
        for port in [80, 443] {
            let target = table.get(port, "a.test/").unwrap();
            assert_eq!(target.proxy, vec![80, 443]);
            assert_eq!(target.redirect.as_deref(), Some("https://b.test"));
        }
        assert!(table.entries().all(|(_, key, _)| key != "internal.test/"));
    }

    #[test]
    fn test_shared_host_is_not_routed_and_shifts_targets() {
        let topology = crate::expand::expand_routes(
            &ServerTopology::from_json(
                r#"{
                    "s.test": {"/": {"runtime": "nodejs", "proxy": [80],
                                     "singleReplica": true, "replicas": ["/r1"]}},
                    "x.test": {"/": {"runtime": "nodejs", "proxy": [80]}}
                }"#,
            )
            .unwrap(),
            crate::expand::ExpansionMode::Proxy,
        );
        let table = table_for(&topology, 4000);

        assert!(table.get(80, "s.test/").is_none());
        assert_eq!(table.get(80, "s.test/r1").unwrap().target, "http://localhost:4001");
        assert_eq!(table.get(80, "x.test/").unwrap().target, "http://localhost:4002");
    }

    #[test]
    fn test_last_write_wins_on_collision() {
        let mut topology = ServerTopology::new();
        topology.insert("a.test", "/peer", RouteDescriptor::node(&[80]));
        topology.insert("a.test", "/", RouteDescriptor::node(&[80]).with_peer());

        let allocated = PortAllocator::new(4000).allocate(&topology).unwrap();
        let mut builder = ProxyRouterBuilder::new();
        let table = builder.build(&allocated).unwrap();

        assert_eq!(builder.collisions(), 1);
        let keys: Vec<_> = table.listener(80).unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["a.test/peer", "a.test/"]);
        assert_eq!(table.get(80, "a.test/peer").unwrap().target, "http://localhost:4003");
    }

    #[test]
    fn test_repeated_listener_port_is_not_a_collision() {
        let mut topology = ServerTopology::new();
        topology.insert("a.test", "/", RouteDescriptor::node(&[80, 80]));

        let allocated = PortAllocator::new(4000).allocate(&topology).unwrap();
        let mut builder = ProxyRouterBuilder::new();
        let table = builder.build(&allocated).unwrap();

        assert_eq!(builder.collisions(), 0);
        assert_eq!(table.listener(80).unwrap().len(), 1);
        assert_eq!(table.get(80, "a.test/").unwrap().proxy, vec![80, 80]);
    }

    #[test]
    fn test_save_load_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tmp").join("runtime-router.json");

        let mut topology = ServerTopology::new();
        topology.insert("a.test", "/", RouteDescriptor::node(&[80]));
        let table = table_for(&topology, 4000);

        table.save(&path).unwrap();
        assert_eq!(ProxyRoutingTable::load(&path).unwrap(), table);

        ProxyRoutingTable::reset(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
        assert!(ProxyRoutingTable::load(&path).unwrap().is_empty());
    }
}
