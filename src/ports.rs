//! Deterministic port allocation over a topology
//!
//! Ports are handed out from `base_port + 1` upward, hosts then paths in
//! document order. The first single-replica route of a host does not bind a
//! listener of its own: it marks the host as shared and only consumes
//! increments, one for itself plus one per replica path that the topology
//! does not list explicitly. Every later proxy target is shifted down by the
//! number of shared hosts seen so far (see [`single_replica_offset`]).

use crate::error::{Error, Result};
use crate::topology::{RouteDescriptor, ServerTopology};
use serde::Serialize;
use tracing::debug;

/// Port assignment for a single route
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocatedRoute {
    pub host: String,
    pub path: String,
    pub route: RouteDescriptor,
    /// Allocated port before the single-replica offset is applied
    pub port: u16,
    /// Port of the peer sibling, the increment right after `port`
    pub peer_port: Option<u16>,
    /// Shared hosts seen when this route was allocated
    pub shared_hosts_before: usize,
    /// Route is served by its host's shared single-replica instance
    pub shared: bool,
}

impl AllocatedRoute {
    /// Port the backend binds and the proxy targets
    pub fn target_port(&self) -> Result<u16> {
        apply_offset(self.port, self.shared_hosts_before)
    }

    pub fn peer_target_port(&self) -> Result<Option<u16>> {
        self.peer_port
            .map(|port| apply_offset(port, self.shared_hosts_before))
            .transpose()
    }

    pub fn key(&self) -> String {
        format!("{}{}", self.host, self.path)
    }
}

/// Number of ports a target is shifted down by once `shared_hosts` hosts
/// have been marked single-replica-shared.
///
/// Each shared host consumed an increment without binding a listener. The
/// offset is the plain count, which reproduces the persisted tables of
/// existing deployments; its meaning for several shared hosts interleaved
/// with regular ones is order dependent.
pub fn single_replica_offset(shared_hosts: usize) -> usize {
    shared_hosts
}

fn apply_offset(port: u16, shared_hosts: usize) -> Result<u16> {
    let offset = single_replica_offset(shared_hosts);
    (port as usize)
        .checked_sub(offset)
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| {
            Error::Allocation(format!(
                "port {} cannot be shifted by single-replica offset {}",
                port, offset
            ))
        })
}

/// Topology with every route's port decided
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocatedTopology {
    pub base_port: u16,
    pub routes: Vec<AllocatedRoute>,
    pub shared_hosts: Vec<String>,
}

impl AllocatedTopology {
    /// Routes that bind a listener of their own
    pub fn bound_routes(&self) -> impl Iterator<Item = &AllocatedRoute> {
        self.routes.iter().filter(|r| !r.shared)
    }

    pub fn get(&self, host: &str, path: &str) -> Option<&AllocatedRoute> {
        self.routes.iter().find(|r| r.host == host && r.path == path)
    }

    /// The topology with `port` stamped on every route
    pub fn to_topology(&self) -> ServerTopology {
        let mut topology = ServerTopology::new();
        for allocated in &self.routes {
            let mut route = allocated.route.clone();
            route.port = Some(allocated.port);
            topology.insert(&allocated.host, &allocated.path, route);
        }
        topology
    }
}

/// Assigns ports to routes starting right above a base port
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    base_port: u16,
}

impl PortAllocator {
    pub fn new(base_port: u16) -> Self {
        Self { base_port }
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Allocate ports for every route. Pure: equal inputs give equal output.
    pub fn allocate(&self, topology: &ServerTopology) -> Result<AllocatedTopology> {
        let mut cursor = PortCursor::new(self.base_port);
        let mut shared_hosts: Vec<String> = Vec::new();
        let mut routes = Vec::with_capacity(topology.route_count());

        for (host, host_routes) in topology.hosts() {
            for (path, route) in host_routes {
                if route.single_replica && !shared_hosts.iter().any(|h| h == host) {
                    shared_hosts.push(host.to_string());
                    let missing = route
                        .replicas
                        .iter()
                        .filter(|replica| !host_routes.contains_key(replica.as_str()))
                        .count();
                    let port = cursor.take(1 + missing)?;
                    debug!(host, path, port, reserved = 1 + missing, "Host marked single-replica-shared");
                    routes.push(AllocatedRoute {
                        host: host.to_string(),
                        path: path.clone(),
                        route: route.clone(),
                        port,
                        peer_port: None,
                        shared_hosts_before: shared_hosts.len(),
                        shared: true,
                    });
                    continue;
                }

                let port = cursor.take(1)?;
                let peer_port = if route.peer {
                    Some(cursor.take(1)?)
                } else {
                    None
                };

                routes.push(AllocatedRoute {
                    host: host.to_string(),
                    path: path.clone(),
                    route: route.clone(),
                    port,
                    peer_port,
                    shared_hosts_before: shared_hosts.len(),
                    shared: false,
                });
            }
        }

        Ok(AllocatedTopology {
            base_port: self.base_port,
            routes,
            shared_hosts,
        })
    }
}

struct PortCursor {
    next: u32,
}

impl PortCursor {
    fn new(base_port: u16) -> Self {
        Self {
            next: base_port as u32 + 1,
        }
    }

    /// Return the current port and advance by `count`
    fn take(&mut self, count: usize) -> Result<u16> {
        let port = u16::try_from(self.next)
            .map_err(|_| Error::Allocation(format!("port {} is out of range", self.next)))?;
        self.next += count as u32;
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expand::{expand_routes, ExpansionMode};
    use crate::topology::RouteDescriptor;

    fn ports(allocated: &AllocatedTopology) -> Vec<(String, u16)> {
        allocated.routes.iter().map(|r| (r.key(), r.port)).collect()
    }

    #[test]
    fn test_single_route_starts_above_base() {
        let mut topology = ServerTopology::new();
        topology.insert("a.test", "/", RouteDescriptor::node(&[80]));

        let allocated = PortAllocator::new(4000).allocate(&topology).unwrap();
        let route = allocated.get("a.test", "/").unwrap();
        assert_eq!(route.port, 4001);
        assert_eq!(route.target_port().unwrap(), 4001);
        assert_eq!(allocated.to_topology().get("a.test", "/").unwrap().port, Some(4001));
    }

    #[test]
    fn test_peer_takes_next_port() {
        let mut topology = ServerTopology::new();
        topology.insert("a.test", "/", RouteDescriptor::node(&[80]).with_peer());
        topology.insert("b.test", "/", RouteDescriptor::node(&[80]));

        let allocated = PortAllocator::new(4000).allocate(&topology).unwrap();
        let a = allocated.get("a.test", "/").unwrap();
        assert_eq!(a.peer_port, Some(a.port + 1));
        assert_eq!(allocated.get("b.test", "/").unwrap().port, 4003);
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let topology = ServerTopology::from_json(
            r#"{
                "a.test": {"/": {"runtime": "nodejs", "proxy": [80], "peer": true},
                           "/api": {"runtime": "nodejs", "proxy": [80]}},
                "b.test": {"/": {"runtime": "nodejs", "proxy": [443],
                                 "singleReplica": true, "replicas": ["/r1"]}},
                "c.test": {"/": {"runtime": "lampp", "proxy": [80]}}
            }"#,
        )
        .unwrap();

        let allocator = PortAllocator::new(3000);
        let first = allocator.allocate(&topology).unwrap();
        let second = allocator.allocate(&topology).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_ports_unique_for_unshared_routes() {
        let mut topology = ServerTopology::new();
        for host in ["a.test", "b.test", "c.test"] {
            topology.insert(host, "/", RouteDescriptor::node(&[80]).with_peer());
            topology.insert(host, "/api", RouteDescriptor::node(&[80]));
        }
        topology.insert(
            "d.test",
            "/",
            RouteDescriptor::node(&[80]).with_replicas(&["/r1"], true),
        );
        topology.insert("e.test", "/", RouteDescriptor::node(&[80]));

        let allocated = PortAllocator::new(8000).allocate(&topology).unwrap();
        let mut seen = std::collections::HashSet::new();
        for route in allocated.bound_routes() {
            assert!(seen.insert(route.port), "duplicate port {}", route.port);
            if let Some(peer) = route.peer_port {
                assert!(seen.insert(peer), "duplicate peer port {}", peer);
            }
        }
    }

    #[test]
    fn test_shared_host_offsets_later_targets() {
        let proxy = expand_routes(
            &ServerTopology::from_json(
                r#"{
                    "s.test": {"/": {"runtime": "nodejs", "proxy": [80],
                                     "singleReplica": true, "replicas": ["/r1", "/r2"]}},
                    "x.test": {"/": {"runtime": "nodejs", "proxy": [80]}}
                }"#,
            )
            .unwrap(),
            ExpansionMode::Proxy,
        );

        let allocated = PortAllocator::new(4000).allocate(&proxy).unwrap();
        assert_eq!(
            ports(&allocated),
            vec![
                ("s.test/".to_string(), 4001),
                ("s.test/r1".to_string(), 4002),
                ("s.test/r2".to_string(), 4003),
                ("x.test/".to_string(), 4004),
            ]
        );
        assert!(allocated.get("s.test", "/").unwrap().shared);
        assert_eq!(allocated.get("s.test", "/r1").unwrap().target_port().unwrap(), 4001);
        assert_eq!(allocated.get("x.test", "/").unwrap().target_port().unwrap(), 4003);
        assert_eq!(allocated.shared_hosts, vec!["s.test"]);
    }

    #[test]
    fn test_collapsed_replicas_keep_spacing() {
        let collapsed = ServerTopology::from_json(
            r#"{
                "s.test": {"/": {"runtime": "nodejs", "proxy": [80],
                                 "singleReplica": true, "replicas": ["/r1", "/r2"]}},
                "x.test": {"/": {"runtime": "nodejs", "proxy": [80]}}
            }"#,
        )
        .unwrap();
        let proxy = expand_routes(&collapsed, ExpansionMode::Proxy);

        let allocator = PortAllocator::new(4000);
        let runtime_side = allocator.allocate(&collapsed).unwrap();
        let proxy_side = allocator.allocate(&proxy).unwrap();

        assert_eq!(
            runtime_side.get("x.test", "/").unwrap().target_port().unwrap(),
            proxy_side.get("x.test", "/").unwrap().target_port().unwrap()
        );
    }

    #[test]
    fn test_offset_function() {
        assert_eq!(single_replica_offset(0), 0);
        assert_eq!(single_replica_offset(2), 2);
    }

    #[test]
    fn test_port_range_exhausted() {
        let mut topology = ServerTopology::new();
        topology.insert("a.test", "/", RouteDescriptor::node(&[80]));
        topology.insert("b.test", "/", RouteDescriptor::node(&[80]));

        let err = PortAllocator::new(u16::MAX - 1).allocate(&topology).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::AllocationError);
    }
}
