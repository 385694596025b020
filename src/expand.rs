//! Replica expansion
//!
//! Replicas fan out at two levels. At the routing level a replica becomes a
//! sibling route that gets its own port. At the orchestration level a
//! single-replica route yields one extra deploy target per replica while the
//! routing level keeps a single shared instance.

use crate::manifest::DeployTarget;
use crate::topology::{RouteDescriptor, ServerTopology};

/// Which consumer the routing-level expansion is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpansionMode {
    /// A deploy's own runtime: single-replica routes stay collapsed
    #[default]
    Runtime,
    /// The front proxy: every replica needs a routing entry
    Proxy,
}

/// Expand replica groups into sibling routes.
///
/// A route with `replicas` is copied to each replica path when it is not
/// `singleReplica`, or unconditionally in proxy mode. Copies drop their own
/// `replicas` so they never expand again; running this on its own output
/// yields the same topology.
pub fn expand_routes(topology: &ServerTopology, mode: ExpansionMode) -> ServerTopology {
    let mut expanded = topology.clone();

    for (host, path, route) in topology.routes() {
        if route.replicas.is_empty() {
            continue;
        }
        if mode == ExpansionMode::Runtime && route.single_replica {
            continue;
        }
        for replica_path in &route.replicas {
            expanded.insert(host, replica_path, replica_copy(route));
        }
        tracing::debug!(
            host,
            path,
            replicas = route.replicas.len(),
            ?mode,
            "Expanded replica routes"
        );
    }

    expanded
}

fn replica_copy(route: &RouteDescriptor) -> RouteDescriptor {
    RouteDescriptor {
        replicas: Vec::new(),
        ..route.clone()
    }
}

/// Deploy id of a replica: `dd-app` + `/r1` -> `dd-app-r1`
pub fn replica_id(deploy_id: &str, replica: &str) -> String {
    let suffix = replica.strip_prefix('/').unwrap_or(replica);
    format!("{}-{}", deploy_id, suffix)
}

/// Synthetic deploy targets for every single-replica route of a deploy.
///
/// Paths are handled independently: only the paths that declare both
/// `replicas` and `singleReplica` contribute targets.
pub fn replica_targets(deploy_id: &str, topology: &ServerTopology) -> Vec<DeployTarget> {
    let runtime = expand_routes(topology, ExpansionMode::Runtime);
    runtime
        .routes()
        .filter(|(_, _, route)| route.shares_single_replica())
        .flat_map(|(host, _, route)| {
            route.replicas.iter().map(move |replica| DeployTarget {
                deploy_id: replica_id(deploy_id, replica),
                replica_host: Some(host.to_string()),
            })
        })
        .collect()
}

/// Base target followed by its replica targets
pub fn expand_target(deploy_id: &str, topology: &ServerTopology) -> Vec<DeployTarget> {
    let mut targets = vec![DeployTarget::new(deploy_id)];
    targets.extend(replica_targets(deploy_id, topology));
    targets
}
