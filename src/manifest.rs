//! Deploy groups and per-deploy configuration lookup

use crate::config::{PathConfig, TopologyConfig};
use crate::error::{Error, Result};
use crate::expand::expand_target;
use crate::topology::ServerTopology;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default deploy group when no `deploy-group:<id>` argument is given
pub const DEFAULT_DEPLOY_GROUP: &str = "dd";

const CONF_FILE: &str = "conf.server.json";

/// One unit of bring-up and health-check work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployTarget {
    pub deploy_id: String,
    /// Host of the shared single-replica route this target was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_host: Option<String>,
}

impl DeployTarget {
    pub fn new(deploy_id: impl Into<String>) -> Self {
        Self {
            deploy_id: deploy_id.into(),
            replica_host: None,
        }
    }

    pub fn is_replica(&self) -> bool {
        self.replica_host.is_some()
    }
}

impl std::fmt::Display for DeployTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.replica_host {
            Some(host) => write!(f, "{} ({})", self.deploy_id, host),
            None => f.write_str(&self.deploy_id),
        }
    }
}

/// Pick the deploy group out of `deploy-group:<id>` style arguments
pub fn deploy_group_id<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .find_map(|arg| arg.as_ref().strip_prefix("deploy-group:"))
        .filter(|id| !id.is_empty())
        .unwrap_or(DEFAULT_DEPLOY_GROUP)
        .to_string()
}

/// Ordered list of deploy ids read from `{deploy_dir}/{group}.json`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployGroup {
    pub id: String,
    pub deploy_ids: Vec<String>,
}

impl DeployGroup {
    pub fn load(deploy_dir: &Path, group_id: &str) -> Result<Self> {
        let path = deploy_dir.join(format!("{}.json", group_id));
        if !path.exists() {
            return Err(Error::config(format!(
                "deploy group '{}' not found at {}",
                group_id,
                path.display()
            )));
        }
        let content = std::fs::read_to_string(&path).map_err(|source| Error::Read {
            path: path.clone(),
            source,
        })?;
        let deploy_ids: Vec<String> =
            serde_json::from_str(&content).map_err(|source| Error::Parse { path, source })?;

        debug!(group = group_id, deploys = deploy_ids.len(), "Loaded deploy group");
        Ok(Self {
            id: group_id.to_string(),
            deploy_ids,
        })
    }

    /// Keep only `deploy_id` when given; an id outside the group is an error
    pub fn filter(mut self, deploy_id: Option<&str>) -> Result<Self> {
        if let Some(id) = deploy_id {
            if !self.deploy_ids.iter().any(|d| d == id) {
                return Err(Error::config(format!(
                    "deploy '{}' is not part of group '{}'",
                    id, self.id
                )));
            }
            self.deploy_ids.retain(|d| d == id);
        }
        Ok(self)
    }
}

/// Resolves where a deploy's topology document lives
#[derive(Debug, Clone)]
pub struct ConfResolver {
    conf_dir: PathBuf,
    replica_dir: PathBuf,
    dev_variant: Option<String>,
    development: bool,
}

impl ConfResolver {
    pub fn new(paths: &PathConfig, topology: &TopologyConfig) -> Self {
        Self {
            conf_dir: paths.conf_dir(),
            replica_dir: paths.replica_dir(),
            dev_variant: topology.dev_variant.clone(),
            development: topology.is_development(),
        }
    }

    /// Path of a deploy's topology document.
    ///
    /// The replica folder wins over the regular one. In development a
    /// `conf.server.dev.{variant}.json` or `conf.server.dev.json` next to
    /// the regular document is preferred when present.
    pub fn resolve(&self, deploy_id: &str) -> Result<PathBuf> {
        let replica = self.replica_dir.join(deploy_id).join(CONF_FILE);
        if replica.exists() {
            return Ok(replica);
        }

        let folder = self.conf_dir.join(deploy_id);
        if self.development {
            let mut candidates = Vec::new();
            if let Some(variant) = &self.dev_variant {
                candidates.push(folder.join(format!("conf.server.dev.{}.json", variant)));
            }
            candidates.push(folder.join("conf.server.dev.json"));
            if let Some(found) = candidates.into_iter().find(|p| p.exists()) {
                return Ok(found);
            }
        }

        let regular = folder.join(CONF_FILE);
        if regular.exists() {
            Ok(regular)
        } else {
            Err(Error::config(format!(
                "no topology document for deploy '{}' (looked in {} and {})",
                deploy_id,
                replica.display(),
                regular.display()
            )))
        }
    }

    pub fn load(&self, deploy_id: &str) -> Result<ServerTopology> {
        let path = self.resolve(deploy_id)?;
        debug!(deploy_id, path = %path.display(), "Loading topology");
        ServerTopology::load(path)
    }
}

/// Expand a deploy group into its ordered deploy targets
pub fn build_targets(group: &DeployGroup, resolver: &ConfResolver) -> Result<Vec<DeployTarget>> {
    let mut targets = Vec::new();
    for deploy_id in &group.deploy_ids {
        let topology = resolver.load(deploy_id)?;
        targets.extend(expand_target(deploy_id, &topology));
    }
    Ok(targets)
}

/// Merge every deploy's topology into the one the front proxy routes
pub fn merged_topology(group: &DeployGroup, resolver: &ConfResolver) -> Result<ServerTopology> {
    let mut merged = ServerTopology::new();
    for deploy_id in &group.deploy_ids {
        merged.merge(&resolver.load(deploy_id)?);
    }
    Ok(merged)
}
