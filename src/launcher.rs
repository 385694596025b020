//! Bring-up of the concrete backend behind each route
//!
//! [`launch_plan`] turns an allocated topology into one [`LaunchSpec`] per
//! listener to bind. Every spec binds the port the proxy targets, so the
//! runtime side and the routing table agree without sharing state.

use crate::controller::CommandTemplate;
use crate::error::{Error, Result};
use crate::ports::AllocatedTopology;
use crate::topology::{peer_path, Runtime, RuntimeKind};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// What kind of listener a spec brings up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchKind {
    AppServer,
    /// App server that also accepts websocket upgrades on the same port
    Websocket,
    LegacyVirtualHost,
    /// Peer signaling sidecar at `{path}/peer`
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub host: String,
    pub path: String,
    pub runtime: Runtime,
    pub port: u16,
    pub kind: LaunchKind,
    pub origins: Vec<String>,
    /// Redirect URL without its trailing slash
    pub redirect_target: Option<String>,
    pub directory: Option<String>,
}

impl LaunchSpec {
    pub fn key(&self) -> String {
        format!("{}{}", self.host, self.path)
    }
}

fn redirect_target(redirect: &str) -> String {
    redirect.strip_suffix('/').unwrap_or(redirect).to_string()
}

/// Launch specs for every route that binds a listener, in allocation order.
///
/// Routes folded into a shared single-replica instance and routes with a
/// runtime this crate cannot launch are skipped.
pub fn launch_plan(allocated: &AllocatedTopology, development: bool) -> Result<Vec<LaunchSpec>> {
    let mut specs = Vec::new();

    for route in allocated.bound_routes() {
        let runtime = match &route.route.runtime {
            Some(runtime) if runtime.kind() != RuntimeKind::Other => runtime.clone(),
            other => {
                warn!(
                    host = %route.host,
                    path = %route.path,
                    runtime = ?other,
                    "Skipping route with unsupported runtime"
                );
                continue;
            }
        };
        let port = route.target_port()?;

        let kind = if runtime.is_legacy() {
            LaunchKind::LegacyVirtualHost
        } else if route.route.ws.is_some() {
            LaunchKind::Websocket
        } else {
            LaunchKind::AppServer
        };

        let mut origins = route.route.origins.clone();
        if development && kind != LaunchKind::LegacyVirtualHost && route.route.apis.is_some() {
            origins.push(format!("http://localhost:{}", port as u32 + 2));
        }

        let spec = LaunchSpec {
            host: route.host.clone(),
            path: route.path.clone(),
            runtime,
            port,
            kind,
            origins,
            redirect_target: route.route.redirect.as_deref().map(redirect_target),
            directory: route.route.directory.clone(),
        };

        if let Some(peer_port) = route.peer_target_port()? {
            let peer = LaunchSpec {
                path: peer_path(&route.path),
                port: peer_port,
                kind: LaunchKind::Peer,
                redirect_target: None,
                ..spec.clone()
            };
            specs.push(spec);
            specs.push(peer);
        } else {
            specs.push(spec);
        }
    }

    Ok(specs)
}

/// Render the `Listen` + `<VirtualHost>` block serving a legacy route
pub fn render_virtual_host(spec: &LaunchSpec, root: &Path) -> String {
    let document_root = match &spec.directory {
        Some(dir) => dir.clone(),
        None => root.join("public").join(&spec.host).display().to_string(),
    };
    let error_prefix = if spec.path == "/" { "" } else { spec.path.as_str() };

    let mut out = String::new();
    out.push_str(&format!("Listen {}\n\n", spec.port));
    out.push_str(&format!("<VirtualHost *:{}>\n", spec.port));
    out.push_str(&format!("    DocumentRoot \"{}\"\n", document_root));
    out.push_str(&format!("    ServerName {}:{}\n\n", spec.host, spec.port));
    out.push_str(&format!("    <Directory \"{}\">\n", document_root));
    out.push_str("        Options Indexes FollowSymLinks MultiViews\n");
    out.push_str("        AllowOverride All\n");
    out.push_str("        Require all granted\n");
    out.push_str("    </Directory>\n\n");

    if let Some(target) = &spec.redirect_target {
        out.push_str("    RewriteEngine on\n");
        out.push_str("    RewriteCond %{REQUEST_URI} !^/.well-known/acme-challenge\n");
        out.push_str(&format!(
            "    RewriteRule ^(.*)$ {}%{{REQUEST_URI}} [R=302,L]\n\n",
            target
        ));
    }

    for (status, page) in [
        (400, "400"),
        (404, "400"),
        (500, "500"),
        (502, "500"),
        (503, "500"),
        (504, "500"),
    ] {
        out.push_str(&format!(
            "    ErrorDocument {} {}/{}.html\n",
            status, error_prefix, page
        ));
    }
    out.push_str("</VirtualHost>\n");
    out
}

/// Write every legacy virtual host of a plan into one router file
pub fn write_virtual_hosts(specs: &[LaunchSpec], root: &Path, out: &Path) -> Result<usize> {
    let blocks: Vec<String> = specs
        .iter()
        .filter(|s| s.kind == LaunchKind::LegacyVirtualHost)
        .map(|s| render_virtual_host(s, root))
        .collect();
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(out, blocks.join("\n"))?;
    Ok(blocks.len())
}

/// A launched backend process
#[derive(Debug)]
pub struct LaunchedRoute {
    pub spec: LaunchSpec,
    pub child: Child,
}

#[async_trait]
pub trait RuntimeLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedRoute>;
}

/// Spawns one process per spec from a command template.
///
/// The route is described to the process through `PORT`, `HOST`,
/// `ROUTE_PATH`, `RUNTIME` and `LAUNCH_KIND`; `ORIGINS` is a comma list
/// and `REDIRECT_TARGET` is set only for redirecting routes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: CommandTemplate,
    env: String,
    working_dir: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(command: &str, env: &str) -> Result<Self> {
        Ok(Self {
            command: CommandTemplate::parse(command)?,
            env: env.to_string(),
            working_dir: None,
        })
    }

    /// Run launched processes from this directory (builder pattern)
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl RuntimeLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedRoute> {
        let words = self.command.render(&spec.key(), &self.env);
        info!(
            host = %spec.host,
            path = %spec.path,
            port = spec.port,
            kind = ?spec.kind,
            command = %words.join(" "),
            "Launching route"
        );

        let mut cmd = Command::new(&words[0]);
        cmd.args(&words[1..]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        cmd.env("PORT", spec.port.to_string());
        cmd.env("HOST", &spec.host);
        cmd.env("ROUTE_PATH", &spec.path);
        cmd.env("RUNTIME", spec.runtime.canonical_name());
        cmd.env("LAUNCH_KIND", format!("{:?}", spec.kind));
        cmd.env("ORIGINS", spec.origins.join(","));
        if let Some(target) = &spec.redirect_target {
            cmd.env("REDIRECT_TARGET", target);
        }

        let child = cmd.spawn().map_err(|e| Error::BringUp {
            deploy_id: spec.key(),
            phase: "launch",
            message: e.to_string(),
        })?;
        info!(key = %spec.key(), pid = child.id().unwrap_or(0), "Route process spawned");

        Ok(LaunchedRoute {
            spec: spec.clone(),
            child,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortAllocator;
    use crate::topology::{RouteDescriptor, ServerTopology};

    fn plan(topology: &ServerTopology, development: bool) -> Vec<LaunchSpec> {
        let allocated = PortAllocator::new(4000).allocate(topology).unwrap();
        launch_plan(&allocated, development).unwrap()
    }

    #[test]
    fn test_plan_binds_proxy_target_ports() {
        let topology = ServerTopology::from_json(
            r#"{
                "a.test": {"/": {"runtime": "nodejs", "proxy": [80], "peer": true, "ws": "core"}},
                "b.test": {"/": {"runtime": "lampp", "proxy": [80], "redirect": "https://c.test/"}},
                "d.test": {"/": {"runtime": "static", "proxy": [80]}}
            }"#,
        )
        .unwrap();
        let specs = plan(&topology, false);

        let summary: Vec<_> = specs.iter().map(|s| (s.key(), s.port, s.kind)).collect();
        assert_eq!(
            summary,
            vec![
                ("a.test/".to_string(), 4001, LaunchKind::Websocket),
                ("a.test/peer".to_string(), 4002, LaunchKind::Peer),
                ("b.test/".to_string(), 4003, LaunchKind::LegacyVirtualHost),
            ]
        );
        assert_eq!(specs[2].redirect_target.as_deref(), Some("https://c.test"));
    }

    #[test]
    fn test_plan_skips_shared_single_replica_route() {
        let topology = ServerTopology::from_json(
            r#"{
                "s.test": {"/": {"runtime": "nodejs", "proxy": [80],
                                 "singleReplica": true, "replicas": ["/r1"]}},
                "x.test": {"/": {"runtime": "nodejs", "proxy": [80]}}
            }"#,
        )
        .unwrap();
        let specs = plan(&topology, false);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].key(), "x.test/");
        assert_eq!(specs[0].port, 4002);
    }

    #[test]
    fn test_development_origin_for_api_routes() {
        let mut topology = ServerTopology::new();
        let mut route = RouteDescriptor::node(&[80]);
        route.apis = Some(vec!["core".to_string()]);
        route.origins = vec!["https://a.test".to_string()];
        topology.insert("a.test", "/", route);

        assert_eq!(plan(&topology, false)[0].origins, vec!["https://a.test"]);
        assert_eq!(
            plan(&topology, true)[0].origins,
            vec!["https://a.test", "http://localhost:4003"]
        );
    }

    #[test]
    fn test_render_virtual_host() {
        let spec = LaunchSpec {
            host: "b.test".to_string(),
            path: "/wp".to_string(),
            runtime: Runtime::new("lampp"),
            port: 4003,
            kind: LaunchKind::LegacyVirtualHost,
            origins: Vec::new(),
            redirect_target: Some("https://c.test".to_string()),
            directory: None,
        };
        let block = render_virtual_host(&spec, Path::new("/srv/engine"));

        assert!(block.starts_with("Listen 4003\n"));
        assert!(block.contains("<VirtualHost *:4003>"));
        assert!(block.contains("DocumentRoot \"/srv/engine/public/b.test\""));
        assert!(block.contains("RewriteCond %{REQUEST_URI} !^/.well-known/acme-challenge"));
        assert!(block.contains("RewriteRule ^(.*)$ https://c.test%{REQUEST_URI} [R=302,L]"));
        assert!(block.contains("ErrorDocument 404 /wp/400.html"));
        assert!(block.contains("ErrorDocument 504 /wp/500.html"));

        let root_spec = LaunchSpec {
            path: "/".to_string(),
            redirect_target: None,
            directory: Some("/var/www/site".to_string()),
            ..spec
        };
        let block = render_virtual_host(&root_spec, Path::new("/srv/engine"));
        assert!(block.contains("DocumentRoot \"/var/www/site\""));
        assert!(block.contains("ErrorDocument 400 /400.html"));
        assert!(!block.contains("RewriteEngine"));
    }

    #[test]
    fn test_write_virtual_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let topology = ServerTopology::from_json(
            r#"{
                "a.test": {"/": {"runtime": "nodejs", "proxy": [80]}},
                "b.test": {"/": {"runtime": "xampp", "proxy": [80]}}
            }"#,
        )
        .unwrap();
        let specs = plan(&topology, false);
        let out = dir.path().join("router").join("vhosts.conf");

        assert_eq!(write_virtual_hosts(&specs, dir.path(), &out).unwrap(), 1);
        let content = std::fs::read_to_string(out).unwrap();
        assert!(content.contains("ServerName b.test:4002"));
        assert!(!content.contains("a.test"));
    }

    #[tokio::test]
    async fn test_process_launcher_passes_route_env() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new("sh -c 'echo $HOST$ROUTE_PATH:$PORT:$RUNTIME > launched'", "test")
            .unwrap()
            .working_dir(dir.path());
        let spec = LaunchSpec {
            host: "a.test".to_string(),
            path: "/".to_string(),
            runtime: Runtime::new("node-application"),
            port: 4001,
            kind: LaunchKind::AppServer,
            origins: Vec::new(),
            redirect_target: None,
            directory: None,
        };

        let mut launched = launcher.launch(&spec).await.unwrap();
        assert!(launched.child.wait().await.unwrap().success());
        let content = std::fs::read_to_string(dir.path().join("launched")).unwrap();
        assert_eq!(content.trim(), "a.test/:4001:nodejs");
    }
}
