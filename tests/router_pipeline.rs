//! End-to-end topology building from on-disk deploy documents

use std::path::Path;

use serde_json::json;
use tempfile::TempDir;
use tenantgate::config::{PathConfig, TopologyConfig};
use tenantgate::expand::{expand_routes, ExpansionMode};
use tenantgate::launcher::{launch_plan, LaunchKind};
use tenantgate::manifest::{build_targets, merged_topology, ConfResolver, DeployGroup};
use tenantgate::ports::PortAllocator;
use tenantgate::router::{build_routing_table, ProxyRouterBuilder, ProxyRoutingTable};

fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

struct Engine {
    root: TempDir,
    paths: PathConfig,
}

impl Engine {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let paths = PathConfig {
            root: root.path().to_path_buf(),
            ..PathConfig::default()
        };
        Self { root, paths }
    }

    fn resolver(&self) -> ConfResolver {
        ConfResolver::new(&self.paths, &TopologyConfig::default())
    }

    fn group(&self) -> DeployGroup {
        DeployGroup::load(&self.paths.deploy_dir(), "dd").unwrap()
    }
}

fn single_deploy_engine() -> Engine {
    let engine = Engine::new();
    write(engine.root.path(), "engine-private/deploy/dd.json", r#"["dd-app"]"#);
    write(
        engine.root.path(),
        "engine-private/conf/dd-app/conf.server.json",
        r#"{
            "a.test": {
                "/": {"runtime": "nodejs", "proxy": [80, 443], "peer": true,
                      "redirect": "https://www.a.test/"},
                "/api": {"runtime": "nodejs", "proxy": [443], "apis": ["core"]}
            },
            "wp.test": {"/": {"runtime": "lampp", "proxy": [80]}}
        }"#,
    );
    engine
}

#[test]
fn test_routing_table_document() {
    let engine = single_deploy_engine();
    let topology = expand_routes(
        &merged_topology(&engine.group(), &engine.resolver()).unwrap(),
        ExpansionMode::Proxy,
    );
    let allocated = PortAllocator::new(4000).allocate(&topology).unwrap();
    let table = build_routing_table(&allocated).unwrap();

    let value: serde_json::Value = serde_json::from_str(&table.to_json_pretty()).unwrap();
    assert_eq!(
        value,
        json!({
            "80": {
                "a.test/": {"target": "http://localhost:4001", "proxy": [80, 443],
                            "redirect": "https://www.a.test/", "host": "a.test", "path": "/"},
                "a.test/peer": {"target": "http://localhost:4002", "proxy": [80, 443],
                                "host": "a.test", "path": "/peer"},
                "wp.test/": {"target": "http://localhost:4004", "proxy": [80],
                             "host": "wp.test", "path": "/"}
            },
            "443": {
                "a.test/": {"target": "http://localhost:4001", "proxy": [80, 443],
                            "redirect": "https://www.a.test/", "host": "a.test", "path": "/"},
                "a.test/peer": {"target": "http://localhost:4002", "proxy": [80, 443],
                                "host": "a.test", "path": "/peer"},
                "a.test/api": {"target": "http://localhost:4003", "proxy": [443],
                               "host": "a.test", "path": "/api"}
            }
        })
    );

    let keys: Vec<_> = table.listener(443).unwrap().keys().cloned().collect();
    assert_eq!(keys, vec!["a.test/", "a.test/peer", "a.test/api"]);
}

#[test]
fn test_table_persists_across_rebuilds() {
    let engine = single_deploy_engine();
    let build = || {
        let topology = expand_routes(
            &merged_topology(&engine.group(), &engine.resolver()).unwrap(),
            ExpansionMode::Proxy,
        );
        let allocated = PortAllocator::new(4000).allocate(&topology).unwrap();
        build_routing_table(&allocated).unwrap()
    };

    let first = build();
    first.save(engine.paths.router_file()).unwrap();
    let written = std::fs::read_to_string(engine.paths.router_file()).unwrap();

    let second = build();
    assert_eq!(ProxyRoutingTable::load(engine.paths.router_file()).unwrap(), second);
    assert_eq!(written, second.to_json_pretty());
}

#[test]
fn test_runtime_binds_what_the_proxy_targets() {
    let engine = Engine::new();
    write(engine.root.path(), "engine-private/deploy/dd.json", r#"["dd-game"]"#);
    write(
        engine.root.path(),
        "engine-private/conf/dd-game/conf.server.json",
        r#"{
            "game.test": {"/": {"runtime": "nodejs", "proxy": [443],
                                "singleReplica": true, "replicas": ["/r1", "/r2"]}},
            "shop.test": {"/": {"runtime": "nodejs", "proxy": [443], "peer": true}}
        }"#,
    );

    let collapsed = engine.resolver().load("dd-game").unwrap();
    let proxy_side = PortAllocator::new(4000)
        .allocate(&expand_routes(&collapsed, ExpansionMode::Proxy))
        .unwrap();
    let table = build_routing_table(&proxy_side).unwrap();

    let runtime_side = PortAllocator::new(4000)
        .allocate(&expand_routes(&collapsed, ExpansionMode::Runtime))
        .unwrap();
    let specs = launch_plan(&runtime_side, false).unwrap();

    assert!(table.get(443, "game.test/").is_none());
    for spec in specs {
        let target = table.get(443, &spec.key()).unwrap();
        assert_eq!(target.target, format!("http://localhost:{}", spec.port));
        if spec.kind == LaunchKind::Peer {
            assert_eq!(spec.path, "/peer");
        }
    }

    let targets = build_targets(&engine.group(), &engine.resolver()).unwrap();
    let ids: Vec<_> = targets.iter().map(|t| t.deploy_id.as_str()).collect();
    assert_eq!(ids, vec!["dd-game", "dd-game-r1", "dd-game-r2"]);
}

#[test]
fn test_merged_deploys_and_collision_count() {
    let engine = Engine::new();
    write(
        engine.root.path(),
        "engine-private/deploy/dd.json",
        r#"["dd-main", "dd-blog"]"#,
    );
    write(
        engine.root.path(),
        "engine-private/conf/dd-main/conf.server.json",
        r#"{"a.test": {"/": {"runtime": "nodejs", "proxy": [80]},
                       "/peer": {"runtime": "nodejs", "proxy": [80]}}}"#,
    );
    write(
        engine.root.path(),
        "engine-private/conf/dd-blog/conf.server.json",
        r#"{"a.test": {"/": {"runtime": "nodejs", "proxy": [80], "peer": true},
                       "/blog": {"runtime": "nodejs", "proxy": [80]}}}"#,
    );

    let merged = merged_topology(&engine.group(), &engine.resolver()).unwrap();
    let paths: Vec<_> = merged.host("a.test").unwrap().keys().cloned().collect();
    assert_eq!(paths, vec!["/", "/peer", "/blog"]);
    assert!(merged.get("a.test", "/").unwrap().peer);

    let allocated = PortAllocator::new(4000).allocate(&merged).unwrap();
    let mut builder = ProxyRouterBuilder::new();
    let table = builder.build(&allocated).unwrap();

    assert_eq!(builder.collisions(), 1);
    assert_eq!(table.get(80, "a.test/peer").unwrap().target, "http://localhost:4003");
}
