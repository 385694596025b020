//! Tenantgate CLI
//!
//! Usage:
//!   tenantgate router [deploy-group:<id>] [deploy-id]    Build and persist the proxy routing table
//!   tenantgate ports <deploy-id>                         Show a deploy's allocated topology
//!   tenantgate targets [deploy-group:<id>] [deploy-id]   List deploy targets, replicas included
//!   tenantgate deploy [deploy-group:<id>] [deploy-id]    Roll deploy targets out with retry
//!   tenantgate launch <deploy-id>                        Bring up the backends of one deploy

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tenantgate::config::Config;
use tenantgate::controller::ShellController;
use tenantgate::expand::{expand_routes, ExpansionMode};
use tenantgate::launcher::{launch_plan, write_virtual_hosts, LaunchKind, ProcessLauncher, RuntimeLauncher};
use tenantgate::manifest::{build_targets, deploy_group_id, merged_topology, ConfResolver, DeployGroup};
use tenantgate::ports::PortAllocator;
use tenantgate::probe::HttpProbe;
use tenantgate::readiness::Sentinel;
use tenantgate::router::ProxyRouterBuilder;
use tenantgate::supervisor::{AutoConfirm, ConfirmationGate, DeploySupervisorBuilder, StdinGate};
use tenantgate::{PKG_NAME, VERSION};
use tracing::{error, info, warn};

/// Settings file used when `--config` is not given
const DEFAULT_CONFIG_PATH: &str = "tenantgate.toml";

#[derive(Debug)]
enum Command {
    Router(GroupOptions),
    Ports { deploy_id: String },
    Targets(GroupOptions),
    Deploy(DeployOptions),
    Launch(LaunchOptions),
    Help,
    Version,
}

#[derive(Debug, Default)]
struct GroupOptions {
    group: String,
    /// Restrict the group to a single deploy
    deploy_id: Option<String>,
    /// Print instead of writing to disk
    print: bool,
}

#[derive(Debug)]
struct DeployOptions {
    group: GroupOptions,
    /// Retry without asking
    yes: bool,
    reset_router: bool,
}

#[derive(Debug)]
struct LaunchOptions {
    deploy_id: String,
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenantgate=debug".parse().expect("valid log directive")),
        )
        .init();

    match run().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether the command succeeded
async fn run() -> Result<bool> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let config_path = take_option(&mut args, "--config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let command = parse_command(&args)?;
    if matches!(command, Command::Help | Command::Version) {
        match command {
            Command::Version => print_version(),
            _ => print_help(),
        }
        return Ok(true);
    }

    let mut config = Config::load_or_default(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    config.apply_env()?;
    info!(
        name = PKG_NAME,
        version = VERSION,
        config = %config_path.display(),
        base_port = config.topology.base_port,
        env = %config.topology.env,
        "Configuration loaded"
    );

    match command {
        Command::Router(opts) => handle_router(&config, opts),
        Command::Ports { deploy_id } => handle_ports(&config, &deploy_id),
        Command::Targets(opts) => handle_targets(&config, opts),
        Command::Deploy(opts) => handle_deploy(&config, opts).await,
        Command::Launch(opts) => handle_launch(&config, opts).await,
        Command::Help | Command::Version => Ok(true),
    }
}

/// Remove `--name <value>` from `args`, returning the value
fn take_option(args: &mut Vec<String>, name: &str) -> Option<String> {
    let index = args.iter().position(|a| a == name)?;
    args.remove(index);
    if index < args.len() {
        Some(args.remove(index))
    } else {
        None
    }
}

fn parse_command(args: &[String]) -> Result<Command> {
    if args.is_empty() {
        return Ok(Command::Help);
    }

    let rest = &args[1..];
    let command = match args[0].as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-v" => Command::Version,
        "router" => Command::Router(parse_group_options(rest)),
        "ports" => Command::Ports {
            deploy_id: first_positional(rest).context("ports requires a deploy id")?,
        },
        "targets" => Command::Targets(parse_group_options(rest)),
        "deploy" => Command::Deploy(DeployOptions {
            group: parse_group_options(rest),
            yes: rest.iter().any(|a| a == "--yes" || a == "-y"),
            reset_router: rest.iter().any(|a| a == "--reset-router"),
        }),
        "launch" => Command::Launch(LaunchOptions {
            deploy_id: first_positional(rest).context("launch requires a deploy id")?,
            dry_run: rest.iter().any(|a| a == "--dry-run"),
        }),
        other => anyhow::bail!("Unknown command '{}'. Run 'tenantgate help' for usage.", other),
    };
    Ok(command)
}

fn first_positional(args: &[String]) -> Option<String> {
    args.iter()
        .find(|a| !a.starts_with('-') && !a.starts_with("deploy-group:"))
        .cloned()
}

fn parse_group_options(args: &[String]) -> GroupOptions {
    GroupOptions {
        group: deploy_group_id(args),
        deploy_id: first_positional(args),
        print: args.iter().any(|a| a == "--print"),
    }
}

fn load_group(config: &Config, opts: &GroupOptions) -> Result<DeployGroup> {
    let group = DeployGroup::load(&config.paths.deploy_dir(), &opts.group)?
        .filter(opts.deploy_id.as_deref())?;
    Ok(group)
}

fn handle_router(config: &Config, opts: GroupOptions) -> Result<bool> {
    let resolver = ConfResolver::new(&config.paths, &config.topology);
    let group = load_group(config, &opts)?;

    let topology = expand_routes(&merged_topology(&group, &resolver)?, ExpansionMode::Proxy);
    let allocated = PortAllocator::new(config.topology.base_port).allocate(&topology)?;
    let mut builder = ProxyRouterBuilder::new();
    let table = builder.build(&allocated)?;

    if opts.print {
        println!("{}", table.to_json_pretty());
    } else {
        let path = config.paths.router_file();
        table.save(&path)?;
        info!(
            path = %path.display(),
            entries = table.len(),
            collisions = builder.collisions(),
            "Routing table written"
        );
    }
    Ok(true)
}

fn handle_ports(config: &Config, deploy_id: &str) -> Result<bool> {
    let resolver = ConfResolver::new(&config.paths, &config.topology);
    let topology = expand_routes(&resolver.load(deploy_id)?, ExpansionMode::Runtime);
    let allocated = PortAllocator::new(config.topology.base_port).allocate(&topology)?;
    println!("{}", allocated.to_topology().to_json_pretty());
    Ok(true)
}

fn handle_targets(config: &Config, opts: GroupOptions) -> Result<bool> {
    let resolver = ConfResolver::new(&config.paths, &config.topology);
    let group = load_group(config, &opts)?;
    let targets = build_targets(&group, &resolver)?;
    println!("{}", serde_json::to_string_pretty(&targets)?);
    Ok(true)
}

async fn handle_deploy(config: &Config, opts: DeployOptions) -> Result<bool> {
    let resolver = ConfResolver::new(&config.paths, &config.topology);
    let group = load_group(config, &opts.group)?;
    let targets = build_targets(&group, &resolver)?;
    info!(group = %group.id, targets = targets.len(), "Deploy targets resolved");

    let controller = ShellController::new(&config.commands, &config.topology.env)?
        .working_dir(&config.paths.root);
    let gate: Arc<dyn ConfirmationGate> = if opts.yes {
        Arc::new(AutoConfirm)
    } else {
        Arc::new(StdinGate::stdin())
    };

    let mut builder = DeploySupervisorBuilder::new()
        .controller(Arc::new(controller))
        .probe(Arc::new(HttpProbe::from_config(&config.supervisor)?))
        .readiness(Arc::new(Sentinel::new(config.paths.sentinel())))
        .topology(Arc::new(resolver))
        .gate(gate)
        .config(&config.supervisor);
    if opts.reset_router || config.supervisor.reset_router {
        builder = builder.reset_router(config.paths.router_file());
    }
    let supervisor = builder
        .build()
        .context("deploy supervisor is missing a collaborator")?;

    let report = supervisor.run(targets).await?;
    if report.is_success() {
        info!(
            passes = report.passes,
            deployed = report.succeeded.len(),
            "Rollout complete"
        );
    } else {
        error!(
            passes = report.passes,
            failed = ?report.failed_ids(),
            "Rollout finished with failed targets"
        );
    }
    Ok(report.is_success())
}

async fn handle_launch(config: &Config, opts: LaunchOptions) -> Result<bool> {
    let resolver = ConfResolver::new(&config.paths, &config.topology);
    let topology = expand_routes(&resolver.load(&opts.deploy_id)?, ExpansionMode::Runtime);
    let allocated = PortAllocator::new(config.topology.base_port).allocate(&topology)?;
    let specs = launch_plan(&allocated, config.topology.is_development())?;

    if opts.dry_run {
        println!("{}", serde_json::to_string_pretty(&specs)?);
        return Ok(true);
    }

    let vhosts = config.paths.root.join("tmp").join("virtual-hosts.conf");
    let written = write_virtual_hosts(&specs, &config.paths.root, &vhosts)?;
    if written > 0 {
        info!(path = %vhosts.display(), count = written, "Legacy virtual hosts written");
    }

    let command = config
        .commands
        .launch
        .as_deref()
        .context("'commands.launch' must be set to launch routes")?;
    let launcher = ProcessLauncher::new(command, &config.topology.env)?.working_dir(&config.paths.root);

    let mut launched = Vec::new();
    for spec in specs.iter().filter(|s| s.kind != LaunchKind::LegacyVirtualHost) {
        launched.push(launcher.launch(spec).await?);
    }
    info!(routes = launched.len(), "Routes launched, waiting for shutdown signal");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping routes");
    for route in &mut launched {
        if let Err(e) = route.child.kill().await {
            warn!(key = %route.spec.key(), error = %e, "Failed to stop route process");
        }
    }
    Ok(true)
}

fn print_help() {
    println!(
        r#"
tenantgate - multi-tenant topology builder and rollout supervisor

USAGE:
    tenantgate [--config <path>] <command> [options]

COMMANDS:
    router [deploy-group:<id>] [deploy-id]    Build the proxy routing table
        --print                               Print the table instead of writing it

    ports <deploy-id>                         Show the allocated topology of a deploy
    targets [deploy-group:<id>] [deploy-id]   List deploy targets, replicas included

    deploy [deploy-group:<id>] [deploy-id]    Roll targets out, retrying failures
        --yes, -y                             Retry without asking
        --reset-router                        Empty the routing table first

    launch <deploy-id>                        Bring up the backends of one deploy
        --dry-run                             Print the launch plan only

    help                                      Show this help
    version                                   Show version

The deploy group defaults to 'dd'. Settings are read from tenantgate.toml
when present; PORT and NODE_ENV override the base port and environment.
"#
    );
}

fn print_version() {
    println!("{} {}", PKG_NAME, VERSION);
}
