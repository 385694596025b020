use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for topology building and rollout
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Locations of deploy documents and runtime artifacts
    #[serde(default)]
    pub paths: PathConfig,

    /// Port allocation and environment selection
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Readiness wait and liveness probe settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Commands issued against deploy instances
    #[serde(default)]
    pub commands: CommandConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathConfig {
    /// Directory every relative path below is resolved against
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Per-deploy configuration folders (`{conf_dir}/{deploy_id}/conf.server.json`)
    #[serde(default = "default_conf_dir")]
    pub conf_dir: PathBuf,

    /// Per-replica configuration folders, preferred over `conf_dir` when present
    #[serde(default = "default_replica_dir")]
    pub replica_dir: PathBuf,

    /// Deploy group manifests (`{deploy_dir}/{group}.json`)
    #[serde(default = "default_deploy_dir")]
    pub deploy_dir: PathBuf,

    /// Readiness marker; its existence means "not ready yet"
    #[serde(default = "default_sentinel")]
    pub sentinel: PathBuf,

    /// Persisted proxy routing table
    #[serde(default = "default_router_file")]
    pub router_file: PathBuf,
}

impl PathConfig {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.resolve(&self.conf_dir)
    }

    pub fn replica_dir(&self) -> PathBuf {
        self.resolve(&self.replica_dir)
    }

    pub fn deploy_dir(&self) -> PathBuf {
        self.resolve(&self.deploy_dir)
    }

    pub fn sentinel(&self) -> PathBuf {
        self.resolve(&self.sentinel)
    }

    pub fn router_file(&self) -> PathBuf {
        self.resolve(&self.router_file)
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            conf_dir: default_conf_dir(),
            replica_dir: default_replica_dir(),
            deploy_dir: default_deploy_dir(),
            sentinel: default_sentinel(),
            router_file: default_router_file(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TopologyConfig {
    /// Ports are allocated from `base_port + 1` upward (env `PORT` overrides)
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Deployment environment (env `NODE_ENV` overrides)
    #[serde(default = "default_env")]
    pub env: String,

    /// Suffix selecting `conf.server.dev.{variant}.json` in development
    pub dev_variant: Option<String>,
}

impl TopologyConfig {
    pub fn is_development(&self) -> bool {
        self.env == "development"
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            env: default_env(),
            dev_variant: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Readiness poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Minimum time to wait after start even if the instance reports ready early
    #[serde(default = "default_min_wait")]
    pub min_wait_secs: u64,

    /// Readiness ceiling; the target fails once it is exceeded
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,

    /// Bound on every liveness probe request
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Scheme used for liveness URLs
    #[serde(default = "default_probe_scheme")]
    pub probe_scheme: String,

    /// Accept self-signed or otherwise invalid certificates when probing
    #[serde(default = "default_accept_invalid_certs")]
    pub accept_invalid_certs: bool,

    /// Maximum retry passes after the first one (unbounded when unset)
    pub max_retries: Option<u32>,

    /// Empty the persisted routing table before the first pass
    #[serde(default)]
    pub reset_router: bool,
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn min_wait(&self) -> Duration {
        Duration::from_secs(self.min_wait_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            min_wait_secs: default_min_wait(),
            max_wait_secs: default_max_wait(),
            probe_timeout_secs: default_probe_timeout(),
            probe_scheme: default_probe_scheme(),
            accept_invalid_certs: default_accept_invalid_certs(),
            max_retries: None,
            reset_router: false,
        }
    }
}

/// Command templates; `{deploy_id}` and `{env}` are substituted per token
///
/// # Security Warning
///
/// These commands are executed directly with the permissions of this
/// process. Configuration files must be protected accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct CommandConfig {
    /// Stop any running instance of a deploy (failures are ignored)
    #[serde(default = "default_stop_command")]
    pub stop: String,

    /// Regenerate a deploy's on-disk configuration
    #[serde(default = "default_configure_command")]
    pub configure: String,

    /// Start a deploy instance in the background
    #[serde(default = "default_start_command")]
    pub start: String,

    /// Command launched per route by `tenantgate launch`
    pub launch: Option<String>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            stop: default_stop_command(),
            configure: default_configure_command(),
            start: default_start_command(),
            launch: None,
        }
    }
}

// Default value functions
fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_conf_dir() -> PathBuf {
    PathBuf::from("engine-private/conf")
}

fn default_replica_dir() -> PathBuf {
    PathBuf::from("engine-private/replica")
}

fn default_deploy_dir() -> PathBuf {
    PathBuf::from("engine-private/deploy")
}

fn default_sentinel() -> PathBuf {
    PathBuf::from("tmp/await-deploy")
}

fn default_router_file() -> PathBuf {
    PathBuf::from("tmp/runtime-router.json")
}

fn default_base_port() -> u16 {
    4000
}

fn default_env() -> String {
    "production".to_string()
}

fn default_poll_interval() -> u64 {
    1000 // 1 second
}

fn default_min_wait() -> u64 {
    20 // let backends stabilize
}

fn default_max_wait() -> u64 {
    300 // 5 minutes
}

fn default_probe_timeout() -> u64 {
    30
}

fn default_probe_scheme() -> String {
    "https".to_string()
}

fn default_accept_invalid_certs() -> bool {
    true
}

fn default_stop_command() -> String {
    "pm2 delete {deploy_id}".to_string()
}

fn default_configure_command() -> String {
    "node bin/deploy conf {deploy_id} {env}".to_string()
}

fn default_start_command() -> String {
    "node bin/deploy run {deploy_id}".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `PORT` and `NODE_ENV` from the process environment
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(std::env::var("PORT").ok(), std::env::var("NODE_ENV").ok())
    }

    fn apply_overrides(&mut self, port: Option<String>, env: Option<String>) -> anyhow::Result<()> {
        if let Some(port) = port {
            self.topology.base_port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid PORT '{}': {}", port, e))?;
        }
        if let Some(env) = env.filter(|e| !e.is_empty()) {
            self.topology.env = env;
        }
        self.validate()
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.supervisor.poll_interval_ms == 0 {
            errors.push("'supervisor.poll_interval_ms' must be greater than 0".to_string());
        }
        if self.supervisor.max_wait_secs < self.supervisor.min_wait_secs {
            errors.push(format!(
                "'supervisor.max_wait_secs' ({}) must not be below 'min_wait_secs' ({})",
                self.supervisor.max_wait_secs, self.supervisor.min_wait_secs
            ));
        }
        if self.supervisor.probe_timeout_secs == 0 {
            errors.push("'supervisor.probe_timeout_secs' must be greater than 0".to_string());
        }
        if !matches!(self.supervisor.probe_scheme.as_str(), "http" | "https") {
            errors.push(format!(
                "'supervisor.probe_scheme' must be http or https, got '{}'",
                self.supervisor.probe_scheme
            ));
        }
        for (name, template) in [
            ("stop", &self.commands.stop),
            ("configure", &self.commands.configure),
            ("start", &self.commands.start),
        ] {
            match shell_words::split(template) {
                Ok(words) if !words.is_empty() => {}
                Ok(_) => errors.push(format!("'commands.{}' must not be empty", name)),
                Err(e) => errors.push(format!("'commands.{}' is not a valid command: {}", name, e)),
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
