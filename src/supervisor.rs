//! Rollout supervision
//!
//! Every deploy target runs the whole pipeline on its own before the next
//! one starts:
//!
//! ```text
//! PENDING -> TEARING_DOWN -> CONFIGURING -> STARTING -> WAITING_READY
//!         -> HEALTH_CHECKING -> SUCCEEDED | FAILED
//! ```
//!
//! Targets share the readiness sentinel and the configuration folders, so
//! a pass is strictly sequential. Failed targets are retried as a new batch
//! from `TEARING_DOWN` once the [`ConfirmationGate`] agrees.

use crate::config::SupervisorConfig;
use crate::controller::InstanceController;
use crate::error::{Error, ErrorCode, Result};
use crate::expand::{expand_routes, ExpansionMode};
use crate::manifest::{ConfResolver, DeployTarget};
use crate::probe::{route_url, LivenessProbe};
use crate::readiness::{wait_until_ready, Readiness, ReadinessSource, WaitPolicy};
use crate::router::ProxyRoutingTable;
use crate::topology::ServerTopology;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Lifecycle phase of one deploy target within a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployPhase {
    Pending,
    TearingDown,
    Configuring,
    Starting,
    WaitingReady,
    HealthChecking,
    Succeeded,
    Failed,
}

impl DeployPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployPhase::Pending => "PENDING",
            DeployPhase::TearingDown => "TEARING_DOWN",
            DeployPhase::Configuring => "CONFIGURING",
            DeployPhase::Starting => "STARTING",
            DeployPhase::WaitingReady => "WAITING_READY",
            DeployPhase::HealthChecking => "HEALTH_CHECKING",
            DeployPhase::Succeeded => "SUCCEEDED",
            DeployPhase::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployPhase::Succeeded | DeployPhase::Failed)
    }
}

impl std::fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of probing one route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteCheck {
    pub host: String,
    pub path: String,
    pub url: String,
    /// Title observed on success
    pub title: Option<String>,
    pub error: Option<String>,
}

impl RouteCheck {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

/// Why a target failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    /// Phase the target was in when it failed
    pub phase: DeployPhase,
    pub code: ErrorCode,
    pub message: String,
}

impl FailureDetail {
    fn from_error(phase: DeployPhase, err: &Error) -> Self {
        Self {
            phase,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} during {}", self.code, self.message, self.phase)
    }
}

/// Outcome of one target in one pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployOutcome {
    pub target: DeployTarget,
    pub succeeded: bool,
    pub failure: Option<FailureDetail>,
    pub checks: Vec<RouteCheck>,
}

impl DeployOutcome {
    fn success(target: &DeployTarget, checks: Vec<RouteCheck>) -> Self {
        Self {
            target: target.clone(),
            succeeded: true,
            failure: None,
            checks,
        }
    }

    fn failure(target: &DeployTarget, failure: FailureDetail, checks: Vec<RouteCheck>) -> Self {
        Self {
            target: target.clone(),
            succeeded: false,
            failure: Some(failure),
            checks,
        }
    }

    pub fn phase(&self) -> DeployPhase {
        if self.succeeded {
            DeployPhase::Succeeded
        } else {
            DeployPhase::Failed
        }
    }
}

/// Final result of a rollout
#[derive(Debug, Clone, Default, Serialize)]
pub struct RolloutReport {
    /// Number of passes run, the first one included
    pub passes: u32,
    pub succeeded: Vec<DeployTarget>,
    /// Outcomes of the targets that still failed in the last pass
    pub failed: Vec<DeployOutcome>,
}

impl RolloutReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|o| o.target.deploy_id.as_str()).collect()
    }
}

/// Where the supervisor reads each target's topology for health checks
pub trait TopologySource: Send + Sync {
    fn topology(&self, target: &DeployTarget) -> Result<ServerTopology>;
}

impl TopologySource for ConfResolver {
    fn topology(&self, target: &DeployTarget) -> Result<ServerTopology> {
        self.load(&target.deploy_id)
    }
}

/// Decides whether failed targets are retried
#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    async fn confirm(&self, failed: &[DeployOutcome]) -> bool;
}

/// Always retries
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

#[async_trait]
impl ConfirmationGate for AutoConfirm {
    async fn confirm(&self, _failed: &[DeployOutcome]) -> bool {
        true
    }
}

/// Asks the operator before each retry; end of input stops the rollout.
///
/// The reader lives as long as the gate, so input buffered past one answer
/// is still there for the next prompt.
#[derive(Debug)]
pub struct LineGate<R> {
    input: Mutex<R>,
}

/// [`LineGate`] reading answers from the terminal
pub type StdinGate = LineGate<BufReader<Stdin>>;

impl<R> LineGate<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(input: R) -> Self {
        Self {
            input: Mutex::new(input),
        }
    }
}

impl StdinGate {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

#[async_trait]
impl<R> ConfirmationGate for LineGate<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn confirm(&self, failed: &[DeployOutcome]) -> bool {
        let mut input = self.input.lock().await;

        let mut stdout = tokio::io::stdout();
        let prompt = format!(
            "{} target(s) failed. Press enter to retry failed processes\n",
            failed.len()
        );
        if stdout.write_all(prompt.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            return false;
        }

        let mut line = String::new();
        match input.read_line(&mut line).await {
            Ok(0) | Err(_) => false,
            Ok(_) => true,
        }
    }
}

/// Drives deploy targets through bring-up, readiness and liveness
pub struct DeploySupervisor {
    controller: Arc<dyn InstanceController>,
    probe: Arc<dyn LivenessProbe>,
    readiness: Arc<dyn ReadinessSource>,
    topology: Arc<dyn TopologySource>,
    gate: Arc<dyn ConfirmationGate>,
    policy: WaitPolicy,
    probe_scheme: String,
    max_retries: Option<u32>,
    router_reset: Option<PathBuf>,
}

impl DeploySupervisor {
    /// Run targets until all succeed, the gate declines, or retries run out
    pub async fn run(&self, targets: Vec<DeployTarget>) -> Result<RolloutReport> {
        if let Some(path) = &self.router_reset {
            ProxyRoutingTable::reset(path)?;
            info!(path = %path.display(), "Runtime router reset");
        }

        let mut report = RolloutReport::default();
        let mut pending = targets;

        loop {
            report.passes += 1;
            info!(pass = report.passes, targets = pending.len(), "Starting deploy pass");

            let outcomes = self.run_pass(&pending).await?;
            let (succeeded, failed): (Vec<_>, Vec<_>) =
                outcomes.into_iter().partition(|o| o.succeeded);
            report.succeeded.extend(succeeded.into_iter().map(|o| o.target));

            if failed.is_empty() {
                info!(passes = report.passes, "All deploy targets succeeded");
                return Ok(report);
            }

            for outcome in &failed {
                error!(
                    deploy_id = %outcome.target.deploy_id,
                    reason = %outcome.failure.as_ref().map(|f| f.to_string()).unwrap_or_default(),
                    retry = %self.controller.retry_command(&outcome.target),
                    "Deploy target failed"
                );
            }

            let retries_done = report.passes - 1;
            let exhausted = self.max_retries.is_some_and(|max| retries_done >= max);
            if exhausted || !self.gate.confirm(&failed).await {
                warn!(
                    passes = report.passes,
                    failed = failed.len(),
                    exhausted,
                    "Rollout stopped with failed targets"
                );
                report.failed = failed;
                return Ok(report);
            }

            pending = failed.into_iter().map(|o| o.target).collect();
        }
    }

    /// One sequential pass over a batch
    pub async fn run_pass(&self, targets: &[DeployTarget]) -> Result<Vec<DeployOutcome>> {
        let mut outcomes = Vec::with_capacity(targets.len());
        for target in targets {
            outcomes.push(self.run_target(target).await?);
        }
        Ok(outcomes)
    }

    /// Run the full pipeline for one target.
    ///
    /// Retryable failures become a failed outcome; configuration errors
    /// abort with `Err`.
    pub async fn run_target(&self, target: &DeployTarget) -> Result<DeployOutcome> {
        self.transition(target, DeployPhase::Pending);

        if let Err((phase, err)) = self.bring_up(target).await {
            return self.fail(target, phase, err, Vec::new());
        }

        self.transition(target, DeployPhase::WaitingReady);
        let readiness = wait_until_ready(self.readiness.as_ref(), self.policy).await;
        if let Readiness::TimedOut { waited } = readiness {
            let err = Error::ReadinessTimeout {
                deploy_id: target.deploy_id.clone(),
                waited_secs: waited.as_secs(),
            };
            return self.fail(target, DeployPhase::WaitingReady, err, Vec::new());
        }
        info!(
            deploy_id = %target.deploy_id,
            waited_secs = readiness.waited().as_secs(),
            "Instance ready"
        );

        self.transition(target, DeployPhase::HealthChecking);
        let checks = self.health_check(target).await?;
        if let Some(failed) = checks.iter().find(|c| !c.passed()) {
            let err = Error::Liveness {
                url: failed.url.clone(),
                reason: failed.error.clone().unwrap_or_default(),
            };
            return self.fail(target, DeployPhase::HealthChecking, err, checks);
        }

        self.transition(target, DeployPhase::Succeeded);
        Ok(DeployOutcome::success(target, checks))
    }

    async fn bring_up(&self, target: &DeployTarget) -> std::result::Result<(), (DeployPhase, Error)> {
        self.transition(target, DeployPhase::TearingDown);
        self.controller
            .stop(target)
            .await
            .map_err(|e| (DeployPhase::TearingDown, e))?;

        self.transition(target, DeployPhase::Configuring);
        self.controller
            .configure(target)
            .await
            .map_err(|e| (DeployPhase::Configuring, e))?;

        self.transition(target, DeployPhase::Starting);
        self.readiness.arm().await.map_err(|e| {
            (
                DeployPhase::Starting,
                Error::BringUp {
                    deploy_id: target.deploy_id.clone(),
                    phase: "start",
                    message: format!("failed to arm readiness sentinel: {}", e),
                },
            )
        })?;
        self.controller
            .start(target)
            .await
            .map_err(|e| (DeployPhase::Starting, e))
    }

    /// Probe every route of the target's topology that serves on its own
    async fn health_check(&self, target: &DeployTarget) -> Result<Vec<RouteCheck>> {
        let topology = expand_routes(&self.topology.topology(target)?, ExpansionMode::Runtime);
        let mut checks = Vec::new();

        for (host, path, route) in topology.routes() {
            if route.single_replica {
                continue;
            }
            let url = route_url(&self.probe_scheme, host, path);
            let check = match self.probe.check(&url).await {
                Ok(title) => {
                    info!(deploy_id = %target.deploy_id, url = %url, title = %title, "Route is alive");
                    RouteCheck {
                        host: host.to_string(),
                        path: path.to_string(),
                        url,
                        title: Some(title),
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(deploy_id = %target.deploy_id, url = %url, error = %e, "Route failed liveness check");
                    RouteCheck {
                        host: host.to_string(),
                        path: path.to_string(),
                        url,
                        title: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            checks.push(check);
        }

        Ok(checks)
    }

    fn fail(
        &self,
        target: &DeployTarget,
        phase: DeployPhase,
        err: Error,
        checks: Vec<RouteCheck>,
    ) -> Result<DeployOutcome> {
        if !err.is_retryable() {
            return Err(err);
        }
        let detail = FailureDetail::from_error(phase, &err);
        self.transition(target, DeployPhase::Failed);
        Ok(DeployOutcome::failure(target, detail, checks))
    }

    fn transition(&self, target: &DeployTarget, phase: DeployPhase) {
        info!(deploy_id = %target.deploy_id, phase = %phase, "Deploy phase");
    }
}

/// Builder for [`DeploySupervisor`]
pub struct DeploySupervisorBuilder {
    controller: Option<Arc<dyn InstanceController>>,
    probe: Option<Arc<dyn LivenessProbe>>,
    readiness: Option<Arc<dyn ReadinessSource>>,
    topology: Option<Arc<dyn TopologySource>>,
    gate: Arc<dyn ConfirmationGate>,
    policy: WaitPolicy,
    probe_scheme: String,
    max_retries: Option<u32>,
    router_reset: Option<PathBuf>,
}

impl DeploySupervisorBuilder {
    pub fn new() -> Self {
        Self {
            controller: None,
            probe: None,
            readiness: None,
            topology: None,
            gate: Arc::new(StdinGate::stdin()),
            policy: WaitPolicy::default(),
            probe_scheme: "https".to_string(),
            max_retries: None,
            router_reset: None,
        }
    }

    pub fn controller(mut self, controller: Arc<dyn InstanceController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn readiness(mut self, readiness: Arc<dyn ReadinessSource>) -> Self {
        self.readiness = Some(readiness);
        self
    }

    pub fn topology(mut self, topology: Arc<dyn TopologySource>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn gate(mut self, gate: Arc<dyn ConfirmationGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn policy(mut self, policy: WaitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn probe_scheme(mut self, scheme: &str) -> Self {
        self.probe_scheme = scheme.to_string();
        self
    }

    pub fn max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Empty the routing table at `path` before the first pass
    pub fn reset_router(mut self, path: impl Into<PathBuf>) -> Self {
        self.router_reset = Some(path.into());
        self
    }

    /// Apply wait policy, probe scheme and retry bound from settings
    pub fn config(self, config: &SupervisorConfig) -> Self {
        self.policy(WaitPolicy::from(config))
            .probe_scheme(&config.probe_scheme)
            .max_retries(config.max_retries)
    }

    pub fn build(self) -> Option<DeploySupervisor> {
        Some(DeploySupervisor {
            controller: self.controller?,
            probe: self.probe?,
            readiness: self.readiness?,
            topology: self.topology?,
            gate: self.gate,
            policy: self.policy,
            probe_scheme: self.probe_scheme,
            max_retries: self.max_retries,
            router_reset: self.router_reset,
        })
    }
}

impl Default for DeploySupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
