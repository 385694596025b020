//! Readiness signalling between the supervisor and a launched instance
//!
//! The on-disk sentinel is the compatibility boundary: a zero-byte file
//! whose existence means "not ready yet". The supervisor arms it right
//! before starting an instance and the instance removes it. Internally the
//! wait loop only sees a [`ReadinessSource`] and returns a typed
//! [`Readiness`] result.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Something the supervisor can arm before start and poll afterwards
#[async_trait]
pub trait ReadinessSource: Send + Sync {
    /// Mark the instance as not ready
    async fn arm(&self) -> std::io::Result<()>;

    /// Whether the instance has reported itself ready
    async fn is_ready(&self) -> bool;
}

/// Existence-based readiness marker file
#[derive(Debug, Clone)]
pub struct Sentinel {
    path: PathBuf,
}

impl Sentinel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_armed(&self) -> bool {
        self.path.exists()
    }

    /// Remove the marker; removing an absent marker is not an error
    pub async fn clear(&self) -> std::io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ReadinessSource for Sentinel {
    async fn arm(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, b"").await
    }

    async fn is_ready(&self) -> bool {
        !tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }
}

/// In-process readiness flag resolved through a [`ReadyHandle`]
#[derive(Debug)]
pub struct ChannelReadiness {
    tx: watch::Sender<bool>,
}

/// Handle given to the instance side to report readiness
#[derive(Debug, Clone)]
pub struct ReadyHandle {
    tx: watch::Sender<bool>,
}

impl ReadyHandle {
    pub fn ready(&self) {
        self.tx.send_replace(true);
    }
}

impl ChannelReadiness {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn handle(&self) -> ReadyHandle {
        ReadyHandle {
            tx: self.tx.clone(),
        }
    }
}

impl Default for ChannelReadiness {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadinessSource for ChannelReadiness {
    async fn arm(&self) -> std::io::Result<()> {
        self.tx.send_replace(false);
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Poll cadence and bounds of a readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub interval: Duration,
    /// Floor enforced even when the instance reports ready earlier
    pub min_wait: Duration,
    /// Ceiling after which the wait gives up
    pub max_wait: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            min_wait: Duration::from_secs(20),
            max_wait: Duration::from_secs(300),
        }
    }
}

impl From<&crate::config::SupervisorConfig> for WaitPolicy {
    fn from(config: &crate::config::SupervisorConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            min_wait: config.min_wait(),
            max_wait: config.max_wait(),
        }
    }
}

/// Result of a readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { waited: Duration },
    TimedOut { waited: Duration },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }

    pub fn waited(&self) -> Duration {
        match self {
            Readiness::Ready { waited } | Readiness::TimedOut { waited } => *waited,
        }
    }
}

/// Poll `source` until it is ready and the floor has passed, or the ceiling hits.
///
/// Elapsed time is counted in poll ticks, so a wait always terminates after
/// at most `max_wait / interval + 1` polls. Readiness is checked on the
/// ceiling tick too, which lets `min_wait == max_wait` succeed.
pub async fn wait_until_ready(source: &dyn ReadinessSource, policy: WaitPolicy) -> Readiness {
    let mut waited = Duration::ZERO;
    loop {
        tokio::time::sleep(policy.interval).await;
        let ready = source.is_ready().await;
        debug!(waited_ms = waited.as_millis() as u64, ready, "Readiness poll");

        if waited >= policy.min_wait && ready {
            return Readiness::Ready { waited };
        }
        if waited >= policy.max_wait {
            return Readiness::TimedOut { waited };
        }
        waited += policy.interval;
    }
}
