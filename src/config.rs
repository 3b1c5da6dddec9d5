//! Operator configuration. Every flag can be set through an `RCO_*` environment variable.

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use rco_mesh::{ConvergenceConfig, NodeOptions, ParseMode};

use crate::{
    logging::{parse_level, LoggingConfig},
    reconciler::RequeuePolicy,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "redis-cluster-operator", version, about)]
pub struct OperatorConfig {
    /// Namespace to watch. All namespaces when unset.
    #[arg(long, env = "RCO_NAMESPACE")]
    pub namespace: Option<String>,

    /// Deadline for each connect, membership query and meet.
    #[arg(long, env = "RCO_NODE_TIMEOUT_MS", default_value_t = 5_000)]
    pub node_timeout_ms: u64,

    /// Fail a membership query on the first malformed line instead of skipping it.
    #[arg(long, env = "RCO_STRICT_PARSING", default_value_t = false)]
    pub strict_parsing: bool,

    /// Convergence passes per reconcile before reporting non-convergence.
    #[arg(long, env = "RCO_MAX_CONVERGENCE_PASSES", default_value_t = 3)]
    pub max_convergence_passes: u32,

    /// Pause between convergence passes, giving gossip time to spread.
    #[arg(long, env = "RCO_PASS_DELAY_MS", default_value_t = 2_000)]
    pub pass_delay_ms: u64,

    #[arg(long, env = "RCO_MAX_CONCURRENT_MEETS", default_value_t = 8)]
    pub max_concurrent_meets: usize,

    /// Requeue delay while instances are still becoming ready.
    #[arg(long, env = "RCO_REQUEUE_NOT_READY_SECS", default_value_t = 10)]
    pub requeue_not_ready_secs: u64,

    /// Requeue delay after a pass that left more than one component.
    #[arg(long, env = "RCO_REQUEUE_NOT_CONVERGED_SECS", default_value_t = 5)]
    pub requeue_not_converged_secs: u64,

    /// Periodic re-check of converged clusters.
    #[arg(long, env = "RCO_RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    /// Requeue delay after the instance group could not be applied.
    #[arg(long, env = "RCO_ORCHESTRATION_RETRY_SECS", default_value_t = 30)]
    pub orchestration_retry_secs: u64,

    #[arg(long, env = "RCO_BACKOFF_INITIAL_MS", default_value_t = 500)]
    pub backoff_initial_ms: u64,

    #[arg(long, env = "RCO_BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Image repository used with the cluster's `version` when no image is given.
    #[arg(long, env = "RCO_IMAGE_REPOSITORY", default_value = "redis")]
    pub image_repository: String,

    #[arg(long, env = "RCO_REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    #[arg(long, env = "RCO_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "RCO_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Also write daily rolling log files here.
    #[arg(long, env = "RCO_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.node_timeout_ms == 0 {
            return Err("node timeout must be greater than 0".to_string());
        }
        if self.max_convergence_passes == 0 {
            return Err("max convergence passes must be greater than 0".to_string());
        }
        if self.max_concurrent_meets == 0 {
            return Err("max concurrent meets must be greater than 0".to_string());
        }
        if self.resync_secs == 0 {
            return Err("resync interval must be greater than 0".to_string());
        }
        if self.backoff_initial_ms == 0 {
            return Err("initial backoff must be greater than 0".to_string());
        }
        if Duration::from_millis(self.backoff_initial_ms) > Duration::from_secs(self.backoff_max_secs)
        {
            return Err("initial backoff must not exceed max backoff".to_string());
        }
        if self.redis_port == 0 || self.redis_port > u16::MAX - 10_000 {
            return Err(format!(
                "redis port {} leaves no room for the cluster bus port",
                self.redis_port
            ));
        }
        if self.image_repository.trim().is_empty() {
            return Err("image repository should not be empty".to_string());
        }
        if let Some(namespace) = &self.namespace {
            if namespace.trim().is_empty() {
                return Err("namespace should not be empty when set".to_string());
            }
        }
        parse_level(&self.log_level)?;
        Ok(())
    }

    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            timeout: Duration::from_millis(self.node_timeout_ms),
            parse_mode: if self.strict_parsing {
                ParseMode::Strict
            } else {
                ParseMode::Lenient
            },
        }
    }

    pub fn convergence(&self) -> ConvergenceConfig {
        ConvergenceConfig {
            max_passes: self.max_convergence_passes,
            pass_delay: Duration::from_millis(self.pass_delay_ms),
            max_concurrent_meets: self.max_concurrent_meets,
        }
    }

    pub fn requeue_policy(&self) -> RequeuePolicy {
        RequeuePolicy {
            not_ready: Duration::from_secs(self.requeue_not_ready_secs),
            not_converged: Duration::from_secs(self.requeue_not_converged_secs),
            resync: Duration::from_secs(self.resync_secs),
            orchestration_retry: Duration::from_secs(self.orchestration_retry_secs),
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
        }
    }

    pub fn logging(&self) -> Result<LoggingConfig, String> {
        Ok(LoggingConfig {
            level: parse_level(&self.log_level)?,
            json: self.log_json,
            log_dir: self.log_dir.clone(),
        })
    }
}
