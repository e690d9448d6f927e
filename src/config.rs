//! Operator configuration read from the environment

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::store::BackupPolicy;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Where resources are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Custom resources on the Kubernetes API server
    Kube,
    /// In-process, lost on restart
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    pub namespace: String,
    pub store_backend: StoreBackend,
    pub backup_dir: PathBuf,
    pub backup_policy: BackupPolicy,
    pub job_timeout: Duration,
    /// Template repository cloned for every provisioning run
    pub template_repo: String,
    pub workdir: PathBuf,
    pub provision_token: Option<String>,
    pub certificate_arn: Option<String>,
    pub root_domain: Option<String>,
    pub health_addr: SocketAddr,
}

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            store_backend: StoreBackend::Kube,
            backup_dir: PathBuf::from("/var/lib/fleet-operator/backups"),
            backup_policy: BackupPolicy::default(),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            template_repo: String::new(),
            workdir: PathBuf::from("/tmp/fleet-operator"),
            provision_token: None,
            certificate_arn: None,
            root_domain: None,
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from `lookup`; unset or empty variables keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(namespace) = get("FLEET_NAMESPACE") {
            config.namespace = namespace;
        }

        if let Some(backend) = get("FLEET_STORE_BACKEND") {
            config.store_backend = match backend.to_lowercase().as_str() {
                "kube" => StoreBackend::Kube,
                "memory" => StoreBackend::Memory,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "FLEET_STORE_BACKEND",
                        value: backend,
                        reason: "expected kube or memory".to_string(),
                    });
                }
            };
        }

        if let Some(dir) = get("FLEET_BACKUP_DIR") {
            config.backup_dir = PathBuf::from(dir);
        }
        if let Some(secs) = seconds(&get, "FLEET_BACKUP_INTERVAL_SECS")? {
            config.backup_policy.interval = secs;
        }
        if let Some(secs) = seconds(&get, "FLEET_BACKUP_RETRY_SECS")? {
            config.backup_policy.retry_interval = secs;
        }
        if let Some(secs) = seconds(&get, "FLEET_JOB_TIMEOUT_SECS")? {
            config.job_timeout = secs;
        }

        if let Some(repo) = get("FLEET_TEMPLATE_REPO") {
            config.template_repo = repo;
        }
        if let Some(dir) = get("FLEET_WORKDIR") {
            config.workdir = PathBuf::from(dir);
        }
        config.provision_token = get("FLEET_PROVISION_TOKEN");
        config.certificate_arn = get("CERTIFICATE_ARN");
        config.root_domain = get("ROOT_DOMAIN");

        if let Some(addr) = get("FLEET_HEALTH_ADDR") {
            config.health_addr = addr.parse().map_err(|e: std::net::AddrParseError| {
                ConfigError::Invalid {
                    key: "FLEET_HEALTH_ADDR",
                    value: addr.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        Ok(config)
    }
}

fn seconds(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    let Some(value) = get(key) else {
        return Ok(None);
    };
    match value.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            key,
            value,
            reason: "must be greater than zero".to_string(),
        }),
        Ok(secs) => Ok(Some(Duration::from_secs(secs))),
        Err(e) => Err(ConfigError::Invalid {
            key,
            value,
            reason: e.to_string(),
        }),
    }
}
