use std::{net::Ipv6Addr, path::PathBuf, time::Duration};

use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use serde::Deserialize;

use crate::{
    labels::{
        LabelRequirement, LabelRules, RESULT_LABEL_KEY, RESULT_LABEL_VALUE, TARGET_LABEL_KEY,
        TARGET_LABEL_VALUE,
    },
    queue::ExponentialBackoff,
};

const ENV_PREFIX: &str = "CONF_";
const KUBECONFIG_ENTRY_NAME: &str = "mycontroller";

fn default_workers() -> usize {
    1
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

fn default_target_label() -> LabelRequirement {
    LabelRequirement::new(TARGET_LABEL_KEY, TARGET_LABEL_VALUE)
}

fn default_result_label() -> LabelRequirement {
    LabelRequirement::new(RESULT_LABEL_KEY, RESULT_LABEL_VALUE)
}

fn default_field_manager() -> String {
    "mycontroller".to_string()
}

fn default_lease_name() -> String {
    "mycontroller".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to build kubeconfig from connection settings: {0}")]
    BuildKubeconfig(#[source] serde_json::Error),
    #[error("failed to load kubeconfig: {0}")]
    LoadKubeconfig(#[from] KubeconfigError),
    #[error("failed to infer Kubernetes config: {0}")]
    Infer(#[from] kube::config::InferConfigError),
}

#[derive(Deserialize, Clone, Debug)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers. Workers share one task, so they
    /// overlap on API I/O rather than running on separate threads.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Delay before the first retry of a failed key
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Upper bound of the retry delay
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Give up if the pod cache is not filled within this many seconds.
    /// Waits until shutdown when unset.
    pub sync_timeout_secs: Option<u64>,

    /// Namespace to watch. All namespaces when unset.
    pub namespace: Option<String>,

    /// Label marking pods the controller should process, `key=value`
    #[serde(default = "default_target_label")]
    pub target_label: LabelRequirement,
    /// Label the controller puts on processed pods, `key=value`
    #[serde(default = "default_result_label")]
    pub result_label: LabelRequirement,

    /// Field manager recorded on pod updates
    #[serde(default = "default_field_manager")]
    pub field_manager: String,

    /// Only reconcile while holding the lease
    #[serde(default)]
    pub leader_election: bool,
    #[serde(default = "default_lease_name")]
    pub lease_name: String,
    /// Namespace of the lease. The client's default namespace when unset.
    pub lease_namespace: Option<String>,
}

impl ControllerConfig {
    pub fn try_from_env() -> Result<Self, envy::Error> {
        envy::prefixed(ENV_PREFIX).from_env()
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        self.sync_timeout_secs.map(Duration::from_secs)
    }

    pub fn label_rules(&self) -> LabelRules {
        LabelRules::new(self.target_label.clone(), self.result_label.clone())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            sync_timeout_secs: None,
            namespace: None,
            target_label: default_target_label(),
            result_label: default_result_label(),
            field_manager: default_field_manager(),
            leader_election: false,
            lease_name: default_lease_name(),
            lease_namespace: None,
        }
    }
}

/// How to reach the API server.
///
/// With `host` unset the usual discovery applies (in-cluster service
/// account, then `KUBECONFIG`/`~/.kube/config`).
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ConnectionConfig {
    /// CA certificate file for verifying the API server
    pub ca_file: Option<PathBuf>,
    /// Client certificate file
    pub cert_file: Option<PathBuf>,
    /// Client key file
    pub key_file: Option<PathBuf>,
    /// API server host or IP
    pub host: Option<String>,
    /// API server port
    pub port: Option<u16>,
}

impl ConnectionConfig {
    pub fn try_from_env() -> Result<Self, envy::Error> {
        envy::prefixed(ENV_PREFIX).from_env()
    }

    pub fn server_url(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        if host.starts_with("https://") || host.starts_with("http://") {
            return Some(host.to_string());
        }
        // IPv6 literals need brackets once a port follows
        let host = if host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        Some(match self.port {
            Some(port) => format!("https://{}:{}", host, port),
            None => format!("https://{}", host),
        })
    }

    /// Kubeconfig equivalent of the explicit connection settings, if a host is set.
    pub fn kubeconfig(&self) -> Result<Option<Kubeconfig>, Error> {
        let Some(server) = self.server_url() else {
            return Ok(None);
        };
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());

        let kubeconfig = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{
                "name": KUBECONFIG_ENTRY_NAME,
                "cluster": {
                    "server": server,
                    "certificate-authority": path(&self.ca_file),
                },
            }],
            "users": [{
                "name": KUBECONFIG_ENTRY_NAME,
                "user": {
                    "client-certificate": path(&self.cert_file),
                    "client-key": path(&self.key_file),
                },
            }],
            "contexts": [{
                "name": KUBECONFIG_ENTRY_NAME,
                "context": {
                    "cluster": KUBECONFIG_ENTRY_NAME,
                    "user": KUBECONFIG_ENTRY_NAME,
                },
            }],
            "current-context": KUBECONFIG_ENTRY_NAME,
        });
        serde_json::from_value(kubeconfig)
            .map(Some)
            .map_err(Error::BuildKubeconfig)
    }

    pub async fn kube_config(&self) -> Result<kube::Config, Error> {
        match self.kubeconfig()? {
            Some(kubeconfig) => {
                Ok(kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await?)
            }
            None => Ok(kube::Config::infer().await?),
        }
    }
}
