//! Kubernetes version discovery
//!
//! Image aliases resolve against the control-plane version, which changes
//! rarely; the resolved value is cached with its own TTL.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::cache::TtlCache;
use crate::Result;

/// How long a resolved control-plane version stays fresh
pub const KUBERNETES_VERSION_TTL: Duration = Duration::from_secs(15 * 60);

/// Source of the cluster's kubernetes version
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubernetesVersionProvider: Send + Sync {
    /// The control-plane version as `major.minor`
    async fn get(&self) -> Result<String>;
}

/// Version provider backed by the apiserver discovery endpoint
pub struct ApiServerVersionProvider {
    client: kube::Client,
    cache: TtlCache<String>,
}

impl ApiServerVersionProvider {
    /// Create a provider using the given client
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            cache: TtlCache::new(KUBERNETES_VERSION_TTL),
        }
    }
}

#[async_trait]
impl KubernetesVersionProvider for ApiServerVersionProvider {
    async fn get(&self) -> Result<String> {
        if let Some(version) = self.cache.get("kubernetes-version") {
            return Ok(version);
        }
        let info = self.client.apiserver_version().await?;
        // the minor may carry a vendor suffix like "31+"
        let minor: String = info.minor.chars().filter(|c| c.is_ascii_digit()).collect();
        let version = format!("{}.{}", info.major, minor);
        debug!(version = %version, "discovered kubernetes version");
        self.cache.insert("kubernetes-version", version.clone());
        Ok(version)
    }
}
