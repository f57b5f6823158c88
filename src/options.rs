//! Boot-time options shared by every provider
//!
//! Options are resolved once at startup, validated, and passed around as an
//! immutable [`std::sync::Arc`]. Nothing mutates them after boot.

use crate::{Error, Result};

/// Process-wide configuration for the cloud provider
#[derive(Clone, Debug)]
pub struct Options {
    /// The kubernetes cluster name, used for resource discovery and tagging
    pub cluster_name: String,
    /// External cluster endpoint for new nodes to connect with
    pub cluster_endpoint: String,
    /// Cluster CA bundle for node TLS bootstrap, if not taken from the
    /// controller's own TLS configuration
    pub cluster_ca_bundle: Option<String>,
    /// Fraction of reported VM memory withheld from capacity to account for
    /// hypervisor overhead
    pub vm_memory_overhead_percent: f64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            cluster_endpoint: String::new(),
            cluster_ca_bundle: None,
            vm_memory_overhead_percent: 0.075,
        }
    }
}

impl Options {
    /// Build options from the process environment
    ///
    /// Reads `CLUSTER_NAME`, `CLUSTER_ENDPOINT`, `CLUSTER_CA_BUNDLE`, and
    /// `VM_MEMORY_OVERHEAD_PERCENT`, then validates the result.
    pub fn from_env() -> Result<Self> {
        let opts = Self {
            cluster_name: std::env::var("CLUSTER_NAME").unwrap_or_default(),
            cluster_endpoint: std::env::var("CLUSTER_ENDPOINT").unwrap_or_default(),
            cluster_ca_bundle: std::env::var("CLUSTER_CA_BUNDLE").ok().filter(|v| !v.is_empty()),
            vm_memory_overhead_percent: std::env::var("VM_MEMORY_OVERHEAD_PERCENT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.075),
        };
        opts.validate()?;
        Ok(opts)
    }

    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(Error::validation("missing field, cluster-name"));
        }
        if !self.cluster_endpoint.is_empty() {
            // the endpoint must be an absolute URL with a host
            let valid = self
                .cluster_endpoint
                .strip_prefix("https://")
                .or_else(|| self.cluster_endpoint.strip_prefix("http://"))
                .map(|rest| !rest.is_empty() && !rest.starts_with('/'))
                .unwrap_or(false);
            if !valid {
                return Err(Error::validation(format!(
                    "{:?} is not a valid cluster-endpoint URL",
                    self.cluster_endpoint
                )));
            }
        }
        if !(0.0..1.0).contains(&self.vm_memory_overhead_percent) {
            return Err(Error::validation(format!(
                "vm-memory-overhead-percent {} must be within [0.0, 1.0)",
                self.vm_memory_overhead_percent
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Options {
        Options {
            cluster_name: "prod-cn".to_string(),
            cluster_endpoint: "https://10.0.0.1:6443".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn cluster_name_is_required() {
        let mut opts = valid();
        opts.cluster_name.clear();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn endpoint_must_be_absolute_url() {
        let mut opts = valid();
        opts.cluster_endpoint = "10.0.0.1:6443".to_string();
        assert!(opts.validate().is_err());

        opts.cluster_endpoint = "https://".to_string();
        assert!(opts.validate().is_err());

        // empty endpoint is allowed, discovery fills it later
        opts.cluster_endpoint.clear();
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn memory_overhead_bounds() {
        let mut opts = valid();
        opts.vm_memory_overhead_percent = 1.0;
        assert!(opts.validate().is_err());
        opts.vm_memory_overhead_percent = 0.0;
        assert!(opts.validate().is_ok());
    }
}
