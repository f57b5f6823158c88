//! Image families: curated image lines with bootstrap knowledge
//!
//! A family knows three things: how to find its images, how to render the
//! user data that attaches a node to the cluster, and what system disk to
//! use when the NodeClass does not say.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Taint;
use once_cell::sync::Lazy;
use regex::Regex;

use super::DescribeImageQuery;
use crate::crd::{ImageFamily, KubeletConfiguration, SystemDisk};
use crate::ecs::DescribeImagesRequest;

// Published image names look like aliyun_3_x64_20G_alibase_20240819.vhd
static ALIYUN3_IMAGE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"aliyun_3_.*_alibase_.*\.vhd").unwrap());
static ALIYUN2_IMAGE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"aliyun_2_.*G_alibase_.*vhd").unwrap());

/// Everything a family needs to render node user data
pub struct BootstrapConfig<'a> {
    /// Cluster name nodes register with
    pub cluster_name: &'a str,
    /// API server endpoint nodes connect to
    pub cluster_endpoint: &'a str,
    /// Kubelet configuration from the NodeClass
    pub kubelet_config: &'a KubeletConfiguration,
    /// Taints the node registers with
    pub taints: &'a [Taint],
    /// Labels the node registers with
    pub labels: &'a std::collections::BTreeMap<String, String>,
    /// NodeClass user data to merge
    pub custom_user_data: Option<&'a str>,
}

/// Family-specific image discovery and bootstrap behavior
pub trait ImageFamilyProvider: Send + Sync {
    /// Queries finding this family's images for a cluster version
    fn describe_image_queries(
        &self,
        kubernetes_version: &str,
        image_version: &str,
    ) -> Vec<DescribeImageQuery>;

    /// Base64 user data attaching a node to the cluster
    fn user_data(&self, config: &BootstrapConfig<'_>) -> String;

    /// System disk used when the NodeClass does not override it
    fn default_system_disk(&self) -> SystemDisk;
}

/// The provider for a parsed family
pub fn family_provider(family: ImageFamily) -> Box<dyn ImageFamilyProvider> {
    match family {
        ImageFamily::AlibabaCloudLinux3 => Box::new(Aliyun3),
        ImageFamily::AlibabaCloudLinux2 => Box::new(Aliyun2),
        ImageFamily::Custom => Box::new(Custom),
    }
}

fn default_system_disk() -> SystemDisk {
    SystemDisk {
        category: Some("cloud_essd".to_string()),
        size: Some(40),
        performance_level: Some("PL0".to_string()),
        ..Default::default()
    }
}

// Renders the attach-node call the ACK bootstrap path expects. The token is
// resolved on the node from the bootstrap-token secret projected into user
// data at attach time.
fn attach_node_script(config: &BootstrapConfig<'_>) -> String {
    let mut flags = vec![format!("--endpoint {}", config.cluster_endpoint)];
    if !config.labels.is_empty() {
        let labels: Vec<String> = config
            .labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        flags.push(format!("--labels {}", labels.join(",")));
    }
    if !config.taints.is_empty() {
        let taints: Vec<String> = config
            .taints
            .iter()
            .map(|t| {
                let value = t.value.as_deref().unwrap_or_default();
                format!("{}={}:{}", t.key, value, t.effect)
            })
            .collect();
        flags.push(format!("--taints {}", taints.join(",")));
    }
    if !config.kubelet_config.cluster_dns.is_empty() {
        flags.push(format!(
            "--cluster-dns {}",
            config.kubelet_config.cluster_dns.join(",")
        ));
    }
    if let Some(max_pods) = config.kubelet_config.max_pods {
        flags.push(format!("--max-pods {max_pods}"));
    }

    let mut script = format!(
        "#!/bin/bash\ncurl http://aliacs-k8s.oss-internal.aliyuncs.com/public/pkg/run/attach/attach_node.sh | bash -s -- --cluster-id {} {}\n",
        config.cluster_name,
        flags.join(" "),
    );
    if let Some(custom) = config.custom_user_data {
        if !custom.is_empty() {
            script.push_str(custom);
            script.push('\n');
        }
    }
    script
}

struct Aliyun3;

impl ImageFamilyProvider for Aliyun3 {
    fn describe_image_queries(
        &self,
        _kubernetes_version: &str,
        _image_version: &str,
    ) -> Vec<DescribeImageQuery> {
        vec![DescribeImageQuery {
            request: DescribeImagesRequest {
                image_owner_alias: Some("system".to_string()),
                is_public: Some(true),
                os_type: Some("linux".to_string()),
                action_type: Some("CreateEcs".to_string()),
                ..Default::default()
            },
            known_requirements: Vec::new(),
            name_pattern: Some(ALIYUN3_IMAGE_NAME.clone()),
        }]
    }

    fn user_data(&self, config: &BootstrapConfig<'_>) -> String {
        STANDARD.encode(attach_node_script(config))
    }

    fn default_system_disk(&self) -> SystemDisk {
        default_system_disk()
    }
}

struct Aliyun2;

impl ImageFamilyProvider for Aliyun2 {
    fn describe_image_queries(
        &self,
        _kubernetes_version: &str,
        _image_version: &str,
    ) -> Vec<DescribeImageQuery> {
        vec![DescribeImageQuery {
            request: DescribeImagesRequest {
                image_owner_alias: Some("system".to_string()),
                is_public: Some(true),
                os_type: Some("linux".to_string()),
                action_type: Some("CreateEcs".to_string()),
                ..Default::default()
            },
            known_requirements: Vec::new(),
            name_pattern: Some(ALIYUN2_IMAGE_NAME.clone()),
        }]
    }

    fn user_data(&self, config: &BootstrapConfig<'_>) -> String {
        STANDARD.encode(attach_node_script(config))
    }

    fn default_system_disk(&self) -> SystemDisk {
        default_system_disk()
    }
}

struct Custom;

impl ImageFamilyProvider for Custom {
    fn describe_image_queries(
        &self,
        _kubernetes_version: &str,
        _image_version: &str,
    ) -> Vec<DescribeImageQuery> {
        // custom images are selected by explicit terms, never by alias
        Vec::new()
    }

    fn user_data(&self, config: &BootstrapConfig<'_>) -> String {
        STANDARD.encode(config.custom_user_data.unwrap_or_default())
    }

    fn default_system_disk(&self) -> SystemDisk {
        default_system_disk()
    }
}
