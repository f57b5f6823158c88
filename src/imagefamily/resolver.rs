//! Launch-template resolution
//!
//! Produces one descriptor per (image, compatible instance types) pair:
//! resolved user data, security groups, system disk, capacity type, and the
//! tag set identifying the owning cluster and NodeClass.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Taint;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error};

use super::family::{family_provider, BootstrapConfig};
use crate::cache::TtlCache;
use crate::crd::{ECSNodeClass, Image, SecurityGroup, SystemDisk};
use crate::ecs::{DescribeAvailableResourceRequest, EcsApi};
use crate::instancetype::InstanceType;
use crate::nodeclaim::{is_unregistered_taint, unregistered_taint, CapacityType, NodeClaim};
use crate::scheduling::Requirements;
use crate::{Error, Result};

/// How long per-type system-disk compatibility stays fresh
pub const SYSTEM_DISK_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Static launch-template parameters shared by every resolved descriptor
#[derive(Clone, Debug, Default)]
pub struct ResolverOptions {
    /// Cluster the node joins
    pub cluster_name: String,
    /// API server endpoint the node connects to
    pub cluster_endpoint: String,
    /// Resolved security groups from the NodeClass status
    pub security_groups: Vec<SecurityGroup>,
    /// Tags stamped on launched resources
    pub tags: BTreeMap<String, String>,
    /// Node labels; excluded from template identity since they churn per
    /// claim
    pub labels: BTreeMap<String, String>,
    /// Owning NodeClass name
    pub node_class_name: String,
}

/// A fully resolved launch-template descriptor
#[derive(Clone, Debug)]
pub struct ResolvedTemplate {
    /// Static parameters
    pub options: ResolverOptions,
    /// Base64 user data for the image family
    pub user_data: String,
    /// Image the template boots
    pub image_id: String,
    /// Instance types compatible with the image
    pub instance_types: Vec<Arc<InstanceType>>,
    /// System disk: NodeClass override or family default
    pub system_disk: Option<SystemDisk>,
    /// Purchase model of the launch this template serves
    pub capacity_type: CapacityType,
}

// Identity view for hashing: node labels and the instance-type list churn
// without changing what the cloud-side template contains, so they stay out.
#[derive(Serialize)]
struct TemplateIdentity<'a> {
    cluster_name: &'a str,
    cluster_endpoint: &'a str,
    security_groups: &'a [SecurityGroup],
    tags: &'a BTreeMap<String, String>,
    node_class_name: &'a str,
    user_data: &'a str,
    image_id: &'a str,
    system_disk: &'a Option<SystemDisk>,
    capacity_type: &'a str,
}

impl ResolvedTemplate {
    /// Content hash identifying this template, stable across field order
    /// and set ordering
    pub fn identity_hash(&self) -> u64 {
        crate::hash::content_hash(&TemplateIdentity {
            cluster_name: &self.options.cluster_name,
            cluster_endpoint: &self.options.cluster_endpoint,
            security_groups: &self.options.security_groups,
            tags: &self.options.tags,
            node_class_name: &self.options.node_class_name,
            user_data: &self.user_data,
            image_id: &self.image_id,
            system_disk: &self.system_disk,
            capacity_type: self.capacity_type.as_str(),
        })
    }
}

/// Map each image to the instance types whose requirements it satisfies
///
/// Each instance type lands on at most one image: the first compatible one
/// in status order (newest first).
pub fn map_to_instance_types(
    instance_types: &[Arc<InstanceType>],
    images: &[Image],
) -> HashMap<String, Vec<Arc<InstanceType>>> {
    let mut mapped: HashMap<String, Vec<Arc<InstanceType>>> = HashMap::new();
    for instance_type in instance_types {
        for image in images {
            let image_requirements = Requirements::from_node_selector(&image.requirements);
            if instance_type.requirements.compatible(&image_requirements) {
                mapped
                    .entry(image.id.clone())
                    .or_default()
                    .push(instance_type.clone());
                break;
            }
        }
    }
    mapped
}

/// Fills in dynamic launch-template parameters per image
pub struct Resolver {
    region: String,
    ecs: Arc<dyn EcsApi>,
    // instance type -> compatible system-disk categories
    system_disk_cache: Mutex<TtlCache<BTreeSet<String>>>,
}

impl Resolver {
    /// Create a resolver for a region
    pub fn new(region: impl Into<String>, ecs: Arc<dyn EcsApi>) -> Self {
        Self {
            region: region.into(),
            ecs,
            system_disk_cache: Mutex::new(TtlCache::new(SYSTEM_DISK_CACHE_TTL)),
        }
    }

    /// Resolve launch templates for the given instance types
    ///
    /// Multiple descriptors come back when different images serve different
    /// instance types (e.g. a GPU image next to the standard one).
    pub async fn resolve(
        &self,
        node_class: &ECSNodeClass,
        node_claim: &NodeClaim,
        instance_types: &[Arc<InstanceType>],
        capacity_type: CapacityType,
        options: &ResolverOptions,
    ) -> Result<Vec<ResolvedTemplate>> {
        let images: &[Image] = node_class
            .status
            .as_ref()
            .map(|s| s.images.as_slice())
            .unwrap_or_default();
        if images.is_empty() {
            return Err(Error::insufficient_capacity(
                "no images exist given constraints",
            ));
        }

        let instance_types = self
            .filter_instance_types_by_system_disk(node_class, instance_types)
            .await;
        if instance_types.is_empty() {
            return Err(Error::insufficient_capacity(
                "no instance types exist given system disk",
            ));
        }

        let mapped = map_to_instance_types(&instance_types, images);
        if mapped.is_empty() {
            let ids: Vec<&str> = images.iter().map(|i| i.id.as_str()).collect();
            return Err(Error::insufficient_capacity(format!(
                "no instance types satisfy requirements of images {ids:?}"
            )));
        }

        let family = family_provider(node_class.image_family());
        let kubelet_config = node_class
            .spec
            .kubelet_configuration
            .clone()
            .unwrap_or_default();

        // pods must not land before kubelet registers, so the unregistered
        // taint always rides along
        let mut taints: Vec<Taint> = node_claim
            .spec
            .taints
            .iter()
            .chain(node_claim.spec.startup_taints.iter())
            .cloned()
            .collect();
        if !taints.iter().any(is_unregistered_taint) {
            taints.push(unregistered_taint());
        }

        let mut resolved = Vec::with_capacity(mapped.len());
        for (image_id, image_instance_types) in mapped {
            let user_data = family.user_data(&BootstrapConfig {
                cluster_name: &options.cluster_name,
                cluster_endpoint: &options.cluster_endpoint,
                kubelet_config: &kubelet_config,
                taints: &taints,
                labels: &options.labels,
                custom_user_data: node_class.spec.user_data.as_deref(),
            });
            let system_disk = node_class
                .spec
                .system_disk
                .clone()
                .or_else(|| Some(family.default_system_disk()));
            resolved.push(ResolvedTemplate {
                options: options.clone(),
                user_data,
                image_id,
                instance_types: image_instance_types,
                system_disk,
                capacity_type,
            });
        }
        Ok(resolved)
    }

    // Keeps only types that can mount the requested system-disk category.
    // Compatibility comes from Describe-Available-Resource and is cached per
    // type; a describe failure skips the type rather than failing the launch.
    async fn filter_instance_types_by_system_disk(
        &self,
        node_class: &ECSNodeClass,
        instance_types: &[Arc<InstanceType>],
    ) -> Vec<Arc<InstanceType>> {
        let Some(expected_category) = node_class
            .spec
            .system_disk
            .as_ref()
            .and_then(|d| d.category.clone())
        else {
            return instance_types.to_vec();
        };

        let cache = self.system_disk_cache.lock().await;
        let mut result = Vec::with_capacity(instance_types.len());
        for instance_type in instance_types {
            let categories = match cache.get(&instance_type.name) {
                Some(categories) => categories,
                None => {
                    let categories = match self.describe_available_system_disks(&instance_type.name).await {
                        Ok(categories) => categories,
                        Err(err) => {
                            error!(
                                instance_type = %instance_type.name,
                                error = %err,
                                "describe available system disk failed"
                            );
                            continue;
                        }
                    };
                    cache.insert(&instance_type.name, categories.clone());
                    categories
                }
            };
            if categories.contains(&expected_category) {
                result.push(instance_type.clone());
            } else {
                debug!(
                    instance_type = %instance_type.name,
                    node_class = node_class.name(),
                    category = %expected_category,
                    "instance type incompatible with system disk"
                );
            }
        }
        result
    }

    async fn describe_available_system_disks(
        &self,
        instance_type: &str,
    ) -> Result<BTreeSet<String>> {
        let response = self
            .ecs
            .describe_available_resource(DescribeAvailableResourceRequest {
                region_id: self.region.clone(),
                destination_resource: "SystemDisk".to_string(),
                instance_type: Some(instance_type.to_string()),
            })
            .await?;

        let mut categories = BTreeSet::new();
        for zone in &response.available_zones {
            if zone.status != "Available" || zone.status_category != "WithStock" {
                continue;
            }
            for resource in &zone.available_resources {
                for supported in &resource.supported_resources {
                    if supported.status == "Available" && !supported.value.is_empty() {
                        categories.insert(supported.value.clone());
                    }
                }
            }
        }
        Ok(categories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ECSNodeClassSpec, ECSNodeClassStatus, ImageSelectorTerm, KubeletConfiguration};
    use crate::ecs::{
        AvailableResource, AvailableZone, DescribeAvailableResourceResponse, InstanceTypeData,
        MockEcsApi, SupportedResource,
    };
    use crate::instancetype::types::new_instance_type;
    use crate::scheduling::NodeSelectorRequirement;

    fn instance_type(name: &str, arch: &str) -> Arc<InstanceType> {
        Arc::new(
            new_instance_type(
                &InstanceTypeData {
                    instance_type_id: name.to_string(),
                    cpu_core_count: 2,
                    cpu_architecture: arch.to_string(),
                    memory_size: 8.0,
                    ..Default::default()
                },
                &KubeletConfiguration::default(),
                "cn-beijing",
                0.075,
                vec![],
            )
            .unwrap(),
        )
    }

    fn image(id: &str, arch: &str) -> Image {
        Image {
            id: id.to_string(),
            name: format!("{id}-name"),
            requirements: vec![NodeSelectorRequirement {
                key: crate::crd::LABEL_ARCH.to_string(),
                operator: "In".to_string(),
                values: vec![arch.to_string()],
                min_values: None,
            }],
        }
    }

    fn node_class_with_images(images: Vec<Image>) -> ECSNodeClass {
        let mut nc = ECSNodeClass::new(
            "default",
            ECSNodeClassSpec {
                image_selector_terms: vec![ImageSelectorTerm {
                    alias: "AlibabaCloudLinux3@latest".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        nc.status = Some(ECSNodeClassStatus {
            images,
            ..Default::default()
        });
        nc
    }

    #[test]
    fn images_map_to_compatible_types_only() {
        let types = vec![
            instance_type("ecs.g7.large", "X86"),
            instance_type("ecs.g8y.large", "ARM"),
        ];
        let images = vec![image("m-amd", "amd64"), image("m-arm", "arm64")];
        let mapped = map_to_instance_types(&types, &images);
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped.get("m-amd").unwrap()[0].name, "ecs.g7.large");
        assert_eq!(mapped.get("m-arm").unwrap()[0].name, "ecs.g8y.large");
    }

    #[test]
    fn each_type_lands_on_first_compatible_image() {
        let types = vec![instance_type("ecs.g7.large", "X86")];
        // both images are amd64-compatible; the first (newest) wins
        let images = vec![image("m-newer", "amd64"), image("m-older", "amd64")];
        let mapped = map_to_instance_types(&types, &images);
        assert_eq!(mapped.len(), 1);
        assert!(mapped.contains_key("m-newer"));
    }

    #[tokio::test]
    async fn resolve_requires_images_in_status() {
        let resolver = Resolver::new("cn-beijing", Arc::new(MockEcsApi::new()));
        let nc = node_class_with_images(vec![]);
        let err = resolver
            .resolve(
                &nc,
                &NodeClaim::default(),
                &[instance_type("ecs.g7.large", "X86")],
                CapacityType::OnDemand,
                &ResolverOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientCapacity(_)));
    }

    #[tokio::test]
    async fn resolve_injects_unregistered_taint() {
        let resolver = Resolver::new("cn-beijing", Arc::new(MockEcsApi::new()));
        let nc = node_class_with_images(vec![image("m-amd", "amd64")]);
        let templates = resolver
            .resolve(
                &nc,
                &NodeClaim::default(),
                &[instance_type("ecs.g7.large", "X86")],
                CapacityType::Spot,
                &ResolverOptions {
                    cluster_name: "prod".to_string(),
                    cluster_endpoint: "https://10.0.0.1:6443".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(templates.len(), 1);
        let template = &templates[0];
        assert_eq!(template.image_id, "m-amd");
        assert_eq!(template.capacity_type, CapacityType::Spot);
        // family default disk fills in when the spec has none
        assert!(template.system_disk.is_some());

        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let script =
            String::from_utf8(STANDARD.decode(&template.user_data).unwrap()).unwrap();
        assert!(script.contains("karpenter.sh/unregistered"));
    }

    #[tokio::test]
    async fn system_disk_filter_drops_incompatible_types() {
        let mut ecs = MockEcsApi::new();
        ecs.expect_describe_available_resource().returning(|req| {
            let categories: Vec<&str> = if req.instance_type.as_deref() == Some("ecs.g7.large") {
                vec!["cloud_essd", "cloud_ssd"]
            } else {
                vec!["cloud_efficiency"]
            };
            Ok(DescribeAvailableResourceResponse {
                available_zones: vec![AvailableZone {
                    zone_id: "cn-beijing-a".to_string(),
                    status: "Available".to_string(),
                    status_category: "WithStock".to_string(),
                    available_resources: vec![AvailableResource {
                        supported_resources: categories
                            .into_iter()
                            .map(|c| SupportedResource {
                                value: c.to_string(),
                                status: "Available".to_string(),
                                status_category: "WithStock".to_string(),
                            })
                            .collect(),
                    }],
                }],
            })
        });
        let resolver = Resolver::new("cn-beijing", Arc::new(ecs));
        let mut nc = node_class_with_images(vec![image("m-amd", "amd64")]);
        nc.spec.system_disk = Some(SystemDisk {
            category: Some("cloud_essd".to_string()),
            ..Default::default()
        });

        let templates = resolver
            .resolve(
                &nc,
                &NodeClaim::default(),
                &[
                    instance_type("ecs.g7.large", "X86"),
                    instance_type("ecs.c6.large", "X86"),
                ],
                CapacityType::OnDemand,
                &ResolverOptions::default(),
            )
            .await
            .unwrap();
        let types: Vec<&str> = templates[0]
            .instance_types
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(types, vec!["ecs.g7.large"]);
    }

    #[test]
    fn identity_hash_ignores_labels_and_instance_types() {
        let base = ResolvedTemplate {
            options: ResolverOptions {
                cluster_name: "prod".to_string(),
                security_groups: vec![SecurityGroup {
                    id: "sg-1".to_string(),
                    name: "node-sg".to_string(),
                }],
                ..Default::default()
            },
            user_data: "dXNlcmRhdGE=".to_string(),
            image_id: "m-amd".to_string(),
            instance_types: vec![],
            system_disk: None,
            capacity_type: CapacityType::Spot,
        };
        let mut with_labels = base.clone();
        with_labels.options.labels =
            BTreeMap::from([("nodepool".to_string(), "general".to_string())]);
        with_labels.instance_types = vec![instance_type("ecs.g7.large", "X86")];
        assert_eq!(base.identity_hash(), with_labels.identity_hash());

        let mut different = base.clone();
        different.image_id = "m-other".to_string();
        assert_ne!(base.identity_hash(), different.identity_hash());
    }
}
