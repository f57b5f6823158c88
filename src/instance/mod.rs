//! The launch pipeline
//!
//! Filters candidate instance types against the NodeClaim, decides
//! spot-vs-on-demand, resolves launch templates, builds the instant
//! auto-provisioning group, and projects the launched instance back into an
//! internal record. Also wraps get/list/delete/tag of ECS instances.

pub mod types;

pub use types::{Instance, InstanceStatus};

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::cache::UnavailableOfferings;
use crate::crd::{self, ECSNodeClass};
use crate::ecs::{
    AddTagsRequest, CreateAutoProvisioningGroupRequest, DeleteInstanceRequest,
    DescribeInstancesRequest, EcsApi, LaunchConfiguration, LaunchTemplateConfig,
    SystemDiskConfig, Tag,
};
use crate::instancetype::InstanceType;
use crate::launchtemplate::{LaunchTemplate, LaunchTemplateProvider};
use crate::nodeclaim::{CapacityType, NodeClaim};
use crate::options::Options;
use crate::scheduling::{Requirement, Requirements};
use crate::vswitch::VSwitchProvider;
use crate::{Error, Result};

// falling back to on-demand without flexibility risks insufficient capacity
const INSTANCE_TYPE_FLEXIBILITY_THRESHOLD: usize = 5;
const MAX_INSTANCE_TYPES: usize = 20;

/// Creates, queries, and retires ECS instances
pub struct InstanceProvider {
    region: String,
    ecs: Arc<dyn EcsApi>,
    options: Arc<Options>,
    launch_templates: Arc<LaunchTemplateProvider>,
    vswitch: Arc<VSwitchProvider>,
    unavailable: Arc<UnavailableOfferings>,
}

impl InstanceProvider {
    /// Create a provider wiring in launch templates, vswitches, and the
    /// unavailable-offerings cache
    pub fn new(
        region: impl Into<String>,
        ecs: Arc<dyn EcsApi>,
        options: Arc<Options>,
        launch_templates: Arc<LaunchTemplateProvider>,
        vswitch: Arc<VSwitchProvider>,
        unavailable: Arc<UnavailableOfferings>,
    ) -> Self {
        Self {
            region: region.into(),
            ecs,
            options,
            launch_templates,
            vswitch,
            unavailable,
        }
    }

    /// Launch one instance satisfying the NodeClaim
    pub async fn create(
        &self,
        node_class: &ECSNodeClass,
        node_claim: &NodeClaim,
        instance_types: Vec<Arc<InstanceType>>,
    ) -> Result<Instance> {
        let requirements = node_claim.requirements();
        // opinionated filters only apply when minValues doesn't constrain
        // the final set composition
        let instance_types = if requirements.has_min_values() {
            instance_types
        } else {
            self.filter_instance_types(&requirements, instance_types)
        };
        let instance_types = truncate_instance_types(&requirements, instance_types)?;

        let tags = self.instance_tags(node_class, node_claim);
        let instance_id = self
            .launch_instance(node_class, node_claim, &instance_types, &tags)
            .await?;
        self.get(&instance_id).await
    }

    /// Fetch one instance by id
    pub async fn get(&self, id: &str) -> Result<Instance> {
        let response = self
            .ecs
            .describe_instances(DescribeInstancesRequest {
                region_id: self.region.clone(),
                instance_ids: vec![id.to_string()],
                ..Default::default()
            })
            .await?;
        match response.instances.as_slice() {
            [] => Err(Error::node_claim_not_found(format!("instance {id} not found"))),
            [instance] => Ok(Instance::from(instance)),
            many => Err(Error::cloud_api(format!(
                "expected a single instance for {id}, got {}",
                many.len()
            ))),
        }
    }

    /// List every instance this cluster manages
    pub async fn list(&self) -> Result<Vec<Instance>> {
        let mut request = DescribeInstancesRequest {
            region_id: self.region.clone(),
            tags: vec![
                Tag::key_only(crd::LABEL_NODE_POOL),
                Tag::key_only(crd::LABEL_NODE_CLASS),
                Tag::new(
                    crd::TAG_KUBERNETES_CLUSTER_PREFIX,
                    &self.options.cluster_name,
                ),
            ],
            ..Default::default()
        };

        let mut instances = Vec::new();
        loop {
            let response = self.ecs.describe_instances(request.clone()).await?;
            if response.instances.is_empty() {
                break;
            }
            instances.extend(response.instances.iter().map(Instance::from));
            match response.next_token {
                Some(token) if !token.is_empty() => request.next_token = Some(token),
                _ => break,
            }
        }
        Ok(instances)
    }

    /// Terminate an instance
    pub async fn delete(&self, id: &str) -> Result<()> {
        if let Err(err) = self
            .ecs
            .delete_instance(DeleteInstanceRequest {
                instance_id: id.to_string(),
            })
            .await
        {
            if err.is_not_found() {
                return Err(Error::node_claim_not_found("instance already terminated"));
            }
            // the delete may have raced a terminal state; probe before
            // surfacing the original failure
            return match self.get(id).await {
                Err(probe_err) if probe_err.is_not_found() => Err(probe_err),
                Err(probe_err) => Err(Error::cloud_api(format!(
                    "terminating instance, {err}; {probe_err}"
                ))),
                Ok(_) => Err(Error::cloud_api(format!("terminating instance, {err}"))),
            };
        }
        Ok(())
    }

    /// Add tags to an instance
    pub async fn create_tags(&self, id: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let request = AddTagsRequest {
            region_id: self.region.clone(),
            resource_type: "instance".to_string(),
            resource_id: id.to_string(),
            tags: tags.iter().map(|(k, v)| Tag::new(k, v)).collect(),
        };
        self.ecs.add_tags(request).await.map_err(|err| {
            if err.is_not_found() {
                Error::node_claim_not_found(format!("tagging instance, {err}"))
            } else {
                Error::cloud_api(format!("tagging instance, {err}"))
            }
        })
    }

    // Narrow the candidate set to what makes sense for this cloud: drop
    // exotic hardware when generic types suffice, and during mixed-capacity
    // launches drop spot types costlier than the cheapest on-demand option.
    fn filter_instance_types(
        &self,
        requirements: &Requirements,
        instance_types: Vec<Arc<InstanceType>>,
    ) -> Vec<Arc<InstanceType>> {
        let instance_types = filter_exotic_instance_types(instance_types);
        if is_mixed_capacity_launch(requirements, &instance_types) {
            filter_unwanted_spot(instance_types)
        } else {
            instance_types
        }
    }

    async fn launch_instance(
        &self,
        node_class: &ECSNodeClass,
        node_claim: &NodeClaim,
        instance_types: &[Arc<InstanceType>],
        tags: &BTreeMap<String, String>,
    ) -> Result<String> {
        let requirements = node_claim.requirements();
        let capacity_type = get_capacity_type(&requirements, instance_types);
        check_od_fallback(&requirements, instance_types, capacity_type);

        let zonal_vswitches = self
            .vswitch
            .zonal_vswitches_for_launch(node_class, instance_types, capacity_type)
            .await
            .map_err(|e| Error::cloud_api(format!("getting vSwitches, {e}")))?;

        let launch_templates = self
            .launch_templates
            .ensure_all(node_class, node_claim, instance_types, capacity_type, tags)
            .await?;
        let Some(launch_template) = launch_templates.first() else {
            return Err(Error::insufficient_capacity(
                "no launch templates are currently available given the constraints",
            ));
        };

        let request = self.provisioning_group_request(
            launch_template,
            &requirements,
            &zonal_vswitches,
            capacity_type,
        )?;

        let response = self
            .ecs
            .create_auto_provisioning_group(request.clone())
            .await
            .map_err(|e| Error::cloud_api(format!("creating auto provisioning group, {e}")))?;

        let launched: Vec<String> = response
            .launch_results
            .iter()
            .flat_map(|r| r.instance_ids.iter().cloned())
            .collect();
        if launched.is_empty() {
            // remember every refused candidate so the next launch skips it
            for config in &request.launch_template_configs {
                if let Some(vswitch) = zonal_vswitches
                    .values()
                    .find(|v| v.id == config.v_switch_id)
                {
                    self.unavailable.mark_unavailable(
                        "LaunchFailed",
                        &config.instance_type,
                        &vswitch.zone_id,
                        capacity_type,
                    );
                }
            }
            let reasons: Vec<String> = response
                .launch_results
                .iter()
                .filter_map(|r| r.error_msg.clone())
                .collect();
            return Err(Error::insufficient_capacity(format!(
                "auto provisioning group launched no instances: {}",
                reasons.join("; ")
            )));
        }

        // the cloud picked one candidate; re-credit the vswitches it skipped
        let fulfilled = match self.get(&launched[0]).await {
            Ok(instance) => vec![instance.vswitch_id],
            Err(_) => Vec::new(),
        };
        let chosen: Vec<crate::vswitch::VSwitch> = zonal_vswitches.values().cloned().collect();
        self.vswitch
            .update_inflight_ips(&request, &fulfilled, instance_types, &chosen, capacity_type)
            .await;

        Ok(launched[0].clone())
    }

    fn provisioning_group_request(
        &self,
        launch_template: &LaunchTemplate,
        requirements: &Requirements,
        zonal_vswitches: &std::collections::HashMap<String, crate::vswitch::VSwitch>,
        capacity_type: CapacityType,
    ) -> Result<CreateAutoProvisioningGroupRequest> {
        let mut requirements = requirements.clone();
        requirements.add(Requirement::new_in(
            crd::LABEL_CAPACITY_TYPE,
            [capacity_type.as_str()],
        ));

        let mut configs = Vec::new();
        for instance_type in launch_template.instance_types.iter().take(MAX_INSTANCE_TYPES) {
            // a type without a vswitch in an offering-compatible zone cannot
            // launch; drop the entry
            let Some(vswitch_id) =
                vswitch_for_instance_type(instance_type, zonal_vswitches, &requirements)
            else {
                continue;
            };
            configs.push(LaunchTemplateConfig {
                instance_type: instance_type.name.clone(),
                v_switch_id: vswitch_id,
                weighted_capacity: 1.0,
            });
        }
        if configs.is_empty() {
            return Err(Error::insufficient_capacity(
                "no launch template configs map to a usable vSwitch",
            ));
        }

        let (spot_target, pay_as_you_go_target) = match capacity_type {
            CapacityType::Spot => ("1", "0"),
            CapacityType::OnDemand => ("0", "1"),
        };

        Ok(CreateAutoProvisioningGroupRequest {
            region_id: self.region.clone(),
            total_target_capacity: "1".to_string(),
            spot_target_capacity: spot_target.to_string(),
            pay_as_you_go_target_capacity: pay_as_you_go_target.to_string(),
            spot_allocation_strategy: "lowest-price".to_string(),
            pay_as_you_go_allocation_strategy: "lowest-price".to_string(),
            excess_capacity_termination_policy: "termination".to_string(),
            auto_provisioning_group_type: "instant".to_string(),
            launch_template_configs: configs,
            launch_configuration: LaunchConfiguration {
                image_id: launch_template.image_id.clone(),
                security_group_ids: launch_template.security_group_ids.clone(),
                // the group-ids list is not yet honored by the API, so the
                // first group rides in the singular field as well
                security_group_id: launch_template.security_group_ids.first().cloned(),
            },
            system_disk_configs: launch_template
                .system_disk
                .as_ref()
                .and_then(|d| d.category.clone())
                .map(|disk_category| vec![SystemDiskConfig { disk_category }])
                .unwrap_or_default(),
        })
    }

    // All instances carry the ownership tag set; user tags never override it.
    fn instance_tags(
        &self,
        node_class: &ECSNodeClass,
        node_claim: &NodeClaim,
    ) -> BTreeMap<String, String> {
        let mut tags = node_class.spec.tags.clone();
        tags.insert(
            format!(
                "{}/{}",
                crd::TAG_KUBERNETES_CLUSTER_PREFIX,
                self.options.cluster_name
            ),
            "owned".to_string(),
        );
        tags.insert(
            crd::LABEL_NODE_POOL.to_string(),
            node_claim
                .labels()
                .get(crd::LABEL_NODE_POOL)
                .cloned()
                .unwrap_or_default(),
        );
        tags.insert(
            crd::TAG_CLUSTER_NAME.to_string(),
            self.options.cluster_name.clone(),
        );
        tags.insert(
            crd::LABEL_NODE_CLASS.to_string(),
            node_class.name().to_string(),
        );
        tags
    }
}

/// Drop metal sizes and GPU types when a generic subset would work
///
/// If the drop empties the set, the originals are kept: an explicit GPU or
/// metal constraint must still be satisfiable.
fn filter_exotic_instance_types(instance_types: Vec<Arc<InstanceType>>) -> Vec<Arc<InstanceType>> {
    let generic: Vec<Arc<InstanceType>> = instance_types
        .iter()
        .filter(|it| {
            let metal = it
                .requirements
                .get(crd::LABEL_INSTANCE_SIZE)
                .map(|r| r.values().iter().any(|size| size.contains("metal")))
                .unwrap_or(false);
            !metal && it.capacity.nvidia_gpus == 0 && it.capacity.amd_gpus == 0
        })
        .cloned()
        .collect();
    if generic.is_empty() {
        instance_types
    } else {
        generic
    }
}

// True when the requirements allow both capacity types and the candidate set
// offers both.
fn is_mixed_capacity_launch(
    requirements: &Requirements,
    instance_types: &[Arc<InstanceType>],
) -> bool {
    let Some(capacity_requirement) = requirements.get(crd::LABEL_CAPACITY_TYPE) else {
        return false;
    };
    if !capacity_requirement.has(CapacityType::Spot.as_str())
        || !capacity_requirement.has(CapacityType::OnDemand.as_str())
    {
        return false;
    }
    let mut has_spot = false;
    let mut has_on_demand = false;
    for instance_type in instance_types {
        for offering in instance_type.available_offerings() {
            if !requirements.compatible(&offering.requirements) {
                continue;
            }
            match offering.capacity_type() {
                Some(CapacityType::Spot) => has_spot = true,
                Some(CapacityType::OnDemand) => has_on_demand = true,
                None => {}
            }
        }
    }
    has_spot && has_on_demand
}

/// Drop types whose cheapest available offering exceeds the cheapest
/// on-demand price
///
/// A bigger spot type that costs more than a sufficient on-demand type is
/// never the right launch.
fn filter_unwanted_spot(instance_types: Vec<Arc<InstanceType>>) -> Vec<Arc<InstanceType>> {
    let cheapest_on_demand = instance_types
        .iter()
        .flat_map(|it| it.available_offerings())
        .filter(|o| o.capacity_type() == Some(CapacityType::OnDemand))
        .map(|o| o.price)
        .min_by(|a, b| a.total_cmp(b))
        .unwrap_or(f64::MAX);

    instance_types
        .into_iter()
        .filter(|it| match it.cheapest_available_price() {
            Some(price) => price <= cheapest_on_demand,
            None => false,
        })
        .collect()
}

/// Spot iff the claim allows it and some type has a compatible spot offering
fn get_capacity_type(
    requirements: &Requirements,
    instance_types: &[Arc<InstanceType>],
) -> CapacityType {
    let allows_spot = requirements
        .get(crd::LABEL_CAPACITY_TYPE)
        .map(|r| r.has(CapacityType::Spot.as_str()))
        .unwrap_or(false);
    if allows_spot {
        let mut spot_requirements = requirements.clone();
        spot_requirements.add(Requirement::new_in(
            crd::LABEL_CAPACITY_TYPE,
            [CapacityType::Spot.as_str()],
        ));
        for instance_type in instance_types {
            if instance_type.has_compatible_offering(&spot_requirements) {
                return CapacityType::Spot;
            }
        }
    }
    CapacityType::OnDemand
}

// On-demand fallback from a spot-flexible request should keep enough type
// diversity to dodge capacity errors; below the floor we warn and continue.
fn check_od_fallback(
    requirements: &Requirements,
    instance_types: &[Arc<InstanceType>],
    capacity_type: CapacityType,
) {
    if capacity_type != CapacityType::OnDemand {
        return;
    }
    let allows_spot = requirements
        .get(crd::LABEL_CAPACITY_TYPE)
        .map(|r| r.has(CapacityType::Spot.as_str()))
        .unwrap_or(false);
    if allows_spot && instance_types.len() < INSTANCE_TYPE_FLEXIBILITY_THRESHOLD {
        warn!(
            recommended = INSTANCE_TYPE_FLEXIBILITY_THRESHOLD,
            available = instance_types.len(),
            "flexible to spot but requesting on-demand with few instance type options"
        );
    }
}

/// Truncate to the cheapest types while preserving `minValues` coverage
fn truncate_instance_types(
    requirements: &Requirements,
    mut instance_types: Vec<Arc<InstanceType>>,
) -> Result<Vec<Arc<InstanceType>>> {
    instance_types.sort_by(|a, b| {
        let pa = a.cheapest_available_price().unwrap_or(f64::MAX);
        let pb = b.cheapest_available_price().unwrap_or(f64::MAX);
        pa.total_cmp(&pb)
    });
    instance_types.truncate(MAX_INSTANCE_TYPES);

    for requirement in requirements.iter() {
        let Some(min_values) = requirement.min_values else {
            continue;
        };
        let covered: std::collections::BTreeSet<&str> = instance_types
            .iter()
            .filter_map(|it| it.requirements.get(&requirement.key))
            .flat_map(|r| r.values())
            .filter(|value| requirement.has(value))
            .collect();
        if covered.len() < min_values {
            return Err(Error::validation(format!(
                "truncating instance types breaks minValues for {}: {} < {}",
                requirement.key,
                covered.len(),
                min_values
            )));
        }
    }
    Ok(instance_types)
}

fn vswitch_for_instance_type(
    instance_type: &InstanceType,
    zonal_vswitches: &std::collections::HashMap<String, crate::vswitch::VSwitch>,
    requirements: &Requirements,
) -> Option<String> {
    for offering in &instance_type.offerings {
        if !requirements.compatible(&offering.requirements) {
            continue;
        }
        if let Some(vswitch) = zonal_vswitches.get(offering.zone()) {
            return Some(vswitch.id.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::KubeletConfiguration;
    use crate::ecs::InstanceTypeData;
    use crate::instancetype::types::{new_instance_type, Offering};

    fn make_type(name: &str, offerings: Vec<Offering>) -> Arc<InstanceType> {
        Arc::new(
            new_instance_type(
                &InstanceTypeData {
                    instance_type_id: name.to_string(),
                    cpu_core_count: 2,
                    cpu_architecture: "X86".to_string(),
                    memory_size: 8.0,
                    ..Default::default()
                },
                &KubeletConfiguration::default(),
                "cn-beijing",
                0.075,
                offerings,
            )
            .unwrap(),
        )
    }

    fn gpu_type(name: &str) -> Arc<InstanceType> {
        Arc::new(
            new_instance_type(
                &InstanceTypeData {
                    instance_type_id: name.to_string(),
                    cpu_core_count: 4,
                    cpu_architecture: "X86".to_string(),
                    memory_size: 15.0,
                    gpu_amount: 1,
                    gpu_spec: "NVIDIA T4".to_string(),
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

    fn metal_type(name: &str) -> Arc<InstanceType> {
        make_type(name, vec![])
    }

    fn spot(zone: &str, price: f64) -> Offering {
        Offering::new(zone, CapacityType::Spot, Some(zone), price, true)
    }

    fn on_demand(zone: &str, price: f64) -> Offering {
        Offering::new(zone, CapacityType::OnDemand, Some(zone), price, true)
    }

    fn flexible_requirements() -> Requirements {
        Requirements::new([
            Requirement::new_in(crd::LABEL_CAPACITY_TYPE, ["spot", "on-demand"]),
            Requirement::new_in(crd::LABEL_TOPOLOGY_ZONE, ["z1", "z2"]),
        ])
    }

    #[test]
    fn exotic_filter_drops_gpu_and_metal_when_generic_exists() {
        let types = vec![
            make_type("ecs.g7.large", vec![]),
            gpu_type("ecs.gn6i-c4g1.xlarge"),
            metal_type("ecs.ebmg6.metal"),
        ];
        let filtered = filter_exotic_instance_types(types);
        let names: Vec<&str> = filtered.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["ecs.g7.large"]);
    }

    #[test]
    fn exotic_filter_keeps_originals_when_all_exotic() {
        let types = vec![gpu_type("ecs.gn6i-c4g1.xlarge"), metal_type("ecs.ebmg6.metal")];
        let filtered = filter_exotic_instance_types(types);
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn mixed_capacity_spot_filter_caps_at_cheapest_on_demand() {
        let types = vec![
            make_type("ecs.a.large", vec![spot("z1", 0.10), on_demand("z1", 0.30)]),
            make_type("ecs.b.large", vec![spot("z1", 0.20), on_demand("z1", 0.30)]),
            make_type("ecs.c.large", vec![spot("z1", 0.45)]),
        ];
        let requirements = flexible_requirements();
        assert!(is_mixed_capacity_launch(&requirements, &types));

        let filtered = filter_unwanted_spot(types);
        let names: Vec<&str> = filtered.iter().map(|t| t.name.as_str()).collect();
        // a 0.45 spot-only type is pricier than the 0.30 on-demand floor
        assert_eq!(names, vec!["ecs.a.large", "ecs.b.large"]);
    }

    #[test]
    fn capacity_type_prefers_spot_when_offered() {
        let types = vec![make_type(
            "ecs.a.large",
            vec![spot("z1", 0.10), on_demand("z1", 0.30)],
        )];
        assert_eq!(
            get_capacity_type(&flexible_requirements(), &types),
            CapacityType::Spot
        );

        let od_only = vec![make_type("ecs.a.large", vec![on_demand("z1", 0.30)])];
        assert_eq!(
            get_capacity_type(&flexible_requirements(), &od_only),
            CapacityType::OnDemand
        );

        let od_requirements = Requirements::new([Requirement::new_in(
            crd::LABEL_CAPACITY_TYPE,
            ["on-demand"],
        )]);
        let types = vec![make_type(
            "ecs.a.large",
            vec![spot("z1", 0.10), on_demand("z1", 0.30)],
        )];
        assert_eq!(
            get_capacity_type(&od_requirements, &types),
            CapacityType::OnDemand
        );
    }

    #[test]
    fn truncation_keeps_cheapest_twenty() {
        let types: Vec<Arc<InstanceType>> = (0..30)
            .map(|i| {
                make_type(
                    &format!("ecs.t{i}.large"),
                    vec![spot("z1", 0.10 + i as f64 * 0.01)],
                )
            })
            .collect();
        let truncated = truncate_instance_types(&Requirements::default(), types).unwrap();
        assert_eq!(truncated.len(), MAX_INSTANCE_TYPES);
        assert_eq!(truncated[0].name, "ecs.t0.large");
    }

    #[test]
    fn truncation_errors_when_min_values_break() {
        let types: Vec<Arc<InstanceType>> = (0..25)
            .map(|i| {
                make_type(
                    &format!("ecs.t{i}.large"),
                    vec![spot("z1", 0.10 + i as f64 * 0.01)],
                )
            })
            .collect();
        let mut requirement = Requirement::new_in(
            crd::LABEL_INSTANCE_TYPE,
            types.iter().map(|t| t.name.clone()),
        );
        requirement.min_values = Some(25);
        let requirements = Requirements::new([requirement]);
        assert!(truncate_instance_types(&requirements, types).is_err());
    }

    #[tokio::test]
    async fn spot_launch_submits_spot_target_and_cheapest_configs() {
        use crate::crd::{
            ECSNodeClassSpec, ECSNodeClassStatus, Image, ImageSelectorTerm, SecurityGroup,
        };
        use crate::ecs::{
            CreateAutoProvisioningGroupResponse, CreateLaunchTemplateResponse,
            DescribeInstancesResponse, DescribeLaunchTemplatesResponse, InstanceData,
            LaunchResult, MockEcsApi, MockVpcApi,
        };
        use crate::imagefamily::Resolver;
        use crate::scheduling::NodeSelectorRequirement;

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
            v_switches: vec![crate::crd::VSwitch {
                id: "vsw-z1".to_string(),
                zone_id: "z1".to_string(),
            }],
            security_groups: vec![SecurityGroup {
                id: "sg-1".to_string(),
                name: "node-sg".to_string(),
            }],
            images: vec![Image {
                id: "m-amd".to_string(),
                name: "aliyun3".to_string(),
                requirements: vec![NodeSelectorRequirement {
                    key: crate::crd::LABEL_ARCH.to_string(),
                    operator: "In".to_string(),
                    values: vec!["amd64".to_string()],
                    min_values: None,
                }],
            }],
            ..Default::default()
        });

        let mut claim = NodeClaim::default();
        claim.spec.requirements = vec![
            NodeSelectorRequirement {
                key: crd::LABEL_CAPACITY_TYPE.to_string(),
                operator: "In".to_string(),
                values: vec!["spot".to_string(), "on-demand".to_string()],
                min_values: None,
            },
            NodeSelectorRequirement {
                key: crd::LABEL_TOPOLOGY_ZONE.to_string(),
                operator: "In".to_string(),
                values: vec!["z1".to_string(), "z2".to_string()],
                min_values: None,
            },
        ];

        let mut ecs = MockEcsApi::new();
        ecs.expect_describe_launch_templates()
            .returning(|_| Ok(DescribeLaunchTemplatesResponse::default()));
        ecs.expect_create_launch_template().returning(|_| {
            Ok(CreateLaunchTemplateResponse {
                launch_template_id: "lt-1".to_string(),
            })
        });
        ecs.expect_create_auto_provisioning_group()
            .withf(|req| {
                // spot launch with both surviving candidates in z1
                req.spot_target_capacity == "1"
                    && req.pay_as_you_go_target_capacity == "0"
                    && req.auto_provisioning_group_type == "instant"
                    && req.spot_allocation_strategy == "lowest-price"
                    && req.pay_as_you_go_allocation_strategy == "lowest-price"
                    && req.launch_template_configs.len() == 2
                    && req
                        .launch_template_configs
                        .iter()
                        .all(|c| c.v_switch_id == "vsw-z1")
                    && req.launch_configuration.image_id == "m-amd"
                    && req.launch_configuration.security_group_id.as_deref() == Some("sg-1")
            })
            .returning(|_| {
                Ok(CreateAutoProvisioningGroupResponse {
                    launch_results: vec![LaunchResult {
                        instance_ids: vec!["i-new".to_string()],
                        ..Default::default()
                    }],
                })
            });
        ecs.expect_describe_instances().returning(|_| {
            Ok(DescribeInstancesResponse {
                next_token: None,
                instances: vec![InstanceData {
                    instance_id: "i-new".to_string(),
                    image_id: "m-amd".to_string(),
                    instance_type: "ecs.a.large".to_string(),
                    region_id: "cn-beijing".to_string(),
                    zone_id: "z1".to_string(),
                    spot_strategy: "SpotAsPriceGo".to_string(),
                    v_switch_id: "vsw-z1".to_string(),
                    status: "Pending".to_string(),
                    ..Default::default()
                }],
            })
        });
        let ecs = Arc::new(ecs);

        let options = Arc::new(Options {
            cluster_name: "prod".to_string(),
            cluster_endpoint: "https://10.0.0.1:6443".to_string(),
            ..Default::default()
        });
        let launch_templates = LaunchTemplateProvider::new(
            "cn-beijing",
            ecs.clone(),
            Arc::new(Resolver::new("cn-beijing", ecs.clone())),
            options.clone(),
        );
        let vswitch = Arc::new(VSwitchProvider::new(
            "cn-beijing",
            Arc::new(MockVpcApi::new()),
        ));
        let provider = InstanceProvider::new(
            "cn-beijing",
            ecs,
            options,
            launch_templates,
            vswitch,
            Arc::new(UnavailableOfferings::new()),
        );

        let types = vec![
            make_type("ecs.a.large", vec![spot("z1", 0.10), on_demand("z1", 0.30)]),
            make_type("ecs.b.large", vec![spot("z1", 0.20), on_demand("z1", 0.30)]),
            make_type("ecs.c.large", vec![spot("z1", 0.45)]),
        ];
        let instance = provider.create(&nc, &claim, types).await.unwrap();
        assert_eq!(instance.id, "i-new");
        assert_eq!(instance.capacity_type, CapacityType::Spot);
    }

    #[tokio::test]
    async fn empty_launch_result_marks_offerings_unavailable() {
        use crate::crd::{
            ECSNodeClassSpec, ECSNodeClassStatus, Image, ImageSelectorTerm, SecurityGroup,
        };
        use crate::ecs::{
            CreateAutoProvisioningGroupResponse, CreateLaunchTemplateResponse,
            DescribeLaunchTemplatesResponse, LaunchResult, MockEcsApi, MockVpcApi,
        };
        use crate::imagefamily::Resolver;
        use crate::scheduling::NodeSelectorRequirement;

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
            v_switches: vec![crate::crd::VSwitch {
                id: "vsw-z1".to_string(),
                zone_id: "z1".to_string(),
            }],
            security_groups: vec![SecurityGroup {
                id: "sg-1".to_string(),
                name: "node-sg".to_string(),
            }],
            images: vec![Image {
                id: "m-amd".to_string(),
                name: "aliyun3".to_string(),
                requirements: vec![NodeSelectorRequirement {
                    key: crate::crd::LABEL_ARCH.to_string(),
                    operator: "In".to_string(),
                    values: vec!["amd64".to_string()],
                    min_values: None,
                }],
            }],
            ..Default::default()
        });

        let mut claim = NodeClaim::default();
        claim.spec.requirements = vec![NodeSelectorRequirement {
            key: crd::LABEL_CAPACITY_TYPE.to_string(),
            operator: "In".to_string(),
            values: vec!["spot".to_string()],
            min_values: None,
        }];

        let mut ecs = MockEcsApi::new();
        ecs.expect_describe_launch_templates()
            .returning(|_| Ok(DescribeLaunchTemplatesResponse::default()));
        ecs.expect_create_launch_template().returning(|_| {
            Ok(CreateLaunchTemplateResponse {
                launch_template_id: "lt-1".to_string(),
            })
        });
        ecs.expect_create_auto_provisioning_group().returning(|_| {
            Ok(CreateAutoProvisioningGroupResponse {
                launch_results: vec![LaunchResult {
                    instance_ids: vec![],
                    error_code: Some("OperationDenied.NoStock".to_string()),
                    error_msg: Some("The requested resource is sold out".to_string()),
                }],
            })
        });
        let ecs = Arc::new(ecs);

        let options = Arc::new(Options {
            cluster_name: "prod".to_string(),
            cluster_endpoint: "https://10.0.0.1:6443".to_string(),
            ..Default::default()
        });
        let launch_templates = LaunchTemplateProvider::new(
            "cn-beijing",
            ecs.clone(),
            Arc::new(Resolver::new("cn-beijing", ecs.clone())),
            options.clone(),
        );
        let unavailable = Arc::new(UnavailableOfferings::new());
        let provider = InstanceProvider::new(
            "cn-beijing",
            ecs,
            options,
            launch_templates,
            Arc::new(VSwitchProvider::new(
                "cn-beijing",
                Arc::new(MockVpcApi::new()),
            )),
            unavailable.clone(),
        );

        let types = vec![make_type("ecs.a.large", vec![spot("z1", 0.10)])];
        let err = provider.create(&nc, &claim, types).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientCapacity(_)));
        assert!(unavailable.is_unavailable("ecs.a.large", "z1", CapacityType::Spot));
    }

    #[test]
    fn vswitch_matching_follows_offering_zone() {
        let instance_type = make_type("ecs.a.large", vec![spot("z1", 0.10), spot("z2", 0.12)]);
        let zonal = std::collections::HashMap::from([(
            "z2".to_string(),
            crate::vswitch::VSwitch {
                id: "vsw-z2".to_string(),
                zone_id: "z2".to_string(),
                available_ip_address_count: 10,
            },
        )]);
        let requirements = flexible_requirements();
        assert_eq!(
            vswitch_for_instance_type(&instance_type, &zonal, &requirements),
            Some("vsw-z2".to_string())
        );

        // no vswitch in any compatible zone
        let zonal = std::collections::HashMap::new();
        assert_eq!(
            vswitch_for_instance_type(&instance_type, &zonal, &requirements),
            None
        );
    }
}
