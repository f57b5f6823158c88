//! Request and response payloads for the cloud API surface
//!
//! These mirror the wire shapes of the Describe/Create operations the
//! provider consumes. Fields the provider never reads are omitted.

use serde::{Deserialize, Serialize};

/// A key/value tag filter or assignment
///
/// In describe requests a `None` value matches every value of the key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    /// Tag key
    pub key: String,
    /// Tag value; `None` in a filter matches any value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Tag {
    /// Tag with key and value
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Tag filter matching any value of the key
    pub fn key_only(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

// ---------------------------------------------------------------------------
// VSwitches (VPC API)
// ---------------------------------------------------------------------------

/// Request for a page of vSwitches
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeVSwitchesRequest {
    /// Region scope
    pub region_id: String,
    /// Restrict to one vSwitch id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v_switch_id: Option<String>,
    /// Tag filters, ANDed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// 1-based page number
    pub page_number: i32,
    /// Page size
    pub page_size: i32,
}

/// One page of vSwitches
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeVSwitchesResponse {
    /// Total matching vSwitches across all pages
    pub total_count: i64,
    /// The page contents
    pub v_switches: Vec<VSwitchData>,
}

/// A vSwitch record
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VSwitchData {
    /// vSwitch id
    pub v_switch_id: String,
    /// Availability zone the subnet lives in
    pub zone_id: String,
    /// Free IPv4 addresses remaining
    pub available_ip_address_count: i64,
}

// ---------------------------------------------------------------------------
// Security groups
// ---------------------------------------------------------------------------

/// Request for a page of security groups
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeSecurityGroupsRequest {
    /// Region scope
    pub region_id: String,
    /// Restrict to one group id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_group_id: Option<String>,
    /// Restrict to one group name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_group_name: Option<String>,
    /// Tag filters, ANDed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// Continuation token from the previous page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
    /// Page size
    pub max_results: i32,
}

/// One page of security groups
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeSecurityGroupsResponse {
    /// Continuation token; empty when this is the last page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
    /// The page contents
    pub security_groups: Vec<SecurityGroupData>,
}

/// A security-group record
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroupData {
    /// Security group id
    pub security_group_id: String,
    /// Security group name
    pub security_group_name: String,
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// Request for a page of images
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeImagesRequest {
    /// Region scope
    pub region_id: String,
    /// Restrict to one image id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// Restrict to one image name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    /// Owner alias (system, self, others, marketplace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_owner_alias: Option<String>,
    /// Public-image filter; shared images are queried with `false`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
    /// OS type filter (linux)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,
    /// Usage filter (CreateEcs)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    /// Tag filters, ANDed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// 1-based page number
    pub page_number: i32,
    /// Page size
    pub page_size: i32,
}

/// One page of images
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeImagesResponse {
    /// Total matching images across all pages
    pub total_count: i64,
    /// The page contents
    pub images: Vec<ImageData>,
}

/// An image record
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageData {
    /// Image id
    pub image_id: String,
    /// Image name
    pub image_name: String,
    /// CPU architecture (x86_64, arm64, i386)
    pub architecture: String,
    /// RFC3339 creation timestamp
    pub creation_time: String,
}

// ---------------------------------------------------------------------------
// Instance types and availability
// ---------------------------------------------------------------------------

/// Request for a page of instance-type metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeInstanceTypesRequest {
    /// Continuation token from the previous page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
    /// Page size; the API caps this at 100
    pub max_results: i64,
}

/// One page of instance-type metadata
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeInstanceTypesResponse {
    /// Continuation token; empty when this is the last page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
    /// The page contents
    pub instance_types: Vec<InstanceTypeData>,
}

/// Capability metadata for one instance type
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTypeData {
    /// Type id, `ecs.<family>.<size>`
    pub instance_type_id: String,
    /// CPU core count
    pub cpu_core_count: i32,
    /// `X86` or `ARM`
    pub cpu_architecture: String,
    /// Physical processor model string
    #[serde(default)]
    pub physical_processor_model: String,
    /// Memory size in GiB
    pub memory_size: f64,
    /// GPU count
    #[serde(default)]
    pub gpu_amount: i32,
    /// GPU model string, vendor first
    #[serde(default)]
    pub gpu_spec: String,
    /// Per-GPU memory in GiB
    #[serde(default)]
    pub gpu_memory_size: f64,
    /// Local storage in GiB, zero when absent
    #[serde(default)]
    pub local_storage_capacity: i64,
    /// NVMe support marker (`required`, `supported`, `unsupported`)
    #[serde(default)]
    pub nvme_support: String,
    /// Inbound bandwidth in Kbps
    #[serde(default)]
    pub instance_bandwidth_rx: i32,
    /// Outbound bandwidth in Kbps
    #[serde(default)]
    pub instance_bandwidth_tx: i32,
    /// ENI count
    #[serde(default)]
    pub eni_quantity: i32,
    /// Private IPv4 addresses per ENI
    #[serde(default)]
    pub eni_private_ip_address_quantity: i32,
    /// Whether the type encrypts inter-instance traffic
    #[serde(default)]
    pub network_encryption_support: bool,
}

/// Request for zonal resource availability
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeAvailableResourceRequest {
    /// Region scope
    pub region_id: String,
    /// `InstanceType` or `SystemDisk`
    pub destination_resource: String,
    /// Scope the query to one instance type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
}

/// Zonal availability response
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeAvailableResourceResponse {
    /// Availability broken down by zone
    pub available_zones: Vec<AvailableZone>,
}

/// Availability within one zone
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableZone {
    /// Zone id
    pub zone_id: String,
    /// `Available` when the zone serves requests
    pub status: String,
    /// Stock marker: WithStock, ClosedWithStock, WithoutStock,
    /// ClosedWithoutStock
    pub status_category: String,
    /// Resource groups available in the zone
    #[serde(default)]
    pub available_resources: Vec<AvailableResource>,
}

/// One resource group within a zone
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableResource {
    /// The concrete resources supported
    #[serde(default)]
    pub supported_resources: Vec<SupportedResource>,
}

/// A concrete supported resource value (an instance type or disk category)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResource {
    /// The resource value
    pub value: String,
    /// `Available` when usable
    pub status: String,
    /// Stock marker, as on [`AvailableZone`]
    pub status_category: String,
}

// ---------------------------------------------------------------------------
// Launch templates
// ---------------------------------------------------------------------------

/// Request to create a launch template
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLaunchTemplateRequest {
    /// Region scope
    pub region_id: String,
    /// Content-hash derived template name
    pub launch_template_name: String,
    /// Image booted by instances of this template
    pub image_id: String,
    /// Security groups attached to instances
    pub security_group_ids: Vec<String>,
    /// Base64 user data
    pub user_data: String,
    /// System disk settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_disk: Option<LaunchTemplateSystemDisk>,
    /// Tags stamped on launched instances
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// Tags stamped on the template itself
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template_tags: Vec<Tag>,
}

/// System disk block of a launch template
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchTemplateSystemDisk {
    /// Disk category
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Disk size in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i32>,
    /// Disk name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_name: Option<String>,
    /// ESSD performance level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_level: Option<String>,
    /// Automatic snapshot policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_snapshot_policy_id: Option<String>,
    /// Performance burst flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bursting_enabled: Option<bool>,
}

/// Response to launch-template creation
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLaunchTemplateResponse {
    /// Id of the created template
    pub launch_template_id: String,
}

/// Request for a page of launch templates
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeLaunchTemplatesRequest {
    /// Region scope
    pub region_id: String,
    /// Restrict to the given template names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub launch_template_names: Vec<String>,
    /// Template tag filters, ANDed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template_tags: Vec<Tag>,
    /// 1-based page number
    pub page_number: i32,
    /// Page size
    pub page_size: i32,
}

/// One page of launch templates
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeLaunchTemplatesResponse {
    /// Total matching templates across all pages
    pub total_count: i64,
    /// The page contents
    pub launch_template_sets: Vec<LaunchTemplateSet>,
}

/// A launch-template record
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchTemplateSet {
    /// Template id
    pub launch_template_id: String,
    /// Template name
    pub launch_template_name: String,
}

/// Request to delete a launch template by id and/or name
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteLaunchTemplateRequest {
    /// Region scope
    pub region_id: String,
    /// Template id to delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_template_id: Option<String>,
    /// Template name to delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_template_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Auto-provisioning groups
// ---------------------------------------------------------------------------

/// One (instance type, vSwitch) launch candidate
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchTemplateConfig {
    /// Candidate instance type
    pub instance_type: String,
    /// vSwitch the instance would join
    pub v_switch_id: String,
    /// Weight of this candidate towards the target capacity
    pub weighted_capacity: f64,
}

/// Image/security/disk settings shared by every candidate
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfiguration {
    /// Image booted by the launched instance
    pub image_id: String,
    /// Security groups attached to the instance
    pub security_group_ids: Vec<String>,
    /// First security group; the group-ids list is not yet honored by the
    /// auto-provisioning API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_group_id: Option<String>,
}

/// System disk candidate of an auto-provisioning group
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemDiskConfig {
    /// Disk category
    pub disk_category: String,
}

/// Request to create an instant auto-provisioning group
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAutoProvisioningGroupRequest {
    /// Region scope
    pub region_id: String,
    /// Total machines requested
    pub total_target_capacity: String,
    /// Of which spot machines
    pub spot_target_capacity: String,
    /// Of which pay-as-you-go machines
    pub pay_as_you_go_target_capacity: String,
    /// How spot capacity is allocated across candidates
    pub spot_allocation_strategy: String,
    /// How pay-as-you-go capacity is allocated across candidates
    pub pay_as_you_go_allocation_strategy: String,
    /// What happens to excess capacity on shrink
    pub excess_capacity_termination_policy: String,
    /// `instant` submits synchronously and returns launch results
    pub auto_provisioning_group_type: String,
    /// The launch candidates
    pub launch_template_configs: Vec<LaunchTemplateConfig>,
    /// Shared launch settings
    pub launch_configuration: LaunchConfiguration,
    /// System disk candidates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_disk_configs: Vec<SystemDiskConfig>,
}

/// Response of an instant auto-provisioning group
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAutoProvisioningGroupResponse {
    /// Per-candidate launch outcomes
    pub launch_results: Vec<LaunchResult>,
}

/// Outcome of one launch attempt
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchResult {
    /// Instance ids launched by this result
    #[serde(default)]
    pub instance_ids: Vec<String>,
    /// Error code when the launch failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Error detail when the launch failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

/// Request for a page of instances
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeInstancesRequest {
    /// Region scope
    pub region_id: String,
    /// Restrict to the given instance ids
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_ids: Vec<String>,
    /// Tag filters, ANDed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// Continuation token from the previous page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

/// One page of instances
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeInstancesResponse {
    /// Continuation token; empty when this is the last page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
    /// The page contents
    pub instances: Vec<InstanceData>,
}

/// An instance record
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceData {
    /// Instance id
    pub instance_id: String,
    /// Image the instance booted from
    pub image_id: String,
    /// Instance type
    pub instance_type: String,
    /// Region the instance runs in
    pub region_id: String,
    /// Zone the instance runs in
    pub zone_id: String,
    /// Spot strategy; `NoSpot` marks pay-as-you-go
    #[serde(default)]
    pub spot_strategy: String,
    /// Attached security groups
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    /// vSwitch the primary ENI joined
    #[serde(default)]
    pub v_switch_id: String,
    /// Instance tags
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Lifecycle status string
    pub status: String,
    /// RFC3339 creation timestamp
    #[serde(default)]
    pub creation_time: String,
}

/// Request to delete an instance
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteInstanceRequest {
    /// Instance to delete
    pub instance_id: String,
}

/// Request to add tags to a resource
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTagsRequest {
    /// Region scope
    pub region_id: String,
    /// Resource type, e.g. `instance`
    pub resource_type: String,
    /// Resource id
    pub resource_id: String,
    /// Tags to add
    pub tags: Vec<Tag>,
}
