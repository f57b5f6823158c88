//! ECSNodeClass custom resource and well-known keys
//!
//! The label, annotation, and tag vocabulary every other module speaks is
//! centralized here, next to the CRD it decorates.

mod nodeclass;
mod types;

pub use nodeclass::{ECSNodeClass, ECSNodeClassSpec};
pub use types::{
    Condition, ECSNodeClassStatus, Image, ImageFamily, ImageSelectorTerm, KubeletConfiguration,
    SecurityGroup, SecurityGroupSelectorTerm, SystemDisk, VSwitch, VSwitchSelectorTerm,
};

// Well-known upstream labels
/// Node label carrying the instance type name
pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
/// Node label carrying the CPU architecture
pub const LABEL_ARCH: &str = "kubernetes.io/arch";
/// Node label carrying the operating system
pub const LABEL_OS: &str = "kubernetes.io/os";
/// Node label carrying the availability zone
pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";
/// Node label carrying the region
pub const LABEL_TOPOLOGY_REGION: &str = "topology.kubernetes.io/region";
/// Windows build label; our nodes never carry it
pub const LABEL_WINDOWS_BUILD: &str = "node.kubernetes.io/windows-build";

// Well-known autoscaler labels
/// Label distinguishing spot from on-demand machines
pub const LABEL_CAPACITY_TYPE: &str = "karpenter.sh/capacity-type";
/// Label tying a machine to its NodePool
pub const LABEL_NODE_POOL: &str = "karpenter.sh/nodepool";
/// Label tying a machine to its NodeClaim
pub const LABEL_NODE_CLAIM: &str = "karpenter.sh/nodeclaim";

// Cloud-specific labels
/// Instance category parsed from the type-id scheme (g, c, r, ...)
pub const LABEL_INSTANCE_CATEGORY: &str = "karpenter.k8s.alibabacloud/instance-category";
/// Instance family (g7, c6e, ...)
pub const LABEL_INSTANCE_FAMILY: &str = "karpenter.k8s.alibabacloud/instance-family";
/// Instance generation digit parsed from the type id
pub const LABEL_INSTANCE_GENERATION: &str = "karpenter.k8s.alibabacloud/instance-generation";
/// Instance size suffix (large, 2xlarge, ...)
pub const LABEL_INSTANCE_SIZE: &str = "karpenter.k8s.alibabacloud/instance-size";
/// CPU core count
pub const LABEL_INSTANCE_CPU: &str = "karpenter.k8s.alibabacloud/instance-cpu";
/// CPU vendor, first token of the processor model
pub const LABEL_INSTANCE_CPU_MANUFACTURER: &str =
    "karpenter.k8s.alibabacloud/instance-cpu-manufacturer";
/// Memory size in GiB
pub const LABEL_INSTANCE_MEMORY: &str = "karpenter.k8s.alibabacloud/instance-memory";
/// GPU model in lower-kebab-case
pub const LABEL_INSTANCE_GPU_NAME: &str = "karpenter.k8s.alibabacloud/instance-gpu-name";
/// GPU vendor, first token of the GPU spec
pub const LABEL_INSTANCE_GPU_MANUFACTURER: &str =
    "karpenter.k8s.alibabacloud/instance-gpu-manufacturer";
/// GPU count
pub const LABEL_INSTANCE_GPU_COUNT: &str = "karpenter.k8s.alibabacloud/instance-gpu-count";
/// GPU memory in GiB
pub const LABEL_INSTANCE_GPU_MEMORY: &str = "karpenter.k8s.alibabacloud/instance-gpu-memory";
/// Local NVMe storage size in GiB, present only when NVMe is supported
pub const LABEL_INSTANCE_LOCAL_NVME: &str = "karpenter.k8s.alibabacloud/instance-local-nvme";
/// Network bandwidth in Mbps, max of rx and tx
pub const LABEL_INSTANCE_NETWORK_BANDWIDTH: &str =
    "karpenter.k8s.alibabacloud/instance-network-bandwidth";
/// Whether the type supports encryption in transit
pub const LABEL_INSTANCE_ENCRYPTION_IN_TRANSIT: &str =
    "karpenter.k8s.alibabacloud/instance-encryption-in-transit-supported";
/// Zone ID as distinct from the zone name
pub const LABEL_TOPOLOGY_ZONE_ID: &str = "topology.k8s.alibabacloud/zone-id";
/// Label and tag key tying resources to their ECSNodeClass
pub const LABEL_NODE_CLASS: &str = "karpenter.k8s.alibabacloud/ecsnodeclass";

// Annotations
/// Content hash of the ECSNodeClass spec, stamped on class and claims
pub const ANNOTATION_NODECLASS_HASH: &str = "karpenter.k8s.alibabacloud/ecsnodeclass-hash";
/// Version tag of the hash scheme in use
pub const ANNOTATION_NODECLASS_HASH_VERSION: &str =
    "karpenter.k8s.alibabacloud/ecsnodeclass-hash-version";

/// Bumped whenever the hash calculation changes meaning: a hashed field
/// changes its default, a set field joins the calculation, or a field leaves
/// it
pub const NODECLASS_HASH_VERSION: &str = "v1";

// Tags
/// Cluster-name tag placed on every managed ECS resource
pub const TAG_CLUSTER_NAME: &str = "ecs:ecs-cluster-name";
/// Template tag marking launch templates managed for a cluster
pub const TAG_MANAGED_LAUNCH_TEMPLATE: &str = "karpenter.k8s.alibabacloud/cluster";
/// Prefix of the kubernetes ownership tag, completed with the cluster name
pub const TAG_KUBERNETES_CLUSTER_PREFIX: &str = "kubernetes.io/cluster";

/// Finalizer owned by the termination controller
pub const TERMINATION_FINALIZER: &str = "karpenter.k8s.alibabacloud/termination";

// Condition types on the ECSNodeClass status
/// Set once the vSwitch selectors resolved to at least one subnet
pub const CONDITION_VSWITCHES_READY: &str = "VSwitchesReady";
/// Set once the security-group selectors resolved
pub const CONDITION_SECURITY_GROUPS_READY: &str = "SecurityGroupsReady";
/// Set once the image selectors resolved
pub const CONDITION_IMAGES_READY: &str = "ImagesReady";
/// Aggregate readiness of the node class
pub const CONDITION_READY: &str = "Ready";
