//! InstanceType construction: requirements, capacity, overhead

use once_cell::sync::Lazy;
use regex::Regex;

use crate::crd::{self, KubeletConfiguration};
use crate::ecs::InstanceTypeData;
use crate::nodeclaim::CapacityType;
use crate::resources::{self, Overhead, Resources};
use crate::scheduling::{Requirement, Requirements};
use crate::Result;

// ecs.<category><optional -Ntb><generation-digits>.<size>
static INSTANCE_TYPE_SCHEME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ecs\.([a-z]+)(-[0-9]+tb)?([0-9]+).*").unwrap());

const GIB: i64 = 1024 * 1024 * 1024;

/// A concrete price-and-availability tuple for one (zone, capacity type)
///
/// Offerings of a given instance type are pairwise mutually exclusive in
/// (zone, capacity type); each requirement on an offering holds exactly one
/// value.
#[derive(Clone, Debug)]
pub struct Offering {
    /// Requirements pinning zone, capacity type, and zone id when known
    pub requirements: Requirements,
    /// Hourly price for this offering
    pub price: f64,
    /// Whether the cloud can currently fill this offering
    pub available: bool,
}

impl Offering {
    /// Build an offering for a zone and capacity type
    pub fn new(
        zone: &str,
        capacity_type: CapacityType,
        zone_id: Option<&str>,
        price: f64,
        available: bool,
    ) -> Self {
        let mut requirements = Requirements::new([
            Requirement::new_in(crd::LABEL_CAPACITY_TYPE, [capacity_type.as_str()]),
            Requirement::new_in(crd::LABEL_TOPOLOGY_ZONE, [zone]),
        ]);
        if let Some(zone_id) = zone_id.filter(|id| !id.is_empty()) {
            requirements.add(Requirement::new_in(crd::LABEL_TOPOLOGY_ZONE_ID, [zone_id]));
        }
        Self {
            requirements,
            price,
            available,
        }
    }

    /// The single zone this offering pins
    pub fn zone(&self) -> &str {
        self.requirements
            .get(crd::LABEL_TOPOLOGY_ZONE)
            .and_then(|r| r.any())
            .unwrap_or_default()
    }

    /// The single capacity type this offering pins
    pub fn capacity_type(&self) -> Option<CapacityType> {
        self.requirements
            .get(crd::LABEL_CAPACITY_TYPE)
            .and_then(|r| r.any())
            .and_then(CapacityType::parse)
    }
}

/// One launchable instance type with its requirements, capacity, overhead,
/// and offerings
#[derive(Clone, Debug)]
pub struct InstanceType {
    /// Type id, e.g. `ecs.g7.large`
    pub name: String,
    /// Labels a machine of this type satisfies
    pub requirements: Requirements,
    /// Raw node capacity
    pub capacity: Resources,
    /// Reservations deducted from capacity
    pub overhead: Overhead,
    /// Per-(zone, capacity-type) price and availability
    pub offerings: Vec<Offering>,
}

impl InstanceType {
    /// Capacity remaining after reservations
    pub fn allocatable(&self) -> Resources {
        self.capacity.allocatable(&self.overhead)
    }

    /// Offerings the cloud can currently fill
    pub fn available_offerings(&self) -> impl Iterator<Item = &Offering> {
        self.offerings.iter().filter(|o| o.available)
    }

    /// True when some available offering satisfies the requirements
    pub fn has_compatible_offering(&self, requirements: &Requirements) -> bool {
        self.available_offerings()
            .any(|o| requirements.compatible(&o.requirements))
    }

    /// Price of the cheapest available offering
    pub fn cheapest_available_price(&self) -> Option<f64> {
        self.available_offerings()
            .map(|o| o.price)
            .min_by(|a, b| a.total_cmp(b))
    }
}

/// Assemble an [`InstanceType`] from cloud metadata and kubelet configuration
pub fn new_instance_type(
    info: &InstanceTypeData,
    kc: &KubeletConfiguration,
    region: &str,
    vm_memory_overhead_percent: f64,
    offerings: Vec<Offering>,
) -> Result<InstanceType> {
    let capacity = compute_capacity(info, kc, vm_memory_overhead_percent);
    let overhead = Overhead {
        kube_reserved: resources::kube_reserved(
            capacity.cpu_milli,
            capacity.pods,
            kc.kube_reserved.as_ref(),
        )?,
        system_reserved: resources::system_reserved(kc.system_reserved.as_ref())?,
        eviction_threshold: resources::eviction_threshold(
            capacity.memory_bytes,
            capacity.ephemeral_bytes,
            kc.eviction_hard.as_ref(),
            kc.eviction_soft.as_ref(),
        )?,
    };
    Ok(InstanceType {
        name: info.instance_type_id.clone(),
        requirements: compute_requirements(info, &offerings, region),
        capacity,
        overhead,
        offerings,
    })
}

fn extract_arch(raw: &str) -> &'static str {
    match raw {
        "ARM" => "arm64",
        _ => "amd64",
    }
}

fn compute_requirements(
    info: &InstanceTypeData,
    offerings: &[Offering],
    region: &str,
) -> Requirements {
    let available: Vec<&Offering> = offerings.iter().filter(|o| o.available).collect();
    let zones: Vec<&str> = available.iter().map(|o| o.zone()).collect();
    let capacity_types: Vec<&str> = available
        .iter()
        .filter_map(|o| o.capacity_type().map(|c| c.as_str()))
        .collect();

    let mut requirements = Requirements::new([
        // Well known upstream
        Requirement::new_in(crd::LABEL_INSTANCE_TYPE, [info.instance_type_id.as_str()]),
        Requirement::new_in(crd::LABEL_ARCH, [extract_arch(&info.cpu_architecture)]),
        Requirement::new_in(crd::LABEL_OS, ["linux"]),
        Requirement::new_in(crd::LABEL_TOPOLOGY_ZONE, zones),
        Requirement::new_in(crd::LABEL_TOPOLOGY_REGION, [region]),
        Requirement::does_not_exist(crd::LABEL_WINDOWS_BUILD),
        // Well known to the autoscaler
        Requirement::new_in(crd::LABEL_CAPACITY_TYPE, capacity_types),
        // Well known to Alibaba Cloud
        Requirement::new_in(
            crd::LABEL_INSTANCE_CPU,
            [info.cpu_core_count.to_string()],
        ),
        Requirement::new_in(
            crd::LABEL_INSTANCE_MEMORY,
            [format_memory_gib(info.memory_size)],
        ),
        Requirement::new_in(
            crd::LABEL_INSTANCE_NETWORK_BANDWIDTH,
            [instance_bandwidth(info).to_string()],
        ),
        Requirement::new_in(
            crd::LABEL_INSTANCE_ENCRYPTION_IN_TRANSIT,
            [info.network_encryption_support.to_string()],
        ),
    ]);

    // zone ids are only known once the nodeclass status carries resolved
    // vswitches; omit the label entirely until then
    let zone_ids: Vec<&str> = available
        .iter()
        .filter_map(|o| o.requirements.get(crd::LABEL_TOPOLOGY_ZONE_ID))
        .filter_map(|r| r.any())
        .collect();
    if !zone_ids.is_empty() {
        requirements.add(Requirement::new_in(crd::LABEL_TOPOLOGY_ZONE_ID, zone_ids));
    }

    // category and generation from the type-id scheme
    if let Some(parts) = INSTANCE_TYPE_SCHEME.captures(&info.instance_type_id) {
        if let Some(category) = parts.get(1) {
            requirements.add(Requirement::new_in(
                crd::LABEL_INSTANCE_CATEGORY,
                [category.as_str()],
            ));
        }
        if let Some(generation) = parts.get(3) {
            requirements.add(Requirement::new_in(
                crd::LABEL_INSTANCE_GENERATION,
                [generation.as_str()],
            ));
        }
    }
    // family and size from the dotted form
    let type_parts: Vec<&str> = info.instance_type_id.split('.').collect();
    if type_parts.len() == 3 {
        requirements.add(Requirement::new_in(
            crd::LABEL_INSTANCE_FAMILY,
            [type_parts[1]],
        ));
        requirements.add(Requirement::new_in(crd::LABEL_INSTANCE_SIZE, [type_parts[2]]));
    }

    if !info.nvme_support.is_empty() && info.nvme_support != "unsupported" {
        requirements.add(Requirement::new_in(
            crd::LABEL_INSTANCE_LOCAL_NVME,
            [info.local_storage_capacity.to_string()],
        ));
    }

    if info.gpu_amount != 0 {
        requirements.add(Requirement::new_in(
            crd::LABEL_INSTANCE_GPU_NAME,
            [lower_kebab_case(&info.gpu_spec)],
        ));
        requirements.add(Requirement::new_in(
            crd::LABEL_INSTANCE_GPU_MANUFACTURER,
            [manufacturer(&info.gpu_spec)],
        ));
        requirements.add(Requirement::new_in(
            crd::LABEL_INSTANCE_GPU_COUNT,
            [info.gpu_amount.to_string()],
        ));
        requirements.add(Requirement::new_in(
            crd::LABEL_INSTANCE_GPU_MEMORY,
            [format_memory_gib(info.gpu_memory_size)],
        ));
    }

    if !info.physical_processor_model.is_empty() {
        requirements.add(Requirement::new_in(
            crd::LABEL_INSTANCE_CPU_MANUFACTURER,
            [manufacturer(&info.physical_processor_model).to_lowercase()],
        ));
    }

    requirements
}

fn compute_capacity(
    info: &InstanceTypeData,
    kc: &KubeletConfiguration,
    vm_memory_overhead_percent: f64,
) -> Resources {
    Resources {
        cpu_milli: i64::from(info.cpu_core_count) * 1000,
        memory_bytes: memory_bytes(info, vm_memory_overhead_percent),
        ephemeral_bytes: info.local_storage_capacity * 1_000_000_000,
        pods: pods(info, kc),
        nvidia_gpus: gpus_for_vendor(info, "nvidia"),
        amd_gpus: gpus_for_vendor(info, "amd"),
        private_ipv4: i64::from(info.eni_private_ip_address_quantity)
            * i64::from(info.eni_quantity),
    }
}

fn memory_bytes(info: &InstanceTypeData, vm_memory_overhead_percent: f64) -> i64 {
    let total = (info.memory_size * GIB as f64) as i64;
    if total == 0 {
        return 0;
    }
    // the hypervisor share is rounded up to whole GiB before deduction
    let overhead_gib = ((total as f64) * vm_memory_overhead_percent / GIB as f64).ceil() as i64;
    total - overhead_gib * GIB
}

fn pods(info: &InstanceTypeData, kc: &KubeletConfiguration) -> i64 {
    let mut count = match kc.max_pods {
        Some(max_pods) => i64::from(max_pods),
        None => 110,
    };
    if let Some(per_core) = kc.pods_per_core {
        if per_core > 0 {
            count = count.min(i64::from(per_core) * i64::from(info.cpu_core_count));
        }
    }
    count
}

fn gpus_for_vendor(info: &InstanceTypeData, vendor: &str) -> i64 {
    if info.gpu_amount != 0 && manufacturer(&info.gpu_spec).to_lowercase() == vendor {
        i64::from(info.gpu_amount)
    } else {
        0
    }
}

fn manufacturer(spec: &str) -> String {
    spec.split([' ', '-']).next().unwrap_or_default().to_string()
}

fn lower_kebab_case(s: &str) -> String {
    s.to_lowercase().replace(' ', "-")
}

fn instance_bandwidth(info: &InstanceTypeData) -> i64 {
    i64::from(info.instance_bandwidth_rx.max(info.instance_bandwidth_tx))
}

// GiB values come back fractional for some burstable types; render them the
// way the metadata does (4.0 -> "4", 0.5 -> "0.5")
fn format_memory_gib(gib: f64) -> String {
    if gib.fract() == 0.0 {
        format!("{}", gib as i64)
    } else {
        format!("{gib}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn g7_large() -> InstanceTypeData {
        InstanceTypeData {
            instance_type_id: "ecs.g7.large".to_string(),
            cpu_core_count: 2,
            cpu_architecture: "X86".to_string(),
            physical_processor_model: "Intel Xeon (Ice Lake) Platinum 8369B".to_string(),
            memory_size: 8.0,
            eni_quantity: 3,
            eni_private_ip_address_quantity: 6,
            instance_bandwidth_rx: 1_000_000,
            instance_bandwidth_tx: 800_000,
            ..Default::default()
        }
    }

    fn gpu_type() -> InstanceTypeData {
        InstanceTypeData {
            instance_type_id: "ecs.gn6i-c4g1.xlarge".to_string(),
            cpu_core_count: 4,
            cpu_architecture: "X86".to_string(),
            memory_size: 15.0,
            gpu_amount: 1,
            gpu_spec: "NVIDIA T4".to_string(),
            gpu_memory_size: 16.0,
            ..Default::default()
        }
    }

    fn offerings() -> Vec<Offering> {
        vec![
            Offering::new(
                "cn-beijing-a",
                CapacityType::OnDemand,
                Some("cn-beijing-a"),
                0.171,
                true,
            ),
            Offering::new("cn-beijing-a", CapacityType::Spot, Some("cn-beijing-a"), 0.05, true),
            Offering::new("cn-beijing-b", CapacityType::Spot, None, 0.06, false),
        ]
    }

    #[test]
    fn requirements_carry_parsed_type_scheme() {
        let it = new_instance_type(
            &g7_large(),
            &KubeletConfiguration::default(),
            "cn-beijing",
            0.075,
            offerings(),
        )
        .unwrap();

        let get = |key: &str| it.requirements.get(key).unwrap().values().join(",");
        assert_eq!(get(crd::LABEL_INSTANCE_CATEGORY), "g");
        assert_eq!(get(crd::LABEL_INSTANCE_GENERATION), "7");
        assert_eq!(get(crd::LABEL_INSTANCE_FAMILY), "g7");
        assert_eq!(get(crd::LABEL_INSTANCE_SIZE), "large");
        assert_eq!(get(crd::LABEL_ARCH), "amd64");
        assert_eq!(get(crd::LABEL_INSTANCE_CPU), "2");
        assert_eq!(get(crd::LABEL_INSTANCE_CPU_MANUFACTURER), "intel");
        assert_eq!(get(crd::LABEL_INSTANCE_NETWORK_BANDWIDTH), "1000000");
    }

    #[test]
    fn zone_requirements_follow_available_offerings() {
        let it = new_instance_type(
            &g7_large(),
            &KubeletConfiguration::default(),
            "cn-beijing",
            0.075,
            offerings(),
        )
        .unwrap();
        // cn-beijing-b is unavailable, so only -a shows up
        let zones = it.requirements.get(crd::LABEL_TOPOLOGY_ZONE).unwrap();
        assert_eq!(zones.values(), vec!["cn-beijing-a"]);
        let capacity_types = it.requirements.get(crd::LABEL_CAPACITY_TYPE).unwrap();
        assert!(capacity_types.has("spot"));
        assert!(capacity_types.has("on-demand"));
    }

    #[test]
    fn gpu_labels_and_capacity() {
        let it = new_instance_type(
            &gpu_type(),
            &KubeletConfiguration::default(),
            "cn-beijing",
            0.075,
            vec![],
        )
        .unwrap();
        let get = |key: &str| it.requirements.get(key).unwrap().values().join(",");
        assert_eq!(get(crd::LABEL_INSTANCE_GPU_NAME), "nvidia-t4");
        assert_eq!(get(crd::LABEL_INSTANCE_GPU_MANUFACTURER), "NVIDIA");
        assert_eq!(get(crd::LABEL_INSTANCE_GPU_COUNT), "1");
        assert_eq!(it.capacity.nvidia_gpus, 1);
        assert_eq!(it.capacity.amd_gpus, 0);
    }

    #[test]
    fn memory_deducts_vm_overhead_in_whole_gib() {
        let it = new_instance_type(
            &g7_large(),
            &KubeletConfiguration::default(),
            "cn-beijing",
            0.075,
            vec![],
        )
        .unwrap();
        // 8Gi * 0.075 = 0.6Gi, rounded up to 1Gi deducted
        assert_eq!(it.capacity.memory_bytes, 7 * GIB);
    }

    #[test]
    fn pods_default_and_clamps() {
        let info = g7_large();

        let default = compute_capacity(&info, &KubeletConfiguration::default(), 0.075);
        assert_eq!(default.pods, 110);

        let kc = KubeletConfiguration {
            max_pods: Some(64),
            ..Default::default()
        };
        assert_eq!(compute_capacity(&info, &kc, 0.075).pods, 64);

        let kc = KubeletConfiguration {
            pods_per_core: Some(10),
            ..Default::default()
        };
        // 10 pods/core * 2 cores beats the 110 default
        assert_eq!(compute_capacity(&info, &kc, 0.075).pods, 20);
    }

    #[test]
    fn kube_reserved_overrides_flow_through() {
        let kc = KubeletConfiguration {
            kube_reserved: Some(BTreeMap::from([(
                "cpu".to_string(),
                "500m".to_string(),
            )])),
            ..Default::default()
        };
        let it =
            new_instance_type(&g7_large(), &kc, "cn-beijing", 0.075, vec![]).unwrap();
        assert_eq!(it.overhead.kube_reserved.cpu_milli, 500);
    }

    #[test]
    fn offering_exclusivity_invariant() {
        let it = new_instance_type(
            &g7_large(),
            &KubeletConfiguration::default(),
            "cn-beijing",
            0.075,
            offerings(),
        )
        .unwrap();
        let mut seen = std::collections::BTreeSet::new();
        for offering in &it.offerings {
            let key = (
                offering.zone().to_string(),
                offering.capacity_type().unwrap(),
            );
            assert!(seen.insert(key), "duplicate (zone, capacity-type) offering");
        }
    }

    #[test]
    fn cheapest_available_ignores_unavailable() {
        let it = new_instance_type(
            &g7_large(),
            &KubeletConfiguration::default(),
            "cn-beijing",
            0.075,
            offerings(),
        )
        .unwrap();
        assert_eq!(it.cheapest_available_price(), Some(0.05));
    }
}
