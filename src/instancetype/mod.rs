//! Instance-type catalog and offering synthesis
//!
//! Fuses capability metadata, zonal availability, pricing, and the
//! unavailable-offerings cache into the filtered [`InstanceType`] set the
//! launch pipeline consumes. The fully initialized set is cached under a
//! composite key mixing change counters for (types, offerings,
//! unavailability) with hashes of the vSwitch zones and kubelet
//! configuration, so any upstream change invalidates dependent compositions
//! without explicit wiring.

pub mod types;

pub use types::{new_instance_type, InstanceType, Offering};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::cache::{TtlCache, UnavailableOfferings};
use crate::crd::{ECSNodeClass, KubeletConfiguration, VSwitch};
use crate::ecs::{
    AvailableZone, DescribeAvailableResourceRequest, DescribeInstanceTypesRequest, EcsApi,
    InstanceTypeData,
};
use crate::nodeclaim::CapacityType;
use crate::options::Options;
use crate::pricing::PricingProvider;
use crate::utils::ChangeMonitor;
use crate::vswitch::VSwitchProvider;
use crate::{Error, Result};

const INSTANCE_TYPES_PAGE_SIZE: i64 = 100;

/// Produces the cached, filtered instance-type set for launches
pub struct InstanceTypeProvider {
    region: String,
    ecs: Arc<dyn EcsApi>,
    options: Arc<Options>,
    pricing: Arc<PricingProvider>,
    vswitch: Arc<VSwitchProvider>,
    unavailable: Arc<UnavailableOfferings>,

    instance_types_info: RwLock<Vec<InstanceTypeData>>,
    instance_type_offerings: RwLock<BTreeMap<String, BTreeSet<String>>>,
    cache: TtlCache<Vec<Arc<InstanceType>>>,

    cm: ChangeMonitor,
    // change counters baked into the cache key; bumped only when the
    // underlying content actually changed
    instance_types_seq: AtomicU64,
    offerings_seq: AtomicU64,
}

impl InstanceTypeProvider {
    /// Create a provider wiring in pricing, vswitch, and unavailability
    pub fn new(
        region: impl Into<String>,
        ecs: Arc<dyn EcsApi>,
        options: Arc<Options>,
        pricing: Arc<PricingProvider>,
        vswitch: Arc<VSwitchProvider>,
        unavailable: Arc<UnavailableOfferings>,
    ) -> Self {
        Self {
            region: region.into(),
            ecs,
            options,
            pricing,
            vswitch,
            unavailable,
            instance_types_info: RwLock::new(Vec::new()),
            instance_type_offerings: RwLock::new(BTreeMap::new()),
            cache: TtlCache::with_default_ttl(),
            cm: ChangeMonitor::new(),
            instance_types_seq: AtomicU64::new(0),
            offerings_seq: AtomicU64::new(0),
        }
    }

    /// The fully initialized instance types for a NodeClass
    ///
    /// A cache hit returns a shallow copy so callers can reorder freely.
    pub fn list(
        &self,
        kubelet_config: Option<&KubeletConfiguration>,
        node_class: &ECSNodeClass,
    ) -> Result<Vec<Arc<InstanceType>>> {
        let info = self.instance_types_info.read();
        let offerings = self.instance_type_offerings.read();

        let default_kc = KubeletConfiguration::default();
        let kc = kubelet_config.unwrap_or(&default_kc);

        if info.is_empty() {
            return Err(Error::cloud_api("no instance types found"));
        }
        if offerings.is_empty() {
            return Err(Error::cloud_api("no instance type offerings found"));
        }
        let status_vswitches: &[VSwitch] = node_class
            .status
            .as_ref()
            .map(|s| s.v_switches.as_slice())
            .unwrap_or_default();
        if status_vswitches.is_empty() {
            return Err(Error::cloud_api("no vswitches found"));
        }

        let vswitch_zones: BTreeSet<&str> =
            status_vswitches.iter().map(|v| v.zone_id.as_str()).collect();
        let key = format!(
            "{}-{}-{}-{:016x}-{:016x}",
            self.instance_types_seq.load(Ordering::SeqCst),
            self.offerings_seq.load(Ordering::SeqCst),
            self.unavailable.seq_num(),
            crate::hash::content_hash(&vswitch_zones),
            crate::hash::content_hash(kc),
        );
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        // all zones any offering is known in; derived from the cached
        // offerings map so it stays out of the cache key
        let all_zones: BTreeSet<String> = offerings.values().flatten().cloned().collect();
        if self.cm.has_changed("zones", &all_zones) {
            debug!(zones = ?all_zones, "discovered zones");
        }

        let mut result = Vec::with_capacity(info.len());
        for item in info.iter() {
            let type_zones = offerings.get(&item.instance_type_id);
            let created = self.create_offerings(
                &item.instance_type_id,
                &all_zones,
                type_zones,
                status_vswitches,
            );
            let instance_type = new_instance_type(
                item,
                kc,
                &self.region,
                self.options.vm_memory_overhead_percent,
                created,
            )?;
            result.push(Arc::new(instance_type));
        }

        self.cache.insert(key, result.clone());
        Ok(result)
    }

    /// Refresh instance-type metadata from the cloud
    pub async fn update_instance_types(&self) -> Result<()> {
        // the fetch happens outside the lock; the write section below keeps
        // concurrent updaters from publishing interleaved snapshots
        let instance_types = self.fetch_all_instance_types().await?;

        let mut info = self.instance_types_info.write();
        let names: Vec<&str> = instance_types
            .iter()
            .map(|i| i.instance_type_id.as_str())
            .collect();
        if self.cm.has_changed("instance-types", &names) {
            // advance the counter only on real change so cache keys don't
            // churn over identical content
            self.instance_types_seq.fetch_add(1, Ordering::SeqCst);
            debug!(count = instance_types.len(), "discovered instance types");
        }
        *info = instance_types;
        Ok(())
    }

    /// Refresh per-zone availability from the cloud
    pub async fn update_instance_type_offerings(&self) -> Result<()> {
        let response = self
            .ecs
            .describe_available_resource(DescribeAvailableResourceRequest {
                region_id: self.region.clone(),
                destination_resource: "InstanceType".to_string(),
                instance_type: None,
            })
            .await?;
        if response.available_zones.is_empty() {
            return Err(Error::cloud_api(
                "DescribeAvailableResource returned no instance types",
            ));
        }

        let mut collected: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for zone in &response.available_zones {
            if zone.status_category == "WithStock" {
                process_available_resources(zone, &mut collected);
            }
        }

        let mut offerings = self.instance_type_offerings.write();
        if self.cm.has_changed("instance-type-offerings", &collected) {
            self.offerings_seq.fetch_add(1, Ordering::SeqCst);
            debug!(
                instance_type_count = collected.len(),
                "discovered offerings for instance types"
            );
        }
        *offerings = collected;
        Ok(())
    }

    /// Walk the provider lock chain to detect deadlock
    pub async fn liveness_probe(&self) -> Result<()> {
        self.vswitch.liveness_probe().await?;
        self.pricing.liveness_probe()
    }

    /// Drop all cached metadata; the next updates start from scratch
    pub fn reset(&self) {
        self.instance_types_info.write().clear();
        self.instance_type_offerings.write().clear();
        self.cache.flush();
    }

    // One offering per supported capacity type per known zone: on-demand
    // whenever the price is known, spot only once a spot price is known.
    // Availability requires the zone in the type's support set, a vSwitch
    // for the zone, and no unavailable-offerings entry.
    fn create_offerings(
        &self,
        instance_type: &str,
        all_zones: &BTreeSet<String>,
        type_zones: Option<&BTreeSet<String>>,
        vswitches: &[VSwitch],
    ) -> Vec<Offering> {
        let mut offerings = Vec::new();
        for zone in all_zones {
            let zone_supported = type_zones.is_some_and(|z| z.contains(zone));
            let vswitch = vswitches.iter().find(|v| v.zone_id == *zone);
            let zone_id = vswitch.map(|v| v.zone_id.as_str());

            if let Some(od_price) = self.pricing.on_demand_price(instance_type) {
                let unavailable =
                    self.unavailable
                        .is_unavailable(instance_type, zone, CapacityType::OnDemand);
                offerings.push(Offering::new(
                    zone,
                    CapacityType::OnDemand,
                    zone_id,
                    od_price,
                    !unavailable && zone_supported && vswitch.is_some(),
                ));
            }
            if let Some(spot_price) = self.pricing.spot_price(instance_type, zone) {
                let unavailable =
                    self.unavailable
                        .is_unavailable(instance_type, zone, CapacityType::Spot);
                offerings.push(Offering::new(
                    zone,
                    CapacityType::Spot,
                    zone_id,
                    spot_price,
                    !unavailable && zone_supported && vswitch.is_some(),
                ));
            }
        }
        offerings
    }

    async fn fetch_all_instance_types(&self) -> Result<Vec<InstanceTypeData>> {
        let mut collected = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let response = self
                .ecs
                .describe_instance_types(DescribeInstanceTypesRequest {
                    next_token: next_token.clone(),
                    max_results: INSTANCE_TYPES_PAGE_SIZE,
                })
                .await?;
            if response.instance_types.is_empty() {
                break;
            }
            collected.extend(response.instance_types);
            match response.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }
        Ok(collected)
    }
}

fn process_available_resources(
    zone: &AvailableZone,
    collected: &mut BTreeMap<String, BTreeSet<String>>,
) {
    for resource in &zone.available_resources {
        for supported in &resource.supported_resources {
            if supported.status_category == "WithStock" {
                collected
                    .entry(supported.value.clone())
                    .or_default()
                    .insert(zone.zone_id.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ECSNodeClassSpec, ECSNodeClassStatus};
    use crate::ecs::{
        AvailableResource, DescribeAvailableResourceResponse, DescribeInstanceTypesResponse,
        MockEcsApi, MockVpcApi, SupportedResource,
    };
    use crate::pricing::MockPriceFeed;

    fn node_class(zones: Vec<&str>) -> ECSNodeClass {
        let mut nc = ECSNodeClass::new("default", ECSNodeClassSpec::default());
        nc.status = Some(ECSNodeClassStatus {
            v_switches: zones
                .iter()
                .enumerate()
                .map(|(i, zone)| VSwitch {
                    id: format!("vsw-{i}"),
                    zone_id: zone.to_string(),
                })
                .collect(),
            ..Default::default()
        });
        nc
    }

    fn type_data(name: &str) -> InstanceTypeData {
        InstanceTypeData {
            instance_type_id: name.to_string(),
            cpu_core_count: 2,
            cpu_architecture: "X86".to_string(),
            memory_size: 8.0,
            ..Default::default()
        }
    }

    fn availability(zone: &str, types: Vec<&str>) -> AvailableZone {
        AvailableZone {
            zone_id: zone.to_string(),
            status: "Available".to_string(),
            status_category: "WithStock".to_string(),
            available_resources: vec![AvailableResource {
                supported_resources: types
                    .into_iter()
                    .map(|t| SupportedResource {
                        value: t.to_string(),
                        status: "Available".to_string(),
                        status_category: "WithStock".to_string(),
                    })
                    .collect(),
            }],
        }
    }

    fn provider(ecs: MockEcsApi) -> InstanceTypeProvider {
        let pricing = Arc::new(PricingProvider::new(
            "cn-beijing",
            Arc::new(MockPriceFeed::new()),
        ));
        let vswitch = Arc::new(VSwitchProvider::new(
            "cn-beijing",
            Arc::new(MockVpcApi::new()),
        ));
        InstanceTypeProvider::new(
            "cn-beijing",
            Arc::new(ecs),
            Arc::new(Options {
                cluster_name: "test".to_string(),
                ..Default::default()
            }),
            pricing,
            vswitch,
            Arc::new(UnavailableOfferings::new()),
        )
    }

    fn seeded_provider() -> InstanceTypeProvider {
        let mut ecs = MockEcsApi::new();
        ecs.expect_describe_instance_types().returning(|req| {
            if req.next_token.is_none() {
                Ok(DescribeInstanceTypesResponse {
                    next_token: Some(String::new()),
                    instance_types: vec![type_data("ecs.g7.large"), type_data("ecs.c6.large")],
                })
            } else {
                Ok(DescribeInstanceTypesResponse::default())
            }
        });
        ecs.expect_describe_available_resource().returning(|_| {
            Ok(DescribeAvailableResourceResponse {
                available_zones: vec![
                    availability("cn-beijing-a", vec!["ecs.g7.large", "ecs.c6.large"]),
                    availability("cn-beijing-b", vec!["ecs.g7.large"]),
                ],
            })
        });
        provider(ecs)
    }

    #[tokio::test]
    async fn list_requires_metadata_and_vswitches() {
        let p = seeded_provider();
        let nc = node_class(vec!["cn-beijing-a"]);
        assert!(p.list(None, &nc).is_err());

        p.update_instance_types().await.unwrap();
        assert!(p.list(None, &nc).is_err());

        p.update_instance_type_offerings().await.unwrap();
        assert!(p.list(None, &nc).is_ok());

        let empty = node_class(vec![]);
        assert!(p.list(None, &empty).is_err());
    }

    #[tokio::test]
    async fn offerings_are_mutually_exclusive_and_priced() {
        let p = seeded_provider();
        p.update_instance_types().await.unwrap();
        p.update_instance_type_offerings().await.unwrap();

        let nc = node_class(vec!["cn-beijing-a", "cn-beijing-b"]);
        let types = p.list(None, &nc).unwrap();
        assert_eq!(types.len(), 2);

        for it in &types {
            let mut seen = BTreeSet::new();
            for o in &it.offerings {
                assert!(seen.insert((o.zone().to_string(), o.capacity_type().unwrap())));
                assert!(o.price > 0.0);
            }
        }
    }

    #[tokio::test]
    async fn availability_needs_zone_support_and_vswitch() {
        let p = seeded_provider();
        p.update_instance_types().await.unwrap();
        p.update_instance_type_offerings().await.unwrap();

        // only zone a has a vswitch
        let nc = node_class(vec!["cn-beijing-a"]);
        let types = p.list(None, &nc).unwrap();
        let c6 = types
            .iter()
            .find(|t| t.name == "ecs.c6.large")
            .unwrap();

        // c6 is stocked in zone a only, and zone b has no vswitch anyway
        for offering in &c6.offerings {
            if offering.zone() == "cn-beijing-a" {
                assert!(offering.available);
            } else {
                assert!(!offering.available);
            }
        }
    }

    #[tokio::test]
    async fn unavailable_offerings_mask_availability() {
        let p = seeded_provider();
        p.update_instance_types().await.unwrap();
        p.update_instance_type_offerings().await.unwrap();

        let nc = node_class(vec!["cn-beijing-a"]);
        p.unavailable.mark_unavailable(
            "InsufficientInstanceCapacity",
            "ecs.g7.large",
            "cn-beijing-a",
            CapacityType::Spot,
        );
        let types = p.list(None, &nc).unwrap();
        let g7 = types.iter().find(|t| t.name == "ecs.g7.large").unwrap();
        for offering in &g7.offerings {
            if offering.zone() == "cn-beijing-a" {
                match offering.capacity_type().unwrap() {
                    CapacityType::Spot => assert!(!offering.available),
                    CapacityType::OnDemand => assert!(offering.available),
                }
            }
        }
    }

    #[tokio::test]
    async fn cache_key_tracks_unavailability_seq() {
        let p = seeded_provider();
        p.update_instance_types().await.unwrap();
        p.update_instance_type_offerings().await.unwrap();

        let nc = node_class(vec!["cn-beijing-a"]);
        let before = p.list(None, &nc).unwrap();
        let g7 = before.iter().find(|t| t.name == "ecs.g7.large").unwrap();
        assert!(g7
            .available_offerings()
            .any(|o| o.capacity_type() == Some(CapacityType::Spot)));

        // marking an offering unavailable must invalidate the cached set
        p.unavailable.mark_unavailable(
            "InsufficientInstanceCapacity",
            "ecs.g7.large",
            "cn-beijing-a",
            CapacityType::Spot,
        );
        let after = p.list(None, &nc).unwrap();
        let g7 = after.iter().find(|t| t.name == "ecs.g7.large").unwrap();
        assert!(!g7
            .available_offerings()
            .any(|o| o.capacity_type() == Some(CapacityType::Spot)));
    }

    #[tokio::test]
    async fn seq_nums_only_advance_on_change() {
        let p = seeded_provider();
        p.update_instance_types().await.unwrap();
        let first = p.instance_types_seq.load(Ordering::SeqCst);
        p.update_instance_types().await.unwrap();
        // identical content does not churn the counter
        assert_eq!(p.instance_types_seq.load(Ordering::SeqCst), first);
    }
}
