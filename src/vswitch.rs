//! vSwitch discovery and in-flight IP accounting
//!
//! Launches are speculative over multiple (type, zone) candidates and the
//! cloud picks one, so available-IP counts must be debited before the launch
//! and re-credited for the candidates the cloud did not pick. Without that
//! ledger, concurrent launches double-count the same addresses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::TtlCache;
use crate::crd::{self, ECSNodeClass};
use crate::ecs::{
    CreateAutoProvisioningGroupRequest, DescribeVSwitchesRequest, Tag, VSwitchData, VpcApi,
};
use crate::instancetype::InstanceType;
use crate::nodeclaim::CapacityType;
use crate::scheduling::{Requirement, Requirements};
use crate::utils::ChangeMonitor;
use crate::{Error, Result};

const PAGE_SIZE: i32 = 50;
// runaway guard for the page loop, far above any real subnet count
const MAX_PAGES: i32 = 360;

/// How long resolved selector results stay fresh
pub const SELECTOR_CACHE_TTL: Duration = Duration::from_secs(60);
/// How long an observed available-IP count stays fresh
pub const AVAILABLE_IP_TTL: Duration = Duration::from_secs(5 * 60);

/// A subnet candidate for a launch
#[derive(Clone, Debug, PartialEq)]
pub struct VSwitch {
    /// vSwitch id
    pub id: String,
    /// Availability zone of the subnet
    pub zone_id: String,
    /// Available IPv4 count at the time of selection
    pub available_ip_address_count: i64,
}

struct Inner {
    // selector-term hash -> resolved vswitches
    selector_cache: TtlCache<Vec<VSwitchData>>,
    // vswitch id -> last observed available IP count
    available_ips: TtlCache<i64>,
    // speculative deductions since the last refresh, keyed by vswitch id
    inflight_ips: HashMap<String, i64>,
}

/// Resolves vSwitch selectors and tracks speculative IP usage
pub struct VSwitchProvider {
    region: String,
    vpc: Arc<dyn VpcApi>,
    cm: ChangeMonitor,
    // one lock covers the selector cache, the IP cache, and the in-flight
    // map; every operation holds it end to end
    inner: Mutex<Inner>,
}

impl VSwitchProvider {
    /// Create a provider for a region
    pub fn new(region: impl Into<String>, vpc: Arc<dyn VpcApi>) -> Self {
        Self {
            region: region.into(),
            vpc,
            cm: ChangeMonitor::new(),
            inner: Mutex::new(Inner {
                selector_cache: TtlCache::new(SELECTOR_CACHE_TTL),
                available_ips: TtlCache::new(AVAILABLE_IP_TTL),
                inflight_ips: HashMap::new(),
            }),
        }
    }

    /// Resolve the NodeClass selector terms to concrete vSwitches
    ///
    /// Results are deduped across terms and cached by a hash of the term
    /// list. Each refreshed vSwitch repopulates the available-IP cache and
    /// clears any stale in-flight entry.
    pub async fn list(&self, node_class: &ECSNodeClass) -> Result<Vec<VSwitchData>> {
        let mut inner = self.inner.lock().await;

        if node_class.spec.v_switch_selector_terms.is_empty() {
            return Ok(Vec::new());
        }
        let cache_key =
            crate::hash::content_hash_string(&node_class.spec.v_switch_selector_terms);
        if let Some(switches) = inner.selector_cache.get(&cache_key) {
            return Ok(switches);
        }

        let mut switches: HashMap<String, VSwitchData> = HashMap::new();
        for term in &node_class.spec.v_switch_selector_terms {
            let tags: Vec<Tag> = term
                .tags
                .iter()
                .map(|(k, v)| {
                    // a value of '*' selects every value of the key
                    if v == "*" {
                        Tag::key_only(k)
                    } else {
                        Tag::new(k, v)
                    }
                })
                .collect();
            let id = (!term.id.is_empty()).then(|| term.id.clone());
            for vswitch in self.describe_vswitches(tags, id).await? {
                inner
                    .available_ips
                    .insert(&vswitch.v_switch_id, vswitch.available_ip_address_count);
                // the count was just refreshed from the cloud, so any
                // speculative deduction is stale
                inner.inflight_ips.remove(&vswitch.v_switch_id);
                switches.insert(vswitch.v_switch_id.clone(), vswitch);
            }
        }

        let resolved: Vec<VSwitchData> = switches.into_values().collect();
        inner.selector_cache.insert(cache_key, resolved.clone());
        let mut ids: Vec<&str> = resolved.iter().map(|v| v.v_switch_id.as_str()).collect();
        ids.sort();
        if self
            .cm
            .has_changed(&format!("vswitches/{}", node_class.name()), &ids)
        {
            debug!(
                node_class = node_class.name(),
                vswitches = ?ids,
                "discovered vswitches"
            );
        }
        Ok(resolved)
    }

    /// Pick one vSwitch per zone for a launch and debit its in-flight IPs
    ///
    /// For each zone the vSwitch with the most effective available IPs wins
    /// (in-flight deductions included). The debit per chosen vSwitch is the
    /// minimum `pods` capacity across instance types available in that
    /// (zone, capacity type).
    pub async fn zonal_vswitches_for_launch(
        &self,
        node_class: &ECSNodeClass,
        instance_types: &[Arc<InstanceType>],
        capacity_type: CapacityType,
    ) -> Result<HashMap<String, VSwitch>> {
        if node_class.status.as_ref().map_or(true, |s| s.v_switches.is_empty()) {
            return Err(Error::validation(format!(
                "no vSwitches matched selector {:?}",
                node_class.spec.v_switch_selector_terms
            )));
        }
        let status_vswitches = &node_class.status.as_ref().unwrap().v_switches;

        let mut inner = self.inner.lock().await;

        let available: HashMap<String, i64> = status_vswitches
            .iter()
            .filter_map(|v| inner.available_ips.get(&v.id).map(|ips| (v.id.clone(), ips)))
            .collect();

        let mut zonal: HashMap<String, VSwitch> = HashMap::new();
        for vswitch in status_vswitches {
            let candidate_ips = available.get(&vswitch.id).copied().unwrap_or(0);
            if let Some(current) = zonal.get(&vswitch.zone_id) {
                // compare on the effective count: an in-flight entry
                // supersedes the cached value
                let current_effective = inner
                    .inflight_ips
                    .get(&current.id)
                    .copied()
                    .unwrap_or(current.available_ip_address_count);
                let candidate_effective = inner
                    .inflight_ips
                    .get(&vswitch.id)
                    .copied()
                    .unwrap_or(candidate_ips);
                if current_effective >= candidate_effective {
                    continue;
                }
            }
            zonal.insert(
                vswitch.zone_id.clone(),
                VSwitch {
                    id: vswitch.id.clone(),
                    zone_id: vswitch.zone_id.clone(),
                    available_ip_address_count: candidate_ips,
                },
            );
        }

        for vswitch in zonal.values() {
            let predicted_ips_used = min_pods(
                instance_types,
                &Requirements::new([
                    Requirement::new_in(crd::LABEL_CAPACITY_TYPE, [capacity_type.as_str()]),
                    Requirement::new_in(crd::LABEL_TOPOLOGY_ZONE, [vswitch.zone_id.as_str()]),
                ]),
            );
            let prev_ips = inner
                .inflight_ips
                .get(&vswitch.id)
                .copied()
                .unwrap_or(vswitch.available_ip_address_count);
            inner
                .inflight_ips
                .insert(vswitch.id.clone(), prev_ips - predicted_ips_used);
        }
        Ok(zonal)
    }

    /// Re-credit the in-flight IPs of candidates the cloud did not launch
    /// into
    ///
    /// `fulfilled_vswitch_ids` are the vSwitches actually populated by the
    /// launch. Each requested-but-unused vSwitch gets its predicted debit
    /// back, but only while the cached available-IP count still matches the
    /// value observed at selection time; a changed count means a refresh
    /// already reconciled it.
    pub async fn update_inflight_ips(
        &self,
        request: &CreateAutoProvisioningGroupRequest,
        fulfilled_vswitch_ids: &[String],
        instance_types: &[Arc<InstanceType>],
        chosen_vswitches: &[VSwitch],
        capacity_type: CapacityType,
    ) {
        let mut inner = self.inner.lock().await;

        let mut requested: Vec<&str> = request
            .launch_template_configs
            .iter()
            .map(|c| c.v_switch_id.as_str())
            .filter(|id| !id.is_empty())
            .collect();
        requested.sort();
        requested.dedup();

        for requested_id in requested {
            if fulfilled_vswitch_ids.iter().any(|id| id == requested_id) {
                continue;
            }
            let Some(cached_ips) = inner.available_ips.get(requested_id) else {
                continue;
            };
            let Some(original) = chosen_vswitches.iter().find(|v| v.id == requested_id) else {
                continue;
            };
            // freshness gate: a changed count means the cloud view was
            // refreshed after our debit, which already folded it in
            if original.available_ip_address_count != cached_ips {
                continue;
            }
            if let Some(ips) = inner.inflight_ips.get(requested_id).copied() {
                let restored = min_pods(
                    instance_types,
                    &Requirements::new([
                        Requirement::new_in(crd::LABEL_CAPACITY_TYPE, [capacity_type.as_str()]),
                        Requirement::new_in(
                            crd::LABEL_TOPOLOGY_ZONE,
                            [original.zone_id.as_str()],
                        ),
                    ]),
                );
                inner
                    .inflight_ips
                    .insert(requested_id.to_string(), ips + restored);
            }
        }
    }

    /// Current in-flight count for a vSwitch, for observability
    pub async fn inflight_ips(&self, vswitch_id: &str) -> Option<i64> {
        self.inner.lock().await.inflight_ips.get(vswitch_id).copied()
    }

    /// Verify the provider lock is acquirable
    pub async fn liveness_probe(&self) -> Result<()> {
        drop(self.inner.lock().await);
        Ok(())
    }

    async fn describe_vswitches(
        &self,
        tags: Vec<Tag>,
        v_switch_id: Option<String>,
    ) -> Result<Vec<VSwitchData>> {
        let mut collected = Vec::new();
        for page_number in 1..MAX_PAGES {
            let response = self
                .vpc
                .describe_vswitches(DescribeVSwitchesRequest {
                    region_id: self.region.clone(),
                    v_switch_id: v_switch_id.clone(),
                    tags: tags.clone(),
                    page_number,
                    page_size: PAGE_SIZE,
                })
                .await?;
            let page_len = response.v_switches.len();
            collected.extend(response.v_switches);
            if response.total_count < i64::from(page_number) * i64::from(PAGE_SIZE)
                || page_len < PAGE_SIZE as usize
            {
                break;
            }
        }
        Ok(collected)
    }
}

// Lower bound on the IPs a launch in (zone, capacity type) could consume:
// the smallest pods capacity across instance types available there.
fn min_pods(instance_types: &[Arc<InstanceType>], requirements: &Requirements) -> i64 {
    instance_types
        .iter()
        .filter(|it| it.has_compatible_offering(requirements))
        .map(|it| it.capacity.pods)
        .min()
        .unwrap_or(0)
}
