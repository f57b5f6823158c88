//! Host-runtime contract types
//!
//! NodeClaims and NodePools are owned by the host autoscaler runtime; this
//! provider reads them and, on create, projects launched instances back into
//! a NodeClaim. The shapes here carry exactly the fields the provider
//! consumes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::scheduling::NodeSelectorRequirement;

/// The purchase model for a launch
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CapacityType {
    /// Pay-as-you-go capacity
    OnDemand,
    /// Preemptible spot capacity
    Spot,
}

impl CapacityType {
    /// The well-known label value for this capacity type
    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityType::OnDemand => "on-demand",
            CapacityType::Spot => "spot",
        }
    }

    /// Derive the capacity type from an instance's spot strategy field
    pub fn from_spot_strategy(strategy: &str) -> Self {
        // NoSpot marks a regular pay-as-you-go instance; SpotWithPriceLimit
        // and SpotAsPriceGo are both spot
        if strategy.is_empty() || strategy == "NoSpot" {
            CapacityType::OnDemand
        } else {
            CapacityType::Spot
        }
    }

    /// Parse a well-known label value
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "on-demand" => Some(CapacityType::OnDemand),
            "spot" => Some(CapacityType::Spot),
            _ => None,
        }
    }
}

impl std::fmt::Display for CapacityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for one machine with the given requirements
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaim {
    /// Standard object metadata (name, labels, annotations)
    pub metadata: ObjectMeta,
    /// Desired machine shape
    pub spec: NodeClaimSpec,
    /// Observed machine state, stamped by this provider on create
    #[serde(default)]
    pub status: NodeClaimStatus,
}

/// Desired state of a NodeClaim
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimSpec {
    /// Scheduling requirements the machine must satisfy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<NodeSelectorRequirement>,
    /// Taints applied to the node on registration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    /// Taints applied only until the first pod schedules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub startup_taints: Vec<Taint>,
    /// Reference to the NodeClass realizing this claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_class_ref: Option<NodeClassReference>,
}

/// Observed state of a NodeClaim
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimStatus {
    /// `<region>.<instance-id>` once the machine exists
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider_id: String,
    /// Image the machine booted from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_id: String,
    /// Reported node capacity
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: BTreeMap<String, String>,
    /// Capacity remaining after reservations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocatable: BTreeMap<String, String>,
}

/// Reference from a NodeClaim or NodePool to its NodeClass
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeClassReference {
    /// API group of the node class
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    /// Kind of the node class
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Name of the node class
    pub name: String,
}

/// A pool of NodeClaims sharing a template
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    /// Standard object metadata
    pub metadata: ObjectMeta,
    /// Pool template fields consumed by this provider
    pub spec: NodePoolSpec,
}

/// Desired state of a NodePool
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// NodeClass realized by claims of this pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_class_ref: Option<NodeClassReference>,
}

/// The taint kubelet removes once it registers; keeps pods off the node
/// until registration completes
pub fn unregistered_taint() -> Taint {
    Taint {
        key: "karpenter.sh/unregistered".to_string(),
        effect: "NoExecute".to_string(),
        ..Default::default()
    }
}

/// True when `taint` matches key and effect of the unregistered taint
pub fn is_unregistered_taint(taint: &Taint) -> bool {
    taint.key == "karpenter.sh/unregistered" && taint.effect == "NoExecute"
}

impl NodeClaim {
    /// Requirements with `minValues` support, parsed into the typed engine
    pub fn requirements(&self) -> crate::scheduling::Requirements {
        crate::scheduling::Requirements::from_node_selector(&self.spec.requirements)
    }

    /// Name of this claim
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Labels of this claim
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_type_from_spot_strategy() {
        assert_eq!(
            CapacityType::from_spot_strategy("NoSpot"),
            CapacityType::OnDemand
        );
        assert_eq!(CapacityType::from_spot_strategy(""), CapacityType::OnDemand);
        assert_eq!(
            CapacityType::from_spot_strategy("SpotAsPriceGo"),
            CapacityType::Spot
        );
        assert_eq!(
            CapacityType::from_spot_strategy("SpotWithPriceLimit"),
            CapacityType::Spot
        );
    }

    #[test]
    fn capacity_type_label_round_trip() {
        for ct in [CapacityType::OnDemand, CapacityType::Spot] {
            assert_eq!(CapacityType::parse(ct.as_str()), Some(ct));
        }
        assert_eq!(CapacityType::parse("reserved"), None);
    }

    #[test]
    fn unregistered_taint_matches_itself() {
        assert!(is_unregistered_taint(&unregistered_taint()));
        let other = Taint {
            key: "node.kubernetes.io/unreachable".to_string(),
            effect: "NoExecute".to_string(),
            ..Default::default()
        };
        assert!(!is_unregistered_taint(&other));
    }
}
