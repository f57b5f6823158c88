//! Supporting types for the ECSNodeClass CRD

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::scheduling::NodeSelectorRequirement;
use crate::{Error, Result};

/// Selection logic for the vSwitches a node may launch into
///
/// Fields within a term are ANDed; terms are ORed.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSwitchSelectorTerm {
    /// Tags used to select vSwitches; a value of `*` selects all values of
    /// the key
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// The vSwitch id in ECS
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
}

impl VSwitchSelectorTerm {
    /// Every term needs at least one qualifying field
    pub fn validate(&self) -> Result<()> {
        if self.tags.is_empty() && self.id.is_empty() {
            return Err(Error::validation(
                "vSwitchSelectorTerms expected at least one of ['tags', 'id']",
            ));
        }
        Ok(())
    }
}

/// Selection logic for security groups attached to launched nodes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroupSelectorTerm {
    /// Tags used to select security groups; `*` selects all values of a key
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// The security group id in ECS
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// The security group name field (not the name tag)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl SecurityGroupSelectorTerm {
    /// Every term needs at least one qualifying field
    pub fn validate(&self) -> Result<()> {
        if self.tags.is_empty() && self.id.is_empty() && self.name.is_empty() {
            return Err(Error::validation(
                "securityGroupSelectorTerms expected at least one of ['tags', 'id', 'name']",
            ));
        }
        Ok(())
    }
}

/// Selection logic for the images nodes boot from
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSelectorTerm {
    /// `family@version` shorthand selecting a curated image line, e.g.
    /// `AlibabaCloudLinux3@latest`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    /// The image id in ECS
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// The image name in ECS
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Image owner alias (system, self, others, marketplace, share)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
    /// Tags used to select images; `*` selects all values of a key
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl ImageSelectorTerm {
    /// Every term needs a qualifying field; aliases exclude everything else
    pub fn validate(&self) -> Result<()> {
        let has_other = !self.id.is_empty()
            || !self.name.is_empty()
            || !self.owner.is_empty()
            || !self.tags.is_empty();
        if self.alias.is_empty() && !has_other {
            return Err(Error::validation(
                "imageSelectorTerms expected at least one of ['alias', 'id', 'name', 'owner', 'tags']",
            ));
        }
        if !self.alias.is_empty() && has_other {
            return Err(Error::validation(
                "'alias' is mutually exclusive with other imageSelectorTerms fields",
            ));
        }
        Ok(())
    }
}

/// The curated image lines a NodeClass may select by alias
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFamily {
    /// Alibaba Cloud Linux 3
    AlibabaCloudLinux3,
    /// Alibaba Cloud Linux 2
    AlibabaCloudLinux2,
    /// User-supplied images selected by id/name/tags
    Custom,
}

impl ImageFamily {
    /// Parse the family half of an `family@version` alias
    pub fn from_alias(alias: &str) -> Result<(Self, String)> {
        let (family, version) = match alias.split_once('@') {
            Some((family, version)) => (family, version),
            None => (alias, "latest"),
        };
        if family.is_empty() || version.is_empty() {
            return Err(Error::validation(format!("invalid image alias {alias:?}")));
        }
        let parsed = match family {
            "AlibabaCloudLinux3" => ImageFamily::AlibabaCloudLinux3,
            "AlibabaCloudLinux2" => ImageFamily::AlibabaCloudLinux2,
            _ => {
                return Err(Error::validation(format!(
                    "image family {family:?} is not supported, must be one of ['AlibabaCloudLinux3', 'AlibabaCloudLinux2']"
                )))
            }
        };
        Ok((parsed, version.to_string()))
    }
}

/// Kubelet arguments applied to provisioned nodes
///
/// A subset of the upstream kubelet configuration; names and semantics
/// follow the upstream types.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfiguration {
    /// IP addresses for the cluster DNS server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_dns: Vec<String>,
    /// Override for the maximum number of pods on a node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pods: Option<i32>,
    /// Cap of pods per cpu core; the lower of this and maxPods wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods_per_core: Option<i32>,
    /// Resources reserved for OS system daemons and kernel memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_reserved: Option<BTreeMap<String, String>>,
    /// Resources reserved for kubernetes system components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_reserved: Option<BTreeMap<String, String>>,
    /// Signal names to quantities defining hard eviction thresholds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_hard: Option<BTreeMap<String, String>>,
    /// Signal names to quantities defining soft eviction thresholds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_soft: Option<BTreeMap<String, String>>,
    /// Grace periods matching each soft eviction signal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_soft_grace_period: Option<BTreeMap<String, String>>,
    /// Maximum grace period for pods terminated on soft eviction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_max_pod_grace_period: Option<i32>,
    /// Disk usage percent above which image GC always runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_gc_high_threshold_percent: Option<i32>,
    /// Disk usage percent below which image GC never runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_gc_low_threshold_percent: Option<i32>,
    /// Enforce CPU CFS quota for containers specifying CPU limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cfs_quota: Option<bool>,
}

impl KubeletConfiguration {
    /// Cross-field checks the admission webhook also enforces
    pub fn validate(&self) -> Result<()> {
        if let (Some(high), Some(low)) = (
            self.image_gc_high_threshold_percent,
            self.image_gc_low_threshold_percent,
        ) {
            if high <= low {
                return Err(Error::validation(
                    "imageGCHighThresholdPercent must be greater than imageGCLowThresholdPercent",
                ));
            }
        }
        if let (Some(soft), Some(grace)) =
            (&self.eviction_soft, &self.eviction_soft_grace_period)
        {
            for key in soft.keys() {
                if !grace.contains_key(key) {
                    return Err(Error::validation(format!(
                        "evictionSoft {key} does not have a matching evictionSoftGracePeriod"
                    )));
                }
            }
            for key in grace.keys() {
                if !soft.contains_key(key) {
                    return Err(Error::validation(format!(
                        "evictionSoftGracePeriod {key} does not have a matching evictionSoft"
                    )));
                }
            }
        } else if self.eviction_soft.is_some() != self.eviction_soft_grace_period.is_some() {
            return Err(Error::validation(
                "evictionSoft and evictionSoftGracePeriod must be configured together",
            ));
        }
        Ok(())
    }
}

/// Disk categories ECS accepts for system disks
pub const SYSTEM_DISK_CATEGORIES: &[&str] = &[
    "cloud",
    "cloud_efficiency",
    "cloud_ssd",
    "cloud_essd",
    "cloud_auto",
    "cloud_essd_entry",
];

/// System disk applied to provisioned nodes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemDisk {
    /// Disk category, one of [`SYSTEM_DISK_CATEGORIES`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Disk size in GiB, at least 20
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i32>,
    /// Disk name, 2-128 characters starting with a letter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_name: Option<String>,
    /// ESSD performance level PL0..PL3
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_level: Option<String>,
    /// Automatic snapshot policy applied to the disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_snapshot_policy_id: Option<String>,
    /// Enable the performance burst feature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bursting_enabled: Option<bool>,
}

impl SystemDisk {
    /// Field checks the admission webhook also enforces
    pub fn validate(&self) -> Result<()> {
        if let Some(category) = &self.category {
            if !SYSTEM_DISK_CATEGORIES.contains(&category.as_str()) {
                return Err(Error::validation(format!(
                    "system disk category {category:?} is not supported"
                )));
            }
        }
        if let Some(size) = self.size {
            if size < 20 {
                return Err(Error::validation(format!(
                    "system disk size {size} GiB is below the 20 GiB minimum"
                )));
            }
        }
        if let Some(level) = &self.performance_level {
            if !matches!(level.as_str(), "PL0" | "PL1" | "PL2" | "PL3") {
                return Err(Error::validation(format!(
                    "system disk performance level {level:?} must be PL0..PL3"
                )));
            }
        }
        if let Some(name) = &self.disk_name {
            let valid_start = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
            if name.len() < 2 || name.len() > 128 || !valid_start || name.starts_with("http") {
                return Err(Error::validation(format!(
                    "system disk name {name:?} format invalid"
                )));
            }
        }
        Ok(())
    }
}

/// Resolved vSwitch selector value
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSwitch {
    /// ID of the vSwitch
    pub id: String,
    /// The associated availability zone ID
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone_id: String,
}

/// Resolved security-group selector value
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroup {
    /// ID of the security group
    pub id: String,
    /// Name of the security group
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// Resolved image selector value
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// ID of the image
    pub id: String,
    /// Name of the image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Node requirements a machine must satisfy to run this image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<NodeSelectorRequirement>,
}

/// A condition on the ECSNodeClass status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `VSwitchesReady`
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False`, or `Unknown`
    pub status: String,
    /// Machine-readable reason for the last transition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Human-readable context for the last transition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// When the condition last changed status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Resolved state of the ECSNodeClass
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ECSNodeClassStatus {
    /// vSwitches currently matched by the selectors, sorted by descending
    /// available IPs then by id
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub v_switches: Vec<VSwitch>,
    /// Security groups currently matched by the selectors, sorted by id
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<SecurityGroup>,
    /// Images currently matched by the selectors, newest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,
    /// Conditions representing the resolution state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ECSNodeClassStatus {
    /// Set a condition to `True`, replacing any prior condition of the type
    pub fn set_condition_true(&mut self, type_: &str) {
        self.upsert_condition(Condition {
            type_: type_.to_string(),
            status: "True".to_string(),
            ..Default::default()
        });
    }

    /// Set a condition to `False` with a reason and message
    pub fn set_condition_false(&mut self, type_: &str, reason: &str, message: &str) {
        self.upsert_condition(Condition {
            type_: type_.to_string(),
            status: "False".to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            ..Default::default()
        });
    }

    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// True when every resolution condition reports `True`
    pub fn is_ready(&self) -> bool {
        [
            super::CONDITION_VSWITCHES_READY,
            super::CONDITION_SECURITY_GROUPS_READY,
            super::CONDITION_IMAGES_READY,
        ]
        .iter()
        .all(|t| matches!(self.condition(t), Some(c) if c.status == "True"))
    }

    fn upsert_condition(&mut self, mut condition: Condition) {
        let transition = self
            .condition(&condition.type_)
            .map(|prev| prev.status != condition.status)
            .unwrap_or(true);
        if transition {
            condition.last_transition_time = Some(chrono::Utc::now().to_rfc3339());
        } else if let Some(prev) = self.condition(&condition.type_) {
            condition.last_transition_time = prev.last_transition_time.clone();
        }
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_terms_need_a_qualifying_field() {
        assert!(VSwitchSelectorTerm::default().validate().is_err());
        assert!(VSwitchSelectorTerm {
            id: "vsw-123abc".to_string(),
            ..Default::default()
        }
        .validate()
        .is_ok());

        assert!(SecurityGroupSelectorTerm::default().validate().is_err());
        assert!(SecurityGroupSelectorTerm {
            name: "node-sg".to_string(),
            ..Default::default()
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn image_alias_excludes_other_fields() {
        let term = ImageSelectorTerm {
            alias: "AlibabaCloudLinux3@latest".to_string(),
            id: "m-123".to_string(),
            ..Default::default()
        };
        assert!(term.validate().is_err());
    }

    #[test]
    fn image_family_parses_alias() {
        let (family, version) = ImageFamily::from_alias("AlibabaCloudLinux3@latest").unwrap();
        assert_eq!(family, ImageFamily::AlibabaCloudLinux3);
        assert_eq!(version, "latest");

        let (family, version) = ImageFamily::from_alias("AlibabaCloudLinux2").unwrap();
        assert_eq!(family, ImageFamily::AlibabaCloudLinux2);
        assert_eq!(version, "latest");

        assert!(ImageFamily::from_alias("Ubuntu@latest").is_err());
        assert!(ImageFamily::from_alias("@latest").is_err());
    }

    #[test]
    fn system_disk_validation() {
        let mut disk = SystemDisk {
            category: Some("cloud_essd".to_string()),
            size: Some(40),
            performance_level: Some("PL1".to_string()),
            ..Default::default()
        };
        assert!(disk.validate().is_ok());

        disk.size = Some(10);
        assert!(disk.validate().is_err());

        disk.size = Some(40);
        disk.category = Some("local_ssd".to_string());
        assert!(disk.validate().is_err());

        disk.category = Some("cloud".to_string());
        disk.disk_name = Some("http://bad".to_string());
        assert!(disk.validate().is_err());
    }

    #[test]
    fn kubelet_soft_eviction_needs_grace_periods() {
        let kc = KubeletConfiguration {
            eviction_soft: Some(BTreeMap::from([(
                "memory.available".to_string(),
                "5%".to_string(),
            )])),
            ..Default::default()
        };
        assert!(kc.validate().is_err());

        let kc = KubeletConfiguration {
            eviction_soft: Some(BTreeMap::from([(
                "memory.available".to_string(),
                "5%".to_string(),
            )])),
            eviction_soft_grace_period: Some(BTreeMap::from([(
                "memory.available".to_string(),
                "1m".to_string(),
            )])),
            ..Default::default()
        };
        assert!(kc.validate().is_ok());
    }

    #[test]
    fn conditions_replace_by_type_and_track_transitions() {
        let mut status = ECSNodeClassStatus::default();
        status.set_condition_false("VSwitchesReady", "VSwitchesNotFound", "no match");
        assert!(!status.is_ready());

        status.set_condition_true("VSwitchesReady");
        status.set_condition_true("SecurityGroupsReady");
        status.set_condition_true("ImagesReady");
        assert!(status.is_ready());
        assert_eq!(
            status
                .conditions
                .iter()
                .filter(|c| c.type_ == "VSwitchesReady")
                .count(),
            1
        );
    }
}
