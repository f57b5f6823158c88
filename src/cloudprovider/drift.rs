//! Drift detection
//!
//! A node drifts when its NodeClass no longer describes it: the hashed spec
//! changed, the live instance lost or gained security groups, or it sits on
//! a vSwitch the selectors no longer match. Static drift is checked first to
//! save the instance lookup.

use std::collections::BTreeSet;

use crate::crd::{self, ECSNodeClass};
use crate::instance::Instance;
use crate::nodeclaim::NodeClaim;
use crate::{Error, Result};

/// Why a node no longer matches its NodeClass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriftReason {
    /// The hashed NodeClass spec changed since the node launched
    NodeClassDrift,
    /// The instance's security-group set differs from the resolved one
    SecurityGroupDrift,
    /// The instance's vSwitch is no longer matched by the selectors
    VSwitchDrift,
}

impl std::fmt::Display for DriftReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            DriftReason::NodeClassDrift => "NodeClassDrift",
            DriftReason::SecurityGroupDrift => "SecurityGroupDrift",
            DriftReason::VSwitchDrift => "VSwitchDrift",
        };
        f.write_str(reason)
    }
}

/// Compare the hash annotations on the NodeClass and NodeClaim
///
/// Drift is only meaningful when both sides carry a hash stamped under the
/// same hash version; differing versions compare as not drifted.
pub fn static_fields_drifted(
    node_claim: &NodeClaim,
    node_class: &ECSNodeClass,
) -> Option<DriftReason> {
    let class_annotations = node_class.metadata.annotations.as_ref()?;
    let claim_annotations = node_claim.metadata.annotations.as_ref()?;

    let class_hash = class_annotations.get(crd::ANNOTATION_NODECLASS_HASH)?;
    let class_hash_version = class_annotations.get(crd::ANNOTATION_NODECLASS_HASH_VERSION)?;
    let claim_hash = claim_annotations.get(crd::ANNOTATION_NODECLASS_HASH)?;
    let claim_hash_version = claim_annotations.get(crd::ANNOTATION_NODECLASS_HASH_VERSION)?;

    if class_hash_version != claim_hash_version {
        return None;
    }
    (class_hash != claim_hash).then_some(DriftReason::NodeClassDrift)
}

/// Compare the instance's security groups against the resolved set
///
/// An empty resolved set is an error: the selectors haven't resolved and a
/// drift verdict cannot be trusted.
pub fn security_groups_drifted(
    instance: &Instance,
    node_class: &ECSNodeClass,
) -> Result<Option<DriftReason>> {
    let resolved: BTreeSet<&str> = node_class
        .status
        .as_ref()
        .map(|s| s.security_groups.iter().map(|sg| sg.id.as_str()).collect())
        .unwrap_or_default();
    if resolved.is_empty() {
        return Err(Error::node_class_not_ready(
            "no security groups are present in the status",
        ));
    }
    let live: BTreeSet<&str> = instance
        .security_group_ids
        .iter()
        .map(String::as_str)
        .collect();
    Ok((resolved != live).then_some(DriftReason::SecurityGroupDrift))
}

/// Verify the instance's vSwitch still appears in the resolved set
pub fn vswitch_drifted(
    instance: &Instance,
    node_class: &ECSNodeClass,
) -> Result<Option<DriftReason>> {
    let vswitches = node_class
        .status
        .as_ref()
        .map(|s| s.v_switches.as_slice())
        .unwrap_or_default();
    if vswitches.is_empty() {
        return Err(Error::node_class_not_ready("no vswitches are discovered"));
    }
    let found = vswitches.iter().any(|v| v.id == instance.vswitch_id);
    Ok((!found).then_some(DriftReason::VSwitchDrift))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ECSNodeClassSpec, ECSNodeClassStatus, SecurityGroup, VSwitch};
    use crate::nodeclaim::CapacityType;
    use std::collections::BTreeMap;

    fn node_class(
        security_groups: Vec<&str>,
        vswitches: Vec<&str>,
        annotations: Option<(&str, &str)>,
    ) -> ECSNodeClass {
        let mut nc = ECSNodeClass::new("default", ECSNodeClassSpec::default());
        nc.status = Some(ECSNodeClassStatus {
            security_groups: security_groups
                .into_iter()
                .map(|id| SecurityGroup {
                    id: id.to_string(),
                    ..Default::default()
                })
                .collect(),
            v_switches: vswitches
                .into_iter()
                .map(|id| VSwitch {
                    id: id.to_string(),
                    zone_id: "cn-beijing-a".to_string(),
                })
                .collect(),
            ..Default::default()
        });
        if let Some((hash, version)) = annotations {
            nc.metadata.annotations = Some(BTreeMap::from([
                (crd::ANNOTATION_NODECLASS_HASH.to_string(), hash.to_string()),
                (
                    crd::ANNOTATION_NODECLASS_HASH_VERSION.to_string(),
                    version.to_string(),
                ),
            ]));
        }
        nc
    }

    fn claim_with_annotations(hash: &str, version: &str) -> NodeClaim {
        let mut claim = NodeClaim::default();
        claim.metadata.annotations = Some(BTreeMap::from([
            (crd::ANNOTATION_NODECLASS_HASH.to_string(), hash.to_string()),
            (
                crd::ANNOTATION_NODECLASS_HASH_VERSION.to_string(),
                version.to_string(),
            ),
        ]));
        claim
    }

    fn instance(security_groups: Vec<&str>, vswitch: &str) -> Instance {
        Instance {
            id: "i-abc".to_string(),
            image_id: "m-amd".to_string(),
            instance_type: "ecs.g7.large".to_string(),
            region: "cn-beijing".to_string(),
            zone: "cn-beijing-a".to_string(),
            capacity_type: CapacityType::OnDemand,
            security_group_ids: security_groups.into_iter().map(String::from).collect(),
            vswitch_id: vswitch.to_string(),
            tags: BTreeMap::new(),
            status: crate::instance::InstanceStatus::Running,
            creation_time: None,
        }
    }

    #[test]
    fn static_drift_symmetry() {
        // matching hash and version: no drift
        let nc = node_class(vec![], vec![], Some(("123", "v1")));
        let claim = claim_with_annotations("123", "v1");
        assert_eq!(static_fields_drifted(&claim, &nc), None);

        // differing hash under the same version: drift
        let claim = claim_with_annotations("456", "v1");
        assert_eq!(
            static_fields_drifted(&claim, &nc),
            Some(DriftReason::NodeClassDrift)
        );

        // differing versions never compare
        let claim = claim_with_annotations("456", "v2");
        assert_eq!(static_fields_drifted(&claim, &nc), None);

        // missing annotations never compare
        let claim = NodeClaim::default();
        assert_eq!(static_fields_drifted(&claim, &nc), None);
    }

    #[test]
    fn security_group_removal_is_drift() {
        let nc = node_class(vec!["sg-a", "sg-b"], vec![], None);
        let live = instance(vec!["sg-a"], "vsw-1");
        assert_eq!(
            security_groups_drifted(&live, &nc).unwrap(),
            Some(DriftReason::SecurityGroupDrift)
        );

        let live = instance(vec!["sg-b", "sg-a"], "vsw-1");
        assert_eq!(security_groups_drifted(&live, &nc).unwrap(), None);
    }

    #[test]
    fn empty_status_security_groups_is_fatal() {
        let nc = node_class(vec![], vec![], None);
        let live = instance(vec!["sg-a"], "vsw-1");
        assert!(security_groups_drifted(&live, &nc).is_err());
    }

    #[test]
    fn vswitch_migration_is_drift() {
        let nc = node_class(vec![], vec!["vsw-1", "vsw-2"], None);
        let live = instance(vec![], "vsw-3");
        assert_eq!(
            vswitch_drifted(&live, &nc).unwrap(),
            Some(DriftReason::VSwitchDrift)
        );

        let live = instance(vec![], "vsw-2");
        assert_eq!(vswitch_drifted(&live, &nc).unwrap(), None);
    }
}
