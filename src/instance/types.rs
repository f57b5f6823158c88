//! Internal instance record projected from DescribeInstances

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::ecs::InstanceData;
use crate::nodeclaim::CapacityType;

/// Lifecycle status of an ECS instance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Created, not yet started
    Pending,
    /// Serving
    Running,
    /// Boot in progress
    Starting,
    /// Shutdown in progress
    Stopping,
    /// Shut down
    Stopped,
}

impl InstanceStatus {
    /// Parse the wire status string; unknown values read as pending
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Running" => InstanceStatus::Running,
            "Starting" => InstanceStatus::Starting,
            "Stopping" => InstanceStatus::Stopping,
            "Stopped" => InstanceStatus::Stopped,
            _ => InstanceStatus::Pending,
        }
    }

    /// True once shutdown has begun or finished
    pub fn is_terminating(&self) -> bool {
        matches!(self, InstanceStatus::Stopping | InstanceStatus::Stopped)
    }
}

/// Internal representation of a live ECS instance
#[derive(Clone, Debug)]
pub struct Instance {
    /// Instance id
    pub id: String,
    /// Image the instance booted from
    pub image_id: String,
    /// Instance type name
    pub instance_type: String,
    /// Region the instance runs in
    pub region: String,
    /// Zone the instance runs in
    pub zone: String,
    /// Purchase model derived from the spot strategy
    pub capacity_type: CapacityType,
    /// Attached security groups
    pub security_group_ids: Vec<String>,
    /// vSwitch the primary ENI joined
    pub vswitch_id: String,
    /// Instance tags
    pub tags: BTreeMap<String, String>,
    /// Lifecycle status
    pub status: InstanceStatus,
    /// Creation timestamp
    pub creation_time: Option<DateTime<Utc>>,
}

impl From<&InstanceData> for Instance {
    fn from(data: &InstanceData) -> Self {
        Self {
            id: data.instance_id.clone(),
            image_id: data.image_id.clone(),
            instance_type: data.instance_type.clone(),
            region: data.region_id.clone(),
            zone: data.zone_id.clone(),
            capacity_type: CapacityType::from_spot_strategy(&data.spot_strategy),
            security_group_ids: data.security_group_ids.clone(),
            vswitch_id: data.v_switch_id.clone(),
            tags: data
                .tags
                .iter()
                .map(|t| (t.key.clone(), t.value.clone().unwrap_or_default()))
                .collect(),
            status: InstanceStatus::parse(&data.status),
            creation_time: DateTime::parse_from_rfc3339(&data.creation_time)
                .map(|t| t.with_timezone(&Utc))
                .ok(),
        }
    }
}

impl Instance {
    /// `<region>.<instance-id>` as stored on the NodeClaim
    pub fn provider_id(&self) -> String {
        crate::utils::format_provider_id(&self.region, &self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::Tag;

    #[test]
    fn instance_projects_from_wire_record() {
        let data = InstanceData {
            instance_id: "i-abc".to_string(),
            image_id: "m-amd".to_string(),
            instance_type: "ecs.g7.large".to_string(),
            region_id: "cn-beijing".to_string(),
            zone_id: "cn-beijing-a".to_string(),
            spot_strategy: "SpotAsPriceGo".to_string(),
            security_group_ids: vec!["sg-1".to_string()],
            v_switch_id: "vsw-1".to_string(),
            tags: vec![Tag::new("karpenter.sh/nodepool", "general")],
            status: "Running".to_string(),
            creation_time: "2024-06-01T10:00:00Z".to_string(),
            ..Default::default()
        };
        let instance = Instance::from(&data);
        assert_eq!(instance.capacity_type, CapacityType::Spot);
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.provider_id(), "cn-beijing.i-abc");
        assert_eq!(
            instance.tags.get("karpenter.sh/nodepool").unwrap(),
            "general"
        );
        assert!(instance.creation_time.is_some());
    }

    #[test]
    fn status_parsing_and_termination() {
        assert_eq!(InstanceStatus::parse("Running"), InstanceStatus::Running);
        assert_eq!(InstanceStatus::parse("Unknown"), InstanceStatus::Pending);
        assert!(InstanceStatus::parse("Stopping").is_terminating());
        assert!(InstanceStatus::parse("Stopped").is_terminating());
        assert!(!InstanceStatus::parse("Running").is_terminating());
    }
}
