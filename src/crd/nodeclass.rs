//! ECSNodeClass Custom Resource Definition
//!
//! The ECSNodeClass carries everything needed to realize NodeClaims on
//! Alibaba Cloud: network and security selectors, image selection, kubelet
//! configuration, and disk/tag settings. The status holds the resolved
//! selector values the launch pipeline reads.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    ECSNodeClassStatus, ImageFamily, ImageSelectorTerm, KubeletConfiguration,
    SecurityGroupSelectorTerm, SystemDisk, VSwitchSelectorTerm,
};
use crate::{Error, Result};

/// Specification for an ECSNodeClass
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "karpenter.k8s.alibabacloud",
    version = "v1alpha1",
    kind = "ECSNodeClass",
    plural = "ecsnodeclasses",
    shortname = "ecsnc",
    status = "ECSNodeClassStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ECSNodeClassSpec {
    /// vSwitch selector terms; terms are ORed, fields within a term ANDed
    pub v_switch_selector_terms: Vec<VSwitchSelectorTerm>,

    /// Security-group selector terms; terms are ORed
    pub security_group_selector_terms: Vec<SecurityGroupSelectorTerm>,

    /// Image selector terms; terms are ORed, an alias term excludes others
    pub image_selector_terms: Vec<ImageSelectorTerm>,

    /// UserData applied to provisioned nodes, merged with the fields the
    /// image family requires for registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,

    /// Kubelet arguments for provisioned nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubelet_configuration: Option<KubeletConfiguration>,

    /// System disk applied to provisioned nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_disk: Option<SystemDisk>,

    /// Tags applied to ECS resources (instances, launch templates)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

// Spec fields that participate in the content hash. Selector terms are
// excluded: status-only churn from re-resolving selectors must not read as
// drift.
#[derive(Serialize)]
struct HashedSpec<'a> {
    user_data: &'a Option<String>,
    kubelet_configuration: &'a Option<KubeletConfiguration>,
    system_disk: &'a Option<SystemDisk>,
    tags: &'a BTreeMap<String, String>,
}

impl ECSNodeClass {
    /// Content hash of the drift-relevant spec fields, as persisted in the
    /// hash annotation
    pub fn hash(&self) -> String {
        crate::hash::content_hash_string(&HashedSpec {
            user_data: &self.spec.user_data,
            kubelet_configuration: &self.spec.kubelet_configuration,
            system_disk: &self.spec.system_disk,
            tags: &self.spec.tags,
        })
    }

    /// The image family selected by an alias term, or Custom when the terms
    /// select concrete images
    pub fn image_family(&self) -> ImageFamily {
        self.spec
            .image_selector_terms
            .iter()
            .find(|t| !t.alias.is_empty())
            .and_then(|t| ImageFamily::from_alias(&t.alias).ok())
            .map(|(family, _)| family)
            .unwrap_or(ImageFamily::Custom)
    }

    /// The alias term's version, when an alias is in use
    pub fn image_version(&self) -> Option<String> {
        self.spec
            .image_selector_terms
            .iter()
            .find(|t| !t.alias.is_empty())
            .and_then(|t| ImageFamily::from_alias(&t.alias).ok())
            .map(|(_, version)| version)
    }

    /// Name of this node class
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// True once deletion has been requested
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

impl ECSNodeClassSpec {
    /// Validate selector terms and user tags
    pub fn validate(&self) -> Result<()> {
        if self.v_switch_selector_terms.is_empty() {
            return Err(Error::validation("vSwitchSelectorTerms cannot be empty"));
        }
        if self.security_group_selector_terms.is_empty() {
            return Err(Error::validation(
                "securityGroupSelectorTerms cannot be empty",
            ));
        }
        if self.image_selector_terms.is_empty() {
            return Err(Error::validation("imageSelectorTerms cannot be empty"));
        }
        for term in &self.v_switch_selector_terms {
            term.validate()?;
        }
        for term in &self.security_group_selector_terms {
            term.validate()?;
        }
        for term in &self.image_selector_terms {
            term.validate()?;
        }
        let alias_terms = self
            .image_selector_terms
            .iter()
            .filter(|t| !t.alias.is_empty())
            .count();
        if alias_terms > 0 && self.image_selector_terms.len() != 1 {
            return Err(Error::validation(
                "'alias' is mutually exclusive with other imageSelectorTerms",
            ));
        }
        if let Some(kc) = &self.kubelet_configuration {
            kc.validate()?;
        }
        if let Some(disk) = &self.system_disk {
            disk.validate()?;
        }
        self.validate_tags()
    }

    fn validate_tags(&self) -> Result<()> {
        for key in self.tags.keys() {
            if key.is_empty() {
                return Err(Error::validation("empty tag keys aren't supported"));
            }
            let restricted = key == super::TAG_CLUSTER_NAME
                || key.starts_with(super::TAG_KUBERNETES_CLUSTER_PREFIX)
                || key == super::LABEL_NODE_POOL
                || key == super::LABEL_NODE_CLAIM
                || key == super::LABEL_NODE_CLASS;
            if restricted {
                return Err(Error::validation(format!(
                    "tag contains a restricted key {key:?}"
                )));
            }
        }
        Ok(())
    }
}
