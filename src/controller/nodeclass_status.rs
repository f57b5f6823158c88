//! ECSNodeClass status reconciliation
//!
//! Periodically resolves the vSwitch, security-group, and image selectors,
//! writes the resolved arrays in deterministic order, and maintains the
//! readiness conditions. List-bearing patches use optimistic concurrency so
//! a racing writer cannot silently drop entries.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

use crate::crd::{self, ECSNodeClass, ECSNodeClassStatus};
use crate::ecs::{SecurityGroupData, VSwitchData};
use crate::imagefamily::{Image as ResolvedImage, ImageProvider};
use crate::securitygroup::SecurityGroupProvider;
use crate::vswitch::VSwitchProvider;
use crate::Error;

const PATCH_MANAGER: &str = "karpenter-alicloud-nodeclass-status";

/// Controller context
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// vSwitch selector resolution
    pub vswitch: Arc<VSwitchProvider>,
    /// Security-group selector resolution
    pub security_groups: Arc<SecurityGroupProvider>,
    /// Image selector resolution
    pub images: Arc<ImageProvider>,
}

/// Reconcile one ECSNodeClass
///
/// Adds the termination finalizer on first sight, resolves all selectors,
/// and patches the status when anything changed.
pub async fn reconcile(
    node_class: Arc<ECSNodeClass>,
    ctx: Arc<Context>,
) -> std::result::Result<Action, Error> {
    let node_class = node_class.as_ref();
    let name = node_class.name_any();
    let api: Api<ECSNodeClass> = Api::all(ctx.client.clone());

    if !node_class
        .finalizers()
        .iter()
        .any(|f| f == crd::TERMINATION_FINALIZER)
    {
        if let Some(action) = add_finalizer(&api, node_class).await? {
            return Ok(action);
        }
    }

    let mut status = node_class.status.clone().unwrap_or_default();
    let mut requeue = Duration::from_secs(5 * 60);

    match ctx.vswitch.list(node_class).await {
        Ok(vswitches) => {
            requeue = requeue.min(reconcile_vswitches(vswitches, &mut status));
        }
        Err(err) => {
            warn!(node_class = %name, error = %err, "failed to list vswitches");
            return Err(Error::cloud_api(format!("getting vSwitches, {err}")));
        }
    }
    match ctx.security_groups.list(node_class).await {
        Ok(groups) => {
            requeue = requeue.min(reconcile_security_groups(groups, &mut status));
        }
        Err(err) => {
            warn!(node_class = %name, error = %err, "failed to list security groups");
            return Err(Error::cloud_api(format!("getting security groups, {err}")));
        }
    }
    match ctx.images.list(node_class).await {
        Ok(images) => {
            requeue = requeue.min(reconcile_images(images, &mut status));
        }
        Err(err) => {
            warn!(node_class = %name, error = %err, "failed to list images");
            return Err(Error::cloud_api(format!("getting images, {err}")));
        }
    }

    if status.is_ready() {
        status.set_condition_true(crd::CONDITION_READY);
    } else {
        status.set_condition_false(
            crd::CONDITION_READY,
            "SelectorsUnresolved",
            "one or more selectors did not resolve",
        );
    }

    if node_class.status.as_ref() != Some(&status) {
        if let Some(action) = patch_status(&api, node_class, &status).await? {
            return Ok(action);
        }
        debug!(node_class = %name, "updated nodeclass status");
    }

    Ok(Action::requeue(requeue))
}

/// Error policy - always requeue on error
pub fn error_policy(_node_class: Arc<ECSNodeClass>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, "reconcile error, will retry");
    Action::requeue(Duration::from_secs(30))
}

// Patching the finalizer list fully replaces it, so the resourceVersion
// rides along as an optimistic lock; a conflict just requeues.
async fn add_finalizer(
    api: &Api<ECSNodeClass>,
    node_class: &ECSNodeClass,
) -> std::result::Result<Option<Action>, Error> {
    let mut finalizers = node_class.finalizers().to_vec();
    finalizers.push(crd::TERMINATION_FINALIZER.to_string());
    let patch = serde_json::json!({
        "metadata": {
            "resourceVersion": node_class.resource_version(),
            "finalizers": finalizers,
        }
    });
    match api
        .patch(
            &node_class.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
    {
        Ok(_) => Ok(None),
        Err(kube::Error::Api(e)) if e.code == 409 => {
            Ok(Some(Action::requeue(Duration::from_secs(1))))
        }
        Err(e) => Err(e.into()),
    }
}

async fn patch_status(
    api: &Api<ECSNodeClass>,
    node_class: &ECSNodeClass,
    status: &ECSNodeClassStatus,
) -> std::result::Result<Option<Action>, Error> {
    let patch = serde_json::json!({
        "metadata": { "resourceVersion": node_class.resource_version() },
        "status": status,
    });
    match api
        .patch_status(
            &node_class.name_any(),
            &PatchParams::apply(PATCH_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
    {
        Ok(_) => Ok(None),
        Err(kube::Error::Api(e)) if e.code == 409 => {
            Ok(Some(Action::requeue(Duration::from_secs(1))))
        }
        Err(e) => Err(e.into()),
    }
}

// vSwitches sort by descending available IPs, ties by id, so the launch
// path's per-zone choice sees the best candidates first.
fn reconcile_vswitches(mut vswitches: Vec<VSwitchData>, status: &mut ECSNodeClassStatus) -> Duration {
    if vswitches.is_empty() {
        status.v_switches.clear();
        status.set_condition_false(
            crd::CONDITION_VSWITCHES_READY,
            "VSwitchesNotFound",
            "VSwitchSelector did not match any VSwitches",
        );
        return Duration::from_secs(60);
    }
    vswitches.sort_by(|a, b| {
        b.available_ip_address_count
            .cmp(&a.available_ip_address_count)
            .then_with(|| a.v_switch_id.cmp(&b.v_switch_id))
    });
    status.v_switches = vswitches
        .into_iter()
        .map(|v| crd::VSwitch {
            id: v.v_switch_id,
            zone_id: v.zone_id,
        })
        .collect();
    status.set_condition_true(crd::CONDITION_VSWITCHES_READY);
    Duration::from_secs(60)
}

fn reconcile_security_groups(
    mut groups: Vec<SecurityGroupData>,
    status: &mut ECSNodeClassStatus,
) -> Duration {
    if groups.is_empty() {
        status.security_groups.clear();
        status.set_condition_false(
            crd::CONDITION_SECURITY_GROUPS_READY,
            "SecurityGroupsNotFound",
            "SecurityGroupSelector did not match any SecurityGroups",
        );
        return Duration::from_secs(5 * 60);
    }
    groups.sort_by(|a, b| a.security_group_id.cmp(&b.security_group_id));
    status.security_groups = groups
        .into_iter()
        .map(|g| crd::SecurityGroup {
            id: g.security_group_id,
            name: g.security_group_name,
        })
        .collect();
    status.set_condition_true(crd::CONDITION_SECURITY_GROUPS_READY);
    Duration::from_secs(5 * 60)
}

// Image requirements sort by key length then lexicographically to keep the
// persisted arrays stable across reconciles.
fn reconcile_images(images: Vec<ResolvedImage>, status: &mut ECSNodeClassStatus) -> Duration {
    if images.is_empty() {
        status.images.clear();
        status.set_condition_false(
            crd::CONDITION_IMAGES_READY,
            "ImagesNotFound",
            "ImageSelector did not match any Images",
        );
        return Duration::from_secs(5 * 60);
    }
    status.images = images
        .into_iter()
        .map(|image| {
            let mut requirements = image.requirements.to_node_selector();
            requirements.sort_by(|a, b| {
                a.key
                    .len()
                    .cmp(&b.key.len())
                    .then_with(|| a.key.cmp(&b.key))
            });
            crd::Image {
                id: image.image_id,
                name: image.name,
                requirements,
            }
        })
        .collect();
    status.set_condition_true(crd::CONDITION_IMAGES_READY);
    Duration::from_secs(5 * 60)
}
