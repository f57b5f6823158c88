//! Idempotent hashed launch templates
//!
//! Every resolved descriptor maps to a cloud-side launch template whose name
//! is a content hash, so identical configurations dedupe across claims and
//! restarts. The name→id cache deletes templates from the cloud when entries
//! expire; hydration on leadership acquisition re-learns templates created
//! by a previous leader.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::TtlCache;
use crate::crd::{self, ECSNodeClass};
use crate::ecs::{
    CreateLaunchTemplateRequest, DeleteLaunchTemplateRequest, DescribeLaunchTemplatesRequest,
    EcsApi, LaunchTemplateSet, LaunchTemplateSystemDisk, Tag,
};
use crate::imagefamily::{ResolvedTemplate, Resolver, ResolverOptions};
use crate::instancetype::InstanceType;
use crate::nodeclaim::{CapacityType, NodeClaim};
use crate::options::Options;
use crate::utils::{pretty_slice, ChangeMonitor};
use crate::{Error, Result};

const PAGE_SIZE: i32 = 50;
// runaway guard for the page loop
const MAX_PAGES: i32 = 500;

/// How long a template id stays cached before the cloud copy is deleted
pub const LAUNCH_TEMPLATE_TTL: Duration = Duration::from_secs(10 * 60);

/// A cloud-side launch template ready for an auto-provisioning group
#[derive(Clone, Debug)]
pub struct LaunchTemplate {
    /// Content-hash derived template name
    pub name: String,
    /// Cloud-assigned template id
    pub id: String,
    /// Instance types this template serves
    pub instance_types: Vec<Arc<InstanceType>>,
    /// Image the template boots
    pub image_id: String,
    /// Security groups attached by the template
    pub security_group_ids: Vec<String>,
    /// System disk the template configures
    pub system_disk: Option<crate::crd::SystemDisk>,
}

/// Maintains the hashed launch-template set in the cloud
pub struct LaunchTemplateProvider {
    region: String,
    ecs: Arc<dyn EcsApi>,
    resolver: Arc<Resolver>,
    options: Arc<Options>,
    cm: ChangeMonitor,
    // one lock serializes EnsureAll, InvalidateCache, and the eviction path
    lock: Mutex<()>,
    cache: TtlCache<String>,
}

impl LaunchTemplateProvider {
    /// Create a provider; the eviction callback deletes expired templates
    /// from the cloud
    pub fn new(
        region: impl Into<String>,
        ecs: Arc<dyn EcsApi>,
        resolver: Arc<Resolver>,
        options: Arc<Options>,
    ) -> Arc<Self> {
        let provider = Arc::new(Self {
            region: region.into(),
            ecs,
            resolver,
            options,
            cm: ChangeMonitor::new(),
            lock: Mutex::new(()),
            cache: TtlCache::new(LAUNCH_TEMPLATE_TTL),
        });
        provider
            .cache
            .set_eviction_callback(Some(eviction_callback(
                provider.region.clone(),
                provider.ecs.clone(),
                provider.cache.clone(),
            )));
        provider
    }

    /// Ensure a cloud-side template exists for every resolved descriptor
    pub async fn ensure_all(
        &self,
        node_class: &ECSNodeClass,
        node_claim: &NodeClaim,
        instance_types: &[Arc<InstanceType>],
        capacity_type: CapacityType,
        tags: &BTreeMap<String, String>,
    ) -> Result<Vec<LaunchTemplate>> {
        let _guard = self.lock.lock().await;

        let options = self.resolve_options(node_class, node_claim, capacity_type, tags)?;
        let resolved = self
            .resolver
            .resolve(node_class, node_claim, instance_types, capacity_type, &options)
            .await?;

        let mut templates = Vec::with_capacity(resolved.len());
        for template in resolved {
            let name = template_name(&template);
            let id = self.ensure_launch_template(&name, &template).await?;
            templates.push(LaunchTemplate {
                name,
                id,
                instance_types: template.instance_types.clone(),
                image_id: template.image_id.clone(),
                security_group_ids: template
                    .options
                    .security_groups
                    .iter()
                    .map(|sg| sg.id.clone())
                    .collect(),
                system_disk: template.system_disk.clone(),
            });
        }
        Ok(templates)
    }

    /// Delete every template this cluster manages for a NodeClass
    pub async fn delete_all(&self, node_class: &ECSNodeClass) -> Result<()> {
        let tags = vec![
            Tag::new(crd::TAG_MANAGED_LAUNCH_TEMPLATE, &self.options.cluster_name),
            Tag::new(crd::LABEL_NODE_CLASS, node_class.name()),
        ];
        let sets = self.describe_launch_templates(tags).await.map_err(|e| {
            error!(error = %e, "describe launch templates failed");
            Error::cloud_api(format!("fetching launch templates, {e}"))
        })?;

        let mut failures = Vec::new();
        for set in &sets {
            if let Err(err) = self
                .ecs
                .delete_launch_template(DeleteLaunchTemplateRequest {
                    region_id: self.region.clone(),
                    launch_template_name: Some(set.launch_template_name.clone()),
                    ..Default::default()
                })
                .await
            {
                failures.push(err.to_string());
            }
        }
        if !sets.is_empty() {
            let names: Vec<&str> = sets.iter().map(|s| s.launch_template_name.as_str()).collect();
            debug!(launch_templates = %pretty_slice(&names, 5), "deleted launch templates");
        }
        if !failures.is_empty() {
            return Err(Error::cloud_api(format!(
                "deleting launch templates, {}",
                failures.join("; ")
            )));
        }
        Ok(())
    }

    /// Drop a template from the cache without deleting the cloud copy
    ///
    /// Used when the caller already knows the template is gone; the eviction
    /// callback is detached around the removal so it cannot fire.
    pub async fn invalidate_cache(&self, name: &str, id: &str) {
        let _guard = self.lock.lock().await;
        debug!(
            launch_template_name = name,
            launch_template_id = id,
            "invalidating launch template in the cache because it no longer exists"
        );
        let callback = self.cache.set_eviction_callback(None);
        self.cache.remove(name);
        self.cache.set_eviction_callback(callback);
    }

    /// Pre-populate the cache with templates created by a previous leader
    ///
    /// Runs once the start signal fires; exits early on cancellation.
    pub fn spawn_hydrate(
        self: &Arc<Self>,
        started: tokio::sync::watch::Receiver<bool>,
        cancel: CancellationToken,
    ) {
        let provider = self.clone();
        let mut started = started;
        tokio::spawn(async move {
            loop {
                if *started.borrow() {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = started.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            provider.hydrate_cache().await;
        });
    }

    /// Evict expired templates (deleting them from the cloud) on a cadence
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) {
        self.cache.spawn_sweeper(interval, cancel);
    }

    async fn hydrate_cache(&self) {
        let tags = vec![Tag::new(
            crd::TAG_MANAGED_LAUNCH_TEMPLATE,
            &self.options.cluster_name,
        )];
        match self.describe_launch_templates(tags).await {
            Ok(sets) => {
                for set in &sets {
                    self.cache
                        .insert(&set.launch_template_name, set.launch_template_id.clone());
                }
                info!(count = sets.len(), "hydrated launch template cache");
            }
            Err(err) => {
                error!(error = %err, "unable to hydrate the launch template cache");
            }
        }
    }

    fn resolve_options(
        &self,
        node_class: &ECSNodeClass,
        node_claim: &NodeClaim,
        capacity_type: CapacityType,
        tags: &BTreeMap<String, String>,
    ) -> Result<ResolverOptions> {
        // kubelet refuses registration with labels from these domains
        let mut labels = node_claim.labels();
        labels.insert(
            crd::LABEL_CAPACITY_TYPE.to_string(),
            capacity_type.as_str().to_string(),
        );
        labels.retain(|key, _| {
            let domain = key.split('/').next().unwrap_or_default();
            !domain.ends_with("node-restriction.kubernetes.io") && !domain.ends_with("kops.k8s.io")
        });

        // the status is the source of truth here; a spec edit racing a
        // launch can drift the node, which the drift controller repairs
        let security_groups = node_class
            .status
            .as_ref()
            .map(|s| s.security_groups.clone())
            .unwrap_or_default();
        if security_groups.is_empty() {
            return Err(Error::node_class_not_ready(
                "no security groups are present in the status",
            ));
        }
        Ok(ResolverOptions {
            cluster_name: self.options.cluster_name.clone(),
            cluster_endpoint: self.options.cluster_endpoint.clone(),
            security_groups,
            tags: tags.clone(),
            labels,
            node_class_name: node_class.name().to_string(),
        })
    }

    async fn ensure_launch_template(
        &self,
        name: &str,
        template: &ResolvedTemplate,
    ) -> Result<String> {
        if let Some(id) = self.cache.get(name) {
            // refresh the entry so hot templates never expire out
            self.cache.insert(name, id.clone());
            return Ok(id);
        }

        let response = self
            .ecs
            .describe_launch_templates(DescribeLaunchTemplatesRequest {
                region_id: self.region.clone(),
                launch_template_names: vec![name.to_string()],
                page_number: 1,
                page_size: PAGE_SIZE,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::cloud_api(format!("describing launch templates, {e}")))?;

        let id = match response.launch_template_sets.first() {
            None => self.create_launch_template(name, template).await?,
            Some(existing) => {
                if response.launch_template_sets.len() > 1 {
                    warn!(
                        launch_template_name = name,
                        count = response.launch_template_sets.len(),
                        "expected one launch template for name"
                    );
                }
                if self.cm.has_changed(&format!("launchtemplate-{name}"), &name) {
                    debug!(launch_template_name = name, "discovered launch template");
                }
                existing.launch_template_id.clone()
            }
        };
        self.cache.insert(name, id.clone());
        Ok(id)
    }

    async fn create_launch_template(
        &self,
        name: &str,
        template: &ResolvedTemplate,
    ) -> Result<String> {
        let mut template_tags = template.options.tags.clone();
        template_tags.insert(
            crd::TAG_MANAGED_LAUNCH_TEMPLATE.to_string(),
            template.options.cluster_name.clone(),
        );
        template_tags.insert(
            crd::LABEL_NODE_CLASS.to_string(),
            template.options.node_class_name.clone(),
        );

        let response = self
            .ecs
            .create_launch_template(CreateLaunchTemplateRequest {
                region_id: self.region.clone(),
                launch_template_name: name.to_string(),
                image_id: template.image_id.clone(),
                security_group_ids: template
                    .options
                    .security_groups
                    .iter()
                    .map(|sg| sg.id.clone())
                    .collect(),
                user_data: template.user_data.clone(),
                system_disk: template.system_disk.as_ref().map(|disk| {
                    LaunchTemplateSystemDisk {
                        category: disk.category.clone(),
                        size: disk.size,
                        disk_name: disk.disk_name.clone(),
                        performance_level: disk.performance_level.clone(),
                        auto_snapshot_policy_id: disk.auto_snapshot_policy_id.clone(),
                        bursting_enabled: disk.bursting_enabled,
                    }
                }),
                tags: template
                    .options
                    .tags
                    .iter()
                    .map(|(k, v)| Tag::new(k, v))
                    .collect(),
                template_tags: template_tags.iter().map(|(k, v)| Tag::new(k, v)).collect(),
            })
            .await
            .map_err(|e| Error::cloud_api(format!("creating launch template, {e}")))?;
        debug!(
            launch_template_name = name,
            id = %response.launch_template_id,
            "created launch template"
        );
        Ok(response.launch_template_id)
    }

    async fn describe_launch_templates(&self, tags: Vec<Tag>) -> Result<Vec<LaunchTemplateSet>> {
        let mut collected = Vec::new();
        for page_number in 1..MAX_PAGES {
            let response = self
                .ecs
                .describe_launch_templates(DescribeLaunchTemplatesRequest {
                    region_id: self.region.clone(),
                    template_tags: tags.clone(),
                    page_number,
                    page_size: PAGE_SIZE,
                    ..Default::default()
                })
                .await?;
            let page_len = response.launch_template_sets.len();
            collected.extend(response.launch_template_sets);
            if response.total_count < i64::from(page_number) * i64::from(PAGE_SIZE)
                || page_len < PAGE_SIZE as usize
            {
                break;
            }
        }
        Ok(collected)
    }
}

/// Name a template after its content so identical configurations dedupe
pub fn template_name(template: &ResolvedTemplate) -> String {
    format!("{}/{}", crate::API_GROUP, template.identity_hash())
}

// Deletes the cloud-side template when a cache entry expires. The re-check
// guards the race where the entry was refreshed between expiry and callback:
// a live entry under the same name means someone re-ensured it.
fn eviction_callback(
    region: String,
    ecs: Arc<dyn EcsApi>,
    cache: TtlCache<String>,
) -> Box<dyn Fn(&str, &String) + Send + Sync> {
    Box::new(move |name: &str, id: &String| {
        if cache.get_with_expiration(name).is_some() {
            return;
        }
        let region = region.clone();
        let ecs = ecs.clone();
        let name = name.to_string();
        let id = id.clone();
        tokio::spawn(async move {
            if let Err(err) = ecs
                .delete_launch_template(DeleteLaunchTemplateRequest {
                    region_id: region,
                    launch_template_id: Some(id.clone()),
                    launch_template_name: Some(name.clone()),
                })
                .await
            {
                error!(launch_template = %id, error = %err, "failed to delete launch template");
                return;
            }
            debug!(id = %id, name = %name, "deleted launch template");
        });
    })
}
