//! The host-runtime facade
//!
//! Implements the contract the host autoscaler runtime drives:
//! Create / Get / List / Delete / IsDrifted / GetInstanceTypes /
//! LivenessProbe. Cluster reads go through the [`ClusterReader`] seam so the
//! facade stays testable without an apiserver.

mod drift;

pub use drift::{
    security_groups_drifted, static_fields_drifted, vswitch_drifted, DriftReason,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource;
use kube::core::GroupVersionKind;
use tracing::{error, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::{self, ECSNodeClass};
use crate::instance::{Instance, InstanceProvider};
use crate::instancetype::{InstanceType, InstanceTypeProvider};
use crate::nodeclaim::{NodeClaim, NodeClassReference, NodePool, NodePoolSpec};
use crate::utils::parse_instance_id;
use crate::{Error, Result, CLOUD_NAME};

/// Cluster reads the facade depends on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Fetch a NodePool by name
    async fn node_pool(&self, name: &str) -> Result<NodePool>;

    /// Fetch an ECSNodeClass by name
    async fn node_class(&self, name: &str) -> Result<ECSNodeClass>;
}

/// [`ClusterReader`] backed by the apiserver
pub struct KubeClusterReader {
    client: kube::Client,
}

impl KubeClusterReader {
    /// Create a reader using the given client
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn node_pool(&self, name: &str) -> Result<NodePool> {
        // NodePools belong to the host runtime; read them dynamically
        let gvk = GroupVersionKind::gvk("karpenter.sh", "v1", "NodePool");
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let object = api.get(name).await?;

        let node_class_ref = object
            .data
            .pointer("/spec/template/spec/nodeClassRef")
            .and_then(|v| serde_json::from_value::<NodeClassReference>(v.clone()).ok());
        Ok(NodePool {
            metadata: object.metadata,
            spec: NodePoolSpec { node_class_ref },
        })
    }

    async fn node_class(&self, name: &str) -> Result<ECSNodeClass> {
        let api: Api<ECSNodeClass> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }
}

/// The cloud provider exposed to the host runtime
pub struct CloudProvider {
    reader: Arc<dyn ClusterReader>,
    instance_types: Arc<InstanceTypeProvider>,
    instances: Arc<InstanceProvider>,
}

impl CloudProvider {
    /// Assemble the facade from its providers
    pub fn new(
        reader: Arc<dyn ClusterReader>,
        instance_types: Arc<InstanceTypeProvider>,
        instances: Arc<InstanceProvider>,
    ) -> Self {
        Self {
            reader,
            instance_types,
            instances,
        }
    }

    /// Launch a machine satisfying the NodeClaim and project it back
    pub async fn create(&self, node_claim: &NodeClaim) -> Result<NodeClaim> {
        let node_class = self.resolve_node_class_from_claim(node_claim).await?;
        if !node_class
            .status
            .as_ref()
            .map(|s| s.is_ready())
            .unwrap_or(false)
        {
            // surfaced verbatim so the host retries once the status resolves
            return Err(Error::node_class_not_ready(format!(
                "nodeclass {} is not ready",
                node_class.name()
            )));
        }

        let requirements = node_claim.requirements();
        let instance_types = self
            .instance_types
            .list(node_class.spec.kubelet_configuration.as_ref(), &node_class)?
            .into_iter()
            .filter(|it| {
                requirements.compatible(&it.requirements)
                    && it.has_compatible_offering(&requirements)
            })
            .collect::<Vec<_>>();
        if instance_types.is_empty() {
            return Err(Error::insufficient_capacity(
                "all requested instance types were unavailable during launch",
            ));
        }

        let instance = self
            .instances
            .create(&node_class, node_claim, instance_types.clone())
            .await?;
        info!(
            instance = %instance.id,
            instance_type = %instance.instance_type,
            zone = %instance.zone,
            capacity_type = %instance.capacity_type,
            "launched instance"
        );

        let instance_type = instance_types
            .iter()
            .find(|it| it.name == instance.instance_type)
            .cloned();
        let mut projected = instance_to_node_claim(&instance, instance_type.as_deref());
        let annotations = projected.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(crd::ANNOTATION_NODECLASS_HASH.to_string(), node_class.hash());
        annotations.insert(
            crd::ANNOTATION_NODECLASS_HASH_VERSION.to_string(),
            crd::NODECLASS_HASH_VERSION.to_string(),
        );
        Ok(projected)
    }

    /// Fetch one machine by provider id
    pub async fn get(&self, provider_id: &str) -> Result<NodeClaim> {
        let id = parse_instance_id(provider_id)?;
        let instance = self
            .instances
            .get(&id)
            .await
            .map_err(|e| match e {
                Error::NodeClaimNotFound(_) => e,
                other => Error::cloud_api(format!("getting instance, {other}")),
            })?;
        let instance_type = self.resolve_instance_type(&instance).await?;
        Ok(instance_to_node_claim(&instance, instance_type.as_deref()))
    }

    /// List every machine this cluster manages
    pub async fn list(&self) -> Result<Vec<NodeClaim>> {
        let instances = self
            .instances
            .list()
            .await
            .map_err(|e| Error::cloud_api(format!("listing instances, {e}")))?;
        let mut node_claims = Vec::with_capacity(instances.len());
        for instance in &instances {
            let instance_type = self.resolve_instance_type(instance).await?;
            node_claims.push(instance_to_node_claim(instance, instance_type.as_deref()));
        }
        Ok(node_claims)
    }

    /// Terminate the machine behind a NodeClaim
    pub async fn delete(&self, node_claim: &NodeClaim) -> Result<()> {
        let id = parse_instance_id(&node_claim.status.provider_id)?;
        self.instances.delete(&id).await
    }

    /// Report whether the NodeClaim's machine drifted from its NodeClass
    ///
    /// Returns the first non-empty reason with precedence: static hash,
    /// security groups, vSwitch.
    pub async fn is_drifted(&self, node_claim: &NodeClaim) -> Result<Option<DriftReason>> {
        let Some(node_pool_name) = node_claim.labels().get(crd::LABEL_NODE_POOL).cloned() else {
            return Ok(None);
        };
        let node_pool = self.reader.node_pool(&node_pool_name).await?;
        let node_class = self.resolve_node_class_from_pool(&node_pool).await?;

        if let Some(reason) = static_fields_drifted(node_claim, &node_class) {
            return Ok(Some(reason));
        }
        let id = parse_instance_id(&node_claim.status.provider_id)?;
        let instance = self.instances.get(&id).await?;

        if let Some(reason) = security_groups_drifted(&instance, &node_class)
            .map_err(|e| Error::cloud_api(format!("calculating securitygroup drift, {e}")))?
        {
            return Ok(Some(reason));
        }
        if let Some(reason) = vswitch_drifted(&instance, &node_class)
            .map_err(|e| Error::cloud_api(format!("calculating vswitch drift, {e}")))?
        {
            return Ok(Some(reason));
        }
        Ok(None)
    }

    /// All instance types available to a NodePool
    pub async fn get_instance_types(&self, node_pool: &NodePool) -> Result<Vec<Arc<InstanceType>>> {
        let node_class = self.resolve_node_class_from_pool(node_pool).await?;
        self.instance_types
            .list(node_class.spec.kubelet_configuration.as_ref(), &node_class)
    }

    /// Walk the provider lock chain
    pub async fn liveness_probe(&self) -> Result<()> {
        self.instance_types.liveness_probe().await
    }

    /// The name this provider registers under
    pub fn name(&self) -> &'static str {
        CLOUD_NAME
    }

    /// Kinds of node classes this provider realizes
    pub fn supported_node_classes(&self) -> Vec<&'static str> {
        vec!["ECSNodeClass"]
    }

    async fn resolve_node_class_from_claim(&self, node_claim: &NodeClaim) -> Result<ECSNodeClass> {
        let name = node_claim
            .spec
            .node_class_ref
            .as_ref()
            .map(|r| r.name.clone())
            .ok_or_else(|| Error::validation("nodeclaim has no nodeClassRef"))?;
        self.fetch_node_class(&name).await
    }

    async fn resolve_node_class_from_pool(&self, node_pool: &NodePool) -> Result<ECSNodeClass> {
        let name = node_pool
            .spec
            .node_class_ref
            .as_ref()
            .map(|r| r.name.clone())
            .ok_or_else(|| Error::validation("nodepool has no nodeClassRef"))?;
        self.fetch_node_class(&name).await
    }

    async fn fetch_node_class(&self, name: &str) -> Result<ECSNodeClass> {
        let node_class = self.reader.node_class(name).await?;
        if node_class.is_terminating() {
            // deleting NodeClasses read as not found, with a clearer message
            return Err(Error::node_claim_not_found(format!(
                "ecsnodeclass {name:?} is terminating, treating as not found"
            )));
        }
        Ok(node_class)
    }

    // Instance-type info is best effort on read paths: a machine whose
    // NodePool or NodeClass is gone still projects, just without labels.
    async fn resolve_instance_type(
        &self,
        instance: &Instance,
    ) -> Result<Option<Arc<InstanceType>>> {
        let Some(node_pool_name) = instance.tags.get(crd::LABEL_NODE_POOL) else {
            return Ok(None);
        };
        let node_pool = match self.reader.node_pool(node_pool_name).await {
            Ok(pool) => pool,
            Err(err) => {
                if err.is_not_found() || matches!(&err, Error::Kube(kube::Error::Api(e)) if e.code == 404)
                {
                    return Ok(None);
                }
                error!(error = %err, "resolving nodepool");
                return Err(Error::cloud_api(format!("resolving nodepool, {err}")));
            }
        };
        match self.get_instance_types(&node_pool).await {
            Ok(instance_types) => Ok(instance_types
                .into_iter()
                .find(|it| it.name == instance.instance_type)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(Error::cloud_api(format!("resolving instance types, {err}"))),
        }
    }
}

/// Project a live instance into the NodeClaim shape the host consumes
pub fn instance_to_node_claim(
    instance: &Instance,
    instance_type: Option<&InstanceType>,
) -> NodeClaim {
    let mut node_claim = NodeClaim::default();
    let mut labels = BTreeMap::new();

    if let Some(instance_type) = instance_type {
        labels = instance_type.requirements.single_valued_labels();
        node_claim.status.capacity = instance_type.capacity.to_quantity_map();
        node_claim.status.allocatable = instance_type.allocatable().to_quantity_map();
    }
    labels.insert(crd::LABEL_TOPOLOGY_ZONE.to_string(), instance.zone.clone());
    labels.insert(
        crd::LABEL_CAPACITY_TYPE.to_string(),
        instance.capacity_type.as_str().to_string(),
    );
    if let Some(node_pool) = instance.tags.get(crd::LABEL_NODE_POOL) {
        labels.insert(crd::LABEL_NODE_POOL.to_string(), node_pool.clone());
    }
    node_claim.metadata.labels = Some(labels);
    node_claim.metadata.creation_timestamp = instance.creation_time.map(Time);

    // a stopping or stopped machine is on its way out; surface that as a
    // deletion in progress
    if instance.status.is_terminating() {
        node_claim.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    }

    node_claim.status.provider_id = instance.provider_id();
    node_claim.status.image_id = instance.image_id.clone();
    node_claim
}
