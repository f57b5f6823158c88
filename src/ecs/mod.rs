//! Outbound cloud API surface
//!
//! SDK bindings live outside this crate; providers talk to the cloud through
//! the [`EcsApi`] and [`VpcApi`] traits, which are injected at construction
//! and mocked in tests. Implementations are expected to translate SDK faults
//! into [`crate::Error::CloudApi`] with the HTTP status attached, so the
//! error taxonomy in [`crate::error`] holds end to end.

pub mod types;

pub use types::*;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// ECS operations the provider consumes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EcsApi: Send + Sync {
    /// One page of security groups
    async fn describe_security_groups(
        &self,
        request: DescribeSecurityGroupsRequest,
    ) -> Result<DescribeSecurityGroupsResponse>;

    /// One page of images
    async fn describe_images(
        &self,
        request: DescribeImagesRequest,
    ) -> Result<DescribeImagesResponse>;

    /// One page of instance-type metadata
    async fn describe_instance_types(
        &self,
        request: DescribeInstanceTypesRequest,
    ) -> Result<DescribeInstanceTypesResponse>;

    /// Zonal availability of instance types or disk categories
    async fn describe_available_resource(
        &self,
        request: DescribeAvailableResourceRequest,
    ) -> Result<DescribeAvailableResourceResponse>;

    /// Create a launch template
    async fn create_launch_template(
        &self,
        request: CreateLaunchTemplateRequest,
    ) -> Result<CreateLaunchTemplateResponse>;

    /// One page of launch templates
    async fn describe_launch_templates(
        &self,
        request: DescribeLaunchTemplatesRequest,
    ) -> Result<DescribeLaunchTemplatesResponse>;

    /// Delete a launch template by id or name
    async fn delete_launch_template(&self, request: DeleteLaunchTemplateRequest) -> Result<()>;

    /// Submit an instant auto-provisioning group
    async fn create_auto_provisioning_group(
        &self,
        request: CreateAutoProvisioningGroupRequest,
    ) -> Result<CreateAutoProvisioningGroupResponse>;

    /// One page of instances
    async fn describe_instances(
        &self,
        request: DescribeInstancesRequest,
    ) -> Result<DescribeInstancesResponse>;

    /// Delete an instance
    async fn delete_instance(&self, request: DeleteInstanceRequest) -> Result<()>;

    /// Add tags to a resource
    async fn add_tags(&self, request: AddTagsRequest) -> Result<()>;
}

/// VPC operations the provider consumes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VpcApi: Send + Sync {
    /// One page of vSwitches
    async fn describe_vswitches(
        &self,
        request: DescribeVSwitchesRequest,
    ) -> Result<DescribeVSwitchesResponse>;
}
