//! Karpenter cloud-provider core for Alibaba Cloud ECS
//!
//! This crate implements the cloud-provider half of a Kubernetes node
//! autoscaler: it observes NodeClaims declared by the host runtime,
//! synthesizes compatible ECS launch requests, materializes them through the
//! auto-provisioning API, reconciles live instances back into NodeClaim
//! state, and detects drifted nodes.
//!
//! # Architecture
//!
//! Providers are layered leaf-first; every dependency is injected at
//! construction and no back-references exist:
//!
//! - pricing + unavailable-offerings feed the instance-type catalog
//! - the vswitch provider owns per-subnet IP accounting for launches
//! - the image resolver + security-group provider feed launch templates
//! - the instance provider assembles and submits auto-provisioning groups
//! - the cloud-provider facade exposes the host-runtime contract
//!
//! # Modules
//!
//! - [`crd`] - ECSNodeClass custom resource and well-known labels
//! - [`nodeclaim`] - host-runtime contract types (NodeClaim, NodePool)
//! - [`scheduling`] - node-selector requirement engine
//! - [`resources`] - capacity and overhead arithmetic
//! - [`ecs`] - outbound cloud API traits and payload types
//! - [`pricing`] - on-demand and spot price cache
//! - [`vswitch`] - vSwitch discovery and in-flight IP accounting
//! - [`securitygroup`] - security-group discovery
//! - [`imagefamily`] - image discovery, families, and launch-template resolution
//! - [`instancetype`] - instance-type catalog and offering synthesis
//! - [`launchtemplate`] - idempotent hashed launch templates
//! - [`instance`] - the launch pipeline
//! - [`cloudprovider`] - the host-runtime facade and drift detection
//! - [`controller`] - the NodeClass status reconciler
//! - [`error`] - error types for the provider

#![deny(missing_docs)]

pub mod cache;
pub mod cloudprovider;
pub mod controller;
pub mod crd;
pub mod ecs;
pub mod error;
pub mod hash;
pub mod imagefamily;
pub mod instance;
pub mod instancetype;
pub mod launchtemplate;
pub mod nodeclaim;
pub mod options;
pub mod pricing;
pub mod resources;
pub mod retry;
pub mod scheduling;
pub mod securitygroup;
pub mod utils;
pub mod version;
pub mod vswitch;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name this provider reports to the host runtime
pub const CLOUD_NAME: &str = "alicloud";

/// API group carried by the ECSNodeClass CRD and launch-template names
pub const API_GROUP: &str = "karpenter.k8s.alibabacloud";
