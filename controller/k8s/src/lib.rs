//! Cluster-facing collaborators of the mesh controller.
//!
//! This crate watches `Service` and `EndpointSlice` resources, reduces them
//! to reconcile keys, converts cluster objects into the configurator's
//! canonical model, and hosts the one-shot CoreDNS stub-zone patcher used at
//! bootstrap.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod dns;
mod getter;
mod index;
mod reconciler;
mod service;

pub use self::getter::ClusterServiceGetter;
pub use self::index::{Index, SharedIndex};
pub use self::reconciler::{ReconcileKey, Reconciler};

pub use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Pod, Service, ServiceSpec},
    discovery::v1::EndpointSlice,
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    Client,
};

/// The name of the Service fronting the Caddy proxy fleet.
pub const PROXY_SERVICE_NAME: &str = "caddy-mesh-proxy";

/// Label carried by every mesh component; marked objects are never meshed.
pub const MESH_LABEL_KEY: &str = "app";
pub const MESH_LABEL_VALUE: &str = "caddy-mesh";

/// Standard label linking an EndpointSlice to the Service that owns it.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";
