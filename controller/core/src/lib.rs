//! Caddy Mesh Configurator
//!
//! The configurator maintains an in-memory model of the mesh, keyed by listen
//! port, and keeps a fleet of Caddy proxy instances programmed with a merged
//! configuration document reflecting that model:
//!
//! - Each mesh `Service` is indexed into the [`PortServer`] that aggregates
//!   all services sharing its listen port.
//! - A service carrying traffic-split annotations additionally becomes a
//!   [`TrafficSplit`], embedding value snapshots of its peer services so that
//!   the configuration can be built without chasing references.
//! - Every mutation reports whether it produced an observable change, so
//!   reconciliations that carry no semantic delta skip the fan-out entirely.
//! - [`build_config`] deterministically serializes the model into the JSON
//!   document accepted by the Caddy admin API, and [`Configurator::apply`]
//!   POSTs it to every live proxy instance.
//!
//! The cluster itself is abstracted behind the [`ServiceGetter`] capability;
//! this crate has no Kubernetes dependencies.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod annotations;
mod builder;
mod configurator;
pub mod duration;
mod server;

pub use self::annotations::{DecodeError, Policy};
pub use self::builder::build_config;
pub use self::configurator::{Configurator, SyncError, SyncErrorKind};
pub use self::server::PortServer;

use anyhow::Result;
use std::{cmp::Ordering, fmt};

/// The synthetic DNS suffix under which mesh services are addressed.
pub const MESH_DOMAIN: &str = "caddy.mesh";

/// The port on which every proxy instance serves its admin API.
pub const PROXY_ADMIN_PORT: u16 = 2019;

/// Identifies a mesh service by name and namespace.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ServiceRef {
    pub name: String,
    pub namespace: String,
}

/// A listen port shared by all services aggregated into one proxy server
/// block.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Port(pub u16);

/// A mesh service in canonical form.
///
/// Equality is structural and endpoint-order sensitive; the endpoint list is
/// expected to be sorted by the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Service {
    pub reference: ServiceRef,
    pub port: Port,
    pub pod_port: u16,
    pub endpoints: Vec<String>,
    pub policy: Policy,
}

/// A canary rule derived from a service's traffic-split annotations.
///
/// `new_service` and `old_service` are snapshots taken when the split was
/// derived, not references into the service table; [`PortServer::upsert`]
/// keeps them coherent when a peer is updated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrafficSplit {
    pub service: Service,
    pub expression: String,
    pub new_service: Service,
    pub old_service: Service,
}

/// Resolves a named service in a namespace against the cluster.
///
/// `Ok(None)` means the service does not exist; `Err` is reserved for
/// infrastructure failures.
#[async_trait::async_trait]
pub trait ServiceGetter: Send + Sync {
    async fn get(&self, name: &str, namespace: &str) -> Result<Option<Service>>;
}

// === impl ServiceRef ===

impl ServiceRef {
    pub fn new(name: impl ToString, namespace: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// The virtual hostname under which this service is addressed in the
    /// mesh, e.g. `whoami.default.caddy.mesh`.
    pub fn mesh_host(&self) -> String {
        format!("{}.{}.{}", self.name, self.namespace, MESH_DOMAIN)
    }

    fn sort_key(&self) -> impl Iterator<Item = u8> + '_ {
        self.name
            .bytes()
            .chain(Some(b'.'))
            .chain(self.namespace.bytes())
    }
}

impl Ord for ServiceRef {
    fn cmp(&self, other: &Self) -> Ordering {
        // The canonical order is over `name.namespace`, not over the
        // (name, namespace) pair: `b'-' < b'.'`, so a dash-suffixed name
        // sorts before its own prefix.
        self.sort_key()
            .cmp(other.sort_key())
            .then_with(|| (&self.name, &self.namespace).cmp(&(&other.name, &other.namespace)))
    }
}

impl PartialOrd for ServiceRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

// === impl Port ===

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_ref_orders_by_joined_host() {
        let mut refs = vec![
            ServiceRef::new("svc", "test"),
            ServiceRef::new("svc-canary", "test"),
            ServiceRef::new("svc-1", "test"),
            ServiceRef::new("api", "prod"),
        ];
        refs.sort();

        // "svc-1.test" and "svc-canary.test" precede "svc.test" because
        // '-' orders before '.'.
        let keys = refs.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec!["api.prod", "svc-1.test", "svc-canary.test", "svc.test"]
        );
    }

    #[test]
    fn mesh_host_appends_domain() {
        let r = ServiceRef::new("whoami", "default");
        assert_eq!(r.mesh_host(), "whoami.default.caddy.mesh");
    }
}
