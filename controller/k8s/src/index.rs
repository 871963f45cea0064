use crate::{
    reconciler::ReconcileKey, EndpointSlice, ResourceExt, Service, MESH_LABEL_KEY,
    MESH_LABEL_VALUE, SERVICE_NAME_LABEL,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Reduces Service and EndpointSlice watch events to reconcile keys.
///
/// The index carries no resource state of its own: the reconciler re-reads
/// the cluster when it handles a key, so all this has to do is decide which
/// events are interesting and name the service they concern.
#[derive(Debug)]
pub struct Index {
    keys: UnboundedSender<ReconcileKey>,
    ignored_namespaces: HashSet<String>,

    /// Maps each observed EndpointSlice to its owning service so a slice
    /// deletion, which only carries the slice's own name, can still be
    /// attributed.
    slice_owners: HashMap<(String, String), String>,
}

impl Index {
    pub fn shared(
        keys: UnboundedSender<ReconcileKey>,
        ignored_namespaces: impl IntoIterator<Item = String>,
    ) -> SharedIndex {
        let mut ignored: HashSet<String> = ignored_namespaces.into_iter().collect();
        ignored.insert("kube-system".to_string());
        Arc::new(RwLock::new(Self {
            keys,
            ignored_namespaces: ignored,
            slice_owners: HashMap::new(),
        }))
    }

    fn enqueue(&self, name: String, namespace: String) {
        if self.keys.send(ReconcileKey { name, namespace }).is_err() {
            tracing::error!("reconciler has shut down; dropping key");
        }
    }

    fn ignores(&self, namespace: &str, name: &str) -> bool {
        if self.ignored_namespaces.contains(namespace) {
            return true;
        }
        // The cluster's own API service is never a mesh member.
        namespace == "default" && name == "kubernetes"
    }
}

impl kubert::index::IndexNamespacedResource<Service> for Index {
    fn apply(&mut self, svc: Service) {
        let name = svc.name_unchecked();
        let namespace = svc.namespace().expect("Service must have a namespace");

        if self.ignores(&namespace, &name) {
            return;
        }
        if svc.labels().get(MESH_LABEL_KEY).map(String::as_str) == Some(MESH_LABEL_VALUE) {
            tracing::debug!(%name, %namespace, "skipping mesh component");
            return;
        }

        tracing::debug!(%name, %namespace, "indexing service");
        self.enqueue(name, namespace);
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self.ignores(&namespace, &name) {
            return;
        }
        tracing::debug!(%name, %namespace, "service deleted");
        self.enqueue(name, namespace);
    }
}

impl kubert::index::IndexNamespacedResource<EndpointSlice> for Index {
    fn apply(&mut self, slice: EndpointSlice) {
        let slice_name = slice.name_unchecked();
        let namespace = slice
            .namespace()
            .expect("EndpointSlice must have a namespace");
        if self.ignored_namespaces.contains(&namespace) {
            return;
        }

        let service = match slice.labels().get(SERVICE_NAME_LABEL) {
            Some(service) => service.clone(),
            None => {
                tracing::debug!(%slice_name, %namespace, "endpoint slice has no owning service");
                return;
            }
        };
        if self.ignores(&namespace, &service) {
            return;
        }

        tracing::debug!(%slice_name, %namespace, %service, "indexing endpoint slice");
        self.slice_owners
            .insert((namespace.clone(), slice_name), service.clone());
        self.enqueue(service, namespace);
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(service) = self.slice_owners.remove(&(namespace.clone(), name)) {
            if !self.ignores(&namespace, &service) {
                self.enqueue(service, namespace);
            }
        }
    }
}
