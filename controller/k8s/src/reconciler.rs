use crate::{service, Api, Client, Service};
use anyhow::{Context, Result};
use caddy_mesh_controller_core as mesh;
use std::{fmt, sync::Arc};
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    time,
};
use tracing::{info, warn};

/// How long to wait before retrying a failed reconciliation.
const REQUEUE_DELAY: time::Duration = time::Duration::from_secs(1);

/// Names the service a watch event concerns.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileKey {
    pub name: String,
    pub namespace: String,
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

/// Drains reconcile keys and brings the configurator — and through it, the
/// proxy fleet — into agreement with the observed cluster state.
///
/// Keys whose reconciliation fails (including a partial fan-out) are
/// re-enqueued after a short delay; the next pass re-reads the cluster, so
/// retries are always performed against fresh state.
pub struct Reconciler {
    client: Client,
    configurator: Arc<mesh::Configurator>,
    proxy_namespace: String,
    keys: UnboundedReceiver<ReconcileKey>,
    requeue: UnboundedSender<ReconcileKey>,
}

impl Reconciler {
    pub fn new(
        client: Client,
        configurator: Arc<mesh::Configurator>,
        proxy_namespace: String,
        keys: UnboundedReceiver<ReconcileKey>,
        requeue: UnboundedSender<ReconcileKey>,
    ) -> Self {
        Self {
            client,
            configurator,
            proxy_namespace,
            keys,
            requeue,
        }
    }

    pub async fn run(mut self) {
        while let Some(key) = self.keys.recv().await {
            if let Err(error) = self.reconcile(&key).await {
                warn!(%error, service = %key, "reconciliation failed; requeueing");
                let requeue = self.requeue.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    time::sleep(REQUEUE_DELAY).await;
                    let _ = requeue.send(key);
                });
            }
        }
    }

    async fn reconcile(&self, key: &ReconcileKey) -> Result<()> {
        info!(name = %key.name, namespace = %key.namespace, "reconciling service");

        let api: Api<Service> = Api::namespaced(self.client.clone(), &key.namespace);
        let observed = match api.get(&key.name).await {
            Ok(svc) => Some(svc),
            Err(kube::Error::Api(response)) if response.code == 404 => None,
            Err(error) => return Err(error).context("failed to fetch service"),
        };

        let proxy_ips = service::proxy_pod_ips(&self.client, &self.proxy_namespace).await?;

        let reference = mesh::ServiceRef::new(&key.name, &key.namespace);
        let changed = match observed {
            Some(observed) => match service::to_mesh_service(&self.client, &observed).await? {
                Some(svc) => self.configurator.upsert(svc).await,
                // The service exists but is not routable; drop whatever the
                // model still holds for it.
                None => self.configurator.delete(&reference).await,
            },
            None => self.configurator.delete(&reference).await,
        };

        if !changed {
            info!(service = %key, "no changes made; all proxy instances are in sync");
            return Ok(());
        }

        match self.configurator.apply(&proxy_ips).await {
            Ok(synced) => {
                info!(
                    synced,
                    total = proxy_ips.len(),
                    "proxy instances synchronized",
                );
                Ok(())
            }
            Err(error) => {
                warn!(
                    synced = error.synced,
                    total = proxy_ips.len(),
                    %error,
                    "proxy synchronization incomplete",
                );
                Err(error.into())
            }
        }
    }
}
