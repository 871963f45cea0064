use crate::{service, Api, Client, Service};
use anyhow::Result;
use caddy_mesh_controller_core as mesh;

/// Resolves traffic-split peer services against the cluster.
#[derive(Clone)]
pub struct ClusterServiceGetter {
    client: Client,
}

impl ClusterServiceGetter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl mesh::ServiceGetter for ClusterServiceGetter {
    async fn get(&self, name: &str, namespace: &str) -> Result<Option<mesh::Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let svc = match api.get(name).await {
            Ok(svc) => svc,
            Err(kube::Error::Api(response)) if response.code == 404 => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        service::to_mesh_service(&self.client, &svc).await
    }
}
