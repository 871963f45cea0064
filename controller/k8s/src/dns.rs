//! One-shot CoreDNS bootstrap: installs the `caddy.mesh` stub zone so that
//! every `*.caddy.mesh` name resolves to the proxy fleet's ClusterIP.

use crate::{
    Api, Client, ConfigMap, Deployment, Patch, PatchParams, PostParams, PROXY_SERVICE_NAME,
};
use anyhow::{bail, Context, Result};
use caddy_mesh_controller_core::MESH_DOMAIN;
use tracing::info;

const COREDNS_NAMESPACE: &str = "kube-system";
const COREDNS_NAME: &str = "coredns";
const COREFILE_KEY: &str = "Corefile";
const FIELD_MANAGER: &str = "caddy-mesh-controller";

/// Annotation bumped on the CoreDNS pod template to roll its pods after the
/// Corefile changes.
const RESTARTED_AT_ANNOTATION: &str = "mesh.caddyserver.com/restarted-at";

const STUB_BEGIN: &str = "### Caddy Mesh Begin";
const STUB_END: &str = "### Caddy Mesh End";

pub struct DnsPatcher {
    client: Client,
}

impl DnsPatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Splices the stub zone into the CoreDNS Corefile and rolls the CoreDNS
    /// pods. A Corefile that already carries the up-to-date zone is left
    /// untouched.
    pub async fn patch(&self, proxy_namespace: &str) -> Result<()> {
        info!("patching CoreDNS config");

        let deployments: Api<Deployment> =
            Api::namespaced(self.client.clone(), COREDNS_NAMESPACE);
        let deployment = deployments
            .get(COREDNS_NAME)
            .await
            .context("failed to fetch the CoreDNS deployment")?;

        let services: Api<crate::Service> =
            Api::namespaced(self.client.clone(), proxy_namespace);
        let proxy = services
            .get(PROXY_SERVICE_NAME)
            .await
            .with_context(|| format!("failed to fetch {PROXY_SERVICE_NAME} in {proxy_namespace}"))?;
        let cluster_ip = match proxy.spec.and_then(|spec| spec.cluster_ip) {
            Some(ip) if !ip.is_empty() => ip,
            _ => bail!("service {PROXY_SERVICE_NAME} in {proxy_namespace} has no ClusterIP"),
        };

        if !self.patch_corefile(&deployment, &cluster_ip).await? {
            info!("no changes made; CoreDNS config is already patched");
            return Ok(());
        }
        info!("CoreDNS config patched");

        self.restart_pods(&deployments).await
    }

    async fn patch_corefile(&self, deployment: &Deployment, cluster_ip: &str) -> Result<bool> {
        let cm_name = configmap_volume_name(deployment, COREDNS_NAME)
            .context("CoreDNS deployment mounts no CoreDNS ConfigMap")?;

        let configmaps: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), COREDNS_NAMESPACE);
        let mut cm = configmaps.get(&cm_name).await?;

        let data = cm.data.get_or_insert_with(Default::default);
        let corefile = data.get(COREFILE_KEY).map(String::as_str).unwrap_or("");
        let (corefile, changed) = splice_stub_zone(corefile, cluster_ip);
        if !changed {
            return Ok(false);
        }

        data.insert(COREFILE_KEY.to_string(), corefile);
        configmaps
            .replace(&cm_name, &PostParams::default(), &cm)
            .await
            .context("failed to update the CoreDNS ConfigMap")?;
        Ok(true)
    }

    async fn restart_pods(&self, deployments: &Api<Deployment>) -> Result<()> {
        info!(deployment = COREDNS_NAME, "restarting pods");
        let patch = serde_json::json!({
            "spec": {"template": {"metadata": {"annotations": {
                RESTARTED_AT_ANNOTATION: chrono::Utc::now().to_rfc3339(),
            }}}},
        });
        deployments
            .patch(
                COREDNS_NAME,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await
            .context("failed to restart the CoreDNS pods")?;
        Ok(())
    }
}

/// The name of the ConfigMap backing the deployment's volume called `name`.
fn configmap_volume_name(deployment: &Deployment, name: &str) -> Option<String> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .volumes
        .as_ref()?
        .iter()
        .filter_map(|volume| volume.config_map.as_ref())
        .find(|cm| cm.name.as_deref() == Some(name))
        .and_then(|cm| cm.name.clone())
}

/// Replaces any previous marker block in the Corefile with the current stub
/// zone. Returns the new Corefile and whether it differs from the input.
fn splice_stub_zone(corefile: &str, cluster_ip: &str) -> (String, bool) {
    let (remainder, existing) = strip_stub_zone(corefile);
    let zone = stub_zone(cluster_ip);
    if existing.as_deref() == Some(zone.as_str()) {
        return (corefile.to_string(), false);
    }
    (format!("{remainder}\n{zone}\n"), true)
}

fn strip_stub_zone(corefile: &str) -> (String, Option<String>) {
    let start = match corefile.find(STUB_BEGIN) {
        Some(start) => start,
        None => return (corefile.to_string(), None),
    };
    let end = match corefile[start..].find(STUB_END) {
        Some(end) => start + end + STUB_END.len(),
        None => return (corefile.to_string(), None),
    };
    let existing = corefile[start..end].to_string();
    let remainder = format!("{}{}", &corefile[..start], &corefile[end..]);
    (remainder, Some(existing))
}

/// A CoreDNS server block answering every `*.caddy.mesh` A query with the
/// proxy fleet's ClusterIP.
fn stub_zone(cluster_ip: &str) -> String {
    format!(
        r#"{begin}
{domain}:53 {{
    errors
    template IN A {domain} {{
        match .*\.{escaped}
        answer "{{{{ .Name }}}} 60 IN A {cluster_ip}"
        fallthrough
    }}
    kubernetes cluster.local in-addr.arpa ip6.arpa {{
        pods insecure
        fallthrough in-addr.arpa ip6.arpa
    }}
    forward . /etc/resolv.conf
    cache 30
    loop
    reload
    loadbalance
}}
{end}"#,
        begin = STUB_BEGIN,
        end = STUB_END,
        domain = MESH_DOMAIN,
        escaped = MESH_DOMAIN.replace('.', "\\."),
        cluster_ip = cluster_ip,
    )
}
