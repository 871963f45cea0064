use crate::{Api, Client, ListParams, Pod, ResourceExt, Service, ServiceSpec, PROXY_SERVICE_NAME};
use anyhow::{Context, Result};
use caddy_mesh_controller_core as mesh;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use tracing::warn;

/// Converts a cluster Service into the configurator's canonical form.
///
/// Returns `Ok(None)` for services the mesh cannot route: headless services
/// without a selector, services without ports, and services whose target
/// port is a named port.
pub(crate) async fn to_mesh_service(
    client: &Client,
    svc: &Service,
) -> Result<Option<mesh::Service>> {
    let name = svc.name_unchecked();
    let namespace = svc.namespace().context("service has no namespace")?;

    let spec = match &svc.spec {
        Some(spec) => spec,
        None => return Ok(None),
    };
    let (port, pod_port) = match mesh_ports(spec) {
        Some(ports) => ports,
        None => {
            warn!(%name, %namespace, "service has no usable port");
            return Ok(None);
        }
    };
    let selector = match &spec.selector {
        Some(selector) if !selector.is_empty() => selector,
        _ => {
            warn!(%name, %namespace, "service has no selector");
            return Ok(None);
        }
    };

    let endpoints = pod_ips(client, &namespace, selector).await?;

    let policy = match mesh::Policy::decode(svc.annotations()) {
        Ok(policy) => policy,
        Err(error) => {
            warn!(%error, %name, %namespace, "bad service annotations");
            mesh::Policy::default()
        }
    };

    Ok(Some(mesh::Service {
        reference: mesh::ServiceRef::new(name, namespace),
        port,
        pod_port,
        endpoints,
        policy,
    }))
}

/// The listen port and pod target port of a service.
// TODO: index every service port, not just the first one.
pub(crate) fn mesh_ports(spec: &ServiceSpec) -> Option<(mesh::Port, u16)> {
    let port = spec.ports.as_ref()?.first()?;
    let listen = u16::try_from(port.port).ok()?;
    let pod_port = match &port.target_port {
        Some(IntOrString::Int(p)) => u16::try_from(*p).ok()?,
        // Named target ports would need to be resolved against pod specs.
        Some(IntOrString::String(_)) => return None,
        None => listen,
    };
    Some((mesh::Port(listen), pod_port))
}

/// IPs of the ready-or-not pods selected by `selector`, in a fixed order so
/// that model equality is meaningful.
pub(crate) async fn pod_ips(
    client: &Client,
    namespace: &str,
    selector: &BTreeMap<String, String>,
) -> Result<Vec<String>> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default().labels(&selector_string(selector));
    let mut ips = pods
        .list(&params)
        .await
        .context("failed to list pods")?
        .items
        .into_iter()
        .filter_map(|pod| pod.status.and_then(|status| status.pod_ip))
        .filter(|ip| !ip.is_empty())
        .collect::<Vec<_>>();
    ips.sort();
    Ok(ips)
}

/// IPs of the Caddy proxy pods fronted by the `caddy-mesh-proxy` service.
pub(crate) async fn proxy_pod_ips(client: &Client, proxy_namespace: &str) -> Result<Vec<String>> {
    let services: Api<Service> = Api::namespaced(client.clone(), proxy_namespace);
    let proxy = services
        .get(PROXY_SERVICE_NAME)
        .await
        .with_context(|| format!("failed to fetch {PROXY_SERVICE_NAME} in {proxy_namespace}"))?;
    let selector = proxy
        .spec
        .and_then(|spec| spec.selector)
        .filter(|selector| !selector.is_empty())
        .with_context(|| format!("{PROXY_SERVICE_NAME} has no selector"))?;
    pod_ips(client, proxy_namespace, &selector).await
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServicePort;
    use maplit::btreemap;

    #[test]
    fn selector_strings_are_comma_joined() {
        let selector = btreemap! {
            "app".to_string() => "whoami".to_string(),
            "tier".to_string() => "web".to_string(),
        };
        assert_eq!(selector_string(&selector), "app=whoami,tier=web");
    }

    #[test]
    fn ports_come_from_the_first_service_port() {
        let spec = ServiceSpec {
            ports: Some(vec![
                ServicePort {
                    port: 80,
                    target_port: Some(IntOrString::Int(8080)),
                    ..Default::default()
                },
                ServicePort {
                    port: 443,
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };
        assert_eq!(mesh_ports(&spec), Some((mesh::Port(80), 8080)));
    }

    #[test]
    fn target_port_defaults_to_the_listen_port() {
        let spec = ServiceSpec {
            ports: Some(vec![ServicePort {
                port: 80,
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert_eq!(mesh_ports(&spec), Some((mesh::Port(80), 80)));
    }

    #[test]
    fn named_target_ports_are_not_routable() {
        let spec = ServiceSpec {
            ports: Some(vec![ServicePort {
                port: 80,
                target_port: Some(IntOrString::String("http".to_string())),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert_eq!(mesh_ports(&spec), None);
    }

    #[test]
    fn portless_specs_are_not_routable() {
        assert_eq!(mesh_ports(&ServiceSpec::default()), None);
        let spec = ServiceSpec {
            ports: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(mesh_ports(&spec), None);
    }
}
