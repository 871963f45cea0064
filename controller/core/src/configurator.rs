use crate::{build_config, Port, PortServer, Service, ServiceGetter, ServiceRef, TrafficSplit};
use ahash::AHashMap as HashMap;
use hyper::{client::HttpConnector, header, Body, Request, StatusCode};
use serde::Deserialize;
use std::{
    collections::{btree_map::Entry, BTreeMap},
    sync::Arc,
};
use tokio::{sync::Mutex, time};
use tracing::warn;

/// How long a single proxy may take to acknowledge a configuration load.
const APPLY_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// The top-level table of port servers, updated by the reconcile loop and
/// fanned out to the proxy fleet.
///
/// One lock guards the entire state; `upsert`, `delete`, and `apply` each
/// hold it for their full duration. `apply`'s HTTP fan-out happens under the
/// lock as well, so the fleet never observes interleaved documents from two
/// concurrent applies; a slow proxy can stall reconciliation for at most
/// [`APPLY_TIMEOUT`] per request.
pub struct Configurator {
    getter: Arc<dyn ServiceGetter>,
    state: Mutex<State>,
    client: hyper::Client<HttpConnector>,
    admin_port: u16,
}

#[derive(Debug, Default)]
struct State {
    servers: BTreeMap<Port, PortServer>,

    /// Tracks which port server currently indexes each service, so an upsert
    /// that moves a service across ports can evict it from the old server.
    ports: HashMap<ServiceRef, Port>,
}

/// A configuration fan-out that did not reach the whole fleet.
///
/// `synced` counts the proxies that acknowledged the document before the
/// failure; proxies after the failing one were not attempted.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct SyncError {
    pub synced: usize,
    #[source]
    pub kind: SyncErrorKind,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncErrorKind {
    #[error("failed to encode configuration: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid proxy address {addr}: {source}")]
    Address {
        addr: String,
        #[source]
        source: hyper::http::Error,
    },

    #[error("request to {addr} failed: {source}")]
    Transport {
        addr: String,
        #[source]
        source: hyper::Error,
    },

    #[error("request to {addr} timed out")]
    Timeout { addr: String },

    #[error("{addr} rejected the configuration: {message}")]
    Rejected { addr: String, message: String },

    #[error("failed to decode error response from {addr}: {source}")]
    ErrorBody {
        addr: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct ProxyError {
    error: String,
}

impl Configurator {
    pub fn new(getter: Arc<dyn ServiceGetter>) -> Self {
        Self {
            getter,
            state: Mutex::new(State::default()),
            client: hyper::Client::new(),
            admin_port: crate::PROXY_ADMIN_PORT,
        }
    }

    /// Indexes `svc` into the port server for its listen port, migrating it
    /// away from a previous port if needed. Returns whether the model
    /// observably changed.
    pub async fn upsert(&self, svc: Service) -> bool {
        let split = self.derive_split(&svc).await;

        let mut state = self.state.lock().await;
        let mut changed = false;

        if let Some(old_port) = state.ports.get(&svc.reference).copied() {
            if old_port != svc.port {
                let emptied = match state.servers.get_mut(&old_port) {
                    Some(server) => {
                        changed |= server.delete(&svc.reference);
                        server.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    state.servers.remove(&old_port);
                }
            }
        }
        state.ports.insert(svc.reference.clone(), svc.port);

        let server = match state.servers.entry(svc.port) {
            Entry::Vacant(entry) => {
                changed = true;
                entry.insert(PortServer::new(svc.port))
            }
            Entry::Occupied(entry) => entry.into_mut(),
        };
        changed | server.upsert(svc, split)
    }

    /// Removes the service from whichever port server indexes it, discarding
    /// the server if it becomes empty. Returns whether the model observably
    /// changed.
    pub async fn delete(&self, reference: &ServiceRef) -> bool {
        let mut state = self.state.lock().await;
        let port = match state.ports.remove(reference) {
            Some(port) => port,
            None => return false,
        };

        let (changed, emptied) = match state.servers.get_mut(&port) {
            Some(server) => (server.delete(reference), server.is_empty()),
            None => (false, false),
        };
        if emptied {
            state.servers.remove(&port);
        }
        changed
    }

    /// Builds the current configuration document and POSTs it to every proxy
    /// admin endpoint, in order, stopping at the first failure. Returns the
    /// number of proxies that acknowledged the document.
    pub async fn apply(&self, proxy_ips: &[String]) -> Result<usize, SyncError> {
        let state = self.state.lock().await;
        let config = build_config(&state.servers);
        let body = serde_json::to_vec(&config).map_err(|e| SyncError {
            synced: 0,
            kind: e.into(),
        })?;

        for (synced, ip) in proxy_ips.iter().enumerate() {
            self.apply_one(ip, body.clone())
                .await
                .map_err(|kind| SyncError { synced, kind })?;
        }
        Ok(proxy_ips.len())
    }

    async fn apply_one(&self, ip: &str, body: Vec<u8>) -> Result<(), SyncErrorKind> {
        let addr = format!("{}:{}", ip, self.admin_port);
        let request = Request::post(format!("http://{addr}/load"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(|source| SyncErrorKind::Address {
                addr: addr.clone(),
                source,
            })?;

        let exchange = async {
            let response =
                self.client
                    .request(request)
                    .await
                    .map_err(|source| SyncErrorKind::Transport {
                        addr: addr.clone(),
                        source,
                    })?;

            if response.status() == StatusCode::OK {
                return Ok(());
            }

            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body())
                .await
                .map_err(|source| SyncErrorKind::Transport {
                    addr: addr.clone(),
                    source,
                })?;
            let message = serde_json::from_slice::<ProxyError>(&bytes)
                .map_err(|source| SyncErrorKind::ErrorBody {
                    addr: addr.clone(),
                    source,
                })?
                .error;
            warn!(%addr, %status, %message, "proxy rejected configuration");
            Err(SyncErrorKind::Rejected {
                addr: addr.clone(),
                message,
            })
        };

        time::timeout(APPLY_TIMEOUT, exchange)
            .await
            .map_err(|_| SyncErrorKind::Timeout { addr })?
    }

    /// Derives a traffic split from `svc`'s annotations, resolving both peer
    /// snapshots through the service getter. A missing annotation, an
    /// unresolvable peer, or a lookup failure all yield `None`: the service
    /// is then treated as a plain service.
    async fn derive_split(&self, svc: &Service) -> Option<TrafficSplit> {
        let (expression, new_name, old_name) = svc.policy.split()?;
        let namespace = &svc.reference.namespace;

        let new_service = self.resolve_peer(new_name, namespace).await?;
        let old_service = self.resolve_peer(old_name, namespace).await?;

        Some(TrafficSplit {
            service: svc.clone(),
            expression: expression.to_string(),
            new_service,
            old_service,
        })
    }

    async fn resolve_peer(&self, name: &str, namespace: &str) -> Option<Service> {
        match self.getter.get(name, namespace).await {
            Ok(Some(svc)) => Some(svc),
            Ok(None) => {
                warn!(%name, %namespace, "traffic-split peer service not found");
                None
            }
            Err(error) => {
                warn!(%error, %name, %namespace, "failed to look up traffic-split peer service");
                None
            }
        }
    }
}
