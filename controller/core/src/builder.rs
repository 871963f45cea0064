//! Builds the Caddy configuration document from the configurator's state.
//!
//! The build is a pure function of the port-server table: port servers are
//! walked in ascending port order, traffic-split routes precede plain
//! service routes, and each group is ordered by the canonical service sort
//! key. Since JSON objects serialize with sorted keys, equal states always
//! produce byte-identical documents.

use crate::{Port, PortServer, Service, ServiceRef, TrafficSplit, PROXY_ADMIN_PORT};
use serde_json::{json, Map, Value};
use std::{collections::BTreeMap, time::Duration};

/// Renders the full configuration document for the given port servers.
pub fn build_config(servers: &BTreeMap<Port, PortServer>) -> Value {
    let mut cfg_servers = Map::new();
    for server in servers.values() {
        let port = server.port();
        let split_routes = server
            .traffic_splits
            .values()
            .map(build_traffic_split)
            .collect::<Vec<_>>();
        let service_routes = server
            .services
            .values()
            .map(build_service)
            .collect::<Vec<_>>();

        let mut routes = Vec::new();
        if !split_routes.is_empty() {
            routes.push(subroute(split_routes, None));
        }
        if !service_routes.is_empty() {
            routes.push(subroute(service_routes, None));
        }

        cfg_servers.insert(
            format!("server-{port}"),
            json!({
                "automatic_https": {"disable": true},
                "listen": [format!(":{port}")],
                "routes": routes,
            }),
        );
    }

    json!({
        "admin": {"listen": format!("0.0.0.0:{PROXY_ADMIN_PORT}")},
        "apps": {"http": {"servers": cfg_servers}},
    })
}

/// A canary subroute: requests for the fronting host that match the split
/// expression go to the new service; everything else falls through to the
/// old one.
fn build_traffic_split(ts: &TrafficSplit) -> Value {
    let routes = vec![
        build_route(&ts.new_service, Some(json!({"expression": ts.expression}))),
        build_route(&ts.old_service, None),
    ];
    subroute(routes, Some(host_match(&ts.service.reference)))
}

fn build_service(svc: &Service) -> Value {
    build_route(svc, Some(host_match(&svc.reference)))
}

fn host_match(reference: &ServiceRef) -> Value {
    json!({"host": [reference.mesh_host()]})
}

fn subroute(routes: Vec<Value>, matcher: Option<Value>) -> Value {
    let mut route = json!({
        "handle": [{
            "handler": "subroute",
            "routes": routes,
        }],
    });
    if let Some(matcher) = matcher {
        route["match"] = json!([matcher]);
    }
    route
}

/// One route proxying to `svc`, with the service's rate-limit handler (if
/// any) ahead of the reverse proxy in the handle chain.
fn build_route(svc: &Service, matcher: Option<Value>) -> Value {
    let mut handle = Vec::new();
    if let Some((key, rate)) = svc.policy.rate_limit() {
        let mut limiter = json!({
            "handler": "rate_limit",
            "key": key,
            "rate": rate,
        });
        if let Some(zone_size) = svc.policy.rate_limit_zone_size {
            limiter["zone_size"] = zone_size.into();
        }
        handle.push(limiter);
    }
    handle.push(reverse_proxy(svc));

    let mut route = json!({"handle": handle});
    if let Some(matcher) = matcher {
        route["match"] = json!([matcher]);
    }
    route
}

fn reverse_proxy(svc: &Service) -> Value {
    let upstreams = svc
        .endpoints
        .iter()
        .map(|ip| json!({"dial": format!("{}:{}", ip, svc.pod_port)}))
        .collect::<Vec<_>>();

    let policy = &svc.policy;
    let mut load_balancing = json!({
        "selection_policy": {"policy": "round_robin"},
    });
    if let Some(retries) = policy.retry_count {
        load_balancing["retries"] = retries.into();
    }
    if let Some(d) = policy.retry_duration {
        load_balancing["try_duration"] = nanos(d);
    }
    if let Some(expression) = &policy.retry_on {
        load_balancing["retry_match"] = json!([{"expression": expression}]);
    }

    let mut proxy = json!({
        "handler": "reverse_proxy",
        "load_balancing": load_balancing,
        "upstreams": upstreams,
    });
    if policy.has_timeouts() {
        let mut transport = json!({"protocol": "http"});
        if let Some(d) = policy.dial_timeout {
            transport["dial_timeout"] = nanos(d);
        }
        if let Some(d) = policy.read_timeout {
            transport["read_timeout"] = nanos(d);
        }
        if let Some(d) = policy.write_timeout {
            transport["write_timeout"] = nanos(d);
        }
        proxy["transport"] = transport;
    }
    proxy
}

// Caddy accepts durations as integer nanoseconds.
fn nanos(d: Duration) -> Value {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Policy;

    fn mk_service(name: &str, port: u16, endpoints: &[&str], policy: Policy) -> Service {
        Service {
            reference: ServiceRef::new(name, "test"),
            port: Port(port),
            pod_port: port,
            endpoints: endpoints.iter().map(ToString::to_string).collect(),
            policy,
        }
    }

    fn server_with(services: Vec<Service>, splits: Vec<TrafficSplit>) -> PortServer {
        let port = services[0].port;
        let mut server = PortServer::new(port);
        for svc in services {
            server.services.insert(svc.reference.clone(), svc);
        }
        for ts in splits {
            server
                .traffic_splits
                .insert(ts.service.reference.clone(), ts);
        }
        server
    }

    #[test]
    fn single_service() {
        let svc = mk_service(
            "svc-1",
            80,
            &["127.0.0.2", "127.0.0.3"],
            Policy::default(),
        );
        let servers = BTreeMap::from([(Port(80), server_with(vec![svc], vec![]))]);

        let config = build_config(&servers);
        assert_eq!(
            config,
            json!({
                "admin": {"listen": "0.0.0.0:2019"},
                "apps": {"http": {"servers": {
                    "server-80": {
                        "automatic_https": {"disable": true},
                        "listen": [":80"],
                        "routes": [{
                            "handle": [{
                                "handler": "subroute",
                                "routes": [{
                                    "match": [{"host": ["svc-1.test.caddy.mesh"]}],
                                    "handle": [{
                                        "handler": "reverse_proxy",
                                        "load_balancing": {
                                            "selection_policy": {"policy": "round_robin"},
                                        },
                                        "upstreams": [
                                            {"dial": "127.0.0.2:80"},
                                            {"dial": "127.0.0.3:80"},
                                        ],
                                    }],
                                }],
                            }],
                        }],
                    },
                }}},
            }),
        );
    }

    #[test]
    fn traffic_split_precedes_services_and_refs_are_sorted() {
        let old = mk_service("svc-1", 80, &["127.0.0.2", "127.0.0.3"], Policy::default());
        let new = mk_service("svc-2", 80, &["127.0.0.4", "127.0.0.5"], Policy::default());
        let host = mk_service(
            "svc",
            80,
            &["127.0.0.2", "127.0.0.3", "127.0.0.4", "127.0.0.5"],
            Policy::default(),
        );
        let ts = TrafficSplit {
            service: host.clone(),
            expression: "false".to_string(),
            new_service: new.clone(),
            old_service: old.clone(),
        };
        let servers = BTreeMap::from([(
            Port(80),
            server_with(vec![host, old, new], vec![ts]),
        )]);

        let config = build_config(&servers);
        let routes = &config["apps"]["http"]["servers"]["server-80"]["routes"];

        // The split subroute comes first, matching the fronting host and
        // trying the expression route before the default branch.
        let split = &routes[0];
        assert_eq!(
            split["match"],
            json!([{"host": ["svc.test.caddy.mesh"]}]),
        );
        let split_routes = &split["handle"][0]["routes"];
        assert_eq!(
            split_routes[0]["match"],
            json!([{"expression": "false"}]),
        );
        assert_eq!(
            split_routes[0]["handle"][0]["upstreams"],
            json!([{"dial": "127.0.0.4:80"}, {"dial": "127.0.0.5:80"}]),
        );
        assert!(split_routes[1].get("match").is_none());
        assert_eq!(
            split_routes[1]["handle"][0]["upstreams"],
            json!([{"dial": "127.0.0.2:80"}, {"dial": "127.0.0.3:80"}]),
        );

        // The plain-service subroute lists svc, svc-1, svc-2 in sorted order.
        let hosts = routes[1]["handle"][0]["routes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["match"][0]["host"][0].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            hosts,
            vec![
                "svc-1.test.caddy.mesh",
                "svc-2.test.caddy.mesh",
                "svc.test.caddy.mesh",
            ],
        );
    }

    #[test]
    fn timeouts_emit_a_transport_block() {
        let policy = Policy {
            dial_timeout: Some(Duration::from_secs(10)),
            read_timeout: Some(Duration::from_secs(10)),
            write_timeout: Some(Duration::from_secs(10)),
            ..Policy::default()
        };
        let svc = mk_service("svc-3", 8080, &["127.0.0.6", "127.0.0.7"], policy);
        let servers = BTreeMap::from([(Port(8080), server_with(vec![svc], vec![]))]);

        let config = build_config(&servers);
        let proxy = &config["apps"]["http"]["servers"]["server-8080"]["routes"][0]["handle"][0]
            ["routes"][0]["handle"][0];
        assert_eq!(
            proxy["transport"],
            json!({
                "protocol": "http",
                "dial_timeout": 10_000_000_000u64,
                "read_timeout": 10_000_000_000u64,
                "write_timeout": 10_000_000_000u64,
            }),
        );
        assert_eq!(
            proxy["load_balancing"],
            json!({"selection_policy": {"policy": "round_robin"}}),
        );
    }

    #[test]
    fn retries_extend_load_balancing() {
        let policy = Policy {
            retry_count: Some(3),
            retry_duration: Some(Duration::from_secs(2)),
            retry_on: Some("{http.error.status_code} >= 500".to_string()),
            ..Policy::default()
        };
        let svc = mk_service("svc-1", 80, &["127.0.0.2"], policy);
        let servers = BTreeMap::from([(Port(80), server_with(vec![svc], vec![]))]);

        let config = build_config(&servers);
        let proxy = &config["apps"]["http"]["servers"]["server-80"]["routes"][0]["handle"][0]
            ["routes"][0]["handle"][0];
        assert_eq!(
            proxy["load_balancing"],
            json!({
                "selection_policy": {"policy": "round_robin"},
                "retries": 3,
                "try_duration": 2_000_000_000u64,
                "retry_match": [{"expression": "{http.error.status_code} >= 500"}],
            }),
        );
        assert!(proxy.get("transport").is_none());
    }

    #[test]
    fn rate_limit_handler_precedes_the_reverse_proxy() {
        let policy = Policy {
            rate_limit_key: Some("{http.request.remote.host}".to_string()),
            rate_limit_rate: Some("100r/s".to_string()),
            rate_limit_zone_size: Some(1024),
            ..Policy::default()
        };
        let svc = mk_service("svc-1", 80, &["127.0.0.2"], policy);
        let servers = BTreeMap::from([(Port(80), server_with(vec![svc], vec![]))]);

        let config = build_config(&servers);
        let handle = &config["apps"]["http"]["servers"]["server-80"]["routes"][0]["handle"][0]
            ["routes"][0]["handle"];
        assert_eq!(
            handle[0],
            json!({
                "handler": "rate_limit",
                "key": "{http.request.remote.host}",
                "rate": "100r/s",
                "zone_size": 1024,
            }),
        );
        assert_eq!(handle[1]["handler"], json!("reverse_proxy"));
    }

    #[test]
    fn equal_states_build_byte_identical_documents() {
        let a = mk_service("svc-a", 80, &["127.0.0.2"], Policy::default());
        let b = mk_service("svc-b", 80, &["127.0.0.3"], Policy::default());
        let c = mk_service("svc-c", 8080, &["127.0.0.4"], Policy::default());

        // Populate two tables in opposite insertion orders.
        let forward = BTreeMap::from([
            (Port(80), server_with(vec![a.clone(), b.clone()], vec![])),
            (Port(8080), server_with(vec![c.clone()], vec![])),
        ]);
        let reverse = BTreeMap::from([
            (Port(8080), server_with(vec![c], vec![])),
            (Port(80), server_with(vec![b, a], vec![])),
        ]);

        let forward = serde_json::to_vec(&build_config(&forward)).unwrap();
        let reverse = serde_json::to_vec(&build_config(&reverse)).unwrap();
        assert_eq!(forward, reverse);
    }
}
