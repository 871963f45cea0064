use crate::{Port, Service, ServiceRef, TrafficSplit};
use std::collections::{btree_map::Entry, BTreeMap};

/// Aggregates every mesh service and traffic split sharing one listen port.
///
/// Both maps are ordered by the canonical [`ServiceRef`] sort key so the
/// configuration builder can walk them without re-sorting.
///
/// Invariants: a splitter service is always also present in `services`, and
/// `traffic_splits[r].service.reference == r`. An instance with both maps
/// empty is transient; the configurator discards it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortServer {
    pub(crate) port: Port,
    pub(crate) traffic_splits: BTreeMap<ServiceRef, TrafficSplit>,
    pub(crate) services: BTreeMap<ServiceRef, Service>,
}

impl PortServer {
    pub fn new(port: Port) -> Self {
        Self {
            port,
            traffic_splits: BTreeMap::new(),
            services: BTreeMap::new(),
        }
    }

    /// Indexes `svc` (and its derived traffic split, if any), returning
    /// whether the server's state observably changed.
    ///
    /// When `svc` no longer carries a derivable split, its fronting entry is
    /// dropped. Independently, every other split whose peer snapshot refers
    /// to `svc` is refreshed, so peer updates propagate into the embedded
    /// copies.
    pub fn upsert(&mut self, svc: Service, split: Option<TrafficSplit>) -> bool {
        let mut changed = false;

        match split {
            Some(ts) => match self.traffic_splits.entry(svc.reference.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(ts);
                    changed = true;
                }
                Entry::Occupied(mut entry) => {
                    if *entry.get() != ts {
                        entry.insert(ts);
                        changed = true;
                    }
                }
            },
            None => {
                if self.traffic_splits.remove(&svc.reference).is_some() {
                    changed = true;
                }
            }
        }

        for (host, ts) in self.traffic_splits.iter_mut() {
            // The split fronted by `svc` itself was just rebuilt from
            // freshly-resolved peers; leave its snapshots alone.
            if *host == svc.reference {
                continue;
            }
            if ts.new_service.reference == svc.reference && ts.new_service != svc {
                ts.new_service = svc.clone();
                changed = true;
            }
            if ts.old_service.reference == svc.reference && ts.old_service != svc {
                ts.old_service = svc.clone();
                changed = true;
            }
        }

        match self.services.entry(svc.reference.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(svc);
                changed = true;
            }
            Entry::Occupied(mut entry) => {
                if *entry.get() != svc {
                    entry.insert(svc);
                    changed = true;
                }
            }
        }

        changed
    }

    /// Removes the service from both maps.
    ///
    /// Splits referencing the removed service as a peer are left untouched:
    /// deletions typically occur while a canary is being cleaned up, when the
    /// fronting split is removed moments later.
    pub fn delete(&mut self, reference: &ServiceRef) -> bool {
        let mut changed = false;
        if self.traffic_splits.remove(reference).is_some() {
            changed = true;
        }
        if self.services.remove(reference).is_some() {
            changed = true;
        }
        changed
    }

    pub fn is_empty(&self) -> bool {
        self.traffic_splits.is_empty() && self.services.is_empty()
    }

    pub fn port(&self) -> Port {
        self.port
    }
}
