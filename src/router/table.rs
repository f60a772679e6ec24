//! Immutable route table snapshots.
//!
//! Every mutation returns a new table; the router publishes it atomically.
//! Instance sets are keyed by service name independently of registrations,
//! so an instance announced before its service registers is not lost.

use imgate_proto::action::prefixes;
use imgate_proto::{DiscoveryType, RegisterRequest, RoutePolicy, Uid};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use super::policy::{HashRing, choose};
use crate::error::RouteError;

/// One addressable instance of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub addr: String,
    pub healthy: bool,
}

impl Instance {
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            healthy: true,
        }
    }
}

/// Instances of one service plus the hash ring over the healthy ones.
#[derive(Debug, Clone, Default)]
pub struct InstanceSet {
    instances: Vec<Instance>,
    healthy: Vec<usize>,
    ring: HashRing,
}

impl InstanceSet {
    pub fn new(mut instances: Vec<Instance>) -> Self {
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances.dedup_by(|a, b| a.id == b.id);
        let healthy: Vec<usize> = instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.healthy)
            .map(|(idx, _)| idx)
            .collect();
        let ring = HashRing::build(healthy.iter().map(|&idx| (idx, instances[idx].id.as_str())));
        Self {
            instances,
            healthy,
            ring,
        }
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.healthy.len()
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    /// Insert or replace by id. Health is carried over for an unchanged address.
    pub fn upsert(&self, mut instance: Instance) -> Self {
        let mut instances = self.instances.clone();
        if let Some(existing) = instances.iter_mut().find(|i| i.id == instance.id) {
            if existing.addr == instance.addr {
                instance.healthy = existing.healthy;
            }
            *existing = instance;
        } else {
            instances.push(instance);
        }
        Self::new(instances)
    }

    pub fn remove(&self, id: &str) -> Self {
        Self::new(self.instances.iter().filter(|i| i.id != id).cloned().collect())
    }

    /// `None` when nothing changes.
    pub fn with_health(&self, id: &str, healthy: bool) -> Option<Self> {
        let pos = self.instances.iter().position(|i| i.id == id)?;
        if self.instances[pos].healthy == healthy {
            return None;
        }
        let mut instances = self.instances.clone();
        instances[pos].healthy = healthy;
        Some(Self::new(instances))
    }

    /// Select an instance under `policy`.
    pub fn pick(&self, policy: RoutePolicy, cursor: &AtomicUsize, uid: Uid) -> Option<&Instance> {
        choose(policy, &self.healthy, &self.ring, cursor, uid).map(|idx| &self.instances[idx])
    }
}

/// A registered service.
#[derive(Debug)]
pub struct RouteEntry {
    pub service_id: String,
    pub service_name: String,
    pub policy: RoutePolicy,
    pub discovery: DiscoveryType,
    /// Coordinator endpoints, or instance addresses under static discovery.
    pub endpoints: Vec<String>,
    /// Claimed namespaces, `service_name` first.
    pub namespaces: Vec<String>,
    /// Round-robin position; shared by every snapshot of this service.
    pub cursor: Arc<AtomicUsize>,
}

impl RouteEntry {
    pub fn from_request(req: &RegisterRequest) -> Self {
        let mut namespaces = vec![req.srv_name.clone()];
        for ns in &req.namespaces {
            if !namespaces.contains(ns) {
                namespaces.push(ns.clone());
            }
        }
        Self {
            service_id: req.srv_id.clone(),
            service_name: req.srv_name.clone(),
            policy: req.route_policy,
            discovery: req.discovery_type,
            endpoints: req.discovery_srv_url.clone(),
            namespaces,
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The request this entry was built from.
    pub fn to_request(&self) -> RegisterRequest {
        RegisterRequest {
            srv_id: self.service_id.clone(),
            srv_name: self.service_name.clone(),
            route_policy: self.policy,
            discovery_srv_url: self.endpoints.clone(),
            discovery_type: self.discovery,
            namespaces: self.namespaces.iter().skip(1).cloned().collect(),
        }
    }

    fn static_instances(&self) -> InstanceSet {
        InstanceSet::new(
            self.endpoints
                .iter()
                .map(|addr| Instance::new(addr.clone(), addr.clone()))
                .collect(),
        )
    }
}

/// The outcome of resolving an action.
#[derive(Debug, Clone)]
pub struct Selected {
    pub service: Arc<RouteEntry>,
    pub instance: Instance,
}

/// Service registrations, namespace claims, and instance sets.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    services: HashMap<String, Arc<RouteEntry>>,
    namespaces: HashMap<String, String>,
    instances: HashMap<String, Arc<InstanceSet>>,
    version: u64,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped on every published change.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn service(&self, name: &str) -> Option<&Arc<RouteEntry>> {
        self.services.get(name)
    }

    pub fn instances(&self, name: &str) -> Option<&Arc<InstanceSet>> {
        self.instances.get(name)
    }

    /// Registered service names, sorted.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every `(service, instance)` pair.
    pub fn all_instances(&self) -> Vec<(String, Instance)> {
        self.instances
            .iter()
            .flat_map(|(svc, set)| set.instances().iter().map(move |i| (svc.clone(), i.clone())))
            .collect()
    }

    /// Service claiming the longest prefix of `action`.
    pub fn resolve(&self, action: &str) -> Result<&Arc<RouteEntry>, RouteError> {
        if !imgate_proto::action::is_valid(action) {
            return Err(RouteError::InvalidAction(action.to_string()));
        }
        prefixes(action)
            .find_map(|p| self.namespaces.get(p))
            .and_then(|name| self.services.get(name))
            .ok_or_else(|| RouteError::RouteUnresolved(action.to_string()))
    }

    /// Resolve `action` and pick an instance for `uid`.
    pub fn select(&self, action: &str, uid: Uid) -> Result<Selected, RouteError> {
        let service = self.resolve(action)?;
        let instance = self
            .instances
            .get(&service.service_name)
            .and_then(|set| set.pick(service.policy, &service.cursor, uid))
            .ok_or_else(|| RouteError::RouteUnavailable(service.service_name.clone()))?;
        Ok(Selected {
            service: Arc::clone(service),
            instance: instance.clone(),
        })
    }

    fn bumped(mut self) -> Self {
        self.version += 1;
        self
    }

    /// Insert or replace a registration.
    ///
    /// Re-registering keeps the round-robin cursor. Namespaces claimed by
    /// the previous registration are released first; a namespace claimed by
    /// another service moves to this one.
    pub fn with_service(&self, mut entry: RouteEntry) -> Self {
        let mut next = self.clone();
        if let Some(old) = next.services.remove(&entry.service_name) {
            entry.cursor = Arc::clone(&old.cursor);
            next.release_namespaces(&old);
        }
        for ns in &entry.namespaces {
            next.namespaces.insert(ns.clone(), entry.service_name.clone());
        }
        if entry.discovery == DiscoveryType::Static {
            next.instances
                .insert(entry.service_name.clone(), Arc::new(entry.static_instances()));
        }
        next.services.insert(entry.service_name.clone(), Arc::new(entry));
        next.bumped()
    }

    /// Drop a registration. Announced instances of a coordinator service stay.
    pub fn without_service(&self, name: &str) -> Option<Self> {
        let mut next = self.clone();
        let old = next.services.remove(name)?;
        next.release_namespaces(&old);
        if old.discovery == DiscoveryType::Static {
            next.instances.remove(name);
        }
        Some(next.bumped())
    }

    fn release_namespaces(&mut self, entry: &RouteEntry) {
        for ns in &entry.namespaces {
            if self.namespaces.get(ns) == Some(&entry.service_name) {
                self.namespaces.remove(ns);
            }
        }
    }

    pub fn with_instance(&self, service: &str, instance: Instance) -> Self {
        let mut next = self.clone();
        let set = match next.instances.get(service) {
            Some(set) => set.upsert(instance),
            None => InstanceSet::new(vec![instance]),
        };
        next.instances.insert(service.to_string(), Arc::new(set));
        next.bumped()
    }

    pub fn without_instance(&self, service: &str, id: &str) -> Option<Self> {
        let set = self.instances.get(service)?;
        set.get(id)?;
        let mut next = self.clone();
        let set = set.remove(id);
        if set.is_empty() {
            next.instances.remove(service);
        } else {
            next.instances.insert(service.to_string(), Arc::new(set));
        }
        Some(next.bumped())
    }

    /// `None` when the instance is unknown or already in that state.
    pub fn with_health(&self, service: &str, id: &str, healthy: bool) -> Option<Self> {
        let set = self.instances.get(service)?.with_health(id, healthy)?;
        let mut next = self.clone();
        next.instances.insert(service.to_string(), Arc::new(set));
        Some(next.bumped())
    }

    /// Replace every coordinator-sourced instance set, keeping static ones.
    pub fn with_discovered(&self, discovered: HashMap<String, Vec<Instance>>) -> Self {
        let mut next = self.clone();
        next.instances.retain(|name, _| {
            self.services
                .get(name)
                .is_some_and(|s| s.discovery == DiscoveryType::Static)
        });
        for (service, list) in discovered {
            let is_static = next
                .services
                .get(&service)
                .is_some_and(|s| s.discovery == DiscoveryType::Static);
            if is_static {
                continue;
            }
            // keep known health for unchanged instances
            let prior = self.instances.get(&service);
            let list = list
                .into_iter()
                .map(|mut i| {
                    if let Some(old) = prior.and_then(|set| set.get(&i.id))
                        && old.addr == i.addr
                    {
                        i.healthy = old.healthy;
                    }
                    i
                })
                .collect();
            next.instances.insert(service, Arc::new(InstanceSet::new(list)));
        }
        next.bumped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(
        table: &RouteTable,
        name: &str,
        namespaces: &[&str],
        endpoints: &[&str],
    ) -> RouteTable {
        let mut req = RegisterRequest::named(name);
        req.discovery_type = DiscoveryType::Static;
        req.discovery_srv_url = endpoints.iter().map(|s| s.to_string()).collect();
        req.namespaces = namespaces.iter().map(|s| s.to_string()).collect();
        table.with_service(RouteEntry::from_request(&req))
    }

    #[test]
    fn longest_prefix_wins() {
        let t = register(&RouteTable::new(), "api", &[], &["127.0.0.1:1"]);
        let t = register(&t, "auth", &["api.auth"], &["127.0.0.1:2"]);

        assert_eq!(t.resolve("api.auth.signin").unwrap().service_name, "auth");
        assert_eq!(t.resolve("api.app.echo").unwrap().service_name, "api");
        assert!(matches!(t.resolve("im.send"), Err(RouteError::RouteUnresolved(_))));
        assert!(matches!(t.resolve("bad..action"), Err(RouteError::InvalidAction(_))));
    }

    #[test]
    fn reregister_keeps_cursor_and_releases_namespaces() {
        let t = register(&RouteTable::new(), "api", &["legacy"], &["a:1", "b:1"]);
        let cursor = Arc::clone(&t.service("api").unwrap().cursor);
        let t = register(&t, "api", &[], &["a:1", "b:1"]);
        assert!(Arc::ptr_eq(&cursor, &t.service("api").unwrap().cursor));
        assert!(t.resolve("legacy.x").is_err());
    }

    #[test]
    fn unavailable_without_healthy_instances() {
        let t = register(&RouteTable::new(), "api", &[], &["a:1"]);
        assert_eq!(t.select("api.x", 1).unwrap().instance.addr, "a:1");

        let t = t.with_health("api", "a:1", false).unwrap();
        assert!(matches!(t.select("api.x", 1), Err(RouteError::RouteUnavailable(_))));
        assert!(t.with_health("api", "a:1", false).is_none());
    }

    #[test]
    fn coordinator_instances_survive_registration_order() {
        let t = RouteTable::new().with_instance("im", Instance::new("im-1", "h:1"));
        let t = t.with_service(RouteEntry::from_request(&RegisterRequest::named("im")));
        assert_eq!(t.select("im.send", 3).unwrap().instance.id, "im-1");

        let t = t.without_service("im").unwrap();
        assert_eq!(t.instances("im").unwrap().len(), 1);
        let t = t.without_instance("im", "im-1").unwrap();
        assert!(t.instances("im").is_none());
    }

    #[test]
    fn versions_increase() {
        let t0 = RouteTable::new();
        let t1 = register(&t0, "api", &[], &["a:1"]);
        let t2 = t1.with_instance("x", Instance::new("x", "x:1"));
        assert!(t0.version() < t1.version() && t1.version() < t2.version());
    }

    #[test]
    fn discovered_sets_keep_health_and_static_sets() {
        let t = register(&RouteTable::new(), "api", &[], &["a:1"]);
        let t = t.with_instance("im", Instance::new("im-1", "h:1"));
        let t = t.with_health("im", "im-1", false).unwrap();

        let mut found = HashMap::new();
        found.insert(
            "im".to_string(),
            vec![Instance::new("im-1", "h:1"), Instance::new("im-2", "h:2")],
        );
        let t = t.with_discovered(found);

        let im = t.instances("im").unwrap();
        assert_eq!(im.len(), 2);
        assert_eq!(im.healthy_count(), 1);
        assert_eq!(t.instances("api").unwrap().len(), 1);
    }
}
