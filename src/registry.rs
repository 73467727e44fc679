//! Service registry seam and a static, round-robin implementation
//!
//! The gateway only consumes `ServiceRegistry::next_instance`. How instances
//! are discovered and health-checked belongs to the registry; `StaticRegistry`
//! is seeded from configuration and mutated through its own API.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ServiceConfig;

/// A backend instance as returned by one registry lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub host: String,
    pub port: u16,
    pub metadata: HashMap<String, String>,
}

impl Instance {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_meta(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// `host:port`, used both as the URI authority and as the instance identity in logs
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("no healthy instance for service: {0}")]
    NoHealthyInstance(String),

    #[error("registry lookup failed: {0}")]
    Lookup(String),
}

/// Directory mapping logical service names to live instances
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Pick the next available instance for `service`. Selection policy is the registry's.
    async fn next_instance(&self, service: &str) -> Result<Instance, RegistryError>;
}

#[derive(Debug, Clone)]
struct Member {
    instance: Instance,
    healthy: bool,
}

/// Instances registered under one service name
#[derive(Debug)]
struct ServiceMembers {
    members: RwLock<Vec<Member>>,
    round_robin_index: AtomicUsize,
}

impl ServiceMembers {
    fn new() -> Self {
        Self {
            members: RwLock::new(Vec::new()),
            round_robin_index: AtomicUsize::new(0),
        }
    }

    fn next_healthy(&self) -> Option<Instance> {
        let members = self.members.read();
        let healthy: Vec<_> = members.iter().filter(|m| m.healthy).collect();
        if healthy.is_empty() {
            return None;
        }
        let idx = self.round_robin_index.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[idx].instance.clone())
    }
}

/// In-process registry with round-robin selection over healthy instances
#[derive(Debug, Default)]
pub struct StaticRegistry {
    services: DashMap<String, Arc<ServiceMembers>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the `[services]` configuration table
    pub fn from_config(services: &HashMap<String, ServiceConfig>) -> Self {
        let registry = Self::new();
        for (name, service) in services {
            for instance in &service.instances {
                registry.add_instance(name, instance.to_instance());
            }
        }
        registry
    }

    fn members(&self, service: &str) -> Arc<ServiceMembers> {
        Arc::clone(
            self.services
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(ServiceMembers::new()))
                .value(),
        )
    }

    /// Register an instance; re-registering the same authority is a no-op
    pub fn add_instance(&self, service: &str, instance: Instance) {
        let members = self.members(service);
        let mut list = members.members.write();
        if list.iter().any(|m| m.instance.authority() == instance.authority()) {
            return;
        }
        info!(
            service,
            instance = %instance.authority(),
            total_instances = list.len() + 1,
            "Registered instance"
        );
        list.push(Member {
            instance,
            healthy: true,
        });
    }

    pub fn remove_instance(&self, service: &str, authority: &str) {
        if let Some(members) = self.services.get(service) {
            let mut list = members.members.write();
            if let Some(pos) = list.iter().position(|m| m.instance.authority() == authority) {
                list.remove(pos);
                info!(
                    service,
                    instance = authority,
                    total_instances = list.len(),
                    "Deregistered instance"
                );
            }
        }
    }

    pub fn set_instance_health(&self, service: &str, authority: &str, healthy: bool) {
        if let Some(members) = self.services.get(service) {
            let mut list = members.members.write();
            if let Some(member) = list.iter_mut().find(|m| m.instance.authority() == authority) {
                member.healthy = healthy;
                debug!(service, instance = authority, healthy, "Instance health updated");
            }
        }
    }

    pub fn instance_count(&self, service: &str) -> usize {
        self.services
            .get(service)
            .map(|m| m.members.read().len())
            .unwrap_or(0)
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn next_instance(&self, service: &str) -> Result<Instance, RegistryError> {
        let members = self
            .services
            .get(service)
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| RegistryError::UnknownService(service.to_string()))?;

        members
            .next_healthy()
            .ok_or_else(|| RegistryError::NoHealthyInstance(service.to_string()))
    }
}
