//! Turns a service name into one backend instance, or `NotFound`

use std::sync::Arc;
use tracing::{debug, warn};

use crate::registry::{Instance, ServiceRegistry};

/// Outcome of a single resolution attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(Instance),
    NotFound,
}

/// Wraps the registry so that no registry-specific failure escapes a session
#[derive(Clone)]
pub struct BackendResolver {
    registry: Arc<dyn ServiceRegistry>,
}

impl BackendResolver {
    pub fn new(registry: Arc<dyn ServiceRegistry>) -> Self {
        Self { registry }
    }

    pub async fn resolve(&self, service: Option<&str>) -> Resolution {
        let service = match service.map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => {
                warn!("Rejecting request with empty service name");
                return Resolution::NotFound;
            }
        };

        match self.registry.next_instance(service).await {
            Ok(instance) => {
                debug!(service, instance = %instance.authority(), "Resolved backend instance");
                Resolution::Found(instance)
            }
            Err(e) => {
                warn!(service, error = %e, "Service resolution failed");
                Resolution::NotFound
            }
        }
    }
}
