use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use switchyard_core::{Component, ConfigurationError, Endpoint, EndpointUri};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// EndpointRegistry
// ---------------------------------------------------------------------------

/// Registry of endpoint factories keyed by URI scheme.
///
/// Provides two lookup mechanisms:
/// - **By scheme** (`get`): the component's `scheme()` string
/// - **By type** (`get_typed::<T>`): the concrete component type
///
/// Components are started in registration order and stopped in reverse order.
pub struct EndpointRegistry {
    /// Scheme-based lookup: scheme -> Arc<dyn Component>.
    by_scheme: DashMap<String, Arc<dyn Component>>,
    /// Type-based lookup: `TypeId` -> `Arc<dyn Any + Send + Sync>`.
    by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    /// Registration order for deterministic start/stop sequencing.
    start_order: RwLock<Vec<String>>,
}

impl EndpointRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_scheme: DashMap::new(),
            by_type: DashMap::new(),
            start_order: RwLock::new(Vec::new()),
        }
    }

    /// Registers a component under its scheme.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::DuplicateComponent` if the scheme is taken.
    pub fn register<T: Component + 'static>(&self, component: T) -> Result<Arc<T>, ConfigurationError> {
        let scheme = component.scheme().to_string();
        let arc = Arc::new(component);
        match self.by_scheme.entry(scheme.clone()) {
            Entry::Occupied(_) => return Err(ConfigurationError::DuplicateComponent { scheme }),
            Entry::Vacant(slot) => {
                slot.insert(arc.clone());
            }
        }
        self.by_type.insert(TypeId::of::<T>(), arc.clone());
        self.start_order.write().push(scheme.clone());
        debug!(scheme = %scheme, "component registered");
        Ok(arc)
    }

    /// Retrieve a component by scheme.
    #[must_use]
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn Component>> {
        self.by_scheme.get(scheme).map(|entry| entry.value().clone())
    }

    /// Retrieve a component by its concrete type.
    #[must_use]
    pub fn get_typed<T: Component + 'static>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    /// Registered schemes in registration order.
    #[must_use]
    pub fn schemes(&self) -> Vec<String> {
        self.start_order.read().clone()
    }

    /// Parses `uri` and asks the matching component for an endpoint.
    ///
    /// # Errors
    ///
    /// - `InvalidUri` if `uri` is malformed
    /// - `UnknownScheme` if no component handles its scheme
    /// - `UnknownOption` if it carries an option the component does not declare
    /// - whatever the component's `create_endpoint` reports
    pub fn resolve(&self, uri: &str) -> Result<Endpoint, ConfigurationError> {
        let parsed = EndpointUri::parse(uri)?;
        let component = self
            .get(parsed.scheme())
            .ok_or_else(|| ConfigurationError::UnknownScheme {
                scheme: parsed.scheme().to_string(),
            })?;

        let accepted = component.options();
        if let Some(option) = parsed.options().keys().find(|key| !accepted.iter().any(|a| a == key)) {
            return Err(ConfigurationError::UnknownOption {
                uri: uri.to_string(),
                option: option.to_string(),
            });
        }

        let endpoint = component.create_endpoint(&parsed)?;
        debug!(uri = %parsed, "endpoint resolved");
        Ok(endpoint)
    }

    /// Starts all components in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first component's `start()` failure; later components are
    /// not started.
    pub async fn start_all(&self) -> anyhow::Result<()> {
        let order = self.schemes();
        for scheme in &order {
            if let Some(component) = self.get(scheme) {
                component.start().await?;
                info!(scheme = %scheme, "component started");
            }
        }
        Ok(())
    }

    /// Stops all components in reverse registration order.
    ///
    /// # Errors
    ///
    /// Returns the first component's `stop()` failure.
    pub async fn stop_all(&self) -> anyhow::Result<()> {
        let order = self.schemes();
        for scheme in order.iter().rev() {
            if let Some(component) = self.get(scheme) {
                component.stop().await?;
                info!(scheme = %scheme, "component stopped");
            }
        }
        Ok(())
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
