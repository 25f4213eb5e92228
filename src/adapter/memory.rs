//! In-process provider for development and tests.
//!
//! Holds resource state in memory and supports fault injection so partial
//! failures (timeouts, rejected applies, applies that half-land) can be
//! reproduced deterministically.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{AdapterError, ConfigMap, ResourceClient};
use crate::collector::normalize::remove_path;

#[derive(Default)]
struct Faults {
    get_failures: HashMap<String, VecDeque<AdapterError>>,
    apply_failures: HashMap<String, AdapterError>,
    fail_after_apply: HashSet<String>,
    drop_on_apply: HashMap<String, Vec<String>>,
    unauthorized: bool,
    get_delay: Option<Duration>,
}

#[derive(Default)]
struct Inner {
    resources: HashMap<String, ConfigMap>,
    faults: Faults,
    get_calls: HashMap<String, usize>,
    apply_calls: HashMap<String, usize>,
}

/// Memory-backed [`ResourceClient`]
#[derive(Default)]
pub struct InMemoryResourceClient {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for InMemoryResourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryResourceClient").finish_non_exhaustive()
    }
}

impl InMemoryResourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Builder-style seed
    pub fn with_resource(self, resource_id: &str, config: Value) -> Self {
        self.set_state(resource_id, config);
        self
    }

    /// Overwrite live state out of band (simulates manual drift). Non-object
    /// values are ignored.
    pub fn set_state(&self, resource_id: &str, config: Value) {
        if let Value::Object(map) = config {
            self.lock().resources.insert(resource_id.to_string(), map);
        }
    }

    /// Mutate live state out of band
    pub fn update_state(&self, resource_id: &str, update: impl FnOnce(&mut ConfigMap)) {
        let mut inner = self.lock();
        if let Some(config) = inner.resources.get_mut(resource_id) {
            update(config);
        }
    }

    pub fn state(&self, resource_id: &str) -> Option<ConfigMap> {
        self.lock().resources.get(resource_id).cloned()
    }

    pub fn remove(&self, resource_id: &str) {
        self.lock().resources.remove(resource_id);
    }

    /// Fail the next `count` `get_state` calls for `resource_id`
    pub fn fail_next_gets(&self, resource_id: &str, count: usize, error: AdapterError) {
        let mut inner = self.lock();
        let queue = inner.faults.get_failures.entry(resource_id.to_string()).or_default();
        queue.extend(std::iter::repeat(error).take(count));
    }

    /// Reject every `apply_state` for `resource_id` until cleared
    pub fn fail_applies(&self, resource_id: &str, error: AdapterError) {
        self.lock().faults.apply_failures.insert(resource_id.to_string(), error);
    }

    /// Land the next apply, then report it as unavailable
    pub fn fail_after_apply(&self, resource_id: &str) {
        self.lock().faults.fail_after_apply.insert(resource_id.to_string());
    }

    /// Silently drop a dotted field from every applied configuration
    pub fn drop_field_on_apply(&self, resource_id: &str, path: &str) {
        self.lock()
            .faults
            .drop_on_apply
            .entry(resource_id.to_string())
            .or_default()
            .push(path.to_string());
    }

    /// Reject all calls as unauthorized
    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.lock().faults.unauthorized = unauthorized;
    }

    /// Delay every `get_state` call
    pub fn set_get_delay(&self, delay: Option<Duration>) {
        self.lock().faults.get_delay = delay;
    }

    pub fn clear_faults(&self) {
        self.lock().faults = Faults::default();
    }

    pub fn get_calls(&self, resource_id: &str) -> usize {
        self.lock().get_calls.get(resource_id).copied().unwrap_or(0)
    }

    pub fn apply_calls(&self, resource_id: &str) -> usize {
        self.lock().apply_calls.get(resource_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ResourceClient for InMemoryResourceClient {
    async fn get_state(&self, resource_id: &str) -> Result<ConfigMap, AdapterError> {
        let delay = {
            let mut inner = self.lock();
            *inner.get_calls.entry(resource_id.to_string()).or_default() += 1;
            inner.faults.get_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        if inner.faults.unauthorized {
            return Err(AdapterError::unauthorized("token rejected"));
        }
        if let Some(error) =
            inner.faults.get_failures.get_mut(resource_id).and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }
        inner.resources.get(resource_id).cloned().ok_or(AdapterError::NotFound)
    }

    async fn apply_state(&self, resource_id: &str, config: &ConfigMap) -> Result<(), AdapterError> {
        let mut inner = self.lock();
        *inner.apply_calls.entry(resource_id.to_string()).or_default() += 1;

        if inner.faults.unauthorized {
            return Err(AdapterError::unauthorized("token rejected"));
        }
        if let Some(error) = inner.faults.apply_failures.get(resource_id) {
            return Err(error.clone());
        }

        let mut applied = config.clone();
        if let Some(paths) = inner.faults.drop_on_apply.get(resource_id) {
            for path in paths {
                remove_path(&mut applied, path);
            }
        }
        inner.resources.insert(resource_id.to_string(), applied);

        if inner.faults.fail_after_apply.remove(resource_id) {
            return Err(AdapterError::unavailable("connection reset after write"));
        }
        Ok(())
    }
}
