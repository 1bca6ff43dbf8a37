//! In-memory provider used by tests.
//!
//! Resources live in a shared map. Deleting a resource whose outputs are
//! still used by another live resource fails with `DependentsExist`, like a
//! real control plane would.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ProviderError;
use crate::model::{ResolvedAttributes, ResourceKind};

use super::adapter::{
    diff_attributes, AttributeChange, CreateOutcome, Outputs, ProviderAdapter, ProviderResult,
};
use super::kinds::KindProfile;
use super::registry::ProviderRegistry;

/// Provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Create,
    Read,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct LiveResource {
    pub kind: ResourceKind,
    pub attributes: ResolvedAttributes,
    pub outputs: Outputs,
}

#[derive(Debug)]
struct Failure {
    error: ProviderError,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct CloudState {
    next_id: usize,
    resources: BTreeMap<String, LiveResource>,
    log: Vec<String>,
    failures: HashMap<(ResourceKind, Call), Failure>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Shared fake cloud.
#[derive(Debug, Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
    delay: Mutex<Duration>,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry with a fake adapter for every kind.
    pub fn registry(self: &Arc<Self>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for kind in ResourceKind::ALL {
            registry.register(Arc::new(FakeAdapter {
                profile: KindProfile::of(kind),
                cloud: Arc::clone(self),
            }));
        }
        registry
    }

    /// Fails `call` on `kind` for the next `times` calls (`None`: forever).
    pub fn fail(&self, kind: ResourceKind, call: Call, error: ProviderError, times: Option<usize>) {
        self.state.lock().unwrap().failures.insert(
            (kind, call),
            Failure {
                error,
                remaining: times,
            },
        );
    }

    /// Makes every mutating call take this long.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    /// Number of mutating calls seen so far.
    pub fn mutations(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|l| !l.starts_with("read"))
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    pub fn live(&self) -> BTreeMap<String, LiveResource> {
        self.state.lock().unwrap().resources.clone()
    }

    pub fn live_of_kind(&self, kind: ResourceKind) -> Vec<String> {
        self.live()
            .into_iter()
            .filter(|(_, r)| r.kind == kind)
            .map(|(id, _)| id)
            .collect()
    }

    /// Changes a live attribute behind the engine's back.
    pub fn tamper(&self, physical_id: &str, name: &str, value: Value) {
        if let Some(r) = self.state.lock().unwrap().resources.get_mut(physical_id) {
            r.attributes.insert(name.to_string(), value);
        }
    }

    fn take_failure(&self, kind: ResourceKind, call: Call) -> ProviderResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(failure) = state.failures.get_mut(&(kind, call)) else {
            return Ok(());
        };
        let error = failure.error.clone();
        match failure.remaining {
            None => Err(error),
            Some(0) => {
                state.failures.remove(&(kind, call));
                Ok(())
            }
            Some(n) => {
                failure.remaining = Some(n - 1);
                Err(error)
            }
        }
    }

    async fn enter(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn leave(&self) {
        self.state.lock().unwrap().in_flight -= 1;
    }
}

fn contains_value(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|v| contains_value(v, needle)),
        Value::Object(entries) => entries.values().any(|v| contains_value(v, needle)),
        other => other == needle,
    }
}

/// Fake adapter for one kind.
#[derive(Debug)]
pub struct FakeAdapter {
    profile: KindProfile,
    cloud: Arc<FakeCloud>,
}

impl FakeAdapter {
    async fn guarded<T>(&self, call: Call, f: impl FnOnce(&mut CloudState) -> ProviderResult<T>) -> ProviderResult<T> {
        self.cloud.enter().await;
        let result = self
            .cloud
            .take_failure(self.profile.kind, call)
            .and_then(|()| f(&mut self.cloud.state.lock().unwrap()));
        self.cloud.leave();
        result
    }

    fn outputs(&self, physical_id: &str) -> Outputs {
        self.profile
            .outputs
            .iter()
            .map(|name| {
                let value = if *name == "id" {
                    Value::from(physical_id)
                } else {
                    Value::from(format!("{physical_id}.{name}"))
                };
                ((*name).to_string(), value)
            })
            .collect()
    }
}

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    fn kind(&self) -> ResourceKind {
        self.profile.kind
    }

    fn updatable_attributes(&self) -> Vec<String> {
        self.profile.updatable.iter().map(ToString::to_string).collect()
    }

    fn output_attributes(&self) -> Vec<String> {
        self.profile.outputs.iter().map(ToString::to_string).collect()
    }

    async fn create(&self, attributes: &ResolvedAttributes) -> ProviderResult<CreateOutcome> {
        let kind = self.profile.kind;
        self.guarded(Call::Create, |state| {
            state.next_id += 1;
            let physical_id = format!("{kind}-{}", state.next_id);
            let outputs = self.outputs(&physical_id);
            state.resources.insert(
                physical_id.clone(),
                LiveResource {
                    kind,
                    attributes: attributes.clone(),
                    outputs: outputs.clone(),
                },
            );
            state.log.push(format!("create {physical_id}"));
            Ok(CreateOutcome { physical_id, outputs })
        })
        .await
    }

    async fn read(&self, physical_id: &str) -> ProviderResult<ResolvedAttributes> {
        self.cloud.take_failure(self.profile.kind, Call::Read)?;
        let mut state = self.cloud.state.lock().unwrap();
        state.log.push(format!("read {physical_id}"));
        state
            .resources
            .get(physical_id)
            .map(|r| r.attributes.clone())
            .ok_or_else(|| ProviderError::NotFound {
                physical_id: physical_id.to_string(),
            })
    }

    async fn update(&self, physical_id: &str, delta: &ResolvedAttributes) -> ProviderResult<Outputs> {
        let unsupported: Vec<String> = delta
            .keys()
            .filter(|k| !self.profile.updatable.contains(&k.as_str()))
            .cloned()
            .collect();
        if !unsupported.is_empty() {
            return Err(ProviderError::Unsupported {
                attributes: unsupported,
            });
        }

        self.guarded(Call::Update, |state| {
            let resource = state
                .resources
                .get_mut(physical_id)
                .ok_or_else(|| ProviderError::NotFound {
                    physical_id: physical_id.to_string(),
                })?;
            for (name, value) in delta {
                if value.is_null() {
                    resource.attributes.remove(name);
                } else {
                    resource.attributes.insert(name.clone(), value.clone());
                }
            }
            let outputs = resource.outputs.clone();
            state.log.push(format!("update {physical_id}"));
            Ok(outputs)
        })
        .await
    }

    async fn delete(&self, physical_id: &str) -> ProviderResult<()> {
        self.guarded(Call::Delete, |state| {
            let Some(resource) = state.resources.get(physical_id) else {
                return Err(ProviderError::NotFound {
                    physical_id: physical_id.to_string(),
                });
            };
            let holder = state.resources.iter().find(|(id, other)| {
                id.as_str() != physical_id
                    && resource.outputs.values().any(|out| {
                        other.attributes.values().any(|attr| contains_value(attr, out))
                    })
            });
            if let Some((holder, _)) = holder {
                return Err(ProviderError::DependentsExist {
                    physical_id: physical_id.to_string(),
                    message: format!("still used by {holder}"),
                });
            }
            state.resources.remove(physical_id);
            state.log.push(format!("delete {physical_id}"));
            Ok(())
        })
        .await
    }

    async fn compute_drift(
        &self,
        physical_id: &str,
        recorded: &ResolvedAttributes,
    ) -> ProviderResult<Vec<AttributeChange>> {
        let live = self.read(physical_id).await?;
        Ok(diff_attributes(recorded, &live))
    }
}
