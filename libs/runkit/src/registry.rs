//! Static catalog of backends: id → factory and display metadata.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contracts::BackendRef;

/// Who may use a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessTier {
    #[default]
    Free,
    Restricted,
}

/// Advisory hint: materialize during warm-up (`Eager`) or on first selection (`Lazy`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadHint {
    Eager,
    #[default]
    Lazy,
}

pub type BackendFactory = Arc<dyn Fn() -> BackendRef + Send + Sync>;

/// Registry entry. The factory has no side effects until invoked.
#[derive(Clone)]
pub struct BackendDescriptor {
    pub id: String,
    pub display_name: String,
    pub access_tier: AccessTier,
    pub load_hint: LoadHint,
    factory: BackendFactory,
}

impl BackendDescriptor {
    pub fn new<F>(id: impl Into<String>, display_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> BackendRef + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            access_tier: AccessTier::default(),
            load_hint: LoadHint::default(),
            factory: Arc::new(factory),
        }
    }

    pub fn with_access_tier(mut self, tier: AccessTier) -> Self {
        self.access_tier = tier;
        self
    }

    pub fn with_load_hint(mut self, hint: LoadHint) -> Self {
        self.load_hint = hint;
        self
    }

    /// Invoke the factory. The backend cache is the only caller.
    pub(crate) fn instantiate(&self) -> BackendRef {
        (self.factory)()
    }

    pub fn info(&self) -> BackendInfo {
        BackendInfo {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            access_tier: self.access_tier,
            load_hint: self.load_hint,
        }
    }
}

impl std::fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("access_tier", &self.access_tier)
            .field("load_hint", &self.load_hint)
            .finish()
    }
}

/// Public listing view of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendInfo {
    pub id: String,
    pub display_name: String,
    pub access_tier: AccessTier,
    pub load_hint: LoadHint,
}

/// Config-file adjustment of a registered backend's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogOverride {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub access_tier: Option<AccessTier>,
    #[serde(default)]
    pub load_hint: Option<LoadHint>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl CatalogOverride {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            access_tier: None,
            load_hint: None,
            enabled: true,
        }
    }
}

/// The function type backend crates submit via `inventory::submit!`.
pub struct Registrator(pub fn(&mut RegistryBuilder));

inventory::collect!(Registrator);

/// Immutable backend catalog, ordered by id.
pub struct BackendRegistry {
    entries: Vec<BackendDescriptor>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.entries.iter().map(|e| e.id.as_str()).collect();
        f.debug_struct("BackendRegistry")
            .field("backends", &ids)
            .finish()
    }
}

impl BackendRegistry {
    /// Collect every backend submitted through `inventory` and build.
    pub fn discover() -> Result<Self, RegistryError> {
        Self::discover_with_overrides(Vec::new())
    }

    pub fn discover_with_overrides(
        overrides: impl IntoIterator<Item = CatalogOverride>,
    ) -> Result<Self, RegistryError> {
        let mut b = RegistryBuilder::discovered();
        b.with_overrides(overrides);
        b.build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn resolve(&self, id: &str) -> Result<&BackendDescriptor, RegistryError> {
        self.index
            .get(id)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| RegistryError::UnknownBackend(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn descriptors(&self) -> &[BackendDescriptor] {
        &self.entries
    }

    pub fn list(&self) -> Vec<BackendInfo> {
        self.entries.iter().map(BackendDescriptor::info).collect()
    }

    pub fn eager_ids(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.load_hint == LoadHint::Eager)
            .map(|e| e.id.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collects registrations; uniqueness is enforced at build time.
#[derive(Default)]
pub struct RegistryBuilder {
    descriptors: HashMap<String, BackendDescriptor>,
    overrides: Vec<CatalogOverride>,
    errors: Vec<String>,
}

impl RegistryBuilder {
    /// Builder pre-populated with every `inventory` registration, open for more.
    pub fn discovered() -> Self {
        let mut b = RegistryBuilder::default();
        for r in ::inventory::iter::<Registrator> {
            r.0(&mut b);
        }
        b
    }

    pub fn register(&mut self, descriptor: BackendDescriptor) -> &mut Self {
        if descriptor.id.trim().is_empty() {
            self.errors
                .push(format!("Backend '{}' has an empty id", descriptor.display_name));
        } else if self.descriptors.contains_key(&descriptor.id) {
            self.errors
                .push(format!("Backend '{}' is already registered", descriptor.id));
        } else {
            self.descriptors.insert(descriptor.id.clone(), descriptor);
        }
        self
    }

    pub fn with_overrides(
        &mut self,
        overrides: impl IntoIterator<Item = CatalogOverride>,
    ) -> &mut Self {
        self.overrides.extend(overrides);
        self
    }

    pub fn build(mut self) -> Result<BackendRegistry, RegistryError> {
        for ov in std::mem::take(&mut self.overrides) {
            let Some(d) = self.descriptors.get_mut(&ov.id) else {
                self.errors.push(format!(
                    "Catalog override references unknown backend '{}'",
                    ov.id
                ));
                continue;
            };
            if let Some(name) = ov.display_name {
                d.display_name = name;
            }
            if let Some(tier) = ov.access_tier {
                d.access_tier = tier;
            }
            if let Some(hint) = ov.load_hint {
                d.load_hint = hint;
            }
            if !ov.enabled {
                tracing::debug!(backend = %ov.id, "backend disabled by catalog override");
                self.descriptors.remove(&ov.id);
            }
        }

        if !self.errors.is_empty() {
            return Err(RegistryError::InvalidRegistryConfiguration {
                errors: self.errors,
            });
        }

        let mut entries: Vec<BackendDescriptor> = self.descriptors.into_values().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();

        tracing::info!(
            backends = ?entries.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            "Backend catalog resolved"
        );

        Ok(BackendRegistry { entries, index })
    }
}

/// Structured errors for the backend registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),
    #[error("invalid backend registry configuration:\n{errors:#?}")]
    InvalidRegistryConfiguration { errors: Vec<String> },
}
