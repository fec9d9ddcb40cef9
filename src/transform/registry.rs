//! Transform module registry.
//!
//! # Responsibilities
//! - Map module names to factories
//! - Instantiate enabled modules with their options at pipeline-build time
//! - List available modules and their descriptions
//!
//! The registry only answers "what can be built". Which modules are enabled
//! for a run is decided by whoever supplies the `PipelineConfig`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::StageConfig;
use crate::error::TransformError;
use crate::transform::{builtin, Transform};

/// Builds a stage from its options table.
pub type ModuleFactory =
    Arc<dyn Fn(&toml::Table) -> Result<Arc<dyn Transform>, TransformError> + Send + Sync>;

struct ModuleEntry {
    description: String,
    factory: ModuleFactory,
}

/// Named transform modules available to pipelines.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, ModuleEntry>,
}

impl ModuleRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in modules.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register (or replace) a module.
    pub fn register<F>(&mut self, name: impl Into<String>, description: impl Into<String>, factory: F)
    where
        F: Fn(&toml::Table) -> Result<Arc<dyn Transform>, TransformError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.modules.contains_key(&name) {
            tracing::debug!(module = %name, "Replacing registered transform module");
        }
        self.modules.insert(
            name,
            ModuleEntry {
                description: description.into(),
                factory: Arc::new(factory),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// `(name, description)` pairs, sorted by name.
    pub fn modules(&self) -> impl Iterator<Item = (&str, &str)> {
        self.modules
            .iter()
            .map(|(name, entry)| (name.as_str(), entry.description.as_str()))
    }

    /// Instantiate the module a stage names.
    pub fn build(&self, stage: &StageConfig) -> Result<Arc<dyn Transform>, TransformError> {
        let entry = self
            .modules
            .get(&stage.module)
            .ok_or_else(|| TransformError::UnknownModule(stage.module.clone()))?;
        let transform = (entry.factory)(&stage.options)?;
        tracing::debug!(module = %stage.module, description = transform.description(), "Loaded transform module");
        Ok(transform)
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.modules.keys()).finish()
    }
}
