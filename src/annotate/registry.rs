use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backends::{MotionAnnotator, PassthroughAnnotator};
use super::{Annotator, AnnotatorFactory};

/// Registry of named annotator factories.
///
/// Factories rather than instances are stored because every camera worker
/// gets its own annotator.
#[derive(Clone)]
pub struct AnnotatorRegistry {
    factories: HashMap<String, AnnotatorFactory>,
    default_name: Option<String>,
}

impl AnnotatorRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with the built-in annotators; `motion` is the default.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("motion", MotionAnnotator::new);
        registry.register("passthrough", || PassthroughAnnotator);
        registry
    }

    /// Register a factory. The first registered factory becomes the default.
    pub fn register<A, F>(&mut self, name: &str, make: F)
    where
        A: Annotator + 'static,
        F: Fn() -> A + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        let factory: AnnotatorFactory = Arc::new(move || Box::new(make()) as Box<dyn Annotator>);
        self.factories.insert(name.to_string(), factory);
    }

    /// Set default factory by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("annotator '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Get a factory by name.
    pub fn factory(&self, name: &str) -> Result<AnnotatorFactory> {
        self.factories.get(name).cloned().ok_or_else(|| {
            anyhow!(
                "annotator '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            )
        })
    }

    /// Get the default factory.
    pub fn default_factory(&self) -> Result<AnnotatorFactory> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no annotators registered"))?;
        self.factory(name)
    }

    /// Build a fresh instance by name.
    pub fn build(&self, name: &str) -> Result<Box<dyn Annotator>> {
        Ok((self.factory(name)?)())
    }

    /// List registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for AnnotatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
