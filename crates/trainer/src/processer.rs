//! Data processer registry
//!
//! Maps the `dataprocesser.type` config key to a factory. The key is checked
//! when the trainer is built, so a typo fails before any worker coordinates.

use runtime_core::{DataProcesserConfig, Error, Result};
use std::collections::BTreeMap;

use crate::collaborators::ProcesserFactory;

pub struct DataProcesserRegistry<P> {
    factories: BTreeMap<String, ProcesserFactory<P>>,
}

impl<P> Default for DataProcesserRegistry<P> {
    fn default() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }
}

impl<P> DataProcesserRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous one
    pub fn register(mut self, name: impl Into<String>, factory: ProcesserFactory<P>) -> Self {
        self.factories.insert(name.into(), factory);
        self
    }

    /// Registered names, sorted
    pub fn known(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Look up the factory for a config section
    pub fn resolve(&self, config: &DataProcesserConfig) -> Result<ProcesserFactory<P>> {
        self.factories
            .get(&config.kind)
            .copied()
            .ok_or_else(|| Error::UnknownDataProcesser {
                name: config.kind.clone(),
                known: self.known(),
            })
    }
}
