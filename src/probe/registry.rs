use std::collections::HashMap;
use std::sync::Arc;

use super::{Probe, ProbeParams, RegexProbeFactory};
use crate::config::ConfigError;
use crate::context::SharedContext;

/// Creates unconfigured probes of one kind.
pub trait ProbeFactory: Send + Sync {
    fn kind(&self) -> &'static str;
    fn create(&self, name: &str, context: &SharedContext) -> Box<dyn Probe>;
}

/// Maps a task's `kind` to the factory that builds it.
#[derive(Default)]
pub struct ProbeRegistry {
    factories: HashMap<&'static str, Arc<dyn ProbeFactory>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every probe kind shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RegexProbeFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn ProbeFactory>) {
        if self.factories.insert(factory.kind(), factory).is_some() {
            log::warn!("probe factory replaced");
        }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Creates and configures the probe for task `name`.
    pub fn build(
        &self,
        name: &str,
        kind: &str,
        params: &ProbeParams,
        context: &SharedContext,
    ) -> Result<Box<dyn Probe>, ConfigError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| ConfigError::UnknownKind(kind.to_string()).for_task(name))?;

        let mut probe = factory.create(name, context);
        probe
            .configure(params)
            .map_err(|err| err.for_task(name))?;
        Ok(probe)
    }
}
