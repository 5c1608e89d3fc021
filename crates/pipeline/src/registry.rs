//! Plugin lookup by `how`.

use crate::error::{Error, Result};
use crate::phase::PhaseData;
use std::collections::BTreeMap;
use std::sync::Arc;

type Factory<P> = Box<dyn Fn(PhaseData) -> Result<Arc<P>> + Send + Sync>;

/// Factories of one step's plugins, keyed by the `how` they implement.
pub struct PluginRegistry<P: ?Sized> {
    step: String,
    factories: BTreeMap<String, Factory<P>>,
}

impl<P: ?Sized> PluginRegistry<P> {
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            factories: BTreeMap::new(),
        }
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn register<F>(&mut self, how: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(PhaseData) -> Result<Arc<P>> + Send + Sync + 'static,
    {
        self.factories.insert(how.into(), Box::new(factory));
        self
    }

    pub fn contains(&self, how: &str) -> bool {
        self.factories.contains_key(how)
    }

    /// Registered `how` keys, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn create(&self, data: PhaseData) -> Result<Arc<P>> {
        match self.factories.get(&data.how) {
            Some(factory) => factory(data),
            None => Err(Error::Specification(format!(
                "unsupported {} method '{}', expected one of: {}",
                self.step,
                data.how,
                self.names().join(", ")
            ))),
        }
    }
}

impl<P: ?Sized> std::fmt::Debug for PluginRegistry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("step", &self.step)
            .field("plugins", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;

    struct Shell(PhaseData);

    impl Phase for Shell {
        fn data(&self) -> &PhaseData {
            &self.0
        }
    }

    fn registry() -> PluginRegistry<dyn Phase> {
        let mut registry: PluginRegistry<dyn Phase> = PluginRegistry::new("prepare");
        registry.register("shell", |data| {
            let plugin: Arc<dyn Phase> = Arc::new(Shell(data));
            Ok(plugin)
        });
        registry
    }

    #[test]
    fn test_create_known_plugin() {
        let registry = registry();
        let plugin = registry.create(PhaseData::new("setup", "shell")).unwrap();

        assert_eq!(plugin.name(), "setup");
        assert_eq!(plugin.how(), "shell");
        assert!(registry.contains("shell"));
    }

    #[test]
    fn test_unknown_plugin_is_a_specification_error() {
        let err = registry()
            .create(PhaseData::new("setup", "ansible"))
            .err()
            .unwrap();

        assert!(matches!(err, Error::Specification(_)));
        assert_eq!(
            err.to_string(),
            "invalid plan: unsupported prepare method 'ansible', expected one of: shell"
        );
    }
}
