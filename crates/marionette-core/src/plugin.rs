//! Process-wide action plugin registry.
//!
//! Plugins are registered once, in a fixed order, when the registry is
//! first touched; after that the table is immutable and lookups are
//! lock-free. Registering the same `(module, method)` twice is a
//! programming error and panics at startup.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use marionette_proto::Value;

use crate::error::Result;
use crate::fsm::Fsm;

/// An action handler dispatched by the machine.
///
/// `Ok(true)` means the action matched and the transition succeeds,
/// `Ok(false)` means it did not match and the next candidate is tried.
/// Errors abort the current cycle unless the engine recovers them.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Evaluates the action against the machine with the document-supplied
    /// arguments.
    async fn eval(&self, fsm: &mut Fsm, args: &[Value]) -> Result<bool>;
}

/// Immutable lookup table from `(module, method)` to handler.
///
/// The handful of built-ins makes a scan cheaper than hashing, and keeps
/// lookup allocation-free.
pub struct PluginRegistry {
    plugins: Vec<(&'static str, &'static str, Arc<dyn Plugin>)>,
}

impl PluginRegistry {
    fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    pub(crate) fn register(
        &mut self,
        module: &'static str,
        method: &'static str,
        plugin: Arc<dyn Plugin>,
    ) {
        assert!(
            self.find(module, method).is_none(),
            "duplicate plugin registration: {module}.{method}"
        );
        self.plugins.push((module, method, plugin));
    }

    /// Looks up the handler for `module.method`.
    #[must_use]
    pub fn find(&self, module: &str, method: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .iter()
            .find(|(m, f, _)| *m == module && *f == method)
            .map(|(_, _, plugin)| Arc::clone(plugin))
    }
}

/// Returns the process-wide registry, populating the built-ins on first
/// use.
pub fn registry() -> &'static PluginRegistry {
    static REGISTRY: OnceLock<PluginRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut registry = PluginRegistry::new();
        crate::plugins::register_builtins(&mut registry);
        registry
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl Plugin for Nop {
        async fn eval(&self, _fsm: &mut Fsm, _args: &[Value]) -> Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn builtins_are_registered() {
        for (module, method) in [
            ("fte", "send"),
            ("fte", "send_async"),
            ("fte", "recv"),
            ("fte", "recv_async"),
            ("io", "puts"),
            ("io", "gets"),
        ] {
            assert!(registry().find(module, method).is_some(), "missing {module}.{method}");
        }
        assert!(registry().find("tg", "send").is_none());
    }

    #[test]
    #[should_panic(expected = "duplicate plugin registration")]
    fn duplicate_registration_panics() {
        let mut registry = PluginRegistry::new();
        registry.register("io", "puts", Arc::new(Nop));
        registry.register("io", "puts", Arc::new(Nop));
    }
}
