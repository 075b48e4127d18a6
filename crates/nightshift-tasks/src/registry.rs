use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};

use serde::Serialize;
use tracing::{debug, warn};

use crate::provider::TaskProvider;
use crate::shape::Shape;

type ProviderFactory = Box<dyn Fn() -> Arc<dyn TaskProvider> + Send + Sync>;

/// A registered provider that has not necessarily been built yet.
struct Entry {
    task_type_id: String,
    factory: ProviderFactory,
    instance: OnceLock<Arc<dyn TaskProvider>>,
}

impl Entry {
    fn resolve(&self) -> Arc<dyn TaskProvider> {
        self.instance
            .get_or_init(|| {
                let provider = (self.factory)();
                if provider.task_type_id() != self.task_type_id {
                    warn!(
                        registered = %self.task_type_id,
                        advertised = %provider.task_type_id(),
                        provider = %provider.id(),
                        "provider advertises a different task type than it was registered for"
                    );
                }
                debug!(provider = %provider.id(), task_type = %self.task_type_id, "provider instantiated");
                provider
            })
            .clone()
    }
}

/// Input and output shapes of a task type, as offered by its provider.
#[derive(Debug, Clone, Serialize)]
pub struct TaskTypeInfo {
    pub provider_id: String,
    pub input_shape: Shape,
    pub optional_input_shape: Shape,
    pub output_shape: Shape,
    pub optional_output_shape: Shape,
}

/// Catalogue of task providers, registered as factories and built on first use.
///
/// When several providers serve the same task type, the first registered one
/// is used.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: RwLock<Vec<Arc<Entry>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider factory for `task_type_id`. The factory runs at
    /// most once, the first time the provider is needed.
    pub fn register<F>(&self, task_type_id: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn TaskProvider> + Send + Sync + 'static,
    {
        let task_type_id = task_type_id.into();
        debug!(task_type = %task_type_id, "provider factory registered");
        if let Ok(mut entries) = self.entries.write() {
            entries.push(Arc::new(Entry {
                task_type_id,
                factory: Box::new(factory),
                instance: OnceLock::new(),
            }));
        }
    }

    pub fn has_providers(&self) -> bool {
        self.entries.read().map(|e| !e.is_empty()).unwrap_or(false)
    }

    /// Task types with at least one provider, without building any provider.
    pub fn task_type_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .map(|entries| entries.iter().map(|e| e.task_type_id.clone()).collect())
            .unwrap_or_default();
        ids.sort();
        ids.dedup();
        ids
    }

    /// The provider for `task_type_id`, built now if this is the first ask.
    pub fn get(&self, task_type_id: &str) -> Option<Arc<dyn TaskProvider>> {
        // Clone the entry out so the factory never runs under the registry lock.
        let entry = self
            .entries
            .read()
            .ok()?
            .iter()
            .find(|e| e.task_type_id == task_type_id)
            .cloned()?;
        Some(entry.resolve())
    }

    /// Every registered provider, building any not yet built.
    pub fn providers(&self) -> Vec<Arc<dyn TaskProvider>> {
        let entries: Vec<Arc<Entry>> = self
            .entries
            .read()
            .map(|e| e.clone())
            .unwrap_or_default();
        entries.iter().map(|e| e.resolve()).collect()
    }

    /// Task type id → shapes of the provider that serves it.
    pub fn available_task_types(&self) -> BTreeMap<String, TaskTypeInfo> {
        let mut types = BTreeMap::new();
        for task_type_id in self.task_type_ids() {
            if let Some(provider) = self.get(&task_type_id) {
                types.insert(
                    task_type_id,
                    TaskTypeInfo {
                        provider_id: provider.id().to_string(),
                        input_shape: provider.input_shape(),
                        optional_input_shape: provider.optional_input_shape(),
                        output_shape: provider.output_shape(),
                        optional_output_shape: provider.optional_output_shape(),
                    },
                );
            }
        }
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderCapabilities;
    use crate::shape::{ShapeDescriptor, ShapeKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        id: &'static str,
        task_type: &'static str,
    }

    impl TaskProvider for Echo {
        fn id(&self) -> &str {
            self.id
        }
        fn task_type_id(&self) -> &str {
            self.task_type
        }
        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities::external()
        }
        fn input_shape(&self) -> Shape {
            let mut shape = Shape::new();
            shape.insert(
                "input".into(),
                ShapeDescriptor::new("Input", "Text to echo", ShapeKind::Text),
            );
            shape
        }
        fn output_shape(&self) -> Shape {
            self.input_shape()
        }
    }

    fn counting_factory(
        built: &Arc<AtomicUsize>,
        id: &'static str,
        task_type: &'static str,
    ) -> impl Fn() -> Arc<dyn TaskProvider> + Send + Sync + 'static {
        let built = built.clone();
        move || {
            built.fetch_add(1, Ordering::SeqCst);
            Arc::new(Echo { id, task_type }) as Arc<dyn TaskProvider>
        }
    }

    #[test]
    fn factory_runs_only_on_first_lookup() {
        let built = Arc::new(AtomicUsize::new(0));
        let registry = ProviderRegistry::new();
        registry.register("core:echo", counting_factory(&built, "echo", "core:echo"));

        assert!(registry.has_providers());
        assert_eq!(registry.task_type_ids(), vec!["core:echo".to_string()]);
        assert_eq!(built.load(Ordering::SeqCst), 0);

        let first = registry.get("core:echo").unwrap();
        let second = registry.get("core:echo").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_task_type_builds_nothing() {
        let built = Arc::new(AtomicUsize::new(0));
        let registry = ProviderRegistry::new();
        registry.register("core:echo", counting_factory(&built, "echo", "core:echo"));
        assert!(registry.get("core:other").is_none());
        assert_eq!(built.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn first_registration_wins() {
        let built = Arc::new(AtomicUsize::new(0));
        let registry = ProviderRegistry::new();
        registry.register("core:echo", counting_factory(&built, "first", "core:echo"));
        registry.register("core:echo", counting_factory(&built, "second", "core:echo"));
        assert_eq!(registry.get("core:echo").unwrap().id(), "first");
        assert_eq!(registry.task_type_ids().len(), 1);
    }

    #[test]
    fn available_task_types_lists_shapes() {
        let registry = ProviderRegistry::new();
        assert!(!registry.has_providers());
        registry.register("core:echo", || {
            Arc::new(Echo {
                id: "echo",
                task_type: "core:echo",
            }) as Arc<dyn TaskProvider>
        });
        let types = registry.available_task_types();
        let info = &types["core:echo"];
        assert_eq!(info.provider_id, "echo");
        assert_eq!(info.input_shape["input"].kind, ShapeKind::Text);
        assert!(info.optional_input_shape.is_empty());
        assert_eq!(registry.providers().len(), 1);
    }
}
