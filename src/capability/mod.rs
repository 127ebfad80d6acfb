mod engine;
mod tts;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::OnceCell;

pub use engine::HeadlessSpeechEngine;
pub use tts::{
    resolve_current_engine, EngineInfo, ProgressCallback, SpeechEngine, TtsCapability, Utterance,
    UtteranceState, VoiceInfo, TTS_CAPABILITY,
};

/// Static description of a capability: the names page code may call.
///
/// The same table drives host-side validation and the per-capability objects
/// generated into the page runtime, so an undeclared method never reaches a
/// provider.
#[derive(Debug, Serialize)]
pub struct CapabilityDescriptor {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub methods: &'static [&'static str],
    pub events: &'static [&'static str],
}

impl CapabilityDescriptor {
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.aliases.contains(&name)
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains(&method)
    }

    pub fn has_event(&self, event: &str) -> bool {
        self.events.contains(&event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// A request arrived without `plugin` or `method`.
    #[error("{0} not specified")]
    NotSpecified(&'static str),
    #[error("Unsupported plugin {0}")]
    UnknownCapability(String),
    #[error("Unsupported method {0}")]
    UnknownMethod(String),
    #[error("{0} unavailable")]
    Unavailable(String),
    /// Provider failure; the message is forwarded to the page verbatim.
    #[error("{0}")]
    Failed(String),
}

impl CapabilityError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Callback a provider fires for every event it emits: `(event_name, data)`.
pub type ProviderListener = Arc<dyn Fn(&str, &JsonValue) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

/// A host capability reachable from page code.
pub trait CapabilityProvider: Send + Sync {
    fn descriptor(&self) -> &'static CapabilityDescriptor;

    /// Run `method` synchronously with the page-supplied parameters.
    fn invoke(&self, method: &str, params: &JsonValue) -> Result<JsonValue, CapabilityError>;

    fn add_listener(&self, listener: ProviderListener) -> ListenerToken;

    fn remove_listener(&self, token: ListenerToken) -> bool;
}

/// Ordered listener list shared by providers.
#[derive(Clone, Default)]
pub struct ListenerSet {
    next: Arc<AtomicU64>,
    entries: Arc<Mutex<Vec<(ListenerToken, ProviderListener)>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: ProviderListener) -> ListenerToken {
        let token = ListenerToken(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        self.lock().push((token, listener));
        token
    }

    pub fn remove(&self, token: ListenerToken) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != token);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire every listener in registration order, outside the lock.
    pub fn emit(&self, event: &str, data: &JsonValue) {
        let snapshot: Vec<ProviderListener> = self
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event, data);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerToken, ProviderListener)>> {
        // A listener that panicked must not take the provider down with it.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub type ProviderLoader =
    Box<dyn Fn() -> Result<Arc<dyn CapabilityProvider>, CapabilityError> + Send + Sync>;

struct Binding {
    descriptor: &'static CapabilityDescriptor,
    loader: ProviderLoader,
    instance: OnceCell<Arc<dyn CapabilityProvider>>,
}

/// Capability name → provider table.
///
/// Providers load on first use. Concurrent first loads race on one cell:
/// the first successful load is kept and every racer gets it; a failed load
/// leaves the cell empty so a later call can retry.
#[derive(Default)]
pub struct CapabilityRegistry {
    bindings: Vec<Arc<Binding>>,
    by_name: HashMap<&'static str, usize>,
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider that is built lazily by `loader`.
    pub fn register<F>(mut self, descriptor: &'static CapabilityDescriptor, loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn CapabilityProvider>, CapabilityError> + Send + Sync + 'static,
    {
        let index = self.bindings.len();
        self.bindings.push(Arc::new(Binding {
            descriptor,
            loader: Box::new(loader),
            instance: OnceCell::new(),
        }));
        self.by_name.insert(descriptor.name, index);
        for alias in descriptor.aliases {
            self.by_name.insert(alias, index);
        }
        self
    }

    /// Register an already constructed provider.
    pub fn register_instance(self, provider: Arc<dyn CapabilityProvider>) -> Self {
        let descriptor = provider.descriptor();
        self.register(descriptor, move || Ok(Arc::clone(&provider)))
    }

    pub fn descriptor(&self, name: &str) -> Option<&'static CapabilityDescriptor> {
        self.binding(name).map(|binding| binding.descriptor)
    }

    pub fn descriptors(&self) -> Vec<&'static CapabilityDescriptor> {
        self.bindings.iter().map(|binding| binding.descriptor).collect()
    }

    /// Resolve a provider by name or alias, loading it on demand.
    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn CapabilityProvider>, CapabilityError> {
        let binding = self
            .binding(name)
            .ok_or_else(|| CapabilityError::UnknownCapability(name.to_string()))?;
        let provider = binding
            .instance
            .get_or_try_init(|| async {
                tracing::debug!(target: "bridge", capability = binding.descriptor.name, "loading provider");
                (binding.loader)()
            })
            .await
            .map_err(|err| {
                tracing::warn!(target: "bridge", capability = binding.descriptor.name, error = %err, "provider failed to load");
                match err {
                    CapabilityError::Unavailable(_) => err,
                    _ => CapabilityError::Unavailable(binding.descriptor.name.to_string()),
                }
            })?;
        Ok(Arc::clone(provider))
    }

    /// Provider if it has already been loaded; never triggers a load.
    pub fn loaded(&self, name: &str) -> Option<Arc<dyn CapabilityProvider>> {
        self.binding(name)
            .and_then(|binding| binding.instance.get().map(Arc::clone))
    }

    fn binding(&self, name: &str) -> Option<&Arc<Binding>> {
        self.by_name
            .get(name)
            .and_then(|index| self.bindings.get(*index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static ECHO: CapabilityDescriptor = CapabilityDescriptor {
        name: "echo",
        aliases: &["Echo"],
        methods: &["ping"],
        events: &["tick"],
    };

    struct Echo {
        listeners: ListenerSet,
    }

    impl CapabilityProvider for Echo {
        fn descriptor(&self) -> &'static CapabilityDescriptor {
            &ECHO
        }

        fn invoke(&self, _method: &str, params: &JsonValue) -> Result<JsonValue, CapabilityError> {
            Ok(params.clone())
        }

        fn add_listener(&self, listener: ProviderListener) -> ListenerToken {
            self.listeners.add(listener)
        }

        fn remove_listener(&self, token: ListenerToken) -> bool {
            self.listeners.remove(token)
        }
    }

    #[tokio::test]
    async fn concurrent_first_loads_share_one_provider() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let registry = Arc::new(CapabilityRegistry::new().register(&ECHO, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Echo {
                listeners: ListenerSet::new(),
            }) as Arc<dyn CapabilityProvider>)
        }));

        let mut tasks = Vec::new();
        for name in ["echo", "Echo", "echo", "Echo"] {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move { registry.resolve(name).await }));
        }
        let mut providers = Vec::new();
        for task in tasks {
            providers.push(task.await.unwrap().unwrap());
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(providers
            .windows(2)
            .all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }

    #[tokio::test]
    async fn failed_load_reports_unavailable_and_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let registry = CapabilityRegistry::new().register(&ECHO, move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CapabilityError::failed("engine missing"))
            } else {
                Ok(Arc::new(Echo {
                    listeners: ListenerSet::new(),
                }) as Arc<dyn CapabilityProvider>)
            }
        });

        let err = registry.resolve("echo").await.err().unwrap();
        assert_eq!(err.to_string(), "echo unavailable");
        assert!(registry.loaded("echo").is_none());
        assert!(registry.resolve("echo").await.is_ok());
        assert!(registry.loaded("Echo").is_some());
    }

    #[tokio::test]
    async fn unknown_capability_is_reported_by_name() {
        let registry = CapabilityRegistry::new();
        let err = registry.resolve("camera").await.err().unwrap();
        assert_eq!(err, CapabilityError::UnknownCapability("camera".into()));
        assert_eq!(err.to_string(), "Unsupported plugin camera");
    }

    #[test]
    fn listener_set_fires_in_registration_order() {
        let set = ListenerSet::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = {
            let seen = Arc::clone(&seen);
            set.add(Arc::new(move |event: &str, _: &JsonValue| {
                seen.lock().unwrap().push(format!("a:{event}"))
            }))
        };
        {
            let seen = Arc::clone(&seen);
            set.add(Arc::new(move |event: &str, _: &JsonValue| {
                seen.lock().unwrap().push(format!("b:{event}"))
            }));
        }

        set.emit("tick", &JsonValue::Null);
        assert!(set.remove(first));
        assert!(!set.remove(first));
        set.emit("tock", &JsonValue::Null);

        assert_eq!(*seen.lock().unwrap(), vec!["a:tick", "b:tick", "b:tock"]);
    }
}
