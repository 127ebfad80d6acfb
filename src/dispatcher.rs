use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::capability::{
    CapabilityError, CapabilityProvider, CapabilityRegistry, ListenerToken, ProviderListener,
};
use crate::envelope::{
    Envelope, EnvelopeError, EventEnvelope, RequestEnvelope, ResponseEnvelope, SubscribeEnvelope,
};

/// Event raised by a provider on behalf of one mirrored subscription key.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    /// Canonical capability name; aliases are resolved at subscribe time.
    pub capability: String,
    pub event: String,
    pub generation: u64,
    pub data: JsonValue,
}

/// Where provider callbacks are queued; they may fire on any thread.
pub type EventSink = Arc<dyn Fn(ProviderEvent) + Send + Sync>;

/// Page messages the dispatcher dropped without replying.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed message: {0}")]
    Malformed(#[from] EnvelopeError),
    #[error("subscription is missing {0}")]
    IncompleteSubscription(&'static str),
    #[error("cannot subscribe to {capability}.{event}: {reason}")]
    Subscription {
        capability: String,
        event: String,
        reason: CapabilityError,
    },
    #[error("unexpected {0} message from page")]
    UnexpectedKind(&'static str),
    #[error("{kind} {id} is from generation {sender}, current is {current}")]
    StaleGeneration {
        kind: &'static str,
        id: String,
        sender: u64,
        current: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubscriptionKey {
    generation: u64,
    capability: String,
    event: String,
}

/// One provider-level listener shared by every page subscription to a key.
struct Mirror {
    provider: Arc<dyn CapabilityProvider>,
    token: ListenerToken,
    /// Name the first page subscription used; events go back under it.
    subscribed_as: String,
    subscriptions: Vec<String>,
}

/// Host half of the bridge: routes page envelopes to capability providers.
///
/// Not thread-safe on purpose; the owning bridge task is its only caller.
pub struct HostDispatcher {
    registry: Arc<CapabilityRegistry>,
    sink: EventSink,
    mirrors: HashMap<SubscriptionKey, Mirror>,
    by_id: HashMap<String, SubscriptionKey>,
}

impl HostDispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>, sink: EventSink) -> Self {
        Self {
            registry,
            sink,
            mirrors: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Handle one raw page message received during `generation`.
    ///
    /// `Ok(Some(_))` is the reply to post back; `Err` means the message was
    /// dropped.
    pub async fn on_message(
        &mut self,
        raw: &str,
        generation: u64,
    ) -> Result<Option<Envelope>, DispatchError> {
        match Envelope::parse(raw)? {
            Envelope::Request(request) => {
                if let Some(id) = request.id.as_deref() {
                    check_generation("request", id, request_generation(id), generation)?;
                }
                Ok(self.handle_request(request).await)
            }
            Envelope::Subscribe(subscribe) => {
                let id = subscribe.subscription_id.as_str();
                check_generation("subscription", id, subscription_generation(id), generation)?;
                self.subscribe(subscribe, generation).await?;
                Ok(None)
            }
            Envelope::Unsubscribe(unsubscribe) => {
                self.unsubscribe(&unsubscribe.subscription_id);
                Ok(None)
            }
            Envelope::Log(log) => {
                tracing::info!(target: "bridge", generation, "page: {}", log.message);
                Ok(None)
            }
            other => Err(DispatchError::UnexpectedKind(other.kind())),
        }
    }

    async fn handle_request(&self, request: RequestEnvelope) -> Option<Envelope> {
        let id = request.id.clone().filter(|id| !id.is_empty());
        match self.invoke(&request).await {
            Ok(result) => {
                tracing::debug!(
                    target: "bridge",
                    capability = %request.capability,
                    method = %request.method,
                    id = ?id,
                    "request succeeded"
                );
                id.map(|id| Envelope::Response(ResponseEnvelope::success(id, result)))
            }
            Err(err) => {
                tracing::debug!(
                    target: "bridge",
                    capability = %request.capability,
                    method = %request.method,
                    id = ?id,
                    error = %err,
                    "request failed"
                );
                Some(Envelope::Response(ResponseEnvelope::failure(
                    id,
                    err.to_string(),
                )))
            }
        }
    }

    async fn invoke(&self, request: &RequestEnvelope) -> Result<JsonValue, CapabilityError> {
        let capability = request.capability.trim();
        let method = request.method.trim();
        if capability.is_empty() {
            return Err(CapabilityError::NotSpecified("Plugin"));
        }
        if method.is_empty() {
            return Err(CapabilityError::NotSpecified("Method"));
        }
        let descriptor = self
            .registry
            .descriptor(capability)
            .ok_or_else(|| CapabilityError::UnknownCapability(capability.to_string()))?;
        if !descriptor.has_method(method) {
            return Err(CapabilityError::UnknownMethod(method.to_string()));
        }
        let provider = self.registry.resolve(capability).await?;
        provider.invoke(method, &request.params_object())
    }

    async fn subscribe(
        &mut self,
        subscribe: SubscribeEnvelope,
        generation: u64,
    ) -> Result<(), DispatchError> {
        let SubscribeEnvelope {
            capability,
            event,
            subscription_id,
        } = subscribe;
        if capability.trim().is_empty() {
            return Err(DispatchError::IncompleteSubscription("plugin"));
        }
        if event.trim().is_empty() {
            return Err(DispatchError::IncompleteSubscription("event"));
        }
        if subscription_id.trim().is_empty() {
            return Err(DispatchError::IncompleteSubscription("listenerId"));
        }
        if self.by_id.contains_key(&subscription_id) {
            tracing::debug!(target: "bridge", %subscription_id, "subscription already registered");
            return Ok(());
        }

        let rejected = |reason| DispatchError::Subscription {
            capability: capability.clone(),
            event: event.clone(),
            reason,
        };
        let descriptor = self
            .registry
            .descriptor(&capability)
            .ok_or_else(|| rejected(CapabilityError::UnknownCapability(capability.clone())))?;
        if !descriptor.has_event(&event) {
            return Err(rejected(CapabilityError::failed(format!(
                "Unsupported event {event}"
            ))));
        }

        let key = SubscriptionKey {
            generation,
            capability: descriptor.name.to_string(),
            event: event.clone(),
        };
        if !self.mirrors.contains_key(&key) {
            let provider = self
                .registry
                .resolve(&capability)
                .await
                .map_err(rejected)?;
            let token = provider.add_listener(self.provider_listener(&key));
            self.mirrors.insert(
                key.clone(),
                Mirror {
                    provider,
                    token,
                    subscribed_as: capability.clone(),
                    subscriptions: Vec::new(),
                },
            );
        }
        if let Some(mirror) = self.mirrors.get_mut(&key) {
            mirror.subscriptions.push(subscription_id.clone());
        }
        tracing::debug!(target: "bridge", %capability, %event, %subscription_id, generation, "subscribed");
        self.by_id.insert(subscription_id, key);
        Ok(())
    }

    // Providers emit every event kind through one listener; only the
    // subscribed event name is forwarded.
    fn provider_listener(&self, key: &SubscriptionKey) -> ProviderListener {
        let sink = Arc::clone(&self.sink);
        let key = key.clone();
        Arc::new(move |event: &str, data: &JsonValue| {
            if event != key.event {
                return;
            }
            sink(ProviderEvent {
                capability: key.capability.clone(),
                event: key.event.clone(),
                generation: key.generation,
                data: data.clone(),
            });
        })
    }

    /// Remove one subscription; unknown ids are ignored.
    pub fn unsubscribe(&mut self, subscription_id: &str) -> bool {
        let Some(key) = self.by_id.remove(subscription_id) else {
            return false;
        };
        let emptied = match self.mirrors.get_mut(&key) {
            Some(mirror) => {
                mirror.subscriptions.retain(|id| id != subscription_id);
                mirror.subscriptions.is_empty()
            }
            None => false,
        };
        if emptied {
            if let Some(mirror) = self.mirrors.remove(&key) {
                mirror.provider.remove_listener(mirror.token);
            }
        }
        tracing::debug!(target: "bridge", %subscription_id, "unsubscribed");
        true
    }

    /// Turn a queued provider event into the envelope for the page, if the
    /// subscription it was raised for is still live in `current_generation`.
    pub fn deliver(&self, event: ProviderEvent, current_generation: u64) -> Option<Envelope> {
        if event.generation != current_generation {
            return None;
        }
        let key = SubscriptionKey {
            generation: event.generation,
            capability: event.capability,
            event: event.event,
        };
        let mirror = self.mirrors.get(&key)?;
        if mirror.subscriptions.is_empty() {
            return None;
        }
        Some(Envelope::Event(EventEnvelope::new(
            mirror.subscribed_as.clone(),
            key.event,
            event.data,
        )))
    }

    /// Drop every subscription that belongs to a generation older than
    /// `generation`.
    pub fn retire_generations_before(&mut self, generation: u64) -> usize {
        self.remove_where(|key| key.generation < generation)
    }

    /// Remove every mirrored listener registered through this bridge.
    pub fn clear(&mut self) -> usize {
        self.remove_where(|_| true)
    }

    fn remove_where(&mut self, stale: impl Fn(&SubscriptionKey) -> bool) -> usize {
        let keys: Vec<SubscriptionKey> = self.mirrors.keys().filter(|key| stale(key)).cloned().collect();
        let mut removed = 0;
        for key in keys {
            if let Some(mirror) = self.mirrors.remove(&key) {
                mirror.provider.remove_listener(mirror.token);
                removed += mirror.subscriptions.len();
                for id in &mirror.subscriptions {
                    self.by_id.remove(id);
                }
            }
        }
        if removed > 0 {
            tracing::debug!(target: "bridge", removed, "removed mirrored subscriptions");
        }
        removed
    }

    pub fn subscription_count(&self) -> usize {
        self.by_id.len()
    }

    /// Number of listeners currently held on providers.
    pub fn provider_listener_count(&self) -> usize {
        self.mirrors.len()
    }
}

/// Generation encoded in a `"<generation>-<n>"` request id.
fn request_generation(id: &str) -> Option<u64> {
    let (generation, sequence) = id.split_once('-')?;
    sequence.parse::<u64>().ok()?;
    generation.parse().ok()
}

/// Generation encoded in a `"L<generation>-<n>"` subscription id.
fn subscription_generation(id: &str) -> Option<u64> {
    request_generation(id.strip_prefix('L')?)
}

// Ids that carry no generation are accepted as sent by the current document.
fn check_generation(
    kind: &'static str,
    id: &str,
    sender: Option<u64>,
    current: u64,
) -> Result<(), DispatchError> {
    match sender {
        Some(sender) if sender != current => Err(DispatchError::StaleGeneration {
            kind,
            id: id.to_string(),
            sender,
            current,
        }),
        _ => Ok(()),
    }
}

impl Drop for HostDispatcher {
    fn drop(&mut self) {
        self.clear();
    }
}
