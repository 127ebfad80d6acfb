use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::capability::CapabilityRegistry;
use crate::config::BridgeConfig;
use crate::dispatcher::{DispatchError, EventSink, HostDispatcher, ProviderEvent};
use crate::envelope::{close_script, dispatch_script, Envelope};
use crate::js::{runtime_script, tracking_script};
use crate::lifecycle::{
    CloseReason, LifecycleController, LifecycleError, PresentationMode, SurfaceState,
};
use crate::navigation::{LocationSource, NavigationMonitor, NavigationSignal, NavigationUpdate};
use crate::transport::PageTransport;

const CLOSE_REASON: &str = "overlay closed";

/// Notifications for the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    /// The page location changed; repeats are suppressed.
    UrlChanged { url: String },
    /// A visible overlay was hidden or backed out of.
    Closed,
    /// Bridge diagnostics, only sent when `debug_events` is enabled.
    Debug { message: String },
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("overlay bridge has shut down")]
    Closed,
}

/// Snapshot of the host-side bridge state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStatus {
    pub state: SurfaceState,
    pub mode: PresentationMode,
    pub generation: u64,
    pub location: Option<String>,
    pub subscriptions: usize,
    pub provider_listeners: usize,
}

enum BridgeCommand {
    Show {
        url: String,
        mode: PresentationMode,
        reply: oneshot::Sender<Result<Url, LifecycleError>>,
    },
    Hide,
    GoBack,
    Destroy,
    PageMessage(String),
    Navigation(NavigationSignal),
    ProviderEvent(ProviderEvent),
    Flush(oneshot::Sender<()>),
    Status(oneshot::Sender<BridgeStatus>),
}

/// Handle to the host side of the overlay bridge.
///
/// Every call is queued to one task that owns all bridge state, so it is
/// safe to call from transport callbacks, provider threads and the host
/// app alike. Cloning the handle is cheap.
#[derive(Clone)]
pub struct OverlayBridge {
    commands: mpsc::UnboundedSender<BridgeCommand>,
}

impl OverlayBridge {
    /// Start the bridge task on the current tokio runtime.
    pub fn spawn(
        config: BridgeConfig,
        registry: Arc<CapabilityRegistry>,
        transport: Arc<dyn PageTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<OverlayEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Provider callbacks must not keep the bridge alive on their own.
        let weak = command_tx.downgrade();
        let sink: EventSink = Arc::new(move |event| {
            if let Some(commands) = weak.upgrade() {
                let _ = commands.send(BridgeCommand::ProviderEvent(event));
            }
        });

        let host = BridgeHost {
            config,
            transport,
            dispatcher: HostDispatcher::new(registry, sink),
            navigation: NavigationMonitor::new(),
            lifecycle: LifecycleController::new(),
            events: event_tx,
        };
        tokio::spawn(host.run(command_rx));

        (
            Self {
                commands: command_tx,
            },
            event_rx,
        )
    }

    /// Load `url` into the surface and make it visible.
    pub async fn show(&self, url: &str, mode: PresentationMode) -> Result<Url, BridgeError> {
        let (reply, response) = oneshot::channel();
        self.send(BridgeCommand::Show {
            url: url.to_string(),
            mode,
            reply,
        })?;
        Ok(response.await.map_err(|_| BridgeError::Closed)??)
    }

    pub fn hide(&self) -> Result<(), BridgeError> {
        self.send(BridgeCommand::Hide)
    }

    /// Navigate back inside the surface, or hide it when there is no history.
    pub fn go_back(&self) -> Result<(), BridgeError> {
        self.send(BridgeCommand::GoBack)
    }

    /// Tear the surface down for good. The bridge task exits afterwards.
    pub fn destroy(&self) -> Result<(), BridgeError> {
        self.send(BridgeCommand::Destroy)
    }

    /// Raw string posted by the page through the host object.
    pub fn post_message(&self, raw: impl Into<String>) -> Result<(), BridgeError> {
        self.send(BridgeCommand::PageMessage(raw.into()))
    }

    /// Location reported by the page's tracking script.
    pub fn notify_location(&self, href: impl Into<String>, source: &str) -> Result<(), BridgeError> {
        self.navigation(NavigationSignal::LocationReported {
            href: href.into(),
            source: LocationSource::parse(source),
        })
    }

    pub fn navigation(&self, signal: NavigationSignal) -> Result<(), BridgeError> {
        self.send(BridgeCommand::Navigation(signal))
    }

    /// Resolves once every command queued before it has been handled.
    pub async fn flush(&self) -> Result<(), BridgeError> {
        let (reply, done) = oneshot::channel();
        self.send(BridgeCommand::Flush(reply))?;
        done.await.map_err(|_| BridgeError::Closed)
    }

    pub async fn status(&self) -> Result<BridgeStatus, BridgeError> {
        let (reply, status) = oneshot::channel();
        self.send(BridgeCommand::Status(reply))?;
        status.await.map_err(|_| BridgeError::Closed)
    }

    fn send(&self, command: BridgeCommand) -> Result<(), BridgeError> {
        self.commands.send(command).map_err(|_| BridgeError::Closed)
    }
}

struct BridgeHost {
    config: BridgeConfig,
    transport: Arc<dyn PageTransport>,
    dispatcher: HostDispatcher,
    navigation: NavigationMonitor,
    lifecycle: LifecycleController,
    events: mpsc::UnboundedSender<OverlayEvent>,
}

impl BridgeHost {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<BridgeCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                BridgeCommand::Show { url, mode, reply } => {
                    let _ = reply.send(self.show(&url, mode));
                }
                BridgeCommand::Hide => self.close(CloseReason::Hide),
                BridgeCommand::GoBack => self.go_back(),
                BridgeCommand::Destroy => {
                    self.close(CloseReason::Destroy);
                    self.transport.destroy();
                    break;
                }
                BridgeCommand::PageMessage(raw) => self.on_page_message(&raw).await,
                BridgeCommand::Navigation(signal) => self.on_navigation(signal),
                BridgeCommand::ProviderEvent(event) => self.on_provider_event(event),
                BridgeCommand::Flush(reply) => {
                    let _ = reply.send(());
                }
                BridgeCommand::Status(reply) => {
                    let _ = reply.send(self.status());
                }
            }
        }
        tracing::debug!(target: "bridge", "bridge host stopped");
    }

    fn show(&mut self, raw_url: &str, mode: PresentationMode) -> Result<Url, LifecycleError> {
        let url = self.lifecycle.begin_show(raw_url, mode).map_err(|err| {
            tracing::warn!(target: "lifecycle", error = %err, "show rejected");
            err
        })?;

        self.dispatcher.clear();
        let generation = self.navigation.reset();
        self.debug(format!("[Bridge] showing {url} (generation {generation})"));
        self.transport.load(&url);
        self.lifecycle.finish_show();

        let update = self.navigation.observe(NavigationSignal::LocationReported {
            href: url.to_string(),
            source: LocationSource::Load,
        });
        self.apply(update);
        Ok(url)
    }

    fn go_back(&mut self) {
        if !self.lifecycle.is_visible() {
            return;
        }
        if self.transport.can_go_back() {
            tracing::debug!(target: "lifecycle", "navigating back");
            self.transport.go_back();
        } else {
            self.close(CloseReason::Back);
        }
    }

    fn close(&mut self, reason: CloseReason) {
        if self.lifecycle.state() != SurfaceState::Hidden {
            let generation = self.navigation.generation();
            self.transport
                .evaluate(close_script(&self.config.runtime_global, generation, CLOSE_REASON));
        }
        let removed = self.dispatcher.clear();
        let Some(reason) = self.lifecycle.close(reason) else {
            return;
        };
        self.transport.stop();
        self.debug(format!("[Bridge] closed ({reason:?}), removed {removed} subscriptions"));
        if reason.notifies_host() {
            self.emit(OverlayEvent::Closed);
        }
    }

    async fn on_page_message(&mut self, raw: &str) {
        if !self.lifecycle.is_visible() {
            tracing::debug!(target: "bridge", "dropping page message while hidden");
            return;
        }
        let generation = self.navigation.generation();
        match self.dispatcher.on_message(raw, generation).await {
            Ok(Some(reply)) => self.post_to_page(&reply),
            Ok(None) => {}
            Err(err @ DispatchError::StaleGeneration { .. }) => {
                tracing::debug!(target: "bridge", error = %err, "dropped late page message");
                self.debug(format!("[Bridge] dropped message: {err}"));
            }
            Err(err) => {
                tracing::warn!(target: "bridge", error = %err, "dropped page message");
                self.debug(format!("[Bridge] dropped message: {err}"));
            }
        }
    }

    fn on_navigation(&mut self, signal: NavigationSignal) {
        if !self.lifecycle.is_visible() {
            tracing::trace!(target: "navigation", ?signal, "ignoring navigation while hidden");
            return;
        }
        let update = self.navigation.observe(signal);
        self.apply(update);
    }

    fn on_provider_event(&mut self, event: ProviderEvent) {
        if !self.lifecycle.is_visible() {
            return;
        }
        if let Some(envelope) = self.dispatcher.deliver(event, self.navigation.generation()) {
            self.post_to_page(&envelope);
        }
    }

    fn apply(&mut self, update: NavigationUpdate) {
        if let Some(generation) = update.generation_advanced {
            let retired = self.dispatcher.retire_generations_before(generation);
            self.debug(format!(
                "[Bridge] new document, generation {generation}, retired {retired} subscriptions"
            ));
        }
        let generation = self.navigation.generation();
        if update.inject_runtime {
            self.debug(format!("[Bridge] injecting runtime script (generation {generation})"));
            let capabilities = self.dispatcher.registry().descriptors();
            self.transport
                .evaluate(runtime_script(&self.config, generation, &capabilities));
        }
        if update.inject_tracking {
            self.debug("[Bridge] injecting tracking script".to_string());
            self.transport.evaluate(tracking_script(&self.config));
        }
        if let Some(url) = update.location_changed {
            tracing::info!(target: "navigation", %url, "location changed");
            self.emit(OverlayEvent::UrlChanged { url });
        }
    }

    fn post_to_page(&self, envelope: &Envelope) {
        if !self.lifecycle.is_visible() {
            return;
        }
        let script = dispatch_script(
            &self.config.runtime_global,
            self.navigation.generation(),
            envelope,
        );
        self.transport.evaluate(script);
    }

    fn status(&self) -> BridgeStatus {
        BridgeStatus {
            state: self.lifecycle.state(),
            mode: self.lifecycle.mode(),
            generation: self.navigation.generation(),
            location: self.navigation.current_location().map(str::to_string),
            subscriptions: self.dispatcher.subscription_count(),
            provider_listeners: self.dispatcher.provider_listener_count(),
        }
    }

    fn debug(&self, message: String) {
        tracing::debug!(target: "bridge", "{message}");
        if self.config.debug_events {
            self.emit(OverlayEvent::Debug { message });
        }
    }

    fn emit(&self, event: OverlayEvent) {
        // The host app may have stopped listening.
        let _ = self.events.send(event);
    }
}
