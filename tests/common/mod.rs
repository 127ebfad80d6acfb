#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use overlay_bridge::{
    BridgeConfig, BridgeStatus, CapabilityRegistry, HeadlessSpeechEngine, HeadlessSurface,
    OverlayBridge, OverlayEvent, PresentationMode, TtsCapability,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub const WATCH_URL: &str = "https://video.test/watch?v=1";

const PAGE_HELPERS: &str = r#"
globalThis.outcomes = {};
globalThis.track = function (name, promise) {
    promise.then(
        function (result) { outcomes[name] = 'ok:' + JSON.stringify(result); },
        function (err) { outcomes[name] = 'err:' + err.message; }
    );
};
"#;

/// A shown overlay on a headless surface with the speech capability wired in.
pub struct Harness {
    pub bridge: OverlayBridge,
    pub surface: HeadlessSurface,
    pub events: UnboundedReceiver<OverlayEvent>,
    pub engine: Arc<HeadlessSpeechEngine>,
    pub tts: Arc<TtsCapability>,
}

impl Harness {
    pub async fn show(url: &str) -> Result<Self> {
        Self::show_with(url, BridgeConfig::default(), HeadlessSpeechEngine::new()).await
    }

    pub async fn show_with(
        url: &str,
        config: BridgeConfig,
        engine: HeadlessSpeechEngine,
    ) -> Result<Self> {
        let engine = Arc::new(engine);
        let tts = Arc::new(TtsCapability::new(engine.clone()));
        let registry = Arc::new(CapabilityRegistry::new().register_instance(tts.clone()));

        let (surface, transport) = HeadlessSurface::new(&config);
        let (bridge, events) = OverlayBridge::spawn(config, registry, transport);
        let mut harness = Self {
            bridge,
            surface,
            events,
            engine,
            tts,
        };
        harness.reshow(url).await?;
        Ok(harness)
    }

    pub async fn reshow(&mut self, url: &str) -> Result<()> {
        self.bridge.show(url, PresentationMode::Default).await?;
        self.pump().await?;
        self.eval(PAGE_HELPERS)
    }

    pub async fn open_document(&mut self, url: &str) -> Result<()> {
        self.surface.open_document(&self.bridge, url).await?;
        self.eval(PAGE_HELPERS)
    }

    pub async fn pump(&mut self) -> Result<()> {
        self.surface.pump(&self.bridge).await
    }

    pub async fn advance(&mut self, ms: u64) -> Result<()> {
        self.surface.advance(&self.bridge, ms).await
    }

    pub fn eval(&self, source: &str) -> Result<()> {
        self.surface.eval(source)
    }

    pub fn read<V>(&self, source: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        self.surface.eval_with(source)
    }

    /// Settlement recorded by `track(name, promise)`: `ok:<json>` or `err:<message>`.
    pub fn outcome(&self, name: &str) -> Result<Option<String>> {
        self.read(&format!("outcomes[{name:?}]"))
    }

    pub async fn status(&self) -> Result<BridgeStatus> {
        Ok(self.bridge.status().await?)
    }

    pub fn take_events(&mut self) -> Vec<OverlayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Drains pending events and returns only the URL notifications.
    pub fn urls(&mut self) -> Vec<String> {
        self.take_events()
            .into_iter()
            .filter_map(|event| match event {
                OverlayEvent::UrlChanged { url } => Some(url),
                _ => None,
            })
            .collect()
    }
}
