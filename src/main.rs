use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use overlay_bridge::capability::CapabilityProvider;
use overlay_bridge::{
    BridgeConfig, CapabilityRegistry, HeadlessSpeechEngine, HeadlessSurface, OverlayBridge,
    OverlayEvent, PresentationMode, TtsCapability,
};
use tracing_subscriber::EnvFilter;

const DEMO_SCRIPT: &str = r#"
globalThis.demo = { states: [], result: null, error: null };
const tts = Capacitor.Plugins.NativeTTS;
tts.addListener('state', (event) => demo.states.push(event.state));
tts.speak({ text: 'Hello from the overlay' })
    .then((result) => { demo.result = JSON.stringify(result); })
    .catch((err) => { demo.error = err.message; });
"#;

fn main() -> Result<()> {
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| String::from("about:blank"));

    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    let config_path = std::env::var("OVERLAY_BRIDGE_CONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(BridgeConfig::default_path);
    let config = BridgeConfig::load(config_path).unwrap_or_else(|err| {
        tracing::warn!("Failed to load bridge configuration: {err}. Using defaults.");
        BridgeConfig::default()
    });

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(run(config, url))
}

async fn run(config: BridgeConfig, url: String) -> Result<()> {
    let engine = Arc::new(HeadlessSpeechEngine::new());
    let tts: Arc<dyn CapabilityProvider> = Arc::new(TtsCapability::new(engine.clone()));
    let registry = Arc::new(CapabilityRegistry::new().register_instance(tts));

    let (mut surface, transport) = HeadlessSurface::new(&config);
    let (bridge, mut events) = OverlayBridge::spawn(config, registry, transport);

    bridge.show(&url, PresentationMode::Default).await?;
    surface.pump(&bridge).await?;
    surface.eval(DEMO_SCRIPT)?;
    surface.pump(&bridge).await?;

    let states: String = surface.eval_with("demo.states.join(', ')")?;
    let result: Option<String> = surface.eval_with("demo.result")?;
    let error: Option<String> = surface.eval_with("demo.error")?;
    match error {
        Some(error) => tracing::error!("speak failed: {error}"),
        None => tracing::info!(
            "speak resolved with {} (states: {states})",
            result.as_deref().unwrap_or("nothing")
        ),
    }
    tracing::info!("engine spoke {:?}", engine.spoken());

    bridge.hide()?;
    surface.pump(&bridge).await?;
    bridge.destroy()?;
    surface.pump(&bridge).await?;

    while let Ok(event) = events.try_recv() {
        match event {
            OverlayEvent::UrlChanged { url } => tracing::info!("url changed: {url}"),
            OverlayEvent::Closed => tracing::info!("overlay closed"),
            OverlayEvent::Debug { message } => tracing::debug!("{message}"),
        }
    }
    Ok(())
}
