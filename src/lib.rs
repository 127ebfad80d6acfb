// Library exports for the host app, the demo binary and tests

pub mod bridge;
pub mod capability;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod headless;
pub mod js;
pub mod lifecycle;
pub mod navigation;
pub mod transport;

// Re-export commonly used types
pub use bridge::{BridgeError, BridgeStatus, OverlayBridge, OverlayEvent};
pub use capability::{CapabilityRegistry, HeadlessSpeechEngine, TtsCapability};
pub use config::BridgeConfig;
pub use headless::{HeadlessSurface, HeadlessTransport};
pub use lifecycle::{PresentationMode, SurfaceState};
pub use navigation::NavigationSignal;
pub use transport::PageTransport;
