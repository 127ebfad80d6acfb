use url::Url;

/// Host side of the embedded surface.
///
/// Every call is fire-and-forget. Implementations must not call back into
/// the bridge synchronously; page output is reported later through
/// [`crate::OverlayBridge`].
pub trait PageTransport: Send + Sync {
    /// Execute `script` in the current page.
    fn evaluate(&self, script: String);

    /// Start loading a new document.
    fn load(&self, url: &Url);

    fn can_go_back(&self) -> bool;

    fn go_back(&self);

    /// Stop loading and discard the page content.
    fn stop(&self) {}

    /// Release the surface for good.
    fn destroy(&self) {}
}
