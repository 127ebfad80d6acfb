use std::fmt;

use thiserror::Error;
use url::Url;

/// Visibility of the embedded surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurfaceState {
    #[default]
    Hidden,
    Showing,
    Visible,
}

/// How the host app asked the surface to be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentationMode {
    #[default]
    Default,
    Minimal,
}

impl PresentationMode {
    /// Unknown or empty modes fall back to `Default`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(mode) if mode.eq_ignore_ascii_case("minimal") => Self::Minimal,
            _ => Self::Default,
        }
    }
}

impl fmt::Display for PresentationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Default => "default",
            Self::Minimal => "minimal",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Hide,
    /// Back navigation with no history left.
    Back,
    Destroy,
}

impl CloseReason {
    /// Whether the host app should be told the overlay closed.
    pub fn notifies_host(&self) -> bool {
        !matches!(self, Self::Destroy)
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("url is required")]
    UrlRequired,
    #[error("invalid url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("overlay has been destroyed")]
    Destroyed,
}

/// Hidden → Showing → Visible → Hidden.
#[derive(Debug, Default)]
pub struct LifecycleController {
    state: SurfaceState,
    mode: PresentationMode,
    destroyed: bool,
}

impl LifecycleController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SurfaceState {
        self.state
    }

    pub fn mode(&self) -> PresentationMode {
        self.mode
    }

    /// Page messages and host dispatches are only honoured while visible.
    pub fn is_visible(&self) -> bool {
        self.state == SurfaceState::Visible
    }

    /// Validate `raw_url` and enter `Showing`.
    ///
    /// Showing again while visible is allowed and replaces the page.
    pub fn begin_show(
        &mut self,
        raw_url: &str,
        mode: PresentationMode,
    ) -> Result<Url, LifecycleError> {
        if self.destroyed {
            return Err(LifecycleError::Destroyed);
        }
        let trimmed = raw_url.trim();
        if trimmed.is_empty() {
            return Err(LifecycleError::UrlRequired);
        }
        let url = Url::parse(trimmed).map_err(|source| LifecycleError::InvalidUrl {
            url: trimmed.to_string(),
            source,
        })?;

        tracing::debug!(target: "lifecycle", from = ?self.state, %url, %mode, "showing overlay");
        self.state = SurfaceState::Showing;
        self.mode = mode;
        Ok(url)
    }

    pub fn finish_show(&mut self) {
        if self.state == SurfaceState::Showing {
            self.state = SurfaceState::Visible;
            tracing::info!(target: "lifecycle", mode = %self.mode, "overlay visible");
        }
    }

    /// Leave the visible state. Returns the reason when something actually
    /// closed, `None` if the surface was already hidden.
    pub fn close(&mut self, reason: CloseReason) -> Option<CloseReason> {
        if reason == CloseReason::Destroy {
            self.destroyed = true;
        }
        if self.state == SurfaceState::Hidden {
            return None;
        }
        tracing::info!(target: "lifecycle", ?reason, "overlay closed");
        self.state = SurfaceState::Hidden;
        self.mode = PresentationMode::Default;
        Some(reason)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_then_hide() {
        let mut lifecycle = LifecycleController::new();
        let url = lifecycle
            .begin_show("https://example.test/watch", PresentationMode::Minimal)
            .unwrap();
        assert_eq!(url.host_str(), Some("example.test"));
        assert_eq!(lifecycle.state(), SurfaceState::Showing);
        assert!(!lifecycle.is_visible());

        lifecycle.finish_show();
        assert!(lifecycle.is_visible());
        assert_eq!(lifecycle.mode(), PresentationMode::Minimal);

        assert_eq!(lifecycle.close(CloseReason::Hide), Some(CloseReason::Hide));
        assert_eq!(lifecycle.state(), SurfaceState::Hidden);
        assert_eq!(lifecycle.close(CloseReason::Hide), None);
    }

    #[test]
    fn show_requires_a_url() {
        let mut lifecycle = LifecycleController::new();
        let err = lifecycle
            .begin_show("  ", PresentationMode::Default)
            .unwrap_err();
        assert_eq!(err.to_string(), "url is required");
        assert!(matches!(
            lifecycle.begin_show("not a url", PresentationMode::Default),
            Err(LifecycleError::InvalidUrl { .. })
        ));
        assert_eq!(lifecycle.state(), SurfaceState::Hidden);
    }

    #[test]
    fn destroy_is_terminal() {
        let mut lifecycle = LifecycleController::new();
        lifecycle
            .begin_show("about:blank", PresentationMode::Default)
            .unwrap();
        lifecycle.finish_show();

        let closed = lifecycle.close(CloseReason::Destroy).unwrap();
        assert!(!closed.notifies_host());
        assert!(lifecycle.is_destroyed());
        assert!(matches!(
            lifecycle.begin_show("about:blank", PresentationMode::Default),
            Err(LifecycleError::Destroyed)
        ));
    }

    #[test]
    fn parses_presentation_mode() {
        assert_eq!(PresentationMode::parse(Some("MINIMAL")), PresentationMode::Minimal);
        assert_eq!(PresentationMode::parse(Some("sheet")), PresentationMode::Default);
        assert_eq!(PresentationMode::parse(None), PresentationMode::Default);
    }
}
