use std::fmt;

/// Where a location report came from inside the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationSource {
    /// Host-side load of a new document.
    Load,
    History,
    PopState,
    HashChange,
    /// A configured app-specific navigation event.
    Custom,
    Mutation,
    Poll,
    Initial,
}

impl LocationSource {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "load" => Self::Load,
            "history" => Self::History,
            "popstate" => Self::PopState,
            "hashchange" => Self::HashChange,
            "mutation" => Self::Mutation,
            "poll" => Self::Poll,
            "initial" | "" => Self::Initial,
            _ => Self::Custom,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::History => "history",
            Self::PopState => "popstate",
            Self::HashChange => "hashchange",
            Self::Custom => "custom",
            Self::Mutation => "mutation",
            Self::Poll => "poll",
            Self::Initial => "initial",
        }
    }
}

impl fmt::Display for LocationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Navigation observation delivered by the surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationSignal {
    /// A new document started loading; all page state is about to vanish.
    LoadStarted { url: String },
    /// The current document finished loading and accepts scripts.
    PageReady { url: Option<String> },
    /// The in-page tracker observed `href`.
    LocationReported { href: String, source: LocationSource },
}

/// What the host should do in response to a navigation signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavigationUpdate {
    /// The deduplicated location changed to this value.
    pub location_changed: Option<String>,
    /// A new document generation started; this is its number.
    pub generation_advanced: Option<u64>,
    pub inject_runtime: bool,
    pub inject_tracking: bool,
}

/// Suppresses repeated reports of the same location.
///
/// Shared by every signal source, so a URL reported by the poll and then
/// by a history hook surfaces once.
#[derive(Debug, Default)]
pub struct LocationTracker {
    last: Option<String>,
}

impl LocationTracker {
    /// Returns the location when it differs from the last one observed.
    pub fn observe(&mut self, href: &str) -> Option<String> {
        let href = href.trim();
        if href.is_empty() || self.last.as_deref() == Some(href) {
            return None;
        }
        self.last = Some(href.to_string());
        self.last.clone()
    }

    pub fn current(&self) -> Option<&str> {
        self.last.as_deref()
    }

    pub fn clear(&mut self) {
        self.last = None;
    }
}

/// Tracks document generations and injection state for one surface.
///
/// Every cross-document load starts a new generation. Injection flags
/// belong to a generation, so a page that loads again always receives a
/// fresh runtime even if the previous one was never torn down cleanly.
#[derive(Debug, Default)]
pub struct NavigationMonitor {
    generation: u64,
    runtime_injected: Option<u64>,
    tracking_injected: Option<u64>,
    tracker: LocationTracker,
}

impl NavigationMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current_location(&self) -> Option<&str> {
        self.tracker.current()
    }

    /// Start over for a fresh presentation: new generation, no locations.
    pub fn reset(&mut self) -> u64 {
        self.tracker.clear();
        self.advance()
    }

    pub fn observe(&mut self, signal: NavigationSignal) -> NavigationUpdate {
        let mut update = NavigationUpdate::default();
        match signal {
            NavigationSignal::LoadStarted { url } => {
                update.generation_advanced = Some(self.advance());
                update.location_changed = self.tracker.observe(&url);
            }
            NavigationSignal::PageReady { url } => {
                if let Some(url) = url {
                    update.location_changed = self.tracker.observe(&url);
                }
                update.inject_runtime = self.claim_runtime_injection();
                update.inject_tracking = self.claim_tracking_injection();
            }
            NavigationSignal::LocationReported { href, source } => {
                tracing::trace!(target: "navigation", %source, %href, "location reported");
                update.location_changed = self.tracker.observe(&href);
            }
        }
        update
    }

    /// True exactly once per generation.
    pub fn claim_runtime_injection(&mut self) -> bool {
        claim(&mut self.runtime_injected, self.generation)
    }

    /// True exactly once per generation.
    pub fn claim_tracking_injection(&mut self) -> bool {
        claim(&mut self.tracking_injected, self.generation)
    }

    fn advance(&mut self) -> u64 {
        self.generation += 1;
        tracing::debug!(target: "navigation", generation = self.generation, "new document generation");
        self.generation
    }
}

fn claim(slot: &mut Option<u64>, generation: u64) -> bool {
    if *slot == Some(generation) {
        return false;
    }
    *slot = Some(generation);
    true
}
