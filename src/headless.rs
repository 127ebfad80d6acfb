use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use url::Url;

use crate::bridge::{BridgeError, OverlayBridge};
use crate::config::BridgeConfig;
use crate::js::{HeadlessPage, PageOutput};
use crate::navigation::NavigationSignal;
use crate::transport::PageTransport;

const MAX_PUMP_ROUNDS: usize = 64;

#[derive(Debug)]
enum SurfaceCommand {
    Evaluate(String),
    Load(Url),
    GoBack,
    Stop,
    Destroy,
}

/// [`PageTransport`] half of a [`HeadlessSurface`].
pub struct HeadlessTransport {
    commands: mpsc::UnboundedSender<SurfaceCommand>,
    can_go_back: Arc<AtomicBool>,
}

impl HeadlessTransport {
    fn send(&self, command: SurfaceCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!(target: "bridge", "headless surface dropped");
        }
    }
}

impl PageTransport for HeadlessTransport {
    fn evaluate(&self, script: String) {
        self.send(SurfaceCommand::Evaluate(script));
    }

    fn load(&self, url: &Url) {
        self.send(SurfaceCommand::Load(url.clone()));
    }

    fn can_go_back(&self) -> bool {
        self.can_go_back.load(Ordering::SeqCst)
    }

    fn go_back(&self) {
        self.send(SurfaceCommand::GoBack);
    }

    fn stop(&self) {
        self.send(SurfaceCommand::Stop);
    }

    fn destroy(&self) {
        self.send(SurfaceCommand::Destroy);
    }
}

/// Embedded surface without a screen: QuickJS pages driven by the bridge.
///
/// The surface is single-threaded; call [`HeadlessSurface::pump`] to move
/// messages between the page and the bridge until both sides are idle.
pub struct HeadlessSurface {
    host_object: String,
    commands: mpsc::UnboundedReceiver<SurfaceCommand>,
    can_go_back: Arc<AtomicBool>,
    page: Option<HeadlessPage>,
    documents: Vec<Url>,
    paused: bool,
}

impl HeadlessSurface {
    pub fn new(config: &BridgeConfig) -> (Self, Arc<HeadlessTransport>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let can_go_back = Arc::new(AtomicBool::new(false));
        let transport = Arc::new(HeadlessTransport {
            commands: command_tx,
            can_go_back: Arc::clone(&can_go_back),
        });
        let surface = Self {
            host_object: config.host_object.clone(),
            commands: command_rx,
            can_go_back,
            page: None,
            documents: Vec::new(),
            paused: false,
        };
        (surface, transport)
    }

    pub fn page(&self) -> Option<&HeadlessPage> {
        self.page.as_ref()
    }

    /// Run page script, e.g. what a page author would ship.
    pub fn eval(&self, source: &str) -> Result<()> {
        self.current_page()?.eval(source, "overlay://page.js")
    }

    pub fn eval_with<V>(&self, source: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        self.current_page()?.eval_with(source, "overlay://page.js")
    }

    /// Exchange messages with `bridge` until neither side has work left.
    pub async fn pump(&mut self, bridge: &OverlayBridge) -> Result<()> {
        for _ in 0..MAX_PUMP_ROUNDS {
            let bridge_alive = match bridge.flush().await {
                Ok(()) => true,
                Err(BridgeError::Closed) => false,
                Err(err) => return Err(err.into()),
            };
            let mut progressed = self.apply_commands(bridge)?;
            if !bridge_alive {
                return Ok(());
            }
            if let Some(page) = self.page.as_ref().filter(|_| !self.paused) {
                progressed |= page.advance_timers(0)? > 0;
                progressed |= forward_output(page, bridge)?;
            }
            self.refresh_history();
            if !progressed {
                return Ok(());
            }
        }
        tracing::warn!(target: "bridge", "headless surface still busy after {} rounds", MAX_PUMP_ROUNDS);
        Ok(())
    }

    /// Let `ms` of page time pass, then pump.
    pub async fn advance(&mut self, bridge: &OverlayBridge, ms: u64) -> Result<()> {
        if let Some(page) = self.page.as_ref().filter(|_| !self.paused) {
            page.advance_timers(ms)?;
        }
        self.pump(bridge).await
    }

    /// Follow a link to another document, as a user would.
    pub async fn open_document(&mut self, bridge: &OverlayBridge, url: &str) -> Result<()> {
        let url = Url::parse(url)?;
        self.load(bridge, url, true)?;
        self.pump(bridge).await
    }

    fn apply_commands(&mut self, bridge: &OverlayBridge) -> Result<bool> {
        let mut progressed = false;
        while let Ok(command) = self.commands.try_recv() {
            progressed = true;
            match command {
                SurfaceCommand::Evaluate(script) => {
                    if let Some(page) = &self.page {
                        if let Err(err) = page.eval(&script, "overlay://host.js") {
                            tracing::warn!(target: "quickjs", url = %page.url(), error = %err, "host script failed");
                        }
                    }
                }
                SurfaceCommand::Load(url) => self.load(bridge, url, true)?,
                SurfaceCommand::GoBack => self.go_back(bridge)?,
                SurfaceCommand::Stop => self.paused = true,
                SurfaceCommand::Destroy => {
                    self.page = None;
                    self.documents.clear();
                }
            }
        }
        Ok(progressed)
    }

    fn load(&mut self, bridge: &OverlayBridge, url: Url, push: bool) -> Result<()> {
        // A closed bridge only means nobody is listening any more.
        let _ = bridge.navigation(NavigationSignal::LoadStarted {
            url: url.to_string(),
        });
        self.page = Some(HeadlessPage::open(&url, &self.host_object)?);
        self.paused = false;
        if push {
            self.documents.push(url.clone());
        }
        let _ = bridge.navigation(NavigationSignal::PageReady {
            url: Some(url.to_string()),
        });
        Ok(())
    }

    fn go_back(&mut self, bridge: &OverlayBridge) -> Result<()> {
        if let Some(page) = self.page.as_ref().filter(|page| page.can_go_back()) {
            return page.eval("history.back()", "overlay://back.js");
        }
        if self.documents.len() > 1 {
            self.documents.pop();
            if let Some(previous) = self.documents.last().cloned() {
                self.load(bridge, previous, false)?;
            }
        }
        Ok(())
    }

    fn refresh_history(&self) {
        let in_document = self.page.as_ref().map(HeadlessPage::can_go_back).unwrap_or(false);
        self.can_go_back
            .store(in_document || self.documents.len() > 1, Ordering::SeqCst);
    }

    fn current_page(&self) -> Result<&HeadlessPage> {
        self.page.as_ref().ok_or_else(|| anyhow!("no page loaded"))
    }
}

fn forward_output(page: &HeadlessPage, bridge: &OverlayBridge) -> Result<bool> {
    let output = page.take_output();
    let progressed = !output.is_empty();
    for item in output {
        match item {
            PageOutput::Message(raw) => bridge.post_message(raw)?,
            PageOutput::Location { href, source } => bridge.notify_location(href, &source)?,
        }
    }
    Ok(progressed)
}
