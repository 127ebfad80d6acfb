mod common;

use anyhow::Result;
use common::{Harness, WATCH_URL};
use overlay_bridge::capability::UtteranceState;
use overlay_bridge::{
    BridgeConfig, BridgeError, HeadlessSpeechEngine, OverlayEvent, PresentationMode, SurfaceState,
};

#[tokio::test]
async fn hide_rejects_pending_requests_and_notifies_once() -> Result<()> {
    let mut h = Harness::show_with(
        WATCH_URL,
        BridgeConfig::default(),
        HeadlessSpeechEngine::new().holding_utterances(),
    )
    .await?;
    h.eval(
        r#"
        globalThis.count = 0;
        __nativeOverlay.subscribe('tts', 'state', () => { count += 1; });
        "#,
    )?;
    h.pump().await?;
    h.take_events();

    // Still queued in the page when the overlay goes away.
    h.eval("track('pending', __nativeOverlay.invoke('tts', 'getVoices', {}))")?;
    h.bridge.hide()?;
    h.pump().await?;

    assert_eq!(h.outcome("pending")?.as_deref(), Some("err:overlay closed"));
    assert_eq!(h.take_events(), vec![OverlayEvent::Closed]);
    let status = h.status().await?;
    assert_eq!(status.state, SurfaceState::Hidden);
    assert_eq!(status.subscriptions, 0);
    assert_eq!(status.provider_listeners, 0);

    assert!(h.read::<bool>("__nativeOverlay.isClosed()")?);
    assert!(!h.read::<bool>(
        "__nativeOverlay.dispatch(__nativeOverlay.generation, { type: 'response', id: __nativeOverlay.generation + '-1', result: {} })"
    )?);
    assert_eq!(h.outcome("pending")?.as_deref(), Some("err:overlay closed"));
    assert!(!h.read::<bool>(
        "__nativeOverlay.dispatch(__nativeOverlay.generation, { type: 'event', plugin: 'tts', event: 'state', data: {} })"
    )?);
    h.eval("track('late', __nativeOverlay.invoke('tts', 'isAvailable', {}))")?;
    assert_eq!(h.outcome("late")?.as_deref(), Some("err:overlay closed"));

    h.engine.emit_progress(UtteranceState::Start);
    h.pump().await?;
    assert_eq!(h.read::<i32>("count")?, 0);

    h.bridge.hide()?;
    h.pump().await?;
    assert!(h.take_events().is_empty());
    Ok(())
}

#[tokio::test]
async fn reshow_uses_a_fresh_generation() -> Result<()> {
    let mut h = Harness::show(WATCH_URL).await?;
    let first = h.status().await?.generation;
    h.bridge.hide()?;
    h.pump().await?;
    h.take_events();

    h.reshow(WATCH_URL).await?;

    let status = h.status().await?;
    assert!(status.generation > first);
    assert_eq!(status.state, SurfaceState::Visible);
    assert_eq!(
        h.read::<f64>("__nativeOverlay.generation")? as u64,
        status.generation
    );
    // The tracker forgot the previous session, so the same url is reported again.
    assert_eq!(h.urls(), vec![WATCH_URL]);

    h.eval("track('speak', __nativeOverlay.invoke('tts', 'speak', { text: 'again' }))")?;
    h.pump().await?;
    assert_eq!(h.outcome("speak")?.as_deref(), Some(r#"ok:{"success":true}"#));
    Ok(())
}

#[tokio::test]
async fn show_while_visible_replaces_the_page() -> Result<()> {
    let mut h = Harness::show(WATCH_URL).await?;
    let first = h.status().await?.generation;
    // Queued by the old page, which is gone before it is delivered.
    h.eval("__nativeOverlay.invoke('tts', 'speak', { text: 'replaced' })")?;
    h.take_events();

    h.bridge
        .show("https://video.test/watch?v=9", PresentationMode::Minimal)
        .await?;
    h.pump().await?;

    let status = h.status().await?;
    assert!(status.generation > first);
    assert_eq!(status.mode, PresentationMode::Minimal);
    assert_eq!(status.location.as_deref(), Some("https://video.test/watch?v=9"));
    assert_eq!(
        h.urls(),
        vec!["https://video.test/watch?v=9".to_string()]
    );
    assert!(h.engine.spoken().is_empty());
    Ok(())
}

#[tokio::test]
async fn show_rejects_missing_or_invalid_urls() -> Result<()> {
    let h = Harness::show(WATCH_URL).await?;

    let err = h
        .bridge
        .show("", PresentationMode::Default)
        .await
        .expect_err("empty url");
    assert_eq!(err.to_string(), "url is required");

    let err = h
        .bridge
        .show("   ", PresentationMode::Default)
        .await
        .expect_err("blank url");
    assert_eq!(err.to_string(), "url is required");

    assert!(h
        .bridge
        .show("not a url", PresentationMode::Default)
        .await
        .is_err());

    // A rejected show leaves the current page alone.
    let status = h.status().await?;
    assert_eq!(status.state, SurfaceState::Visible);
    assert_eq!(status.location.as_deref(), Some(WATCH_URL));
    Ok(())
}

#[tokio::test]
async fn destroy_is_terminal_and_silent() -> Result<()> {
    let mut h = Harness::show_with(
        WATCH_URL,
        BridgeConfig::default(),
        HeadlessSpeechEngine::new().holding_utterances(),
    )
    .await?;
    h.eval("__nativeOverlay.subscribe('tts', 'state', () => {});")?;
    h.pump().await?;
    h.take_events();

    h.bridge.destroy()?;
    h.pump().await?;

    assert!(matches!(h.bridge.flush().await, Err(BridgeError::Closed)));
    assert!(matches!(h.bridge.hide(), Err(BridgeError::Closed)));
    assert!(h.surface.page().is_none());
    assert!(!h.take_events().contains(&OverlayEvent::Closed));

    // Provider callbacks after teardown go nowhere.
    h.engine.emit_progress(UtteranceState::Start);
    Ok(())
}

#[tokio::test]
async fn hidden_overlay_ignores_page_traffic() -> Result<()> {
    let mut h = Harness::show(WATCH_URL).await?;
    h.bridge.hide()?;
    h.pump().await?;
    h.take_events();

    h.bridge.post_message(
        r#"{"type":"request","id":"99-1","plugin":"tts","method":"speak","params":{"text":"ghost"}}"#,
    )?;
    h.bridge
        .notify_location("https://video.test/elsewhere", "poll")?;
    h.bridge.flush().await?;

    assert!(h.engine.spoken().is_empty());
    assert!(h.take_events().is_empty());
    Ok(())
}
