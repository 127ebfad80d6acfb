use serde::Serialize;

use crate::config::BridgeConfig;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TrackingConfig<'a> {
    host: &'a str,
    marker: String,
    poll_interval_ms: u64,
    custom_events: &'a [String],
}

/// Script that reports the page location to the host whenever any of the
/// navigation signals fire.
///
/// Signals: history `pushState`/`replaceState`, `popstate`, `hashchange`,
/// configured app events on `window` and `document`, body mutations, a
/// polling interval and one initial report. Reports carry their source and
/// are deduplicated in the page before crossing the bridge.
pub fn tracking_script(config: &BridgeConfig) -> String {
    let tracking_config = TrackingConfig {
        host: &config.host_object,
        marker: format!("{}Tracking", config.runtime_global),
        poll_interval_ms: config.poll_interval_ms,
        custom_events: &config.custom_navigation_events,
    };
    let json = serde_json::to_string(&tracking_config)
        .unwrap_or_else(|_| String::from("null"))
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029");
    TRACKING_TEMPLATE.replace("__CONFIG__", &json)
}

const TRACKING_TEMPLATE: &str = r#"
(function (config) {
    'use strict';
    if (!config) {
        return;
    }
    var root = typeof window !== 'undefined' ? window : globalThis;
    if (root[config.marker]) {
        return;
    }
    root[config.marker] = true;

    var lastHref = '';

    function notify(href, source) {
        var host = root[config.host];
        if (!host || typeof host.notifyLocation !== 'function') {
            return;
        }
        try {
            host.notifyLocation(href, source);
        } catch (err) {
            // the host may be gone
        }
    }

    function trigger(source) {
        var href = String(root.location && root.location.href || '');
        if (!href || href === lastHref) {
            return;
        }
        lastHref = href;
        notify(href, source);
    }

    function wrap(method) {
        var history = root.history;
        var original = history && history[method];
        if (typeof original !== 'function') {
            return;
        }
        history[method] = function () {
            var result = original.apply(this, arguments);
            setTimeout(function () {
                trigger('history');
            }, 0);
            return result;
        };
    }

    function listen(target, event, source) {
        if (target && typeof target.addEventListener === 'function') {
            target.addEventListener(event, function () {
                trigger(source);
            }, true);
        }
    }

    wrap('pushState');
    wrap('replaceState');
    listen(root, 'popstate', 'popstate');
    listen(root, 'hashchange', 'hashchange');
    config.customEvents.forEach(function (event) {
        listen(root, event, event);
        listen(root.document, event, event);
    });

    if (typeof MutationObserver === 'function' && root.document && root.document.body) {
        var observer = new MutationObserver(function () {
            trigger('mutation');
        });
        observer.observe(root.document.body, { childList: true, subtree: true });
    }
    if (config.pollIntervalMs > 0) {
        setInterval(function () {
            trigger('poll');
        }, config.pollIntervalMs);
    }
    trigger('initial');
})(__CONFIG__);
"#;
