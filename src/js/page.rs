use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::{Context as AnyhowContext, Result};
use rquickjs::function::Opt;
use rquickjs::{Ctx, Function, Value};
use serde::Serialize;
use url::Url;

use super::runtime::QuickJsEngine;
use super::timers::TimerQueue;

const MAX_TIMER_FIRES: usize = 10_000;

/// Output the page produced through its host object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutput {
    /// `postMessage(string)`
    Message(String),
    /// `notifyLocation(href, source)`
    Location { href: String, source: String },
}

#[derive(Serialize)]
struct PageConfig<'a> {
    url: &'a str,
    host: &'a str,
}

/// One loaded document in a QuickJS context.
///
/// The page carries a small browser shim (`window`, `location`, `history`,
/// `document.body`, `MutationObserver`, timers) and a host object whose
/// calls are queued for the embedder to collect with [`HeadlessPage::take_output`].
pub struct HeadlessPage {
    engine: QuickJsEngine,
    url: Url,
    output: Rc<RefCell<VecDeque<PageOutput>>>,
    timers: Rc<RefCell<TimerQueue>>,
}

impl HeadlessPage {
    pub fn open(url: &Url, host_object: &str) -> Result<Self> {
        let engine = QuickJsEngine::new()?;
        let page = Self {
            engine,
            url: url.clone(),
            output: Rc::new(RefCell::new(VecDeque::new())),
            timers: Rc::new(RefCell::new(TimerQueue::new())),
        };
        page.install_host_bindings()
            .context("failed to install page host bindings")?;

        let config = serde_json::to_string(&PageConfig {
            url: url.as_str(),
            host: host_object,
        })?;
        page.engine
            .eval(&PAGE_SHIM.replace("__PAGE__", &config), "overlay://page-shim.js")
            .context("failed to bootstrap page shim")?;
        tracing::debug!(target: "quickjs", %url, "page opened");
        Ok(page)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn eval(&self, source: &str, filename: &str) -> Result<()> {
        self.engine.eval(source, filename)
    }

    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        self.engine.eval_with(source, filename)
    }

    /// Current `location.href` inside the page.
    pub fn location(&self) -> Result<String> {
        self.eval_with("String(window.location.href)", "overlay://location.js")
    }

    /// Whether in-document history can go back.
    pub fn can_go_back(&self) -> bool {
        self.eval_with::<bool>("window.history.__canGoBack()", "overlay://history.js")
            .unwrap_or(false)
    }

    pub fn take_output(&self) -> Vec<PageOutput> {
        self.output.borrow_mut().drain(..).collect()
    }

    pub fn has_pending_timers(&self) -> bool {
        self.timers.borrow().has_pending()
    }

    /// Advance the virtual clock by `ms`, firing every timer that comes due.
    pub fn advance_timers(&self, ms: u64) -> Result<usize> {
        let deadline = self.timers.borrow().now() + ms;
        let mut fired = 0;
        loop {
            let next = self.timers.borrow_mut().next_due(deadline);
            let Some(id) = next else {
                break;
            };
            self.fire_timer(id)?;
            fired += 1;
            if fired >= MAX_TIMER_FIRES {
                tracing::warn!(target: "quickjs", "stopped firing timers after {} callbacks", MAX_TIMER_FIRES);
                break;
            }
        }
        self.timers.borrow_mut().settle_at(deadline);
        Ok(fired)
    }

    fn fire_timer(&self, id: u32) -> Result<()> {
        self.engine.with_context(|ctx| {
            let fire: Function = ctx.globals().get("__overlay_fire_timer")?;
            fire.call::<_, ()>((id,))
        })?;
        self.engine.drain_jobs()?;
        Ok(())
    }

    fn install_host_bindings(&self) -> Result<()> {
        let output = Rc::clone(&self.output);
        let timers = Rc::clone(&self.timers);
        self.engine.with_context(move |ctx| {
            let global = ctx.globals();

            {
                let output = Rc::clone(&output);
                let func = Function::new(ctx.clone(), move |message: String| -> rquickjs::Result<()> {
                    output.borrow_mut().push_back(PageOutput::Message(message));
                    Ok(())
                })?
                .with_name("__overlay_host_post")?;
                global.set("__overlay_host_post", func)?;
            }

            {
                let output = Rc::clone(&output);
                let func = Function::new(ctx.clone(), move |href: String, source: Opt<String>| -> rquickjs::Result<()> {
                    output.borrow_mut().push_back(PageOutput::Location {
                        href,
                        source: source.0.unwrap_or_default(),
                    });
                    Ok(())
                })?
                .with_name("__overlay_host_location")?;
                global.set("__overlay_host_location", func)?;
            }

            {
                let timers = Rc::clone(&timers);
                let func = Function::new(
                    ctx.clone(),
                    move |delay: Opt<f64>, repeating: Opt<bool>| -> rquickjs::Result<u32> {
                        Ok(timers
                            .borrow_mut()
                            .schedule(delay.0.unwrap_or(0.0), repeating.0.unwrap_or(false)))
                    },
                )?
                .with_name("__overlay_schedule_timer")?;
                global.set("__overlay_schedule_timer", func)?;
            }

            {
                let timers = Rc::clone(&timers);
                let func = Function::new(ctx.clone(), move |_ctx: Ctx<'_>, id: Value<'_>| -> rquickjs::Result<()> {
                    if let Some(id) = id.as_int() {
                        timers.borrow_mut().clear(id as u32);
                    }
                    Ok(())
                })?
                .with_name("__overlay_cancel_timer")?;
                global.set("__overlay_cancel_timer", func)?;
            }

            Ok(())
        })
    }
}

impl Drop for HeadlessPage {
    fn drop(&mut self) {
        self.timers.borrow_mut().clear_all();
    }
}

const PAGE_SHIM: &str = r#"
(function (page) {
    'use strict';
    var global = globalThis;
    global.window = global;

    function makeEventTarget(target) {
        var registry = {};
        target.addEventListener = function (type, listener) {
            if (typeof listener !== 'function') {
                return;
            }
            var list = registry[type] || (registry[type] = []);
            if (list.indexOf(listener) < 0) {
                list.push(listener);
            }
        };
        target.removeEventListener = function (type, listener) {
            var list = registry[type];
            if (list) {
                var index = list.indexOf(listener);
                if (index >= 0) {
                    list.splice(index, 1);
                }
            }
        };
        target.dispatchEvent = function (event) {
            var list = (registry[event.type] || []).slice();
            list.forEach(function (listener) {
                try {
                    listener.call(target, event);
                } catch (err) {
                    console.error('event listener failed', err && err.message ? err.message : String(err));
                }
            });
            return true;
        };
        return target;
    }

    global.Event = function Event(type, init) {
        this.type = type;
        this.detail = init && init.detail;
    };
    global.CustomEvent = global.Event;

    // Timers run on the embedder's virtual clock.
    var timerStore = new Map();
    function scheduleTimer(callback, delay, repeating, args) {
        if (typeof callback !== 'function') {
            throw new TypeError('Timer callback must be a function');
        }
        var id = __overlay_schedule_timer(Number(delay) || 0, repeating);
        timerStore.set(id, { callback: callback, args: args, repeating: repeating });
        return id;
    }
    function cancelTimer(id) {
        if (timerStore.delete(id)) {
            __overlay_cancel_timer(id);
        }
    }
    global.__overlay_fire_timer = function (id) {
        var entry = timerStore.get(id);
        if (!entry) {
            return;
        }
        if (!entry.repeating) {
            timerStore.delete(id);
        }
        try {
            entry.callback.apply(global, entry.args);
        } catch (err) {
            console.error('timer callback failed', err && err.message ? err.message : String(err));
        }
    };
    global.setTimeout = function (callback, delay) {
        return scheduleTimer(callback, delay, false, Array.prototype.slice.call(arguments, 2));
    };
    global.setInterval = function (callback, delay) {
        return scheduleTimer(callback, delay, true, Array.prototype.slice.call(arguments, 2));
    };
    global.clearTimeout = cancelTimer;
    global.clearInterval = cancelTimer;

    function originOf(href) {
        var match = /^([a-zA-Z][a-zA-Z0-9+.-]*:\/\/[^\/?#]*)/.exec(href);
        return match ? match[1] : '';
    }
    function withoutHash(href) {
        var index = href.indexOf('#');
        return index < 0 ? href : href.slice(0, index);
    }
    function resolve(target) {
        target = String(target);
        var current = entries[index].url;
        if (/^[a-zA-Z][a-zA-Z0-9+.-]*:/.test(target)) {
            return target;
        }
        if (target.charAt(0) === '#') {
            return withoutHash(current) + target;
        }
        if (target.charAt(0) === '?') {
            return current.split(/[?#]/)[0] + target;
        }
        if (target.charAt(0) === '/') {
            return originOf(current) + target;
        }
        var base = current.split(/[?#]/)[0];
        return base.slice(0, base.lastIndexOf('/') + 1) + target;
    }

    var entries = [{ url: page.url, state: null }];
    var index = 0;

    makeEventTarget(global);

    global.location = {
        get href() {
            return entries[index].url;
        },
        get hash() {
            var href = entries[index].url;
            var at = href.indexOf('#');
            return at < 0 ? '' : href.slice(at);
        },
        set hash(value) {
            var hash = String(value);
            if (hash && hash.charAt(0) !== '#') {
                hash = '#' + hash;
            }
            entries.splice(index + 1);
            entries.push({ url: withoutHash(entries[index].url) + hash, state: null });
            index = entries.length - 1;
            setTimeout(function () {
                global.dispatchEvent(new Event('hashchange'));
            }, 0);
        },
        toString: function () {
            return entries[index].url;
        }
    };

    global.history = {
        get length() {
            return entries.length;
        },
        get state() {
            return entries[index].state;
        },
        pushState: function (state, title, url) {
            var next = url === undefined || url === null ? entries[index].url : resolve(url);
            entries.splice(index + 1);
            entries.push({ url: next, state: state === undefined ? null : state });
            index = entries.length - 1;
        },
        replaceState: function (state, title, url) {
            var next = url === undefined || url === null ? entries[index].url : resolve(url);
            entries[index] = { url: next, state: state === undefined ? null : state };
        },
        back: function () {
            if (index === 0) {
                return;
            }
            index -= 1;
            var state = entries[index].state;
            setTimeout(function () {
                var event = new Event('popstate');
                event.state = state;
                global.dispatchEvent(event);
            }, 0);
        },
        __canGoBack: function () {
            return index > 0;
        }
    };

    var observers = [];
    global.MutationObserver = function MutationObserver(callback) {
        this.callback = callback;
        this.active = false;
    };
    global.MutationObserver.prototype.observe = function () {
        if (!this.active) {
            this.active = true;
            observers.push(this);
        }
    };
    global.MutationObserver.prototype.disconnect = function () {
        this.active = false;
        var at = observers.indexOf(this);
        if (at >= 0) {
            observers.splice(at, 1);
        }
    };
    function notifyMutation(records) {
        observers.slice().forEach(function (observer) {
            Promise.resolve().then(function () {
                if (observer.active) {
                    observer.callback(records, observer);
                }
            });
        });
    }

    function makeElement(tagName) {
        var element = { tagName: String(tagName).toUpperCase(), childNodes: [], textContent: '' };
        element.appendChild = function (child) {
            element.childNodes.push(child);
            notifyMutation([{ type: 'childList', target: element, addedNodes: [child] }]);
            return child;
        };
        element.removeChild = function (child) {
            var at = element.childNodes.indexOf(child);
            if (at >= 0) {
                element.childNodes.splice(at, 1);
                notifyMutation([{ type: 'childList', target: element, removedNodes: [child] }]);
            }
            return child;
        };
        return element;
    }

    global.document = makeEventTarget({
        readyState: 'complete',
        title: '',
        body: makeElement('body'),
        createElement: makeElement
    });
    Object.defineProperty(global.document, 'location', {
        get: function () {
            return global.location;
        }
    });

    global[page.host] = Object.freeze({
        postMessage: function (message) {
            __overlay_host_post(String(message));
        },
        notifyLocation: function (href, source) {
            __overlay_host_location(String(href), source === undefined ? '' : String(source));
        }
    });
})(__PAGE__);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn open(url: &str) -> HeadlessPage {
        HeadlessPage::open(&Url::parse(url).unwrap(), "NativeOverlayBridge").unwrap()
    }

    #[test]
    fn host_object_queues_output() {
        let page = open("https://example.test/");
        page.eval(
            "NativeOverlayBridge.postMessage('{}'); NativeOverlayBridge.notifyLocation(location.href, 'initial');",
            "host.js",
        )
        .unwrap();
        assert_eq!(
            page.take_output(),
            vec![
                PageOutput::Message("{}".into()),
                PageOutput::Location {
                    href: "https://example.test/".into(),
                    source: "initial".into()
                }
            ]
        );
        assert!(page.take_output().is_empty());
    }

    #[test]
    fn history_resolves_relative_urls() {
        let page = open("https://example.test/watch?v=1");
        page.eval("history.pushState({}, '', '/shorts/2')", "push.js").unwrap();
        assert_eq!(page.location().unwrap(), "https://example.test/shorts/2");
        page.eval("history.replaceState(null, '', '#t=3')", "replace.js").unwrap();
        assert_eq!(page.location().unwrap(), "https://example.test/shorts/2#t=3");
        assert!(page.can_go_back());

        page.eval(
            "globalThis.popped = 0; addEventListener('popstate', () => { popped += 1; }); history.back();",
            "back.js",
        )
        .unwrap();
        assert_eq!(page.location().unwrap(), "https://example.test/watch?v=1");
        page.advance_timers(0).unwrap();
        assert_eq!(page.eval_with::<i32>("popped", "read.js").unwrap(), 1);
        assert!(!page.can_go_back());
    }

    #[test]
    fn timers_follow_the_virtual_clock() {
        let page = open("about:blank");
        page.eval(
            "globalThis.ticks = []; setTimeout(() => ticks.push('once'), 100); const poll = setInterval(() => ticks.push('poll'), 40);",
            "timers.js",
        )
        .unwrap();
        page.advance_timers(99).unwrap();
        assert_eq!(page.eval_with::<String>("ticks.join()", "read.js").unwrap(), "poll,poll");
        page.advance_timers(1).unwrap();
        page.eval("clearInterval(poll)", "clear.js").unwrap();
        page.advance_timers(1_000).unwrap();
        assert_eq!(
            page.eval_with::<String>("ticks.join()", "read.js").unwrap(),
            "poll,poll,once"
        );
        assert!(!page.has_pending_timers());
    }
}
