use serde::Serialize;

use crate::capability::CapabilityDescriptor;
use crate::config::BridgeConfig;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeConfig<'a> {
    global: &'a str,
    host: &'a str,
    generation: u64,
    platform: &'a str,
    timeout_ms: Option<u64>,
    capabilities: &'a [&'static CapabilityDescriptor],
}

/// Script that installs the in-page runtime for `generation`.
///
/// Injecting into a page that still holds a runtime from an older
/// generation retires it first; injecting the same generation twice is a
/// no-op.
pub fn runtime_script(
    config: &BridgeConfig,
    generation: u64,
    capabilities: &[&'static CapabilityDescriptor],
) -> String {
    let runtime_config = RuntimeConfig {
        global: &config.runtime_global,
        host: &config.host_object,
        generation,
        platform: &config.platform,
        timeout_ms: config.request_timeout_ms.filter(|ms| *ms > 0),
        capabilities,
    };
    let json = serde_json::to_string(&runtime_config)
        .unwrap_or_else(|_| String::from("null"))
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029");
    RUNTIME_TEMPLATE.replace("__CONFIG__", &json)
}

const RUNTIME_TEMPLATE: &str = r#"
(function (config) {
    'use strict';
    if (!config) {
        return;
    }
    var root = typeof window !== 'undefined' ? window : globalThis;
    var previous = root[config.global];
    if (previous && typeof previous.retire === 'function') {
        if (previous.generation === config.generation) {
            return;
        }
        previous.retire('request orphaned by navigation');
    }

    var generation = config.generation;
    var closed = false;
    var nextRequest = 0;
    var nextListener = 0;
    var pending = new Map();
    var listeners = new Map();
    var byId = new Map();
    var descriptors = {};

    config.capabilities.forEach(function (descriptor) {
        descriptors[descriptor.name] = descriptor;
        descriptor.aliases.forEach(function (alias) {
            descriptors[alias] = descriptor;
        });
    });

    function host() {
        var target = root[config.host];
        return target && typeof target.postMessage === 'function' ? target : null;
    }

    function post(message) {
        var target = host();
        if (!target) {
            return false;
        }
        try {
            target.postMessage(JSON.stringify(message));
            return true;
        } catch (err) {
            console.warn('[overlay] post failed', err && err.message ? err.message : String(err));
            return false;
        }
    }

    // Aliases share one listener table with their capability.
    function keyOf(capability, event) {
        var descriptor = descriptors[capability];
        return (descriptor ? descriptor.name : capability) + ':' + event;
    }

    function settle(id) {
        var entry = pending.get(id);
        if (!entry) {
            return null;
        }
        pending.delete(id);
        if (entry.timer !== null) {
            clearTimeout(entry.timer);
        }
        return entry;
    }

    function invoke(capability, method, params) {
        return new Promise(function (resolve, reject) {
            if (closed) {
                reject(new Error('overlay closed'));
                return;
            }
            if (!host()) {
                reject(new Error('native bridge unavailable'));
                return;
            }
            var id = generation + '-' + (++nextRequest);
            var entry = { resolve: resolve, reject: reject, timer: null };
            pending.set(id, entry);
            if (config.timeoutMs) {
                entry.timer = setTimeout(function () {
                    var expired = settle(id);
                    if (expired) {
                        expired.reject(new Error('request timed out'));
                    }
                }, config.timeoutMs);
            }
            var message = { type: 'request', id: id, plugin: capability, method: method, params: params || {} };
            if (!post(message) && settle(id)) {
                reject(new Error('native bridge unavailable'));
            }
        });
    }

    function release(entry) {
        if (!entry.active) {
            return;
        }
        entry.active = false;
        byId.delete(entry.id);
        var entries = listeners.get(entry.key);
        if (entries) {
            var index = entries.indexOf(entry);
            if (index >= 0) {
                entries.splice(index, 1);
            }
            if (entries.length === 0) {
                listeners.delete(entry.key);
            }
        }
        if (!closed) {
            post({ type: 'removeListener', listenerId: entry.id });
        }
    }

    function subscribe(capability, event, callback) {
        if (typeof callback !== 'function') {
            throw new TypeError('listener callback must be a function');
        }
        var key = keyOf(capability, event);
        var entries = listeners.get(key) || [];
        for (var i = 0; i < entries.length; i++) {
            if (entries[i].callback === callback) {
                return entries[i].handle;
            }
        }

        var entry = {
            id: 'L' + generation + '-' + (++nextListener),
            key: key,
            callback: callback,
            active: !closed,
            handle: null
        };
        entry.handle = Object.freeze({
            listenerId: entry.id,
            unsubscribe: function () {
                release(entry);
            },
            remove: function () {
                release(entry);
                return Promise.resolve();
            }
        });
        if (!entry.active) {
            return entry.handle;
        }
        if (!post({ type: 'addListener', plugin: capability, event: event, listenerId: entry.id })) {
            throw new Error('native bridge unavailable');
        }
        entries.push(entry);
        listeners.set(key, entries);
        byId.set(entry.id, entry);
        return entry.handle;
    }

    function deliver(message) {
        var entries = listeners.get(keyOf(message.plugin, message.event));
        if (!entries) {
            return false;
        }
        var data = message.data === undefined || message.data === null ? {} : message.data;
        entries.slice().forEach(function (entry) {
            if (!entry.active) {
                return;
            }
            try {
                entry.callback(data);
            } catch (err) {
                console.error('[overlay] listener failed', err && err.message ? err.message : String(err));
            }
        });
        return true;
    }

    function dispatch(targetGeneration, message) {
        if (closed || targetGeneration !== generation) {
            return false;
        }
        if (typeof message === 'string') {
            try {
                message = JSON.parse(message);
            } catch (err) {
                return false;
            }
        }
        if (!message || typeof message !== 'object') {
            return false;
        }
        switch (message.type) {
            case 'response': {
                var entry = settle(message.id);
                if (!entry) {
                    return false;
                }
                if (message.error) {
                    entry.reject(new Error(message.error.message || String(message.error)));
                } else {
                    entry.resolve(message.result === undefined ? {} : message.result);
                }
                return true;
            }
            case 'event':
                return deliver(message);
            case 'log':
                console.log('[native]', message.message);
                return true;
            default:
                return false;
        }
    }

    function teardown(reason) {
        if (closed) {
            return;
        }
        closed = true;
        var orphaned = Array.from(pending.values());
        pending.clear();
        orphaned.forEach(function (entry) {
            if (entry.timer !== null) {
                clearTimeout(entry.timer);
            }
            entry.reject(new Error(reason));
        });
        byId.forEach(function (entry) {
            entry.active = false;
        });
        byId.clear();
        listeners.clear();
    }

    function close(targetGeneration, reason) {
        if (targetGeneration !== generation) {
            return false;
        }
        teardown(reason || 'overlay closed');
        return true;
    }

    function capabilityObject(name, descriptor) {
        var plugin = {};
        descriptor.methods.forEach(function (method) {
            plugin[method] = function (params) {
                return invoke(name, method, params || {});
            };
        });
        plugin.addListener = function (event, callback) {
            if (descriptor.events.indexOf(event) < 0) {
                return Promise.reject(new Error('Unsupported event ' + event));
            }
            var handle;
            try {
                handle = subscribe(name, event, callback);
            } catch (err) {
                return Promise.reject(err);
            }
            var result = Promise.resolve(handle);
            result.listenerId = handle.listenerId;
            result.unsubscribe = handle.unsubscribe;
            result.remove = handle.remove;
            return result;
        };
        return Object.freeze(plugin);
    }

    var capacitor = root.Capacitor || {};
    capacitor.getPlatform = function () {
        return config.platform;
    };
    capacitor.isNativePlatform = function () {
        return true;
    };
    capacitor.Plugins = capacitor.Plugins || {};
    capacitor.nativePromise = function (capability, method, options) {
        return invoke(capability, method, options || {});
    };
    capacitor.nativeCallback = function (capability, method, options, callback) {
        if (method === 'addListener') {
            var event = options && options.eventName;
            if (!event || typeof callback !== 'function') {
                return Promise.reject(new Error('addListener requires eventName and callback'));
            }
            try {
                return Promise.resolve(subscribe(capability, event, callback));
            } catch (err) {
                return Promise.reject(err);
            }
        }
        return invoke(capability, method, options || {}).then(function (result) {
            if (typeof callback === 'function') {
                callback(result);
            }
            return result;
        });
    };
    Object.keys(descriptors).forEach(function (name) {
        capacitor.Plugins[name] = capabilityObject(name, descriptors[name]);
    });
    root.Capacitor = capacitor;
    root.CapacitorPlugins = capacitor.Plugins;

    root[config.global] = Object.freeze({
        generation: generation,
        invoke: invoke,
        subscribe: subscribe,
        dispatch: dispatch,
        close: close,
        retire: teardown,
        isClosed: function () {
            return closed;
        },
        pendingCount: function () {
            return pending.size;
        },
        listenerCount: function () {
            return byId.size;
        }
    });
    console.debug('[overlay] runtime ready, generation ' + generation);
})(__CONFIG__);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::TTS_CAPABILITY;

    #[test]
    fn embeds_generation_and_method_table() {
        let script = runtime_script(&BridgeConfig::default(), 7, &[&TTS_CAPABILITY]);
        assert!(!script.contains("__CONFIG__"));
        assert!(script.contains(r#""generation":7"#));
        assert!(script.contains(r#""global":"__nativeOverlay""#));
        assert!(script.contains(r#""aliases":["NativeTTS"]"#));
        assert!(script.contains(r#""timeoutMs":null"#));
    }
}
