use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use super::{
    CapabilityDescriptor, CapabilityError, CapabilityProvider, ListenerSet, ListenerToken,
    ProviderListener,
};

pub static TTS_CAPABILITY: CapabilityDescriptor = CapabilityDescriptor {
    name: "tts",
    aliases: &["NativeTTS"],
    methods: &[
        "isAvailable",
        "getEngines",
        "getAvailableLanguages",
        "getVoices",
        "selectEngine",
        "speak",
        "stop",
        "setPitch",
        "setSpeechRate",
    ],
    events: &["state", "log"],
};

const MAX_LOG_ENTRIES: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineInfo {
    pub id: String,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceInfo {
    pub id: String,
    pub name: String,
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceState {
    Start,
    Done,
    Error,
}

impl UtteranceState {
    pub fn as_str(self) -> &'static str {
        match self {
            UtteranceState::Start => "start",
            UtteranceState::Done => "done",
            UtteranceState::Error => "error",
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(UtteranceState) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Utterance<'a> {
    pub id: String,
    pub text: &'a str,
    pub voice_id: Option<&'a str>,
    pub rate: f32,
    pub pitch: f32,
}

/// Platform speech synthesizer the speech capability drives.
pub trait SpeechEngine: Send + Sync {
    /// (Re)initialize, optionally pinned to `engine_id`. Returns readiness.
    fn initialize(&self, engine_id: Option<&str>, progress: ProgressCallback) -> bool;

    fn engines(&self) -> Vec<EngineInfo>;

    fn default_engine(&self) -> Option<String>;

    /// The engine's own report of which synthesizer is active, if it has one.
    fn current_engine(&self) -> Option<String> {
        None
    }

    /// System-wide configured synthesizer, consulted when the engine cannot say.
    fn configured_engine(&self) -> Option<String> {
        None
    }

    fn available_languages(&self) -> Vec<String>;

    fn current_language(&self) -> Option<String>;

    fn voices(&self) -> Vec<VoiceInfo>;

    fn apply_voice(&self, voice_id: &str) -> bool;

    fn speak(&self, utterance: &Utterance<'_>) -> Result<(), String>;

    /// Stop speaking; returns whether an utterance was interrupted.
    fn stop(&self) -> bool;

    fn set_pitch(&self, pitch: f32);

    fn set_speech_rate(&self, rate: f32);

    fn shutdown(&self) {}
}

/// Active engine id: engine accessor, then configured setting, then default.
pub fn resolve_current_engine(engine: &dyn SpeechEngine) -> Option<String> {
    let non_empty = |value: Option<String>| value.filter(|id| !id.trim().is_empty());
    non_empty(engine.current_engine())
        .or_else(|| non_empty(engine.configured_engine()))
        .or_else(|| non_empty(engine.default_engine()))
}

#[derive(Debug)]
struct TtsState {
    ready: bool,
    active_engine: Option<String>,
    pitch: f32,
    rate: f32,
}

/// Event fan-out and the bounded log journal, shared with engine callbacks.
#[derive(Clone, Default)]
struct Journal {
    listeners: ListenerSet,
    entries: Arc<Mutex<VecDeque<String>>>,
}

impl Journal {
    fn log(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(target: "tts", "{message}");
        {
            let mut entries = self.entries();
            if entries.len() >= MAX_LOG_ENTRIES {
                entries.pop_front();
            }
            entries.push_back(message.clone());
        }
        self.listeners.emit("log", &json!({ "message": message }));
    }

    fn state(&self, state: UtteranceState) {
        self.listeners.emit("state", &json!({ "state": state.as_str() }));
        self.log(format!("State: {}", state.as_str()));
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Speech synthesis capability exposed to page code.
pub struct TtsCapability {
    engine: Arc<dyn SpeechEngine>,
    state: Mutex<TtsState>,
    journal: Journal,
    default_locale: String,
}

impl TtsCapability {
    pub fn new(engine: Arc<dyn SpeechEngine>) -> Self {
        Self::with_default_locale(engine, "en-US")
    }

    pub fn with_default_locale(engine: Arc<dyn SpeechEngine>, default_locale: &str) -> Self {
        let capability = Self {
            engine,
            state: Mutex::new(TtsState {
                ready: false,
                active_engine: None,
                pitch: 1.0,
                rate: 1.0,
            }),
            journal: Journal::default(),
            default_locale: default_locale.to_string(),
        };
        capability.initialize(None);
        capability
    }

    pub fn is_ready(&self) -> bool {
        self.lock_state().ready
    }

    /// Snapshot of the log journal, oldest first.
    pub fn logs(&self) -> Vec<String> {
        self.journal.entries().iter().cloned().collect()
    }

    pub fn clear_logs(&self) {
        self.journal.entries().clear();
        self.journal.log("Logs cleared");
    }

    fn initialize(&self, engine_id: Option<&str>) {
        match engine_id {
            Some(id) => self.journal.log(format!("Initializing TTS with engine: {id}")),
            None => self.journal.log("Initializing TTS with default engine"),
        }
        self.engine.shutdown();

        let journal = self.journal.clone();
        let progress: ProgressCallback = Arc::new(move |state| journal.state(state));
        let ready = self.engine.initialize(engine_id, progress);

        let (pitch, rate) = {
            let mut state = self.lock_state();
            state.ready = ready;
            state.active_engine = engine_id.map(str::to_string);
            (state.pitch, state.rate)
        };
        self.engine.set_pitch(pitch);
        self.engine.set_speech_rate(rate);

        self.journal.log(format!(
            "TTS init status: {}",
            if ready { "SUCCESS" } else { "ERROR" }
        ));
        if ready {
            let active = resolve_current_engine(self.engine.as_ref());
            self.journal
                .log(format!("Active engine: {}", active.as_deref().unwrap_or("none")));
            self.lock_state().active_engine = active;
        }
    }

    fn current_engine(&self) -> Option<String> {
        if let Some(active) = self.lock_state().active_engine.clone() {
            return Some(active);
        }
        resolve_current_engine(self.engine.as_ref())
    }

    fn is_available(&self) -> JsonValue {
        json!({ "available": self.is_ready() })
    }

    fn get_engines(&self) -> JsonValue {
        let engines = self.engine.engines();
        self.journal
            .log(format!("Requested engines. count={}", engines.len()));
        let engines: Vec<JsonValue> = engines
            .into_iter()
            .map(|engine| {
                let label = engine.label.unwrap_or_else(|| engine.id.clone());
                json!({ "id": engine.id, "label": label })
            })
            .collect();
        json!({ "engines": engines, "currentEngine": self.current_engine() })
    }

    fn select_engine(&self, params: &JsonValue) -> Result<JsonValue, CapabilityError> {
        let engine_id = string_param(params, "engineId")
            .ok_or_else(|| CapabilityError::failed("engineId is required"))?;
        self.journal
            .log(format!("Engine selection requested: {engine_id}"));
        self.initialize(Some(&engine_id));
        Ok(json!({ "engineId": engine_id }))
    }

    fn get_available_languages(&self) -> JsonValue {
        let mut languages: Vec<String> = Vec::new();
        let mut push = |tag: String| {
            if !tag.is_empty() && !languages.contains(&tag) {
                languages.push(tag);
            }
        };
        self.engine.available_languages().into_iter().for_each(&mut push);
        if let Some(current) = self.engine.current_language() {
            push(current);
        }
        push(self.default_locale.clone());
        json!({ "languages": languages, "defaultLanguage": self.default_locale })
    }

    fn get_voices(&self) -> Result<JsonValue, CapabilityError> {
        if !self.is_ready() {
            self.journal.log("getVoices requested before engine ready");
            return Err(CapabilityError::failed("not_ready"));
        }
        let fallback_locale = self
            .engine
            .current_language()
            .unwrap_or_else(|| self.default_locale.clone());
        let mut voices = self.engine.voices();
        for voice in voices.iter_mut() {
            if voice.locale.is_none() {
                voice.locale = Some(fallback_locale.clone());
            }
        }
        if voices.is_empty() {
            voices.push(VoiceInfo {
                id: fallback_locale.clone(),
                name: fallback_locale.clone(),
                locale: Some(fallback_locale),
                quality: None,
                latency: None,
            });
        }
        self.journal
            .log(format!("Voices returned. count={}", voices.len()));
        Ok(json!({ "voices": voices }))
    }

    fn speak(&self, params: &JsonValue) -> Result<JsonValue, CapabilityError> {
        let text = string_param(params, "text")
            .ok_or_else(|| CapabilityError::failed("Text is required"))?;
        let voice_id = string_param(params, "voiceId");

        let (rate, pitch) = {
            let mut state = self.lock_state();
            if !state.ready {
                return Err(CapabilityError::failed("TextToSpeech engine not ready"));
            }
            state.rate = number_param(params, "rate").unwrap_or(state.rate);
            state.pitch = number_param(params, "pitch").unwrap_or(state.pitch);
            (state.rate, state.pitch)
        };

        self.journal.log(format!(
            "Speak request. chars={} rate={rate} pitch={pitch} voice={}",
            text.chars().count(),
            voice_id.as_deref().unwrap_or("default")
        ));

        if let Some(voice) = voice_id.as_deref() {
            if !self.engine.apply_voice(voice) {
                self.journal.log(format!("Voice not found: {voice}"));
            }
        }
        self.engine.set_speech_rate(rate);
        self.engine.set_pitch(pitch);

        let utterance = Utterance {
            id: Uuid::new_v4().to_string(),
            text: &text,
            voice_id: voice_id.as_deref(),
            rate,
            pitch,
        };
        self.engine.speak(&utterance).map_err(CapabilityError::Failed)?;
        Ok(json!({ "success": true }))
    }

    fn stop(&self) -> JsonValue {
        self.journal.log("Stop requested");
        if self.engine.stop() {
            self.journal.state(UtteranceState::Done);
        }
        json!({})
    }

    fn set_pitch(&self, params: &JsonValue) -> Result<JsonValue, CapabilityError> {
        let pitch = number_param(params, "pitch")
            .ok_or_else(|| CapabilityError::failed("pitch is required"))?;
        self.lock_state().pitch = pitch;
        self.engine.set_pitch(pitch);
        self.journal.log(format!("Pitch updated: {pitch}"));
        Ok(json!({}))
    }

    fn set_speech_rate(&self, params: &JsonValue) -> Result<JsonValue, CapabilityError> {
        let rate = number_param(params, "rate")
            .ok_or_else(|| CapabilityError::failed("rate is required"))?;
        self.lock_state().rate = rate;
        self.engine.set_speech_rate(rate);
        self.journal.log(format!("Speech rate updated: {rate}"));
        Ok(json!({}))
    }

    fn lock_state(&self) -> MutexGuard<'_, TtsState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CapabilityProvider for TtsCapability {
    fn descriptor(&self) -> &'static CapabilityDescriptor {
        &TTS_CAPABILITY
    }

    fn invoke(&self, method: &str, params: &JsonValue) -> Result<JsonValue, CapabilityError> {
        match method {
            "isAvailable" => Ok(self.is_available()),
            "getEngines" => Ok(self.get_engines()),
            "getAvailableLanguages" => Ok(self.get_available_languages()),
            "getVoices" => self.get_voices(),
            "selectEngine" => self.select_engine(params),
            "speak" => self.speak(params),
            "stop" => Ok(self.stop()),
            "setPitch" => self.set_pitch(params),
            "setSpeechRate" => self.set_speech_rate(params),
            other => Err(CapabilityError::UnknownMethod(other.to_string())),
        }
    }

    fn add_listener(&self, listener: ProviderListener) -> ListenerToken {
        self.journal.listeners.add(listener)
    }

    fn remove_listener(&self, token: ListenerToken) -> bool {
        self.journal.listeners.remove(token)
    }
}

impl Drop for TtsCapability {
    fn drop(&mut self) {
        self.engine.stop();
        self.engine.shutdown();
    }
}

fn string_param(params: &JsonValue, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn number_param(params: &JsonValue, key: &str) -> Option<f32> {
    params
        .get(key)
        .and_then(JsonValue::as_f64)
        .map(|value| value as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::HeadlessSpeechEngine;

    fn capability() -> (Arc<HeadlessSpeechEngine>, TtsCapability) {
        let engine = Arc::new(HeadlessSpeechEngine::new());
        let tts = TtsCapability::new(Arc::clone(&engine) as Arc<dyn SpeechEngine>);
        (engine, tts)
    }

    struct Probe {
        current: Option<&'static str>,
        configured: Option<&'static str>,
        default: Option<&'static str>,
    }

    impl SpeechEngine for Probe {
        fn initialize(&self, _: Option<&str>, _: ProgressCallback) -> bool {
            true
        }
        fn engines(&self) -> Vec<EngineInfo> {
            Vec::new()
        }
        fn default_engine(&self) -> Option<String> {
            self.default.map(str::to_string)
        }
        fn current_engine(&self) -> Option<String> {
            self.current.map(str::to_string)
        }
        fn configured_engine(&self) -> Option<String> {
            self.configured.map(str::to_string)
        }
        fn available_languages(&self) -> Vec<String> {
            Vec::new()
        }
        fn current_language(&self) -> Option<String> {
            None
        }
        fn voices(&self) -> Vec<VoiceInfo> {
            Vec::new()
        }
        fn apply_voice(&self, _: &str) -> bool {
            false
        }
        fn speak(&self, _: &Utterance<'_>) -> Result<(), String> {
            Ok(())
        }
        fn stop(&self) -> bool {
            false
        }
        fn set_pitch(&self, _: f32) {}
        fn set_speech_rate(&self, _: f32) {}
    }

    #[test]
    fn current_engine_probe_chain() {
        let probe = |current, configured, default| Probe {
            current,
            configured,
            default,
        };
        assert_eq!(
            resolve_current_engine(&probe(Some("a"), Some("b"), Some("c"))).as_deref(),
            Some("a")
        );
        assert_eq!(
            resolve_current_engine(&probe(Some(" "), Some("b"), Some("c"))).as_deref(),
            Some("b")
        );
        assert_eq!(
            resolve_current_engine(&probe(None, None, Some("c"))).as_deref(),
            Some("c")
        );
        assert_eq!(resolve_current_engine(&probe(None, None, None)), None);
    }

    #[test]
    fn select_engine_requires_engine_id() {
        let (_, tts) = capability();
        let err = tts.invoke("selectEngine", &json!({})).unwrap_err();
        assert_eq!(err.to_string(), "engineId is required");

        let result = tts
            .invoke("selectEngine", &json!({ "engineId": "headless.alt" }))
            .unwrap();
        assert_eq!(result, json!({ "engineId": "headless.alt" }));
        let engines = tts.invoke("getEngines", &json!({})).unwrap();
        assert_eq!(engines["currentEngine"], "headless.alt");
    }

    #[test]
    fn speak_validates_and_persists_rate() {
        let (engine, tts) = capability();
        assert_eq!(
            tts.invoke("speak", &json!({ "text": "  " }))
                .unwrap_err()
                .to_string(),
            "Text is required"
        );
        let result = tts
            .invoke("speak", &json!({ "text": "hi", "rate": 1.5 }))
            .unwrap();
        assert_eq!(result, json!({ "success": true }));
        assert_eq!(engine.spoken(), vec!["hi".to_string()]);
        assert_eq!(engine.rate(), 1.5);

        tts.invoke("speak", &json!({ "text": "again" })).unwrap();
        assert_eq!(engine.rate(), 1.5);
    }

    #[test]
    fn not_ready_engine_rejects_voices_and_speech() {
        let engine = Arc::new(HeadlessSpeechEngine::new().unavailable());
        let tts = TtsCapability::new(engine as Arc<dyn SpeechEngine>);
        assert_eq!(tts.invoke("isAvailable", &json!({})).unwrap(), json!({ "available": false }));
        assert_eq!(tts.invoke("getVoices", &json!({})).unwrap_err().to_string(), "not_ready");
        assert_eq!(
            tts.invoke("speak", &json!({ "text": "hi" }))
                .unwrap_err()
                .to_string(),
            "TextToSpeech engine not ready"
        );
    }

    #[test]
    fn pitch_and_rate_require_numbers() {
        let (engine, tts) = capability();
        assert_eq!(
            tts.invoke("setPitch", &json!({})).unwrap_err().to_string(),
            "pitch is required"
        );
        assert_eq!(
            tts.invoke("setSpeechRate", &json!({ "rate": "fast" }))
                .unwrap_err()
                .to_string(),
            "rate is required"
        );
        tts.invoke("setPitch", &json!({ "pitch": 0.5 })).unwrap();
        assert_eq!(engine.pitch(), 0.5);
    }

    #[test]
    fn languages_are_deduplicated_and_default_last() {
        let (_, tts) = capability();
        let languages = tts.invoke("getAvailableLanguages", &json!({})).unwrap();
        assert_eq!(languages["defaultLanguage"], "en-US");
        let list: Vec<String> = serde_json::from_value(languages["languages"].clone()).unwrap();
        let mut unique = list.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(list.len(), unique.len());
        assert!(list.contains(&"en-US".to_string()));
    }

    #[test]
    fn state_events_reach_listeners_and_journal() {
        let (engine, tts) = capability();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tts.add_listener(Arc::new(move |event: &str, data: &JsonValue| {
            if event == "state" {
                sink.lock().unwrap().push(data["state"].as_str().unwrap_or("").to_string());
            }
        }));

        tts.invoke("speak", &json!({ "text": "hello" })).unwrap();
        engine.emit_progress(UtteranceState::Error);

        assert_eq!(*seen.lock().unwrap(), vec!["start", "done", "error"]);
        assert!(tts.logs().iter().any(|entry| entry == "State: error"));
    }

    #[test]
    fn journal_is_bounded() {
        let (_, tts) = capability();
        for index in 0..(MAX_LOG_ENTRIES + 20) {
            tts.journal.log(format!("entry {index}"));
        }
        let logs = tts.logs();
        assert_eq!(logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(logs.last().unwrap(), &format!("entry {}", MAX_LOG_ENTRIES + 19));
        tts.clear_logs();
        assert_eq!(tts.logs(), vec!["Logs cleared".to_string()]);
    }

    #[test]
    fn undeclared_method_is_rejected() {
        let (_, tts) = capability();
        assert_eq!(
            tts.invoke("synthesizeToFile", &json!({})).unwrap_err(),
            CapabilityError::UnknownMethod("synthesizeToFile".into())
        );
    }
}
