use std::sync::{Mutex, MutexGuard};

use super::tts::{EngineInfo, ProgressCallback, SpeechEngine, Utterance, UtteranceState, VoiceInfo};

const DEFAULT_ENGINE: &str = "headless";

#[derive(Default)]
struct EngineState {
    progress: Option<ProgressCallback>,
    selected: Option<String>,
    spoken: Vec<String>,
    speaking: bool,
    pitch: f32,
    rate: f32,
}

/// Speech engine without audio output.
///
/// Utterances are written to the log and complete immediately, reporting
/// `start` then `done` through the progress callback.
pub struct HeadlessSpeechEngine {
    ready: bool,
    hold_utterances: bool,
    engines: Vec<EngineInfo>,
    voices: Vec<VoiceInfo>,
    languages: Vec<String>,
    state: Mutex<EngineState>,
}

impl Default for HeadlessSpeechEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessSpeechEngine {
    pub fn new() -> Self {
        Self {
            ready: true,
            hold_utterances: false,
            engines: vec![
                EngineInfo {
                    id: DEFAULT_ENGINE.into(),
                    label: Some("Headless".into()),
                },
                EngineInfo {
                    id: format!("{DEFAULT_ENGINE}.alt"),
                    label: None,
                },
            ],
            voices: vec![VoiceInfo {
                id: "headless-en".into(),
                name: "headless-en".into(),
                locale: Some("en-US".into()),
                quality: Some(300),
                latency: Some(300),
            }],
            languages: vec!["en-US".into(), "en-GB".into()],
            state: Mutex::new(EngineState {
                pitch: 1.0,
                rate: 1.0,
                ..EngineState::default()
            }),
        }
    }

    /// Engine that never finishes initializing.
    pub fn unavailable(mut self) -> Self {
        self.ready = false;
        self
    }

    /// Keep utterances "speaking" until `stop` or `emit_progress` ends them.
    pub fn holding_utterances(mut self) -> Self {
        self.hold_utterances = true;
        self
    }

    /// Report a progress transition as if the synthesizer produced it.
    pub fn emit_progress(&self, state: UtteranceState) {
        let progress = {
            let mut engine = self.lock();
            if state != UtteranceState::Start {
                engine.speaking = false;
            }
            engine.progress.clone()
        };
        if let Some(progress) = progress {
            progress(state);
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.lock().spoken.clone()
    }

    pub fn pitch(&self) -> f32 {
        self.lock().pitch
    }

    pub fn rate(&self) -> f32 {
        self.lock().rate
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SpeechEngine for HeadlessSpeechEngine {
    fn initialize(&self, engine_id: Option<&str>, progress: ProgressCallback) -> bool {
        let mut state = self.lock();
        state.progress = Some(progress);
        state.selected = engine_id.map(str::to_string);
        self.ready
    }

    fn engines(&self) -> Vec<EngineInfo> {
        self.engines.clone()
    }

    fn default_engine(&self) -> Option<String> {
        Some(DEFAULT_ENGINE.to_string())
    }

    fn current_engine(&self) -> Option<String> {
        self.lock().selected.clone()
    }

    fn available_languages(&self) -> Vec<String> {
        self.languages.clone()
    }

    fn current_language(&self) -> Option<String> {
        self.languages.first().cloned()
    }

    fn voices(&self) -> Vec<VoiceInfo> {
        self.voices.clone()
    }

    fn apply_voice(&self, voice_id: &str) -> bool {
        self.voices
            .iter()
            .any(|voice| voice.id.eq_ignore_ascii_case(voice_id))
    }

    fn speak(&self, utterance: &Utterance<'_>) -> Result<(), String> {
        if !self.ready {
            return Err("TextToSpeech engine not ready".into());
        }
        tracing::info!(
            target: "tts",
            utterance = %utterance.id,
            rate = utterance.rate,
            pitch = utterance.pitch,
            "speaking: {}",
            utterance.text
        );
        {
            let mut state = self.lock();
            state.spoken.push(utterance.text.to_string());
            state.speaking = true;
        }
        self.emit_progress(UtteranceState::Start);
        if !self.hold_utterances {
            self.emit_progress(UtteranceState::Done);
        }
        Ok(())
    }

    fn stop(&self) -> bool {
        let mut state = self.lock();
        std::mem::replace(&mut state.speaking, false)
    }

    fn set_pitch(&self, pitch: f32) {
        self.lock().pitch = pitch;
    }

    fn set_speech_rate(&self, rate: f32) {
        self.lock().rate = rate;
    }
}

impl std::fmt::Debug for HeadlessSpeechEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessSpeechEngine")
            .field("ready", &self.ready)
            .field("engines", &self.engines)
            .finish()
    }
}
