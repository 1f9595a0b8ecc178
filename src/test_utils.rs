//! Shared test doubles for the capability seams.
//!
//! Drivable fakes for STT, VAD, LLM, and TTS used by the session unit
//! tests and the end-to-end scenarios in `tests/`. Not part of the public
//! API surface.
#![doc(hidden)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioFrame;
use crate::chat::{ChatRole, FunctionCall};
use crate::config::ConnOptions;
use crate::error::Result;
use crate::llm::{ChatChunk, ChatRequest, ChoiceDelta, Llm, LlmCapabilities, LlmStream};
use crate::stt::{
    SpeechData, SpeechEvent, SpeechEventType, Stt, SttCapabilities, SttOptions, SttStream,
};
use crate::sync::chan::{stream_channel, stream_channel_with_capacity};
use crate::tts::{SynthesizedAudio, Tts, TtsCapabilities, TtsInput, TtsStream};
use crate::vad::{Vad, VadEvent, VadEventType, VadStream};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── STT ───────────────────────────────────────────────────────

/// Drivable STT fake: emit events at will from the test body.
pub struct FakeStt {
    streams: Mutex<Vec<mpsc::UnboundedSender<Result<SpeechEvent>>>>,
}

impl FakeStt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(Vec::new()),
        })
    }

    pub fn emit(&self, event: SpeechEvent) {
        lock(&self.streams).retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    pub fn emit_text(&self, event_type: SpeechEventType, text: &str) {
        self.emit(SpeechEvent {
            event_type,
            request_id: "fake".into(),
            alternatives: vec![SpeechData {
                text: text.into(),
                confidence: 0.95,
                ..SpeechData::default()
            }],
        });
    }

    pub fn emit_final(&self, text: &str) {
        self.emit_text(SpeechEventType::FinalTranscript, text);
    }

    pub fn emit_interim(&self, text: &str) {
        self.emit_text(SpeechEventType::InterimTranscript, text);
    }

    pub fn emit_preflight(&self, text: &str) {
        self.emit_text(SpeechEventType::PreflightTranscript, text);
    }
}

#[async_trait]
impl Stt for FakeStt {
    fn label(&self) -> &str {
        "fake-stt"
    }
    fn capabilities(&self) -> SttCapabilities {
        SttCapabilities {
            streaming: true,
            interim_results: true,
            preflight_transcripts: true,
            aligned_transcript: false,
        }
    }
    async fn stream(&self, _options: SttOptions) -> Result<SttStream> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        lock(&self.streams).push(event_tx);
        let (input, mut input_rx) = stream_channel();
        let (mut out_tx, events) = stream_channel_with_capacity(64);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = event_rx.recv() => match ev {
                        Some(ev) => {
                            if out_tx.write(ev).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    frame = input_rx.recv() => {
                        if frame.is_none() {
                            break;
                        }
                    }
                }
            }
            out_tx.close();
        });
        Ok(SttStream { input, events })
    }
}

// ── VAD ───────────────────────────────────────────────────────

/// Drivable VAD fake.
pub struct FakeVad {
    streams: Mutex<Vec<mpsc::UnboundedSender<VadEvent>>>,
}

impl FakeVad {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(Vec::new()),
        })
    }

    pub fn emit(&self, event: VadEvent) {
        lock(&self.streams).retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn emit_event(&self, event_type: VadEventType, silence_ms: u64, speech_ms: u64) {
        self.emit(VadEvent {
            event_type,
            samples_index: 0,
            timestamp: std::time::Duration::ZERO,
            silence_duration: std::time::Duration::from_millis(silence_ms),
            speech_duration: std::time::Duration::from_millis(speech_ms),
            probability: 0.9,
            speaking: event_type == VadEventType::StartOfSpeech,
            frames: Vec::new(),
            raw_accumulated_silence: std::time::Duration::ZERO,
            raw_accumulated_speech: std::time::Duration::from_millis(speech_ms),
        });
    }

    pub fn speech_start(&self) {
        self.emit_event(VadEventType::StartOfSpeech, 0, 100);
    }

    pub fn speech_end(&self, silence_ms: u64) {
        self.emit_event(VadEventType::EndOfSpeech, silence_ms, 600);
    }
}

#[async_trait]
impl Vad for FakeVad {
    fn label(&self) -> &str {
        "fake-vad"
    }
    async fn stream(&self) -> Result<VadStream> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        lock(&self.streams).push(event_tx);
        let (input, mut input_rx) = stream_channel::<AudioFrame>();
        let (mut out_tx, events) = stream_channel_with_capacity(64);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = event_rx.recv() => match ev {
                        Some(ev) => {
                            if out_tx.write(ev).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    frame = input_rx.recv() => {
                        if frame.is_none() {
                            break;
                        }
                    }
                }
            }
            out_tx.close();
        });
        Ok(VadStream { input, events })
    }
}

// ── LLM ───────────────────────────────────────────────────────

/// One scripted LLM response.
#[derive(Clone, Default)]
pub struct ScriptedResponse {
    pub text: String,
    pub tool_calls: Vec<FunctionCall>,
}

impl ScriptedResponse {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(name: &str, args: serde_json::Value) -> Self {
        Self {
            text: String::new(),
            tool_calls: vec![FunctionCall::new(
                format!("call_{name}"),
                name,
                args.to_string(),
            )],
        }
    }
}

/// Scripted LLM fake: pops one response per `chat` call and records the
/// requests it saw.
pub struct FakeLlm {
    script: Mutex<VecDeque<ScriptedResponse>>,
    pub streams_created: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
    parallel_tool_calls: bool,
}

impl FakeLlm {
    pub fn new(script: Vec<ScriptedResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            streams_created: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            parallel_tool_calls: false,
        })
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    pub fn stream_count(&self) -> usize {
        self.streams_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Llm for FakeLlm {
    fn label(&self) -> &str {
        "fake-llm"
    }
    fn capabilities(&self) -> LlmCapabilities {
        LlmCapabilities {
            parallel_tool_calls: self.parallel_tool_calls,
        }
    }
    async fn chat(&self, request: ChatRequest) -> Result<LlmStream> {
        self.streams_created.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request);
        let response = lock(&self.script).pop_front().unwrap_or_default();
        let (mut tx, rx) = stream_channel_with_capacity(64);
        let cancel = CancellationToken::new();
        let stream_cancel = cancel.clone();
        tokio::spawn(async move {
            // Stream the text in word-sized deltas like a real provider.
            for word in response.text.split_inclusive(' ') {
                if stream_cancel.is_cancelled() {
                    return;
                }
                let chunk = ChatChunk {
                    id: "fake-req".into(),
                    delta: Some(ChoiceDelta {
                        role: Some(ChatRole::Assistant),
                        content: Some(word.to_string()),
                        tool_calls: Vec::new(),
                    }),
                    usage: None,
                };
                if tx.write(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            if !response.tool_calls.is_empty() {
                let chunk = ChatChunk {
                    id: "fake-req".into(),
                    delta: Some(ChoiceDelta {
                        role: Some(ChatRole::Assistant),
                        content: None,
                        tool_calls: response.tool_calls,
                    }),
                    usage: None,
                };
                let _ = tx.write(Ok(chunk)).await;
            }
            let _ = tx
                .write(Ok(ChatChunk {
                    id: "fake-req".into(),
                    delta: None,
                    usage: Some(crate::llm::CompletionUsage {
                        prompt_tokens: 10,
                        completion_tokens: 20,
                    }),
                }))
                .await;
            tx.close();
        });
        Ok(LlmStream::new(rx, cancel))
    }
}

// ── TTS ───────────────────────────────────────────────────────

/// Streaming TTS fake: one short silent frame per text push, final frame
/// on flush.
pub struct FakeTts {
    sample_rate: u32,
}

impl FakeTts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sample_rate: 24_000,
        })
    }
}

#[async_trait]
impl Tts for FakeTts {
    fn label(&self) -> &str {
        "fake-tts"
    }
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
    fn capabilities(&self) -> TtsCapabilities {
        TtsCapabilities {
            streaming: true,
            aligned_transcript: false,
        }
    }
    async fn synthesize(&self, text: &str, conn: &ConnOptions) -> Result<TtsStream> {
        let mut stream = self.stream(conn).await?;
        stream.push_text(text).await?;
        stream.flush().await?;
        stream.end_input();
        Ok(stream)
    }
    async fn stream(&self, _conn: &ConnOptions) -> Result<TtsStream> {
        let sample_rate = self.sample_rate;
        let (input, mut input_rx) = stream_channel::<TtsInput>();
        let (mut out_tx, output) = stream_channel_with_capacity(64);
        tokio::spawn(async move {
            let mut segment = 0u32;
            let mut spoke_any = false;
            loop {
                match input_rx.recv().await {
                    Some(TtsInput::Text(text)) => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        spoke_any = true;
                        // 40 ms of audio per pushed fragment.
                        let chunk = SynthesizedAudio {
                            request_id: "fake-tts".into(),
                            segment_id: format!("fake-seg-{segment}"),
                            frame: AudioFrame::silence(
                                sample_rate as usize / 25,
                                sample_rate,
                                1,
                            ),
                            is_final: false,
                            delta_text: Some(text),
                        };
                        if out_tx.write(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    flush_or_end => {
                        let ended = flush_or_end.is_none();
                        if spoke_any {
                            let last = SynthesizedAudio {
                                request_id: "fake-tts".into(),
                                segment_id: format!("fake-seg-{segment}"),
                                frame: AudioFrame::silence(
                                    sample_rate as usize / 25,
                                    sample_rate,
                                    1,
                                ),
                                is_final: true,
                                delta_text: None,
                            };
                            if out_tx.write(Ok(last)).await.is_err() {
                                return;
                            }
                            segment += 1;
                            spoke_any = false;
                        }
                        if ended {
                            break;
                        }
                    }
                }
            }
            out_tx.close();
        });
        Ok(TtsStream { input, output })
    }
}
