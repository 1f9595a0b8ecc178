//! Audio recognition coordinator.
//!
//! Fuses VAD events, streaming STT transcripts, and an optional
//! end-of-utterance predictor into a single debounced "the user's turn is
//! over" decision. The session registers [`RecognitionHooks`]; the
//! coordinator tees the room audio to the VAD and STT branches, tracks the
//! accumulated transcript, and arms a cancellable end-of-utterance task
//! whenever the user falls silent.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, warn};

use crate::audio::AudioFrame;
use crate::chat::{ChatContext, ChatRole};
use crate::config::ConnOptions;
use crate::error::VoxaError;
use crate::eou::TurnDetector;
use crate::stt::{SpeechEvent, SpeechEventType, Stt, SttOptions};
use crate::sync::chan::StreamReader;
use crate::sync::task::{TaskHandle, cancellable_sleep};
use crate::vad::{Vad, VadEvent, VadEventType};

/// How long a manual commit waits for a straggling final transcript.
pub const STRAGGLER_FINAL_WAIT: Duration = Duration::from_millis(500);

/// Turn-taking decision mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDetectionMode {
    /// VAD silence (plus the optional EOU model) commits turns.
    Automatic,
    /// Only an explicit `commit_user_turn` commits a turn.
    Manual,
}

/// The end-of-turn decision delivered to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfTurnInfo {
    /// Accumulated final transcript for the turn.
    pub new_transcript: String,
    /// Lag between the last speaking moment and the final transcript.
    pub transcription_delay: Duration,
    /// Lag between the last speaking moment and this commitment.
    pub end_of_utterance_delay: Duration,
}

/// Session-side callbacks invoked by the coordinator.
#[async_trait]
pub trait RecognitionHooks: Send + Sync {
    /// VAD confirmed speech onset.
    async fn on_start_of_speech(&self, ev: &VadEvent);
    /// VAD processed one window.
    async fn on_vad_inference_done(&self, ev: &VadEvent);
    /// VAD confirmed speech end.
    async fn on_end_of_speech(&self, ev: &VadEvent);
    /// A partial transcript arrived.
    async fn on_interim_transcript(&self, ev: &SpeechEvent);
    /// A final transcript arrived.
    async fn on_final_transcript(&self, ev: &SpeechEvent);
    /// An eager end-of-turn transcript arrived.
    async fn on_preflight_transcript(&self, ev: &SpeechEvent);
    /// The debounced end-of-turn decision. Returning `true` commits the
    /// turn and clears the accumulated transcript.
    async fn on_end_of_turn(&self, info: EndOfTurnInfo) -> bool;
    /// A recognition branch failed fatally.
    async fn on_recognition_error(&self, error: VoxaError);
    /// Snapshot of the current conversation, for the EOU predictor.
    fn current_chat_ctx(&self) -> ChatContext;
}

/// Coordinator options derived from the session's voice options.
#[derive(Debug, Clone)]
pub struct RecognitionOptions {
    /// Decision mode.
    pub mode: TurnDetectionMode,
    /// Endpointing delay for a likely-complete turn.
    pub min_endpointing_delay: Duration,
    /// Endpointing delay for a likely-incomplete turn.
    pub max_endpointing_delay: Duration,
    /// STT stream options.
    pub stt: SttOptions,
    /// STT reconnect policy.
    pub conn: ConnOptions,
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self {
            mode: TurnDetectionMode::Automatic,
            min_endpointing_delay: Duration::from_millis(500),
            max_endpointing_delay: Duration::from_secs(6),
            stt: SttOptions::default(),
            conn: ConnOptions::default(),
        }
    }
}

#[derive(Default)]
struct RecogState {
    audio_transcript: String,
    interim_transcript: String,
    last_final_transcript_at: Option<Instant>,
    last_speaking_at: Option<Instant>,
    speaking: bool,
    user_turn_committed: bool,
    last_language: Option<String>,
}

impl RecogState {
    fn append_final(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.audio_transcript.is_empty() {
            self.audio_transcript.push(' ');
        }
        self.audio_transcript.push_str(text);
    }
}

struct Shared {
    state: Mutex<RecogState>,
    final_arrived: Notify,
    hooks: Arc<dyn RecognitionHooks>,
    turn_detector: Option<Arc<dyn TurnDetector>>,
    options: RecognitionOptions,
}

enum Command {
    CommitUserTurn,
    ClearUserTurn,
}

/// The recognition coordinator. Owns the VAD/STT branch tasks and the
/// singleton end-of-utterance debounce task.
pub struct AudioRecognition {
    cmd_tx: mpsc::UnboundedSender<Command>,
    supervisor: TaskHandle<()>,
}

impl AudioRecognition {
    /// Start recognition over a room audio stream.
    pub fn new(
        hooks: Arc<dyn RecognitionHooks>,
        audio: StreamReader<AudioFrame>,
        stt: Arc<dyn Stt>,
        vad: Arc<dyn Vad>,
        turn_detector: Option<Arc<dyn TurnDetector>>,
        options: RecognitionOptions,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(RecogState::default()),
            final_arrived: Notify::new(),
            hooks,
            turn_detector,
            options,
        });
        let supervisor = TaskHandle::spawn(move |cancel| async move {
            run_supervisor(shared, audio, stt, vad, cmd_rx, cancel).await;
        });
        Self { cmd_tx, supervisor }
    }

    /// Commit the user turn now (manual turn-taking).
    pub fn commit_user_turn(&self) {
        let _ = self.cmd_tx.send(Command::CommitUserTurn);
    }

    /// Discard the accumulated user turn.
    pub fn clear_user_turn(&self) {
        let _ = self.cmd_tx.send(Command::ClearUserTurn);
    }

    /// Stop all branch tasks and the debounce task.
    pub async fn close(self) {
        drop(self.cmd_tx);
        let _ = self.supervisor.cancel_and_wait().await;
    }
}

enum BranchEvent {
    Vad(VadEvent),
    Stt(SpeechEvent),
    SttFatal(VoxaError),
}

async fn run_supervisor(
    shared: Arc<Shared>,
    audio: StreamReader<AudioFrame>,
    stt: Arc<dyn Stt>,
    vad: Arc<dyn Vad>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    // Fan the input audio out to the VAD and STT branches. Generous buffers
    // so a slow provider cannot stall the room reader.
    let (vad_audio, stt_audio) = audio.tee();

    let vad_task = TaskHandle::spawn_with_token(cancel.child_token(), {
        let event_tx = event_tx.clone();
        move |cancel| async move {
            run_vad_branch(vad, vad_audio, event_tx, cancel).await;
        }
    });
    let stt_task = TaskHandle::spawn_with_token(cancel.child_token(), {
        let event_tx = event_tx.clone();
        let options = shared.options.clone();
        move |cancel| async move {
            run_stt_branch(stt, options, stt_audio, event_tx, cancel).await;
        }
    });
    drop(event_tx);

    let mut eou_task: Option<TaskHandle<()>> = None;
    let mut commit_task: Option<TaskHandle<()>> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            ev = event_rx.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    BranchEvent::Vad(ev) => {
                        handle_vad_event(&shared, ev, &mut eou_task).await;
                    }
                    BranchEvent::Stt(ev) => {
                        handle_stt_event(&shared, ev, &mut eou_task).await;
                    }
                    BranchEvent::SttFatal(e) => {
                        shared.hooks.on_recognition_error(e).await;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::CommitUserTurn) => {
                        rearm_commit(&shared, &mut commit_task, &mut eou_task).await;
                    }
                    Some(Command::ClearUserTurn) => {
                        let mut state = lock(&shared.state);
                        state.audio_transcript.clear();
                        state.interim_transcript.clear();
                        state.user_turn_committed = false;
                    }
                    None => break,
                }
            }
        }
    }

    if let Some(task) = eou_task {
        let _ = task.cancel_and_wait().await;
    }
    if let Some(task) = commit_task {
        let _ = task.cancel_and_wait().await;
    }
    let _ = vad_task.cancel_and_wait().await;
    let _ = stt_task.cancel_and_wait().await;
}

fn lock(state: &Mutex<RecogState>) -> std::sync::MutexGuard<'_, RecogState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

async fn handle_vad_event(
    shared: &Arc<Shared>,
    ev: VadEvent,
    eou_task: &mut Option<TaskHandle<()>>,
) {
    match ev.event_type {
        VadEventType::StartOfSpeech => {
            {
                let mut state = lock(&shared.state);
                state.speaking = true;
                state.last_speaking_at = Some(Instant::now());
            }
            // The user resumed; any pending end-of-turn no longer holds.
            if let Some(task) = eou_task.take() {
                let _ = task.cancel_and_wait().await;
            }
            shared.hooks.on_start_of_speech(&ev).await;
        }
        VadEventType::InferenceDone => {
            if ev.speaking {
                lock(&shared.state).last_speaking_at = Some(Instant::now());
            }
            shared.hooks.on_vad_inference_done(&ev).await;
        }
        VadEventType::EndOfSpeech => {
            {
                let mut state = lock(&shared.state);
                state.speaking = false;
                // Back-date to the actual utterance end: the VAD only
                // reports after its configured silence wait.
                let now = Instant::now();
                state.last_speaking_at = Some(now.checked_sub(ev.silence_duration).unwrap_or(now));
            }
            shared.hooks.on_end_of_speech(&ev).await;
            if shared.options.mode != TurnDetectionMode::Manual {
                rearm_eou(shared, eou_task).await;
            }
        }
    }
}

async fn handle_stt_event(
    shared: &Arc<Shared>,
    ev: SpeechEvent,
    eou_task: &mut Option<TaskHandle<()>>,
) {
    match ev.event_type {
        SpeechEventType::FinalTranscript => {
            let schedule = {
                let mut state = lock(&shared.state);
                if shared.options.mode == TurnDetectionMode::Manual
                    && state.user_turn_committed
                    && eou_task.as_ref().is_none_or(TaskHandle::is_finished)
                {
                    // Manual turn already closed out; late finals are noise.
                    return;
                }
                if let Some(text) = ev.text() {
                    state.append_final(text);
                }
                state.interim_transcript.clear();
                state.last_final_transcript_at = Some(Instant::now());
                if let Some(lang) = ev.language() {
                    state.last_language = Some(lang.to_string());
                }
                !state.speaking
                    && (shared.options.mode == TurnDetectionMode::Automatic
                        || state.user_turn_committed)
            };
            shared.final_arrived.notify_waiters();
            shared.hooks.on_final_transcript(&ev).await;
            if schedule {
                rearm_eou(shared, eou_task).await;
            }
        }
        SpeechEventType::InterimTranscript => {
            if let Some(text) = ev.text() {
                lock(&shared.state).interim_transcript = text.to_string();
            }
            shared.hooks.on_interim_transcript(&ev).await;
        }
        SpeechEventType::PreflightTranscript => {
            shared.hooks.on_preflight_transcript(&ev).await;
        }
        SpeechEventType::StartOfSpeech
        | SpeechEventType::EndOfSpeech
        | SpeechEventType::RecognitionUsage => {}
    }
}

/// Re-arm the singleton end-of-utterance task: cancel the previous
/// instance, await its termination, then start a fresh one.
async fn rearm_eou(shared: &Arc<Shared>, eou_task: &mut Option<TaskHandle<()>>) {
    if let Some(task) = eou_task.take() {
        let _ = task.cancel_and_wait().await;
    }
    let shared = Arc::clone(shared);
    *eou_task = Some(TaskHandle::spawn(move |cancel| async move {
        bounce_eou(shared, cancel).await;
    }));
}

/// The debounced end-of-utterance decision.
async fn bounce_eou(shared: Arc<Shared>, cancel: tokio_util::sync::CancellationToken) {
    let (transcript, last_speaking_at, language) = {
        let state = lock(&shared.state);
        (
            state.audio_transcript.clone(),
            state.last_speaking_at.unwrap_or_else(Instant::now),
            state.last_language.clone(),
        )
    };

    let mut delay = shared.options.min_endpointing_delay;
    if let Some(detector) = &shared.turn_detector
        && shared.options.mode != TurnDetectionMode::Manual
        && !transcript.is_empty()
        && detector.supports_language(language.as_deref())
    {
        let mut ctx = shared.hooks.current_chat_ctx();
        ctx.add_message(ChatRole::User, transcript.clone());
        match detector.predict_end_of_turn(&ctx).await {
            Ok(p) => {
                let threshold = detector
                    .unlikely_threshold(language.as_deref())
                    .unwrap_or(crate::eou::DEFAULT_UNLIKELY_THRESHOLD);
                if p < threshold {
                    delay = shared.options.max_endpointing_delay;
                }
                debug!(
                    probability = f64::from(p),
                    threshold = f64::from(threshold),
                    ?delay,
                    "EOU prediction"
                );
            }
            Err(e) => warn!("EOU prediction failed, using min delay: {e}"),
        }
    }

    let target = last_speaking_at + delay;
    let remaining = target.saturating_duration_since(Instant::now());
    if cancellable_sleep(remaining, &cancel).await.is_err() {
        return;
    }

    let info = {
        let state = lock(&shared.state);
        let last_speaking = state.last_speaking_at.unwrap_or_else(Instant::now);
        let transcription_delay = state
            .last_final_transcript_at
            .map_or(Duration::ZERO, |t| t.saturating_duration_since(last_speaking));
        EndOfTurnInfo {
            new_transcript: state.audio_transcript.clone(),
            transcription_delay,
            end_of_utterance_delay: Instant::now().saturating_duration_since(last_speaking),
        }
    };

    let committed = shared.hooks.on_end_of_turn(info).await;
    if committed {
        let mut state = lock(&shared.state);
        state.audio_transcript.clear();
        state.user_turn_committed = false;
    }
}

/// Manual commit: wait briefly for a straggling final, fold the interim
/// into the transcript, then run the end-of-turn decision.
async fn rearm_commit(
    shared: &Arc<Shared>,
    commit_task: &mut Option<TaskHandle<()>>,
    eou_task: &mut Option<TaskHandle<()>>,
) {
    if let Some(task) = commit_task.take() {
        let _ = task.cancel_and_wait().await;
    }
    if let Some(task) = eou_task.take() {
        let _ = task.cancel_and_wait().await;
    }
    let shared_for_task = Arc::clone(shared);
    *commit_task = Some(TaskHandle::spawn(move |cancel| async move {
        let awaiting_final = {
            let state = lock(&shared_for_task.state);
            !state.interim_transcript.is_empty()
        };
        if awaiting_final {
            let waited = tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(STRAGGLER_FINAL_WAIT) => false,
                () = shared_for_task.final_arrived.notified() => true,
            };
            debug!(straggler_arrived = waited, "manual commit wait done");
        }
        {
            let mut state = lock(&shared_for_task.state);
            let interim = std::mem::take(&mut state.interim_transcript);
            state.append_final(&interim);
            state.user_turn_committed = true;
        }
        bounce_eou(shared_for_task, cancel).await;
    }));
}

async fn run_vad_branch(
    vad: Arc<dyn Vad>,
    mut audio: StreamReader<AudioFrame>,
    event_tx: mpsc::UnboundedSender<BranchEvent>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let stream = match vad.stream().await {
        Ok(s) => s,
        Err(e) => {
            error!("failed to start VAD stream: {e}");
            return;
        }
    };
    // Split the halves so frames can be pushed while events are read.
    let crate::vad::VadStream {
        input: mut vad_in,
        events: mut vad_events,
    } = stream;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = audio.recv() => {
                match frame {
                    Some(frame) => {
                        if vad_in.write(frame).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        vad_in.close();
                        while let Some(ev) = vad_events.recv().await {
                            let _ = event_tx.send(BranchEvent::Vad(ev));
                        }
                        break;
                    }
                }
            }
            ev = vad_events.recv() => {
                match ev {
                    Some(ev) => {
                        if event_tx.send(BranchEvent::Vad(ev)).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

async fn run_stt_branch(
    stt: Arc<dyn Stt>,
    options: RecognitionOptions,
    mut audio: StreamReader<AudioFrame>,
    event_tx: mpsc::UnboundedSender<BranchEvent>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut attempt: u32 = 0;
    'reconnect: loop {
        if cancel.is_cancelled() {
            return;
        }
        let stream = match stt.stream(options.stt.clone()).await {
            Ok(s) => {
                attempt = 0;
                s
            }
            Err(e) if e.retryable() && attempt < options.conn.max_retry => {
                let backoff = options.conn.interval_for_retry(attempt);
                warn!("STT stream open failed ({e}), retrying in {backoff:?}");
                attempt += 1;
                if cancellable_sleep(backoff, &cancel).await.is_err() {
                    return;
                }
                continue 'reconnect;
            }
            Err(e) => {
                let _ = event_tx.send(BranchEvent::SttFatal(e));
                return;
            }
        };
        let crate::stt::SttStream {
            input: mut stt_in,
            events: mut stt_events,
        } = stream;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                frame = audio.recv() => {
                    match frame {
                        Some(frame) => {
                            if stt_in.write(crate::stt::SttInput::Frame(frame)).await.is_err() {
                                continue 'reconnect;
                            }
                        }
                        None => {
                            stt_in.close();
                            while let Some(ev) = stt_events.recv().await {
                                match ev {
                                    Ok(ev) => { let _ = event_tx.send(BranchEvent::Stt(ev)); }
                                    Err(_) => break,
                                }
                            }
                            return;
                        }
                    }
                }
                ev = stt_events.recv() => {
                    match ev {
                        Some(Ok(ev)) => {
                            if event_tx.send(BranchEvent::Stt(ev)).is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) if e.retryable() => {
                            warn!("recoverable STT error ({e}), reconnecting");
                            continue 'reconnect;
                        }
                        Some(Err(e)) => {
                            let _ = event_tx.send(BranchEvent::SttFatal(e));
                            return;
                        }
                        None => continue 'reconnect,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stt::{SpeechData, SttCapabilities, SttInput, SttStream};
    use crate::sync::chan::{stream_channel, stream_channel_with_capacity};
    use crate::vad::VadStream;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Hooks that record end-of-turn decisions.
    struct RecordingHooks {
        end_of_turns: Mutex<Vec<EndOfTurnInfo>>,
        saw_speech_start: AtomicBool,
        commit: bool,
    }

    impl RecordingHooks {
        fn new(commit: bool) -> Arc<Self> {
            Arc::new(Self {
                end_of_turns: Mutex::new(Vec::new()),
                saw_speech_start: AtomicBool::new(false),
                commit,
            })
        }
    }

    #[async_trait]
    impl RecognitionHooks for RecordingHooks {
        async fn on_start_of_speech(&self, _ev: &VadEvent) {
            self.saw_speech_start.store(true, Ordering::SeqCst);
        }
        async fn on_vad_inference_done(&self, _ev: &VadEvent) {}
        async fn on_end_of_speech(&self, _ev: &VadEvent) {}
        async fn on_interim_transcript(&self, _ev: &SpeechEvent) {}
        async fn on_final_transcript(&self, _ev: &SpeechEvent) {}
        async fn on_preflight_transcript(&self, _ev: &SpeechEvent) {}
        async fn on_end_of_turn(&self, info: EndOfTurnInfo) -> bool {
            self.end_of_turns
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(info);
            self.commit
        }
        async fn on_recognition_error(&self, _error: VoxaError) {}
        fn current_chat_ctx(&self) -> ChatContext {
            ChatContext::new()
        }
    }

    /// An STT fake driven by a script of events, ignoring audio input.
    struct ScriptedStt {
        events: Mutex<Vec<SpeechEvent>>,
    }

    impl ScriptedStt {
        fn new(events: Vec<SpeechEvent>) -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(events),
            })
        }
    }

    #[async_trait]
    impl Stt for ScriptedStt {
        fn label(&self) -> &str {
            "scripted"
        }
        fn capabilities(&self) -> SttCapabilities {
            SttCapabilities {
                streaming: true,
                interim_results: true,
                preflight_transcripts: false,
                aligned_transcript: false,
            }
        }
        async fn stream(&self, _options: SttOptions) -> crate::error::Result<SttStream> {
            let (input, mut in_rx) = stream_channel::<SttInput>();
            let (mut tx, events) = stream_channel_with_capacity(64);
            let script: Vec<SpeechEvent> =
                std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()));
            tokio::spawn(async move {
                for ev in script {
                    if tx.write(Ok(ev)).await.is_err() {
                        return;
                    }
                }
                // Keep the stream open until the input closes.
                while in_rx.recv().await.is_some() {}
                tx.close();
            });
            Ok(SttStream { input, events })
        }
    }

    /// A VAD fake driven by a script, ignoring audio input.
    struct ScriptedVad {
        events: Mutex<Vec<VadEvent>>,
    }

    impl ScriptedVad {
        fn new(events: Vec<VadEvent>) -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(events),
            })
        }
    }

    #[async_trait]
    impl Vad for ScriptedVad {
        fn label(&self) -> &str {
            "scripted"
        }
        async fn stream(&self) -> crate::error::Result<VadStream> {
            let (input, mut in_rx) = stream_channel::<AudioFrame>();
            let (mut tx, events) = stream_channel_with_capacity(64);
            let script: Vec<VadEvent> =
                std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()));
            tokio::spawn(async move {
                for ev in script {
                    if tx.write(ev).await.is_err() {
                        return;
                    }
                }
                while in_rx.recv().await.is_some() {}
                tx.close();
            });
            Ok(VadStream { input, events })
        }
    }

    fn vad_event(event_type: VadEventType, silence_ms: u64) -> VadEvent {
        VadEvent {
            event_type,
            samples_index: 0,
            timestamp: Duration::ZERO,
            silence_duration: Duration::from_millis(silence_ms),
            speech_duration: Duration::from_millis(400),
            probability: 0.9,
            speaking: event_type == VadEventType::StartOfSpeech,
            frames: Vec::new(),
            raw_accumulated_silence: Duration::ZERO,
            raw_accumulated_speech: Duration::ZERO,
        }
    }

    fn final_event(text: &str) -> SpeechEvent {
        SpeechEvent {
            event_type: SpeechEventType::FinalTranscript,
            request_id: "r".into(),
            alternatives: vec![SpeechData {
                text: text.into(),
                ..SpeechData::default()
            }],
        }
    }

    fn interim_event(text: &str) -> SpeechEvent {
        SpeechEvent {
            event_type: SpeechEventType::InterimTranscript,
            request_id: "r".into(),
            alternatives: vec![SpeechData {
                text: text.into(),
                ..SpeechData::default()
            }],
        }
    }

    fn fast_options() -> RecognitionOptions {
        RecognitionOptions {
            mode: TurnDetectionMode::Automatic,
            min_endpointing_delay: Duration::from_millis(20),
            max_endpointing_delay: Duration::from_millis(200),
            ..RecognitionOptions::default()
        }
    }

    async fn wait_for_turns(hooks: &RecordingHooks, n: usize) -> Vec<EndOfTurnInfo> {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let turns = hooks.end_of_turns.lock().unwrap_or_else(|e| e.into_inner());
            if turns.len() >= n {
                return turns.clone();
            }
        }
        hooks
            .end_of_turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    #[tokio::test]
    async fn silence_after_final_commits_turn() {
        let hooks = RecordingHooks::new(true);
        let stt = ScriptedStt::new(vec![final_event("hello agent")]);
        let vad = ScriptedVad::new(vec![
            vad_event(VadEventType::StartOfSpeech, 0),
            vad_event(VadEventType::EndOfSpeech, 100),
        ]);
        let (mut audio_tx, audio_rx) = stream_channel::<AudioFrame>();
        let recognition = AudioRecognition::new(
            Arc::clone(&hooks) as Arc<dyn RecognitionHooks>,
            audio_rx,
            stt,
            vad,
            None,
            fast_options(),
        );

        let turns = wait_for_turns(&hooks, 1).await;
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].new_transcript, "hello agent");
        assert!(hooks.saw_speech_start.load(Ordering::SeqCst));

        audio_tx.close();
        recognition.close().await;
    }

    #[tokio::test]
    async fn start_of_speech_cancels_pending_eou() {
        let hooks = RecordingHooks::new(true);
        let stt = ScriptedStt::new(vec![final_event("first part")]);
        // End of speech schedules the EOU, then the user immediately
        // resumes: no end-of-turn may fire between the two.
        let vad = ScriptedVad::new(vec![
            vad_event(VadEventType::StartOfSpeech, 0),
            vad_event(VadEventType::EndOfSpeech, 0),
            vad_event(VadEventType::StartOfSpeech, 0),
        ]);
        let (mut audio_tx, audio_rx) = stream_channel::<AudioFrame>();
        let mut options = fast_options();
        options.min_endpointing_delay = Duration::from_millis(80);
        let recognition = AudioRecognition::new(
            Arc::clone(&hooks) as Arc<dyn RecognitionHooks>,
            audio_rx,
            stt,
            vad,
            None,
            options,
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        let turns = hooks.end_of_turns.lock().unwrap_or_else(|e| e.into_inner()).clone();
        assert!(
            turns.is_empty(),
            "no end-of-turn between start and the next end of speech"
        );

        audio_tx.close();
        recognition.close().await;
    }

    #[tokio::test]
    async fn finals_accumulate_across_segments() {
        let hooks = RecordingHooks::new(false); // don't commit: transcript accumulates
        let stt = ScriptedStt::new(vec![final_event("first"), final_event("second")]);
        let vad = ScriptedVad::new(vec![
            vad_event(VadEventType::StartOfSpeech, 0),
            vad_event(VadEventType::EndOfSpeech, 50),
        ]);
        let (mut audio_tx, audio_rx) = stream_channel::<AudioFrame>();
        let recognition = AudioRecognition::new(
            Arc::clone(&hooks) as Arc<dyn RecognitionHooks>,
            audio_rx,
            stt,
            vad,
            None,
            fast_options(),
        );

        let turns = wait_for_turns(&hooks, 1).await;
        assert!(!turns.is_empty());
        assert_eq!(turns.last().unwrap().new_transcript, "first second");

        audio_tx.close();
        recognition.close().await;
    }

    #[tokio::test]
    async fn manual_commit_folds_interim_after_straggler_wait() {
        let hooks = RecordingHooks::new(true);
        let stt = ScriptedStt::new(vec![
            interim_event("turn left at"),
            interim_event("turn left at the lights"),
        ]);
        let vad = ScriptedVad::new(vec![]);
        let (mut audio_tx, audio_rx) = stream_channel::<AudioFrame>();
        let mut options = fast_options();
        options.mode = TurnDetectionMode::Manual;
        let recognition = AudioRecognition::new(
            Arc::clone(&hooks) as Arc<dyn RecognitionHooks>,
            audio_rx,
            stt,
            vad,
            None,
            options,
        );

        // Let the interims land, then commit with no final yet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        recognition.commit_user_turn();

        let turns = wait_for_turns(&hooks, 1).await;
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].new_transcript, "turn left at the lights");

        audio_tx.close();
        recognition.close().await;
    }

    #[tokio::test]
    async fn eou_uses_max_delay_when_turn_unlikely_over() {
        struct UnlikelyDetector;
        #[async_trait]
        impl TurnDetector for UnlikelyDetector {
            async fn predict_end_of_turn(
                &self,
                _chat_ctx: &ChatContext,
            ) -> crate::error::Result<f32> {
                Ok(0.01)
            }
            fn unlikely_threshold(&self, _language: Option<&str>) -> Option<f32> {
                Some(0.15)
            }
            fn supports_language(&self, _language: Option<&str>) -> bool {
                true
            }
        }

        let hooks = RecordingHooks::new(true);
        let stt = ScriptedStt::new(vec![final_event("so what I was thinking is")]);
        let vad = ScriptedVad::new(vec![
            vad_event(VadEventType::StartOfSpeech, 0),
            vad_event(VadEventType::EndOfSpeech, 0),
        ]);
        let (mut audio_tx, audio_rx) = stream_channel::<AudioFrame>();
        let mut options = fast_options();
        options.min_endpointing_delay = Duration::from_millis(10);
        options.max_endpointing_delay = Duration::from_millis(250);
        let recognition = AudioRecognition::new(
            Arc::clone(&hooks) as Arc<dyn RecognitionHooks>,
            audio_rx,
            stt,
            vad,
            Some(Arc::new(UnlikelyDetector)),
            options,
        );

        // After the min delay the turn must still be open.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            hooks
                .end_of_turns
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty(),
            "unlikely turns wait for the max endpointing delay"
        );

        let turns = wait_for_turns(&hooks, 1).await;
        assert_eq!(turns.len(), 1);

        audio_tx.close();
        recognition.close().await;
    }
}
