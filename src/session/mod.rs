//! Agent session: the turn-taking scheduler.
//!
//! The session wires room audio into the recognition coordinator, owns the
//! speech-handle queue (FIFO, at most one active), arbitrates user turns
//! against agent speech, engages the interruption detector during overlap,
//! runs preemptive generation from preflight transcripts, and applies
//! tool-driven agent handoffs.
//!
//! All transitions that swap the active agent or reconfigure I/O hold the
//! activity lock; the lock is never held across user-supplied callbacks or
//! nested awaits.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::audio::AudioFrame;
use crate::chat::{ChatContext, ChatItem, ChatMessage, ChatRole};
use crate::config::{ConnOptions, InterruptionOptions, VoiceOptions};
use crate::eou::TurnDetector;
use crate::error::{Result, VoxaError};
use crate::interruption::{DetectorInput, InterruptionDetector, InterruptionEventType};
use crate::llm::{Llm, ToolChoice};
use crate::recognition::{
    AudioRecognition, EndOfTurnInfo, RecognitionHooks, RecognitionOptions, TurnDetectionMode,
};
use crate::room::{AudioOutput, TextOutput, TranscriptionSegment};
use crate::speech::pipeline::{SpeechDeps, SpeechJob, run_speech};
use crate::speech::{DoneReason, Gate, SpeechHandle, SpeechState};
use crate::stt::{SpeechEvent, Stt};
use crate::sync::chan::StreamReader;
use crate::sync::task::TaskHandle;
use crate::text::normalize_text;
use crate::tools::ToolRegistry;
use crate::transcription::TranscriptSynchronizer;
use crate::tts::Tts;
use crate::vad::{Vad, VadEvent};

/// Coarse agent activity, surfaced via [`SessionEvent::AgentStateChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Session created but not started.
    Initializing,
    /// Waiting for user speech.
    Listening,
    /// A reply is being generated.
    Thinking,
    /// Agent audio is playing.
    Speaking,
}

/// Per-turn latency metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnMetrics {
    /// Lag from last speech to turn commitment.
    pub end_of_utterance_delay: Option<Duration>,
    /// Lag from last speech to the final transcript.
    pub transcription_delay: Option<Duration>,
    /// LLM time to first token.
    pub llm_ttft: Option<Duration>,
    /// TTS time to first audio byte.
    pub tts_ttfb: Option<Duration>,
}

/// Public session events.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A user transcript (interim or final) arrived.
    UserInputTranscribed {
        /// The transcript text.
        transcript: String,
        /// Whether it is final.
        is_final: bool,
    },
    /// The agent's coarse state changed.
    AgentStateChanged {
        /// Previous state.
        old: AgentState,
        /// New state.
        new: AgentState,
    },
    /// Per-turn metrics.
    MetricsCollected(TurnMetrics),
    /// A component failed.
    Error(String),
    /// The session closed.
    Close,
}

/// Capability defaults for a session; agents may override per-capability.
pub struct SessionComponents {
    /// Speech-to-text.
    pub stt: Arc<dyn Stt>,
    /// Language model (optional: `say`-only sessions work without one).
    pub llm: Option<Arc<dyn Llm>>,
    /// Text-to-speech.
    pub tts: Arc<dyn Tts>,
    /// Voice activity detection.
    pub vad: Arc<dyn Vad>,
    /// End-of-utterance predictor.
    pub turn_detector: Option<Arc<dyn TurnDetector>>,
    /// Overlap-speech classifier; `None` falls back to VAD barge-in.
    pub interruption: Option<InterruptionOptions>,
    /// Turn-taking options.
    pub options: VoiceOptions,
    /// Provider connection options.
    pub conn: ConnOptions,
}

struct QueueEntry {
    handle: SpeechHandle,
    job: SpeechJob,
    instructions_override: Option<String>,
    extra_user_input: Option<String>,
    tool_choice: ToolChoice,
}

#[derive(Default)]
struct SchedState {
    active: Option<SpeechHandle>,
    queued: VecDeque<SpeechHandle>,
}

struct Preemptive {
    handle: SpeechHandle,
    transcript: String,
}

struct SessionInner {
    components: SessionComponents,
    activity_lock: tokio::sync::Mutex<()>,
    chat_ctx: Mutex<ChatContext>,
    agent: Mutex<Option<Arc<dyn Agent>>>,
    agent_state: Mutex<AgentState>,
    events: broadcast::Sender<SessionEvent>,
    sched_tx: OnceLock<mpsc::UnboundedSender<QueueEntry>>,
    sched: Mutex<SchedState>,
    preemptive: Mutex<Option<Preemptive>>,
    detector_tx: OnceLock<mpsc::UnboundedSender<DetectorInput>>,
    overlap_open: Mutex<bool>,
    handoff_parent: Mutex<Option<SpeechHandle>>,
    audio_output: OnceLock<Arc<dyn AudioOutput>>,
    synchronizer: OnceLock<Arc<TranscriptSynchronizer>>,
    recognition: Mutex<Option<AudioRecognition>>,
    tasks: Mutex<Vec<TaskHandle<()>>>,
    closed: Mutex<bool>,
}

/// A voice-agent session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct AgentSession {
    inner: Arc<SessionInner>,
}

impl AgentSession {
    /// Create a session over the given capability defaults.
    pub fn new(components: SessionComponents) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(SessionInner {
                components,
                activity_lock: tokio::sync::Mutex::new(()),
                chat_ctx: Mutex::new(ChatContext::new()),
                agent: Mutex::new(None),
                agent_state: Mutex::new(AgentState::Initializing),
                events,
                sched_tx: OnceLock::new(),
                sched: Mutex::new(SchedState::default()),
                preemptive: Mutex::new(None),
                detector_tx: OnceLock::new(),
                overlap_open: Mutex::new(false),
                handoff_parent: Mutex::new(None),
                audio_output: OnceLock::new(),
                synchronizer: OnceLock::new(),
                recognition: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                closed: Mutex::new(false),
            }),
        }
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Current coarse agent state.
    pub fn agent_state(&self) -> AgentState {
        *lock(&self.inner.agent_state)
    }

    /// Snapshot of the conversation.
    pub fn chat_ctx_snapshot(&self) -> ChatContext {
        lock(&self.inner.chat_ctx).clone()
    }

    /// The active agent.
    pub fn current_agent(&self) -> Arc<dyn Agent> {
        lock(&self.inner.agent)
            .clone()
            .unwrap_or_else(|| Arc::new(crate::agent::StaticAgent::new("")))
    }

    /// Start the session: wire room audio through recognition, start the
    /// scheduler and (when configured) the interruption detector, and
    /// activate the agent.
    ///
    /// # Errors
    ///
    /// Fails if the session was already started.
    pub async fn start(
        &self,
        agent: Arc<dyn Agent>,
        audio_input: StreamReader<AudioFrame>,
        audio_output: Arc<dyn AudioOutput>,
        text_output: Option<Arc<dyn TextOutput>>,
    ) -> Result<()> {
        if self.inner.audio_output.set(audio_output).is_err() {
            return Err(VoxaError::Session("session already started".into()));
        }
        *lock(&self.inner.agent) = Some(Arc::clone(&agent));

        // Transcription pacing and the room text channel.
        let (synchronizer, mut sync_rx) =
            TranscriptSynchronizer::new(self.inner.components.options.user_speed);
        let synchronizer = Arc::new(synchronizer);
        let _ = self.inner.synchronizer.set(Arc::clone(&synchronizer));
        if let Some(sink) = text_output {
            self.spawn_task(TaskHandle::spawn(move |cancel| async move {
                loop {
                    let update = tokio::select! {
                        () = cancel.cancelled() => break,
                        update = sync_rx.recv() => match update {
                            Some(u) => u,
                            None => break,
                        },
                    };
                    let segment = TranscriptionSegment {
                        id: update.segment_id,
                        participant_identity: "agent".into(),
                        text: update.delta,
                        is_final: update.is_final,
                        language: None,
                    };
                    if sink.publish(segment).await.is_err() {
                        break;
                    }
                }
            }));
        }

        // Interruption detector (optional) gets its own copy of the input.
        let recog_audio = if self.inner.components.interruption.is_some() {
            let (recog_audio, det_audio) = audio_input.tee();
            self.start_interruption_detector(det_audio);
            recog_audio
        } else {
            audio_input
        };

        // Recognition coordinator.
        let hooks: Arc<dyn RecognitionHooks> = Arc::new(SessionHooks {
            session: Arc::downgrade(&self.inner),
        });
        let options = &self.inner.components.options;
        let recognition_options = RecognitionOptions {
            mode: if options.manual_turn_detection {
                TurnDetectionMode::Manual
            } else {
                TurnDetectionMode::Automatic
            },
            min_endpointing_delay: options.min_endpointing_delay(),
            max_endpointing_delay: options.max_endpointing_delay(),
            stt: crate::stt::SttOptions::default(),
            conn: self.inner.components.conn.clone(),
        };
        let turn_detector = agent
            .turn_detection()
            .or_else(|| self.inner.components.turn_detector.clone());
        let recognition = AudioRecognition::new(
            hooks,
            recog_audio,
            agent.stt().unwrap_or_else(|| Arc::clone(&self.inner.components.stt)),
            agent.vad().unwrap_or_else(|| Arc::clone(&self.inner.components.vad)),
            turn_detector,
            recognition_options,
        );
        *lock(&self.inner.recognition) = Some(recognition);

        // Speech-handle scheduler.
        let (sched_tx, sched_rx) = mpsc::unbounded_channel();
        let _ = self.inner.sched_tx.set(sched_tx);
        let session = self.clone();
        self.spawn_task(TaskHandle::spawn(move |cancel| async move {
            run_scheduler(session, sched_rx, cancel).await;
        }));

        self.set_agent_state(AgentState::Listening);
        info!("agent session started");
        agent.on_enter(self).await;
        Ok(())
    }

    fn start_interruption_detector(&self, mut det_audio: StreamReader<AudioFrame>) {
        let Some(options) = self.inner.components.interruption.clone() else {
            return;
        };
        let (mut det_in, mut det_events, det_task) = InterruptionDetector::new(options).split();
        let (det_tx, mut det_rx) = mpsc::unbounded_channel::<DetectorInput>();
        let _ = self.inner.detector_tx.set(det_tx);
        let weak = Arc::downgrade(&self.inner);
        self.spawn_task(TaskHandle::spawn(move |cancel| async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    frame = det_audio.recv() => {
                        match frame {
                            Some(frame) => {
                                if det_in.write(DetectorInput::Frame(frame)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    item = det_rx.recv() => {
                        match item {
                            Some(item) => {
                                if det_in.write(item).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    ev = det_events.recv() => {
                        let Some(ev) = ev else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        let session = AgentSession { inner };
                        match ev.event_type {
                            InterruptionEventType::Interruption => {
                                info!(
                                    probability = f64::from(ev.probability),
                                    "overlap classified as interruption"
                                );
                                session.interrupt_active(DoneReason::Interrupted, true);
                            }
                            InterruptionEventType::OverlapSpeechEnded => {
                                if !ev.is_interruption {
                                    // False alarm: keep the agent speaking and
                                    // drop the overlap from turn arbitration.
                                    debug!(
                                        probability = f64::from(ev.probability),
                                        "overlap ended without interruption"
                                    );
                                    session.clear_user_turn();
                                }
                            }
                        }
                    }
                }
            }
            det_in.close();
            let _ = det_task.cancel_and_wait().await;
        }));
    }

    /// Enqueue a generated reply.
    ///
    /// # Errors
    ///
    /// Fails if the session has not been started.
    pub fn generate_reply(
        &self,
        user_input: Option<&str>,
        instructions: Option<&str>,
    ) -> Result<SpeechHandle> {
        if let Some(input) = user_input {
            self.insert_chat_item(ChatItem::Message(ChatMessage::text(ChatRole::User, input)));
        }
        self.enqueue(
            SpeechJob::Generate,
            instructions.map(str::to_string),
            None,
            ToolChoice::Auto,
            &[Gate::ParentDone],
        )
    }

    /// Enqueue a TTS-only utterance.
    ///
    /// # Errors
    ///
    /// Fails if the session has not been started.
    pub fn say(&self, text: &str, add_to_chat_ctx: bool) -> Result<SpeechHandle> {
        self.enqueue(
            SpeechJob::Say {
                text: text.to_string(),
                add_to_chat_ctx,
            },
            None,
            None,
            ToolChoice::Auto,
            &[Gate::ParentDone],
        )
    }

    fn enqueue(
        &self,
        job: SpeechJob,
        instructions_override: Option<String>,
        extra_user_input: Option<String>,
        tool_choice: ToolChoice,
        gates: &[Gate],
    ) -> Result<SpeechHandle> {
        let sched_tx = self
            .inner
            .sched_tx
            .get()
            .ok_or_else(|| VoxaError::Session("session not started".into()))?;
        let handle = SpeechHandle::new(self.inner.components.options.allow_interruptions, gates);
        handle.mark(SpeechState::Scheduled);

        // Replies created during a handoff chain to the originating
        // utterance so interrupting it cancels the whole lineage.
        if let Some(parent) = lock(&self.inner.handoff_parent).clone()
            && parent.done_reason().is_none()
        {
            parent.add_child(&handle);
        }

        lock(&self.inner.sched).queued.push_back(handle.clone());
        sched_tx
            .send(QueueEntry {
                handle: handle.clone(),
                job,
                instructions_override,
                extra_user_input,
                tool_choice,
            })
            .map_err(|_| VoxaError::Session("scheduler stopped".into()))?;
        self.set_agent_state(AgentState::Thinking);
        Ok(handle)
    }

    /// Interrupt the active utterance (and its chain).
    pub fn interrupt(&self) {
        self.interrupt_active(DoneReason::Interrupted, false);
    }

    fn interrupt_active(&self, reason: DoneReason, respect_allow: bool) {
        let active = lock(&self.inner.sched).active.clone();
        if let Some(handle) = active {
            if respect_allow && !handle.allow_interruptions() {
                debug!("interruption suppressed: handle disallows it");
                return;
            }
            info!(handle = handle.id(), "interrupting active speech");
            handle.cancel_chain(reason);
        }
    }

    /// Replace the conversation context.
    pub async fn update_chat_ctx(&self, ctx: ChatContext) {
        let _guard = self.inner.activity_lock.lock().await;
        *lock(&self.inner.chat_ctx) = ctx;
    }

    /// Swap the active agent, running `on_exit` / `on_enter` hooks outside
    /// the activity lock.
    pub async fn update_agent(&self, agent: Arc<dyn Agent>) {
        let old = {
            let _guard = self.inner.activity_lock.lock().await;
            lock(&self.inner.agent).replace(Arc::clone(&agent))
        };
        if let Some(old) = old {
            old.on_exit(self).await;
        }
        agent.on_enter(self).await;
    }

    /// Apply a tool-driven handoff: like [`update_agent`](Self::update_agent),
    /// but replies created during `on_enter` chain to `origin`.
    pub async fn apply_handoff(&self, agent: Arc<dyn Agent>, origin: &SpeechHandle) {
        *lock(&self.inner.handoff_parent) = Some(origin.clone());
        self.update_agent(agent).await;
        *lock(&self.inner.handoff_parent) = None;
    }

    /// Commit the user turn now (manual turn-taking).
    pub fn commit_user_turn(&self) {
        if let Some(recognition) = lock(&self.inner.recognition).as_ref() {
            recognition.commit_user_turn();
        }
    }

    /// Discard the accumulated user turn.
    pub fn clear_user_turn(&self) {
        if let Some(recognition) = lock(&self.inner.recognition).as_ref() {
            recognition.clear_user_turn();
        }
    }

    /// Close the session: optionally drain the active utterance, then stop
    /// recognition, detection, pacing, and the scheduler.
    pub async fn close(&self) {
        {
            let mut closed = lock(&self.inner.closed);
            if *closed {
                return;
            }
            *closed = true;
        }
        if self.inner.components.options.drain_on_close {
            let active = lock(&self.inner.sched).active.clone();
            if let Some(handle) = active {
                let _ = tokio::time::timeout(Duration::from_secs(10), handle.wait_done()).await;
            }
        }
        // Force-cancel whatever is still in flight so the scheduler unwinds.
        self.interrupt_active(DoneReason::Cancelled, false);

        // Unwire I/O and swap the agent out under the activity lock so
        // close cannot interleave with an in-flight `update_agent` or I/O
        // reconfiguration. The guard is dropped before any await below;
        // awaiting task termination under it could deadlock against a
        // handoff waiting for the same lock.
        let (recognition, tasks, agent) = {
            let _guard = self.inner.activity_lock.lock().await;
            (
                lock(&self.inner.recognition).take(),
                std::mem::take(&mut *lock(&self.inner.tasks)),
                lock(&self.inner.agent).take(),
            )
        };
        if let Some(recognition) = recognition {
            recognition.close().await;
        }
        if let Some(sync) = self.inner.synchronizer.get() {
            sync.close().await;
        }
        for task in tasks {
            let _ = task.cancel_and_wait().await;
        }
        if let Some(agent) = agent {
            agent.on_exit(self).await;
        }
        self.emit(SessionEvent::Close);
        info!("agent session closed");
    }

    // ── crate-internal plumbing ───────────────────────────────

    /// Insert an item into the canonical conversation.
    pub fn insert_chat_item(&self, item: ChatItem) {
        lock(&self.inner.chat_ctx).insert(item);
    }

    pub(crate) fn emit_error(&self, message: String) {
        warn!("{message}");
        self.emit(SessionEvent::Error(message));
    }

    pub(crate) fn emit_metrics(&self, metrics: TurnMetrics) {
        self.emit(SessionEvent::MetricsCollected(metrics));
    }

    pub(crate) fn notify_agent_speaking(&self, speaking: bool) {
        if speaking {
            self.set_agent_state(AgentState::Speaking);
            self.send_detector(DetectorInput::AgentSpeechStarted);
        } else {
            self.send_detector(DetectorInput::AgentSpeechEnded);
            let idle = {
                let sched = lock(&self.inner.sched);
                sched.queued.is_empty()
            };
            if idle {
                self.set_agent_state(AgentState::Listening);
            }
        }
    }

    fn send_detector(&self, input: DetectorInput) {
        if let Some(tx) = self.inner.detector_tx.get() {
            let _ = tx.send(input);
        }
    }

    fn set_agent_state(&self, new: AgentState) {
        let old = {
            let mut state = lock(&self.inner.agent_state);
            let old = *state;
            *state = new;
            old
        };
        if old != new {
            self.emit(SessionEvent::AgentStateChanged { old, new });
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }

    fn spawn_task(&self, task: TaskHandle<()>) {
        lock(&self.inner.tasks).push(task);
    }

    /// Turn arbitration on a committed end of turn. Returns whether the
    /// turn was committed (C1 clears its transcript buffer).
    async fn handle_end_of_turn(&self, info: EndOfTurnInfo) -> bool {
        if info.new_transcript.trim().is_empty() {
            return false;
        }

        // Preemptive generation: confirm when the committed transcript
        // matches the preflight, discard otherwise.
        let confirmed = {
            let preemptive = lock(&self.inner.preemptive).take();
            match preemptive {
                Some(p)
                    if normalize_text(&p.transcript) == normalize_text(&info.new_transcript)
                        && p.handle.done_reason().is_none() =>
                {
                    debug!("preflight transcript confirmed, releasing gate");
                    Some(p.handle)
                }
                Some(p) => {
                    debug!("preflight transcript mismatch, discarding shadow generation");
                    p.handle.cancel_chain(DoneReason::Preempted);
                    None
                }
                None => None,
            }
        };

        let message = ChatMessage::text(ChatRole::User, info.new_transcript.clone());
        self.insert_chat_item(ChatItem::Message(message.clone()));

        self.emit_metrics(TurnMetrics {
            end_of_utterance_delay: Some(info.end_of_utterance_delay),
            transcription_delay: Some(info.transcription_delay),
            ..TurnMetrics::default()
        });

        // Let the agent inspect / mutate the turn before a reply is
        // scheduled. StopResponse suppresses the reply but still commits.
        let agent = self.current_agent();
        let mut ctx = self.chat_ctx_snapshot();
        let verdict = agent.on_user_turn_completed(&mut ctx, &message).await;
        *lock(&self.inner.chat_ctx) = ctx;
        if verdict.is_err() {
            debug!("reply suppressed by on_user_turn_completed");
            if let Some(handle) = confirmed {
                handle.cancel_chain(DoneReason::Cancelled);
            }
            return true;
        }

        match confirmed {
            Some(handle) => handle.release_gate(Gate::Preflight),
            None => {
                if let Err(e) = self.enqueue(
                    SpeechJob::Generate,
                    None,
                    None,
                    ToolChoice::Auto,
                    &[Gate::ParentDone],
                ) {
                    self.emit_error(format!("failed to schedule reply: {e}"));
                    return false;
                }
            }
        }
        true
    }

    fn handle_preflight(&self, transcript: &str) {
        if !self.inner.components.options.preemptive_generation || transcript.trim().is_empty() {
            return;
        }
        let mut preemptive = lock(&self.inner.preemptive);
        if let Some(existing) = preemptive.take() {
            if normalize_text(&existing.transcript) == normalize_text(transcript)
                && existing.handle.done_reason().is_none()
            {
                *preemptive = Some(existing);
                return;
            }
            existing.handle.cancel_chain(DoneReason::Preempted);
        }
        drop(preemptive);

        match self.enqueue(
            SpeechJob::Generate,
            None,
            Some(transcript.to_string()),
            ToolChoice::Auto,
            &[Gate::ParentDone, Gate::Preflight],
        ) {
            Ok(handle) => {
                debug!("preemptive generation started from preflight transcript");
                *lock(&self.inner.preemptive) = Some(Preemptive {
                    handle,
                    transcript: transcript.to_string(),
                });
            }
            Err(e) => warn!("preemptive generation failed to schedule: {e}"),
        }
    }

    fn active_interruptible_handle(&self) -> Option<SpeechHandle> {
        let sched = lock(&self.inner.sched);
        let handle = sched.active.clone()?;
        if matches!(handle.state(), SpeechState::Playing) && handle.allow_interruptions() {
            Some(handle)
        } else {
            None
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Serial speech-handle scheduler: strict FIFO, one active handle.
async fn run_scheduler(
    session: AgentSession,
    mut rx: mpsc::UnboundedReceiver<QueueEntry>,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        let entry = tokio::select! {
            () = cancel.cancelled() => break,
            entry = rx.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };
        {
            let mut sched = lock(&session.inner.sched);
            sched.queued.retain(|h| h.id() != entry.handle.id());
            sched.active = Some(entry.handle.clone());
        }
        if entry.handle.is_cancelled() {
            entry.handle.mark(SpeechState::Done(entry.handle.terminal_hint()));
            lock(&session.inner.sched).active = None;
            continue;
        }

        // Predecessor playback is done by construction of the serial loop.
        entry.handle.release_gate(Gate::ParentDone);

        let agent = session.current_agent();
        let tools = match ToolRegistry::from_tools(agent.tools()) {
            Ok(tools) => Arc::new(tools),
            Err(e) => {
                session.emit_error(format!("invalid tool registry: {e}"));
                Arc::new(ToolRegistry::new())
            }
        };
        let io = (
            session.inner.audio_output.get().map(Arc::clone),
            session.inner.synchronizer.get().map(Arc::clone),
        );
        let (Some(audio_output), Some(synchronizer)) = io else {
            session.emit_error("speech scheduled before session start".into());
            entry.handle.mark(SpeechState::Done(DoneReason::Failed));
            lock(&session.inner.sched).active = None;
            continue;
        };
        let deps = SpeechDeps {
            session: session.clone(),
            llm: agent.llm().or_else(|| session.inner.components.llm.clone()),
            tts: agent
                .tts()
                .unwrap_or_else(|| Arc::clone(&session.inner.components.tts)),
            audio_output,
            synchronizer,
            tools,
            options: session.inner.components.options.clone(),
            conn: session.inner.components.conn.clone(),
            instructions: entry
                .instructions_override
                .unwrap_or_else(|| agent.instructions()),
            tool_choice: entry.tool_choice,
            extra_user_input: entry.extra_user_input,
        };

        run_speech(entry.handle.clone(), deps, entry.job).await;
        lock(&session.inner.sched).active = None;
    }
}

/// Recognition hooks bridging C1 into the session.
struct SessionHooks {
    session: Weak<SessionInner>,
}

impl SessionHooks {
    fn session(&self) -> Option<AgentSession> {
        self.session.upgrade().map(|inner| AgentSession { inner })
    }
}

#[async_trait]
impl RecognitionHooks for SessionHooks {
    async fn on_start_of_speech(&self, ev: &VadEvent) {
        let Some(session) = self.session() else { return };
        if let Some(_handle) = session.active_interruptible_handle() {
            if session.inner.detector_tx.get().is_some() {
                *lock(&session.inner.overlap_open) = true;
                session.send_detector(DetectorInput::OverlapSpeechStarted {
                    speech_duration_s: ev.speech_duration.as_secs_f64(),
                    transcript: None,
                });
            } else {
                // No classifier configured: plain VAD barge-in.
                session.interrupt_active(DoneReason::Interrupted, true);
            }
        }
    }

    async fn on_vad_inference_done(&self, _ev: &VadEvent) {}

    async fn on_end_of_speech(&self, _ev: &VadEvent) {
        let Some(session) = self.session() else { return };
        let was_overlap = {
            let mut overlap = lock(&session.inner.overlap_open);
            std::mem::take(&mut *overlap)
        };
        if was_overlap {
            session.send_detector(DetectorInput::OverlapSpeechEnded);
        }
    }

    async fn on_interim_transcript(&self, ev: &SpeechEvent) {
        let Some(session) = self.session() else { return };
        if let Some(text) = ev.text() {
            session.emit(SessionEvent::UserInputTranscribed {
                transcript: text.to_string(),
                is_final: false,
            });
        }
    }

    async fn on_final_transcript(&self, ev: &SpeechEvent) {
        let Some(session) = self.session() else { return };
        if let Some(text) = ev.text() {
            session.emit(SessionEvent::UserInputTranscribed {
                transcript: text.to_string(),
                is_final: true,
            });
        }
    }

    async fn on_preflight_transcript(&self, ev: &SpeechEvent) {
        let Some(session) = self.session() else { return };
        if let Some(text) = ev.text() {
            session.handle_preflight(text);
        }
    }

    async fn on_end_of_turn(&self, info: EndOfTurnInfo) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        session.handle_end_of_turn(info).await
    }

    async fn on_recognition_error(&self, error: VoxaError) {
        if let Some(session) = self.session() {
            session.emit_error(format!("recognition failed: {error}"));
        }
    }

    fn current_chat_ctx(&self) -> ChatContext {
        self.session()
            .map(|s| s.chat_ctx_snapshot())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::StaticAgent;
    use crate::room::LoopbackAudioOutput;
    use crate::sync::chan::stream_channel;
    use crate::test_utils::{FakeLlm, FakeStt, FakeTts, FakeVad};

    fn components() -> SessionComponents {
        SessionComponents {
            stt: FakeStt::new(),
            llm: Some(FakeLlm::new(Vec::new())),
            tts: FakeTts::new(),
            vad: FakeVad::new(),
            turn_detector: None,
            interruption: None,
            options: VoiceOptions::default(),
            conn: ConnOptions::default(),
        }
    }

    #[tokio::test]
    async fn operations_require_start() {
        let session = AgentSession::new(components());
        assert!(session.generate_reply(None, None).is_err());
        assert!(session.say("hello", false).is_err());
        assert_eq!(session.agent_state(), AgentState::Initializing);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let session = AgentSession::new(components());
        let output = LoopbackAudioOutput::new(false);
        let (_tx, rx) = stream_channel();
        session
            .start(Arc::new(StaticAgent::new("a")), rx, output.clone(), None)
            .await
            .unwrap();
        let (_tx2, rx2) = stream_channel();
        assert!(
            session
                .start(Arc::new(StaticAgent::new("b")), rx2, output.clone(), None)
                .await
                .is_err()
        );
        session.close().await;
        output.close();
    }

    #[tokio::test]
    async fn close_emits_close_event_once() {
        let session = AgentSession::new(components());
        let output = LoopbackAudioOutput::new(false);
        let (_tx, rx) = stream_channel();
        session
            .start(Arc::new(StaticAgent::new("a")), rx, output.clone(), None)
            .await
            .unwrap();
        let mut events = session.subscribe();
        session.close().await;
        session.close().await;
        let mut saw_close = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Close) {
                saw_close += 1;
            }
        }
        assert_eq!(saw_close, 1);
        output.close();
    }
}
