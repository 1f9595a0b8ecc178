//! The generation pipeline behind one speech handle.
//!
//! Streams LLM tokens into TTS into the room's audio output, forking text
//! to the transcription synchronizer, executing tool calls between steps,
//! and honoring authorization gates and mid-flight cancellation. LLM and
//! TTS warm up as soon as the handle is created; audio is withheld until
//! every gate releases.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::chat::{ChatContext, ChatItem, ChatMessage, ChatRole, FunctionCallOutput};
use crate::config::{ConnOptions, VoiceOptions};
use crate::error::{Result, VoxaError};
use crate::llm::{ChatRequest, Llm, LlmStream, ToolChoice};
use crate::room::{AudioOutput, PlaybackFinished};
use crate::session::{AgentSession, TurnMetrics};
use crate::speech::{DoneReason, SpeechHandle, SpeechState};
use crate::sync::task::TaskHandle;
use crate::tools::{RunContext, ToolOutcome, ToolRegistry};
use crate::transcription::TranscriptSynchronizer;
use crate::tts::{Tts, TtsInput, TtsStream};

/// Everything a speech handle's pipeline needs from its session.
pub struct SpeechDeps {
    /// The owning session (tool contexts, chat persistence, handoffs).
    pub session: AgentSession,
    /// LLM for generated replies; `None` for `say`.
    pub llm: Option<Arc<dyn Llm>>,
    /// TTS provider.
    pub tts: Arc<dyn Tts>,
    /// Room audio publisher.
    pub audio_output: Arc<dyn AudioOutput>,
    /// Transcript pacing.
    pub synchronizer: Arc<TranscriptSynchronizer>,
    /// Tools of the active agent.
    pub tools: Arc<ToolRegistry>,
    /// Session voice options.
    pub options: VoiceOptions,
    /// Provider connection options.
    pub conn: ConnOptions,
    /// Active agent instructions, injected at the head of each request.
    pub instructions: String,
    /// Tool-choice constraint for the first step.
    pub tool_choice: ToolChoice,
    /// Ephemeral user input appended to the request context but not
    /// persisted (preemptive generation runs on the preflight text before
    /// the turn commits).
    pub extra_user_input: Option<String>,
}

/// What the handle should speak.
pub enum SpeechJob {
    /// Full LLM generation over the current chat context.
    Generate,
    /// TTS-only utterance.
    Say {
        /// The exact text to speak.
        text: String,
        /// Persist the utterance as an assistant message.
        add_to_chat_ctx: bool,
    },
}

/// Drive a speech handle to its terminal state.
pub async fn run_speech(handle: SpeechHandle, deps: SpeechDeps, job: SpeechJob) {
    let result = match job {
        SpeechJob::Say {
            text,
            add_to_chat_ctx,
        } => run_say(&handle, &deps, &text, add_to_chat_ctx).await,
        SpeechJob::Generate => run_generate(&handle, &deps).await,
    };
    match result {
        Ok(reason) => handle.mark(SpeechState::Done(reason)),
        Err(e) => {
            if e.is_aborted() {
                handle.mark(SpeechState::Done(handle.terminal_hint()));
            } else {
                // Errors after authorization are user-audible gaps; surface
                // them. Earlier errors cancel the handle silently.
                if handle.state().rank_at_least_playing() {
                    deps.session.emit_error(format!("speech pipeline failed: {e}"));
                } else {
                    debug!("speech handle {} failed before speaking: {e}", handle.id());
                }
                handle.mark(SpeechState::Done(DoneReason::Failed));
            }
        }
    }
    deps.session.notify_agent_speaking(false);
}

impl SpeechState {
    fn rank_at_least_playing(self) -> bool {
        matches!(self, Self::Playing | Self::Done(_))
    }
}

async fn run_say(
    handle: &SpeechHandle,
    deps: &SpeechDeps,
    text: &str,
    add_to_chat_ctx: bool,
) -> Result<DoneReason> {
    handle.mark(SpeechState::Generating);
    let mut tts = open_tts(deps).await?;
    if !aligned_transcript(deps) {
        deps.synchronizer.push_text(text).await;
    }
    tts.push_text(text).await?;
    tts.flush().await?;
    tts.end_input();

    let audio = spawn_audio_pump(handle, deps, tts);
    let _ = audio.join().await;
    let playback = finish_playout(handle, deps).await;
    let transcript = deps
        .synchronizer
        .mark_playback_finished(playback.interrupted)
        .await;

    if add_to_chat_ctx && !transcript.trim().is_empty() {
        persist_assistant_message(handle, deps, &transcript, playback.interrupted);
    }
    Ok(if playback.interrupted {
        handle.terminal_hint()
    } else {
        DoneReason::Completed
    })
}

async fn run_generate(handle: &SpeechHandle, deps: &SpeechDeps) -> Result<DoneReason> {
    let llm = deps
        .llm
        .clone()
        .ok_or_else(|| VoxaError::Llm("no LLM configured for generated replies".into()))?;

    let mut tool_choice = deps.tool_choice.clone();
    loop {
        handle.mark(SpeechState::Generating);
        let request = build_request(deps, &tool_choice);
        let started = Instant::now();
        let stream = llm.chat(request).await?;

        let tts = open_tts(deps).await?;
        let step = run_generation_step(handle, deps, stream, tts, started).await?;

        let playback = finish_playout(handle, deps).await;
        let transcript = deps
            .synchronizer
            .mark_playback_finished(playback.interrupted)
            .await;
        if !transcript.trim().is_empty() {
            persist_assistant_message(handle, deps, &transcript, playback.interrupted);
        }
        deps.session.emit_metrics(TurnMetrics {
            llm_ttft: step.ttft,
            tts_ttfb: step.ttfb,
            ..TurnMetrics::default()
        });

        if playback.interrupted || handle.is_cancelled() {
            return Ok(handle.terminal_hint());
        }

        if step.tool_calls.is_empty() {
            return Ok(DoneReason::Completed);
        }
        if handle.step_index() >= deps.options.max_tool_steps {
            warn!(
                "speech handle {} hit max tool steps ({})",
                handle.id(),
                deps.options.max_tool_steps
            );
            return Ok(DoneReason::Completed);
        }

        handle.bump_step();
        let handed_off = execute_tool_calls(handle, deps, step.tool_calls, &llm).await?;
        if handed_off {
            // The incoming agent generates its own (chained) reply.
            return Ok(DoneReason::Completed);
        }
        // Subsequent steps let the model decide freely.
        tool_choice = ToolChoice::Auto;
    }
}

/// Output of one LLM → TTS step.
struct StepOutput {
    tool_calls: Vec<crate::chat::FunctionCall>,
    ttft: Option<Duration>,
    ttfb: Option<Duration>,
}

/// Read the LLM stream, feeding text into TTS and the synchronizer while
/// the audio pump forwards synthesized frames.
async fn run_generation_step(
    handle: &SpeechHandle,
    deps: &SpeechDeps,
    mut stream: LlmStream,
    mut tts: TtsStream,
    started: Instant,
) -> Result<StepOutput> {
    let cancel = handle.cancellation_token();
    let mut tool_calls = Vec::new();
    let mut ttft = None;

    let audio = spawn_audio_pump(handle, deps, tts_split_output(&mut tts));

    let read_result: Result<()> = async {
        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => break,
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            if let Some(delta) = chunk.delta {
                if let Some(text) = delta.content
                    && !text.is_empty()
                {
                    ttft.get_or_insert_with(|| started.elapsed());
                    if !aligned_transcript(deps) {
                        deps.synchronizer.push_text(&text).await;
                    }
                    tts.push_text(&text).await?;
                }
                tool_calls.extend(delta.tool_calls);
            }
        }
        Ok(())
    }
    .await;

    if cancel.is_cancelled() {
        stream.cancel();
    }
    let _ = tts.flush().await;
    tts.end_input();

    let ttfb = audio.join().await.flatten();
    read_result?;

    Ok(StepOutput {
        tool_calls,
        ttft,
        ttfb,
    })
}

/// Detach the output half of a TTS stream so the input half can keep
/// receiving text concurrently. The pump only reads the output; the
/// placeholder halves are inert.
fn tts_split_output(tts: &mut TtsStream) -> TtsStream {
    let (mut placeholder_in, _closed_rx) = crate::sync::chan::stream_channel::<TtsInput>();
    placeholder_in.close();
    let (_closed_tx, placeholder_out) = crate::sync::chan::stream_channel();
    let output = std::mem::replace(&mut tts.output, placeholder_out);
    TtsStream {
        input: placeholder_in,
        output,
    }
}

/// Forward synthesized audio to the room, gated on authorization.
///
/// Returns the time to first audio byte, if any audio flowed.
fn spawn_audio_pump(
    handle: &SpeechHandle,
    deps: &SpeechDeps,
    mut tts: TtsStream,
) -> TaskHandle<Option<Duration>> {
    let handle = handle.clone();
    let session = deps.session.clone();
    let audio_output = Arc::clone(&deps.audio_output);
    let synchronizer = Arc::clone(&deps.synchronizer);
    let aligned = aligned_transcript(deps);
    let started = Instant::now();
    TaskHandle::spawn_with_token(handle.cancellation_token(), move |cancel| async move {
        let mut ttfb = None;
        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => break,
                chunk = tts.next_chunk() => chunk,
            };
            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    warn!("TTS stream error: {e}");
                    break;
                }
                None => break,
            };
            if ttfb.is_none() {
                // Hold audio until every gate releases; generation already
                // warmed up the providers.
                if handle.wait_authorized().await.is_err() {
                    break;
                }
                handle.mark(SpeechState::Authorized);
                handle.mark(SpeechState::Playing);
                session.notify_agent_speaking(true);
                ttfb = Some(started.elapsed());
            }
            let duration = chunk.frame.duration();
            let delta_text = chunk.delta_text.clone();
            if audio_output.capture_frame(chunk.frame).await.is_err() {
                break;
            }
            synchronizer.push_audio(duration).await;
            if aligned && let Some(text) = delta_text {
                synchronizer.push_aligned_text(&text).await;
            }
        }
        ttfb
    })
}

/// Whether provider-aligned text replaces the paced transcript.
fn aligned_transcript(deps: &SpeechDeps) -> bool {
    deps.options.use_tts_aligned_transcript && deps.tts.capabilities().aligned_transcript
}

/// Flush the audio publisher and wait for the playout acknowledgement,
/// truncating buffered audio if the handle is cancelled mid-playout.
async fn finish_playout(handle: &SpeechHandle, deps: &SpeechDeps) -> PlaybackFinished {
    let cancel = handle.cancellation_token();
    if cancel.is_cancelled() {
        deps.audio_output.clear_buffer();
        return deps.audio_output.wait_for_playout().await;
    }
    deps.audio_output.flush();
    tokio::select! {
        playback = deps.audio_output.wait_for_playout() => playback,
        () = cancel.cancelled() => {
            deps.audio_output.clear_buffer();
            deps.audio_output.wait_for_playout().await
        }
    }
}

fn persist_assistant_message(
    handle: &SpeechHandle,
    deps: &SpeechDeps,
    transcript: &str,
    interrupted: bool,
) {
    let mut message = ChatMessage::text(ChatRole::Assistant, transcript.trim_end());
    message.interrupted = interrupted;
    let item = ChatItem::Message(message);
    handle.add_chat_item(item.clone());
    deps.session.insert_chat_item(item);
    info!(
        interrupted,
        "assistant said: {:?}",
        truncate_for_log(transcript)
    );
}

fn truncate_for_log(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(80)
        .map_or(text.len(), |(idx, _)| idx);
    &text[..end]
}

fn build_request(deps: &SpeechDeps, tool_choice: &ToolChoice) -> ChatRequest {
    let snapshot = deps.session.chat_ctx_snapshot();
    let mut ctx = ChatContext::new();
    if !deps.instructions.is_empty() {
        let mut instructions = ChatMessage::text(ChatRole::System, deps.instructions.clone());
        instructions.created_at = snapshot
            .items()
            .first()
            .map_or_else(crate::chat::monotonic_now_ms, |i| i.created_at() - 1);
        ctx.insert(ChatItem::Message(instructions));
    }
    for item in snapshot.items() {
        ctx.insert(item.clone());
    }
    if let Some(input) = &deps.extra_user_input {
        ctx.insert(ChatItem::Message(ChatMessage::text(
            ChatRole::User,
            input.clone(),
        )));
    }
    let mut request = ChatRequest::new(ctx);
    request.tools = deps.tools.definitions();
    request.tool_choice = tool_choice.clone();
    request.parallel_tool_calls = Some(deps.options.parallel_tool_calls);
    request.conn = deps.conn.clone();
    request
}

/// Execute the collected tool calls; returns `true` when a handoff swapped
/// the active agent.
async fn execute_tool_calls(
    handle: &SpeechHandle,
    deps: &SpeechDeps,
    calls: Vec<crate::chat::FunctionCall>,
    llm: &Arc<dyn Llm>,
) -> Result<bool> {
    let parallel =
        deps.options.parallel_tool_calls && llm.capabilities().parallel_tool_calls && calls.len() > 1;

    let mut handoff: Option<Arc<dyn Agent>> = None;
    if parallel {
        let futures: Vec<_> = calls
            .iter()
            .map(|call| execute_one_call(handle, deps, call))
            .collect();
        let outcomes = futures_util::future::join_all(futures).await;
        for (call, outcome) in calls.iter().zip(outcomes) {
            handoff = record_outcome(handle, deps, call, outcome).or(handoff);
        }
    } else {
        for call in &calls {
            let outcome = execute_one_call(handle, deps, call).await;
            handoff = record_outcome(handle, deps, call, outcome).or(handoff);
        }
    }

    if let Some(agent) = handoff {
        deps.session.apply_handoff(agent, handle).await;
        return Ok(true);
    }
    Ok(false)
}

async fn execute_one_call(
    handle: &SpeechHandle,
    deps: &SpeechDeps,
    call: &crate::chat::FunctionCall,
) -> ToolOutcome {
    // Stamp receipt time: provider-side timestamps would break context
    // chronology.
    let mut recorded = call.clone();
    recorded.created_at = crate::chat::monotonic_now_ms();
    let item = ChatItem::FunctionCall(recorded);
    handle.add_chat_item(item.clone());
    deps.session.insert_chat_item(item);

    let Some(tool) = deps.tools.get(&call.name) else {
        return ToolOutcome::Error(format!("unknown tool: {}", call.name));
    };
    let args: serde_json::Value = match serde_json::from_str(&call.args) {
        Ok(v) => v,
        Err(e) => return ToolOutcome::Error(format!("invalid tool arguments: {e}")),
    };
    let ctx = RunContext {
        session: deps.session.clone(),
        speech_handle: handle.clone(),
        chat_ctx: deps.session.chat_ctx_snapshot(),
    };
    debug!(tool = %call.name, "executing tool call");
    tool.execute(&ctx, args).await
}

/// Append the function output for one call. Returns the handoff target if
/// the outcome requested one.
fn record_outcome(
    handle: &SpeechHandle,
    deps: &SpeechDeps,
    call: &crate::chat::FunctionCall,
    outcome: ToolOutcome,
) -> Option<Arc<dyn Agent>> {
    let (output, is_error, agent) = match outcome {
        ToolOutcome::Value(v) => (v, false, None),
        ToolOutcome::Error(e) => (e, true, None),
        ToolOutcome::Handoff(h) => (
            h.returns
                .unwrap_or_else(|| "Transferring the conversation.".to_string()),
            false,
            Some(h.agent),
        ),
    };
    let item = ChatItem::FunctionCallOutput(FunctionCallOutput::new(
        call.call_id.clone(),
        call.name.clone(),
        output,
        is_error,
    ));
    handle.add_chat_item(item.clone());
    deps.session.insert_chat_item(item);
    agent
}

async fn open_tts(deps: &SpeechDeps) -> Result<TtsStream> {
    if deps.tts.capabilities().streaming {
        deps.tts.stream(&deps.conn).await
    } else {
        crate::tts::StreamAdapter::new(Arc::clone(&deps.tts))
            .stream(&deps.conn)
            .await
    }
}
