//! Text-to-speech capability contract.
//!
//! Providers either stream audio incrementally from pushed text
//! ([`Tts::stream`]) or synthesize one segment at a time
//! ([`Tts::synthesize`]). [`StreamAdapter`] turns the latter into the
//! former by buffering sentence segments, so the generation pipeline always
//! talks to a streaming interface.

use async_trait::async_trait;
use uuid::Uuid;

use crate::audio::AudioFrame;
use crate::config::ConnOptions;
use crate::error::{Result, VoxaError};
use crate::sync::chan::{StreamReader, StreamWriter, stream_channel};
use crate::text::split_sentences;

use std::sync::Arc;
use std::time::Duration;

/// Deadline for the next synthesized chunk, re-armed on each chunk.
///
/// A very slow first chunk after a long silence can race this timeout.
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(10);

/// One chunk of synthesized audio.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    /// Provider request id.
    pub request_id: String,
    /// Segment id; one handle may produce several segments.
    pub segment_id: String,
    /// The audio payload.
    pub frame: AudioFrame,
    /// Whether this is the last chunk of its segment.
    pub is_final: bool,
    /// Text span this chunk covers, for providers with aligned transcripts.
    pub delta_text: Option<String>,
}

/// What a TTS implementation supports.
#[derive(Debug, Clone, Copy, Default)]
pub struct TtsCapabilities {
    /// Supports incremental input streaming.
    pub streaming: bool,
    /// Emits per-chunk aligned text.
    pub aligned_transcript: bool,
}

/// Input to a streaming synthesis session.
#[derive(Debug, Clone)]
pub enum TtsInput {
    /// A text fragment (token or sentence).
    Text(String),
    /// Close the current segment and start synthesizing it.
    Flush,
}

/// A live synthesis stream: text in, audio out.
pub struct TtsStream {
    /// Text input half.
    pub input: StreamWriter<TtsInput>,
    /// Synthesized audio chunks.
    pub output: StreamReader<Result<SynthesizedAudio>>,
}

impl TtsStream {
    /// Push a text fragment.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the stream input is closed.
    pub async fn push_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.input.write(TtsInput::Text(text.into())).await
    }

    /// Flush the current segment.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the stream input is closed.
    pub async fn flush(&mut self) -> Result<()> {
        self.input.write(TtsInput::Flush).await
    }

    /// Close the input; remaining audio drains, then the output ends.
    pub fn end_input(&mut self) {
        self.input.close();
    }

    /// Next audio chunk, bounded by [`CHUNK_TIMEOUT`].
    ///
    /// Returns `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Option<Result<SynthesizedAudio>> {
        match tokio::time::timeout(CHUNK_TIMEOUT, self.output.recv()).await {
            Ok(item) => item,
            Err(_) => Some(Err(VoxaError::Timeout(CHUNK_TIMEOUT))),
        }
    }
}

/// Text-to-speech capability.
#[async_trait]
pub trait Tts: Send + Sync {
    /// Provider label for logs and errors.
    fn label(&self) -> &str;

    /// Output sample rate, fixed per instance.
    fn sample_rate(&self) -> u32;

    /// Output channel count; synthesized speech is mono.
    fn num_channels(&self) -> u16 {
        1
    }

    /// What this provider supports.
    fn capabilities(&self) -> TtsCapabilities;

    /// Synthesize one complete text segment as a chunked stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be initiated.
    async fn synthesize(&self, text: &str, conn: &ConnOptions) -> Result<TtsStream>;

    /// Open an incremental synthesis session.
    ///
    /// # Errors
    ///
    /// The default implementation reports streaming as unsupported; wrap
    /// the provider in a [`StreamAdapter`] instead.
    async fn stream(&self, _conn: &ConnOptions) -> Result<TtsStream> {
        Err(VoxaError::Tts(format!(
            "{} does not support input streaming",
            self.label()
        )))
    }
}

/// Adapts a segment-at-a-time TTS into the streaming interface.
///
/// Buffers pushed text until a flush (or input close), splits it into
/// sentences, and synthesizes them sequentially, forwarding chunks under a
/// single segment id per flush.
pub struct StreamAdapter {
    inner: Arc<dyn Tts>,
}

impl StreamAdapter {
    /// Wrap a non-streaming provider.
    pub fn new(inner: Arc<dyn Tts>) -> Self {
        Self { inner }
    }

    /// Open an adapted streaming session.
    ///
    /// # Errors
    ///
    /// Never fails to open; per-segment synthesis errors are forwarded on
    /// the output stream.
    pub async fn stream(&self, conn: &ConnOptions) -> Result<TtsStream> {
        let (input, mut text_rx) = stream_channel::<TtsInput>();
        let (mut out_tx, output) = stream_channel();
        let tts = Arc::clone(&self.inner);
        let conn = conn.clone();

        tokio::spawn(async move {
            let mut pending = String::new();
            loop {
                let item = text_rx.recv().await;
                let ended = item.is_none();
                let flush_now = ended || matches!(item, Some(TtsInput::Flush));
                if let Some(TtsInput::Text(t)) = item {
                    pending.push_str(&t);
                }
                if flush_now {
                    let text = std::mem::take(&mut pending);
                    if !text.trim().is_empty() {
                        let segment_id = format!("seg_{}", Uuid::new_v4().simple());
                        if forward_segment(&*tts, &conn, &text, &segment_id, &mut out_tx)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    if ended {
                        break;
                    }
                }
            }
            out_tx.close();
        });

        Ok(TtsStream { input, output })
    }
}

/// Synthesize `text` sentence by sentence under one segment id.
async fn forward_segment(
    tts: &dyn Tts,
    conn: &ConnOptions,
    text: &str,
    segment_id: &str,
    out: &mut StreamWriter<Result<SynthesizedAudio>>,
) -> Result<()> {
    let sentences = split_sentences(text);
    let last_idx = sentences.len().saturating_sub(1);
    for (idx, sentence) in sentences.iter().enumerate() {
        let mut chunked = match tts.synthesize(sentence, conn).await {
            Ok(stream) => stream,
            Err(e) => {
                out.write(Err(e)).await?;
                continue;
            }
        };
        while let Some(chunk) = chunked.next_chunk().await {
            match chunk {
                Ok(mut audio) => {
                    audio.segment_id = segment_id.to_string();
                    // Only the very last sentence's final chunk closes the segment.
                    audio.is_final = audio.is_final && idx == last_idx;
                    out.write(Ok(audio)).await?;
                }
                Err(e) => {
                    out.write(Err(e)).await?;
                    break;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One-shot fake that emits a single silent chunk per call.
    struct OneShotTts;

    #[async_trait]
    impl Tts for OneShotTts {
        fn label(&self) -> &str {
            "one-shot"
        }
        fn sample_rate(&self) -> u32 {
            24_000
        }
        fn capabilities(&self) -> TtsCapabilities {
            TtsCapabilities {
                streaming: false,
                aligned_transcript: false,
            }
        }
        async fn synthesize(&self, text: &str, _conn: &ConnOptions) -> Result<TtsStream> {
            let (mut input, _drop_rx) = stream_channel::<TtsInput>();
            input.close();
            let (mut tx, output) = stream_channel();
            let text = text.to_string();
            tokio::spawn(async move {
                let _ = tx
                    .write(Ok(SynthesizedAudio {
                        request_id: "req".into(),
                        segment_id: "tmp".into(),
                        frame: AudioFrame::silence(240, 24_000, 1),
                        is_final: true,
                        delta_text: Some(text),
                    }))
                    .await;
                tx.close();
            });
            Ok(TtsStream { input, output })
        }
    }

    #[tokio::test]
    async fn adapter_buffers_until_flush() {
        let adapter = StreamAdapter::new(Arc::new(OneShotTts));
        let mut stream = adapter.stream(&ConnOptions::default()).await.unwrap();
        stream.push_text("Hello ").await.unwrap();
        stream.push_text("world.").await.unwrap();
        stream.flush().await.unwrap();
        stream.end_input();

        let chunk = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk.delta_text.as_deref(), Some("Hello world."));
        assert!(chunk.is_final);
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn adapter_splits_sentences_single_segment() {
        let adapter = StreamAdapter::new(Arc::new(OneShotTts));
        let mut stream = adapter.stream(&ConnOptions::default()).await.unwrap();
        stream.push_text("One. Two.").await.unwrap();
        stream.end_input();

        let first = stream.next_chunk().await.unwrap().unwrap();
        let second = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.segment_id, second.segment_id);
        assert!(!first.is_final, "only the last sentence closes the segment");
        assert!(second.is_final);
    }

    #[tokio::test]
    async fn default_stream_is_unsupported() {
        let tts = OneShotTts;
        assert!(tts.stream(&ConnOptions::default()).await.is_err());
    }
}
