//! Job process host and inference IPC.
//!
//! A worker process speaks newline-delimited JSON with its parent: an
//! initialize/prewarm handshake, a job start, ping/pong liveness, and an
//! inference relay that lets in-session components (the end-of-utterance
//! predictor in particular) run models hosted by the parent. A watchdog
//! closes the process when pings stop arriving — an orphaned job must not
//! outlive its worker.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::eou::InferenceRunner;
use crate::error::{Result, VoxaError};

/// Close the process when no ping arrives within this window.
pub const ORPHAN_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for one relayed inference round trip.
pub const INFERENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// One IPC message, wire shape `{"case": ..., "value": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "case", content = "value", rename_all = "camelCase")]
pub enum IpcMessage {
    /// Parent asks the child to load the agent module and prewarm.
    #[serde(rename_all = "camelCase")]
    InitializeRequest {
        /// Logger configuration forwarded to the child.
        logger_options: Option<serde_json::Value>,
    },
    /// Child reports ready.
    InitializeResponse {},
    /// Parent assigns a job.
    #[serde(rename_all = "camelCase")]
    StartJobRequest {
        /// Opaque job descriptor (room, token, metadata).
        running_job: serde_json::Value,
    },
    /// Liveness probe.
    #[serde(rename_all = "camelCase")]
    PingRequest {
        /// Parent's send timestamp (ms).
        timestamp: i64,
    },
    /// Liveness reply.
    #[serde(rename_all = "camelCase")]
    PongResponse {
        /// Echo of the probe timestamp.
        last_timestamp: i64,
        /// Child's send timestamp (ms).
        timestamp: i64,
    },
    /// Child requests remote inference.
    #[serde(rename_all = "camelCase")]
    InferenceRequest {
        /// Correlates with the response.
        request_id: String,
        /// Inference method name.
        method: String,
        /// Method payload.
        data: serde_json::Value,
    },
    /// Parent's inference reply.
    #[serde(rename_all = "camelCase")]
    InferenceResponse {
        /// Correlates with the request.
        request_id: String,
        /// Result payload on success.
        data: Option<serde_json::Value>,
        /// Error message on failure.
        error: Option<String>,
    },
    /// Parent asks for a graceful shutdown.
    ShutdownRequest {},
    /// Child announces it is exiting.
    #[serde(rename_all = "camelCase")]
    Exiting {
        /// Why the child is exiting.
        reason: String,
    },
    /// Child finished its assigned job.
    Done {},
}

/// Client half of the inference relay: sends requests up to the parent and
/// resolves replies by request id.
pub struct InferenceClient {
    out: mpsc::UnboundedSender<IpcMessage>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value>>>>,
}

impl InferenceClient {
    fn new(out: mpsc::UnboundedSender<IpcMessage>) -> Arc<Self> {
        Arc::new(Self {
            out,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Run a named inference method on the parent.
    ///
    /// # Errors
    ///
    /// Fails on relay shutdown, parent-reported errors, or timeout.
    pub async fn request(
        &self,
        method: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.clone(), tx);
        self.out
            .send(IpcMessage::InferenceRequest {
                request_id: request_id.clone(),
                method: method.to_string(),
                data,
            })
            .map_err(|_| VoxaError::Channel("IPC writer stopped".into()))?;

        match tokio::time::timeout(INFERENCE_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(VoxaError::Channel("inference relay dropped".into())),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&request_id);
                Err(VoxaError::Timeout(INFERENCE_TIMEOUT))
            }
        }
    }

    fn resolve(&self, request_id: &str, data: Option<serde_json::Value>, error: Option<String>) {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id);
        let Some(waiter) = waiter else {
            debug!(request_id, "inference response for unknown request");
            return;
        };
        let result = match error {
            Some(message) => Err(VoxaError::Session(format!("remote inference: {message}"))),
            None => Ok(data.unwrap_or(serde_json::Value::Null)),
        };
        let _ = waiter.send(result);
    }
}

#[async_trait]
impl InferenceRunner for InferenceClient {
    async fn infer(&self, method: &str, data: serde_json::Value) -> Result<serde_json::Value> {
        self.request(method, data).await
    }
}

type ShutdownCallback = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Context handed to the user's job entry point.
pub struct JobContext {
    /// Opaque job descriptor from the parent.
    pub running_job: serde_json::Value,
    /// Relay for remote inference (turn detection, etc.).
    pub inference: Arc<InferenceClient>,
    shutdown_callbacks: Mutex<Vec<ShutdownCallback>>,
    cancel: CancellationToken,
}

impl JobContext {
    /// Token cancelled when the job must shut down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register cleanup to run during graceful shutdown.
    pub fn add_shutdown_callback(&self, callback: impl Future<Output = ()> + Send + 'static) {
        self.shutdown_callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::pin(callback));
    }

    async fn run_shutdown_callbacks(&self) {
        let callbacks: Vec<ShutdownCallback> = std::mem::take(
            &mut *self
                .shutdown_callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for callback in callbacks {
            callback.await;
        }
    }
}

/// The user's agent module.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Load heavy assets (e.g. VAD weights) before jobs arrive.
    async fn prewarm(&self) {}

    /// Run one job to completion (ultimately calls `session.start`).
    ///
    /// # Errors
    ///
    /// A returned error is logged and reported to the parent.
    async fn entry(&self, ctx: Arc<JobContext>) -> Result<()>;
}

/// Run the job process over the given IPC transport until shutdown.
///
/// # Errors
///
/// Returns an error if the transport fails irrecoverably.
pub async fn run_job_process<R, W>(
    handler: Arc<dyn JobHandler>,
    reader: R,
    writer: W,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<IpcMessage>();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = out_rx.recv().await {
            let Ok(mut line) = serde_json::to_string(&message) else {
                continue;
            };
            line.push('\n');
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = writer.flush().await;
        }
    });

    let inference = InferenceClient::new(out_tx.clone());
    let job_cancel = CancellationToken::new();
    let mut job_ctx: Option<Arc<JobContext>> = None;
    let mut job_task: Option<tokio::task::JoinHandle<()>> = None;
    let last_ping = Arc::new(Mutex::new(Instant::now()));

    // Orphan watchdog: if the parent stops pinging, the worker is gone.
    let watchdog_cancel = CancellationToken::new();
    let watchdog = {
        let last_ping = Arc::clone(&last_ping);
        let job_cancel = job_cancel.clone();
        let cancel = watchdog_cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let elapsed = last_ping
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .elapsed();
                        if elapsed > ORPHAN_TIMEOUT {
                            error!("no ping for {elapsed:?}, assuming orphaned");
                            job_cancel.cancel();
                            break;
                        }
                    }
                }
            }
        })
    };

    let mut lines = BufReader::new(reader).lines();
    let exit_reason = loop {
        let line = tokio::select! {
            () = job_cancel.cancelled() => break "orphaned".to_string(),
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break "ipc closed".to_string(),
            Err(e) => break format!("ipc read error: {e}"),
        };
        if line.trim().is_empty() {
            continue;
        }
        let message: IpcMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("malformed IPC message ignored: {e}");
                continue;
            }
        };
        match message {
            IpcMessage::InitializeRequest { .. } => {
                handler.prewarm().await;
                let _ = out_tx.send(IpcMessage::InitializeResponse {});
                info!("job process initialized");
            }
            IpcMessage::StartJobRequest { running_job } => {
                if job_task.is_some() {
                    warn!("job already running, ignoring start request");
                    continue;
                }
                let ctx = Arc::new(JobContext {
                    running_job,
                    inference: Arc::clone(&inference),
                    shutdown_callbacks: Mutex::new(Vec::new()),
                    cancel: job_cancel.child_token(),
                });
                job_ctx = Some(Arc::clone(&ctx));
                let handler = Arc::clone(&handler);
                let out_tx = out_tx.clone();
                job_task = Some(tokio::spawn(async move {
                    if let Err(e) = handler.entry(Arc::clone(&ctx)).await {
                        error!("job entry failed: {e}");
                    }
                    let _ = out_tx.send(IpcMessage::Done {});
                }));
            }
            IpcMessage::PingRequest { timestamp } => {
                *last_ping.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                let _ = out_tx.send(IpcMessage::PongResponse {
                    last_timestamp: timestamp,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
            }
            IpcMessage::InferenceResponse {
                request_id,
                data,
                error,
            } => {
                inference.resolve(&request_id, data, error);
            }
            IpcMessage::ShutdownRequest {} => break "shutdown requested".to_string(),
            other => debug!("unexpected IPC message: {other:?}"),
        }
    };

    info!("job process exiting: {exit_reason}");
    job_cancel.cancel();
    if let Some(ctx) = job_ctx {
        ctx.run_shutdown_callbacks().await;
    }
    if let Some(task) = job_task {
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }
    let _ = out_tx.send(IpcMessage::Exiting {
        reason: exit_reason,
    });
    drop(out_tx);
    let _ = writer_task.await;
    watchdog_cancel.cancel();
    let _ = watchdog.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_line(message: &IpcMessage) -> String {
        let mut line = serde_json::to_string(message).expect("serializable message");
        line.push('\n');
        line
    }

    // ── wire format ───────────────────────────────────────────

    #[test]
    fn messages_serialize_with_case_and_value() {
        let message = IpcMessage::InferenceRequest {
            request_id: "r1".into(),
            method: "eou_predict".into(),
            data: serde_json::json!({"chat_ctx": []}),
        };
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["case"], "inferenceRequest");
        assert_eq!(wire["value"]["requestId"], "r1");
        assert_eq!(wire["value"]["method"], "eou_predict");
    }

    #[test]
    fn messages_round_trip() {
        let messages = vec![
            IpcMessage::InitializeRequest {
                logger_options: None,
            },
            IpcMessage::PingRequest { timestamp: 12345 },
            IpcMessage::PongResponse {
                last_timestamp: 12345,
                timestamp: 12350,
            },
            IpcMessage::ShutdownRequest {},
            IpcMessage::Exiting {
                reason: "test".into(),
            },
        ];
        for message in messages {
            let wire = serde_json::to_string(&message).unwrap();
            let back: IpcMessage = serde_json::from_str(&wire).unwrap();
            assert_eq!(back, message);
        }
    }

    // ── process loop ──────────────────────────────────────────

    struct EchoJob;

    #[async_trait]
    impl JobHandler for EchoJob {
        async fn entry(&self, ctx: Arc<JobContext>) -> Result<()> {
            // Exercise the inference relay from inside the job.
            let reply = ctx
                .inference
                .request("eou_predict", serde_json::json!({"chat_ctx": []}))
                .await?;
            assert_eq!(reply["probability"], 0.9);
            Ok(())
        }
    }

    #[tokio::test]
    async fn full_ipc_handshake_and_job() {
        let (parent_io, child_io) = tokio::io::duplex(64 * 1024);
        let (child_read, child_write) = tokio::io::split(child_io);
        let host = tokio::spawn(run_job_process(
            Arc::new(EchoJob) as Arc<dyn JobHandler>,
            child_read,
            child_write,
        ));

        let (parent_read, mut parent_write) = tokio::io::split(parent_io);
        let mut parent_lines = BufReader::new(parent_read).lines();

        // Initialize.
        parent_write
            .write_all(
                wire_line(&IpcMessage::InitializeRequest {
                    logger_options: None,
                })
                .as_bytes(),
            )
            .await
            .unwrap();
        let reply: IpcMessage =
            serde_json::from_str(&parent_lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply, IpcMessage::InitializeResponse {});

        // Start the job; answer its inference request.
        parent_write
            .write_all(
                wire_line(&IpcMessage::StartJobRequest {
                    running_job: serde_json::json!({"room": "test"}),
                })
                .as_bytes(),
            )
            .await
            .unwrap();

        let request: IpcMessage =
            serde_json::from_str(&parent_lines.next_line().await.unwrap().unwrap()).unwrap();
        let IpcMessage::InferenceRequest { request_id, method, .. } = request else {
            panic!("expected inference request, got {request:?}");
        };
        assert_eq!(method, "eou_predict");
        parent_write
            .write_all(
                wire_line(&IpcMessage::InferenceResponse {
                    request_id,
                    data: Some(serde_json::json!({"probability": 0.9})),
                    error: None,
                })
                .as_bytes(),
            )
            .await
            .unwrap();

        let done: IpcMessage =
            serde_json::from_str(&parent_lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(done, IpcMessage::Done {});

        // Shutdown.
        parent_write
            .write_all(wire_line(&IpcMessage::ShutdownRequest {}).as_bytes())
            .await
            .unwrap();
        let exiting: IpcMessage =
            serde_json::from_str(&parent_lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(exiting, IpcMessage::Exiting { .. }));

        host.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ping_gets_pong_with_echoed_timestamp() {
        struct NoopJob;
        #[async_trait]
        impl JobHandler for NoopJob {
            async fn entry(&self, _ctx: Arc<JobContext>) -> Result<()> {
                Ok(())
            }
        }

        let (parent_io, child_io) = tokio::io::duplex(16 * 1024);
        let (child_read, child_write) = tokio::io::split(child_io);
        let host = tokio::spawn(run_job_process(
            Arc::new(NoopJob) as Arc<dyn JobHandler>,
            child_read,
            child_write,
        ));

        let (parent_read, mut parent_write) = tokio::io::split(parent_io);
        let mut parent_lines = BufReader::new(parent_read).lines();

        parent_write
            .write_all(wire_line(&IpcMessage::PingRequest { timestamp: 777 }).as_bytes())
            .await
            .unwrap();
        let pong: IpcMessage =
            serde_json::from_str(&parent_lines.next_line().await.unwrap().unwrap()).unwrap();
        let IpcMessage::PongResponse { last_timestamp, .. } = pong else {
            panic!("expected pong, got {pong:?}");
        };
        assert_eq!(last_timestamp, 777);

        drop(parent_write);
        host.await.unwrap().unwrap();
    }
}
