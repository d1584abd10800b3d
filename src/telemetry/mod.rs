// Telemetry module - hands request logs to the event bus off the request path

use bytes::Bytes;
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::TelemetryConfig;
use crate::proxy::log::{RequestLog, UsageEvent};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to connect to NATS: {0}")]
    Connect(#[from] async_nats::ConnectError),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to publish to {subject}: {message}")]
    Publish { subject: String, message: String },
}

/// Where request logs end up.
#[derive(Clone)]
pub enum EventSink {
    /// Publish to NATS subjects.
    Nats {
        client: async_nats::Client,
        subject: String,
        billing_subject: Option<String>,
    },
    /// Write each record to the tracing log.
    Log,
    /// Keep records in memory.
    Recorder(Arc<Mutex<Vec<RequestLog>>>),
}

impl EventSink {
    pub async fn connect(config: &TelemetryConfig) -> Result<Self, TelemetryError> {
        let client = async_nats::connect(config.nats_url.as_str()).await?;
        tracing::info!("[Telemetry] Connected to NATS at {}", config.nats_url);
        Ok(EventSink::Nats {
            client,
            subject: config.subject.clone(),
            billing_subject: config.billing_subject.clone().filter(|s| !s.is_empty()),
        })
    }

    pub fn recorder() -> (Self, Arc<Mutex<Vec<RequestLog>>>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        (EventSink::Recorder(records.clone()), records)
    }

    async fn publish(&self, log: &RequestLog) -> Result<(), TelemetryError> {
        match self {
            EventSink::Nats {
                client,
                subject,
                billing_subject,
            } => {
                let payload = Bytes::from(serde_json::to_vec(log)?);
                client
                    .publish(subject.clone(), payload)
                    .await
                    .map_err(|e| TelemetryError::Publish {
                        subject: subject.clone(),
                        message: e.to_string(),
                    })?;
                tracing::debug!("[Telemetry] Published request log {} to {}", log.id, subject);

                if let Some(billing_subject) = billing_subject {
                    if log.error_type.is_empty() {
                        let event = UsageEvent::from(log);
                        let payload = Bytes::from(serde_json::to_vec(&event)?);
                        client
                            .publish(billing_subject.clone(), payload)
                            .await
                            .map_err(|e| TelemetryError::Publish {
                                subject: billing_subject.clone(),
                                message: e.to_string(),
                            })?;
                    }
                }
                Ok(())
            }
            EventSink::Log => {
                tracing::info!(
                    target: "relay::request_log",
                    trace_id = %log.trace_id,
                    user_id = %log.user_id,
                    platform = %log.platform,
                    provider = %log.provider,
                    model = %log.model,
                    http_code = log.http_code,
                    input_tokens = log.input_tokens,
                    output_tokens = log.output_tokens,
                    error_type = %log.error_type,
                    "request completed in {:.3}s",
                    log.duration_sec
                );
                Ok(())
            }
            EventSink::Recorder(records) => {
                records.lock().push(log.clone());
                Ok(())
            }
        }
    }

    async fn flush(&self) {
        if let EventSink::Nats { client, .. } = self {
            if let Err(e) = client.flush().await {
                tracing::warn!("[Telemetry] Failed to flush NATS client: {}", e);
            }
        }
    }
}

/// Bounded queue in front of a single publishing task. Emitting never waits:
/// when the queue is full the record is dropped and counted.
pub struct TelemetryEmitter {
    tx: Mutex<Option<mpsc::Sender<RequestLog>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: IntCounter,
}

impl TelemetryEmitter {
    pub fn start(sink: EventSink, capacity: usize, dropped: IntCounter) -> Self {
        let (tx, mut rx) = mpsc::channel::<RequestLog>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(log) = rx.recv().await {
                if let Err(e) = sink.publish(&log).await {
                    tracing::error!("[Telemetry] Dropping request log {}: {}", log.id, e);
                }
            }
            sink.flush().await;
            tracing::debug!("[Telemetry] Worker stopped");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            dropped,
        }
    }

    pub fn emit(&self, log: RequestLog) {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            tracing::debug!("[Telemetry] Emitter closed, discarding {}", log.id);
            return;
        };
        match tx.try_send(log) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(log)) => {
                self.dropped.inc();
                tracing::warn!("[Telemetry] Queue full, dropped request log {}", log.id);
            }
            Err(mpsc::error::TrySendError::Closed(log)) => {
                tracing::debug!("[Telemetry] Worker gone, discarding {}", log.id);
            }
        }
    }

    /// Stop accepting records and wait up to `timeout` for queued ones to be
    /// published.
    pub async fn shutdown(&self, timeout: Duration) {
        self.tx.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if tokio::time::timeout(timeout, worker).await.is_err() {
                tracing::warn!("[Telemetry] Timed out draining queue");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::log::RequestContext;
    use crate::provider::Platform;

    fn log(n: usize) -> RequestLog {
        let ctx = RequestContext {
            trace_id: format!("t-{}", n),
            request_id: format!("r-{}", n),
            user_id: "u".to_string(),
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            user_agent: None,
            authorization: None,
        };
        RequestLog::new(&ctx, Platform::Claude, "claude-3-opus", false)
    }

    fn counter() -> IntCounter {
        IntCounter::new("dropped", "dropped").unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let (sink, records) = EventSink::recorder();
        let emitter = TelemetryEmitter::start(sink, 16, counter());
        for n in 0..5 {
            emitter.emit(log(n));
        }
        emitter.shutdown(Duration::from_secs(1)).await;

        let records = records.lock();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].trace_id, "t-0");
        assert_eq!(records[4].trace_id, "t-4");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_queue_drops_and_counts() {
        let (sink, records) = EventSink::recorder();
        let dropped = counter();
        let emitter = TelemetryEmitter::start(sink, 2, dropped.clone());

        // The worker cannot run until this task yields.
        for n in 0..5 {
            emitter.emit(log(n));
        }
        assert_eq!(dropped.get(), 3);

        emitter.shutdown(Duration::from_secs(1)).await;
        assert_eq!(records.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_emit_after_shutdown_is_ignored() {
        let (sink, records) = EventSink::recorder();
        let emitter = TelemetryEmitter::start(sink, 4, counter());
        emitter.shutdown(Duration::from_secs(1)).await;
        emitter.emit(log(0));
        assert!(records.lock().is_empty());
    }
}
