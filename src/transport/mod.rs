use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::output::ConnectionSettings;
use crate::pipeline::stats::{now_unix_ms, LivenessState, ThroughputStats};
use crate::pipeline::InboundFrame;

/// One live WebSocket session: a read task feeding frames to the pipeline
/// and a prober task that owns the write half and drives ping/pong liveness.
///
/// The transport recovers nothing itself. Any error surfaces as a single
/// `Closed` frame and the session ends; reconnecting is a new `connect`.
pub struct Transport {
    cancel: CancellationToken,
    read_task: tokio::task::JoinHandle<()>,
    ping_task: tokio::task::JoinHandle<()>,
}

impl Transport {
    /// Dials the socket, joins the grid-search room, and spawns the session
    /// tasks. The `Connected` frame is delivered before any payload.
    pub async fn connect(
        settings: ConnectionSettings,
        ping_interval: Duration,
        liveness: Arc<LivenessState>,
        stats: Arc<ThroughputStats>,
        frame_tx: mpsc::Sender<InboundFrame>,
    ) -> Result<Self> {
        let (ws_stream, _) = connect_async(&settings.socket_url)
            .await
            .with_context(|| format!("connecting to {}", settings.socket_url))?;

        let (mut write, mut read) = ws_stream.split();

        // Join the room before anything else flows on the socket.
        let join = serde_json::json!({
            "event_id": "join",
            "data": { "grid_search_id": settings.grid_search_id },
        });
        write
            .send(Message::Text(join.to_string()))
            .await
            .context("sending join frame")?;

        info!(
            url = %settings.socket_url,
            grid_search_id = %settings.grid_search_id,
            "socket connected"
        );

        liveness.reset();
        liveness.set_connected(true);
        frame_tx
            .send(InboundFrame::Connected {
                settings: settings.clone(),
            })
            .await
            .context("pipeline channel closed")?;

        let cancel = CancellationToken::new();

        let read_task = tokio::spawn({
            let cancel = cancel.clone();
            let liveness = Arc::clone(&liveness);
            let frame_tx = frame_tx.clone();

            async move {
                let reason = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break "closed by client".to_string(),

                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                stats.record();
                                if frame_tx.send(InboundFrame::Payload(text)).await.is_err() {
                                    break "pipeline stopped".to_string();
                                }
                            }
                            Some(Ok(Message::Pong(_))) => {
                                let rtt_ms = liveness.mark_pong(now_unix_ms());
                                if frame_tx.send(InboundFrame::Pong { rtt_ms }).await.is_err() {
                                    break "pipeline stopped".to_string();
                                }
                            }
                            Some(Ok(Message::Ping(_))) => {
                                // The pong reply is queued by the protocol
                                // layer and goes out with the next write.
                                debug!("server ping");
                            }
                            Some(Ok(Message::Close(frame))) => {
                                break frame
                                    .map(|f| f.reason.to_string())
                                    .unwrap_or_else(|| "closed by server".to_string());
                            }
                            Some(Ok(_)) => {
                                debug!("ignoring non-text frame");
                            }
                            Some(Err(e)) => break e.to_string(),
                            None => break "stream ended".to_string(),
                        },
                    }
                };

                liveness.reset();
                warn!(reason = %reason, "socket read loop ended");
                let _ = frame_tx.send(InboundFrame::Closed { reason }).await;
            }
        });

        let ping_task = tokio::spawn({
            let cancel = cancel.clone();
            let liveness = Arc::clone(&liveness);

            async move {
                let mut ticker = tokio::time::interval(ping_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = write.send(Message::Close(None)).await;
                            return;
                        }

                        _ = ticker.tick() => {
                            // At most one probe in flight. An unanswered ping
                            // keeps the gate shut so RTT is never measured
                            // against the wrong probe.
                            if liveness.probe_outstanding() {
                                debug!("probe outstanding, skipping ping");
                                continue;
                            }

                            liveness.mark_ping(now_unix_ms());
                            if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                                warn!(error = %e, "ping send failed");
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            cancel,
            read_task,
            ping_task,
        })
    }

    /// Closes the session and waits for both tasks. The read task emits the
    /// `Closed` frame on its way out, so teardown follows the same path as a
    /// server-initiated close.
    pub async fn disconnect(self) {
        self.cancel.cancel();
        if let Err(e) = self.ping_task.await {
            warn!(error = %e, "ping task join failed");
        }
        if let Err(e) = self.read_task.await {
            warn!(error = %e, "read task join failed");
        }
    }
}
