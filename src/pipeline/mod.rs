pub mod buffer;
pub mod classify;
pub mod color;
pub mod stats;
pub mod store;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::event::decode_frame;
use crate::export::health::HealthMetrics;
use crate::output::{ConnectionSettings, ConnectionStatus, Outbound, StatusUpdate};

use self::buffer::BufferWindow;
use self::stats::ThroughputStats;
use self::store::AggregationStore;

/// Frame delivered from the transport to the pipeline actor.
#[derive(Debug)]
pub enum InboundFrame {
    /// Channel established and room joined.
    Connected { settings: ConnectionSettings },
    /// One raw text frame, decoded and classified by the pipeline.
    Payload(String),
    /// Liveness probe answered; round-trip time in milliseconds.
    Pong { rtt_ms: u64 },
    /// Channel torn down, by the client or by a transport error.
    Closed { reason: String },
}

/// The ingestion actor: classifies raw frames, buffers them under a dual
/// count/time bound, merges them into the aggregation store on flush, and
/// publishes consolidated deltas plus liveness status to the consumer.
///
/// All mutable state (buffer, store) is owned by the single spawned task;
/// everything else communicates with it by message passing.
pub struct Pipeline {
    cfg: PipelineConfig,
    health: Arc<HealthMetrics>,
    stats: Arc<ThroughputStats>,

    frame_tx: mpsc::Sender<InboundFrame>,
    /// Frame receiver, taken by `start`.
    frame_rx: Option<mpsc::Receiver<InboundFrame>>,
    out_tx: mpsc::Sender<Outbound>,

    run_task: Option<tokio::task::JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(
        cfg: PipelineConfig,
        health: Arc<HealthMetrics>,
        stats: Arc<ThroughputStats>,
        out_tx: mpsc::Sender<Outbound>,
    ) -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(cfg.channel_capacity);

        Self {
            cfg,
            health,
            stats,
            frame_tx,
            frame_rx: Some(frame_rx),
            out_tx,
            run_task: None,
        }
    }

    /// Sender used by the transport to hand frames to the actor.
    pub fn frame_sender(&self) -> mpsc::Sender<InboundFrame> {
        self.frame_tx.clone()
    }

    /// Spawns the run loop.
    pub fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let mut frame_rx = self.frame_rx.take().expect("start called more than once");
        let cfg = self.cfg.clone();
        let health = Arc::clone(&self.health);
        let stats = Arc::clone(&self.stats);
        let out_tx = self.out_tx.clone();

        let run_task = tokio::spawn(async move {
            let mut buffer = BufferWindow::new(cfg.max_messages);
            let mut store = AggregationStore::new();
            let mut connected = false;

            let mut flush_ticker = tokio::time::interval(cfg.window);
            flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut status_ticker = tokio::time::interval(cfg.status_interval);
            status_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        // Final forced flush before signaling downstream.
                        flush(&mut buffer, &mut store, &out_tx, &health).await;
                        if connected {
                            publish_disconnected(&out_tx, &health).await;
                        }
                        info!("pipeline stopped");
                        return;
                    }

                    Some(frame) = frame_rx.recv() => match frame {
                        InboundFrame::Connected { settings } => {
                            // Reconnect-with-new-parameters is the one path
                            // that intentionally resets aggregation state.
                            buffer.drain();
                            store.reset();
                            connected = true;
                            health.socket_connected.set(1.0);
                            send_status(
                                &out_tx,
                                StatusUpdate::connection(ConnectionStatus {
                                    is_socket_connected: true,
                                    grid_search_id: Some(settings.grid_search_id.clone()),
                                    rest_api_url: settings.rest_api_url.clone(),
                                }),
                            )
                            .await;
                            info!(
                                grid_search_id = %settings.grid_search_id,
                                "pipeline session started"
                            );
                        }

                        InboundFrame::Payload(text) => {
                            match decode_frame(&text) {
                                Ok(events) => {
                                    for event in events {
                                        health.events_received.inc();
                                        // Unbuffered count signal; dropped on a
                                        // full consumer channel rather than
                                        // stalling ingestion.
                                        let _ = out_tx
                                            .try_send(Outbound::Status(
                                                StatusUpdate::msg_count_increment(),
                                            ));

                                        if buffer.push(event) {
                                            flush(&mut buffer, &mut store, &out_tx, &health).await;
                                        }
                                    }
                                }
                                Err(e) => {
                                    // A malformed frame is dropped alone; the
                                    // buffer and connection stay intact.
                                    warn!(error = %e, "dropping malformed frame");
                                    health.events_dropped.inc();
                                    health
                                        .decode_errors
                                        .with_label_values(&[e.label()])
                                        .inc();
                                }
                            }
                            health.buffer_len.set(buffer.len() as f64);
                        }

                        InboundFrame::Pong { rtt_ms } => {
                            // Liveness is low-latency: published immediately,
                            // never routed through the buffer.
                            health.ping_ms.set(rtt_ms as f64);
                            send_status(&out_tx, StatusUpdate::ping(rtt_ms)).await;
                        }

                        InboundFrame::Closed { reason } => {
                            if connected {
                                connected = false;
                                flush(&mut buffer, &mut store, &out_tx, &health).await;
                                publish_disconnected(&out_tx, &health).await;
                                stats.reset();
                                info!(reason = %reason, "pipeline session closed");
                            } else {
                                debug!(reason = %reason, "close for inactive session");
                            }
                        }
                    },

                    _ = flush_ticker.tick() => {
                        // Never emit empty updates on the time bound.
                        if !buffer.is_empty() {
                            flush(&mut buffer, &mut store, &out_tx, &health).await;
                        }
                    }

                    _ = status_ticker.tick() => {
                        // Counter resets every tick regardless of connection
                        // state; throughput is only published while connected.
                        let received = stats.snapshot();
                        if connected {
                            let per_sec =
                                received as f64 / cfg.status_interval.as_secs_f64().max(f64::MIN_POSITIVE);
                            health.throughput.set(per_sec);
                            health.buffer_len.set(buffer.len() as f64);
                            send_status(&out_tx, StatusUpdate::throughput(per_sec)).await;
                        }
                    }
                }
            }
        });

        self.run_task = Some(run_task);

        info!(
            max_messages = self.cfg.max_messages,
            window = ?self.cfg.window,
            status_interval = ?self.cfg.status_interval,
            "pipeline started"
        );

        Ok(())
    }

    /// Waits for the run task to finish after cancellation.
    pub async fn wait_for_shutdown(&mut self) {
        if let Some(run_task) = self.run_task.take() {
            if let Err(e) = run_task.await {
                warn!(error = %e, "pipeline task join failed");
            }
        }
    }
}

/// Drains the window, merges every event into the store, and publishes the
/// consolidated delta. Events that fail normalization are skipped and
/// counted; protocol drift is surfaced in logs and metrics, not by tearing
/// down the stream.
async fn flush(
    buffer: &mut BufferWindow,
    store: &mut AggregationStore,
    out_tx: &mpsc::Sender<Outbound>,
    health: &HealthMetrics,
) {
    let drained = buffer.drain();
    if drained.is_empty() {
        return;
    }

    for raw in &drained {
        match raw.normalize() {
            Ok(event) => classify::apply(store, &event),
            Err(e) => {
                warn!(event_type = %raw.event_type, error = %e, "skipping event");
                health.events_dropped.inc();
                health.decode_errors.with_label_values(&[e.label()]).inc();
            }
        }
    }

    if let Some(update) = store.take_update() {
        health.batches_flushed.inc();
        health.rows_published.inc_by(update.table_data.len() as f64);
        health
            .chart_points_published
            .inc_by(update.charts_updates.len() as f64);
        debug!(
            rows = update.table_data.len(),
            chart_points = update.charts_updates.len(),
            headers_grown = update.table_headers.is_some(),
            "buffer flushed"
        );
        if out_tx.send(Outbound::Data(update)).await.is_err() {
            warn!("consumer channel closed, dropping publish");
        }
    }
}

/// Emits the disconnected status set exactly once per session: connection
/// down, ping and throughput forced to zero.
async fn publish_disconnected(out_tx: &mpsc::Sender<Outbound>, health: &HealthMetrics) {
    health.socket_connected.set(0.0);
    health.ping_ms.set(0.0);
    health.throughput.set(0.0);

    send_status(
        out_tx,
        StatusUpdate::connection(ConnectionStatus {
            is_socket_connected: false,
            grid_search_id: None,
            rest_api_url: None,
        }),
    )
    .await;
    send_status(out_tx, StatusUpdate::ping(0)).await;
    send_status(out_tx, StatusUpdate::throughput(0.0)).await;
}

async fn send_status(out_tx: &mpsc::Sender<Outbound>, status: StatusUpdate) {
    if out_tx.send(Outbound::Status(status)).await.is_err() {
        warn!("consumer channel closed, dropping status");
    }
}
