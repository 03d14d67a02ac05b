use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::output::{ConnectionSettings, Control, Outbound};
use crate::pipeline::stats::{LivenessState, ThroughputStats};
use crate::pipeline::Pipeline;
use crate::transport::Transport;

/// Agent orchestrates all components: health server, pipeline actor, and the
/// socket transport. The consumer drives it through `control` and drains the
/// output channel obtained from `take_output`.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    liveness: Arc<LivenessState>,
    stats: Arc<ThroughputStats>,
    pipeline: Pipeline,
    transport: Option<Transport>,
    /// Settings of the current session, used for idempotent reconnects.
    current: Option<ConnectionSettings>,
    out_rx: Option<mpsc::Receiver<Outbound>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics and the pipeline.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let liveness = Arc::new(LivenessState::new());
        let stats = Arc::new(ThroughputStats::new());

        let (out_tx, out_rx) = mpsc::channel(cfg.pipeline.channel_capacity);
        let pipeline = Pipeline::new(
            cfg.pipeline.clone(),
            Arc::clone(&health),
            Arc::clone(&stats),
            out_tx,
        );

        Ok(Self {
            cfg,
            health,
            liveness,
            stats,
            pipeline,
            transport: None,
            current: None,
            out_rx: Some(out_rx),
            cancel: CancellationToken::new(),
        })
    }

    /// Takes the output channel. The consumer owns the receiving end; the
    /// agent never reads its own output.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Outbound>> {
        self.out_rx.take()
    }

    /// Start the health server and pipeline, then connect with the settings
    /// from configuration.
    pub async fn start(&mut self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        self.pipeline
            .start(self.cancel.child_token())
            .context("starting pipeline")?;

        let settings = ConnectionSettings {
            grid_search_id: self.cfg.server.grid_search_id.clone(),
            socket_url: self.cfg.server.socket_url.clone(),
            rest_api_url: self.cfg.server.rest_api_url.clone(),
        };
        self.control(Control::Connect(settings)).await?;

        info!("agent fully started");

        Ok(())
    }

    /// Applies one control message from the consumer.
    pub async fn control(&mut self, control: Control) -> Result<()> {
        match control {
            Control::Connect(settings) => {
                if self.liveness.is_connected() && self.current.as_ref() == Some(&settings) {
                    debug!("already connected with identical settings");
                    return Ok(());
                }

                // A connect with different settings replaces the session.
                if let Some(transport) = self.transport.take() {
                    transport.disconnect().await;
                }

                let transport = Transport::connect(
                    settings.clone(),
                    self.cfg.liveness.ping_interval,
                    Arc::clone(&self.liveness),
                    Arc::clone(&self.stats),
                    self.pipeline.frame_sender(),
                )
                .await
                .context("connecting transport")?;

                self.transport = Some(transport);
                self.current = Some(settings);
            }

            Control::Close => {
                self.current = None;
                match self.transport.take() {
                    Some(transport) => transport.disconnect().await,
                    None => debug!("close with no active session"),
                }
            }
        }

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Close the session first so the pipeline sees the disconnect.
        if let Some(transport) = self.transport.take() {
            transport.disconnect().await;
        }

        self.cancel.cancel();
        self.pipeline.wait_for_shutdown().await;

        if let Err(e) = self.health.stop().await {
            warn!(error = %e, "error stopping health metrics server");
        }

        Ok(())
    }
}
