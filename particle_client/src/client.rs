//! Client implementation.
//!
//! The client maintains:
//! - A reliable stream to the scene server, split into a reader task that
//!   forwards decoded events into a channel and a writer used for requests
//! - The synchronization [`Session`]
//! - The frame timer thread, whose ticks wake the event loop
//! - The render thread (receiver role)
//!
//! Each wake drains every pending event, lets the session publish the current
//! frame (sender role) and flushes queued requests in one write.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use particle_shared::{
    config::{ClientConfig, ClientFlags, Role},
    net::{with_default_port, FrameWriter, ReliableConn},
    particle_data::RefParticleData,
    protocol::{Event, Request, DEFAULT_PORT, PROTOCOL_VERSION},
    sender::SenderPool,
};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::render::{CaptureRenderer, LogRenderer, RenderBackend, RenderLoop, RENDER_PERIOD};
use crate::session::{ConnState, Flow, Session, SessionConfig};
use crate::ticker::FrameTicker;

/// Outbound side of the connection.
#[async_trait]
pub trait RequestSink: Send {
    async fn send_batch(&mut self, requests: &[Request]) -> anyhow::Result<()>;
}

#[async_trait]
impl RequestSink for FrameWriter {
    async fn send_batch(&mut self, requests: &[Request]) -> anyhow::Result<()> {
        self.send_all(requests).await
    }
}

/// Asks a running client to disconnect cleanly.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.notify.notify_one();
    }
}

/// High-level particle client.
pub struct ParticleClient {
    cfg: ClientConfig,
    session: Session,
    pool: Arc<SenderPool>,
    events: mpsc::UnboundedReceiver<Event>,
    sink: Box<dyn RequestSink>,
    reader: JoinHandle<()>,
    wake: Arc<Semaphore>,
    shutdown: Arc<Notify>,
    renderer: Option<Box<dyn RenderBackend>>,
}

impl ParticleClient {
    /// Connects, authenticates and applies the server's accept.
    ///
    /// Fails if the server cannot be reached or rejects the connection.
    pub async fn connect(cfg: &ClientConfig, data: Arc<RefParticleData>) -> anyhow::Result<Self> {
        let addr = with_default_port(&cfg.server_addr, DEFAULT_PORT);
        let secure = cfg.flags.contains(ClientFlags::SECURE);
        if secure {
            warn!("Secure transport requested but not available, using plain TCP");
        }

        info!(server = %addr, role = %cfg.role, user = %cfg.username, "Connecting to server");
        let mut conn = ReliableConn::connect(&addr).await?;
        conn.send(&Request::Connect {
            protocol: PROTOCOL_VERSION,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            secure,
        })
        .await?;

        let accept: Event = conn.recv().await.context("await connect accept")?;
        if let Event::ConnectTerminate { reason } = &accept {
            anyhow::bail!("connection rejected: {reason}");
        }
        if !matches!(accept, Event::ConnectAccept { .. }) {
            anyhow::bail!("expected ConnectAccept, got {accept:?}");
        }

        let pool = Arc::new(SenderPool::new(cfg.sender_count, cfg.role, data));
        let mut session = Session::new(SessionConfig::from(cfg), Arc::clone(&pool));
        session.handle(accept);

        let (mut reader_half, writer_half) = conn.into_split();
        let (tx, events) = mpsc::unbounded_channel();
        let wake = Arc::new(Semaphore::new(0));
        let reader = {
            let wake = Arc::clone(&wake);
            tokio::spawn(async move {
                loop {
                    match reader_half.recv::<Event>().await {
                        Ok(ev) => {
                            let last = matches!(ev, Event::ConnectTerminate { .. });
                            if tx.send(ev).is_err() || last {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "Server stream closed");
                            break;
                        }
                    }
                }
                // Closing the channel; wake the loop so it notices.
                drop(tx);
                wake.add_permits(1);
            })
        };

        Ok(Self {
            cfg: cfg.clone(),
            session,
            pool,
            events,
            sink: Box::new(writer_half),
            reader,
            wake,
            shutdown: Arc::new(Notify::new()),
            renderer: None,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn pool(&self) -> &Arc<SenderPool> {
        &self.pool
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            notify: Arc::clone(&self.shutdown),
        }
    }

    /// Replaces the render backend chosen from the configuration.
    pub fn with_renderer(mut self, backend: Box<dyn RenderBackend>) -> Self {
        self.renderer = Some(backend);
        self
    }

    fn default_renderer(&self) -> anyhow::Result<Box<dyn RenderBackend>> {
        if self.cfg.flags.contains(ClientFlags::SCREENCAST) {
            Ok(Box::new(CaptureRenderer::create(Path::new(
                &self.cfg.capture_path,
            ))?))
        } else {
            Ok(Box::new(LogRenderer::default()))
        }
    }

    /// Runs until the server terminates the session.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let ticker = FrameTicker::spawn(
            Arc::clone(&self.pool),
            self.cfg.frame_period(),
            Arc::clone(&self.wake),
        )
        .context("start frame timer")?;

        let render = match self.cfg.role {
            Role::Receiver => {
                let backend = match self.renderer.take() {
                    Some(b) => b,
                    None => self.default_renderer()?,
                };
                Some(
                    RenderLoop::spawn(Arc::clone(&self.pool), self.cfg.visual, backend, RENDER_PERIOD)
                        .context("start render loop")?,
                )
            }
            Role::Sender => None,
        };

        let result = self.event_loop().await;

        ticker.stop();
        if let Some(render) = render {
            render.stop();
        }
        self.reader.abort();
        result
    }

    async fn event_loop(&mut self) -> anyhow::Result<()> {
        self.flush().await?;

        loop {
            tokio::select! {
                permit = self.wake.acquire() => {
                    permit.context("wake semaphore closed")?.forget();
                }
                _ = self.shutdown.notified() => {
                    self.session.request_shutdown();
                }
            }

            let mut closed = false;
            loop {
                match self.events.try_recv() {
                    Ok(ev) => {
                        if self.session.handle(ev) == Flow::Terminate {
                            break;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }

            if self.session.state() == ConnState::Terminated {
                info!("Session ended");
                return Ok(());
            }
            if closed {
                anyhow::bail!("connection closed by server");
            }

            self.session.publish_tick();
            self.flush().await?;
        }
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        let batch = self.session.drain_outbox();
        if batch.is_empty() {
            return Ok(());
        }
        self.sink
            .send_batch(&batch)
            .await
            .context("send requests")
    }
}
