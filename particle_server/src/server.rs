//! Server implementation.
//!
//! A relay for the shared scene graph:
//! - One task per connection reads requests and forwards them to the hub
//! - A writer task per connection drains that session's event queue
//! - The hub owns the [`SceneGraph`] and is the only place it is mutated
//!
//! Requests from one session are applied in arrival order, and events for one
//! session are written in the order the hub produced them.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Context;
use particle_shared::{
    config::ServerConfig,
    net::{ReliableConn, ReliableListener},
    protocol::{Event, NodeId, Request, SessionId, UserId, PROTOCOL_VERSION},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::graph::{Delivery, SceneGraph};

/// Messages from connection tasks to the hub.
#[derive(Debug)]
enum Inbound {
    Open {
        session: SessionId,
        username: String,
        tx: mpsc::UnboundedSender<Event>,
    },
    Request {
        session: SessionId,
        request: Request,
    },
    Closed {
        session: SessionId,
    },
}

/// An admitted session.
struct Member {
    user_id: UserId,
    avatar_id: NodeId,
    tx: mpsc::UnboundedSender<Event>,
}

/// Owns the graph and the per-session outbound queues.
struct Hub {
    graph: SceneGraph,
    members: HashMap<SessionId, Member>,
}

impl Hub {
    fn new() -> Self {
        Self {
            graph: SceneGraph::new(),
            members: HashMap::new(),
        }
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(msg) = inbox.recv().await {
            self.handle(msg);
        }
        debug!("Hub stopped");
    }

    fn handle(&mut self, msg: Inbound) {
        match msg {
            Inbound::Open {
                session,
                username,
                tx,
            } => match self.graph.connect(session, &username) {
                Ok(out) => {
                    let (user_id, avatar_id) = match out.first().map(|d| &d.event) {
                        Some(&Event::ConnectAccept {
                            user_id, avatar_id, ..
                        }) => (user_id, avatar_id),
                        _ => return,
                    };
                    info!(session, user_id, avatar_id, %username, "Client connected");
                    self.members.insert(
                        session,
                        Member {
                            user_id,
                            avatar_id,
                            tx,
                        },
                    );
                    self.deliver(out);
                }
                Err(reason) => {
                    warn!(session, %reason, "Connection rejected");
                    let _ = tx.send(Event::ConnectTerminate { reason });
                }
            },
            Inbound::Request {
                session,
                request: Request::Terminate,
            } => {
                if let Some(member) = self.members.get(&session) {
                    let _ = member.tx.send(Event::ConnectTerminate {
                        reason: "terminated by client".to_string(),
                    });
                }
                self.drop_member(session);
            }
            Inbound::Request { session, request } => {
                let Some(member) = self.members.get(&session) else {
                    return;
                };
                let out = self
                    .graph
                    .apply(session, member.user_id, member.avatar_id, request);
                self.deliver(out);
            }
            Inbound::Closed { session } => self.drop_member(session),
        }
    }

    fn drop_member(&mut self, session: SessionId) {
        let Some(member) = self.members.remove(&session) else {
            return;
        };
        info!(session, user_id = member.user_id, "Client disconnected");
        let out = self.graph.disconnect(session, member.avatar_id);
        self.deliver(out);
    }

    fn deliver(&self, out: Vec<Delivery>) {
        for Delivery { to, event } in out {
            if let Some(member) = self.members.get(&to) {
                if member.tx.send(event).is_err() {
                    debug!(session = to, "Dropping event for closed session");
                }
            }
        }
    }
}

/// Reads one connection until it closes.
async fn serve_connection(
    session: SessionId,
    conn: ReliableConn,
    inbox: mpsc::UnboundedSender<Inbound>,
) -> anyhow::Result<()> {
    let (mut reader, mut writer) = conn.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    match reader.recv::<Request>().await.context("await connect")? {
        Request::Connect {
            protocol, username, ..
        } if protocol == PROTOCOL_VERSION => {
            inbox
                .send(Inbound::Open {
                    session,
                    username,
                    tx,
                })
                .context("hub stopped")?;
        }
        Request::Connect { protocol, .. } => {
            writer
                .send(&Event::ConnectTerminate {
                    reason: format!("unsupported protocol {protocol}"),
                })
                .await?;
            return Ok(());
        }
        other => anyhow::bail!("expected Connect, got {other:?}"),
    }

    // Ends once the hub drops the session's sender.
    let writer_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let mut batch = vec![event];
            while let Ok(more) = rx.try_recv() {
                batch.push(more);
            }
            if let Err(e) = writer.send_all(&batch).await {
                debug!(session, error = %e, "Write failed");
                break;
            }
        }
    });

    loop {
        match reader.recv::<Request>().await {
            Ok(request) => {
                if inbox.send(Inbound::Request { session, request }).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(session, error = %e, "Connection closed");
                break;
            }
        }
    }

    let _ = inbox.send(Inbound::Closed { session });
    let _ = writer_task.await;
    Ok(())
}

/// Scene server.
pub struct SceneServer {
    pub cfg: ServerConfig,
    listener: ReliableListener,
}

impl SceneServer {
    /// Binds the listening socket from the config.
    pub async fn bind(cfg: ServerConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.listen_addr.parse().context("parse listen_addr")?;
        let listener = ReliableListener::bind(addr).await?;
        Ok(Self { cfg, listener })
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> anyhow::Result<()> {
        let (inbox, rx) = mpsc::unbounded_channel();
        let hub = tokio::spawn(Hub::new().run(rx));

        let mut next_session: SessionId = 1;
        let result = loop {
            let (conn, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e),
            };
            let session = next_session;
            next_session = next_session.wrapping_add(1).max(1);
            debug!(session, %peer, "Connection accepted");

            let inbox = inbox.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(session, conn, inbox).await {
                    warn!(session, %peer, error = %e, "Connection failed");
                }
            });
        };

        hub.abort();
        result
    }
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral() -> anyhow::Result<(SceneServer, ServerConfig)> {
    let cfg = ServerConfig {
        listen_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
    };
    let mut server = SceneServer::bind(cfg).await?;
    let addr = server.local_addr()?;
    server.cfg.listen_addr = addr.to_string();
    let cfg = server.cfg.clone();
    Ok((server, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(hub: &mut Hub, session: SessionId, name: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.handle(Inbound::Open {
            session,
            username: name.to_string(),
            tx,
        });
        rx
    }

    #[test]
    fn rejected_session_gets_terminate_and_no_membership() {
        let mut hub = Hub::new();
        let mut rx = open(&mut hub, 1, "");
        assert!(matches!(
            rx.try_recv(),
            Ok(Event::ConnectTerminate { .. })
        ));
        assert!(hub.members.is_empty());
    }

    #[test]
    fn terminate_confirms_and_removes_avatar() {
        let mut hub = Hub::new();
        let mut rx = open(&mut hub, 1, "alice");
        let avatar = match rx.try_recv() {
            Ok(Event::ConnectAccept { avatar_id, .. }) => avatar_id,
            other => panic!("unexpected {other:?}"),
        };
        assert!(hub.graph.contains(avatar));

        hub.handle(Inbound::Request {
            session: 1,
            request: Request::Terminate,
        });
        assert!(matches!(
            rx.try_recv(),
            Ok(Event::ConnectTerminate { .. })
        ));
        assert!(!hub.graph.contains(avatar));
        assert!(hub.members.is_empty());
        // The queue closes with the membership.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn closed_session_is_announced_to_watchers() {
        let mut hub = Hub::new();
        let mut a = open(&mut hub, 1, "a");
        let mut b = open(&mut hub, 2, "b");
        let avatar_a = match a.try_recv() {
            Ok(Event::ConnectAccept { avatar_id, .. }) => avatar_id,
            other => panic!("unexpected {other:?}"),
        };
        let _ = b.try_recv();
        hub.handle(Inbound::Request {
            session: 2,
            request: Request::NodeSubscribe { node_id: avatar_a },
        });

        hub.handle(Inbound::Closed { session: 1 });
        assert_eq!(
            b.try_recv().ok(),
            Some(Event::NodeDestroy { node_id: avatar_a })
        );
    }
}
