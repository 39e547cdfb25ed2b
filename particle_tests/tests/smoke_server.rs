use std::time::Duration;

use particle_server::server::bind_ephemeral;
use particle_shared::net::ReliableConn;
use particle_shared::protocol::{node_id, Event, Request, PROTOCOL_VERSION};

fn connect_request(username: &str) -> Request {
    Request::Connect {
        protocol: PROTOCOL_VERSION,
        username: username.to_string(),
        password: String::new(),
        secure: false,
    }
}

/// Smoke test: server accepts a login and answers a subscribe.
#[tokio::test]
async fn server_accepts_and_replays_root() -> anyhow::Result<()> {
    particle_tests::init_tracing();
    let (server, cfg) = bind_ephemeral().await?;
    let handle = tokio::spawn(server.run());

    let mut conn = ReliableConn::connect(&cfg.listen_addr).await?;
    conn.send(&connect_request("smoke")).await?;
    let avatar_id = match conn.recv::<Event>().await? {
        Event::ConnectAccept { avatar_id, .. } => avatar_id,
        other => anyhow::bail!("unexpected {other:?}"),
    };
    assert!(avatar_id >= node_id::FIRST_DYNAMIC);

    conn.send(&Request::NodeSubscribe {
        node_id: node_id::AVATAR_PARENT,
    })
    .await?;
    let replay = tokio::time::timeout(Duration::from_secs(5), conn.recv::<Event>()).await??;
    assert!(matches!(
        replay,
        Event::NodeCreate { node_id: id, parent_id: node_id::AVATAR_PARENT, .. } if id == avatar_id
    ));

    conn.send(&Request::Terminate).await?;
    let bye = tokio::time::timeout(Duration::from_secs(5), conn.recv::<Event>()).await??;
    assert!(matches!(bye, Event::ConnectTerminate { .. }));

    handle.abort();
    Ok(())
}

#[tokio::test]
async fn server_rejects_empty_username_and_bad_protocol() -> anyhow::Result<()> {
    particle_tests::init_tracing();
    let (server, cfg) = bind_ephemeral().await?;
    let handle = tokio::spawn(server.run());

    let mut conn = ReliableConn::connect(&cfg.listen_addr).await?;
    conn.send(&connect_request("")).await?;
    let reply = tokio::time::timeout(Duration::from_secs(5), conn.recv::<Event>()).await??;
    assert!(matches!(reply, Event::ConnectTerminate { .. }));

    let mut conn = ReliableConn::connect(&cfg.listen_addr).await?;
    conn.send(&Request::Connect {
        protocol: PROTOCOL_VERSION + 1,
        username: "future".into(),
        password: String::new(),
        secure: false,
    })
    .await?;
    let reply = tokio::time::timeout(Duration::from_secs(5), conn.recv::<Event>()).await??;
    assert!(matches!(reply, Event::ConnectTerminate { .. }));

    handle.abort();
    Ok(())
}
