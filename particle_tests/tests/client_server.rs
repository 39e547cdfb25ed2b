//! Full socket-based integration tests: sender client → server → receiver client.

use std::sync::Arc;
use std::time::Duration;

use particle_client::render::NullRenderer;
use particle_client::ParticleClient;
use particle_server::server::bind_ephemeral;
use particle_shared::config::Role;
use particle_shared::particle_data::{BphysicsLoader, DatasetLoader};
use particle_tests::{client_config, init_tracing, wait_until, Dataset};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sender_frames_reach_receiver() -> anyhow::Result<()> {
    init_tracing();

    let (server, server_cfg) = bind_ephemeral().await?;
    let addr = server_cfg.listen_addr.clone();
    let server_handle = tokio::spawn(server.run());

    let dataset = Dataset::generate("e2e", 4, 40)?;
    let data = Arc::new(BphysicsLoader.load(dataset.path())?);
    assert_eq!(data.frame_count(), 40);
    assert_eq!(data.particle_count(), 4);

    let sender_cfg = client_config(Role::Sender, &addr, &dataset, "sender");
    let sender = ParticleClient::connect(&sender_cfg, Arc::clone(&data)).await?;
    let sender_stop = sender.shutdown_handle();
    let sender_handle = tokio::spawn(sender.run());

    let receiver_cfg = client_config(Role::Receiver, &addr, &dataset, "receiver");
    let receiver = ParticleClient::connect(&receiver_cfg, Arc::clone(&data))
        .await?
        .with_renderer(Box::new(NullRenderer));
    let pool = Arc::clone(receiver.pool());
    let receiver_stop = receiver.shutdown_handle();
    let receiver_handle = tokio::spawn(receiver.run());

    let received = wait_until(Duration::from_secs(10), || {
        pool.get(0)
            .and_then(|s| s.received().map(|r| r.summary()))
            .map_or(false, |s| s.in_time > 0 && s.in_time >= s.delayed)
    })
    .await;
    let summary = pool.get(0).and_then(|s| s.received().map(|r| r.summary()));
    assert!(
        received,
        "receiver clock never lined up with the sender: {summary:?}"
    );
    assert!(pool.get(0).map_or(false, |s| s.timer.is_running()));

    sender_stop.shutdown();
    tokio::time::timeout(Duration::from_secs(5), sender_handle).await???;

    // The sender node is gone: the receiver stops its clock.
    let stopped = wait_until(Duration::from_secs(5), || {
        pool.get(0).map_or(false, |s| !s.timer.is_running())
    })
    .await;
    assert!(stopped, "receiver kept a destroyed sender running");

    receiver_stop.shutdown();
    tokio::time::timeout(Duration::from_secs(5), receiver_handle).await???;

    server_handle.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_login_fails_connect() -> anyhow::Result<()> {
    init_tracing();

    let (server, server_cfg) = bind_ephemeral().await?;
    let server_handle = tokio::spawn(server.run());

    let dataset = Dataset::generate("reject", 1, 4)?;
    let data = Arc::new(BphysicsLoader.load(dataset.path())?);
    let cfg = client_config(Role::Receiver, &server_cfg.listen_addr, &dataset, "");

    let err = match ParticleClient::connect(&cfg, data).await {
        Ok(_) => anyhow::bail!("empty username was accepted"),
        Err(e) => e,
    };
    assert!(err.to_string().contains("rejected"), "{err:#}");

    server_handle.abort();
    Ok(())
}
