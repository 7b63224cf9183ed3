// Copyright 2024. The Banter Developers
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::time::Duration;

use banter_proto::{server_message, ConnectionOpen, ServerMessage};
use banter_shutdown::Shutdown;
use tokio::time::{sleep, timeout};

use super::*;
use crate::{
    config::PingPolicy,
    protocol::ProtocolClient,
    transport::{TransportCommand, TransportEvent, TransportHandle},
};

struct Harness {
    manager: ConnectionManagerHandle,
    commands: mpsc::Receiver<TransportCommand>,
    events_tx: mpsc::Sender<TransportEvent>,
    _shutdown: Shutdown,
}

fn harness(config: ClientConfig) -> Harness {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(64);
    let (auth_tx, auth_rx) = watch::channel(None);
    let shutdown = Shutdown::new();
    let protocol = ProtocolClient::spawn(
        config.clone(),
        TransportHandle::new(cmd_tx),
        event_rx,
        auth_rx,
        shutdown.to_signal(),
    );
    let manager = ConnectionManager::spawn_with(config, protocol, auth_tx, shutdown.to_signal());
    Harness {
        manager,
        commands: cmd_rx,
        events_tx: event_tx,
        _shutdown: shutdown,
    }
}

async fn next_command(harness: &mut Harness) -> TransportCommand {
    timeout(Duration::from_secs(5), harness.commands.recv())
        .await
        .expect("timed out waiting for a transport command")
        .expect("transport command channel closed")
}

async fn expect_no_command(harness: &mut Harness) {
    if let Ok(cmd) = timeout(Duration::from_millis(200), harness.commands.recv()).await {
        panic!("expected no transport command, got {}", describe(&cmd));
    }
}

fn describe(cmd: &Option<TransportCommand>) -> &'static str {
    match cmd {
        Some(TransportCommand::Start) => "Start",
        Some(TransportCommand::Stop) => "Stop",
        Some(TransportCommand::Send(..)) => "Send",
        Some(TransportCommand::Reconnect { .. }) => "Reconnect",
        None => "channel closed",
    }
}

async fn wait_for<F: Fn(&ManagerSnapshot) -> bool>(harness: &Harness, pred: F) -> ManagerSnapshot {
    let mut rx = harness.manager.watch_snapshots();
    timeout(Duration::from_secs(5), async move {
        loop {
            let snapshot = rx.borrow().clone();
            if pred(&snapshot) {
                return snapshot;
            }
            rx.changed().await.expect("snapshot channel closed");
        }
    })
    .await
    .expect("timed out waiting for a manager snapshot")
}

/// Feed the manager's transport through a full handshake to the connected state.
async fn open_connection(harness: &mut Harness) {
    harness
        .manager
        .set_auth_token(Some("token-1".to_string()))
        .await
        .unwrap();
    assert!(matches!(next_command(harness).await, TransportCommand::Start));
    harness.events_tx.send(TransportEvent::Connecting).await.unwrap();
    harness.events_tx.send(TransportEvent::Connected).await.unwrap();
    match next_command(harness).await {
        TransportCommand::Send(_, reply) => reply.send(Ok(())).unwrap(),
        _ => panic!("expected the ConnectionInit send"),
    }
    harness
        .events_tx
        .send(TransportEvent::Message(ServerMessage {
            id: 0,
            body: Some(server_message::Body::ConnectionOpen(ConnectionOpen {})),
        }))
        .await
        .unwrap();
    wait_for(harness, |s| s.state == ManagerState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn starts_only_when_constraints_met() {
    let mut harness = harness(ClientConfig::default());
    assert_eq!(harness.manager.current_snapshot().state, ManagerState::Idle);
    expect_no_command(&mut harness).await;

    harness
        .manager
        .set_auth_token(Some("token-1".to_string()))
        .await
        .unwrap();
    assert!(matches!(next_command(&mut harness).await, TransportCommand::Start));
    let snapshot = wait_for(&harness, |s| s.state == ManagerState::Connecting).await;
    assert!(snapshot.constraints.all_met());
}

#[tokio::test(start_paused = true)]
async fn set_auth_token_is_idempotent() {
    let mut harness = harness(ClientConfig::default());
    harness
        .manager
        .set_auth_token(Some("token-1".to_string()))
        .await
        .unwrap();
    assert!(matches!(next_command(&mut harness).await, TransportCommand::Start));
    // A refreshed token with the constraint already satisfied must not bounce the transport
    harness
        .manager
        .set_auth_token(Some("token-1".to_string()))
        .await
        .unwrap();
    harness
        .manager
        .set_auth_token(Some("token-2".to_string()))
        .await
        .unwrap();
    expect_no_command(&mut harness).await;
}

#[tokio::test(start_paused = true)]
async fn network_loss_pauses_and_recovery_resumes() {
    let mut harness = harness(ClientConfig::default());
    harness
        .manager
        .set_auth_token(Some("token-1".to_string()))
        .await
        .unwrap();
    assert!(matches!(next_command(&mut harness).await, TransportCommand::Start));

    harness.manager.set_network_up(false).await.unwrap();
    assert!(matches!(next_command(&mut harness).await, TransportCommand::Stop));
    let snapshot = wait_for(&harness, |s| s.state == ManagerState::WaitingForConstraints).await;
    assert!(!snapshot.constraints.network_up);

    harness.manager.set_network_up(true).await.unwrap();
    assert!(matches!(next_command(&mut harness).await, TransportCommand::Start));
}

#[tokio::test(start_paused = true)]
async fn auth_failure_clears_constraint_until_new_token() {
    let mut harness = harness(ClientConfig::default());
    open_connection(&mut harness).await;

    harness
        .events_tx
        .send(TransportEvent::Message(ServerMessage {
            id: 0,
            body: Some(server_message::Body::ConnectionError(banter_proto::ConnectionError {
                code: banter_proto::ConnectionErrorCode::AuthFailed as i32,
                message: "token revoked".to_string(),
            })),
        }))
        .await
        .unwrap();

    assert!(matches!(next_command(&mut harness).await, TransportCommand::Stop));
    let snapshot = wait_for(&harness, |s| s.state == ManagerState::WaitingForConstraints).await;
    assert!(!snapshot.constraints.auth_available);
    assert_eq!(snapshot.reason, Some(ManagerReason::AuthFailed));

    // No retry happens until the app provides a fresh token
    expect_no_command(&mut harness).await;
    harness
        .manager
        .set_auth_token(Some("token-2".to_string()))
        .await
        .unwrap();
    assert!(matches!(next_command(&mut harness).await, TransportCommand::Start));
}

#[tokio::test(start_paused = true)]
async fn ping_timeout_moves_to_backoff() {
    let mut config = ClientConfig::default();
    config.ping = PingPolicy {
        interval: Duration::from_millis(20),
        timeout_good: Duration::from_millis(30),
        timeout_constrained: Duration::from_millis(60),
    };
    let mut harness = harness(config);
    open_connection(&mut harness).await;

    // Swallow ping sends until the liveness check trips
    loop {
        match next_command(&mut harness).await {
            TransportCommand::Send(_, reply) => {
                reply.send(Ok(())).unwrap();
            },
            TransportCommand::Reconnect { skip_delay } => {
                assert!(skip_delay);
                break;
            },
            _ => panic!("unexpected command"),
        }
    }
    let snapshot = wait_for(&harness, |s| s.state == ManagerState::Backoff).await;
    assert_eq!(snapshot.reason, Some(ManagerReason::PingTimeout));
}

#[tokio::test(start_paused = true)]
async fn foreground_pokes_coalesce_within_window() {
    let mut harness = harness(ClientConfig::default());
    harness
        .manager
        .set_auth_token(Some("token-1".to_string()))
        .await
        .unwrap();
    assert!(matches!(next_command(&mut harness).await, TransportCommand::Start));

    // Still connecting; three rapid foreground pokes must collapse into one reconnect
    for _ in 0..3 {
        harness.manager.set_foregrounded(true).await.unwrap();
    }
    assert!(matches!(
        next_command(&mut harness).await,
        TransportCommand::Reconnect { skip_delay: true }
    ));
    expect_no_command(&mut harness).await;

    // Past the coalescing window a new poke reconnects again
    sleep(Duration::from_millis(200)).await;
    harness.manager.set_foregrounded(true).await.unwrap();
    assert!(matches!(
        next_command(&mut harness).await,
        TransportCommand::Reconnect { skip_delay: true }
    ));
}

#[tokio::test(start_paused = true)]
async fn connect_now_skips_backoff() {
    let mut harness = harness(ClientConfig::default());
    harness
        .manager
        .set_auth_token(Some("token-1".to_string()))
        .await
        .unwrap();
    assert!(matches!(next_command(&mut harness).await, TransportCommand::Start));

    harness.manager.connect_now().await.unwrap();
    assert!(matches!(
        next_command(&mut harness).await,
        TransportCommand::Reconnect { skip_delay: true }
    ));
}

#[tokio::test(start_paused = true)]
async fn stop_is_terminal_until_reconnected_explicitly() {
    let mut harness = harness(ClientConfig::default());
    open_connection(&mut harness).await;

    harness.manager.stop().await.unwrap();
    assert!(matches!(next_command(&mut harness).await, TransportCommand::Stop));
    let snapshot = wait_for(&harness, |s| s.state == ManagerState::Stopped).await;
    assert_eq!(snapshot.reason, Some(ManagerReason::Stopped));
}
