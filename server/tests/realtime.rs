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

//! End-to-end: the real client stack against a real server over a loopback WebSocket.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use banter_client::{
    config::ClientConfig,
    connection_manager::{ConnectionManager, ConnectionManagerHandle, ManagerState},
    error::TransactionError,
    protocol::CallOptions,
    storage::ClientSqliteDatabase,
    sync::{AppliedUpdates, SyncHandle, SyncService},
    transactions::{
        MutationConfig,
        Transaction,
        TransactionKind,
        TransactionsHandle,
        TransactionsService,
    },
};
use banter_common_sqlite::connection::{DbConnection, DbConnectionUrl};
use banter_proto::{rpc_call, rpc_result, update, Method, SendMessageInput};
use banter_server::{config::ServerConfig, context::ServerContext, ws};
use banter_shutdown::Shutdown;
use tokio::{sync::mpsc, time::timeout};

async fn start_server(shutdown: &Shutdown) -> (tempfile::TempDir, Arc<ServerContext>, SocketAddr) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        db_path: dir.path().join("server.sqlite3"),
        payload_key: [5u8; 32],
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        allowed_origins: vec![],
        handshake_timeout: Duration::from_secs(10),
    };
    let ctx = ServerContext::init(config, shutdown.to_signal()).unwrap();
    let (listener, addr) = ws::bind(&ctx).await.unwrap();
    tokio::spawn(ws::serve(ctx.clone(), listener, shutdown.to_signal()));
    (dir, ctx, addr)
}

struct TestClient {
    manager: ConnectionManagerHandle,
    transactions: TransactionsHandle,
    sync: SyncHandle,
    applied_rx: mpsc::Receiver<AppliedUpdates>,
    _dir: tempfile::TempDir,
}

async fn connect_client(addr: SocketAddr, token: &str, shutdown: &Shutdown) -> TestClient {
    let mut config = ClientConfig::new(format!("ws://{}/realtime", addr));
    config.sync.enable_message_updates = true;
    let dir = tempfile::tempdir().unwrap();
    let url = DbConnectionUrl::file(dir.path().join("client.sqlite3"));
    let db = ClientSqliteDatabase::init(DbConnection::connect_url(&url).unwrap()).unwrap();

    let manager = ConnectionManager::spawn(config.clone(), shutdown.to_signal());
    let transactions = TransactionsService::spawn(
        config.clone(),
        manager.protocol().clone(),
        Some(db.clone()),
        shutdown.to_signal(),
    );
    let (sync, applied_rx) =
        SyncService::spawn(config, manager.protocol().clone(), db, shutdown.to_signal());

    manager.set_auth_token(Some(token.to_string())).await.unwrap();
    wait_for_state(&manager, ManagerState::Connected).await;
    TestClient {
        manager,
        transactions,
        sync,
        applied_rx,
        _dir: dir,
    }
}

async fn wait_for_state(manager: &ConnectionManagerHandle, state: ManagerState) {
    let mut rx = manager.watch_snapshots();
    timeout(Duration::from_secs(10), async {
        loop {
            if rx.borrow().state == state {
                return;
            }
            rx.changed().await.expect("snapshot channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("manager never reached {:?}", state));
}

struct SendMessageTx {
    chat_id: i64,
    text: String,
    random_id: u64,
}

impl Transaction for SendMessageTx {
    fn method(&self) -> Method {
        Method::SendMessage
    }

    fn input(&self) -> rpc_call::Input {
        rpc_call::Input::SendMessage(SendMessageInput {
            chat_id: self.chat_id,
            text: self.text.clone(),
            random_id: self.random_id,
        })
    }

    fn kind(&self) -> TransactionKind {
        TransactionKind::Mutation(MutationConfig {
            retry_after_ack: false,
        })
    }
}

async fn send_text(
    client: &TestClient,
    chat_id: i64,
    text: &str,
    random_id: u64,
) -> Result<rpc_result::Result, TransactionError> {
    client
        .transactions
        .send(Box::new(SendMessageTx {
            chat_id,
            text: text.to_string(),
            random_id,
        }))
        .await
}

async fn create_chat(client: &TestClient, peer_user_id: i64) -> i64 {
    let result = client
        .manager
        .protocol()
        .call_rpc(
            Method::CreateChat,
            rpc_call::Input::CreateChat(banter_proto::CreateChatInput { peer_user_id }),
            CallOptions::query(Some(Duration::from_secs(10))),
        )
        .await
        .unwrap();
    match result {
        rpc_result::Result::CreateChat(out) => out.chat.unwrap().id,
        other => panic!("unexpected result {:?}", other),
    }
}

async fn next_new_message(client: &mut TestClient) -> (i64, String) {
    timeout(Duration::from_secs(10), async {
        loop {
            let batch = client.applied_rx.recv().await.expect("applied channel closed");
            for item in batch.updates {
                if let Some(update::Body::NewMessage(new_msg)) = item.update {
                    let message = new_msg.message.unwrap();
                    return (message.chat_id, message.text);
                }
            }
        }
    })
    .await
    .expect("timed out waiting for a pushed message")
}

#[tokio::test(flavor = "multi_thread")]
async fn rpc_round_trip_over_real_socket() {
    let shutdown = Shutdown::new();
    let (_dir, ctx, addr) = start_server(&shutdown).await;
    let amy = ctx.db.create_user("amy", "token-amy").unwrap();

    let client = connect_client(addr, "token-amy", &shutdown).await;
    let result = client
        .manager
        .protocol()
        .call_rpc(
            Method::GetMe,
            rpc_call::Input::GetMe(banter_proto::GetMeInput {}),
            CallOptions::query(Some(Duration::from_secs(10))),
        )
        .await
        .unwrap();
    match result {
        rpc_result::Result::GetMe(out) => assert_eq!(out.user.unwrap().id, amy.id),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(
        client.manager.current_snapshot().state,
        ManagerState::Connected
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_token_clears_auth_constraint() {
    let shutdown = Shutdown::new();
    let (_dir, _ctx, addr) = start_server(&shutdown).await;

    let config = ClientConfig::new(format!("ws://{}/realtime", addr));
    let manager = ConnectionManager::spawn(config, shutdown.to_signal());
    manager
        .set_auth_token(Some("not-a-real-token".to_string()))
        .await
        .unwrap();

    wait_for_state(&manager, ManagerState::WaitingForConstraints).await;
    assert!(!manager.current_snapshot().constraints.auth_available);
}

#[tokio::test(flavor = "multi_thread")]
async fn mutation_fans_out_live_and_sync_recovers_after_reconnect() {
    let shutdown = Shutdown::new();
    let (_dir, ctx, addr) = start_server(&shutdown).await;
    ctx.db.create_user("amy", "token-amy").unwrap();
    let bob = ctx.db.create_user("bob", "token-bob").unwrap();

    let amy_client = connect_client(addr, "token-amy", &shutdown).await;
    let mut bob_client = connect_client(addr, "token-bob", &shutdown).await;

    let chat_id = create_chat(&amy_client, bob.id).await;

    // Live path: bob's session receives the committed update over the socket
    send_text(&amy_client, chat_id, "hello bob", 1).await.unwrap();
    let (got_chat, got_text) = next_new_message(&mut bob_client).await;
    assert_eq!(got_chat, chat_id);
    assert_eq!(got_text, "hello bob");

    // Catch-up path: bob is offline while amy keeps talking
    bob_client.manager.set_network_up(false).await.unwrap();
    wait_for_state(&bob_client.manager, ManagerState::WaitingForConstraints).await;
    send_text(&amy_client, chat_id, "are you there?", 2).await.unwrap();

    bob_client.manager.set_network_up(true).await.unwrap();
    wait_for_state(&bob_client.manager, ManagerState::Connected).await;
    let (got_chat, got_text) = next_new_message(&mut bob_client).await;
    assert_eq!(got_chat, chat_id);
    assert_eq!(got_text, "are you there?");

    // The cursor has advanced past both updates
    let state = bob_client
        .sync
        .bucket_state(banter_proto::Bucket::chat(chat_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.seq, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_send_after_restart_commits_once() {
    let shutdown = Shutdown::new();
    let (_dir, ctx, addr) = start_server(&shutdown).await;
    ctx.db.create_user("amy", "token-amy").unwrap();
    let bob = ctx.db.create_user("bob", "token-bob").unwrap();

    let amy_client = connect_client(addr, "token-amy", &shutdown).await;
    let chat_id = create_chat(&amy_client, bob.id).await;

    // The same logical message sent twice (same random id) commits exactly once
    send_text(&amy_client, chat_id, "once", 77).await.unwrap();
    send_text(&amy_client, chat_id, "once", 77).await.unwrap();

    let updates = ctx
        .store
        .get_updates(banter_proto::Bucket::chat(chat_id), 0, 100)
        .unwrap();
    assert_eq!(updates.updates.len(), 1);
}
