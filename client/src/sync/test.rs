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

use banter_common_sqlite::connection::{DbConnection, DbConnectionUrl};
use banter_proto::{
    client_message,
    server_message,
    BucketState,
    ConnectionOpen,
    GetUpdatesOutput,
    GetUpdatesStateOutput,
    RpcCall,
    RpcResult,
    ServerMessage,
    UpdateNewMessage,
    UpdateUserStatus,
    UpdatesPayload,
};
use banter_shutdown::Shutdown;
use tokio::{sync::watch, time::timeout};

use super::*;
use crate::{
    protocol::ProtocolClient,
    storage::ClientSqliteDatabase,
    transport::{TransportCommand, TransportEvent, TransportHandle},
};

type TestBackend = ClientSqliteDatabase<DbConnection>;

struct Harness {
    sync: SyncHandle,
    applied_rx: mpsc::Receiver<AppliedUpdates>,
    backend: TestBackend,
    commands: mpsc::Receiver<TransportCommand>,
    events_tx: mpsc::Sender<TransportEvent>,
    _dir: tempfile::TempDir,
    _shutdown: Shutdown,
    _auth: watch::Sender<Option<String>>,
}

fn harness(mut config: ClientConfig) -> Harness {
    config.sync.retry_delay = Duration::from_millis(50);
    let dir = tempfile::tempdir().unwrap();
    let url = DbConnectionUrl::file(dir.path().join("sync.sqlite3"));
    let backend = ClientSqliteDatabase::init(DbConnection::connect_url(&url).unwrap()).unwrap();

    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(64);
    let (auth_tx, auth_rx) = watch::channel(Some("token-1".to_string()));
    let shutdown = Shutdown::new();
    let protocol = ProtocolClient::spawn(
        config.clone(),
        TransportHandle::new(cmd_tx),
        event_rx,
        auth_rx,
        shutdown.to_signal(),
    );
    let (sync, applied_rx) =
        SyncService::spawn(config, protocol, backend.clone(), shutdown.to_signal());
    Harness {
        sync,
        applied_rx,
        backend,
        commands: cmd_rx,
        events_tx: event_tx,
        _dir: dir,
        _shutdown: shutdown,
        _auth: auth_tx,
    }
}

async fn open_connection(harness: &mut Harness) {
    harness.events_tx.send(TransportEvent::Connecting).await.unwrap();
    harness.events_tx.send(TransportEvent::Connected).await.unwrap();
    // ConnectionInit
    let (_, _, init) = next_send(harness).await;
    assert!(matches!(init, client_message::Body::ConnectionInit(_)));
    harness
        .events_tx
        .send(TransportEvent::Message(ServerMessage {
            id: 0,
            body: Some(server_message::Body::ConnectionOpen(ConnectionOpen {})),
        }))
        .await
        .unwrap();
}

async fn next_send(harness: &mut Harness) -> (u64, u32, client_message::Body) {
    loop {
        match timeout(Duration::from_secs(5), harness.commands.recv())
            .await
            .expect("timed out waiting for a transport command")
            .expect("transport command channel closed")
        {
            TransportCommand::Send(msg, reply) => {
                reply.send(Ok(())).unwrap();
                let body = msg.body.expect("sent frame with no body");
                if matches!(body, client_message::Body::Ping(_)) {
                    continue;
                }
                return (msg.id, msg.seq, body);
            },
            _ => continue,
        }
    }
}

/// Receive the next outbound RPC, skipping pings.
async fn expect_rpc(harness: &mut Harness) -> (u64, RpcCall) {
    loop {
        let (id, _, body) = next_send(harness).await;
        if let client_message::Body::RpcCall(call) = body {
            return (id, call);
        }
    }
}

async fn expect_no_rpc(harness: &mut Harness) {
    loop {
        match timeout(Duration::from_millis(200), harness.commands.recv()).await {
            Ok(Some(TransportCommand::Send(msg, reply))) => {
                reply.send(Ok(())).unwrap();
                match msg.body {
                    Some(client_message::Body::Ping(_)) => continue,
                    other => panic!("expected no rpc, got {:?}", other),
                }
            },
            Ok(Some(_)) => continue,
            Ok(None) => panic!("transport command channel closed"),
            Err(_) => return,
        }
    }
}

async fn reply(harness: &mut Harness, req_msg_id: u64, result: rpc_result::Result) {
    harness
        .events_tx
        .send(TransportEvent::Message(ServerMessage {
            id: 0,
            body: Some(server_message::Body::RpcResult(RpcResult {
                req_msg_id,
                result: Some(result),
            })),
        }))
        .await
        .unwrap();
}

fn state_result(buckets: Vec<(Bucket, u32, i64)>) -> rpc_result::Result {
    rpc_result::Result::GetUpdatesState(GetUpdatesStateOutput {
        buckets: buckets
            .into_iter()
            .map(|(bucket, seq, date)| BucketState {
                bucket: Some(bucket),
                seq,
                date,
            })
            .collect(),
    })
}

fn user_status_update(seq: u32, date: i64, user_id: i64) -> Update {
    Update {
        seq,
        date,
        update: Some(update::Body::UserStatus(UpdateUserStatus {
            user_id,
            online: true,
            last_seen: None,
        })),
    }
}

fn new_message_update(seq: u32, date: i64, global_id: i64) -> Update {
    Update {
        seq,
        date,
        update: Some(update::Body::NewMessage(UpdateNewMessage {
            message: Some(banter_proto::Message {
                global_id,
                chat_id: 1,
                message_id: global_id,
                from_user_id: 2,
                text: "hi".to_string(),
                date,
                edit_date: None,
            }),
        })),
    }
}

fn assert_get_updates(call: &RpcCall, bucket: Bucket, since_seq: u32) {
    match &call.input {
        Some(rpc_call::Input::GetUpdates(input)) => {
            assert_eq!(input.bucket, Some(bucket));
            assert_eq!(input.since_seq, since_seq);
        },
        other => panic!("expected GetUpdates, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn too_long_fast_forwards_without_applying() {
    let mut harness = harness(ClientConfig::default());
    open_connection(&mut harness).await;

    let (state_id, call) = expect_rpc(&mut harness).await;
    assert!(matches!(call.input, Some(rpc_call::Input::GetUpdatesState(_))));
    reply(&mut harness, state_id, state_result(vec![(Bucket::chat(1), 10, 200)])).await;

    let (fetch_id, call) = expect_rpc(&mut harness).await;
    assert_get_updates(&call, Bucket::chat(1), 0);
    reply(
        &mut harness,
        fetch_id,
        rpc_result::Result::GetUpdates(GetUpdatesOutput {
            updates: vec![],
            result_type: UpdatesResultType::TooLong as i32,
            seq: 10,
            date: 200,
            r#final: false,
        }),
    )
    .await;

    // `final: false` keeps fetching; the cursor has fast-forwarded in between
    let (fetch_id, call) = expect_rpc(&mut harness).await;
    assert_get_updates(&call, Bucket::chat(1), 10);
    reply(
        &mut harness,
        fetch_id,
        rpc_result::Result::GetUpdates(GetUpdatesOutput {
            updates: vec![],
            result_type: UpdatesResultType::Empty as i32,
            seq: 10,
            date: 200,
            r#final: true,
        }),
    )
    .await;
    expect_no_rpc(&mut harness).await;

    let state = harness.sync.bucket_state(Bucket::chat(1)).await.unwrap().unwrap();
    assert_eq!(state.seq, 10);
    assert_eq!(state.date, 200);
    assert_eq!(
        harness.sync.metrics().bucket_fetch_too_long.load(Ordering::Relaxed),
        1
    );
    assert!(harness.applied_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn slice_is_applied_in_seq_order() {
    let mut harness = harness(ClientConfig::default());
    open_connection(&mut harness).await;

    let (state_id, _) = expect_rpc(&mut harness).await;
    reply(&mut harness, state_id, state_result(vec![(Bucket::chat(1), 3, 300)])).await;

    let (fetch_id, call) = expect_rpc(&mut harness).await;
    assert_get_updates(&call, Bucket::chat(1), 0);
    reply(
        &mut harness,
        fetch_id,
        rpc_result::Result::GetUpdates(GetUpdatesOutput {
            updates: vec![
                user_status_update(3, 300, 7),
                user_status_update(1, 100, 7),
                user_status_update(2, 200, 7),
            ],
            result_type: UpdatesResultType::Slice as i32,
            seq: 3,
            date: 300,
            r#final: true,
        }),
    )
    .await;

    let batch = timeout(Duration::from_secs(5), harness.applied_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.bucket, Bucket::chat(1));
    let seqs: Vec<u32> = batch.updates.iter().map(|u| u.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    let state = harness.sync.bucket_state(Bucket::chat(1)).await.unwrap().unwrap();
    assert_eq!(state.seq, 3);
    assert_eq!(state.date, 300);
}

#[tokio::test(start_paused = true)]
async fn last_sync_date_lags_by_safety_gap() {
    let mut harness = harness(ClientConfig::default());
    open_connection(&mut harness).await;

    let (state_id, _) = expect_rpc(&mut harness).await;
    reply(&mut harness, state_id, state_result(vec![(Bucket::chat(1), 1, 100)])).await;

    let (fetch_id, _) = expect_rpc(&mut harness).await;
    reply(
        &mut harness,
        fetch_id,
        rpc_result::Result::GetUpdates(GetUpdatesOutput {
            updates: vec![user_status_update(1, 100, 7)],
            result_type: UpdatesResultType::Slice as i32,
            seq: 1,
            date: 100,
            r#final: true,
        }),
    )
    .await;
    let _batch = harness.applied_rx.recv().await.unwrap();

    // Safety gap is 15s: applying an update dated 100 pins last_sync_date at 85
    use crate::storage::SyncBackend as _;
    assert_eq!(harness.backend.fetch_last_sync_date().unwrap(), Some(85));
}

#[tokio::test(start_paused = true)]
async fn message_updates_are_gated_but_advance_the_cursor() {
    let mut harness = harness(ClientConfig::default());
    open_connection(&mut harness).await;
    let (state_id, _) = expect_rpc(&mut harness).await;
    reply(&mut harness, state_id, state_result(vec![])).await;

    use crate::storage::SyncBackend as _;
    harness
        .backend
        .upsert_bucket_state(crate::storage::BucketStateRecord {
            bucket: Bucket::chat(1),
            seq: 0,
            date: 0,
        })
        .unwrap();

    harness
        .events_tx
        .send(TransportEvent::Message(ServerMessage {
            id: 0,
            body: Some(server_message::Body::Updates(UpdatesPayload {
                bucket: Some(Bucket::chat(1)),
                updates: vec![
                    new_message_update(1, 50, 10),
                    user_status_update(2, 60, 7),
                ],
            })),
        }))
        .await
        .unwrap();

    let batch = timeout(Duration::from_secs(5), harness.applied_rx.recv())
        .await
        .unwrap()
        .unwrap();
    // The NewMessage body is suppressed; the status update is delivered
    assert_eq!(batch.updates.len(), 1);
    assert!(matches!(
        batch.updates[0].update,
        Some(update::Body::UserStatus(_))
    ));

    let state = harness.sync.bucket_state(Bucket::chat(1)).await.unwrap().unwrap();
    assert_eq!(state.seq, 2);
}

#[tokio::test(start_paused = true)]
async fn push_gap_falls_back_to_fetch() {
    let mut harness = harness(ClientConfig::default());
    open_connection(&mut harness).await;
    let (state_id, _) = expect_rpc(&mut harness).await;
    reply(&mut harness, state_id, state_result(vec![])).await;

    use crate::storage::SyncBackend as _;
    harness
        .backend
        .upsert_bucket_state(crate::storage::BucketStateRecord {
            bucket: Bucket::chat(1),
            seq: 2,
            date: 20,
        })
        .unwrap();

    harness
        .events_tx
        .send(TransportEvent::Message(ServerMessage {
            id: 0,
            body: Some(server_message::Body::Updates(UpdatesPayload {
                bucket: Some(Bucket::chat(1)),
                updates: vec![user_status_update(5, 50, 7)],
            })),
        }))
        .await
        .unwrap();

    let (_fetch_id, call) = expect_rpc(&mut harness).await;
    assert_get_updates(&call, Bucket::chat(1), 2);
    assert!(harness.applied_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn concurrent_triggers_coalesce_to_one_follow_up() {
    let mut harness = harness(ClientConfig::default());
    open_connection(&mut harness).await;
    let (state_id, _) = expect_rpc(&mut harness).await;
    reply(&mut harness, state_id, state_result(vec![])).await;

    harness.sync.chat_has_new_updates(1).await.unwrap();
    let (first_id, call) = expect_rpc(&mut harness).await;
    assert_get_updates(&call, Bucket::chat(1), 0);

    // Multiple triggers while the fetch is in flight merge into a single follow-up
    harness.sync.chat_has_new_updates(1).await.unwrap();
    harness.sync.chat_has_new_updates(1).await.unwrap();
    harness.sync.chat_has_new_updates(1).await.unwrap();

    reply(
        &mut harness,
        first_id,
        rpc_result::Result::GetUpdates(GetUpdatesOutput {
            updates: vec![],
            result_type: UpdatesResultType::Empty as i32,
            seq: 0,
            date: 0,
            r#final: true,
        }),
    )
    .await;

    let (second_id, call) = expect_rpc(&mut harness).await;
    assert_get_updates(&call, Bucket::chat(1), 0);
    reply(
        &mut harness,
        second_id,
        rpc_result::Result::GetUpdates(GetUpdatesOutput {
            updates: vec![],
            result_type: UpdatesResultType::Empty as i32,
            seq: 0,
            date: 0,
            r#final: true,
        }),
    )
    .await;
    expect_no_rpc(&mut harness).await;
}
