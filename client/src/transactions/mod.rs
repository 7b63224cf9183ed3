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

//! The durable transaction queue.
//!
//! Guarantees that every user-initiated mutation either commits exactly once server-side or
//! deterministically fails with a user-visible error, across disconnects and restarts. The
//! optimistic effect runs before any network activity; `apply` runs at most once on success;
//! `failed` exactly once on terminal failure.

pub mod queue;

use std::sync::Arc;

use banter_proto::{rpc_call, rpc_result, Method};
use banter_shutdown::ShutdownSignal;
use chrono::Utc;
use log::*;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

pub use self::queue::{TransactionState, TransactionWrapper};
use self::queue::{CompletionSender, TransactionQueue};
use crate::{
    config::ClientConfig,
    error::{ClientError, TransactionError},
    protocol::{CallOptions, ProtocolClientHandle, ProtocolEvent},
    storage::{TransactionBackend, TransactionRecord},
};

const LOG_TARGET: &str = "client::transactions";

const COMMAND_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutationConfig {
    /// When true, a reconnect after the server acked the call resends it instead of failing it.
    /// Only safe for idempotent mutations.
    pub retry_after_ack: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Query,
    Mutation(MutationConfig),
}

/// A client-originated intent to mutate server state, tracked from user action to server
/// ack + result.
pub trait Transaction: Send + 'static {
    fn method(&self) -> Method;
    fn input(&self) -> rpc_call::Input;

    fn kind(&self) -> TransactionKind {
        TransactionKind::Mutation(MutationConfig::default())
    }

    /// Local state change performed before any RPC dispatch. Runs exactly once.
    fn optimistic(&mut self) -> Result<(), TransactionError> {
        Ok(())
    }

    /// Reconcile local state with the server result. Runs at most once, on success. An error
    /// here is an application-level failure surfaced on the caller's future; it does not affect
    /// queue accounting.
    fn apply(&mut self, _result: &rpc_result::Result) -> Result<(), TransactionError> {
        Ok(())
    }

    /// Invoked exactly once on terminal failure.
    fn failed(&mut self, _error: &TransactionError) {}
}

/// Re-hydrated from the persisted log after a restart. The optimistic effect already ran in the
/// previous process; results have no application hook left to run, so they are dropped.
struct StoredTransaction {
    method: Method,
    input: rpc_call::Input,
    retry_after_ack: bool,
}

impl Transaction for StoredTransaction {
    fn method(&self) -> Method {
        self.method
    }

    fn input(&self) -> rpc_call::Input {
        self.input.clone()
    }

    fn kind(&self) -> TransactionKind {
        TransactionKind::Mutation(MutationConfig {
            retry_after_ack: self.retry_after_ack,
        })
    }

    fn failed(&mut self, error: &TransactionError) {
        warn!(target: LOG_TARGET, "Restored transaction failed: {}", error);
    }
}

/// Queue contents by state, for UI badges and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub queued: Vec<Uuid>,
    pub inflight: Option<Uuid>,
}

enum TransactionsCommand {
    Queue {
        transaction: Box<dyn Transaction>,
        id_reply: oneshot::Sender<Result<Uuid, TransactionError>>,
        completion: Option<CompletionSender>,
    },
    Requeue {
        id: Uuid,
    },
    ClearAll,
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
}

#[derive(Clone)]
pub struct TransactionsHandle {
    commands: mpsc::Sender<TransactionsCommand>,
}

impl TransactionsHandle {
    /// Append a transaction, running its optimistic effect synchronously. Returns the assigned
    /// id without waiting for completion.
    pub async fn queue(&self, transaction: Box<dyn Transaction>) -> Result<Uuid, TransactionError> {
        let (id_tx, id_rx) = oneshot::channel();
        self.commands
            .send(TransactionsCommand::Queue {
                transaction,
                id_reply: id_tx,
                completion: None,
            })
            .await
            .map_err(|_| TransactionError::Cancelled)?;
        id_rx.await.map_err(|_| TransactionError::Cancelled)?
    }

    /// Queue and await the outcome: the RPC result on success, the terminal error otherwise.
    pub async fn send(
        &self,
        transaction: Box<dyn Transaction>,
    ) -> Result<rpc_result::Result, TransactionError> {
        let (id_tx, id_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(TransactionsCommand::Queue {
                transaction,
                id_reply: id_tx,
                completion: Some(done_tx),
            })
            .await
            .map_err(|_| TransactionError::Cancelled)?;
        id_rx.await.map_err(|_| TransactionError::Cancelled)??;
        done_rx.await.map_err(|_| TransactionError::Cancelled)?
    }

    /// Move one inflight transaction back to the head of the queue.
    pub async fn requeue(&self, id: Uuid) -> Result<(), TransactionError> {
        self.commands
            .send(TransactionsCommand::Requeue { id })
            .await
            .map_err(|_| TransactionError::Cancelled)
    }

    /// Drop all pending transactions, e.g. on logout.
    pub async fn clear_all(&self) -> Result<(), TransactionError> {
        self.commands
            .send(TransactionsCommand::ClearAll)
            .await
            .map_err(|_| TransactionError::Cancelled)
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, TransactionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(TransactionsCommand::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| TransactionError::Cancelled)?;
        reply_rx.await.map_err(|_| TransactionError::Cancelled)
    }
}

type AttemptFuture = (
    Uuid,
    oneshot::Receiver<Result<rpc_result::Result, ClientError>>,
);

pub struct TransactionsService<B> {
    config: ClientConfig,
    protocol: ProtocolClientHandle,
    protocol_events: broadcast::Receiver<Arc<ProtocolEvent>>,
    commands: mpsc::Receiver<TransactionsCommand>,
    backend: Option<B>,
    shutdown_signal: ShutdownSignal,

    queue: TransactionQueue,
    current: Option<AttemptFuture>,
    open: bool,
}

impl<B> TransactionsService<B>
where B: TransactionBackend
{
    pub fn spawn(
        config: ClientConfig,
        protocol: ProtocolClientHandle,
        backend: Option<B>,
        shutdown_signal: ShutdownSignal,
    ) -> TransactionsHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let service = Self {
            config,
            protocol_events: protocol.subscribe(),
            protocol,
            commands: command_rx,
            backend,
            shutdown_signal,
            queue: TransactionQueue::default(),
            current: None,
            open: false,
        };
        tokio::spawn(service.run());
        TransactionsHandle {
            commands: command_tx,
        }
    }

    async fn run(mut self) {
        self.restore_from_backend();
        debug!(target: LOG_TARGET, "Transactions service started");
        let mut shutdown = self.shutdown_signal.clone();
        loop {
            let attempt_active = self.current.is_some();
            tokio::select! {
                maybe_cmd = self.commands.recv() => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                event = self.protocol_events.recv() => match event {
                    Ok(event) => self.handle_protocol_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: LOG_TARGET, "Lagged {} protocol events", n);
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                result = wait_attempt(&mut self.current), if attempt_active => {
                    let (tx_id, _) = self.current.take().expect("attempt present by guard");
                    self.handle_attempt_done(tx_id, result).await;
                },
                _ = shutdown.wait() => break,
            }
        }
        debug!(target: LOG_TARGET, "Transactions service ended");
    }

    fn restore_from_backend(&mut self) {
        let records = match &self.backend {
            Some(backend) => match backend.fetch_pending_transactions() {
                Ok(records) => records,
                Err(e) => {
                    error!(target: LOG_TARGET, "Failed to restore transaction log: {}", e);
                    return;
                },
            },
            None => return,
        };
        let count = records.len();
        for record in records {
            self.queue.queue(TransactionWrapper {
                id: record.id,
                date: record.date,
                state: TransactionState::Queued,
                transaction: Box::new(StoredTransaction {
                    method: record.method,
                    input: record.input,
                    retry_after_ack: record.retry_after_ack,
                }),
                completion: None,
            });
        }
        if count > 0 {
            info!(target: LOG_TARGET, "Restored {} pending transaction(s)", count);
        }
    }

    async fn handle_command(&mut self, command: TransactionsCommand) {
        match command {
            TransactionsCommand::Queue {
                mut transaction,
                id_reply,
                completion,
            } => {
                // The optimistic effect runs before the transaction is visible anywhere
                if let Err(e) = transaction.optimistic() {
                    let err = TransactionError::OptimisticApplyFailed(e.to_string());
                    transaction.failed(&err);
                    let _result = id_reply.send(Err(err.clone()));
                    if let Some(done) = completion {
                        let _result = done.send(Err(err));
                    }
                    return;
                }
                let id = Uuid::new_v4();
                let wrapper = TransactionWrapper {
                    id,
                    date: Utc::now().timestamp(),
                    state: TransactionState::Queued,
                    transaction,
                    completion,
                };
                if let Some(backend) = &self.backend {
                    let record = TransactionRecord {
                        id,
                        date: wrapper.date,
                        method: wrapper.transaction.method(),
                        input: wrapper.transaction.input(),
                        retry_after_ack: wrapper.retry_after_ack(),
                    };
                    if let Err(e) = backend.insert_transaction(&record) {
                        error!(target: LOG_TARGET, "Failed to persist transaction: {}", e);
                    }
                }
                self.queue.queue(wrapper);
                let _result = id_reply.send(Ok(id));
                self.maybe_dispatch().await;
            },
            TransactionsCommand::Requeue { id } => {
                self.queue.requeue(id);
                self.maybe_dispatch().await;
            },
            TransactionsCommand::ClearAll => {
                for mut wrapper in self.queue.clear_all() {
                    let err = TransactionError::Cancelled;
                    wrapper.transaction.failed(&err);
                    if let Some(done) = wrapper.completion.take() {
                        let _result = done.send(Err(err));
                    }
                }
                self.current = None;
                if let Some(backend) = &self.backend {
                    if let Err(e) = backend.clear_transactions() {
                        error!(target: LOG_TARGET, "Failed to clear transaction log: {}", e);
                    }
                }
            },
            TransactionsCommand::Snapshot { reply } => {
                let _result = reply.send(QueueSnapshot {
                    queued: self.queue.queued_ids(),
                    inflight: self.queue.inflight_id(),
                });
            },
        }
    }

    async fn handle_protocol_event(&mut self, event: &ProtocolEvent) {
        match event {
            ProtocolEvent::Open => {
                let dropped = self.queue.requeue_all();
                for wrapper in dropped {
                    self.finish_failed(wrapper, TransactionError::AckedButNoResultAfterReconnect);
                }
                self.open = true;
                self.maybe_dispatch().await;
            },
            ProtocolEvent::Ack { msg_id } => {
                self.queue.ack(*msg_id);
            },
            ProtocolEvent::Disconnected { .. } => {
                self.open = false;
                self.queue.connection_lost();
            },
            ProtocolEvent::Stopped | ProtocolEvent::AuthFailed { .. } => {
                self.open = false;
            },
            _ => {},
        }
    }

    /// Dispatch the head of the queue, one transaction at a time.
    async fn maybe_dispatch(&mut self) {
        if !self.open || self.current.is_some() || !self.queue.has_queued() {
            return;
        }
        let tx_id = match self.queue.dequeue() {
            Some(id) => id,
            None => return,
        };
        let (method, input, retry_after_ack) = {
            let state = self.queue.state_of(tx_id);
            debug_assert_eq!(state, Some(TransactionState::Inflight));
            let entry = match self.queue.entry(tx_id) {
                Some(entry) => entry,
                None => return,
            };
            (
                entry.transaction.method(),
                entry.transaction.input(),
                entry.retry_after_ack(),
            )
        };
        let opts = CallOptions::transaction(Some(self.config.rpc_timeout), retry_after_ack);
        match self.protocol.call_rpc_tracked(method, input, opts).await {
            Ok((msg_id, result_rx)) => {
                debug!(
                    target: LOG_TARGET,
                    "Transaction {} running as rpc msg {}", tx_id, msg_id
                );
                self.queue.running(tx_id, msg_id);
                self.current = Some((tx_id, result_rx));
            },
            Err(ClientError::NotConnected) | Err(ClientError::Stopped) => {
                self.queue.requeue(tx_id);
            },
            Err(err) => {
                if let Some(wrapper) = self.queue.fail(tx_id) {
                    self.finish_failed(wrapper, TransactionError::Client(err));
                }
            },
        }
    }

    async fn handle_attempt_done(
        &mut self,
        tx_id: Uuid,
        result: Result<rpc_result::Result, ClientError>,
    ) {
        match result {
            Ok(payload) => {
                if let Some(mut wrapper) = self.queue.complete(tx_id) {
                    if let Some(backend) = &self.backend {
                        if let Err(e) = backend.mark_transaction_done(tx_id) {
                            error!(target: LOG_TARGET, "Failed to mark transaction done: {}", e);
                        }
                    }
                    let applied = wrapper.transaction.apply(&payload);
                    let outcome = match applied {
                        Ok(()) => Ok(payload),
                        Err(e) => Err(TransactionError::ApplyFailed(e.to_string())),
                    };
                    if let Some(done) = wrapper.completion.take() {
                        let _result = done.send(outcome);
                    }
                }
            },
            Err(ClientError::NotConnected) | Err(ClientError::Stopped) => {
                // The attempt died with the connection; the transaction itself survives
                self.queue.requeue(tx_id);
            },
            Err(ClientError::AckedButNoResultAfterReconnect) => {
                if let Some(wrapper) = self.queue.fail(tx_id) {
                    self.finish_failed(wrapper, TransactionError::AckedButNoResultAfterReconnect);
                }
            },
            Err(err) => {
                if let Some(wrapper) = self.queue.fail(tx_id) {
                    self.finish_failed(wrapper, TransactionError::Client(err));
                }
            },
        }
        self.maybe_dispatch().await;
    }

    fn finish_failed(&mut self, mut wrapper: TransactionWrapper, error: TransactionError) {
        warn!(target: LOG_TARGET, "Transaction {} failed: {}", wrapper.id, error);
        wrapper.transaction.failed(&error);
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.mark_transaction_failed(wrapper.id) {
                error!(target: LOG_TARGET, "Failed to mark transaction failed: {}", e);
            }
        }
        if let Some(done) = wrapper.completion.take() {
            let _result = done.send(Err(error));
        }
    }
}

async fn wait_attempt(
    current: &mut Option<AttemptFuture>,
) -> Result<rpc_result::Result, ClientError> {
    match current.as_mut() {
        Some((_, rx)) => match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Stopped),
        },
        None => std::future::pending().await,
    }
}
