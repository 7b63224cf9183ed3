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

//! Catch-up after any gap.
//!
//! Tracks a per-bucket cursor and the global `last_sync_date`, fetches whatever the server has
//! beyond the cursor and applies updates in seq order. Concurrent triggers for a bucket already
//! being fetched coalesce into a single follow-up fetch. Errors are logged and retried, never
//! surfaced.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use banter_proto::{
    rpc_call,
    rpc_result,
    update,
    Bucket,
    GetUpdatesInput,
    GetUpdatesStateInput,
    Method,
    Update,
    UpdatesResultType,
};
use banter_shutdown::ShutdownSignal;
use log::*;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    config::ClientConfig,
    error::{ClientError, SyncError},
    protocol::{CallOptions, ProtocolClientHandle, ProtocolEvent},
    storage::{BucketStateRecord, SyncBackend},
};

const LOG_TARGET: &str = "client::sync";

const COMMAND_BUFFER_SIZE: usize = 64;
const APPLIED_BUFFER_SIZE: usize = 128;
const FETCH_BUFFER_SIZE: usize = 64;

/// Counters exposed for diagnostics.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub bucket_fetch_too_long: AtomicU64,
    pub applied_updates: AtomicU64,
}

/// In-order batch handed to the application layer.
#[derive(Debug, Clone)]
pub struct AppliedUpdates {
    pub bucket: Bucket,
    pub updates: Vec<Update>,
}

enum SyncCommand {
    ChatHasNewUpdates(i64),
    SpaceHasNewUpdates(i64),
    UserHasNewUpdates(i64),
    Foregrounded,
    BucketState {
        bucket: Bucket,
        reply: oneshot::Sender<Option<BucketStateRecord>>,
    },
}

enum FetchMsg {
    StateDone(Result<rpc_result::Result, ClientError>),
    FetchDone(Bucket, Result<rpc_result::Result, ClientError>),
    Retry(Bucket),
}

#[derive(Debug, Default)]
struct FetchState {
    in_flight: bool,
    follow_up: bool,
}

#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<SyncCommand>,
    metrics: Arc<SyncMetrics>,
}

impl SyncHandle {
    pub async fn chat_has_new_updates(&self, chat_id: i64) -> Result<(), ClientError> {
        self.send(SyncCommand::ChatHasNewUpdates(chat_id)).await
    }

    pub async fn space_has_new_updates(&self, space_id: i64) -> Result<(), ClientError> {
        self.send(SyncCommand::SpaceHasNewUpdates(space_id)).await
    }

    pub async fn user_has_new_updates(&self, user_id: i64) -> Result<(), ClientError> {
        self.send(SyncCommand::UserHasNewUpdates(user_id)).await
    }

    pub async fn foregrounded(&self) -> Result<(), ClientError> {
        self.send(SyncCommand::Foregrounded).await
    }

    pub async fn bucket_state(&self, bucket: Bucket) -> Result<Option<BucketStateRecord>, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SyncCommand::BucketState {
            bucket,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| ClientError::Stopped)
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    async fn send(&self, command: SyncCommand) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Stopped)
    }
}

pub struct SyncService<B> {
    config: ClientConfig,
    protocol: ProtocolClientHandle,
    protocol_events: broadcast::Receiver<Arc<ProtocolEvent>>,
    commands: mpsc::Receiver<SyncCommand>,
    backend: B,
    applied_tx: mpsc::Sender<AppliedUpdates>,
    fetch_tx: mpsc::Sender<FetchMsg>,
    fetch_rx: mpsc::Receiver<FetchMsg>,
    metrics: Arc<SyncMetrics>,
    shutdown_signal: ShutdownSignal,

    fetches: HashMap<Bucket, FetchState>,
}

impl<B> SyncService<B>
where B: SyncBackend
{
    /// Spawn the sync actor. The returned receiver yields batches of updates to apply, strictly
    /// in seq order per bucket.
    pub fn spawn(
        config: ClientConfig,
        protocol: ProtocolClientHandle,
        backend: B,
        shutdown_signal: ShutdownSignal,
    ) -> (SyncHandle, mpsc::Receiver<AppliedUpdates>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (applied_tx, applied_rx) = mpsc::channel(APPLIED_BUFFER_SIZE);
        let (fetch_tx, fetch_rx) = mpsc::channel(FETCH_BUFFER_SIZE);
        let metrics = Arc::new(SyncMetrics::default());
        let service = Self {
            protocol_events: protocol.subscribe(),
            protocol,
            commands: command_rx,
            backend,
            applied_tx,
            fetch_tx,
            fetch_rx,
            metrics: metrics.clone(),
            shutdown_signal,
            config,
            fetches: HashMap::new(),
        };
        tokio::spawn(service.run());
        (
            SyncHandle {
                commands: command_tx,
                metrics,
            },
            applied_rx,
        )
    }

    async fn run(mut self) {
        debug!(target: LOG_TARGET, "Sync service started");
        let mut shutdown = self.shutdown_signal.clone();
        loop {
            tokio::select! {
                maybe_cmd = self.commands.recv() => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                event = self.protocol_events.recv() => match event {
                    Ok(event) => self.handle_protocol_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: LOG_TARGET, "Lagged {} protocol events, forcing a state sync", n);
                        self.request_state_sync();
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                maybe_fetch = self.fetch_rx.recv() => match maybe_fetch {
                    Some(msg) => self.handle_fetch_msg(msg).await,
                    None => break,
                },
                _ = shutdown.wait() => break,
            }
        }
        debug!(target: LOG_TARGET, "Sync service ended");
    }

    async fn handle_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::ChatHasNewUpdates(chat_id) => self.schedule_fetch(Bucket::chat(chat_id)),
            SyncCommand::SpaceHasNewUpdates(space_id) => self.schedule_fetch(Bucket::space(space_id)),
            SyncCommand::UserHasNewUpdates(user_id) => self.schedule_fetch(Bucket::user(user_id)),
            SyncCommand::Foregrounded => self.request_state_sync(),
            SyncCommand::BucketState { bucket, reply } => {
                let state = self.backend.fetch_bucket_state(bucket).unwrap_or_else(|e| {
                    error!(target: LOG_TARGET, "Failed to read bucket state: {}", e);
                    None
                });
                let _result = reply.send(state);
            },
        }
    }

    async fn handle_protocol_event(&mut self, event: &ProtocolEvent) {
        match event {
            ProtocolEvent::Open => {
                self.request_state_sync();
            },
            ProtocolEvent::Updates(payload) => {
                let bucket = match payload.bucket {
                    Some(bucket) => bucket,
                    None => return,
                };
                self.handle_pushed_updates(bucket, payload.updates.clone()).await;
            },
            _ => {},
        }
    }

    /// Ask the server for its view of every bucket the user cares about.
    fn request_state_sync(&self) {
        let protocol = self.protocol.clone();
        let fetch_tx = self.fetch_tx.clone();
        let timeout = self.config.sync.fetch_timeout;
        tokio::spawn(async move {
            let result = protocol
                .call_rpc(
                    Method::GetUpdatesState,
                    rpc_call::Input::GetUpdatesState(GetUpdatesStateInput {}),
                    CallOptions::query(Some(timeout)),
                )
                .await;
            let _result = fetch_tx.send(FetchMsg::StateDone(result)).await;
        });
    }

    /// Live updates pushed by the broker. Contiguous updates apply directly; a gap falls back to
    /// a fetch.
    async fn handle_pushed_updates(&mut self, bucket: Bucket, mut updates: Vec<Update>) {
        // A pushed notification may reference other buckets that have news
        for update in &updates {
            match &update.update {
                Some(update::Body::ChatHasNewUpdates(u)) => {
                    self.schedule_fetch(Bucket::chat(u.chat_id));
                },
                Some(update::Body::SpaceHasNewUpdates(u)) => {
                    self.schedule_fetch(Bucket::space(u.space_id));
                },
                Some(update::Body::UserHasNewUpdates(u)) => {
                    self.schedule_fetch(Bucket::user(u.user_id));
                },
                _ => {},
            }
        }

        let local_seq = match self.local_seq(bucket) {
            Ok(seq) => seq,
            Err(e) => {
                error!(target: LOG_TARGET, "Failed to read cursor for {}: {}", bucket, e);
                return;
            },
        };
        updates.sort_by_key(Update::sort_key);
        updates.retain(|u| u.seq > local_seq);
        if updates.is_empty() {
            return;
        }
        let first = updates[0].seq;
        if first > local_seq + 1 {
            debug!(
                target: LOG_TARGET,
                "Gap in pushed updates for {} (local {}, first {}), fetching", bucket, local_seq, first
            );
            self.schedule_fetch(bucket);
            return;
        }
        if let Err(e) = self.apply_updates(bucket, updates).await {
            error!(target: LOG_TARGET, "Failed to apply pushed updates for {}: {}", bucket, e);
            self.schedule_fetch(bucket);
        }
    }

    /// In-flight-plus-one coalescing per bucket.
    fn schedule_fetch(&mut self, bucket: Bucket) {
        let state = self.fetches.entry(bucket).or_default();
        if state.in_flight {
            state.follow_up = true;
            return;
        }
        state.in_flight = true;
        state.follow_up = false;
        self.start_fetch(bucket);
    }

    fn start_fetch(&self, bucket: Bucket) {
        let since_seq = match self.local_seq(bucket) {
            Ok(seq) => seq,
            Err(e) => {
                error!(target: LOG_TARGET, "Failed to read cursor for {}: {}", bucket, e);
                0
            },
        };
        debug!(target: LOG_TARGET, "Fetching {} since seq {}", bucket, since_seq);
        let protocol = self.protocol.clone();
        let fetch_tx = self.fetch_tx.clone();
        let timeout = self.config.sync.fetch_timeout;
        let limit = self.config.sync.fetch_limit;
        tokio::spawn(async move {
            let result = protocol
                .call_rpc(
                    Method::GetUpdates,
                    rpc_call::Input::GetUpdates(GetUpdatesInput {
                        bucket: Some(bucket),
                        since_seq,
                        limit,
                    }),
                    CallOptions::query(Some(timeout)),
                )
                .await;
            let _result = fetch_tx.send(FetchMsg::FetchDone(bucket, result)).await;
        });
    }

    async fn handle_fetch_msg(&mut self, msg: FetchMsg) {
        match msg {
            FetchMsg::StateDone(Ok(rpc_result::Result::GetUpdatesState(out))) => {
                for state in out.buckets {
                    let bucket = match state.bucket {
                        Some(bucket) => bucket,
                        None => continue,
                    };
                    let local_seq = self.local_seq(bucket).unwrap_or(0);
                    if state.seq > local_seq {
                        self.schedule_fetch(bucket);
                    } else if local_seq == 0 && state.seq == 0 {
                        // Record that the bucket exists so later pushes have a cursor
                        let _result = self.backend.upsert_bucket_state(BucketStateRecord {
                            bucket,
                            seq: 0,
                            date: state.date,
                        });
                    }
                }
            },
            FetchMsg::StateDone(Ok(other)) => {
                warn!(target: LOG_TARGET, "Unexpected result for GetUpdatesState: {:?}", other);
            },
            FetchMsg::StateDone(Err(e)) => {
                // The next open or foreground transition retries
                warn!(target: LOG_TARGET, "GetUpdatesState failed: {}", e);
            },
            FetchMsg::FetchDone(bucket, Ok(rpc_result::Result::GetUpdates(out))) => {
                let more = match self.apply_fetch(bucket, out).await {
                    Ok(more) => more,
                    Err(e) => {
                        error!(target: LOG_TARGET, "Failed to apply fetch for {}: {}", bucket, e);
                        false
                    },
                };
                self.finish_fetch(bucket, more);
            },
            FetchMsg::FetchDone(bucket, Ok(other)) => {
                warn!(target: LOG_TARGET, "Unexpected result for GetUpdates: {:?}", other);
                self.finish_fetch(bucket, false);
            },
            FetchMsg::FetchDone(bucket, Err(e)) => {
                let err = SyncError::ServerError {
                    bucket,
                    message: e.to_string(),
                };
                warn!(
                    target: LOG_TARGET,
                    "{}, retrying in {:?}", err, self.config.sync.retry_delay
                );
                let fetch_tx = self.fetch_tx.clone();
                let delay = self.config.sync.retry_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _result = fetch_tx.send(FetchMsg::Retry(bucket)).await;
                });
            },
            FetchMsg::Retry(bucket) => {
                if let Some(state) = self.fetches.get_mut(&bucket) {
                    state.in_flight = false;
                }
                self.schedule_fetch(bucket);
            },
        }
    }

    /// Returns whether another fetch is needed (`final == false`).
    async fn apply_fetch(
        &mut self,
        bucket: Bucket,
        out: banter_proto::GetUpdatesOutput,
    ) -> Result<bool, crate::storage::ClientStorageError> {
        let result_type =
            UpdatesResultType::try_from(out.result_type).unwrap_or(UpdatesResultType::Empty);
        match result_type {
            UpdatesResultType::Empty => {
                self.backend.upsert_bucket_state(BucketStateRecord {
                    bucket,
                    seq: out.seq,
                    date: out.date,
                })?;
                self.advance_last_sync_date(out.date)?;
                Ok(false)
            },
            UpdatesResultType::TooLong => {
                // The gap exceeds retention; fast-forward and let the bulk data paths refetch
                info!(
                    target: LOG_TARGET,
                    "{}, fast-forwarding to seq {}",
                    SyncError::TooLong(bucket),
                    out.seq
                );
                self.metrics.bucket_fetch_too_long.fetch_add(1, Ordering::Relaxed);
                self.backend.upsert_bucket_state(BucketStateRecord {
                    bucket,
                    seq: out.seq,
                    date: out.date,
                })?;
                self.advance_last_sync_date(out.date)?;
                Ok(!out.r#final)
            },
            UpdatesResultType::Slice => {
                let local_seq = self.local_seq(bucket)?;
                let mut updates = out.updates;
                updates.sort_by_key(Update::sort_key);
                updates.retain(|u| u.seq > local_seq);
                if !updates.is_empty() {
                    self.apply_updates(bucket, updates).await?;
                }
                Ok(!out.r#final)
            },
        }
    }

    /// Deliver a sorted, deduplicated batch and advance the cursor.
    async fn apply_updates(
        &mut self,
        bucket: Bucket,
        updates: Vec<Update>,
    ) -> Result<(), crate::storage::ClientStorageError> {
        let last = match updates.last() {
            Some(last) => (last.seq, last.date),
            None => return Ok(()),
        };
        let max_date = updates.iter().map(|u| u.date).max().unwrap_or(last.1);

        let deliverable: Vec<Update> = updates
            .into_iter()
            .filter(|u| self.is_deliverable(u))
            .collect();
        if !deliverable.is_empty() {
            self.metrics
                .applied_updates
                .fetch_add(deliverable.len() as u64, Ordering::Relaxed);
            let batch = AppliedUpdates {
                bucket,
                updates: deliverable,
            };
            if self.applied_tx.send(batch).await.is_err() {
                debug!(target: LOG_TARGET, "Applied-updates consumer dropped");
            }
        }

        self.backend.upsert_bucket_state(BucketStateRecord {
            bucket,
            seq: last.0,
            date: last.1,
        })?;
        self.advance_last_sync_date(max_date)?;
        Ok(())
    }

    /// Message-content updates are gated; everything else always applies.
    fn is_deliverable(&self, update: &Update) -> bool {
        match &update.update {
            Some(update::Body::NewMessage(_)) | Some(update::Body::EditMessage(_)) => {
                self.config.sync.enable_message_updates
            },
            Some(_) => true,
            None => false,
        }
    }

    /// `last_sync_date` always lags the freshest applied update by the safety gap, and only ever
    /// moves forward.
    fn advance_last_sync_date(&self, date: i64) -> Result<(), crate::storage::ClientStorageError> {
        let candidate = date - self.config.sync.safety_gap.as_secs() as i64;
        let current = self.backend.fetch_last_sync_date()?.unwrap_or(i64::MIN);
        if candidate > current {
            self.backend.set_last_sync_date(candidate)?;
        }
        Ok(())
    }

    fn local_seq(&self, bucket: Bucket) -> Result<u32, crate::storage::ClientStorageError> {
        Ok(self
            .backend
            .fetch_bucket_state(bucket)?
            .map(|s| s.seq)
            .unwrap_or(0))
    }

    fn finish_fetch(&mut self, bucket: Bucket, more: bool) {
        let state = self.fetches.entry(bucket).or_default();
        let follow_up = state.follow_up || more;
        state.in_flight = false;
        state.follow_up = false;
        if follow_up {
            self.schedule_fetch(bucket);
        }
    }
}

#[cfg(test)]
mod test;
