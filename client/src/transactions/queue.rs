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

//! The in-memory half of the durable transaction queue: a FIFO of wrappers with the
//! `queued → inflight → sent → done | failed` lifecycle and the reconnect bookkeeping.

use std::collections::{HashMap, HashSet, VecDeque};

use log::*;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{Transaction, TransactionKind};
use crate::error::TransactionError;

const LOG_TARGET: &str = "client::transactions::queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Queued,
    Inflight,
    Sent,
    Done,
    Failed,
}

pub type CompletionSender =
    oneshot::Sender<Result<banter_proto::rpc_result::Result, TransactionError>>;

pub struct TransactionWrapper {
    pub id: Uuid,
    pub date: i64,
    pub state: TransactionState,
    pub transaction: Box<dyn Transaction>,
    pub(crate) completion: Option<CompletionSender>,
}

impl TransactionWrapper {
    pub fn retry_after_ack(&self) -> bool {
        match self.transaction.kind() {
            TransactionKind::Query => true,
            TransactionKind::Mutation(config) => config.retry_after_ack,
        }
    }
}

/// FIFO queue with single-inflight dispatch and ack tracking. Purely synchronous; the service
/// actor drives it.
#[derive(Default)]
pub struct TransactionQueue {
    order: VecDeque<Uuid>,
    entries: HashMap<Uuid, TransactionWrapper>,
    msg_ids: HashMap<u64, Uuid>,
    tx_msg_ids: HashMap<Uuid, u64>,
    buffered_acks: HashSet<u64>,
    inflight: Option<Uuid>,
}

impl TransactionQueue {
    /// Append to the back of the queue.
    pub fn queue(&mut self, wrapper: TransactionWrapper) -> Uuid {
        let id = wrapper.id;
        debug_assert_eq!(wrapper.state, TransactionState::Queued);
        self.order.push_back(id);
        self.entries.insert(id, wrapper);
        id
    }

    /// Atomically pop the head of the queue and move it to inflight. Returns `None` while another
    /// transaction is still inflight or the queue is empty.
    pub fn dequeue(&mut self) -> Option<Uuid> {
        if self.inflight.is_some() {
            return None;
        }
        let id = self.order.pop_front()?;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.state = TransactionState::Inflight;
        }
        self.inflight = Some(id);
        Some(id)
    }

    /// Register the rpc msg id assigned to an inflight transaction. An ack that raced ahead of
    /// this registration is applied now.
    pub fn running(&mut self, tx_id: Uuid, rpc_msg_id: u64) {
        self.msg_ids.insert(rpc_msg_id, tx_id);
        self.tx_msg_ids.insert(tx_id, rpc_msg_id);
        if self.buffered_acks.remove(&rpc_msg_id) {
            self.ack(rpc_msg_id);
        }
    }

    /// Move the associated transaction from inflight to sent. Unknown msg ids are buffered for
    /// one round so an ack racing `running` is not lost.
    pub fn ack(&mut self, rpc_msg_id: u64) {
        match self.msg_ids.get(&rpc_msg_id) {
            Some(tx_id) => {
                if let Some(entry) = self.entries.get_mut(tx_id) {
                    if entry.state == TransactionState::Inflight {
                        entry.state = TransactionState::Sent;
                    }
                }
            },
            None => {
                self.buffered_acks.insert(rpc_msg_id);
            },
        }
    }

    /// Remove the inflight/sent transaction and hand it back for `apply(result)`.
    pub fn complete(&mut self, tx_id: Uuid) -> Option<TransactionWrapper> {
        let mut wrapper = self.remove(tx_id)?;
        wrapper.state = TransactionState::Done;
        Some(wrapper)
    }

    /// Remove a transaction as terminally failed.
    pub fn fail(&mut self, tx_id: Uuid) -> Option<TransactionWrapper> {
        let mut wrapper = self.remove(tx_id)?;
        wrapper.state = TransactionState::Failed;
        Some(wrapper)
    }

    /// Move one transaction from inflight back to the head of the queue.
    pub fn requeue(&mut self, tx_id: Uuid) {
        if let Some(entry) = self.entries.get_mut(&tx_id) {
            entry.state = TransactionState::Queued;
            self.order.retain(|id| *id != tx_id);
            self.order.push_front(tx_id);
        }
        self.clear_mapping(tx_id);
        if self.inflight == Some(tx_id) {
            self.inflight = None;
        }
    }

    /// Reconnect bookkeeping: every inflight transaction is requeued; every sent transaction is
    /// requeued when `retry_after_ack` allows, otherwise dropped. Returns the dropped set so the
    /// caller can surface the failures.
    pub fn requeue_all(&mut self) -> Vec<TransactionWrapper> {
        let mut dropped = Vec::new();
        let mut to_requeue = Vec::new();
        let ids: Vec<Uuid> = self.entries.keys().copied().collect();
        for id in ids {
            let state = match self.entries.get(&id) {
                Some(entry) => entry.state,
                None => continue,
            };
            match state {
                TransactionState::Inflight => to_requeue.push(id),
                TransactionState::Sent => {
                    let retry = self
                        .entries
                        .get(&id)
                        .map(|e| e.retry_after_ack())
                        .unwrap_or(false);
                    if retry {
                        to_requeue.push(id);
                    } else if let Some(mut wrapper) = self.remove(id) {
                        wrapper.state = TransactionState::Failed;
                        dropped.push(wrapper);
                    }
                },
                _ => {},
            }
        }
        // Oldest first so push_front keeps the original order
        to_requeue.sort_by_key(|id| self.entries.get(id).map(|e| e.date).unwrap_or_default());
        for id in to_requeue.into_iter().rev() {
            self.requeue(id);
        }
        self.msg_ids.clear();
        self.tx_msg_ids.clear();
        self.buffered_acks.clear();
        self.inflight = None;
        if !dropped.is_empty() {
            info!(
                target: LOG_TARGET,
                "Dropped {} acked transaction(s) that cannot be proved committed", dropped.len()
            );
        }
        dropped
    }

    /// Clear only the msg id mappings; transaction states are untouched.
    pub fn connection_lost(&mut self) {
        self.msg_ids.clear();
        self.tx_msg_ids.clear();
        self.buffered_acks.clear();
    }

    /// Drop everything, e.g. on logout. Returns the removed wrappers so their futures can be
    /// cancelled.
    pub fn clear_all(&mut self) -> Vec<TransactionWrapper> {
        self.order.clear();
        self.msg_ids.clear();
        self.tx_msg_ids.clear();
        self.buffered_acks.clear();
        self.inflight = None;
        self.entries.drain().map(|(_, w)| w).collect()
    }

    pub fn state_of(&self, tx_id: Uuid) -> Option<TransactionState> {
        self.entries.get(&tx_id).map(|e| e.state)
    }

    pub fn entry(&self, tx_id: Uuid) -> Option<&TransactionWrapper> {
        self.entries.get(&tx_id)
    }

    pub fn msg_id_of(&self, tx_id: Uuid) -> Option<u64> {
        self.tx_msg_ids.get(&tx_id).copied()
    }

    pub fn queued_ids(&self) -> Vec<Uuid> {
        self.order.iter().copied().collect()
    }

    pub fn inflight_id(&self) -> Option<Uuid> {
        self.inflight
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_queued(&self) -> bool {
        !self.order.is_empty()
    }

    fn remove(&mut self, tx_id: Uuid) -> Option<TransactionWrapper> {
        let wrapper = self.entries.remove(&tx_id)?;
        self.order.retain(|id| *id != tx_id);
        self.clear_mapping(tx_id);
        if self.inflight == Some(tx_id) {
            self.inflight = None;
        }
        Some(wrapper)
    }

    fn clear_mapping(&mut self, tx_id: Uuid) {
        if let Some(msg_id) = self.tx_msg_ids.remove(&tx_id) {
            self.msg_ids.remove(&msg_id);
        }
    }
}

#[cfg(test)]
mod test {
    use banter_proto::{rpc_call, Method};

    use super::*;
    use crate::transactions::MutationConfig;

    struct TestTx {
        retry_after_ack: bool,
    }

    impl Transaction for TestTx {
        fn method(&self) -> Method {
            Method::SendMessage
        }

        fn input(&self) -> rpc_call::Input {
            rpc_call::Input::SendMessage(banter_proto::SendMessageInput {
                chat_id: 1,
                text: "hello".to_string(),
                random_id: 1,
            })
        }

        fn kind(&self) -> TransactionKind {
            TransactionKind::Mutation(MutationConfig {
                retry_after_ack: self.retry_after_ack,
            })
        }
    }

    fn wrapper(retry_after_ack: bool, date: i64) -> TransactionWrapper {
        TransactionWrapper {
            id: Uuid::new_v4(),
            date,
            state: TransactionState::Queued,
            transaction: Box::new(TestTx { retry_after_ack }),
            completion: None,
        }
    }

    #[test]
    fn lifecycle_queued_inflight_sent_done() {
        let mut queue = TransactionQueue::default();
        let id = queue.queue(wrapper(false, 1));
        assert_eq!(queue.state_of(id), Some(TransactionState::Queued));

        let dequeued = queue.dequeue().unwrap();
        assert_eq!(dequeued, id);
        assert_eq!(queue.state_of(id), Some(TransactionState::Inflight));

        queue.running(id, 44);
        queue.ack(44);
        assert_eq!(queue.state_of(id), Some(TransactionState::Sent));

        let done = queue.complete(id).unwrap();
        assert_eq!(done.state, TransactionState::Done);
        assert!(queue.is_empty());
        assert_eq!(queue.msg_id_of(id), None);
    }

    #[test]
    fn single_inflight_at_a_time() {
        let mut queue = TransactionQueue::default();
        let first = queue.queue(wrapper(false, 1));
        let _second = queue.queue(wrapper(false, 2));
        assert_eq!(queue.dequeue(), Some(first));
        assert_eq!(queue.dequeue(), None);
        queue.complete(first);
        assert!(queue.dequeue().is_some());
    }

    #[test]
    fn ack_before_running_is_buffered_one_round() {
        let mut queue = TransactionQueue::default();
        let id = queue.queue(wrapper(false, 1));
        queue.dequeue().unwrap();

        // The ack arrives before running() registers the mapping
        queue.ack(44);
        assert_eq!(queue.state_of(id), Some(TransactionState::Inflight));
        queue.running(id, 44);
        assert_eq!(queue.state_of(id), Some(TransactionState::Sent));
    }

    #[test]
    fn requeue_moves_to_head() {
        let mut queue = TransactionQueue::default();
        let first = queue.queue(wrapper(false, 1));
        let second = queue.queue(wrapper(false, 2));
        let dequeued = queue.dequeue().unwrap();
        assert_eq!(dequeued, first);
        queue.requeue(first);
        assert_eq!(queue.queued_ids(), vec![first, second]);
        assert_eq!(queue.state_of(first), Some(TransactionState::Queued));
        assert_eq!(queue.inflight_id(), None);
    }

    #[test]
    fn requeue_all_drops_acked_without_retry() {
        let mut queue = TransactionQueue::default();
        let id = queue.queue(wrapper(false, 1));
        queue.dequeue().unwrap();
        queue.running(id, 44);
        queue.ack(44);

        let dropped = queue.requeue_all();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, id);
        assert_eq!(dropped[0].state, TransactionState::Failed);
        assert!(queue.is_empty());
        assert_eq!(queue.msg_id_of(id), None);
    }

    #[test]
    fn requeue_all_requeues_acked_with_retry() {
        let mut queue = TransactionQueue::default();
        let id = queue.queue(wrapper(true, 1));
        queue.dequeue().unwrap();
        queue.running(id, 44);
        queue.ack(44);

        let dropped = queue.requeue_all();
        assert!(dropped.is_empty());
        // Same id reappears in the queue
        assert_eq!(queue.queued_ids(), vec![id]);
        assert_eq!(queue.state_of(id), Some(TransactionState::Queued));
        assert_eq!(queue.msg_id_of(id), None);
    }

    #[test]
    fn requeue_all_requeues_unacked_inflight() {
        let mut queue = TransactionQueue::default();
        let id = queue.queue(wrapper(false, 1));
        queue.dequeue().unwrap();
        queue.running(id, 44);

        let dropped = queue.requeue_all();
        assert!(dropped.is_empty());
        assert_eq!(queue.queued_ids(), vec![id]);
    }

    #[test]
    fn connection_lost_clears_only_mappings() {
        let mut queue = TransactionQueue::default();
        let id = queue.queue(wrapper(false, 1));
        queue.dequeue().unwrap();
        queue.running(id, 44);
        queue.ack(44);

        queue.connection_lost();
        assert_eq!(queue.state_of(id), Some(TransactionState::Sent));
        assert_eq!(queue.msg_id_of(id), None);
    }

    #[test]
    fn clear_all_empties_everything() {
        let mut queue = TransactionQueue::default();
        queue.queue(wrapper(false, 1));
        queue.queue(wrapper(false, 2));
        let removed = queue.clear_all();
        assert_eq!(removed.len(), 2);
        assert!(queue.is_empty());
        assert!(!queue.has_queued());
    }

    #[test]
    fn stale_buffered_ack_is_dropped_after_requeue_all() {
        let mut queue = TransactionQueue::default();
        let id = queue.queue(wrapper(true, 1));
        queue.dequeue().unwrap();

        queue.ack(99);
        queue.requeue_all();
        // The buffered ack from the dead connection must not leak into the next round
        queue.dequeue().unwrap();
        queue.running(id, 100);
        assert_eq!(queue.state_of(id), Some(TransactionState::Inflight));
    }
}
