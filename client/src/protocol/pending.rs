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

use std::{collections::BTreeMap, time::Duration};

use banter_proto::{rpc_call, rpc_result, Method};
use tokio::{sync::oneshot, time::Instant};

use crate::error::ClientError;

/// Who is driving a call, which decides its fate on transport loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOwner {
    /// Safe to silently resend after the next open.
    Query,
    /// Owned by the transaction queue; the queue requeues it itself, so on disconnect the entry
    /// fails rather than resends. With `retry_after_ack = false` an acked entry fails with
    /// [`ClientError::AckedButNoResultAfterReconnect`].
    Transaction { retry_after_ack: bool },
}

#[derive(Debug, Clone)]
pub struct CallOptions {
    /// `None` disables the timeout.
    pub timeout: Option<Duration>,
    pub may_queue_before_open: bool,
    pub owner: CallOwner,
}

impl CallOptions {
    pub fn query(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            may_queue_before_open: true,
            owner: CallOwner::Query,
        }
    }

    pub fn transaction(timeout: Option<Duration>, retry_after_ack: bool) -> Self {
        Self {
            timeout,
            may_queue_before_open: false,
            owner: CallOwner::Transaction { retry_after_ack },
        }
    }
}

pub(super) struct PendingRpc {
    pub method: Method,
    pub input: rpc_call::Input,
    pub result_tx: oneshot::Sender<Result<rpc_result::Result, ClientError>>,
    pub deadline: Option<Instant>,
    pub owner: CallOwner,
    pub sent: bool,
    pub acked: bool,
}

impl PendingRpc {
    fn fail(self, err: ClientError) {
        // The caller may have dropped its future
        let _result = self.result_tx.send(Err(err));
    }
}

/// The protocol client's table of in-flight RPCs, keyed by msg id. The msg ids are monotonic, so
/// iteration order is emission order.
#[derive(Default)]
pub(super) struct PendingTable {
    entries: BTreeMap<u64, PendingRpc>,
}

impl PendingTable {
    pub fn insert(&mut self, msg_id: u64, entry: PendingRpc) {
        self.entries.insert(msg_id, entry);
    }

    pub fn mark_sent(&mut self, msg_id: u64) {
        if let Some(entry) = self.entries.get_mut(&msg_id) {
            entry.sent = true;
        }
    }

    /// Returns false for unknown ids so late acks can be dropped.
    pub fn mark_acked(&mut self, msg_id: u64) -> bool {
        match self.entries.get_mut(&msg_id) {
            Some(entry) => {
                entry.acked = true;
                true
            },
            None => false,
        }
    }

    pub fn complete(&mut self, msg_id: u64) -> Option<PendingRpc> {
        self.entries.remove(&msg_id)
    }

    pub fn get(&self, msg_id: u64) -> Option<&PendingRpc> {
        self.entries.get(&msg_id)
    }

    pub fn contains(&self, msg_id: u64) -> bool {
        self.entries.contains_key(&msg_id)
    }

    /// Ids of entries that have not been written to the current socket, in emission order.
    pub fn unsent_ids(&self) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.sent)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.deadline).min()
    }

    /// Remove and fail every entry whose deadline has passed.
    pub fn expire_due(&mut self, now: Instant) {
        let due: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(entry) = self.entries.remove(&id) {
                entry.fail(ClientError::Timeout);
            }
        }
    }

    /// Apply the transport-loss policy: queries stay parked for resend after the next open,
    /// transaction-owned entries fail so their queue can requeue (or drop) them.
    pub fn handle_disconnect(&mut self) {
        let ids: Vec<u64> = self.entries.keys().copied().collect();
        for id in ids {
            let entry = self.entries.get(&id).expect("id taken from the table");
            match entry.owner {
                CallOwner::Query => {
                    let entry = self.entries.get_mut(&id).expect("id taken from the table");
                    entry.sent = false;
                    entry.acked = false;
                },
                CallOwner::Transaction { retry_after_ack } => {
                    let entry = self.entries.remove(&id).expect("id taken from the table");
                    if entry.acked && !retry_after_ack {
                        entry.fail(ClientError::AckedButNoResultAfterReconnect);
                    } else {
                        entry.fail(ClientError::NotConnected);
                    }
                },
            }
        }
    }

    /// Fail everything, e.g. on stop.
    pub fn fail_all(&mut self, err: &ClientError) {
        let entries = std::mem::take(&mut self.entries);
        for (_, entry) in entries {
            entry.fail(err.clone());
        }
    }
}
