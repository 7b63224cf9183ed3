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

use banter_proto::{rpc_call, Bucket, Method};
use uuid::Uuid;

use crate::storage::ClientStorageError;

/// One persisted row of the ordered transaction log.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub id: Uuid,
    /// Unix seconds at queue time.
    pub date: i64,
    pub method: Method,
    pub input: rpc_call::Input,
    pub retry_after_ack: bool,
}

/// Storage for the durable transaction queue. Completion is a soft delete so the log remains an
/// audit trail of what the client attempted.
pub trait TransactionBackend: Clone + Send + Sync + 'static {
    fn insert_transaction(&self, record: &TransactionRecord) -> Result<(), ClientStorageError>;
    fn mark_transaction_done(&self, id: Uuid) -> Result<(), ClientStorageError>;
    fn mark_transaction_failed(&self, id: Uuid) -> Result<(), ClientStorageError>;
    /// Pending records in queue order (by date, then id).
    fn fetch_pending_transactions(&self) -> Result<Vec<TransactionRecord>, ClientStorageError>;
    fn clear_transactions(&self) -> Result<(), ClientStorageError>;
}

/// Persisted cursor for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketStateRecord {
    pub bucket: Bucket,
    pub seq: u32,
    pub date: i64,
}

pub trait SyncBackend: Clone + Send + Sync + 'static {
    fn fetch_bucket_states(&self) -> Result<Vec<BucketStateRecord>, ClientStorageError>;
    fn fetch_bucket_state(&self, bucket: Bucket) -> Result<Option<BucketStateRecord>, ClientStorageError>;
    /// Cursors only ever advance; an upsert with an older seq is ignored.
    fn upsert_bucket_state(&self, record: BucketStateRecord) -> Result<(), ClientStorageError>;
    fn fetch_last_sync_date(&self) -> Result<Option<i64>, ClientStorageError>;
    fn set_last_sync_date(&self, date: i64) -> Result<(), ClientStorageError>;
}
