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

use banter_proto::{Bucket, CodecError, ConnectionErrorCode};

use crate::storage::ClientStorageError;

/// Errors surfaced by the transport, protocol and connection layers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("Not connected")]
    NotConnected,
    #[error("The call timed out")]
    Timeout,
    #[error("Rpc error {code} ({error_code}): {message}")]
    Rpc {
        error_code: String,
        code: u32,
        message: String,
    },
    #[error("The component was stopped")]
    Stopped,
    #[error("The server rejected the credentials")]
    AuthFailed,
    #[error("The server acked the call but the connection was lost before a result arrived")]
    AckedButNoResultAfterReconnect,
    #[error("No pong was received within the ping timeout")]
    PingTimeout,
    #[error("The server terminated the session ({code:?}): {message}")]
    ConnectionError {
        code: ConnectionErrorCode,
        message: String,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        ClientError::Codec(err.to_string())
    }
}

/// Terminal outcomes of a queued transaction.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransactionError {
    #[error("The server acked the call but the connection was lost before a result arrived")]
    AckedButNoResultAfterReconnect,
    #[error("The optimistic apply failed: {0}")]
    OptimisticApplyFailed(String),
    #[error("Applying the result failed: {0}")]
    ApplyFailed(String),
    #[error("The transaction was cancelled")]
    Cancelled,
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("Transaction storage error: {0}")]
    Storage(String),
}

impl From<ClientStorageError> for TransactionError {
    fn from(err: ClientStorageError) -> Self {
        TransactionError::Storage(err.to_string())
    }
}

/// Errors internal to the sync component. These are logged and retried, never surfaced to user
/// code.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Bucket {0} is too far behind the retention window")]
    TooLong(Bucket),
    #[error("Server error while fetching {bucket}: {message}")]
    ServerError { bucket: Bucket, message: String },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("Sync storage error: {0}")]
    Storage(#[from] ClientStorageError),
}
