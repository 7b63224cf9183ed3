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

use banter_common_sqlite::error::SqliteStorageError;
use banter_proto::RpcError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Sqlite storage error: {0}")]
    Sqlite(#[from] SqliteStorageError),
    #[error("Diesel error: {0}")]
    Diesel(#[from] diesel::result::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] banter_proto::CodecError),
    #[error("Payload seal error: {0}")]
    Seal(String),
    #[error("Unknown auth token")]
    AuthFailed,
    #[error("Access denied to {scope} {entity_id}")]
    Forbidden { scope: &'static str, entity_id: i64 },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("The connection violated the protocol: {0}")]
    ProtocolViolation(String),
}

impl ServerError {
    /// Stable string code surfaced to clients in `RpcError.error_code`.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::Config(_) | ServerError::Io(_) => "INTERNAL",
            ServerError::Sqlite(_) | ServerError::Diesel(_) | ServerError::Seal(_) => "INTERNAL",
            ServerError::Codec(_) => "BAD_REQUEST",
            ServerError::AuthFailed => "AUTH_FAILED",
            ServerError::Forbidden { .. } => "FORBIDDEN",
            ServerError::NotFound(_) => "NOT_FOUND",
            ServerError::BadRequest(_) => "BAD_REQUEST",
            ServerError::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
        }
    }

    pub fn numeric_code(&self) -> u32 {
        match self {
            ServerError::Codec(_) | ServerError::BadRequest(_) => 400,
            ServerError::AuthFailed => 401,
            ServerError::Forbidden { .. } => 403,
            ServerError::NotFound(_) => 404,
            ServerError::ProtocolViolation(_) => 422,
            _ => 500,
        }
    }

    /// Internal detail stays in the logs; clients get the category only.
    pub fn to_rpc_error(&self, req_msg_id: u64) -> RpcError {
        let message = match self {
            ServerError::Sqlite(_) |
            ServerError::Diesel(_) |
            ServerError::Seal(_) |
            ServerError::Config(_) |
            ServerError::Io(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        RpcError {
            req_msg_id,
            error_code: self.error_code().to_string(),
            code: self.numeric_code(),
            message,
        }
    }
}
