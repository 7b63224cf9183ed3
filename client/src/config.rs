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

/// Ping/pong liveness policy. The constrained timeout applies while the manager reports a
/// constrained network (e.g. low-data cellular).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPolicy {
    pub interval: Duration,
    pub timeout_good: Duration,
    pub timeout_constrained: Duration,
}

impl Default for PingPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout_good: Duration::from_secs(6),
            timeout_constrained: Duration::from_secs(12),
        }
    }
}

/// Catch-up configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Conservative lag applied to the persisted `last_sync_date` to absorb server clock skew.
    pub safety_gap: Duration,
    /// Maximum updates requested per `GetUpdates` call.
    pub fetch_limit: u32,
    pub fetch_timeout: Duration,
    /// Delay before retrying a failed bucket fetch.
    pub retry_delay: Duration,
    /// When false, `NewMessage`/`EditMessage` updates are skipped and message content is pulled
    /// lazily through the history RPCs instead.
    pub enable_message_updates: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            safety_gap: Duration::from_secs(15),
            fetch_limit: 100,
            fetch_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            enable_message_updates: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Single WS endpoint. No query parameters affect the connection state machine.
    pub ws_url: String,
    pub build: Option<String>,
    pub device: Option<String>,
    /// Abandon a connect attempt that has not completed the WebSocket handshake in time.
    pub connect_timeout: Duration,
    /// Time allowed between the socket opening and the server's `ConnectionOpen`.
    pub auth_timeout: Duration,
    pub rpc_timeout: Duration,
    pub ping: PingPolicy,
    /// Window within which repeated foreground transitions collapse into one reconnect.
    pub foreground_coalesce_window: Duration,
    pub sync: SyncConfig,
}

impl ClientConfig {
    pub fn new<T: Into<String>>(ws_url: T) -> Self {
        Self {
            ws_url: ws_url.into(),
            ..Default::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8765/realtime".to_string(),
            build: None,
            device: None,
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            ping: PingPolicy::default(),
            foreground_coalesce_window: Duration::from_millis(150),
            sync: SyncConfig::default(),
        }
    }
}
