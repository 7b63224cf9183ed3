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

use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use crate::error::ServerError;

pub const ENV_DB_PATH: &str = "BANTER_DB_URL";
pub const ENV_PAYLOAD_KEY: &str = "BANTER_PAYLOAD_KEY";
pub const ENV_BIND_ADDR: &str = "BANTER_BIND_ADDR";
pub const ENV_ALLOWED_ORIGINS: &str = "BANTER_ALLOWED_ORIGINS";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the sqlite database file.
    pub db_path: PathBuf,
    /// 32-byte key sealing `Update.payload` at rest.
    pub payload_key: [u8; 32],
    pub bind_addr: SocketAddr,
    /// Browser origins allowed to connect. Empty allows any (non-browser clients send no
    /// `Origin` header at all).
    pub allowed_origins: Vec<String>,
    /// Time allowed between the socket opening and a valid `ConnectionInit`.
    pub handshake_timeout: Duration,
}

impl ServerConfig {
    /// Read the core configuration from the environment. Fails on a missing database URL or bad
    /// key material; the caller exits non-zero.
    pub fn from_env() -> Result<Self, ServerError> {
        let db_path = env::var(ENV_DB_PATH)
            .map_err(|_| ServerError::Config(format!("{} is required", ENV_DB_PATH)))?;
        let key_hex = env::var(ENV_PAYLOAD_KEY)
            .map_err(|_| ServerError::Config(format!("{} is required", ENV_PAYLOAD_KEY)))?;
        let payload_key = parse_key(&key_hex)?;
        let bind_addr = env::var(ENV_BIND_ADDR)
            .unwrap_or_else(|_| "127.0.0.1:8765".to_string())
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid {}: {}", ENV_BIND_ADDR, e)))?;
        let allowed_origins = env::var(ENV_ALLOWED_ORIGINS)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            db_path: PathBuf::from(db_path),
            payload_key,
            bind_addr,
            allowed_origins,
            handshake_timeout: Duration::from_secs(10),
        })
    }

    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(origin) => {
                self.allowed_origins.is_empty() ||
                    self.allowed_origins.iter().any(|allowed| allowed == origin)
            },
        }
    }
}

fn parse_key(hex: &str) -> Result<[u8; 32], ServerError> {
    let hex = hex.trim();
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ServerError::Config(format!(
            "{} must be 64 hex characters",
            ENV_PAYLOAD_KEY
        )));
    }
    let mut key = [0u8; 32];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|e| ServerError::Config(format!("invalid key material: {}", e)))?;
    }
    Ok(key)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_hex_key() {
        let key = parse_key(&"ab".repeat(32)).unwrap();
        assert_eq!(key, [0xab; 32]);
    }

    #[test]
    fn rejects_short_key() {
        assert!(parse_key("abcd").is_err());
        assert!(parse_key(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn origin_allowlist() {
        let mut config = ServerConfig {
            db_path: PathBuf::from("/tmp/banter.sqlite3"),
            payload_key: [0u8; 32],
            bind_addr: "127.0.0.1:8765".parse().unwrap(),
            allowed_origins: vec![],
            handshake_timeout: Duration::from_secs(10),
        };
        assert!(config.origin_allowed(None));
        assert!(config.origin_allowed(Some("https://anywhere.example")));

        config.allowed_origins = vec!["https://app.banter.chat".to_string()];
        assert!(config.origin_allowed(None));
        assert!(config.origin_allowed(Some("https://app.banter.chat")));
        assert!(!config.origin_allowed(Some("https://evil.example")));
    }
}
