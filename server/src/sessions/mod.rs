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

//! The session registry: live authenticated connections indexed by user.
//!
//! Each connection task registers its outbound queue here; fan-out to a user reaches every one
//! of their live sessions. Delivery is best-effort; a backlogged session drops pushes and
//! recovers through the sync path.

use std::collections::HashMap;

use banter_proto::ServerMessage;
use banter_shutdown::ShutdownSignal;
use chrono::Utc;
use log::*;
use tokio::sync::{mpsc, oneshot};

const LOG_TARGET: &str = "server::sessions";

const COMMAND_BUFFER_SIZE: usize = 256;

pub type SessionId = u64;

struct SessionEntry {
    user_id: i64,
    sender: mpsc::Sender<ServerMessage>,
    connected_at: i64,
}

enum RegistryCommand {
    Add {
        user_id: i64,
        sender: mpsc::Sender<ServerMessage>,
        reply: oneshot::Sender<SessionId>,
    },
    Remove {
        session_id: SessionId,
    },
    SendToUsers {
        user_ids: Vec<i64>,
        message: ServerMessage,
    },
    OnlineUserIds {
        reply: oneshot::Sender<Vec<i64>>,
    },
    SessionCount {
        reply: oneshot::Sender<usize>,
    },
}

#[derive(Clone)]
pub struct SessionRegistryHandle {
    commands: mpsc::Sender<RegistryCommand>,
}

impl SessionRegistryHandle {
    pub async fn add_session(
        &self,
        user_id: i64,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Option<SessionId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(RegistryCommand::Add {
                user_id,
                sender,
                reply: reply_tx,
            })
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    pub async fn remove_session(&self, session_id: SessionId) {
        let _result = self.commands.send(RegistryCommand::Remove { session_id }).await;
    }

    /// Deliver `message` to every live session of every listed user.
    pub async fn send_to_users(&self, user_ids: Vec<i64>, message: ServerMessage) {
        let _result = self
            .commands
            .send(RegistryCommand::SendToUsers { user_ids, message })
            .await;
    }

    pub async fn online_user_ids(&self) -> Vec<i64> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(RegistryCommand::OnlineUserIds { reply: reply_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn session_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(RegistryCommand::SessionCount { reply: reply_tx })
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }
}

pub struct SessionRegistry {
    commands: mpsc::Receiver<RegistryCommand>,
    shutdown_signal: ShutdownSignal,
    sessions: HashMap<SessionId, SessionEntry>,
    by_user: HashMap<i64, Vec<SessionId>>,
    next_session_id: SessionId,
}

impl SessionRegistry {
    pub fn spawn(shutdown_signal: ShutdownSignal) -> SessionRegistryHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let registry = Self {
            commands: command_rx,
            shutdown_signal,
            sessions: HashMap::new(),
            by_user: HashMap::new(),
            next_session_id: 1,
        };
        tokio::spawn(registry.run());
        SessionRegistryHandle {
            commands: command_tx,
        }
    }

    async fn run(mut self) {
        debug!(target: LOG_TARGET, "Session registry started");
        let mut shutdown = self.shutdown_signal.clone();
        loop {
            tokio::select! {
                maybe_cmd = self.commands.recv() => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = shutdown.wait() => break,
            }
        }
        debug!(target: LOG_TARGET, "Session registry ended");
    }

    fn handle_command(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Add { user_id, sender, reply } => {
                let session_id = self.next_session_id;
                self.next_session_id += 1;
                self.sessions.insert(session_id, SessionEntry {
                    user_id,
                    sender,
                    connected_at: Utc::now().timestamp(),
                });
                self.by_user.entry(user_id).or_default().push(session_id);
                debug!(
                    target: LOG_TARGET,
                    "Session {} for user {} registered ({} total)",
                    session_id,
                    user_id,
                    self.sessions.len()
                );
                let _result = reply.send(session_id);
            },
            RegistryCommand::Remove { session_id } => {
                if let Some(entry) = self.sessions.remove(&session_id) {
                    if let Some(ids) = self.by_user.get_mut(&entry.user_id) {
                        ids.retain(|id| *id != session_id);
                        if ids.is_empty() {
                            self.by_user.remove(&entry.user_id);
                        }
                    }
                    debug!(
                        target: LOG_TARGET,
                        "Session {} for user {} removed after {}s",
                        session_id,
                        entry.user_id,
                        Utc::now().timestamp() - entry.connected_at
                    );
                }
            },
            RegistryCommand::SendToUsers { user_ids, message } => {
                for user_id in user_ids {
                    let session_ids = match self.by_user.get(&user_id) {
                        Some(ids) => ids.clone(),
                        None => continue,
                    };
                    for session_id in session_ids {
                        if let Some(entry) = self.sessions.get(&session_id) {
                            // Best-effort: a backlogged session loses the push and catches up
                            // through sync
                            if let Err(e) = entry.sender.try_send(message.clone()) {
                                warn!(
                                    target: LOG_TARGET,
                                    "Dropping push for session {}: {}", session_id, e
                                );
                            }
                        }
                    }
                }
            },
            RegistryCommand::OnlineUserIds { reply } => {
                let mut ids: Vec<i64> = self.by_user.keys().copied().collect();
                ids.sort_unstable();
                let _result = reply.send(ids);
            },
            RegistryCommand::SessionCount { reply } => {
                let _result = reply.send(self.sessions.len());
            },
        }
    }
}
