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

//! Combines external preconditions with the protocol state machine to decide connection
//! lifecycle. The transport runs only while auth is available, the network is up and the app is
//! foregrounded.

use std::sync::Arc;

use banter_shutdown::ShutdownSignal;
use chrono::{DateTime, Utc};
use log::*;
use tokio::{
    sync::{broadcast, mpsc, watch},
    time::Instant,
};

use crate::{
    config::ClientConfig,
    error::ClientError,
    protocol::{ProtocolClient, ProtocolClientHandle, ProtocolEvent},
    transport::{DisconnectReason, Transport},
};

const LOG_TARGET: &str = "client::connection_manager";

const COMMAND_BUFFER_SIZE: usize = 32;

/// External preconditions; the transport runs only while all three hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constraints {
    pub auth_available: bool,
    pub network_up: bool,
    pub foregrounded: bool,
}

impl Constraints {
    pub fn all_met(&self) -> bool {
        self.auth_available && self.network_up && self.foregrounded
    }
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            auth_available: false,
            network_up: true,
            foregrounded: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    WaitingForConstraints,
    Connecting,
    Handshaking,
    Authenticating,
    Connected,
    Backoff,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerReason {
    PingTimeout,
    ConnectionLost(String),
    ConnectionError(String),
    AuthFailed,
    Stopped,
}

/// Read-only view of the manager, published on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSnapshot {
    pub state: ManagerState,
    pub reason: Option<ManagerReason>,
    pub constraints: Constraints,
    pub attempt_no: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl ManagerSnapshot {
    fn initial() -> Self {
        Self {
            state: ManagerState::Idle,
            reason: None,
            constraints: Constraints::default(),
            attempt_no: 0,
            last_connected_at: None,
        }
    }
}

enum ManagerCommand {
    SetAuthToken(Option<String>),
    SetNetworkUp(bool),
    SetNetworkConstrained(bool),
    SetForegrounded(bool),
    ConnectNow,
    Stop,
}

#[derive(Clone)]
pub struct ConnectionManagerHandle {
    commands: mpsc::Sender<ManagerCommand>,
    snapshot: watch::Receiver<ManagerSnapshot>,
    protocol: ProtocolClientHandle,
}

impl ConnectionManagerHandle {
    /// Provide or clear the auth token. A `Some` token sets the auth constraint.
    pub async fn set_auth_token(&self, token: Option<String>) -> Result<(), ClientError> {
        self.send(ManagerCommand::SetAuthToken(token)).await
    }

    pub async fn set_network_up(&self, up: bool) -> Result<(), ClientError> {
        self.send(ManagerCommand::SetNetworkUp(up)).await
    }

    /// Switch the liveness check to the wider constrained-network timeout.
    pub async fn set_network_constrained(&self, constrained: bool) -> Result<(), ClientError> {
        self.send(ManagerCommand::SetNetworkConstrained(constrained)).await
    }

    pub async fn set_foregrounded(&self, foregrounded: bool) -> Result<(), ClientError> {
        self.send(ManagerCommand::SetForegrounded(foregrounded)).await
    }

    /// Clear any pending backoff and attempt to connect immediately, constraints permitting.
    pub async fn connect_now(&self) -> Result<(), ClientError> {
        self.send(ManagerCommand::ConnectNow).await
    }

    pub async fn stop(&self) -> Result<(), ClientError> {
        self.send(ManagerCommand::Stop).await
    }

    pub fn current_snapshot(&self) -> ManagerSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch channel carrying every snapshot change.
    pub fn watch_snapshots(&self) -> watch::Receiver<ManagerSnapshot> {
        self.snapshot.clone()
    }

    /// The protocol layer, for composing the transaction queue and sync on top.
    pub fn protocol(&self) -> &ProtocolClientHandle {
        &self.protocol
    }

    async fn send(&self, command: ManagerCommand) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Stopped)
    }
}

pub struct ConnectionManager {
    config: ClientConfig,
    protocol: ProtocolClientHandle,
    protocol_events: broadcast::Receiver<Arc<ProtocolEvent>>,
    auth_token_tx: watch::Sender<Option<String>>,
    commands: mpsc::Receiver<ManagerCommand>,
    snapshot_tx: watch::Sender<ManagerSnapshot>,
    shutdown_signal: ShutdownSignal,

    snapshot: ManagerSnapshot,
    running: bool,
    network_constrained: bool,
    last_foreground_reconnect: Option<Instant>,
}

impl ConnectionManager {
    /// Spawn the full stack: transport, protocol client and manager.
    pub fn spawn(config: ClientConfig, shutdown_signal: ShutdownSignal) -> ConnectionManagerHandle {
        let (auth_tx, auth_rx) = watch::channel(None);
        let (transport, transport_events) = Transport::spawn(config.clone(), shutdown_signal.clone());
        let protocol = ProtocolClient::spawn(
            config.clone(),
            transport,
            transport_events,
            auth_rx,
            shutdown_signal.clone(),
        );
        Self::spawn_with(config, protocol, auth_tx, shutdown_signal)
    }

    /// Spawn the manager over an existing protocol client.
    pub(crate) fn spawn_with(
        config: ClientConfig,
        protocol: ProtocolClientHandle,
        auth_token_tx: watch::Sender<Option<String>>,
        shutdown_signal: ShutdownSignal,
    ) -> ConnectionManagerHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (snapshot_tx, snapshot_rx) = watch::channel(ManagerSnapshot::initial());
        let manager = Self {
            config,
            protocol: protocol.clone(),
            protocol_events: protocol.subscribe(),
            auth_token_tx,
            commands: command_rx,
            snapshot_tx,
            shutdown_signal,
            snapshot: ManagerSnapshot::initial(),
            running: false,
            network_constrained: false,
            last_foreground_reconnect: None,
        };
        tokio::spawn(manager.run());
        ConnectionManagerHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            protocol,
        }
    }

    async fn run(mut self) {
        debug!(target: LOG_TARGET, "Connection manager started");
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
                        warn!(target: LOG_TARGET, "Manager lagged {} protocol events", n);
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.wait() => break,
            }
        }
        debug!(target: LOG_TARGET, "Connection manager ended");
    }

    async fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::SetAuthToken(token) => {
                let available = token.is_some();
                if self.snapshot.constraints.auth_available == available {
                    // Refreshing an existing token must not bounce the connection
                    let _result = self.auth_token_tx.send(token);
                    return;
                }
                let _result = self.auth_token_tx.send(token);
                self.snapshot.constraints.auth_available = available;
                self.re_evaluate().await;
            },
            ManagerCommand::SetNetworkUp(up) => {
                if self.snapshot.constraints.network_up == up {
                    return;
                }
                self.snapshot.constraints.network_up = up;
                self.re_evaluate().await;
            },
            ManagerCommand::SetNetworkConstrained(constrained) => {
                if self.network_constrained == constrained {
                    return;
                }
                self.network_constrained = constrained;
                let _result = self.protocol.set_constrained(constrained).await;
            },
            ManagerCommand::SetForegrounded(foregrounded) => {
                let changed = self.snapshot.constraints.foregrounded != foregrounded;
                let was_running = self.running;
                self.snapshot.constraints.foregrounded = foregrounded;
                if changed {
                    self.re_evaluate().await;
                }
                // A repeat foreground signal is a poke at a possibly-stale socket; a fresh
                // start needs no poke
                if foregrounded && self.running && was_running {
                    self.foreground_reconnect().await;
                    self.publish();
                }
            },
            ManagerCommand::ConnectNow => {
                if self.running {
                    let _result = self.protocol.reconnect(true).await;
                } else {
                    self.re_evaluate().await;
                }
            },
            ManagerCommand::Stop => {
                self.running = false;
                let _result = self.protocol.stop().await;
                self.snapshot.state = ManagerState::Stopped;
                self.snapshot.reason = Some(ManagerReason::Stopped);
                self.publish();
            },
        }
    }

    /// Start or pause the stack so that it matches the current constraints.
    async fn re_evaluate(&mut self) {
        if self.snapshot.state == ManagerState::Stopped && !self.snapshot.constraints.all_met() {
            self.publish();
            return;
        }
        if self.snapshot.constraints.all_met() {
            if !self.running {
                debug!(target: LOG_TARGET, "Constraints met, starting transport");
                self.running = true;
                self.snapshot.state = ManagerState::Connecting;
                self.snapshot.reason = None;
                let _result = self.protocol.start().await;
            }
        } else if self.running {
            debug!(
                target: LOG_TARGET,
                "Constraint lost ({:?}), pausing transport", self.snapshot.constraints
            );
            self.running = false;
            let _result = self.protocol.stop().await;
            self.snapshot.state = ManagerState::WaitingForConstraints;
        } else {
            self.snapshot.state = ManagerState::WaitingForConstraints;
        }
        self.publish();
    }

    /// Foreground transitions within the coalescing window collapse into one reconnect.
    async fn foreground_reconnect(&mut self) {
        let now = Instant::now();
        let window = self.config.foreground_coalesce_window;
        if self
            .last_foreground_reconnect
            .is_some_and(|at| now.saturating_duration_since(at) < window)
        {
            debug!(target: LOG_TARGET, "Coalescing foreground reconnect");
            return;
        }
        self.last_foreground_reconnect = Some(now);
        if self.snapshot.state != ManagerState::Connected {
            let _result = self.protocol.reconnect(true).await;
        }
    }

    async fn handle_protocol_event(&mut self, event: &ProtocolEvent) {
        if !self.running {
            return;
        }
        match event {
            ProtocolEvent::Connecting => {
                self.snapshot.state = ManagerState::Connecting;
            },
            ProtocolEvent::Handshaking => {
                self.snapshot.state = ManagerState::Handshaking;
            },
            ProtocolEvent::Authenticating => {
                self.snapshot.state = ManagerState::Authenticating;
            },
            ProtocolEvent::Open => {
                self.snapshot.state = ManagerState::Connected;
                self.snapshot.reason = None;
                self.snapshot.attempt_no = 0;
                self.snapshot.last_connected_at = Some(Utc::now());
            },
            ProtocolEvent::PingTimeout => {
                self.snapshot.state = ManagerState::Backoff;
                self.snapshot.reason = Some(ManagerReason::PingTimeout);
            },
            ProtocolEvent::ConnectionError { message, .. } => {
                self.snapshot.state = ManagerState::Backoff;
                self.snapshot.reason = Some(ManagerReason::ConnectionError(message.clone()));
            },
            ProtocolEvent::AuthFailed { message } => {
                info!(
                    target: LOG_TARGET,
                    "Auth rejected ({}), waiting for a fresh token", message
                );
                self.snapshot.constraints.auth_available = false;
                self.snapshot.reason = Some(ManagerReason::AuthFailed);
                let _result = self.auth_token_tx.send(None);
                self.running = false;
                let _result = self.protocol.stop().await;
                self.snapshot.state = ManagerState::WaitingForConstraints;
            },
            ProtocolEvent::Disconnected { reason } => {
                self.snapshot.state = ManagerState::Backoff;
                self.snapshot.attempt_no = self.snapshot.attempt_no.saturating_add(1);
                if let DisconnectReason::Lost(message) = reason {
                    self.snapshot.reason = Some(ManagerReason::ConnectionLost(message.clone()));
                }
            },
            ProtocolEvent::Stopped => {
                if self.running {
                    // The transport stopped without the manager asking; treat as constraint wait
                    self.running = false;
                    self.snapshot.state = ManagerState::WaitingForConstraints;
                }
            },
            _ => return,
        }
        self.publish();
    }

    fn publish(&self) {
        let _result = self.snapshot_tx.send(self.snapshot.clone());
    }
}

#[cfg(test)]
mod test;
