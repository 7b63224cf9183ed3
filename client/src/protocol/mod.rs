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

//! The framing layer above the transport.
//!
//! Generates message ids, performs the `ConnectionInit` handshake, matches RPC replies to pending
//! calls, forwards pushed updates and acks, and runs the ping/pong liveness check while open.

pub mod pending;

use std::sync::Arc;

use banter_proto::{
    client_message,
    rpc_call,
    rpc_result,
    server_message,
    Ack,
    ClientMessage,
    ConnectionErrorCode,
    ConnectionInit,
    Method,
    MsgIdGenerator,
    Ping,
    UpdatesPayload,
    PROTOCOL_LAYER,
};
use banter_shutdown::ShutdownSignal;
use log::*;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{sleep_until, Instant},
};

pub use self::pending::{CallOptions, CallOwner};
use self::pending::{PendingRpc, PendingTable};
use crate::{
    config::ClientConfig,
    error::ClientError,
    ping_pong::{PingAction, PingPongService},
    transport::{DisconnectReason, TransportEvent, TransportHandle},
};

const LOG_TARGET: &str = "client::protocol";

const COMMAND_BUFFER_SIZE: usize = 32;
const EVENT_BUFFER_SIZE: usize = 250;

/// Connection-level state as seen by the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Stopped,
    Connecting,
    Handshaking,
    Authenticating,
    Open,
}

#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    Connecting,
    Handshaking,
    Authenticating,
    Open,
    RpcResult { msg_id: u64 },
    RpcError { msg_id: u64, error_code: String },
    Ack { msg_id: u64 },
    Updates(UpdatesPayload),
    AuthFailed { message: String },
    PingTimeout,
    ConnectionError { code: ConnectionErrorCode, message: String },
    Disconnected { reason: DisconnectReason },
    Stopped,
}

enum ProtocolCommand {
    Start,
    Stop,
    SendRpc {
        method: Method,
        input: rpc_call::Input,
        reply: oneshot::Sender<Result<u64, ClientError>>,
    },
    CallRpc {
        method: Method,
        input: rpc_call::Input,
        opts: CallOptions,
        started: oneshot::Sender<Result<u64, ClientError>>,
        result: oneshot::Sender<Result<rpc_result::Result, ClientError>>,
    },
    SendPing {
        nonce: u64,
    },
    Reconnect {
        skip_delay: bool,
    },
    SetConstrained(bool),
}

/// Cloneable handle to a running [`ProtocolClient`] actor.
#[derive(Clone)]
pub struct ProtocolClientHandle {
    commands: mpsc::Sender<ProtocolCommand>,
    events: broadcast::Sender<Arc<ProtocolEvent>>,
}

impl ProtocolClientHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ProtocolEvent>> {
        self.events.subscribe()
    }

    pub async fn start(&self) -> Result<(), ClientError> {
        self.send_command(ProtocolCommand::Start).await
    }

    pub async fn stop(&self) -> Result<(), ClientError> {
        self.send_command(ProtocolCommand::Stop).await
    }

    /// Fire-and-forget; returns the assigned msg id. Fails with
    /// [`ClientError::NotConnected`] unless the state is open.
    pub async fn send_rpc(
        &self,
        method: Method,
        input: rpc_call::Input,
    ) -> Result<u64, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(ProtocolCommand::SendRpc {
            method,
            input,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| ClientError::Stopped)?
    }

    /// Call and await the result.
    pub async fn call_rpc(
        &self,
        method: Method,
        input: rpc_call::Input,
        opts: CallOptions,
    ) -> Result<rpc_result::Result, ClientError> {
        let (_msg_id, result_rx) = self.call_rpc_tracked(method, input, opts).await?;
        result_rx.await.map_err(|_| ClientError::Stopped)?
    }

    /// Call, returning the assigned msg id together with the result future. Used by the
    /// transaction queue, which needs the msg id for ack bookkeeping.
    pub async fn call_rpc_tracked(
        &self,
        method: Method,
        input: rpc_call::Input,
        opts: CallOptions,
    ) -> Result<(u64, oneshot::Receiver<Result<rpc_result::Result, ClientError>>), ClientError>
    {
        let (started_tx, started_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        self.send_command(ProtocolCommand::CallRpc {
            method,
            input,
            opts,
            started: started_tx,
            result: result_tx,
        })
        .await?;
        let msg_id = started_rx.await.map_err(|_| ClientError::Stopped)??;
        Ok((msg_id, result_rx))
    }

    /// Best-effort ping; send errors are swallowed and logged by the actor.
    pub async fn send_ping(&self, nonce: u64) -> Result<(), ClientError> {
        self.send_command(ProtocolCommand::SendPing { nonce }).await
    }

    pub async fn reconnect(&self, skip_delay: bool) -> Result<(), ClientError> {
        self.send_command(ProtocolCommand::Reconnect { skip_delay }).await
    }

    pub async fn set_constrained(&self, constrained: bool) -> Result<(), ClientError> {
        self.send_command(ProtocolCommand::SetConstrained(constrained)).await
    }

    async fn send_command(&self, command: ProtocolCommand) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Stopped)
    }
}

pub struct ProtocolClient {
    config: ClientConfig,
    transport: TransportHandle,
    transport_events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<ProtocolCommand>,
    event_tx: broadcast::Sender<Arc<ProtocolEvent>>,
    auth_token: watch::Receiver<Option<String>>,
    shutdown_signal: ShutdownSignal,

    state: ProtocolState,
    msg_ids: MsgIdGenerator,
    send_seq: u32,
    pending: PendingTable,
    ping_pong: PingPongService,
    auth_deadline: Option<Instant>,
    next_ping: Option<Instant>,
}

impl ProtocolClient {
    /// Spawn the protocol actor on top of an existing transport.
    pub fn spawn(
        config: ClientConfig,
        transport: TransportHandle,
        transport_events: mpsc::Receiver<TransportEvent>,
        auth_token: watch::Receiver<Option<String>>,
        shutdown_signal: ShutdownSignal,
    ) -> ProtocolClientHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let ping_pong = PingPongService::new(config.ping);
        let client = Self {
            config,
            transport,
            transport_events,
            commands: command_rx,
            event_tx: event_tx.clone(),
            auth_token,
            shutdown_signal,
            state: ProtocolState::Stopped,
            msg_ids: MsgIdGenerator::new(),
            send_seq: 0,
            pending: PendingTable::default(),
            ping_pong,
            auth_deadline: None,
            next_ping: None,
        };
        let handle = ProtocolClientHandle {
            commands: command_tx,
            events: event_tx,
        };
        tokio::spawn(client.run());
        handle
    }

    async fn run(mut self) {
        debug!(target: LOG_TARGET, "Protocol client started");
        let mut shutdown = self.shutdown_signal.clone();
        loop {
            let auth_deadline = self.auth_deadline;
            let rpc_deadline = self.pending.next_deadline();
            let ping_at = self.next_ping;
            tokio::select! {
                maybe_event = self.transport_events.recv() => match maybe_event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => break,
                },
                maybe_cmd = self.commands.recv() => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                _ = sleep_until(auth_deadline.unwrap_or_else(far_future)), if auth_deadline.is_some() => {
                    self.handle_auth_timeout().await;
                },
                _ = sleep_until(rpc_deadline.unwrap_or_else(far_future)), if rpc_deadline.is_some() => {
                    self.pending.expire_due(Instant::now());
                },
                _ = sleep_until(ping_at.unwrap_or_else(far_future)), if ping_at.is_some() => {
                    self.handle_ping_tick().await;
                },
                _ = shutdown.wait() => break,
            }
        }
        self.pending.fail_all(&ClientError::Stopped);
        debug!(target: LOG_TARGET, "Protocol client ended");
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connecting => {
                self.state = ProtocolState::Connecting;
                self.emit(ProtocolEvent::Connecting);
            },
            TransportEvent::Connected => {
                self.state = ProtocolState::Handshaking;
                self.emit(ProtocolEvent::Handshaking);
                self.send_connection_init().await;
            },
            TransportEvent::Message(msg) => {
                if let Some(body) = msg.body {
                    self.handle_server_body(body).await;
                }
            },
            TransportEvent::Stopping => {
                self.state = ProtocolState::Stopped;
                self.auth_deadline = None;
                self.next_ping = None;
                self.ping_pong.reset();
                self.pending.fail_all(&ClientError::Stopped);
                self.emit(ProtocolEvent::Stopped);
            },
            TransportEvent::Disconnected(reason) => {
                if self.state != ProtocolState::Stopped {
                    self.state = ProtocolState::Connecting;
                }
                self.auth_deadline = None;
                self.next_ping = None;
                self.ping_pong.reset();
                self.pending.handle_disconnect();
                self.emit(ProtocolEvent::Disconnected { reason });
            },
        }
    }

    async fn handle_server_body(&mut self, body: server_message::Body) {
        use server_message::Body;
        match body {
            Body::ConnectionOpen(_) => {
                debug!(target: LOG_TARGET, "Connection open");
                self.state = ProtocolState::Open;
                self.auth_deadline = None;
                self.ping_pong.reset();
                self.next_ping = Some(Instant::now() + self.config.ping.interval);
                self.emit(ProtocolEvent::Open);
                self.flush_unsent().await;
            },
            Body::RpcResult(result) => {
                let msg_id = result.req_msg_id;
                match (self.pending.complete(msg_id), result.result) {
                    (Some(entry), Some(payload)) => {
                        let _result = entry.result_tx.send(Ok(payload));
                        self.emit(ProtocolEvent::RpcResult { msg_id });
                    },
                    (Some(entry), None) => {
                        let _result = entry.result_tx.send(Err(ClientError::Codec(
                            "rpc result carried no payload".to_string(),
                        )));
                    },
                    (None, _) => {
                        // Timed out or never ours; late replies are dropped
                        debug!(target: LOG_TARGET, "Dropping reply for unknown msg {}", msg_id);
                    },
                }
            },
            Body::RpcError(err) => {
                let msg_id = err.req_msg_id;
                if let Some(entry) = self.pending.complete(msg_id) {
                    let _result = entry.result_tx.send(Err(ClientError::Rpc {
                        error_code: err.error_code.clone(),
                        code: err.code,
                        message: err.message,
                    }));
                    self.emit(ProtocolEvent::RpcError {
                        msg_id,
                        error_code: err.error_code,
                    });
                } else {
                    debug!(target: LOG_TARGET, "Dropping error for unknown msg {}", msg_id);
                }
            },
            Body::Ack(Ack { msg_id }) => {
                self.pending.mark_acked(msg_id);
                self.emit(ProtocolEvent::Ack { msg_id });
            },
            Body::Updates(payload) => {
                self.emit(ProtocolEvent::Updates(payload));
            },
            Body::Pong(pong) => {
                self.ping_pong.record_pong(pong.nonce);
            },
            Body::ConnectionError(err) => {
                let code = ConnectionErrorCode::try_from(err.code)
                    .unwrap_or(ConnectionErrorCode::Unspecified);
                warn!(target: LOG_TARGET, "Connection error ({:?}): {}", code, err.message);
                if code == ConnectionErrorCode::AuthFailed {
                    self.emit(ProtocolEvent::AuthFailed { message: err.message });
                } else {
                    self.emit(ProtocolEvent::ConnectionError {
                        code,
                        message: err.message,
                    });
                    let _result = self.transport.reconnect(false).await;
                }
            },
        }
    }

    async fn handle_command(&mut self, command: ProtocolCommand) {
        match command {
            ProtocolCommand::Start => {
                let _result = self.transport.start().await;
            },
            ProtocolCommand::Stop => {
                self.pending.fail_all(&ClientError::Stopped);
                let _result = self.transport.stop().await;
            },
            ProtocolCommand::SendRpc { method, input, reply } => {
                if self.state != ProtocolState::Open {
                    let _result = reply.send(Err(ClientError::NotConnected));
                    return;
                }
                let msg_id = self.next_msg_id();
                let frame = self.rpc_frame(msg_id, method, input.clone());
                match self.transport.send(frame).await {
                    Ok(()) => {
                        let _result = reply.send(Ok(msg_id));
                    },
                    Err(err) => {
                        let _result = reply.send(Err(err));
                    },
                }
            },
            ProtocolCommand::CallRpc {
                method,
                input,
                opts,
                started,
                result,
            } => {
                self.handle_call_rpc(method, input, opts, started, result).await;
            },
            ProtocolCommand::SendPing { nonce } => {
                self.write_ping(nonce).await;
            },
            ProtocolCommand::Reconnect { skip_delay } => {
                // Queries already in the table become resumable in handle_disconnect
                let _result = self.transport.reconnect(skip_delay).await;
            },
            ProtocolCommand::SetConstrained(constrained) => {
                self.ping_pong.set_constrained(constrained);
            },
        }
    }

    async fn handle_call_rpc(
        &mut self,
        method: Method,
        input: rpc_call::Input,
        opts: CallOptions,
        started: oneshot::Sender<Result<u64, ClientError>>,
        result: oneshot::Sender<Result<rpc_result::Result, ClientError>>,
    ) {
        if self.state != ProtocolState::Open && !opts.may_queue_before_open {
            let _result = started.send(Err(ClientError::NotConnected));
            return;
        }
        let msg_id = self.next_msg_id();
        let deadline = opts.timeout.map(|t| Instant::now() + t);
        self.pending.insert(msg_id, PendingRpc {
            method,
            input: input.clone(),
            result_tx: result,
            deadline,
            owner: opts.owner,
            sent: false,
            acked: false,
        });
        let _result = started.send(Ok(msg_id));

        if self.state == ProtocolState::Open {
            let frame = self.rpc_frame(msg_id, method, input);
            match self.transport.send(frame).await {
                Ok(()) => self.pending.mark_sent(msg_id),
                Err(err) => {
                    debug!(
                        target: LOG_TARGET,
                        "Send of rpc {} failed, leaving it parked: {}", msg_id, err
                    );
                },
            }
        }
    }

    async fn handle_auth_timeout(&mut self) {
        warn!(
            target: LOG_TARGET,
            "Server did not complete the handshake within {:?}", self.config.auth_timeout
        );
        self.auth_deadline = None;
        let _result = self.transport.reconnect(false).await;
    }

    async fn handle_ping_tick(&mut self) {
        self.next_ping = Some(Instant::now() + self.config.ping.interval);
        let ping_action = self.ping_pong.tick(Instant::now(), &mut rand::thread_rng());
        match ping_action {
            PingAction::Send(nonce) => {
                self.write_ping(nonce).await;
            },
            PingAction::TimedOut => {
                warn!(target: LOG_TARGET, "Ping timed out, requesting reconnect");
                self.ping_pong.reset();
                self.next_ping = None;
                self.emit(ProtocolEvent::PingTimeout);
                let _result = self.transport.reconnect(true).await;
            },
        }
    }

    async fn send_connection_init(&mut self) {
        let token = match self.auth_token.borrow().clone() {
            Some(token) => token,
            None => {
                warn!(target: LOG_TARGET, "No auth token available for handshake");
                self.emit(ProtocolEvent::AuthFailed {
                    message: "no auth token available".to_string(),
                });
                return;
            },
        };
        self.send_seq = 0;
        let msg_id = self.next_msg_id();
        let init = ClientMessage {
            id: msg_id,
            seq: self.next_seq(),
            body: Some(client_message::Body::ConnectionInit(ConnectionInit {
                token,
                layer: PROTOCOL_LAYER,
                build: self.config.build.clone(),
                device: self.config.device.clone(),
            })),
        };
        match self.transport.send(init).await {
            Ok(()) => {
                self.state = ProtocolState::Authenticating;
                self.auth_deadline = Some(Instant::now() + self.config.auth_timeout);
                self.emit(ProtocolEvent::Authenticating);
            },
            Err(err) => {
                warn!(target: LOG_TARGET, "Failed to send handshake: {}", err);
            },
        }
    }

    /// Send every parked call in emission order after the connection opens.
    async fn flush_unsent(&mut self) {
        for msg_id in self.pending.unsent_ids() {
            let frame = match self.pending_frame(msg_id) {
                Some(frame) => frame,
                None => continue,
            };
            match self.transport.send(frame).await {
                Ok(()) => self.pending.mark_sent(msg_id),
                Err(err) => {
                    debug!(target: LOG_TARGET, "Resend of rpc {} failed: {}", msg_id, err);
                    break;
                },
            }
        }
    }

    fn pending_frame(&mut self, msg_id: u64) -> Option<ClientMessage> {
        let (method, input) = {
            let entry = self.pending.get(msg_id)?;
            (entry.method, entry.input.clone())
        };
        Some(self.rpc_frame(msg_id, method, input))
    }

    async fn write_ping(&mut self, nonce: u64) {
        let msg = ClientMessage {
            id: self.next_msg_id(),
            seq: self.next_seq(),
            body: Some(client_message::Body::Ping(Ping { nonce })),
        };
        if let Err(err) = self.transport.send(msg).await {
            debug!(target: LOG_TARGET, "Ping send failed: {}", err);
        }
    }

    fn rpc_frame(&mut self, msg_id: u64, method: Method, input: rpc_call::Input) -> ClientMessage {
        ClientMessage {
            id: msg_id,
            seq: self.next_seq(),
            body: Some(client_message::Body::RpcCall(banter_proto::RpcCall {
                method: method as i32,
                input: Some(input),
            })),
        }
    }

    fn next_msg_id(&mut self) -> u64 {
        self.msg_ids.next()
    }

    fn next_seq(&mut self) -> u32 {
        self.send_seq = self.send_seq.wrapping_add(1);
        self.send_seq
    }

    fn emit(&self, event: ProtocolEvent) {
        // An error just means there are no subscribers right now
        let _result = self.event_tx.send(Arc::new(event));
    }
}

fn far_future() -> Instant {
    Instant::now() + std::time::Duration::from_secs(86400 * 365)
}
