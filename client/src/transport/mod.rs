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

//! WebSocket transport.
//!
//! Owns a single socket at a time, decodes inbound binary frames into [`ServerMessage`]s and
//! performs exponential-jittered reconnection. All interaction happens through the
//! [`TransportHandle`]; lifecycle changes are reported on the single-consumer event channel
//! returned by [`Transport::spawn`].

use std::time::Duration;

use banter_proto::{decode_server_message, encode_client_message, ClientMessage, ServerMessage};
use banter_shutdown::ShutdownSignal;
use futures::{SinkExt, StreamExt};
use log::*;
use rand::Rng;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::{sleep, timeout, Instant},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message as WsMessage,
    MaybeTlsStream,
    WebSocketStream,
};

use crate::{config::ClientConfig, error::ClientError};

const LOG_TARGET: &str = "client::transport";

/// Size of the outbound event buffer. The consumer (the protocol client) is responsible for
/// keeping up; the transport applies backpressure by awaiting the send.
const EVENT_BUFFER_SIZE: usize = 64;
const COMMAND_BUFFER_SIZE: usize = 32;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the socket or the read side errored.
    Lost(String),
    /// A caller asked for a reconnect.
    ReconnectRequested,
    /// `stop()` was called.
    Stopped,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connecting,
    Connected,
    Message(ServerMessage),
    Stopping,
    Disconnected(DisconnectReason),
}

pub(crate) enum TransportCommand {
    Start,
    Stop,
    Send(ClientMessage, oneshot::Sender<Result<(), ClientError>>),
    Reconnect { skip_delay: bool },
}

/// Cloneable handle to a running [`Transport`] actor.
#[derive(Clone)]
pub struct TransportHandle {
    commands: mpsc::Sender<TransportCommand>,
}

impl TransportHandle {
    pub(crate) fn new(commands: mpsc::Sender<TransportCommand>) -> Self {
        Self { commands }
    }

    /// Begin connecting. Idempotent when already started.
    pub async fn start(&self) -> Result<(), ClientError> {
        self.commands
            .send(TransportCommand::Start)
            .await
            .map_err(|_| ClientError::Stopped)
    }

    /// Terminate the current socket and inhibit reconnection. Idempotent.
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.commands
            .send(TransportCommand::Stop)
            .await
            .map_err(|_| ClientError::Stopped)
    }

    /// Serialize `msg` and write one binary frame. Fails with [`ClientError::NotConnected`] when
    /// no socket is open.
    pub async fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(TransportCommand::Send(msg, reply_tx))
            .await
            .map_err(|_| ClientError::Stopped)?;
        reply_rx.await.map_err(|_| ClientError::Stopped)?
    }

    /// Cancel the current socket and schedule a new connect attempt.
    pub async fn reconnect(&self, skip_delay: bool) -> Result<(), ClientError> {
        self.commands
            .send(TransportCommand::Reconnect { skip_delay })
            .await
            .map_err(|_| ClientError::Stopped)
    }
}

/// Outcome of one connect-and-read session, directing the outer reconnect loop.
enum SessionExit {
    Lost(String),
    Reconnect { skip_delay: bool },
    Stop,
    Shutdown,
}

pub struct Transport {
    config: ClientConfig,
    commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
    shutdown_signal: ShutdownSignal,
    attempts: u32,
}

impl Transport {
    /// Spawn the transport actor. Returns the command handle and the single-consumer event
    /// stream.
    pub fn spawn(
        config: ClientConfig,
        shutdown_signal: ShutdownSignal,
    ) -> (TransportHandle, mpsc::Receiver<TransportEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let transport = Self {
            config,
            commands: command_rx,
            events: event_tx,
            shutdown_signal,
            attempts: 0,
        };
        tokio::spawn(transport.run());
        (TransportHandle::new(command_tx), event_rx)
    }

    async fn run(mut self) {
        debug!(target: LOG_TARGET, "Transport started for '{}'", self.config.ws_url);
        loop {
            // Idle until a Start arrives
            let mut shutdown = self.shutdown_signal.clone();
            tokio::select! {
                maybe_cmd = self.commands.recv() => match maybe_cmd {
                    Some(TransportCommand::Start) => {
                        if self.run_connected().await {
                            break;
                        }
                    },
                    Some(TransportCommand::Stop) => {},
                    Some(TransportCommand::Reconnect { .. }) => {},
                    Some(TransportCommand::Send(_, reply)) => {
                        let _result = reply.send(Err(ClientError::NotConnected));
                    },
                    None => break,
                },
                _ = shutdown.wait() => break,
            }
        }
        debug!(target: LOG_TARGET, "Transport ended");
    }

    /// The started state: connect, read until the session ends, repeat with backoff. Returns true
    /// when the whole actor should shut down.
    async fn run_connected(&mut self) -> bool {
        self.attempts = 0;
        let mut skip_delay = true;
        loop {
            match self.connect_once(skip_delay).await {
                Ok(Some(ws)) => {
                    self.attempts = 0;
                    match self.drive_session(ws).await {
                        SessionExit::Lost(reason) => {
                            self.attempts += 1;
                            self.emit(TransportEvent::Disconnected(DisconnectReason::Lost(reason)))
                                .await;
                            skip_delay = false;
                        },
                        SessionExit::Reconnect { skip_delay: skip } => {
                            self.emit(TransportEvent::Disconnected(DisconnectReason::ReconnectRequested))
                                .await;
                            skip_delay = skip;
                        },
                        SessionExit::Stop => {
                            self.emit(TransportEvent::Stopping).await;
                            self.emit(TransportEvent::Disconnected(DisconnectReason::Stopped)).await;
                            return false;
                        },
                        SessionExit::Shutdown => return true,
                    }
                },
                Ok(None) => {
                    // Connect attempt failed; try again with backoff
                    self.attempts += 1;
                    skip_delay = false;
                },
                Err(SessionExit::Stop) => {
                    self.emit(TransportEvent::Stopping).await;
                    self.emit(TransportEvent::Disconnected(DisconnectReason::Stopped)).await;
                    return false;
                },
                Err(SessionExit::Reconnect { skip_delay: skip }) => {
                    skip_delay = skip;
                },
                Err(SessionExit::Shutdown) => return true,
                Err(SessionExit::Lost(_)) => {
                    self.attempts += 1;
                    skip_delay = false;
                },
            }
        }
    }

    /// Wait out the backoff delay (unless skipped) and attempt a single connect. `Ok(None)` means
    /// the attempt failed and the caller should retry.
    async fn connect_once(&mut self, skip_delay: bool) -> Result<Option<WsStream>, SessionExit> {
        if !skip_delay {
            let delay = backoff_delay(self.attempts, &mut rand::thread_rng());
            debug!(
                target: LOG_TARGET,
                "Waiting {:.1}s before connect attempt {}",
                delay.as_secs_f64(),
                self.attempts
            );
            let sleep_until = Instant::now() + delay;
            let mut shutdown = self.shutdown_signal.clone();
            loop {
                tokio::select! {
                    _ = sleep(sleep_until.saturating_duration_since(Instant::now())) => break,
                    maybe_cmd = self.commands.recv() => match maybe_cmd {
                        Some(TransportCommand::Stop) => return Err(SessionExit::Stop),
                        Some(TransportCommand::Reconnect { skip_delay: true }) => break,
                        Some(TransportCommand::Reconnect { skip_delay: false }) => {},
                        Some(TransportCommand::Start) => {},
                        Some(TransportCommand::Send(_, reply)) => {
                            let _result = reply.send(Err(ClientError::NotConnected));
                        },
                        None => return Err(SessionExit::Shutdown),
                    },
                    _ = shutdown.wait() => return Err(SessionExit::Shutdown),
                }
            }
        }

        self.emit(TransportEvent::Connecting).await;
        let url = self.config.ws_url.clone();
        let connect = timeout(self.config.connect_timeout, connect_async(url));
        let mut shutdown = self.shutdown_signal.clone();
        tokio::select! {
            result = connect => match result {
                Ok(Ok((ws, _response))) => {
                    info!(target: LOG_TARGET, "Connected to '{}'", self.config.ws_url);
                    self.emit(TransportEvent::Connected).await;
                    Ok(Some(ws))
                },
                Ok(Err(err)) => {
                    warn!(target: LOG_TARGET, "Connect attempt failed: {}", err);
                    self.emit(TransportEvent::Disconnected(DisconnectReason::Lost(err.to_string())))
                        .await;
                    Ok(None)
                },
                Err(_elapsed) => {
                    warn!(target: LOG_TARGET, "Connect attempt timed out");
                    self.emit(TransportEvent::Disconnected(DisconnectReason::Lost(
                        "connect timeout".to_string(),
                    )))
                    .await;
                    Ok(None)
                },
            },
            maybe_cmd = self.commands.recv() => match maybe_cmd {
                Some(TransportCommand::Stop) => Err(SessionExit::Stop),
                Some(TransportCommand::Reconnect { skip_delay }) => Err(SessionExit::Reconnect { skip_delay }),
                Some(TransportCommand::Start) => Err(SessionExit::Reconnect { skip_delay: true }),
                Some(TransportCommand::Send(_, reply)) => {
                    let _result = reply.send(Err(ClientError::NotConnected));
                    Err(SessionExit::Reconnect { skip_delay: true })
                },
                None => Err(SessionExit::Shutdown),
            },
            _ = shutdown.wait() => Err(SessionExit::Shutdown),
        }
    }

    /// Read frames and service commands until the session ends one way or another.
    async fn drive_session(&mut self, ws: WsStream) -> SessionExit {
        let (mut sink, mut stream) = ws.split();
        let mut shutdown = self.shutdown_signal.clone();
        loop {
            tokio::select! {
                maybe_cmd = self.commands.recv() => match maybe_cmd {
                    Some(TransportCommand::Send(msg, reply)) => {
                        let frame = encode_client_message(&msg);
                        let result = sink
                            .send(WsMessage::Binary(frame))
                            .await
                            .map_err(|e| ClientError::Transport(e.to_string()));
                        let failed = result.is_err();
                        let _result = reply.send(result);
                        if failed {
                            return SessionExit::Lost("write failed".to_string());
                        }
                    },
                    Some(TransportCommand::Stop) => {
                        let _result = sink.send(WsMessage::Close(None)).await;
                        return SessionExit::Stop;
                    },
                    Some(TransportCommand::Reconnect { skip_delay }) => {
                        let _result = sink.send(WsMessage::Close(None)).await;
                        return SessionExit::Reconnect { skip_delay };
                    },
                    Some(TransportCommand::Start) => {},
                    None => return SessionExit::Shutdown,
                },
                maybe_frame = stream.next() => match maybe_frame {
                    Some(Ok(WsMessage::Binary(frame))) => {
                        match decode_server_message(&frame) {
                            Ok(msg) => self.emit(TransportEvent::Message(msg)).await,
                            Err(err) => {
                                // Malformed frames never take the transport down
                                warn!(target: LOG_TARGET, "Dropping malformed frame: {}", err);
                            },
                        }
                    },
                    Some(Ok(WsMessage::Text(_))) => {
                        warn!(target: LOG_TARGET, "Dropping unexpected text frame");
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!(target: LOG_TARGET, "Server closed the socket: {:?}", frame);
                        return SessionExit::Lost("closed by server".to_string());
                    },
                    Some(Ok(_)) => {},
                    Some(Err(err)) => {
                        return SessionExit::Lost(err.to_string());
                    },
                    None => {
                        return SessionExit::Lost("stream ended".to_string());
                    },
                },
                _ = shutdown.wait() => {
                    let _result = sink.send(WsMessage::Close(None)).await;
                    return SessionExit::Shutdown;
                },
            }
        }
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!(target: LOG_TARGET, "Event consumer dropped");
        }
    }
}

/// `min(8, 0.2 + attempt^1.5 * 0.4)` seconds, with uniform jitter in `[0, 4)` from the eighth
/// attempt onwards.
fn backoff_delay<R: Rng>(attempt: u32, rng: &mut R) -> Duration {
    let base = (0.2 + f64::from(attempt).powf(1.5) * 0.4).min(8.0);
    let jitter = if attempt >= 8 { rng.gen_range(0.0..4.0) } else { 0.0 };
    Duration::from_secs_f64(base + jitter)
}

#[cfg(test)]
mod test {
    use banter_proto::{client_message, encode_server_message, server_message, ConnectionOpen, Ping};
    use banter_shutdown::Shutdown;
    use rand::rngs::mock::StepRng;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;

    fn no_jitter() -> StepRng {
        StepRng::new(0, 0)
    }

    fn open_frame() -> Vec<u8> {
        encode_server_message(&ServerMessage {
            id: 1,
            body: Some(server_message::Body::ConnectionOpen(ConnectionOpen {})),
        })
    }

    fn ping_frame(nonce: u64) -> ClientMessage {
        ClientMessage {
            id: 1,
            seq: 1,
            body: Some(client_message::Body::Ping(Ping { nonce })),
        }
    }

    async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for a transport event")
            .expect("event channel closed")
    }

    async fn spawn_transport(addr: std::net::SocketAddr) -> (TransportHandle, mpsc::Receiver<TransportEvent>, Shutdown) {
        let config = ClientConfig::new(format!("ws://{}", addr));
        let shutdown = Shutdown::new();
        let (handle, events) = Transport::spawn(config, shutdown.to_signal());
        (handle, events, shutdown)
    }

    #[tokio::test]
    async fn connects_sends_and_receives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(WsMessage::Binary(open_frame())).await.unwrap();
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Binary(frame) => {
                    let msg = banter_proto::decode_client_message(&frame).unwrap();
                    assert!(matches!(msg.body, Some(client_message::Body::Ping(_))));
                },
                other => panic!("expected a binary frame, got {:?}", other),
            }
        });

        let (handle, mut events, _shutdown) = spawn_transport(addr).await;
        handle.start().await.unwrap();
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connecting));
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected));
        assert!(matches!(next_event(&mut events).await, TransportEvent::Message(_)));

        handle.send(ping_frame(7)).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_server_drop_without_double_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            // First connection is dropped immediately
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            drop(ws);
            // Second connection stays up
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(WsMessage::Binary(open_frame())).await.unwrap();
            ws
        });

        let (handle, mut events, _shutdown) = spawn_transport(addr).await;
        handle.start().await.unwrap();

        // Connecting always precedes Connected, and two Connected events are always separated
        // by a Disconnected
        let mut log = Vec::new();
        let mut connected_seen = 0;
        while connected_seen < 2 {
            let event = next_event(&mut events).await;
            match &event {
                TransportEvent::Connected => connected_seen += 1,
                TransportEvent::Message(_) => continue,
                _ => {},
            }
            log.push(std::mem::discriminant(&event));
        }
        let connecting = std::mem::discriminant(&TransportEvent::Connecting);
        let connected = std::mem::discriminant(&TransportEvent::Connected);
        let disconnected =
            std::mem::discriminant(&TransportEvent::Disconnected(DisconnectReason::Stopped));
        let mut last_connected = None;
        for (i, d) in log.iter().enumerate() {
            if *d == connected {
                assert!(i > 0 && log[i - 1] == connecting, "Connecting must precede Connected");
                if let Some(prev) = last_connected {
                    assert!(
                        log[prev..i].contains(&disconnected),
                        "two Connected events without an intervening Disconnected"
                    );
                }
                last_connected = Some(i);
            }
        }
        let _ws = server.await.unwrap();
    }

    #[tokio::test]
    async fn stop_emits_stopping_then_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // Hold the socket open until the client closes it
            while let Some(Ok(msg)) = ws.next().await {
                if matches!(msg, WsMessage::Close(_)) {
                    break;
                }
            }
        });

        let (handle, mut events, _shutdown) = spawn_transport(addr).await;
        handle.start().await.unwrap();
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connecting));
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected));

        handle.stop().await.unwrap();
        assert!(matches!(next_event(&mut events).await, TransportEvent::Stopping));
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Disconnected(DisconnectReason::Stopped)
        ));

        // Sends are refused once stopped
        let result = handle.send(ping_frame(7)).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn text_frames_are_dropped_without_killing_the_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text("not a frame".to_string())).await.unwrap();
            ws.send(WsMessage::Binary(vec![0xff, 0xff, 0xff])).await.unwrap();
            ws.send(WsMessage::Binary(open_frame())).await.unwrap();
            ws
        });

        let (handle, mut events, _shutdown) = spawn_transport(addr).await;
        handle.start().await.unwrap();
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connecting));
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected));
        // The text frame and the malformed binary frame never surface; the valid one does
        match next_event(&mut events).await {
            TransportEvent::Message(msg) => {
                assert!(matches!(
                    msg.body,
                    Some(banter_proto::server_message::Body::ConnectionOpen(_))
                ));
            },
            other => panic!("expected the decoded message, got {:?}", other),
        }
        let _ws = server.await.unwrap();
    }

    #[test]
    fn backoff_curve_is_bounded() {
        let mut rng = no_jitter();
        let d0 = backoff_delay(0, &mut rng).as_secs_f64();
        assert!((d0 - 0.2).abs() < 1e-9, "got {}", d0);
        let d1 = backoff_delay(1, &mut rng).as_secs_f64();
        assert!((d1 - 0.6).abs() < 1e-9, "got {}", d1);
        let d4 = backoff_delay(4, &mut rng).as_secs_f64();
        assert!((d4 - 3.4).abs() < 1e-9, "got {}", d4);
        assert_eq!(backoff_delay(100, &mut rng), Duration::from_secs_f64(8.0));
    }

    #[test]
    fn backoff_jitter_applies_from_eighth_attempt() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let d7 = backoff_delay(7, &mut rng).as_secs_f64();
            assert!((d7 - (0.2 + 7f64.powf(1.5) * 0.4).min(8.0)).abs() < 1e-9);
            let d8 = backoff_delay(8, &mut rng).as_secs_f64();
            assert!((8.0..12.0).contains(&d8), "got {}", d8);
        }
    }
}
