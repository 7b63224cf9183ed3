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

//! The WebSocket listener and the per-connection task: origin check, `ConnectionInit` handshake,
//! frame decode, ack + dispatch, and the outbound push queue.

use std::{net::SocketAddr, sync::Arc};

use banter_proto::{
    client_message,
    decode_client_message,
    encode_server_message,
    server_message,
    Ack,
    ClientMessage,
    ConnectionError,
    ConnectionErrorCode,
    ConnectionOpen,
    Method,
    Pong,
    RpcResult,
    ServerMessage,
};
use banter_shutdown::ShutdownSignal;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use log::*;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        protocol::Message as WsMessage,
    },
    WebSocketStream,
};

use crate::{context::ServerContext, error::ServerError, rpc};

const LOG_TARGET: &str = "server::ws";

const OUTBOUND_BUFFER_SIZE: usize = 256;

/// Bind the configured listen address. Split from [`serve`] so tests can bind port 0 and read
/// the assigned address.
pub async fn bind(ctx: &ServerContext) -> Result<(TcpListener, SocketAddr), ServerError> {
    let listener = TcpListener::bind(ctx.config.bind_addr).await?;
    let addr = listener.local_addr()?;
    info!(target: LOG_TARGET, "Listening on ws://{}", addr);
    Ok((listener, addr))
}

/// Accept connections until shutdown, spawning one task per connection.
pub async fn serve(
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    shutdown_signal: ShutdownSignal,
) {
    let mut shutdown = shutdown_signal.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(
                        ctx.clone(),
                        stream,
                        peer,
                        shutdown_signal.clone(),
                    ));
                },
                Err(e) => {
                    warn!(target: LOG_TARGET, "Accept failed: {}", e);
                },
            },
            _ = shutdown.wait() => break,
        }
    }
    info!(target: LOG_TARGET, "Listener draining sessions");
}

async fn handle_connection(
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown_signal: ShutdownSignal,
) {
    let config = ctx.config.clone();
    let origin_check = move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let origin = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        if config.origin_allowed(origin.as_deref()) {
            Ok(response)
        } else {
            warn!(target: LOG_TARGET, "Rejected origin {:?} from {}", origin, peer);
            let mut response = ErrorResponse::new(None);
            *response.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::FORBIDDEN;
            Err(response)
        }
    };

    let ws = match accept_hdr_async(stream, origin_check).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(target: LOG_TARGET, "Handshake with {} failed: {}", peer, e);
            return;
        },
    };

    if let Err(e) = drive_session(ctx, ws, peer, shutdown_signal).await {
        debug!(target: LOG_TARGET, "Session with {} ended: {}", peer, e);
    }
}

async fn drive_session(
    ctx: Arc<ServerContext>,
    ws: WebSocketStream<TcpStream>,
    peer: SocketAddr,
    shutdown_signal: ShutdownSignal,
) -> Result<(), ServerError> {
    let (mut sink, mut stream) = ws.split();

    // The first frame must be a valid ConnectionInit within the handshake timeout
    let init = match timeout(ctx.config.handshake_timeout, stream.next()).await {
        Ok(Some(Ok(WsMessage::Binary(frame)))) => match decode_client_message(&frame)? {
            ClientMessage {
                body: Some(client_message::Body::ConnectionInit(init)),
                ..
            } => init,
            _ => {
                send_connection_error(
                    &ctx,
                    &mut sink,
                    ConnectionErrorCode::ProtocolViolation,
                    "expected ConnectionInit",
                )
                .await;
                return Err(ServerError::ProtocolViolation(
                    "first frame was not ConnectionInit".to_string(),
                ));
            },
        },
        Ok(Some(Ok(_))) => {
            return Err(ServerError::ProtocolViolation("non-binary first frame".to_string()));
        },
        Ok(Some(Err(e))) => return Err(ServerError::Io(std::io::Error::other(e))),
        Ok(None) => return Ok(()),
        Err(_elapsed) => {
            debug!(target: LOG_TARGET, "Handshake with {} timed out", peer);
            return Ok(());
        },
    };

    let user = match ctx.db.find_user_by_token(&init.token)? {
        Some(user) => user,
        None => {
            info!(target: LOG_TARGET, "Rejected credentials from {}", peer);
            send_connection_error(
                &ctx,
                &mut sink,
                ConnectionErrorCode::AuthFailed,
                "unknown token",
            )
            .await;
            let _result = sink.send(WsMessage::Close(None)).await;
            return Ok(());
        },
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER_SIZE);
    let session_id = match ctx.registry.add_session(user.id, outbound_tx).await {
        Some(id) => id,
        None => return Ok(()),
    };
    ctx.db.set_user_online(user.id, true, Utc::now().timestamp())?;
    info!(
        target: LOG_TARGET,
        "Session {} open for user {} ({}, layer {})", session_id, user.id, peer, init.layer
    );

    send_message(
        &mut sink,
        ServerMessage {
            id: ctx.msg_ids.next(),
            body: Some(server_message::Body::ConnectionOpen(ConnectionOpen {})),
        },
    )
    .await?;

    let mut shutdown = shutdown_signal.clone();
    let result = loop {
        tokio::select! {
            maybe_push = outbound_rx.recv() => match maybe_push {
                Some(message) => {
                    if let Err(e) = send_message(&mut sink, message).await {
                        break Err(e);
                    }
                },
                None => break Ok(()),
            },
            maybe_frame = stream.next() => match maybe_frame {
                Some(Ok(WsMessage::Binary(frame))) => {
                    match decode_client_message(&frame) {
                        Ok(msg) => {
                            if let Err(e) = handle_client_message(&ctx, user.id, msg, &mut sink).await {
                                break Err(e);
                            }
                        },
                        Err(e) => {
                            // Malformed frames are logged and dropped
                            warn!(target: LOG_TARGET, "Dropping malformed frame from {}: {}", peer, e);
                        },
                    }
                },
                Some(Ok(WsMessage::Text(_))) => {
                    warn!(target: LOG_TARGET, "Dropping text frame from {}", peer);
                },
                Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {},
                Some(Err(e)) => break Err(ServerError::Io(std::io::Error::other(e))),
            },
            _ = shutdown.wait() => {
                send_connection_error(
                    &ctx,
                    &mut sink,
                    ConnectionErrorCode::ServerShutdown,
                    "server shutting down",
                )
                .await;
                let _result = sink.send(WsMessage::Close(None)).await;
                break Ok(());
            },
        }
    };

    ctx.registry.remove_session(session_id).await;
    ctx.db.set_user_online(user.id, false, Utc::now().timestamp())?;
    info!(target: LOG_TARGET, "Session {} for user {} closed", session_id, user.id);
    result
}

async fn handle_client_message(
    ctx: &ServerContext,
    user_id: i64,
    msg: ClientMessage,
    sink: &mut (impl SinkExt<WsMessage> + Unpin),
) -> Result<(), ServerError> {
    match msg.body {
        Some(client_message::Body::RpcCall(call)) => {
            let method = Method::try_from(call.method).unwrap_or(Method::Unspecified);
            // Mutations are acked as soon as they are decoded, before any work happens
            if method.is_mutation() {
                send_message(sink, ServerMessage {
                    id: ctx.msg_ids.next(),
                    body: Some(server_message::Body::Ack(Ack { msg_id: msg.id })),
                })
                .await?;
            }
            match rpc::dispatch(ctx, user_id, call) {
                Ok(outcome) => {
                    send_message(sink, ServerMessage {
                        id: ctx.msg_ids.next(),
                        body: Some(server_message::Body::RpcResult(RpcResult {
                            req_msg_id: msg.id,
                            result: Some(outcome.result),
                        })),
                    })
                    .await?;
                    ctx.broker.broadcast_all(outcome.pushes).await;
                },
                Err(e) => {
                    warn!(target: LOG_TARGET, "Rpc from user {} failed: {}", user_id, e);
                    send_message(sink, ServerMessage {
                        id: ctx.msg_ids.next(),
                        body: Some(server_message::Body::RpcError(e.to_rpc_error(msg.id))),
                    })
                    .await?;
                },
            }
        },
        Some(client_message::Body::Ping(ping)) => {
            send_message(sink, ServerMessage {
                id: ctx.msg_ids.next(),
                body: Some(server_message::Body::Pong(Pong { nonce: ping.nonce })),
            })
            .await?;
        },
        Some(client_message::Body::Ack(_)) => {},
        Some(client_message::Body::ConnectionInit(_)) => {
            send_message(sink, ServerMessage {
                id: ctx.msg_ids.next(),
                body: Some(server_message::Body::ConnectionError(ConnectionError {
                    code: ConnectionErrorCode::ProtocolViolation as i32,
                    message: "duplicate ConnectionInit".to_string(),
                })),
            })
            .await?;
            return Err(ServerError::ProtocolViolation(
                "duplicate ConnectionInit".to_string(),
            ));
        },
        None => {},
    }
    Ok(())
}

async fn send_message(
    sink: &mut (impl SinkExt<WsMessage> + Unpin),
    message: ServerMessage,
) -> Result<(), ServerError> {
    sink.send(WsMessage::Binary(encode_server_message(&message)))
        .await
        .map_err(|_| ServerError::Io(std::io::Error::other("websocket write failed")))
}

async fn send_connection_error(
    ctx: &ServerContext,
    sink: &mut (impl SinkExt<WsMessage> + Unpin),
    code: ConnectionErrorCode,
    message: &str,
) {
    let _result = send_message(sink, ServerMessage {
        id: ctx.msg_ids.next(),
        body: Some(server_message::Body::ConnectionError(ConnectionError {
            code: code as i32,
            message: message.to_string(),
        })),
    })
    .await;
}
