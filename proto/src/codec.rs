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

use prost::Message as _;

use crate::messages::{ClientMessage, ServerMessage};

/// Upper bound on a single wire frame. Anything larger is rejected before decoding.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Frame of {0} bytes exceeds the maximum of {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),
    #[error("Received a text frame where only binary frames are valid")]
    TextFrame,
    #[error("Frame body was missing")]
    MissingBody,
    #[error("Failed to decode frame: {0}")]
    Decode(#[from] prost::DecodeError),
}

pub fn decode_client_message(frame: &[u8]) -> Result<ClientMessage, CodecError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(frame.len()));
    }
    let msg = ClientMessage::decode(frame)?;
    if msg.body.is_none() {
        return Err(CodecError::MissingBody);
    }
    Ok(msg)
}

pub fn decode_server_message(frame: &[u8]) -> Result<ServerMessage, CodecError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(frame.len()));
    }
    let msg = ServerMessage::decode(frame)?;
    if msg.body.is_none() {
        return Err(CodecError::MissingBody);
    }
    Ok(msg)
}

pub fn encode_client_message(msg: &ClientMessage) -> Vec<u8> {
    msg.encode_to_vec()
}

pub fn encode_server_message(msg: &ServerMessage) -> Vec<u8> {
    msg.encode_to_vec()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::messages::{client_message, server_message, ConnectionInit, ConnectionOpen};

    #[test]
    fn round_trip_client() {
        let msg = ClientMessage {
            id: 1,
            seq: 1,
            body: Some(client_message::Body::ConnectionInit(ConnectionInit {
                token: "t".into(),
                layer: 4,
                build: None,
                device: Some("test".into()),
            })),
        };
        let decoded = decode_client_message(&encode_client_message(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trip_server() {
        let msg = ServerMessage {
            id: 9,
            body: Some(server_message::Body::ConnectionOpen(ConnectionOpen {})),
        };
        let decoded = decode_server_message(&encode_server_message(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn missing_body_is_rejected() {
        let msg = ClientMessage {
            id: 1,
            seq: 0,
            body: None,
        };
        assert!(matches!(
            decode_client_message(&encode_client_message(&msg)),
            Err(CodecError::MissingBody)
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_server_message(&[0xff, 0xff, 0xff, 0x01]).is_err());
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let frame = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            decode_client_message(&frame),
            Err(CodecError::FrameTooLarge(_))
        ));
    }
}
