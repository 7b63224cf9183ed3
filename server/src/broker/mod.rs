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

//! Fans freshly committed updates out to the live sessions of every member of the bucket.
//! Strictly post-commit: handlers append inside their database transaction and hand the result
//! here only after it commits.

use std::sync::Arc;

use banter_proto::{server_message, Bucket, MsgIdGenerator, ServerMessage, Update, UpdatesPayload};
use log::*;

use crate::sessions::SessionRegistryHandle;

const LOG_TARGET: &str = "server::broker";

/// One committed (or transient presence) update with its fan-out audience.
#[derive(Debug, Clone)]
pub struct UpdatePush {
    pub bucket: Bucket,
    pub update: Update,
    pub recipients: Vec<i64>,
}

#[derive(Clone)]
pub struct UpdateBroker {
    registry: SessionRegistryHandle,
    msg_ids: Arc<MsgIdGenerator>,
}

impl UpdateBroker {
    pub fn new(registry: SessionRegistryHandle, msg_ids: Arc<MsgIdGenerator>) -> Self {
        Self { registry, msg_ids }
    }

    pub async fn broadcast(&self, push: UpdatePush) {
        if push.recipients.is_empty() {
            return;
        }
        trace!(
            target: LOG_TARGET,
            "Pushing seq {} on {} to {} user(s)",
            push.update.seq,
            push.bucket,
            push.recipients.len()
        );
        let message = ServerMessage {
            id: self.msg_ids.next(),
            body: Some(server_message::Body::Updates(UpdatesPayload {
                bucket: Some(push.bucket),
                updates: vec![push.update],
            })),
        };
        self.registry.send_to_users(push.recipients, message).await;
    }

    pub async fn broadcast_all(&self, pushes: Vec<UpdatePush>) {
        for push in pushes {
            self.broadcast(push).await;
        }
    }
}
