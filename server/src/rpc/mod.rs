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

//! Decodes `RpcCall`s, routes by method and enforces access. Every handler returns its result
//! plus the updates to fan out once the surrounding transaction has committed.

pub mod handlers;

use banter_proto::{rpc_call, rpc_result, Method, RpcCall};
use log::*;

use crate::{broker::UpdatePush, context::ServerContext, error::ServerError};

const LOG_TARGET: &str = "server::rpc";

pub struct HandlerOutcome {
    pub result: rpc_result::Result,
    /// Fan-out work, performed by the caller strictly after the handler's transaction committed.
    pub pushes: Vec<UpdatePush>,
}

impl HandlerOutcome {
    pub fn result_only(result: rpc_result::Result) -> Self {
        Self {
            result,
            pushes: Vec::new(),
        }
    }
}

pub fn dispatch(ctx: &ServerContext, user_id: i64, call: RpcCall) -> Result<HandlerOutcome, ServerError> {
    let method = Method::try_from(call.method)
        .map_err(|_| ServerError::BadRequest(format!("unknown method {}", call.method)))?;
    let input = call
        .input
        .ok_or_else(|| ServerError::BadRequest("rpc call without input".to_string()))?;
    debug!(target: LOG_TARGET, "Dispatching {} for user {}", method, user_id);
    use rpc_call::Input;
    match (method, input) {
        (Method::GetMe, Input::GetMe(input)) => handlers::get_me(ctx, user_id, input),
        (Method::SendMessage, Input::SendMessage(input)) => handlers::send_message(ctx, user_id, input),
        (Method::EditMessage, Input::EditMessage(input)) => handlers::edit_message(ctx, user_id, input),
        (Method::DeleteMessages, Input::DeleteMessages(input)) => {
            handlers::delete_messages(ctx, user_id, input)
        },
        (Method::GetChatHistory, Input::GetChatHistory(input)) => {
            handlers::get_chat_history(ctx, user_id, input)
        },
        (Method::GetUpdatesState, Input::GetUpdatesState(input)) => {
            handlers::get_updates_state(ctx, user_id, input)
        },
        (Method::GetUpdates, Input::GetUpdates(input)) => handlers::get_updates(ctx, user_id, input),
        (Method::CreateChat, Input::CreateChat(input)) => handlers::create_chat(ctx, user_id, input),
        (Method::MarkAsRead, Input::MarkAsRead(input)) => handlers::mark_as_read(ctx, user_id, input),
        (Method::SetOnline, Input::SetOnline(input)) => handlers::set_online(ctx, user_id, input),
        (Method::SetTyping, Input::SetTyping(input)) => handlers::set_typing(ctx, user_id, input),
        (method, _) => Err(ServerError::BadRequest(format!(
            "input does not match method {}",
            method
        ))),
    }
}
