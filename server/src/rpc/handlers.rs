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

//! Per-method handlers.
//!
//! Every mutating handler follows the same shape: validate access, then inside one immediate
//! transaction mutate the domain rows, append the update row and advance the bucket, and only
//! hand the committed update back for fan-out.

use banter_proto::{update, Bucket, BucketKind, Message, Update, UpdateTyping};
use chrono::Utc;

use super::HandlerOutcome;
use crate::{
    access,
    broker::UpdatePush,
    context::ServerContext,
    error::ServerError,
    storage::{models::ReadCursorSql, ChatSql, MessageSql, NewMessageSql},
    updates::DEFAULT_FETCH_LIMIT,
};

use banter_proto::{
    rpc_result,
    CreateChatInput,
    CreateChatOutput,
    DeleteMessagesInput,
    DeleteMessagesOutput,
    EditMessageInput,
    EditMessageOutput,
    GetChatHistoryInput,
    GetChatHistoryOutput,
    GetMeInput,
    GetMeOutput,
    GetUpdatesInput,
    GetUpdatesStateInput,
    GetUpdatesStateOutput,
    MarkAsReadInput,
    MarkAsReadOutput,
    SendMessageInput,
    SendMessageOutput,
    SetOnlineInput,
    SetOnlineOutput,
    SetTypingInput,
    SetTypingOutput,
    UpdateChatHasNewUpdates,
    UpdateDeleteMessages,
    UpdateEditMessage,
    UpdateNewMessage,
    UpdateUserStatus,
};

const MAX_MESSAGE_LEN: usize = 4096;
const MAX_HISTORY_LIMIT: u32 = 200;
const DEFAULT_HISTORY_LIMIT: u32 = 50;

pub fn get_me(ctx: &ServerContext, user_id: i64, _input: GetMeInput) -> Result<HandlerOutcome, ServerError> {
    let user = ctx.db.find_user(user_id)?;
    Ok(HandlerOutcome::result_only(rpc_result::Result::GetMe(
        GetMeOutput { user: Some(user) },
    )))
}

pub fn send_message(
    ctx: &ServerContext,
    user_id: i64,
    input: SendMessageInput,
) -> Result<HandlerOutcome, ServerError> {
    validate_text(&input.text)?;
    access::require_chat_access(&ctx.db, &ctx.access, user_id, input.chat_id)?;

    let now = Utc::now().timestamp();
    let mut conn = ctx.db.conn()?;
    let (message, pushed) = conn.immediate_transaction::<_, ServerError, _>(|conn| {
        // A resend of the same logical message returns the already-committed row
        if let Some(existing) = MessageSql::find_by_random_id(
            input.chat_id,
            user_id,
            input.random_id as i64,
            conn,
        )? {
            return Ok((Message::from(existing), None));
        }

        let chat = ChatSql::find(input.chat_id, conn)?;
        let message_id = chat.last_msg_id + 1;
        let row = MessageSql::insert(
            NewMessageSql {
                chat_id: input.chat_id,
                message_id,
                from_user_id: user_id,
                text: input.text.clone(),
                date: now,
                edit_date: None,
                random_id: input.random_id as i64,
                deleted: 0,
            },
            conn,
        )?;
        ChatSql::advance_last_msg_id(input.chat_id, message_id, conn)?;

        let message = Message::from(row);
        let update = ctx.store.append(
            conn,
            Bucket::chat(input.chat_id),
            update::Body::NewMessage(UpdateNewMessage {
                message: Some(message.clone()),
            }),
            now,
        )?;
        Ok((message, Some(update)))
    })?;

    let pushes = match pushed {
        Some(update) => vec![UpdatePush {
            bucket: Bucket::chat(input.chat_id),
            update,
            recipients: ctx.db.chat_participant_ids(input.chat_id)?,
        }],
        None => Vec::new(),
    };
    Ok(HandlerOutcome {
        result: rpc_result::Result::SendMessage(SendMessageOutput {
            message: Some(message),
        }),
        pushes,
    })
}

pub fn edit_message(
    ctx: &ServerContext,
    user_id: i64,
    input: EditMessageInput,
) -> Result<HandlerOutcome, ServerError> {
    validate_text(&input.text)?;
    access::require_chat_access(&ctx.db, &ctx.access, user_id, input.chat_id)?;

    let now = Utc::now().timestamp();
    let mut conn = ctx.db.conn()?;
    let (message, update) = conn.immediate_transaction::<_, ServerError, _>(|conn| {
        let existing = MessageSql::find(input.chat_id, input.message_id, conn)?;
        if existing.from_user_id != user_id {
            return Err(ServerError::Forbidden {
                scope: "message",
                entity_id: input.message_id,
            });
        }
        let row = MessageSql::set_text(input.chat_id, input.message_id, &input.text, now, conn)?;
        let message = Message::from(row);
        let update = ctx.store.append(
            conn,
            Bucket::chat(input.chat_id),
            update::Body::EditMessage(UpdateEditMessage {
                message: Some(message.clone()),
            }),
            now,
        )?;
        Ok((message, update))
    })?;

    Ok(HandlerOutcome {
        result: rpc_result::Result::EditMessage(EditMessageOutput {
            message: Some(message),
        }),
        pushes: vec![UpdatePush {
            bucket: Bucket::chat(input.chat_id),
            update,
            recipients: ctx.db.chat_participant_ids(input.chat_id)?,
        }],
    })
}

pub fn delete_messages(
    ctx: &ServerContext,
    user_id: i64,
    input: DeleteMessagesInput,
) -> Result<HandlerOutcome, ServerError> {
    if input.message_ids.is_empty() {
        return Err(ServerError::BadRequest("no message ids given".to_string()));
    }
    access::require_chat_access(&ctx.db, &ctx.access, user_id, input.chat_id)?;

    let now = Utc::now().timestamp();
    let mut conn = ctx.db.conn()?;
    let update = conn.immediate_transaction::<_, ServerError, _>(|conn| {
        let affected = MessageSql::mark_deleted(input.chat_id, &input.message_ids, conn)?;
        if affected == 0 {
            return Err(ServerError::NotFound("message"));
        }
        ctx.store.append(
            conn,
            Bucket::chat(input.chat_id),
            update::Body::DeleteMessages(UpdateDeleteMessages {
                chat_id: input.chat_id,
                message_ids: input.message_ids.clone(),
            }),
            now,
        )
    })?;

    Ok(HandlerOutcome {
        result: rpc_result::Result::DeleteMessages(DeleteMessagesOutput {
            chat_id: input.chat_id,
            message_ids: input.message_ids.clone(),
        }),
        pushes: vec![UpdatePush {
            bucket: Bucket::chat(input.chat_id),
            update,
            recipients: ctx.db.chat_participant_ids(input.chat_id)?,
        }],
    })
}

pub fn get_chat_history(
    ctx: &ServerContext,
    user_id: i64,
    input: GetChatHistoryInput,
) -> Result<HandlerOutcome, ServerError> {
    access::require_chat_access(&ctx.db, &ctx.access, user_id, input.chat_id)?;
    let limit = match input.limit {
        0 => DEFAULT_HISTORY_LIMIT,
        n => n.min(MAX_HISTORY_LIMIT),
    };
    let mut conn = ctx.db.conn()?;
    let mut rows = MessageSql::history(input.chat_id, i64::from(limit), input.before_id, &mut conn)?;
    // Serve the page oldest-first
    rows.reverse();
    Ok(HandlerOutcome::result_only(rpc_result::Result::GetChatHistory(
        GetChatHistoryOutput {
            messages: rows.into_iter().map(Message::from).collect(),
        },
    )))
}

pub fn get_updates_state(
    ctx: &ServerContext,
    user_id: i64,
    _input: GetUpdatesStateInput,
) -> Result<HandlerOutcome, ServerError> {
    let mut buckets = vec![Bucket::user(user_id)];
    buckets.extend(ctx.db.chat_ids_for_user(user_id)?.into_iter().map(Bucket::chat));
    buckets.extend(ctx.db.space_ids_for_user(user_id)?.into_iter().map(Bucket::space));
    let states = ctx.store.get_state(&buckets)?;
    Ok(HandlerOutcome::result_only(
        rpc_result::Result::GetUpdatesState(GetUpdatesStateOutput { buckets: states }),
    ))
}

pub fn get_updates(
    ctx: &ServerContext,
    user_id: i64,
    input: GetUpdatesInput,
) -> Result<HandlerOutcome, ServerError> {
    let bucket = input
        .bucket
        .ok_or_else(|| ServerError::BadRequest("no bucket given".to_string()))?;
    match bucket.kind() {
        BucketKind::Chat => {
            access::require_chat_access(&ctx.db, &ctx.access, user_id, bucket.entity_id)?;
        },
        BucketKind::Space => {
            access::require_space_access(&ctx.db, &ctx.access, user_id, bucket.entity_id)?;
        },
        BucketKind::User => {
            if bucket.entity_id != user_id {
                return Err(ServerError::Forbidden {
                    scope: "user",
                    entity_id: bucket.entity_id,
                });
            }
        },
        BucketKind::Unspecified => {
            return Err(ServerError::BadRequest("unspecified bucket kind".to_string()));
        },
    }
    let limit = if input.limit == 0 { DEFAULT_FETCH_LIMIT } else { input.limit };
    let out = ctx.store.get_updates(bucket, input.since_seq, limit)?;
    Ok(HandlerOutcome::result_only(rpc_result::Result::GetUpdates(out)))
}

pub fn create_chat(
    ctx: &ServerContext,
    user_id: i64,
    input: CreateChatInput,
) -> Result<HandlerOutcome, ServerError> {
    let (chat, _created) = ctx.db.find_or_create_private_chat(user_id, input.peer_user_id)?;
    Ok(HandlerOutcome::result_only(rpc_result::Result::CreateChat(
        CreateChatOutput { chat: Some(chat) },
    )))
}

pub fn mark_as_read(
    ctx: &ServerContext,
    user_id: i64,
    input: MarkAsReadInput,
) -> Result<HandlerOutcome, ServerError> {
    access::require_chat_access(&ctx.db, &ctx.access, user_id, input.chat_id)?;
    let now = Utc::now().timestamp();
    let mut conn = ctx.db.conn()?;
    let update = conn.immediate_transaction::<_, ServerError, _>(|conn| {
        ReadCursorSql::advance(input.chat_id, user_id, input.max_read_id, conn)?;
        // The caller's other devices learn through their own user bucket
        ctx.store.append(
            conn,
            Bucket::user(user_id),
            update::Body::ChatHasNewUpdates(UpdateChatHasNewUpdates {
                chat_id: input.chat_id,
            }),
            now,
        )
    })?;

    Ok(HandlerOutcome {
        result: rpc_result::Result::MarkAsRead(MarkAsReadOutput {}),
        pushes: vec![UpdatePush {
            bucket: Bucket::user(user_id),
            update,
            recipients: vec![user_id],
        }],
    })
}

pub fn set_online(
    ctx: &ServerContext,
    user_id: i64,
    input: SetOnlineInput,
) -> Result<HandlerOutcome, ServerError> {
    let now = Utc::now().timestamp();
    ctx.db.set_user_online(user_id, input.online, now)?;

    // Presence is transient: broadcast to everyone sharing a chat, no log row
    let recipients = ctx.db.contact_user_ids(user_id)?;
    let pushes = vec![UpdatePush {
        bucket: Bucket::user(user_id),
        update: Update {
            seq: 0,
            date: now,
            update: Some(update::Body::UserStatus(UpdateUserStatus {
                user_id,
                online: input.online,
                last_seen: Some(now),
            })),
        },
        recipients,
    }];
    Ok(HandlerOutcome {
        result: rpc_result::Result::SetOnline(SetOnlineOutput {}),
        pushes,
    })
}

pub fn set_typing(
    ctx: &ServerContext,
    user_id: i64,
    input: SetTypingInput,
) -> Result<HandlerOutcome, ServerError> {
    access::require_chat_access(&ctx.db, &ctx.access, user_id, input.chat_id)?;
    let recipients: Vec<i64> = ctx
        .db
        .chat_participant_ids(input.chat_id)?
        .into_iter()
        .filter(|id| *id != user_id)
        .collect();
    let pushes = vec![UpdatePush {
        bucket: Bucket::chat(input.chat_id),
        update: Update {
            seq: 0,
            date: Utc::now().timestamp(),
            update: Some(update::Body::Typing(UpdateTyping {
                chat_id: input.chat_id,
                user_id,
                typing: input.typing,
            })),
        },
        recipients,
    }];
    Ok(HandlerOutcome {
        result: rpc_result::Result::SetTyping(SetTypingOutput {}),
        pushes,
    })
}

fn validate_text(text: &str) -> Result<(), ServerError> {
    if text.is_empty() {
        return Err(ServerError::BadRequest("message text is empty".to_string()));
    }
    if text.len() > MAX_MESSAGE_LEN {
        return Err(ServerError::BadRequest(format!(
            "message text exceeds {} bytes",
            MAX_MESSAGE_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use banter_common_sqlite::connection::{DbConnection, DbConnectionUrl};
    use banter_proto::{RpcCall, rpc_call, Method, UpdatesResultType};
    use banter_shutdown::Shutdown;

    use super::*;
    use crate::{config::ServerConfig, rpc};

    fn test_context() -> (tempfile::TempDir, Shutdown, std::sync::Arc<ServerContext>) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            db_path: dir.path().join("server.sqlite3"),
            payload_key: [3u8; 32],
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            allowed_origins: vec![],
            handshake_timeout: std::time::Duration::from_secs(10),
        };
        let shutdown = Shutdown::new();
        let ctx = ServerContext::init(config, shutdown.to_signal()).unwrap();
        (dir, shutdown, ctx)
    }

    fn call(method: Method, input: rpc_call::Input) -> RpcCall {
        RpcCall {
            method: method as i32,
            input: Some(input),
        }
    }

    fn send(ctx: &ServerContext, user_id: i64, chat_id: i64, text: &str, random_id: u64) -> HandlerOutcome {
        rpc::dispatch(
            ctx,
            user_id,
            call(
                Method::SendMessage,
                rpc_call::Input::SendMessage(SendMessageInput {
                    chat_id,
                    text: text.to_string(),
                    random_id,
                }),
            ),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn send_message_advances_bucket_and_fans_out() {
        let (_dir, _shutdown, ctx) = test_context();
        let amy = ctx.db.create_user("amy", "t1").unwrap();
        let bob = ctx.db.create_user("bob", "t2").unwrap();
        let (chat, _) = ctx.db.find_or_create_private_chat(amy.id, bob.id).unwrap();

        let outcome = send(&ctx, amy.id, chat.id, "hello", 1);
        let message = match &outcome.result {
            rpc_result::Result::SendMessage(out) => out.message.clone().unwrap(),
            other => panic!("unexpected result {:?}", other),
        };
        assert_eq!(message.message_id, 1);
        assert_eq!(outcome.pushes.len(), 1);
        assert_eq!(outcome.pushes[0].update.seq, 1);
        let mut recipients = outcome.pushes[0].recipients.clone();
        recipients.sort_unstable();
        assert_eq!(recipients, vec![amy.id.min(bob.id), amy.id.max(bob.id)]);

        let second = send(&ctx, bob.id, chat.id, "hi back", 2);
        assert_eq!(second.pushes[0].update.seq, 2);

        let updates = ctx.store.get_updates(Bucket::chat(chat.id), 0, 100).unwrap();
        assert_eq!(updates.result_type, UpdatesResultType::Slice as i32);
        assert_eq!(updates.updates.len(), 2);
    }

    #[tokio::test]
    async fn send_message_dedupes_by_random_id() {
        let (_dir, _shutdown, ctx) = test_context();
        let amy = ctx.db.create_user("amy", "t1").unwrap();
        let bob = ctx.db.create_user("bob", "t2").unwrap();
        let (chat, _) = ctx.db.find_or_create_private_chat(amy.id, bob.id).unwrap();

        let first = send(&ctx, amy.id, chat.id, "hello", 99);
        let retry = send(&ctx, amy.id, chat.id, "hello", 99);

        let (m1, m2) = match (&first.result, &retry.result) {
            (rpc_result::Result::SendMessage(a), rpc_result::Result::SendMessage(b)) => {
                (a.message.clone().unwrap(), b.message.clone().unwrap())
            },
            other => panic!("unexpected results {:?}", other),
        };
        assert_eq!(m1.global_id, m2.global_id);
        // The retry commits nothing new: no second update, no fan-out
        assert!(retry.pushes.is_empty());
        let updates = ctx.store.get_updates(Bucket::chat(chat.id), 0, 100).unwrap();
        assert_eq!(updates.updates.len(), 1);
    }

    #[tokio::test]
    async fn outsider_is_denied_before_any_write() {
        let (_dir, _shutdown, ctx) = test_context();
        let amy = ctx.db.create_user("amy", "t1").unwrap();
        let bob = ctx.db.create_user("bob", "t2").unwrap();
        let eve = ctx.db.create_user("eve", "t3").unwrap();
        let (chat, _) = ctx.db.find_or_create_private_chat(amy.id, bob.id).unwrap();

        let result = rpc::dispatch(
            &ctx,
            eve.id,
            call(
                Method::SendMessage,
                rpc_call::Input::SendMessage(SendMessageInput {
                    chat_id: chat.id,
                    text: "intruding".to_string(),
                    random_id: 1,
                }),
            ),
        );
        assert!(matches!(result, Err(ServerError::Forbidden { .. })));
        let updates = ctx.store.get_updates(Bucket::chat(chat.id), 0, 100).unwrap();
        assert!(updates.updates.is_empty());
    }

    #[tokio::test]
    async fn edit_is_restricted_to_the_author() {
        let (_dir, _shutdown, ctx) = test_context();
        let amy = ctx.db.create_user("amy", "t1").unwrap();
        let bob = ctx.db.create_user("bob", "t2").unwrap();
        let (chat, _) = ctx.db.find_or_create_private_chat(amy.id, bob.id).unwrap();
        send(&ctx, amy.id, chat.id, "original", 1);

        let result = rpc::dispatch(
            &ctx,
            bob.id,
            call(
                Method::EditMessage,
                rpc_call::Input::EditMessage(EditMessageInput {
                    chat_id: chat.id,
                    message_id: 1,
                    text: "hijacked".to_string(),
                }),
            ),
        );
        assert!(matches!(result, Err(ServerError::Forbidden { .. })));

        let outcome = rpc::dispatch(
            &ctx,
            amy.id,
            call(
                Method::EditMessage,
                rpc_call::Input::EditMessage(EditMessageInput {
                    chat_id: chat.id,
                    message_id: 1,
                    text: "edited".to_string(),
                }),
            ),
        )
        .unwrap();
        assert_eq!(outcome.pushes[0].update.seq, 2);
    }

    #[tokio::test]
    async fn history_pages_oldest_first() {
        let (_dir, _shutdown, ctx) = test_context();
        let amy = ctx.db.create_user("amy", "t1").unwrap();
        let bob = ctx.db.create_user("bob", "t2").unwrap();
        let (chat, _) = ctx.db.find_or_create_private_chat(amy.id, bob.id).unwrap();
        for i in 1..=5 {
            send(&ctx, amy.id, chat.id, &format!("msg {}", i), i as u64);
        }

        let outcome = rpc::dispatch(
            &ctx,
            amy.id,
            call(
                Method::GetChatHistory,
                rpc_call::Input::GetChatHistory(GetChatHistoryInput {
                    chat_id: chat.id,
                    limit: 2,
                    before_id: None,
                }),
            ),
        )
        .unwrap();
        let messages = match outcome.result {
            rpc_result::Result::GetChatHistory(out) => out.messages,
            other => panic!("unexpected result {:?}", other),
        };
        let ids: Vec<i64> = messages.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![4, 5]);

        let outcome = rpc::dispatch(
            &ctx,
            amy.id,
            call(
                Method::GetChatHistory,
                rpc_call::Input::GetChatHistory(GetChatHistoryInput {
                    chat_id: chat.id,
                    limit: 2,
                    before_id: Some(4),
                }),
            ),
        )
        .unwrap();
        let messages = match outcome.result {
            rpc_result::Result::GetChatHistory(out) => out.messages,
            other => panic!("unexpected result {:?}", other),
        };
        let ids: Vec<i64> = messages.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn updates_state_covers_all_user_buckets() {
        let (_dir, _shutdown, ctx) = test_context();
        let amy = ctx.db.create_user("amy", "t1").unwrap();
        let bob = ctx.db.create_user("bob", "t2").unwrap();
        let (chat, _) = ctx.db.find_or_create_private_chat(amy.id, bob.id).unwrap();
        let space_id = ctx.db.create_space("den", &[amy.id]).unwrap();
        send(&ctx, amy.id, chat.id, "hello", 1);

        let outcome = rpc::dispatch(
            &ctx,
            amy.id,
            call(
                Method::GetUpdatesState,
                rpc_call::Input::GetUpdatesState(GetUpdatesStateInput {}),
            ),
        )
        .unwrap();
        let states = match outcome.result {
            rpc_result::Result::GetUpdatesState(out) => out.buckets,
            other => panic!("unexpected result {:?}", other),
        };
        let buckets: Vec<Bucket> = states.iter().map(|s| s.bucket.unwrap()).collect();
        assert!(buckets.contains(&Bucket::user(amy.id)));
        assert!(buckets.contains(&Bucket::chat(chat.id)));
        assert!(buckets.contains(&Bucket::space(space_id)));
        let chat_state = states.iter().find(|s| s.bucket == Some(Bucket::chat(chat.id))).unwrap();
        assert_eq!(chat_state.seq, 1);
    }

    #[tokio::test]
    async fn get_updates_enforces_bucket_access() {
        let (_dir, _shutdown, ctx) = test_context();
        let amy = ctx.db.create_user("amy", "t1").unwrap();
        let eve = ctx.db.create_user("eve", "t2").unwrap();

        let result = rpc::dispatch(
            &ctx,
            eve.id,
            call(
                Method::GetUpdates,
                rpc_call::Input::GetUpdates(GetUpdatesInput {
                    bucket: Some(Bucket::user(amy.id)),
                    since_seq: 0,
                    limit: 10,
                }),
            ),
        );
        assert!(matches!(result, Err(ServerError::Forbidden { .. })));
    }

    #[tokio::test]
    async fn mark_as_read_notifies_own_devices_only() {
        let (_dir, _shutdown, ctx) = test_context();
        let amy = ctx.db.create_user("amy", "t1").unwrap();
        let bob = ctx.db.create_user("bob", "t2").unwrap();
        let (chat, _) = ctx.db.find_or_create_private_chat(amy.id, bob.id).unwrap();
        send(&ctx, bob.id, chat.id, "hello", 1);

        let outcome = rpc::dispatch(
            &ctx,
            amy.id,
            call(
                Method::MarkAsRead,
                rpc_call::Input::MarkAsRead(MarkAsReadInput {
                    chat_id: chat.id,
                    max_read_id: 1,
                }),
            ),
        )
        .unwrap();
        assert_eq!(outcome.pushes.len(), 1);
        assert_eq!(outcome.pushes[0].bucket, Bucket::user(amy.id));
        assert_eq!(outcome.pushes[0].recipients, vec![amy.id]);
        assert_eq!(outcome.pushes[0].update.seq, 1);
    }

    #[tokio::test]
    async fn presence_is_transient() {
        let (_dir, _shutdown, ctx) = test_context();
        let amy = ctx.db.create_user("amy", "t1").unwrap();
        let bob = ctx.db.create_user("bob", "t2").unwrap();
        ctx.db.find_or_create_private_chat(amy.id, bob.id).unwrap();

        let outcome = rpc::dispatch(
            &ctx,
            amy.id,
            call(
                Method::SetOnline,
                rpc_call::Input::SetOnline(SetOnlineInput { online: true }),
            ),
        )
        .unwrap();
        assert_eq!(outcome.pushes[0].recipients, vec![bob.id]);
        assert_eq!(outcome.pushes[0].update.seq, 0);
        // No update row was logged for presence
        let user_bucket = ctx.store.get_updates(Bucket::user(amy.id), 0, 100).unwrap();
        assert!(user_bucket.updates.is_empty());
    }

    #[tokio::test]
    async fn mismatched_input_is_rejected() {
        let (_dir, _shutdown, ctx) = test_context();
        let amy = ctx.db.create_user("amy", "t1").unwrap();
        let result = rpc::dispatch(
            &ctx,
            amy.id,
            call(Method::SendMessage, rpc_call::Input::GetMe(GetMeInput {})),
        );
        assert!(matches!(result, Err(ServerError::BadRequest(_))));
    }
}
