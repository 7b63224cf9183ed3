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

//! Sql row structs and the per-row query helpers.

use banter_proto::{Chat, Message, User};
use diesel::{prelude::*, SqliteConnection};

use crate::{
    error::ServerError,
    schema::{chat_participants, chats, messages, read_cursors, space_members, spaces, users},
};

/// A Sql version of the User struct.
#[derive(Clone, Debug, Queryable, PartialEq, Eq)]
#[diesel(table_name = users)]
pub struct UserSql {
    pub id: i64,
    pub username: String,
    pub auth_token: String,
    pub online: i32,
    pub last_seen: Option<i64>,
}

#[derive(Clone, Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUserSql {
    pub username: String,
    pub auth_token: String,
    pub online: i32,
    pub last_seen: Option<i64>,
}

impl UserSql {
    pub fn find(id: i64, conn: &mut SqliteConnection) -> Result<UserSql, ServerError> {
        Ok(users::table.find(id).first::<UserSql>(conn)?)
    }

    pub fn find_by_token(token: &str, conn: &mut SqliteConnection) -> Result<Option<UserSql>, ServerError> {
        Ok(users::table
            .filter(users::auth_token.eq(token))
            .first::<UserSql>(conn)
            .optional()?)
    }

    pub fn set_online(
        id: i64,
        online: bool,
        last_seen: i64,
        conn: &mut SqliteConnection,
    ) -> Result<(), ServerError> {
        diesel::update(users::table.find(id))
            .set((
                users::online.eq(i32::from(online)),
                users::last_seen.eq(Some(last_seen)),
            ))
            .execute(conn)?;
        Ok(())
    }
}

impl From<UserSql> for User {
    fn from(row: UserSql) -> Self {
        Self {
            id: row.id,
            username: row.username,
            online: row.online != 0,
            last_seen: row.last_seen,
        }
    }
}

/// A Sql version of the Chat struct.
#[derive(Clone, Debug, Queryable, PartialEq, Eq)]
#[diesel(table_name = chats)]
pub struct ChatSql {
    pub id: i64,
    pub min_user_id: Option<i64>,
    pub max_user_id: Option<i64>,
    pub space_id: Option<i64>,
    pub title: Option<String>,
    pub public: i32,
    pub last_msg_id: i64,
}

impl ChatSql {
    pub fn find(id: i64, conn: &mut SqliteConnection) -> Result<ChatSql, ServerError> {
        chats::table
            .find(id)
            .first::<ChatSql>(conn)
            .optional()?
            .ok_or(ServerError::NotFound("chat"))
    }

    pub fn find_private(
        min_user_id: i64,
        max_user_id: i64,
        conn: &mut SqliteConnection,
    ) -> Result<Option<ChatSql>, ServerError> {
        Ok(chats::table
            .filter(chats::min_user_id.eq(Some(min_user_id)))
            .filter(chats::max_user_id.eq(Some(max_user_id)))
            .first::<ChatSql>(conn)
            .optional()?)
    }

    pub fn advance_last_msg_id(
        id: i64,
        last_msg_id: i64,
        conn: &mut SqliteConnection,
    ) -> Result<(), ServerError> {
        diesel::update(chats::table.find(id))
            .set(chats::last_msg_id.eq(last_msg_id))
            .execute(conn)?;
        Ok(())
    }

    pub fn participant_ids(chat_id: i64, conn: &mut SqliteConnection) -> Result<Vec<i64>, ServerError> {
        Ok(chat_participants::table
            .filter(chat_participants::chat_id.eq(chat_id))
            .select(chat_participants::user_id)
            .load::<i64>(conn)?)
    }

    pub fn is_participant(chat_id: i64, user_id: i64, conn: &mut SqliteConnection) -> Result<bool, ServerError> {
        let count: i64 = chat_participants::table
            .filter(chat_participants::chat_id.eq(chat_id))
            .filter(chat_participants::user_id.eq(user_id))
            .count()
            .get_result(conn)?;
        Ok(count > 0)
    }

    pub fn add_participant(chat_id: i64, user_id: i64, conn: &mut SqliteConnection) -> Result<(), ServerError> {
        diesel::insert_into(chat_participants::table)
            .values((
                chat_participants::chat_id.eq(chat_id),
                chat_participants::user_id.eq(user_id),
            ))
            .on_conflict_do_nothing()
            .execute(conn)?;
        Ok(())
    }

    pub fn ids_for_user(user_id: i64, conn: &mut SqliteConnection) -> Result<Vec<i64>, ServerError> {
        Ok(chat_participants::table
            .filter(chat_participants::user_id.eq(user_id))
            .select(chat_participants::chat_id)
            .load::<i64>(conn)?)
    }
}

impl From<ChatSql> for Chat {
    fn from(row: ChatSql) -> Self {
        Self {
            id: row.id,
            min_user_id: row.min_user_id,
            max_user_id: row.max_user_id,
            space_id: row.space_id,
            title: row.title,
            public: row.public != 0,
        }
    }
}

/// A Sql version of the Message struct.
#[derive(Clone, Debug, Queryable, PartialEq, Eq)]
#[diesel(table_name = messages)]
pub struct MessageSql {
    pub global_id: i64,
    pub chat_id: i64,
    pub message_id: i64,
    pub from_user_id: i64,
    pub text: String,
    pub date: i64,
    pub edit_date: Option<i64>,
    pub random_id: i64,
    pub deleted: i32,
}

#[derive(Clone, Debug, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessageSql {
    pub chat_id: i64,
    pub message_id: i64,
    pub from_user_id: i64,
    pub text: String,
    pub date: i64,
    pub edit_date: Option<i64>,
    pub random_id: i64,
    pub deleted: i32,
}

impl MessageSql {
    pub fn insert(new: NewMessageSql, conn: &mut SqliteConnection) -> Result<MessageSql, ServerError> {
        diesel::insert_into(messages::table).values(&new).execute(conn)?;
        Ok(messages::table
            .filter(messages::chat_id.eq(new.chat_id))
            .filter(messages::message_id.eq(new.message_id))
            .first::<MessageSql>(conn)?)
    }

    pub fn find(chat_id: i64, message_id: i64, conn: &mut SqliteConnection) -> Result<MessageSql, ServerError> {
        messages::table
            .filter(messages::chat_id.eq(chat_id))
            .filter(messages::message_id.eq(message_id))
            .filter(messages::deleted.eq(0))
            .first::<MessageSql>(conn)
            .optional()?
            .ok_or(ServerError::NotFound("message"))
    }

    pub fn find_by_random_id(
        chat_id: i64,
        from_user_id: i64,
        random_id: i64,
        conn: &mut SqliteConnection,
    ) -> Result<Option<MessageSql>, ServerError> {
        if random_id == 0 {
            return Ok(None);
        }
        Ok(messages::table
            .filter(messages::chat_id.eq(chat_id))
            .filter(messages::from_user_id.eq(from_user_id))
            .filter(messages::random_id.eq(random_id))
            .filter(messages::deleted.eq(0))
            .first::<MessageSql>(conn)
            .optional()?)
    }

    pub fn set_text(
        chat_id: i64,
        message_id: i64,
        text: &str,
        edit_date: i64,
        conn: &mut SqliteConnection,
    ) -> Result<MessageSql, ServerError> {
        diesel::update(
            messages::table
                .filter(messages::chat_id.eq(chat_id))
                .filter(messages::message_id.eq(message_id)),
        )
        .set((
            messages::text.eq(text),
            messages::edit_date.eq(Some(edit_date)),
        ))
        .execute(conn)?;
        Self::find(chat_id, message_id, conn)
    }

    pub fn mark_deleted(chat_id: i64, message_ids: &[i64], conn: &mut SqliteConnection) -> Result<usize, ServerError> {
        Ok(diesel::update(
            messages::table
                .filter(messages::chat_id.eq(chat_id))
                .filter(messages::message_id.eq_any(message_ids)),
        )
        .set(messages::deleted.eq(1))
        .execute(conn)?)
    }

    /// Newest-first history page, capped by `limit`, optionally older than `before_id`.
    pub fn history(
        chat_id: i64,
        limit: i64,
        before_id: Option<i64>,
        conn: &mut SqliteConnection,
    ) -> Result<Vec<MessageSql>, ServerError> {
        let mut query = messages::table
            .filter(messages::chat_id.eq(chat_id))
            .filter(messages::deleted.eq(0))
            .into_boxed();
        if let Some(before_id) = before_id {
            query = query.filter(messages::message_id.lt(before_id));
        }
        Ok(query
            .order(messages::message_id.desc())
            .limit(limit)
            .load::<MessageSql>(conn)?)
    }
}

impl From<MessageSql> for Message {
    fn from(row: MessageSql) -> Self {
        Self {
            global_id: row.global_id,
            chat_id: row.chat_id,
            message_id: row.message_id,
            from_user_id: row.from_user_id,
            text: row.text,
            date: row.date,
            edit_date: row.edit_date,
        }
    }
}

pub struct SpaceSql;

impl SpaceSql {
    pub fn exists(space_id: i64, conn: &mut SqliteConnection) -> Result<bool, ServerError> {
        let count: i64 = spaces::table
            .filter(spaces::id.eq(space_id))
            .count()
            .get_result(conn)?;
        Ok(count > 0)
    }

    pub fn is_member(space_id: i64, user_id: i64, conn: &mut SqliteConnection) -> Result<bool, ServerError> {
        let count: i64 = space_members::table
            .filter(space_members::space_id.eq(space_id))
            .filter(space_members::user_id.eq(user_id))
            .count()
            .get_result(conn)?;
        Ok(count > 0)
    }

    pub fn member_ids(space_id: i64, conn: &mut SqliteConnection) -> Result<Vec<i64>, ServerError> {
        Ok(space_members::table
            .filter(space_members::space_id.eq(space_id))
            .select(space_members::user_id)
            .load::<i64>(conn)?)
    }

    pub fn ids_for_user(user_id: i64, conn: &mut SqliteConnection) -> Result<Vec<i64>, ServerError> {
        Ok(space_members::table
            .filter(space_members::user_id.eq(user_id))
            .select(space_members::space_id)
            .load::<i64>(conn)?)
    }
}

pub struct ReadCursorSql;

impl ReadCursorSql {
    pub fn advance(
        chat_id: i64,
        user_id: i64,
        max_read_id: i64,
        conn: &mut SqliteConnection,
    ) -> Result<(), ServerError> {
        let updated = diesel::update(
            read_cursors::table
                .filter(read_cursors::chat_id.eq(chat_id))
                .filter(read_cursors::user_id.eq(user_id))
                .filter(read_cursors::max_read_id.lt(max_read_id)),
        )
        .set(read_cursors::max_read_id.eq(max_read_id))
        .execute(conn)?;
        if updated == 0 {
            diesel::insert_into(read_cursors::table)
                .values((
                    read_cursors::chat_id.eq(chat_id),
                    read_cursors::user_id.eq(user_id),
                    read_cursors::max_read_id.eq(max_read_id),
                ))
                .on_conflict_do_nothing()
                .execute(conn)?;
        }
        Ok(())
    }
}
