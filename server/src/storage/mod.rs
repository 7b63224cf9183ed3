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

pub mod models;

use banter_common_sqlite::{
    connection::{DbConnection, PooledDbConnection},
    error::SqliteStorageError,
};
use banter_proto::{Chat, User};
use diesel::r2d2::{ConnectionManager, PooledConnection};
use diesel::{prelude::*, SqliteConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::*;

pub use self::models::{
    ChatSql,
    MessageSql,
    NewMessageSql,
    NewUserSql,
    ReadCursorSql,
    SpaceSql,
    UserSql,
};
use crate::{
    error::ServerError,
    schema::{chats, space_members, spaces, users},
};

const LOG_TARGET: &str = "server::storage";

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

/// Pooled access to the server database, with the domain-level queries that do not need to run
/// inside a caller-owned transaction.
#[derive(Clone)]
pub struct BanterDatabase {
    connection: DbConnection,
}

impl BanterDatabase {
    pub fn new(connection: DbConnection) -> Self {
        Self { connection }
    }

    pub fn init(connection: DbConnection) -> Result<Self, ServerError> {
        let db = Self::new(connection);
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<(), ServerError> {
        let mut conn = self.conn()?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| SqliteStorageError::MigrationError(e.to_string()))?;
        if !applied.is_empty() {
            info!(target: LOG_TARGET, "Applied {} database migration(s)", applied.len());
        }
        Ok(())
    }

    pub fn conn(
        &self,
    ) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>, ServerError> {
        Ok(self.connection.get_pooled_connection()?)
    }

    // -- Users --------------------------------------------------------------------------------

    pub fn find_user(&self, id: i64) -> Result<User, ServerError> {
        let mut conn = self.conn()?;
        Ok(UserSql::find(id, &mut conn)?.into())
    }

    pub fn find_user_by_token(&self, token: &str) -> Result<Option<User>, ServerError> {
        let mut conn = self.conn()?;
        Ok(UserSql::find_by_token(token, &mut conn)?.map(Into::into))
    }

    pub fn create_user(&self, username: &str, auth_token: &str) -> Result<User, ServerError> {
        let mut conn = self.conn()?;
        diesel::insert_into(users::table)
            .values(NewUserSql {
                username: username.to_string(),
                auth_token: auth_token.to_string(),
                online: 0,
                last_seen: None,
            })
            .execute(&mut conn)?;
        let row = users::table
            .filter(users::username.eq(username))
            .first::<UserSql>(&mut conn)?;
        Ok(row.into())
    }

    pub fn set_user_online(&self, user_id: i64, online: bool, last_seen: i64) -> Result<(), ServerError> {
        let mut conn = self.conn()?;
        UserSql::set_online(user_id, online, last_seen, &mut conn)
    }

    // -- Chats and spaces ---------------------------------------------------------------------

    pub fn get_chat(&self, chat_id: i64) -> Result<Chat, ServerError> {
        let mut conn = self.conn()?;
        Ok(ChatSql::find(chat_id, &mut conn)?.into())
    }

    pub fn chat_participant_ids(&self, chat_id: i64) -> Result<Vec<i64>, ServerError> {
        let mut conn = self.conn()?;
        ChatSql::participant_ids(chat_id, &mut conn)
    }

    pub fn chat_ids_for_user(&self, user_id: i64) -> Result<Vec<i64>, ServerError> {
        let mut conn = self.conn()?;
        ChatSql::ids_for_user(user_id, &mut conn)
    }

    pub fn space_ids_for_user(&self, user_id: i64) -> Result<Vec<i64>, ServerError> {
        let mut conn = self.conn()?;
        SpaceSql::ids_for_user(user_id, &mut conn)
    }

    pub fn space_member_ids(&self, space_id: i64) -> Result<Vec<i64>, ServerError> {
        let mut conn = self.conn()?;
        SpaceSql::member_ids(space_id, &mut conn)
    }

    pub fn create_space(&self, title: &str, member_ids: &[i64]) -> Result<i64, ServerError> {
        let mut conn = self.conn()?;
        conn.immediate_transaction::<_, ServerError, _>(|conn| {
            diesel::insert_into(spaces::table)
                .values(spaces::title.eq(title))
                .execute(conn)?;
            let space_id = spaces::table
                .filter(spaces::title.eq(title))
                .order(spaces::id.desc())
                .select(spaces::id)
                .first::<i64>(conn)?;
            for user_id in member_ids {
                diesel::insert_into(space_members::table)
                    .values((
                        space_members::space_id.eq(space_id),
                        space_members::user_id.eq(*user_id),
                    ))
                    .on_conflict_do_nothing()
                    .execute(conn)?;
            }
            Ok(space_id)
        })
    }

    /// Users that share at least one chat with `user_id`, for presence fan-out.
    pub fn contact_user_ids(&self, user_id: i64) -> Result<Vec<i64>, ServerError> {
        let mut conn = self.conn()?;
        let chat_ids = ChatSql::ids_for_user(user_id, &mut conn)?;
        let mut contacts = std::collections::BTreeSet::new();
        for chat_id in chat_ids {
            for id in ChatSql::participant_ids(chat_id, &mut conn)? {
                if id != user_id {
                    contacts.insert(id);
                }
            }
        }
        Ok(contacts.into_iter().collect())
    }

    /// The private chat for an ordered user pair, creating it (and its participant rows) when it
    /// does not exist yet.
    pub fn find_or_create_private_chat(&self, a: i64, b: i64) -> Result<(Chat, bool), ServerError> {
        if a == b {
            return Err(ServerError::BadRequest("cannot open a chat with yourself".to_string()));
        }
        let (min, max) = if a < b { (a, b) } else { (b, a) };
        let mut conn = self.conn()?;
        conn.immediate_transaction::<_, ServerError, _>(|conn| {
            if let Some(row) = ChatSql::find_private(min, max, conn)? {
                return Ok((row.into(), false));
            }
            // Both users must exist before the pair row is created
            UserSql::find(min, conn).map_err(|_| ServerError::NotFound("user"))?;
            UserSql::find(max, conn).map_err(|_| ServerError::NotFound("user"))?;
            diesel::insert_into(chats::table)
                .values((
                    chats::min_user_id.eq(Some(min)),
                    chats::max_user_id.eq(Some(max)),
                    chats::public.eq(0),
                    chats::last_msg_id.eq(0),
                ))
                .execute(conn)?;
            let row = ChatSql::find_private(min, max, conn)?
                .ok_or(ServerError::NotFound("chat"))?;
            ChatSql::add_participant(row.id, min, conn)?;
            ChatSql::add_participant(row.id, max, conn)?;
            Ok((row.into(), true))
        })
    }
}
