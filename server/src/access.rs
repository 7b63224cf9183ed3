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

//! Access guards with a positive-result cache.
//!
//! Chat access: for a private chat the user must be one of the pair; for a space thread the user
//! must be a member of the owning space and, for non-public threads, a chat participant. Space
//! access: membership. Only positive results are cached (TTL + LRU); membership removal
//! invalidates the affected entries.

use std::{
    num::NonZeroUsize,
    sync::Mutex,
    time::{Duration, Instant},
};

use lru::LruCache;

use crate::{
    error::ServerError,
    storage::{models::ChatSql, models::SpaceSql, BanterDatabase},
};

const CACHE_TTL: Duration = Duration::from_secs(600);
const CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessScope {
    Chat,
    Space,
}

pub struct AccessCache {
    inner: Mutex<LruCache<(AccessScope, i64, i64), Instant>>,
    ttl: Duration,
}

impl Default for AccessCache {
    fn default() -> Self {
        Self::new(CACHE_TTL, CACHE_CAPACITY)
    }
}

impl AccessCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("cache capacity must be non-zero"),
            )),
            ttl,
        }
    }

    fn hit(&self, scope: AccessScope, entity_id: i64, user_id: i64) -> bool {
        let mut cache = self.inner.lock().expect("access cache lock poisoned");
        match cache.get(&(scope, entity_id, user_id)) {
            Some(granted_at) if granted_at.elapsed() < self.ttl => true,
            Some(_) => {
                cache.pop(&(scope, entity_id, user_id));
                false
            },
            None => false,
        }
    }

    fn grant(&self, scope: AccessScope, entity_id: i64, user_id: i64) {
        let mut cache = self.inner.lock().expect("access cache lock poisoned");
        cache.put((scope, entity_id, user_id), Instant::now());
    }

    /// Drop a cached grant, e.g. when a membership is removed.
    pub fn invalidate(&self, scope: AccessScope, entity_id: i64, user_id: i64) {
        let mut cache = self.inner.lock().expect("access cache lock poisoned");
        cache.pop(&(scope, entity_id, user_id));
    }
}

/// The user must be a participant of the chat: one of the private pair, or (for space threads) a
/// space member with thread visibility.
pub fn require_chat_access(
    db: &BanterDatabase,
    cache: &AccessCache,
    user_id: i64,
    chat_id: i64,
) -> Result<(), ServerError> {
    if cache.hit(AccessScope::Chat, chat_id, user_id) {
        return Ok(());
    }
    let denied = ServerError::Forbidden {
        scope: "chat",
        entity_id: chat_id,
    };
    let mut conn = db.conn()?;
    let chat = ChatSql::find(chat_id, &mut conn)?;
    let allowed = match (chat.min_user_id, chat.max_user_id, chat.space_id) {
        (Some(min), Some(max), _) => user_id == min || user_id == max,
        (_, _, Some(space_id)) => {
            SpaceSql::is_member(space_id, user_id, &mut conn)? &&
                (chat.public != 0 || ChatSql::is_participant(chat_id, user_id, &mut conn)?)
        },
        _ => false,
    };
    if !allowed {
        return Err(denied);
    }
    cache.grant(AccessScope::Chat, chat_id, user_id);
    Ok(())
}

pub fn require_space_access(
    db: &BanterDatabase,
    cache: &AccessCache,
    user_id: i64,
    space_id: i64,
) -> Result<(), ServerError> {
    if cache.hit(AccessScope::Space, space_id, user_id) {
        return Ok(());
    }
    let mut conn = db.conn()?;
    if !SpaceSql::exists(space_id, &mut conn)? {
        return Err(ServerError::NotFound("space"));
    }
    if !SpaceSql::is_member(space_id, user_id, &mut conn)? {
        return Err(ServerError::Forbidden {
            scope: "space",
            entity_id: space_id,
        });
    }
    cache.grant(AccessScope::Space, space_id, user_id);
    Ok(())
}
