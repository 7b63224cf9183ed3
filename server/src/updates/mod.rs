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

//! The per-bucket update log.
//!
//! Appends run inside the caller's mutation transaction so a bucket's `pts` advance, the sealed
//! update row and the domain rows commit atomically. Reads serve `GetUpdates` with the
//! `EMPTY`/`SLICE`/`TOO_LONG` contract.

pub mod seal;

use banter_proto::{update, Bucket, BucketState, GetUpdatesOutput, Update, UpdatesResultType};
use diesel::{prelude::*, SqliteConnection};
use log::*;
use prost::Message as _;

pub use self::seal::PayloadSealer;
use crate::{
    error::ServerError,
    schema::{buckets, updates},
    storage::BanterDatabase,
};

const LOG_TARGET: &str = "server::updates";

/// Retention horizon: a bucket keeps at most this many updates...
pub const RETENTION_UPDATES: u32 = 10_000;
/// ...and nothing older than this many days, whichever bites first.
pub const RETENTION_DAYS: i64 = 30;

/// Default and maximum page sizes for `GetUpdates`.
pub const DEFAULT_FETCH_LIMIT: u32 = 100;
pub const MAX_FETCH_LIMIT: u32 = 1000;

/// Append-side and read-side access to the update log.
#[derive(Clone)]
pub struct UpdateStore {
    db: BanterDatabase,
    sealer: PayloadSealer,
}

impl UpdateStore {
    pub fn new(db: BanterDatabase, sealer: PayloadSealer) -> Self {
        Self { db, sealer }
    }

    /// Append one update to `bucket` inside the caller's open transaction. Advances the bucket's
    /// `pts`, writes the sealed row and prunes past the retention horizon. Returns the update as
    /// it will be served to clients.
    pub fn append(
        &self,
        conn: &mut SqliteConnection,
        bucket: Bucket,
        body: update::Body,
        now: i64,
    ) -> Result<Update, ServerError> {
        let current = buckets::table
            .filter(buckets::kind.eq(bucket.kind))
            .filter(buckets::entity_id.eq(bucket.entity_id))
            .select(buckets::pts)
            .first::<i32>(conn)
            .optional()?;
        let next_pts = match current {
            Some(pts) => pts + 1,
            None => 1,
        };

        let update = Update {
            seq: next_pts as u32,
            date: now,
            update: Some(body),
        };
        let sealed = self.sealer.seal(&update.encode_to_vec())?;
        diesel::insert_into(updates::table)
            .values((
                updates::kind.eq(bucket.kind),
                updates::entity_id.eq(bucket.entity_id),
                updates::seq.eq(next_pts),
                updates::date.eq(now),
                updates::payload.eq(sealed),
            ))
            .execute(conn)?;

        if current.is_some() {
            diesel::update(
                buckets::table
                    .filter(buckets::kind.eq(bucket.kind))
                    .filter(buckets::entity_id.eq(bucket.entity_id)),
            )
            .set((buckets::pts.eq(next_pts), buckets::last_update_date.eq(now)))
            .execute(conn)?;
        } else {
            diesel::insert_into(buckets::table)
                .values((
                    buckets::kind.eq(bucket.kind),
                    buckets::entity_id.eq(bucket.entity_id),
                    buckets::pts.eq(next_pts),
                    buckets::last_update_date.eq(now),
                ))
                .execute(conn)?;
        }

        self.prune(conn, bucket, next_pts, now)?;
        Ok(update)
    }

    fn prune(
        &self,
        conn: &mut SqliteConnection,
        bucket: Bucket,
        pts: i32,
        now: i64,
    ) -> Result<(), ServerError> {
        let min_seq = pts - RETENTION_UPDATES as i32;
        let min_date = now - RETENTION_DAYS * 86_400;
        let pruned = diesel::delete(
            updates::table
                .filter(updates::kind.eq(bucket.kind))
                .filter(updates::entity_id.eq(bucket.entity_id))
                .filter(updates::seq.le(min_seq).or(updates::date.lt(min_date))),
        )
        .execute(conn)?;
        if pruned > 0 {
            debug!(target: LOG_TARGET, "Pruned {} update(s) from {}", pruned, bucket);
        }
        Ok(())
    }

    /// Serve `GetUpdates(bucket, since_seq, limit)`.
    pub fn get_updates(
        &self,
        bucket: Bucket,
        since_seq: u32,
        limit: u32,
    ) -> Result<GetUpdatesOutput, ServerError> {
        let limit = match limit {
            0 => DEFAULT_FETCH_LIMIT,
            n => n.min(MAX_FETCH_LIMIT),
        };
        let mut conn = self.db.conn()?;
        let current = buckets::table
            .filter(buckets::kind.eq(bucket.kind))
            .filter(buckets::entity_id.eq(bucket.entity_id))
            .select((buckets::pts, buckets::last_update_date))
            .first::<(i32, i64)>(&mut conn)
            .optional()?;
        let (pts, last_date) = match current {
            Some((pts, date)) => (pts as u32, date),
            None => (0, 0),
        };

        if since_seq >= pts {
            return Ok(GetUpdatesOutput {
                updates: vec![],
                result_type: UpdatesResultType::Empty as i32,
                seq: pts,
                date: last_date,
                r#final: true,
            });
        }

        if pts > RETENTION_UPDATES && since_seq < pts - RETENTION_UPDATES {
            return Ok(too_long(pts, last_date));
        }

        let rows = updates::table
            .filter(updates::kind.eq(bucket.kind))
            .filter(updates::entity_id.eq(bucket.entity_id))
            .filter(updates::seq.gt(since_seq as i32))
            .order(updates::seq.asc())
            .limit(i64::from(limit))
            .select((updates::seq, updates::payload))
            .load::<(i32, Vec<u8>)>(&mut conn)?;

        // Day-based pruning may have removed the rows the cursor needs even inside the seq window
        match rows.first() {
            None => return Ok(too_long(pts, last_date)),
            Some((first_seq, _)) if *first_seq as u32 != since_seq + 1 => {
                return Ok(too_long(pts, last_date));
            },
            Some(_) => {},
        }

        let mut decoded = Vec::with_capacity(rows.len());
        let mut last_seq = since_seq;
        for (seq, payload) in rows {
            let plain = self.sealer.unseal(&payload)?;
            let update = Update::decode(plain.as_slice())
                .map_err(|e| ServerError::Seal(format!("stored update undecodable: {}", e)))?;
            last_seq = seq as u32;
            decoded.push(update);
        }

        Ok(GetUpdatesOutput {
            updates: decoded,
            result_type: UpdatesResultType::Slice as i32,
            seq: pts,
            date: last_date,
            r#final: last_seq >= pts,
        })
    }

    /// The server's current view of each requested bucket, for `GetUpdatesState`.
    pub fn get_state(&self, buckets_of_interest: &[Bucket]) -> Result<Vec<BucketState>, ServerError> {
        let mut conn = self.db.conn()?;
        let mut states = Vec::with_capacity(buckets_of_interest.len());
        for bucket in buckets_of_interest {
            let row = buckets::table
                .filter(buckets::kind.eq(bucket.kind))
                .filter(buckets::entity_id.eq(bucket.entity_id))
                .select((buckets::pts, buckets::last_update_date))
                .first::<(i32, i64)>(&mut conn)
                .optional()?;
            let (seq, date) = match row {
                Some((pts, date)) => (pts as u32, date),
                None => (0, 0),
            };
            states.push(BucketState {
                bucket: Some(*bucket),
                seq,
                date,
            });
        }
        Ok(states)
    }
}

fn too_long(pts: u32, last_date: i64) -> GetUpdatesOutput {
    GetUpdatesOutput {
        updates: vec![],
        result_type: UpdatesResultType::TooLong as i32,
        seq: pts,
        date: last_date,
        r#final: true,
    }
}

#[cfg(test)]
mod test {
    use banter_common_sqlite::connection::{DbConnection, DbConnectionUrl};
    use banter_proto::UpdateChatHasNewUpdates;

    use super::*;

    fn test_store() -> (tempfile::TempDir, UpdateStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = DbConnectionUrl::file(dir.path().join("updates.sqlite3"));
        let db = BanterDatabase::init(DbConnection::connect_url(&url).unwrap()).unwrap();
        let store = UpdateStore::new(db, PayloadSealer::new(&[9u8; 32]));
        (dir, store)
    }

    fn append_n(store: &UpdateStore, bucket: Bucket, n: u32, start_date: i64) {
        let mut conn = store.db.conn().unwrap();
        for i in 0..n {
            conn.immediate_transaction::<_, ServerError, _>(|conn| {
                store.append(
                    conn,
                    bucket,
                    update::Body::ChatHasNewUpdates(UpdateChatHasNewUpdates { chat_id: 1 }),
                    start_date + i64::from(i),
                )?;
                Ok(())
            })
            .unwrap();
        }
    }

    #[test]
    fn seq_is_dense_and_monotonic() {
        let (_dir, store) = test_store();
        let bucket = Bucket::chat(1);
        append_n(&store, bucket, 5, 100);

        let out = store.get_updates(bucket, 0, 100).unwrap();
        assert_eq!(out.result_type, UpdatesResultType::Slice as i32);
        let seqs: Vec<u32> = out.updates.iter().map(|u| u.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(out.seq, 5);
        assert!(out.r#final);
    }

    #[test]
    fn caught_up_cursor_gets_empty() {
        let (_dir, store) = test_store();
        let bucket = Bucket::chat(1);
        append_n(&store, bucket, 3, 100);

        let out = store.get_updates(bucket, 3, 100).unwrap();
        assert_eq!(out.result_type, UpdatesResultType::Empty as i32);
        assert!(out.updates.is_empty());
        assert_eq!(out.seq, 3);
        assert_eq!(out.date, 102);
        assert!(out.r#final);
    }

    #[test]
    fn unknown_bucket_is_empty_at_zero() {
        let (_dir, store) = test_store();
        let out = store.get_updates(Bucket::chat(42), 0, 100).unwrap();
        assert_eq!(out.result_type, UpdatesResultType::Empty as i32);
        assert_eq!(out.seq, 0);
    }

    #[test]
    fn partial_page_is_not_final() {
        let (_dir, store) = test_store();
        let bucket = Bucket::chat(1);
        append_n(&store, bucket, 5, 100);

        let out = store.get_updates(bucket, 0, 2).unwrap();
        assert_eq!(out.result_type, UpdatesResultType::Slice as i32);
        assert_eq!(out.updates.len(), 2);
        assert!(!out.r#final);

        let out = store.get_updates(bucket, 2, 100).unwrap();
        assert_eq!(out.updates.len(), 3);
        assert!(out.r#final);
    }

    #[test]
    fn pruned_gap_returns_too_long() {
        let (_dir, store) = test_store();
        let bucket = Bucket::chat(1);
        append_n(&store, bucket, 3, 100);

        // Simulate the retention job having removed the head of the log
        {
            let mut conn = store.db.conn().unwrap();
            diesel::delete(updates::table.filter(updates::seq.le(2)))
                .execute(&mut conn)
                .unwrap();
        }

        let out = store.get_updates(bucket, 0, 100).unwrap();
        assert_eq!(out.result_type, UpdatesResultType::TooLong as i32);
        assert!(out.updates.is_empty());
        assert_eq!(out.seq, 3);
    }

    #[test]
    fn old_dated_rows_are_pruned_on_append() {
        let (_dir, store) = test_store();
        let bucket = Bucket::chat(1);
        // Two ancient updates, then a fresh one
        append_n(&store, bucket, 2, 0);
        append_n(&store, bucket, 1, RETENTION_DAYS * 86_400 + 100);

        let out = store.get_updates(bucket, 0, 100).unwrap();
        assert_eq!(out.result_type, UpdatesResultType::TooLong as i32);
        assert_eq!(out.seq, 3);
    }

    #[test]
    fn state_reports_per_bucket_pts() {
        let (_dir, store) = test_store();
        append_n(&store, Bucket::chat(1), 3, 100);
        append_n(&store, Bucket::user(7), 1, 500);

        let states = store
            .get_state(&[Bucket::chat(1), Bucket::user(7), Bucket::space(9)])
            .unwrap();
        assert_eq!(states[0].seq, 3);
        assert_eq!(states[1].seq, 1);
        assert_eq!(states[1].date, 500);
        assert_eq!(states[2].seq, 0);
    }

    #[test]
    fn payload_rows_are_sealed_at_rest() {
        let (_dir, store) = test_store();
        let bucket = Bucket::chat(1);
        append_n(&store, bucket, 1, 100);

        let mut conn = store.db.conn().unwrap();
        let payload = updates::table
            .select(updates::payload)
            .first::<Vec<u8>>(&mut conn)
            .unwrap();
        // The raw row must not decode as a plaintext Update
        assert!(Update::decode(payload.as_slice()).is_err() ||
            Update::decode(payload.as_slice()).unwrap().seq != 1);
        drop(conn);

        let out = store.get_updates(bucket, 0, 100).unwrap();
        assert_eq!(out.updates[0].seq, 1);
    }
}
