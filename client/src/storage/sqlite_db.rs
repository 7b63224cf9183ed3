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

use std::sync::Arc;

use banter_common_sqlite::{connection::PooledDbConnection, error::SqliteStorageError};
use banter_proto::{Bucket, BucketKind, Method, RpcCall};
use diesel::{prelude::*, SqliteConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::*;
use prost::Message as _;
use uuid::Uuid;

use crate::{
    schema::{client_transactions, sync_buckets, sync_state},
    storage::{
        database::{BucketStateRecord, SyncBackend, TransactionBackend, TransactionRecord},
        ClientStorageError,
    },
};

const LOG_TARGET: &str = "client::storage::sqlite_db";

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

const TX_PENDING: i32 = 0;
const TX_DONE: i32 = 1;
const TX_FAILED: i32 = 2;

/// A sqlite backend for the durable transaction log and the sync cursors. Accessed through a
/// connection pool to the sqlite file.
#[derive(Clone)]
pub struct ClientSqliteDatabase<TClientDbConnection> {
    database_connection: Arc<TClientDbConnection>,
}

impl<TClientDbConnection: PooledDbConnection<Error = SqliteStorageError>>
    ClientSqliteDatabase<TClientDbConnection>
{
    pub fn new(database_connection: TClientDbConnection) -> Self {
        Self {
            database_connection: Arc::new(database_connection),
        }
    }

    pub fn init(database_connection: TClientDbConnection) -> Result<Self, ClientStorageError> {
        let db = Self::new(database_connection);
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<(), ClientStorageError> {
        let mut conn = self.database_connection.get_pooled_connection()?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| SqliteStorageError::MigrationError(e.to_string()))?;
        Ok(())
    }

    fn connection(
        &self,
    ) -> Result<
        diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<SqliteConnection>>,
        ClientStorageError,
    > {
        Ok(self.database_connection.get_pooled_connection()?)
    }
}

impl<TClientDbConnection> TransactionBackend for ClientSqliteDatabase<TClientDbConnection>
where TClientDbConnection: PooledDbConnection<Error = SqliteStorageError> + 'static
{
    fn insert_transaction(&self, record: &TransactionRecord) -> Result<(), ClientStorageError> {
        let mut conn = self.connection()?;
        TransactionSql::from(record.clone()).commit(&mut conn)
    }

    fn mark_transaction_done(&self, id: Uuid) -> Result<(), ClientStorageError> {
        self.set_deleted(id, TX_DONE)
    }

    fn mark_transaction_failed(&self, id: Uuid) -> Result<(), ClientStorageError> {
        self.set_deleted(id, TX_FAILED)
    }

    fn fetch_pending_transactions(&self) -> Result<Vec<TransactionRecord>, ClientStorageError> {
        let mut conn = self.connection()?;
        let rows = client_transactions::table
            .filter(client_transactions::deleted.eq(TX_PENDING))
            .order((client_transactions::date.asc(), client_transactions::id.asc()))
            .load::<TransactionSql>(&mut conn)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match TransactionRecord::try_from(row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A row from a future layer is skipped rather than wedging the queue
                    warn!(target: LOG_TARGET, "Skipping undecodable transaction row: {}", e);
                },
            }
        }
        Ok(records)
    }

    fn clear_transactions(&self) -> Result<(), ClientStorageError> {
        let mut conn = self.connection()?;
        diesel::delete(client_transactions::table).execute(&mut conn)?;
        Ok(())
    }
}

impl<TClientDbConnection> ClientSqliteDatabase<TClientDbConnection>
where TClientDbConnection: PooledDbConnection<Error = SqliteStorageError>
{
    fn set_deleted(&self, id: Uuid, state: i32) -> Result<(), ClientStorageError> {
        let mut conn = self.connection()?;
        diesel::update(client_transactions::table.filter(client_transactions::id.eq(id.to_string())))
            .set(client_transactions::deleted.eq(state))
            .execute(&mut conn)?;
        Ok(())
    }
}

impl<TClientDbConnection> SyncBackend for ClientSqliteDatabase<TClientDbConnection>
where TClientDbConnection: PooledDbConnection<Error = SqliteStorageError> + 'static
{
    fn fetch_bucket_states(&self) -> Result<Vec<BucketStateRecord>, ClientStorageError> {
        let mut conn = self.connection()?;
        let rows = sync_buckets::table.load::<BucketStateSql>(&mut conn)?;
        rows.into_iter().map(BucketStateRecord::try_from).collect()
    }

    fn fetch_bucket_state(&self, bucket: Bucket) -> Result<Option<BucketStateRecord>, ClientStorageError> {
        let mut conn = self.connection()?;
        let row = sync_buckets::table
            .filter(sync_buckets::kind.eq(bucket.kind))
            .filter(sync_buckets::entity_id.eq(bucket.entity_id))
            .first::<BucketStateSql>(&mut conn)
            .optional()?;
        row.map(BucketStateRecord::try_from).transpose()
    }

    fn upsert_bucket_state(&self, record: BucketStateRecord) -> Result<(), ClientStorageError> {
        let mut conn = self.connection()?;
        conn.immediate_transaction::<_, ClientStorageError, _>(|conn| {
            let existing = sync_buckets::table
                .filter(sync_buckets::kind.eq(record.bucket.kind))
                .filter(sync_buckets::entity_id.eq(record.bucket.entity_id))
                .first::<BucketStateSql>(conn)
                .optional()?;
            match existing {
                Some(row) if row.seq as u32 >= record.seq => Ok(()),
                Some(_) => {
                    diesel::update(
                        sync_buckets::table
                            .filter(sync_buckets::kind.eq(record.bucket.kind))
                            .filter(sync_buckets::entity_id.eq(record.bucket.entity_id)),
                    )
                    .set((
                        sync_buckets::seq.eq(record.seq as i32),
                        sync_buckets::date.eq(record.date),
                    ))
                    .execute(conn)?;
                    Ok(())
                },
                None => {
                    BucketStateSql::from(record).commit(conn)?;
                    Ok(())
                },
            }
        })
    }

    fn fetch_last_sync_date(&self) -> Result<Option<i64>, ClientStorageError> {
        let mut conn = self.connection()?;
        let row = sync_state::table
            .filter(sync_state::id.eq(0))
            .first::<SyncStateSql>(&mut conn)
            .optional()?;
        Ok(row.map(|r| r.last_sync_date))
    }

    fn set_last_sync_date(&self, date: i64) -> Result<(), ClientStorageError> {
        let mut conn = self.connection()?;
        let updated = diesel::update(sync_state::table.filter(sync_state::id.eq(0)))
            .set(sync_state::last_sync_date.eq(date))
            .execute(&mut conn)?;
        if updated == 0 {
            diesel::insert_into(sync_state::table)
                .values(SyncStateSql {
                    id: 0,
                    last_sync_date: date,
                })
                .execute(&mut conn)?;
        }
        Ok(())
    }
}

/// A Sql version of a queued transaction.
#[derive(Clone, Debug, Queryable, Insertable, PartialEq, Eq)]
#[diesel(table_name = client_transactions)]
struct TransactionSql {
    id: String,
    date: i64,
    payload: Vec<u8>,
    retry_after_ack: i32,
    deleted: i32,
}

impl TransactionSql {
    pub fn commit(&self, conn: &mut SqliteConnection) -> Result<(), ClientStorageError> {
        diesel::insert_into(client_transactions::table)
            .values(self.clone())
            .execute(conn)?;
        Ok(())
    }
}

impl From<TransactionRecord> for TransactionSql {
    fn from(record: TransactionRecord) -> Self {
        let call = RpcCall {
            method: record.method as i32,
            input: Some(record.input),
        };
        Self {
            id: record.id.to_string(),
            date: record.date,
            payload: call.encode_to_vec(),
            retry_after_ack: i32::from(record.retry_after_ack),
            deleted: TX_PENDING,
        }
    }
}

impl TryFrom<TransactionSql> for TransactionRecord {
    type Error = ClientStorageError;

    fn try_from(row: TransactionSql) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| ClientStorageError::Conversion(format!("invalid uuid: {}", e)))?;
        let call = RpcCall::decode(row.payload.as_slice())
            .map_err(|e| ClientStorageError::Conversion(format!("invalid rpc payload: {}", e)))?;
        let method = Method::try_from(call.method)
            .map_err(|_| ClientStorageError::Conversion(format!("unknown method {}", call.method)))?;
        let input = call
            .input
            .ok_or_else(|| ClientStorageError::Conversion("rpc payload had no input".to_string()))?;
        Ok(Self {
            id,
            date: row.date,
            method,
            input,
            retry_after_ack: row.retry_after_ack != 0,
        })
    }
}

/// A Sql version of one bucket cursor.
#[derive(Clone, Debug, Queryable, Insertable, PartialEq, Eq)]
#[diesel(table_name = sync_buckets)]
struct BucketStateSql {
    kind: i32,
    entity_id: i64,
    seq: i32,
    date: i64,
}

impl BucketStateSql {
    pub fn commit(&self, conn: &mut SqliteConnection) -> Result<(), ClientStorageError> {
        diesel::insert_into(sync_buckets::table)
            .values(self.clone())
            .execute(conn)?;
        Ok(())
    }
}

#[allow(clippy::cast_possible_wrap)]
impl From<BucketStateRecord> for BucketStateSql {
    fn from(record: BucketStateRecord) -> Self {
        Self {
            kind: record.bucket.kind,
            entity_id: record.bucket.entity_id,
            seq: record.seq as i32,
            date: record.date,
        }
    }
}

#[allow(clippy::cast_sign_loss)]
impl TryFrom<BucketStateSql> for BucketStateRecord {
    type Error = ClientStorageError;

    fn try_from(row: BucketStateSql) -> Result<Self, Self::Error> {
        BucketKind::try_from(row.kind)
            .map_err(|_| ClientStorageError::Conversion(format!("unknown bucket kind {}", row.kind)))?;
        Ok(Self {
            bucket: Bucket {
                kind: row.kind,
                entity_id: row.entity_id,
            },
            seq: row.seq as u32,
            date: row.date,
        })
    }
}

#[derive(Clone, Debug, Queryable, Insertable, PartialEq, Eq)]
#[diesel(table_name = sync_state)]
struct SyncStateSql {
    id: i32,
    last_sync_date: i64,
}
