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

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use diesel::{
    connection::SimpleConnection,
    r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection},
    SqliteConnection,
};
use log::debug;

use crate::error::SqliteStorageError;

const LOG_TARGET: &str = "common_sqlite::connection";

/// Location of a sqlite database file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConnectionUrl {
    path: PathBuf,
}

impl DbConnectionUrl {
    pub fn file<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn to_url_string(&self) -> Result<String, SqliteStorageError> {
        self.path
            .to_str()
            .map(|s| s.to_owned())
            .ok_or(SqliteStorageError::InvalidUnicodePath)
    }
}

impl fmt::Display for DbConnectionUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl From<PathBuf> for DbConnectionUrl {
    fn from(path: PathBuf) -> Self {
        Self { path }
    }
}

/// Gives out pooled connections to one sqlite database.
pub trait PooledDbConnection: Clone + Send + Sync {
    type Error;

    fn get_pooled_connection(
        &self,
    ) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>, Self::Error>;
}

/// A connection pool over a single sqlite file. WAL mode and a busy timeout are applied to every
/// connection so that the reader tasks do not starve the single writer.
#[derive(Clone)]
pub struct DbConnection {
    pool: Arc<Pool<ConnectionManager<SqliteConnection>>>,
    url: DbConnectionUrl,
}

impl DbConnection {
    pub fn connect_url(url: &DbConnectionUrl) -> Result<Self, SqliteStorageError> {
        if let Some(parent) = url.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = ConnectionManager::<SqliteConnection>::new(url.to_url_string()?);
        let pool = Pool::builder()
            .max_size(16)
            .connection_timeout(Duration::from_secs(30))
            .connection_customizer(Box::new(SqliteConnectionOptions))
            .build(manager)
            .map_err(|e| SqliteStorageError::DieselR2d2Error(e.to_string()))?;
        debug!(target: LOG_TARGET, "Connected to sqlite database at '{}'", url);
        Ok(Self {
            pool: Arc::new(pool),
            url: url.clone(),
        })
    }

    pub fn connect_path<P: AsRef<Path>>(path: P) -> Result<Self, SqliteStorageError> {
        Self::connect_url(&DbConnectionUrl::file(path))
    }

    pub fn url(&self) -> &DbConnectionUrl {
        &self.url
    }
}

impl PooledDbConnection for DbConnection {
    type Error = SqliteStorageError;

    fn get_pooled_connection(
        &self,
    ) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>, Self::Error> {
        self.pool
            .get()
            .map_err(|e| SqliteStorageError::DieselR2d2Error(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
struct SqliteConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqliteConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = 5000; \
             PRAGMA foreign_keys = ON;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connects_and_pools() {
        let dir = tempfile::tempdir().unwrap();
        let url = DbConnectionUrl::file(dir.path().join("test.sqlite3"));
        let db = DbConnection::connect_url(&url).unwrap();
        let mut conn = db.get_pooled_connection().unwrap();
        conn.batch_execute("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
            .unwrap();
        let other = db.clone();
        let mut conn2 = other.get_pooled_connection().unwrap();
        conn2.batch_execute("INSERT INTO t VALUES (2);").unwrap();
    }

    #[test]
    fn creates_missing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let url = DbConnectionUrl::file(dir.path().join("nested/deeper/test.sqlite3"));
        let _db = DbConnection::connect_url(&url).unwrap();
        assert!(dir.path().join("nested/deeper").exists());
    }
}
