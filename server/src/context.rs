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

//! Process-wide wiring, initialized at boot and torn down at shutdown. Everything is explicit;
//! there are no hidden singletons.

use std::sync::Arc;

use banter_common_sqlite::connection::DbConnection;
use banter_proto::MsgIdGenerator;
use banter_shutdown::ShutdownSignal;

use crate::{
    access::AccessCache,
    broker::UpdateBroker,
    config::ServerConfig,
    error::ServerError,
    sessions::{SessionRegistry, SessionRegistryHandle},
    storage::BanterDatabase,
    updates::{PayloadSealer, UpdateStore},
};

pub struct ServerContext {
    pub config: ServerConfig,
    pub db: BanterDatabase,
    pub store: UpdateStore,
    pub access: AccessCache,
    pub registry: SessionRegistryHandle,
    pub broker: UpdateBroker,
    pub msg_ids: Arc<MsgIdGenerator>,
}

impl ServerContext {
    /// Connect the database, run migrations and spawn the session registry. Fails on
    /// unrecoverable database or key-material errors.
    pub fn init(config: ServerConfig, shutdown_signal: ShutdownSignal) -> Result<Arc<Self>, ServerError> {
        let connection = DbConnection::connect_path(&config.db_path)?;
        let db = BanterDatabase::init(connection)?;
        let sealer = PayloadSealer::new(&config.payload_key);
        let store = UpdateStore::new(db.clone(), sealer);
        let registry = SessionRegistry::spawn(shutdown_signal);
        let msg_ids = Arc::new(MsgIdGenerator::new());
        let broker = UpdateBroker::new(registry.clone(), msg_ids.clone());
        Ok(Arc::new(Self {
            config,
            db,
            store,
            access: AccessCache::default(),
            registry,
            broker,
            msg_ids,
        }))
    }
}
