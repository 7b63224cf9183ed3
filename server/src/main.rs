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

use anyhow::Context;
use banter_server::{config::ServerConfig, context::ServerContext, ws};
use banter_shutdown::Shutdown;
use log::*;

const LOG_TARGET: &str = "server::main";

/// Exits non-zero on unrecoverable database or key-material errors; zero on SIGTERM after
/// draining sessions.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = ServerConfig::from_env().context("loading configuration")?;
    let mut shutdown = Shutdown::new();
    let ctx = ServerContext::init(config, shutdown.to_signal()).context("initializing server")?;

    let (listener, _addr) = ws::bind(&ctx).await.context("binding listen address")?;
    let serve = tokio::spawn(ws::serve(ctx, listener, shutdown.to_signal()));

    wait_for_termination().await;
    info!(target: LOG_TARGET, "Termination signal received, draining sessions");
    shutdown.trigger();
    let _result = serve.await;
    info!(target: LOG_TARGET, "Shutdown complete");
    Ok(())
}

async fn wait_for_termination() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("installing the SIGTERM handler never fails");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}
