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

//! Dead-connection detection via nonce'd pings.
//!
//! Driven by the protocol client's receive loop: [`PingPongService::tick`] fires on every ping
//! interval while the connection is open, [`PingPongService::record_pong`] on every inbound pong.

use std::{collections::HashMap, time::Duration};

use rand::Rng;
use tokio::time::Instant;

use crate::config::PingPolicy;

/// What the owner should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingAction {
    /// Send a ping carrying this nonce.
    Send(u64),
    /// A ping has been outstanding past the active timeout; reconnect.
    TimedOut,
}

#[derive(Debug)]
pub struct PingPongService {
    policy: PingPolicy,
    outstanding: HashMap<u64, Instant>,
    constrained: bool,
}

impl PingPongService {
    pub fn new(policy: PingPolicy) -> Self {
        Self {
            policy,
            outstanding: HashMap::new(),
            constrained: false,
        }
    }

    pub fn set_constrained(&mut self, constrained: bool) {
        self.constrained = constrained;
    }

    pub fn active_timeout(&self) -> Duration {
        if self.constrained {
            self.policy.timeout_constrained
        } else {
            self.policy.timeout_good
        }
    }

    /// Called on every ping interval. Checks the oldest outstanding ping against the active
    /// timeout before issuing a fresh nonce.
    pub fn tick<R: Rng>(&mut self, now: Instant, rng: &mut R) -> PingAction {
        let timeout = self.active_timeout();
        if self
            .outstanding
            .values()
            .any(|sent| now.saturating_duration_since(*sent) > timeout)
        {
            return PingAction::TimedOut;
        }
        let nonce = rng.gen::<u64>();
        self.outstanding.insert(nonce, now);
        PingAction::Send(nonce)
    }

    /// Remove a known nonce. Unknown nonces are ignored.
    pub fn record_pong(&mut self, nonce: u64) {
        self.outstanding.remove(&nonce);
    }

    /// Drop all outstanding nonces, e.g. when the connection closes.
    pub fn reset(&mut self) {
        self.outstanding.clear();
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}
