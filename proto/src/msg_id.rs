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
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

/// 2024-01-01T00:00:00Z. Subtracted from wall-clock seconds so that ids stay well clear of the
/// 32-bit boundary for decades.
const ID_EPOCH_SECS: u64 = 1_704_067_200;

/// Generates connection-scoped message ids of the form
/// `((now_seconds - epoch) << 32) | counter`.
///
/// The counter resets whenever the seconds value advances and increments for ids generated within
/// the same second. Ids are strictly monotonic even when the wall clock steps backwards: a
/// candidate id that does not exceed the previously issued one is bumped to `previous + 1`.
#[derive(Debug)]
pub struct MsgIdGenerator {
    last_id: Mutex<u64>,
}

impl MsgIdGenerator {
    pub fn new() -> Self {
        Self {
            last_id: Mutex::new(0),
        }
    }

    pub fn next(&self) -> u64 {
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.next_at(now_secs)
    }

    pub fn next_at(&self, now_secs: u64) -> u64 {
        let candidate = now_secs.saturating_sub(ID_EPOCH_SECS) << 32;
        let mut last = self.last_id.lock().expect("msg id lock poisoned");
        let id = if candidate > *last { candidate } else { *last + 1 };
        *last = id;
        id
    }
}

impl Default for MsgIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
