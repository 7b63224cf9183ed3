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

//! A oneshot-style shutdown signal.
//!
//! A [`Shutdown`] is the owning trigger half; any number of [`ShutdownSignal`]s may be taken from
//! it and awaited from other tasks. Once triggered, the signal stays triggered forever, so late
//! subscribers resolve immediately.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::watch;

/// The owning half of a shutdown signal. Dropping a `Shutdown` triggers it.
#[derive(Debug)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
    signal: ShutdownSignal,
    trigger_on_drop: bool,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender,
            signal: ShutdownSignal { inner: receiver },
            trigger_on_drop: true,
        }
    }

    /// Convert this instance into a signal, consuming the trigger. The returned signal never
    /// resolves unless `trigger` was called beforehand.
    pub fn into_signal(mut self) -> ShutdownSignal {
        self.trigger_on_drop = false;
        self.signal.clone()
    }

    pub fn to_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn trigger(&mut self) {
        // An error means there are no receivers, which is of no concern to the trigger
        let _result = self.sender.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        if self.trigger_on_drop {
            self.trigger();
        }
    }
}

/// Receiving half of a shutdown signal. Cheap to clone, and usable both as an async fn
/// (`signal.wait().await`) and as a `Future` in combinators like `future::select`.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    inner: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait for the shutdown to be triggered. Returns immediately if it already was.
    pub async fn wait(&mut self) {
        // `changed` errors when the sender is dropped, which counts as triggered
        while !*self.inner.borrow() {
            if self.inner.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.borrow()
    }
}

impl Future for ShutdownSignal {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let mut fut = Box::pin(this.wait());
        fut.as_mut().poll(cx)
    }
}
