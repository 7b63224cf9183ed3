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

//! Seals `Update.payload` at rest with XChaCha20-Poly1305. The 24-byte nonce is prepended to the
//! ciphertext.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key,
    XChaCha20Poly1305,
    XNonce,
};
use rand::RngCore;

use crate::error::ServerError;

const NONCE_LEN: usize = 24;

#[derive(Clone)]
pub struct PayloadSealer {
    cipher: XChaCha20Poly1305,
}

impl PayloadSealer {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, ServerError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| ServerError::Seal(e.to_string()))?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, ServerError> {
        if sealed.len() < NONCE_LEN {
            return Err(ServerError::Seal("sealed payload too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|e| ServerError::Seal(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let sealer = PayloadSealer::new(&[7u8; 32]);
        let sealed = sealer.seal(b"secret update").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"secret update");
        assert_eq!(sealer.unseal(&sealed).unwrap(), b"secret update");
    }

    #[test]
    fn tampering_is_detected() {
        let sealer = PayloadSealer::new(&[7u8; 32]);
        let mut sealed = sealer.seal(b"secret update").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(sealer.unseal(&sealed).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let sealer = PayloadSealer::new(&[7u8; 32]);
        let other = PayloadSealer::new(&[8u8; 32]);
        let sealed = sealer.seal(b"secret update").unwrap();
        assert!(other.unseal(&sealed).is_err());
    }
}
