// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use std::sync::Arc;

mod cipher;
mod entropy;

pub use cipher::{generate_key, Cipher, Fernet, Plain};
pub use entropy::{shannon, Entropy, SimpleEntropy};

pub(crate) use cipher::constant_time_eq;

/// Composition of the cipher and the optional entropy codec.
///
/// Outbound records are encrypted first and entropy-mangled second; inbound
/// records reverse the order.
#[derive(Clone)]
pub struct Codec {
    /// Authenticated cipher.
    cipher: Arc<dyn Cipher>,

    /// Entropy codec, if configured.
    entropy: Option<Arc<dyn Entropy>>,
}

impl Codec {
    /// Create new [`Codec`].
    pub fn new(cipher: Arc<dyn Cipher>, entropy: Option<Arc<dyn Entropy>>) -> Self {
        Self { cipher, entropy }
    }

    /// Create new cleartext [`Codec`] with no entropy codec.
    pub fn cleartext() -> Self {
        Self {
            cipher: Arc::new(Plain),
            entropy: None,
        }
    }

    /// Transform outbound `data` into its wire form.
    pub fn seal(&self, data: &[u8]) -> Vec<u8> {
        let data = self.cipher.encrypt(data);

        match &self.entropy {
            Some(entropy) => entropy.decrease(&data),
            None => data,
        }
    }

    /// Reverse [`Codec::seal`].
    pub fn open(&self, data: &[u8]) -> crate::Result<Vec<u8>> {
        match &self.entropy {
            Some(entropy) => self.cipher.decrypt(&entropy.increase(data)),
            None => self.cipher.decrypt(data),
        }
    }
}
