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

/// `ouija` error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("i/o error: `{0}`")]
    Io(#[from] std::io::Error),

    /// Ciphertext failed authentication or could not be decrypted.
    #[error("ciphertext rejected")]
    Cipher,

    /// Record could not be decoded.
    #[error("malformed record")]
    Malformed,

    /// Packet carried a phase this implementation does not know.
    #[error("unknown packet phase: `{0}`")]
    Phase(u8),

    /// Shared token mismatch, the peer may be hostile.
    #[error("shared token mismatch")]
    Token,

    /// Handshake did not complete.
    #[error("handshake failed: `{0}`")]
    Handshake(&'static str),

    /// Control packet went unacknowledged through all retries.
    #[error("send retries exhausted")]
    SendRetry,

    /// Send or receive buffer reached its configured capacity.
    #[error("buffer capacity exceeded")]
    Overload,

    /// Invalid configuration.
    #[error("invalid configuration: `{0}`")]
    Config(String),
}
