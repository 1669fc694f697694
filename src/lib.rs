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

#![doc = include_str!("../README.md")]

mod codec;
mod config;
mod error;
mod event;
mod proto;
mod registry;
mod telemetry;
mod tuning;

pub mod datagram;
pub mod stream;

pub use codec::{generate_key, shannon, Cipher, Codec, Entropy, Fernet, Plain, SimpleEntropy};
pub use config::{Config, Mode, Protocol};
pub use error::Error;
pub use proto::{Message, Packet, Request};
pub use telemetry::Telemetry;
pub use tuning::{DatagramTuning, StreamTuning};

/// Result type of the crate.
pub type Result<T> = core::result::Result<T, error::Error>;
