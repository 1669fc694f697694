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

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use std::io;

pub mod message;
pub mod packet;
pub mod parser;

pub use message::Message;
pub use packet::Packet;
pub use parser::Request;

/// Frame delimiter of the stream transport, also terminates request heads.
pub const SEPARATOR: &[u8] = b"\r\n\r\n";

/// Reply sent to the client once a CONNECT tunnel is established.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Buffered reader reassembling [`SEPARATOR`]-delimited frames.
///
/// Bytes read past a frame stay buffered for the next call, and already
/// consumed bytes can be pushed back with [`FrameReader::unread`] so plain
/// HTTP requests can be forwarded after their head has been parsed.
pub(crate) struct FrameReader<R> {
    /// Underlying stream.
    inner: R,

    /// Bytes received but not yet handed out.
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create new [`FrameReader`] over `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Push `data` back so subsequent reads return it first.
    pub fn unread(&mut self, data: &[u8]) {
        let mut buffer = BytesMut::with_capacity(data.len() + self.buffer.len());
        buffer.extend_from_slice(data);
        buffer.extend_from_slice(&self.buffer);
        self.buffer = buffer;
    }

    /// Read one frame, [`SEPARATOR`] included.
    ///
    /// Returns `None` on clean end of stream; end of stream in the middle of
    /// a frame is an error.
    pub async fn read_frame(&mut self) -> crate::Result<Option<Bytes>> {
        loop {
            if let Some(at) = find_separator(&self.buffer) {
                return Ok(Some(self.buffer.split_to(at + SEPARATOR.len()).freeze()));
            }

            if self.inner.read_buf(&mut self.buffer).await? == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::from(io::ErrorKind::UnexpectedEof).into())
                };
            }
        }
    }

    /// Read up to `limit` raw bytes, draining buffered data first.
    ///
    /// An empty result means end of stream.
    pub async fn read_chunk(&mut self, limit: usize) -> crate::Result<Bytes> {
        if !self.buffer.is_empty() {
            let take = limit.min(self.buffer.len());
            return Ok(self.buffer.split_to(take).freeze());
        }

        let mut chunk = vec![0u8; limit];
        let nread = self.inner.read(&mut chunk).await?;
        chunk.truncate(nread);

        Ok(chunk.into())
    }
}

fn find_separator(buffer: &[u8]) -> Option<usize> {
    buffer.windows(SEPARATOR.len()).position(|window| window == SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn frames_split_across_reads() {
        let (mut tx, rx) = duplex(8);
        let mut reader = FrameReader::new(rx);

        tokio::spawn(async move {
            tx.write_all(b"first frame\r\n\r\nsecond\r\n\r\n").await.unwrap();
        });

        assert_eq!(
            reader.read_frame().await.unwrap().unwrap().as_ref(),
            b"first frame\r\n\r\n"
        );
        assert_eq!(
            reader.read_frame().await.unwrap().unwrap().as_ref(),
            b"second\r\n\r\n"
        );
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_frame_is_an_error() {
        let (mut tx, rx) = duplex(64);
        let mut reader = FrameReader::new(rx);

        tx.write_all(b"incomplete").await.unwrap();
        drop(tx);

        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn unread_bytes_come_back_first() {
        let (mut tx, rx) = duplex(64);
        let mut reader = FrameReader::new(rx);

        tx.write_all(b" tail").await.unwrap();
        drop(tx);

        reader.unread(b"GET example.com HTTP/1.1");

        let chunk = reader.read_chunk(1024).await.unwrap();
        assert_eq!(chunk.as_ref(), b"GET example.com HTTP/1.1");

        let chunk = reader.read_chunk(1024).await.unwrap();
        assert_eq!(chunk.as_ref(), b" tail");

        assert!(reader.read_chunk(1024).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunks_respect_limit() {
        let (mut tx, rx) = duplex(64);
        let mut reader = FrameReader::new(rx);

        tx.write_all(b"0123456789").await.unwrap();
        drop(tx);

        reader.unread(b"abcde");

        assert_eq!(reader.read_chunk(3).await.unwrap().as_ref(), b"abc");
        assert_eq!(reader.read_chunk(3).await.unwrap().as_ref(), b"de");
        assert_eq!(reader.read_chunk(4).await.unwrap().as_ref(), b"0123");
    }
}
