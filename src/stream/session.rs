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

use crate::{
    error::Error,
    event::Event,
    proto::{FrameReader, SEPARATOR},
    telemetry::Telemetry,
    tuning::StreamTuning,
};

use tokio::{
    io::AsyncWriteExt,
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    time::timeout,
};

use std::sync::Arc;

/// Logging target for the file.
const LOG_TARGET: &str = "ouija::stream::session";

/// One duplex half of a session: its read side and its write side.
pub(crate) type Half = (FrameReader<OwnedReadHalf>, OwnedWriteHalf);

/// Stream transport session.
///
/// Forwards between a plaintext stream (the accepted client on the relay,
/// the tunnel target on the proxy) and the sealed peer stream, one
/// cooperative forwarder per direction. Role-specific handshakes live with
/// the connector and the link; the forwarding core is shared verbatim.
pub(crate) struct Session {
    /// Telemetry handle.
    telemetry: Arc<Telemetry>,

    /// Session tuning.
    tuning: Arc<StreamTuning>,

    /// Whether the session has been established.
    opened: Event,

    /// Whether the session is actively forwarding.
    sync: Event,
}

impl Session {
    /// Create new [`Session`].
    pub fn new(telemetry: Arc<Telemetry>, tuning: Arc<StreamTuning>) -> Arc<Self> {
        Arc::new(Self {
            telemetry,
            tuning,
            opened: Event::new(),
            sync: Event::new(),
        })
    }

    /// Forward between `plain` and `sealed` until either direction ends.
    ///
    /// The caller bounds this with `serving_timeout` and runs
    /// [`Session::close`] afterwards.
    pub async fn run(&self, plain: Half, sealed: Half) {
        self.opened.set();
        self.telemetry.open();
        self.sync.set();

        let (mut plain_reader, mut plain_writer) = plain;
        let (mut sealed_reader, mut sealed_writer) = sealed;

        tokio::join!(
            self.forward(true, &mut plain_reader, &mut sealed_writer),
            self.forward(false, &mut sealed_reader, &mut plain_writer),
        );
    }

    /// Idempotent teardown bookkeeping.
    ///
    /// Streams are owned by the forwarders and close with them; repeated
    /// calls record the closed session exactly once.
    pub fn close(&self) {
        self.sync.clear();

        if self.opened.clear_if_set() {
            self.telemetry.close();
        }
    }

    /// One forwarding direction. `crypt` selects whether this direction
    /// seals plaintext into frames or opens frames back into plaintext.
    async fn forward(
        &self,
        crypt: bool,
        reader: &mut FrameReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) {
        let result = if crypt {
            self.seal_stream(reader, writer).await
        } else {
            self.open_stream(reader, writer).await
        };

        self.sync.clear();

        match result {
            Ok(()) => {}
            Err(Error::Io(error)) => {
                tracing::debug!(
                    target: LOG_TARGET,
                    %error,
                    crypt,
                    "connection error while forwarding",
                );
                self.telemetry.connection_error();
            }
            Err(error) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    %error,
                    crypt,
                    "failed to forward",
                );
                self.telemetry.serving_error();
            }
        }

        let _ = writer.shutdown().await;
    }

    /// Read plaintext chunks and write sealed frames.
    async fn seal_stream(
        &self,
        reader: &mut FrameReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) -> crate::Result<()> {
        while self.sync.is_set() {
            let data = match timeout(
                self.tuning.tcp_timeout,
                reader.read_chunk(self.tuning.tcp_buffer),
            )
            .await
            {
                // transient, re-check the sync flag
                Err(_) => continue,
                Ok(data) => data?,
            };

            if data.is_empty() {
                break;
            }
            self.telemetry.recv(data.len());

            let mut frame = self.tuning.codec.seal(&data);
            frame.extend_from_slice(SEPARATOR);

            writer.write_all(&frame).await?;
            self.telemetry.send(frame.len());
        }

        Ok(())
    }

    /// Read sealed frames and write plaintext.
    async fn open_stream(
        &self,
        reader: &mut FrameReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) -> crate::Result<()> {
        while self.sync.is_set() {
            let frame = match timeout(self.tuning.message_timeout, reader.read_frame()).await {
                // transient, partial frames stay buffered
                Err(_) => continue,
                Ok(frame) => frame?,
            };

            let Some(frame) = frame else {
                break;
            };
            self.telemetry.recv(frame.len());

            let sealed = frame.strip_suffix(SEPARATOR).unwrap_or(&frame);
            let data = self.tuning.codec.open(sealed)?;

            writer.write_all(&data).await?;
            self.telemetry.send(data.len());
        }

        Ok(())
    }
}
