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
    datagram::session::Session,
    error::Error,
    proto::{FrameReader, Request},
    registry::Registry,
    telemetry::Telemetry,
    tuning::DatagramTuning,
};

use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    time::timeout,
};

use std::{sync::Arc, time::Duration};

/// Logging target for the file.
const LOG_TARGET: &str = "ouija::datagram::relay";

/// Client-facing endpoint tunneling HTTP CONNECT over the reliable datagram
/// transport.
pub struct Relay {
    /// Telemetry handle.
    telemetry: Arc<Telemetry>,

    /// Endpoint tuning.
    tuning: Arc<DatagramTuning>,

    /// Ingress bind host.
    relay_host: String,

    /// Ingress bind port.
    relay_port: u16,

    /// Proxy endpoint host.
    proxy_host: String,

    /// Proxy endpoint port.
    proxy_port: u16,

    /// Live connectors, keyed by uid.
    connectors: Arc<Registry<String, Session>>,
}

impl Relay {
    /// Create new [`Relay`].
    pub fn new(
        telemetry: Arc<Telemetry>,
        tuning: DatagramTuning,
        relay_host: String,
        relay_port: u16,
        proxy_host: String,
        proxy_port: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            telemetry,
            tuning: Arc::new(tuning),
            relay_host,
            relay_port,
            proxy_host,
            proxy_port,
            connectors: Registry::new(),
        })
    }

    /// Ingress entry point: accept clients until the listener fails.
    pub async fn serve(self: Arc<Self>) -> crate::Result<()> {
        let listener = TcpListener::bind((self.relay_host.as_str(), self.relay_port)).await?;
        tracing::info!(
            target: LOG_TARGET,
            host = %self.relay_host,
            port = self.relay_port,
            "serve http ingress",
        );

        loop {
            let (stream, address) = listener.accept().await?;
            tracing::trace!(target: LOG_TARGET, %address, "accepted client");

            let relay = Arc::clone(&self);
            tokio::spawn(async move { relay.connect(stream).await });
        }
    }

    /// Number of live connectors.
    pub fn active(&self) -> usize {
        self.connectors.active()
    }

    /// Telemetry dump loop.
    pub async fn monitor(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.telemetry.collect(self.active());
            tracing::info!(target: LOG_TARGET, "telemetry\n{}", self.telemetry);
        }
    }

    /// Serve one accepted client, bounded by twice the serving timeout.
    async fn connect(self: Arc<Self>, stream: TcpStream) {
        let session = match self.prepare(stream).await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(target: LOG_TARGET, %error, "failed to serve client");
                self.telemetry.serving_error();
                return;
            }
        };

        if timeout(self.tuning.serving_timeout * 2, session.serve()).await.is_err() {
            self.telemetry.timeout_error();
            session.close().await;
        }
    }

    /// Parse the request head and set the session up, receive task included.
    async fn prepare(&self, stream: TcpStream) -> crate::Result<Option<Arc<Session>>> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        let head = timeout(self.tuning.message_timeout, reader.read_frame())
            .await
            .map_err(|_| Error::Handshake("request head timed out"))??
            .ok_or(Error::Handshake("connection closed before request head"))?;

        let Some(request) = Request::parse(&head) else {
            // close the client without a reply
            tracing::warn!(target: LOG_TARGET, "failed to parse request line");
            return Ok(None);
        };

        let https = request.is_connect();
        if !https {
            // plain requests are carried through the tunnel verbatim
            reader.unread(&head);
        }

        // each connector speaks through its own ephemeral socket
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((self.proxy_host.as_str(), self.proxy_port)).await?;
        let socket = Arc::new(socket);

        let port = request.port_or_default();
        let session = Session::connector(
            Arc::clone(&self.telemetry),
            Arc::clone(&self.tuning),
            Arc::clone(&socket),
            Arc::clone(&self.connectors),
            request.host,
            port,
            https,
            reader,
            write_half,
        );

        let receiver = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                let mut buffer = vec![0u8; 65536];
                loop {
                    match socket.recv(&mut buffer).await {
                        Ok(nread) => session.process(&buffer[..nread]).await,
                        Err(error) => {
                            tracing::debug!(target: LOG_TARGET, %error, "datagram socket closed");
                            break;
                        }
                    }
                }
            }
        });
        session.attach_receiver(receiver.abort_handle());

        Ok(Some(session))
    }
}
