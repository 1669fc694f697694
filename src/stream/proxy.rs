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
    codec::constant_time_eq,
    error::Error,
    proto::{FrameReader, Message},
    registry::Registry,
    stream::session::Session,
    telemetry::Telemetry,
    tuning::StreamTuning,
};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    time::timeout,
};

use std::{sync::Arc, time::Duration};

/// Logging target for the file.
const LOG_TARGET: &str = "ouija::stream::proxy";

/// Egress endpoint terminating the stream transport and opening the real
/// upstream connections.
pub struct Proxy {
    /// Telemetry handle.
    telemetry: Arc<Telemetry>,

    /// Endpoint tuning.
    tuning: Arc<StreamTuning>,

    /// Egress bind host.
    proxy_host: String,

    /// Egress bind port.
    proxy_port: u16,

    /// Live links, keyed by uid.
    links: Arc<Registry<String, Session>>,
}

impl Proxy {
    /// Create new [`Proxy`].
    pub fn new(
        telemetry: Arc<Telemetry>,
        tuning: StreamTuning,
        proxy_host: String,
        proxy_port: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            telemetry,
            tuning: Arc::new(tuning),
            proxy_host,
            proxy_port,
            links: Registry::new(),
        })
    }

    /// Egress entry point: accept relay connections until the listener fails.
    pub async fn serve(self: Arc<Self>) -> crate::Result<()> {
        let listener = TcpListener::bind((self.proxy_host.as_str(), self.proxy_port)).await?;
        tracing::info!(
            target: LOG_TARGET,
            host = %self.proxy_host,
            port = self.proxy_port,
            "serve stream egress",
        );

        loop {
            let (stream, address) = listener.accept().await?;
            tracing::trace!(target: LOG_TARGET, %address, "accepted relay connection");

            let proxy = Arc::clone(&self);
            tokio::spawn(async move { proxy.link(stream).await });
        }
    }

    /// Number of live links.
    pub fn active(&self) -> usize {
        self.links.active()
    }

    /// Telemetry dump loop.
    pub async fn monitor(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.telemetry.collect(self.active());
            tracing::info!(target: LOG_TARGET, "telemetry\n{}", self.telemetry);
        }
    }

    /// Serve one relay connection, bounded by twice the serving timeout.
    async fn link(self: Arc<Self>, stream: TcpStream) {
        let session = Session::new(Arc::clone(&self.telemetry), Arc::clone(&self.tuning));
        let uid = uuid::Uuid::new_v4().simple().to_string();

        let result = timeout(
            self.tuning.serving_timeout * 2,
            self.link_wrapped(stream, &session, &uid),
        )
        .await;

        match result {
            Err(_) => self.telemetry.timeout_error(),
            Ok(Err(Error::Token)) => {
                // no reply: the peer may be probing
                tracing::error!(target: LOG_TARGET, "shared token mismatch");
                self.telemetry.token_error();
            }
            Ok(Err(Error::Io(error))) => {
                tracing::debug!(target: LOG_TARGET, %error, "connection error");
                self.telemetry.connection_error();
            }
            Ok(Err(error)) => {
                tracing::warn!(target: LOG_TARGET, %error, "failed to serve link");
                self.telemetry.serving_error();
            }
            Ok(Ok(())) => {}
        }

        session.close();
        self.links.remove(&uid);
    }

    async fn link_wrapped(
        &self,
        stream: TcpStream,
        session: &Arc<Session>,
        uid: &str,
    ) -> crate::Result<()> {
        let (read_half, mut relay_writer) = stream.into_split();
        let mut relay_reader = FrameReader::new(read_half);

        let record = timeout(self.tuning.message_timeout, relay_reader.read_frame())
            .await
            .map_err(|_| Error::Handshake("handshake record timed out"))??
            .ok_or(Error::Handshake("relay closed during handshake"))?;
        let message = Message::decode(&record, &self.tuning.codec)?;

        if !constant_time_eq(message.token.as_bytes(), self.tuning.token.as_bytes()) {
            return Err(Error::Token);
        }

        let host = message.host.ok_or(Error::Handshake("record missing target host"))?;
        let port = message.port.ok_or(Error::Handshake("record missing target port"))?;

        let target = TcpStream::connect((host.as_str(), port)).await?;
        tracing::debug!(target: LOG_TARGET, %host, port, "opened tunnel target");

        let reply = Message {
            token: self.tuning.token.clone(),
            host: None,
            port: None,
        };
        relay_writer.write_all(&reply.encode(&self.tuning.codec)?).await?;

        self.links.insert(uid.to_string(), session);

        let (target_read, target_write) = target.into_split();
        session
            .run(
                (FrameReader::new(target_read), target_write),
                (relay_reader, relay_writer),
            )
            .await;

        Ok(())
    }
}
