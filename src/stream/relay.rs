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
    proto::{FrameReader, Message, Request, CONNECTION_ESTABLISHED},
    registry::Registry,
    stream::session::{Half, Session},
    telemetry::Telemetry,
    tuning::StreamTuning,
};

use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    time::timeout,
};

use std::{sync::Arc, time::Duration};

/// Logging target for the file.
const LOG_TARGET: &str = "ouija::stream::relay";

/// Client-facing endpoint tunneling HTTP CONNECT over the stream transport.
pub struct Relay {
    /// Telemetry handle.
    telemetry: Arc<Telemetry>,

    /// Endpoint tuning.
    tuning: Arc<StreamTuning>,

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
        tuning: StreamTuning,
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
        match timeout(self.tuning.serving_timeout * 2, self.connect_wrapped(stream)).await {
            Err(_) => self.telemetry.timeout_error(),
            Ok(Err(error)) => {
                tracing::warn!(target: LOG_TARGET, %error, "failed to serve client");
                self.telemetry.serving_error();
            }
            Ok(Ok(())) => {}
        }
    }

    async fn connect_wrapped(&self, stream: TcpStream) -> crate::Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        let head = timeout(self.tuning.message_timeout, reader.read_frame())
            .await
            .map_err(|_| Error::Handshake("request head timed out"))??
            .ok_or(Error::Handshake("connection closed before request head"))?;

        let Some(request) = Request::parse(&head) else {
            // close the client without a reply
            tracing::warn!(target: LOG_TARGET, "failed to parse request line");
            return Ok(());
        };

        let https = request.is_connect();
        if !https {
            // plain requests are carried through the tunnel verbatim
            reader.unread(&head);
        }

        let connector = Connector {
            telemetry: Arc::clone(&self.telemetry),
            tuning: Arc::clone(&self.tuning),
            session: Session::new(Arc::clone(&self.telemetry), Arc::clone(&self.tuning)),
            registry: Arc::clone(&self.connectors),
            uid: uuid::Uuid::new_v4().simple().to_string(),
            proxy_host: self.proxy_host.clone(),
            proxy_port: self.proxy_port,
        };
        let port = request.port_or_default();
        connector
            .serve(
                (reader, write_half),
                request.host,
                port,
                https,
            )
            .await;

        Ok(())
    }
}

/// Relay-side session handler owning the outbound proxy connection.
struct Connector {
    telemetry: Arc<Telemetry>,
    tuning: Arc<StreamTuning>,
    session: Arc<Session>,
    registry: Arc<Registry<String, Session>>,
    uid: String,
    proxy_host: String,
    proxy_port: u16,
}

impl Connector {
    /// Handshake with the proxy, then forward until the session ends.
    async fn serve(self, client: Half, host: String, port: u16, https: bool) {
        let result = timeout(
            self.tuning.serving_timeout,
            self.serve_wrapped(client, &host, port, https),
        )
        .await;

        match result {
            Err(_) => self.telemetry.timeout_error(),
            Ok(Err(Error::Token)) => {
                tracing::error!(target: LOG_TARGET, "shared token mismatch");
                self.telemetry.token_error();
            }
            Ok(Err(Error::Io(error))) => {
                tracing::debug!(target: LOG_TARGET, %error, "connection error");
                self.telemetry.connection_error();
            }
            Ok(Err(error)) => {
                tracing::warn!(target: LOG_TARGET, %host, port, %error, "failed to serve tunnel");
                self.telemetry.serving_error();
            }
            Ok(Ok(())) => {}
        }

        self.session.close();
        self.registry.remove(&self.uid);
    }

    async fn serve_wrapped(
        &self,
        client: Half,
        host: &str,
        port: u16,
        https: bool,
    ) -> crate::Result<()> {
        let (client_reader, mut client_writer) = client;
        let proxy = self.handshake(&mut client_writer, host, port, https).await?;

        tracing::debug!(target: LOG_TARGET, uid = %self.uid, %host, port, "tunnel established");
        self.registry.insert(self.uid.clone(), &self.session);
        self.session.run((client_reader, client_writer), proxy).await;

        Ok(())
    }

    /// Open the proxy connection and exchange handshake records.
    async fn handshake(
        &self,
        client_writer: &mut OwnedWriteHalf,
        host: &str,
        port: u16,
        https: bool,
    ) -> crate::Result<(FrameReader<OwnedReadHalf>, OwnedWriteHalf)> {
        let stream = TcpStream::connect((self.proxy_host.as_str(), self.proxy_port)).await?;
        let (read_half, mut proxy_writer) = stream.into_split();
        let mut proxy_reader = FrameReader::new(read_half);

        let message = Message {
            token: self.tuning.token.clone(),
            host: Some(host.to_string()),
            port: Some(port),
        };
        proxy_writer.write_all(&message.encode(&self.tuning.codec)?).await?;

        let reply = timeout(self.tuning.message_timeout, proxy_reader.read_frame())
            .await
            .map_err(|_| Error::Handshake("handshake reply timed out"))??
            .ok_or(Error::Handshake("proxy closed during handshake"))?;
        let reply = Message::decode(&reply, &self.tuning.codec)?;

        if !constant_time_eq(reply.token.as_bytes(), self.tuning.token.as_bytes()) {
            return Err(Error::Token);
        }

        if https {
            client_writer.write_all(CONNECTION_ESTABLISHED).await?;
        }

        Ok((proxy_reader, proxy_writer))
    }
}
