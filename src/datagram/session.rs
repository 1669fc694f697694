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
    event::Event,
    proto::{FrameReader, Packet, CONNECTION_ESTABLISHED},
    registry::Registry,
    telemetry::Telemetry,
    tuning::DatagramTuning,
};

use rand::Rng;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream, UdpSocket,
    },
    sync::Mutex as AsyncMutex,
    task::AbortHandle,
    time::{sleep, timeout, Instant},
};

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
};

/// Logging target for the file.
const LOG_TARGET: &str = "ouija::datagram::session";

/// Retransmission queue entry.
///
/// Holds the fully encoded wire bytes so a re-send is bit-identical and the
/// codec runs exactly once per logical send.
struct Sent {
    /// Encoded wire bytes.
    data: Vec<u8>,

    /// When the entry was first sent.
    since: Instant,

    /// Sends so far.
    retries: u32,
}

/// Reorder buffer entry.
struct Received {
    /// Payload bytes.
    data: Vec<u8>,

    /// Whether the local stream should be flushed after this entry.
    drain: bool,
}

/// Outbound state: un-acked entries and the next sequence number.
struct SendQueue {
    buf: BTreeMap<u32, Sent>,
    seq: u32,
}

/// Inbound state: out-of-order entries and the next expected sequence number.
struct RecvQueue {
    buf: BTreeMap<u32, Received>,
    seq: u32,
}

/// Where the session sits and how it reaches its peer.
enum Role {
    /// Relay side. Datagrams leave through the session's own connected
    /// socket; the local stream is the accepted client connection.
    Connector {
        socket: Arc<UdpSocket>,
        registry: Arc<Registry<String, Session>>,
        uid: String,
        remote_host: String,
        remote_port: u16,
        https: bool,
    },

    /// Proxy side. Datagrams leave through the shared proxy socket towards
    /// `addr`; the local stream is opened towards the tunnel target on OPEN.
    Link {
        socket: Arc<UdpSocket>,
        registry: Arc<Registry<SocketAddr, Session>>,
        addr: SocketAddr,
    },
}

/// Reliable-ordered session between one relay connector and one proxy link.
///
/// Three cooperative tasks share the session: the serve loop reading the
/// local stream, the per-datagram processing (serialized by a session-level
/// lock) and the retransmission timer. They coordinate through the `opened`,
/// `sync`, `read_closed` and `write_closed` events.
pub(crate) struct Session {
    /// Telemetry handle.
    telemetry: Arc<Telemetry>,

    /// Session tuning.
    tuning: Arc<DatagramTuning>,

    /// Session role.
    role: Role,

    /// Local stream read half, taken by the serve loop.
    reader: Mutex<Option<FrameReader<OwnedReadHalf>>>,

    /// Local stream write half, written by the processing task.
    writer: AsyncMutex<Option<OwnedWriteHalf>>,

    /// Outbound queue.
    sent: Mutex<SendQueue>,

    /// Inbound queue.
    recv: Mutex<RecvQueue>,

    /// Serializes packet processing.
    process_lock: AsyncMutex<()>,

    /// Whether the session has been established.
    opened: Event,

    /// Whether the session is actively forwarding.
    sync: Event,

    /// Whether the peer acknowledged our CLOSE: it expects no more data.
    read_closed: Event,

    /// Whether the peer sent CLOSE: nothing further is written locally.
    write_closed: Event,

    /// Receive task on the connector's own socket.
    receiver: Mutex<Option<AbortHandle>>,

    /// Weak handle to the session itself, used to hand owning references to
    /// the tasks it spawns.
    handle: Weak<Session>,
}

impl Session {
    /// Create new relay-side [`Session`] over the accepted client stream.
    #[allow(clippy::too_many_arguments)]
    pub fn connector(
        telemetry: Arc<Telemetry>,
        tuning: Arc<DatagramTuning>,
        socket: Arc<UdpSocket>,
        registry: Arc<Registry<String, Session>>,
        remote_host: String,
        remote_port: u16,
        https: bool,
        reader: FrameReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) -> Arc<Self> {
        Arc::new_cyclic(|handle| Self {
            telemetry,
            tuning,
            role: Role::Connector {
                socket,
                registry,
                uid: uuid::Uuid::new_v4().simple().to_string(),
                remote_host,
                remote_port,
                https,
            },
            reader: Mutex::new(Some(reader)),
            writer: AsyncMutex::new(Some(writer)),
            sent: Mutex::new(SendQueue {
                buf: BTreeMap::new(),
                seq: 0,
            }),
            recv: Mutex::new(RecvQueue {
                buf: BTreeMap::new(),
                seq: 0,
            }),
            process_lock: AsyncMutex::new(()),
            opened: Event::new(),
            sync: Event::new(),
            read_closed: Event::new(),
            write_closed: Event::new(),
            receiver: Mutex::new(None),
            handle: handle.clone(),
        })
    }

    /// Create new proxy-side [`Session`] for the peer at `addr`.
    ///
    /// The local stream stays unopened until a valid OPEN arrives.
    pub fn link(
        telemetry: Arc<Telemetry>,
        tuning: Arc<DatagramTuning>,
        socket: Arc<UdpSocket>,
        registry: Arc<Registry<SocketAddr, Session>>,
        addr: SocketAddr,
    ) -> Arc<Self> {
        Arc::new_cyclic(|handle| Self {
            telemetry,
            tuning,
            role: Role::Link {
                socket,
                registry,
                addr,
            },
            reader: Mutex::new(None),
            writer: AsyncMutex::new(None),
            sent: Mutex::new(SendQueue {
                buf: BTreeMap::new(),
                seq: 0,
            }),
            recv: Mutex::new(RecvQueue {
                buf: BTreeMap::new(),
                seq: 0,
            }),
            process_lock: AsyncMutex::new(()),
            opened: Event::new(),
            sync: Event::new(),
            read_closed: Event::new(),
            write_closed: Event::new(),
            receiver: Mutex::new(None),
            handle: handle.clone(),
        })
    }

    /// Remember the connector's receive task so teardown can stop it.
    pub fn attach_receiver(&self, handle: AbortHandle) {
        *self.receiver.lock().expect("to lock receiver") = Some(handle);
    }

    /// Send one raw datagram towards the peer.
    async fn send(&self, data: &[u8]) -> crate::Result<()> {
        match &self.role {
            Role::Connector { socket, .. } => {
                socket.send(data).await?;
            }
            Role::Link { socket, addr, .. } => {
                socket.send_to(data, *addr).await?;
            }
        }
        self.telemetry.send(data.len());

        Ok(())
    }

    /// Encode and send `packet`, returning the wire bytes.
    async fn send_packet(&self, packet: &Packet) -> crate::Result<Vec<u8>> {
        let data = packet.encode(&self.tuning.codec)?;
        self.send(&data).await?;

        Ok(data)
    }

    /// Send a control packet until `event` is set or retries run out.
    async fn send_retry(&self, packet: &Packet, event: &Event) -> crate::Result<()> {
        for _ in 0..self.tuning.udp_retries {
            self.send_packet(packet).await?;

            if timeout(self.tuning.udp_timeout, event.wait()).await.is_ok() {
                return Ok(());
            }
        }

        Err(Error::SendRetry)
    }

    /// Whether `token` matches the shared secret.
    fn token_matches(&self, token: &str) -> bool {
        constant_time_eq(token.as_bytes(), self.tuning.token.as_bytes())
    }

    /// Decode and handle one datagram.
    ///
    /// Per-packet errors only drop the packet; token mismatches, buffer
    /// overloads, connection errors and unexpected failures tear the
    /// session down.
    pub async fn process(&self, data: &[u8]) {
        self.telemetry.recv(data.len());

        let result = {
            let _guard = self.process_lock.lock().await;
            self.process_packet(data).await
        };

        match result {
            Ok(()) => {}
            Err(Error::Cipher) | Err(Error::Malformed) => self.telemetry.processing_error(),
            Err(Error::Phase(phase)) => {
                tracing::trace!(target: LOG_TARGET, phase, "dropping packet with unknown phase");
                self.telemetry.type_error();
            }
            Err(Error::Token) => {
                // no reply: the peer may be probing
                tracing::error!(target: LOG_TARGET, "shared token mismatch");
                self.telemetry.token_error();
                self.close().await;
            }
            Err(Error::Overload) => self.close().await,
            Err(Error::Io(error)) => {
                tracing::debug!(target: LOG_TARGET, %error, "connection error");
                self.telemetry.connection_error();
                self.close().await;
            }
            Err(error) => {
                tracing::warn!(target: LOG_TARGET, %error, "failed to process packet");
                self.telemetry.processing_error();
                self.close().await;
            }
        }
    }

    async fn process_packet(&self, data: &[u8]) -> crate::Result<()> {
        match Packet::decode(data, &self.tuning.codec)? {
            Packet::Open {
                ack,
                token,
                host,
                port,
            } => self.on_open(ack, &token, host, port).await,
            Packet::Data {
                ack,
                seq,
                data,
                drain,
            } => {
                if !self.opened.is_set() {
                    return Ok(());
                }

                if ack {
                    self.sent.lock().expect("to lock send queue").buf.remove(&seq);
                    return Ok(());
                }

                // every DATA is acknowledged immediately, duplicates included
                self.send_packet(&Packet::Data {
                    ack: true,
                    seq,
                    data: None,
                    drain: None,
                })
                .await?;

                if self.write_closed.is_set() {
                    return Ok(());
                }

                self.recv_data(seq, data.unwrap_or_default(), drain.unwrap_or(false)).await
            }
            Packet::Close { ack } => {
                if !self.opened.is_set() {
                    return Ok(());
                }

                if ack {
                    self.read_closed.set();
                } else {
                    self.write_closed.set();
                    self.send_packet(&Packet::Close { ack: true }).await?;
                }

                Ok(())
            }
        }
    }

    /// Handle an OPEN packet according to the session role.
    async fn on_open(
        &self,
        ack: bool,
        token: &str,
        host: Option<String>,
        port: Option<u16>,
    ) -> crate::Result<()> {
        if !self.token_matches(token) {
            return Err(Error::Token);
        }

        match &self.role {
            Role::Connector {
                registry,
                uid,
                https,
                ..
            } => {
                if !ack || self.opened.is_set() {
                    return Ok(());
                }

                if *https {
                    let mut writer = self.writer.lock().await;
                    if let Some(writer) = writer.as_mut() {
                        writer.write_all(CONNECTION_ESTABLISHED).await?;
                    }
                }

                self.opened.set();
                if let Some(session) = self.handle.upgrade() {
                    registry.insert(uid.clone(), &session);
                }
                self.telemetry.open();

                Ok(())
            }
            Role::Link {
                registry, addr, ..
            } => {
                if ack {
                    return Ok(());
                }

                let ack_packet = Packet::Open {
                    ack: true,
                    token: self.tuning.token.clone(),
                    host: None,
                    port: None,
                };

                if self.opened.is_set() {
                    // duplicate OPEN, the first acknowledgement was lost
                    self.send_packet(&ack_packet).await?;
                    return Ok(());
                }

                let host = host.ok_or(Error::Handshake("open packet missing target host"))?;
                let port = port.ok_or(Error::Handshake("open packet missing target port"))?;

                let stream = TcpStream::connect((host.as_str(), port)).await?;
                tracing::debug!(target: LOG_TARGET, %host, port, "opened tunnel target");

                let (read_half, write_half) = stream.into_split();
                *self.reader.lock().expect("to lock reader") = Some(FrameReader::new(read_half));
                *self.writer.lock().await = Some(write_half);

                self.opened.set();
                self.telemetry.open();

                if let Some(session) = self.handle.upgrade() {
                    registry.insert(*addr, &session);

                    // links are supervised like every other session task
                    let serving_timeout = self.tuning.serving_timeout;
                    tokio::spawn(async move {
                        if timeout(serving_timeout * 2, session.serve()).await.is_err() {
                            session.telemetry.timeout_error();
                            session.close().await;
                        }
                    });
                }
                self.send_packet(&ack_packet).await?;

                Ok(())
            }
        }
    }

    /// Acknowledge, reorder and flush one DATA payload.
    async fn recv_data(&self, seq: u32, data: Vec<u8>, drain: bool) -> crate::Result<()> {
        {
            let mut recv = self.recv.lock().expect("to lock receive queue");
            // duplicates of already flushed entries are dropped
            if seq >= recv.seq {
                recv.buf.insert(seq, Received { data, drain });
            }
        }

        let mut writer = self.writer.lock().await;
        loop {
            let received = {
                let mut recv = self.recv.lock().expect("to lock receive queue");
                let seq = recv.seq;
                match recv.buf.remove(&seq) {
                    Some(received) => {
                        recv.seq += 1;
                        received
                    }
                    None => break,
                }
            };

            let Some(writer) = writer.as_mut() else {
                break;
            };
            writer.write_all(&received.data).await?;
            if received.drain {
                writer.flush().await?;
            }
        }
        drop(writer);

        if self.recv.lock().expect("to lock receive queue").buf.len() >= self.tuning.udp_capacity {
            self.telemetry.recv_overload();
            return Err(Error::Overload);
        }

        Ok(())
    }

    /// Assign the next sequence number to `data`, send it and keep the wire
    /// bytes for retransmission.
    async fn enqueue_send(&self, data: Vec<u8>, drain: bool) -> crate::Result<()> {
        let seq = {
            let mut sent = self.sent.lock().expect("to lock send queue");
            let seq = sent.seq;
            sent.seq += 1;
            seq
        };

        let packet = Packet::Data {
            ack: false,
            seq,
            data: Some(data),
            drain: Some(drain),
        };
        let encoded = self.send_packet(&packet).await?;

        let overloaded = {
            let mut sent = self.sent.lock().expect("to lock send queue");
            sent.buf.insert(
                seq,
                Sent {
                    data: encoded,
                    since: Instant::now(),
                    retries: 1,
                },
            );
            sent.buf.len() >= self.tuning.udp_capacity
        };

        if overloaded {
            self.telemetry.send_overload();
            return Err(Error::Overload);
        }

        Ok(())
    }

    /// Split one read burst into sized chunks, `drain` set on the last.
    async fn enqueue_chunks(&self, data: &[u8]) -> crate::Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let size = if self.tuning.udp_min_payload == self.tuning.udp_max_payload {
                self.tuning.udp_min_payload
            } else {
                rand::thread_rng().gen_range(self.tuning.udp_min_payload..=self.tuning.udp_max_payload)
            };

            let end = (offset + size).min(data.len());
            self.enqueue_send(data[offset..end].to_vec(), end == data.len()).await?;
            offset = end;
        }

        Ok(())
    }

    /// Role-specific establishment run before the serve loop.
    async fn on_serve(&self) -> crate::Result<()> {
        let Role::Connector {
            remote_host,
            remote_port,
            ..
        } = &self.role
        else {
            return Ok(());
        };

        let packet = Packet::Open {
            ack: false,
            token: self.tuning.token.clone(),
            host: Some(remote_host.clone()),
            port: Some(*remote_port),
        };

        self.send_retry(&packet, &self.opened).await
    }

    /// Serve the local stream until it ends, bounded by `serving_timeout`.
    pub async fn serve(&self) {
        match timeout(self.tuning.serving_timeout, self.serve_wrapped()).await {
            Err(_) => self.telemetry.timeout_error(),
            Ok(Err(Error::Io(error))) => {
                tracing::debug!(target: LOG_TARGET, %error, "connection error");
                self.telemetry.connection_error();
            }
            // the overload counters are recorded at the buffers
            Ok(Err(Error::Overload)) => {}
            Ok(Err(error)) => {
                tracing::warn!(target: LOG_TARGET, %error, "failed to serve");
                self.telemetry.serving_error();
            }
            Ok(Ok(())) => {}
        }

        self.close().await;
    }

    async fn serve_wrapped(&self) -> crate::Result<()> {
        self.on_serve().await?;

        let Some(mut reader) = self.reader.lock().expect("to lock reader").take() else {
            return Err(Error::Handshake("local stream not open"));
        };

        self.sync.set();
        if let Some(session) = self.handle.upgrade() {
            tokio::spawn(async move { session.resend().await });
        }

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

            self.enqueue_chunks(&data).await?;
        }
        self.sync.clear();

        Ok(())
    }

    /// Retransmission timer, one per session.
    ///
    /// Runs until the serve loop has ended and the send queue has drained,
    /// then tears the session down.
    async fn resend(&self) {
        match timeout(self.tuning.serving_timeout, self.resend_wrapped()).await {
            Err(_) => self.telemetry.timeout_error(),
            Ok(Err(error)) => {
                tracing::warn!(target: LOG_TARGET, %error, "failed to resend");
                self.telemetry.resending_error();
            }
            Ok(Ok(())) => {}
        }

        self.close().await;
    }

    async fn resend_wrapped(&self) -> crate::Result<()> {
        let lifetime = self.tuning.udp_timeout * self.tuning.udp_retries;

        loop {
            {
                let sent = self.sent.lock().expect("to lock send queue");
                if !self.sync.is_set() && sent.buf.is_empty() {
                    break;
                }
            }

            sleep(self.tuning.udp_resend_sleep).await;

            let now = Instant::now();
            let mut stale = 0usize;
            let mut pending = Vec::new();
            {
                let mut sent = self.sent.lock().expect("to lock send queue");
                sent.buf.retain(|_, entry| {
                    let age = now.saturating_duration_since(entry.since);
                    if age >= lifetime {
                        stale += 1;
                        return false;
                    }

                    if age >= self.tuning.udp_timeout * entry.retries {
                        entry.retries += 1;
                        pending.push(entry.data.clone());
                    }

                    true
                });
            }

            if stale > 0 {
                tracing::trace!(target: LOG_TARGET, stale, "discarded expired entries");
            }
            for data in pending {
                self.send(&data).await?;
            }
        }

        self.sync.clear();

        Ok(())
    }

    /// Idempotent teardown, safe to race from the serve loop, the
    /// retransmission timer, packet processing and the supervisor.
    pub async fn close(&self) {
        self.sync.clear();
        self.read_close().await;
        self.write_close().await;

        if self.opened.clear_if_set() {
            self.telemetry.close();
        }

        self.on_close();
    }

    /// Announce that no more data will be sent: drain the send queue, then
    /// exchange CLOSE.
    async fn read_close(&self) {
        if self.read_closed.is_set() {
            return;
        }

        // entries not acknowledged within their lifetime are discarded by
        // the retransmission timer, so the wait is bounded
        let lifetime = self.tuning.udp_timeout * self.tuning.udp_retries;
        let _ = timeout(lifetime, self.drained()).await;

        if self.opened.is_set() {
            let _ = self.send_retry(&Packet::Close { ack: false }, &self.read_closed).await;
        }
        self.read_closed.set();
    }

    async fn drained(&self) {
        loop {
            if self.sent.lock().expect("to lock send queue").buf.is_empty() {
                break;
            }

            sleep(self.tuning.udp_resend_sleep).await;
        }
    }

    /// Wait for the peer to finish flushing, then close the local stream.
    async fn write_close(&self) {
        if !self.write_closed.is_set() {
            let _ = timeout(self.tuning.serving_timeout, self.write_closed.wait()).await;
            self.write_closed.set();
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    /// Remove the session from its dispatch table and stop the receiver.
    fn on_close(&self) {
        match &self.role {
            Role::Connector { registry, uid, .. } => {
                registry.remove(uid);

                if let Some(receiver) = self.receiver.lock().expect("to lock receiver").take() {
                    receiver.abort();
                }
            }
            Role::Link { registry, addr, .. } => registry.remove(addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    fn tuning(capacity: usize) -> Arc<DatagramTuning> {
        Arc::new(DatagramTuning {
            codec: Codec::cleartext(),
            token: String::from("secret"),
            serving_timeout: Duration::from_secs(2),
            tcp_buffer: 16,
            tcp_timeout: Duration::from_millis(50),
            message_timeout: Duration::from_millis(500),
            udp_min_payload: 4,
            udp_max_payload: 4,
            udp_timeout: Duration::from_millis(200),
            udp_retries: 3,
            udp_capacity: capacity,
            udp_resend_sleep: Duration::from_millis(20),
        })
    }

    /// Connector session whose local stream is a loopback TCP connection
    /// and whose peer is a plain socket the test drives by hand.
    async fn harness(capacity: usize) -> (Arc<Session>, UdpSocket, TcpStream, Arc<Telemetry>) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(peer.local_addr().unwrap()).await.unwrap();
        peer.connect(socket.local_addr().unwrap()).await.unwrap();
        let socket = Arc::new(socket);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (local, _) = listener.accept().await.unwrap();

        let telemetry = Arc::new(Telemetry::default());
        let (read_half, write_half) = local.into_split();
        let session = Session::connector(
            Arc::clone(&telemetry),
            tuning(capacity),
            Arc::clone(&socket),
            Registry::new(),
            String::from("example.com"),
            443,
            true,
            FrameReader::new(read_half),
            write_half,
        );

        let receiver = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                let mut buffer = vec![0u8; 65536];
                while let Ok(nread) = socket.recv(&mut buffer).await {
                    session.process(&buffer[..nread]).await;
                }
            }
        });
        session.attach_receiver(receiver.abort_handle());

        (session, peer, client, telemetry)
    }

    async fn recv_packet(peer: &UdpSocket) -> Packet {
        let mut buffer = vec![0u8; 65536];
        let nread = peer.recv(&mut buffer).await.unwrap();

        Packet::decode(&buffer[..nread], &Codec::cleartext()).unwrap()
    }

    async fn send_packet(peer: &UdpSocket, packet: &Packet) {
        peer.send(&packet.encode(&Codec::cleartext()).unwrap()).await.unwrap();
    }

    fn open_ack() -> Packet {
        Packet::Open {
            ack: true,
            token: String::from("secret"),
            host: None,
            port: None,
        }
    }

    #[tokio::test]
    async fn data_is_chunked_and_sequenced() {
        use tokio::io::AsyncWriteExt as _;

        let (session, peer, mut client, _telemetry) = harness(64).await;

        let serving = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.serve().await }
        });

        // handshake
        let Packet::Open { ack: false, token, host, port } = recv_packet(&peer).await else {
            panic!("expected open");
        };
        assert_eq!(token, "secret");
        assert_eq!(host.as_deref(), Some("example.com"));
        assert_eq!(port, Some(443));
        send_packet(&peer, &open_ack()).await;

        // the tunnel reply reaches the client
        let mut established = vec![0u8; CONNECTION_ESTABLISHED.len()];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut established).await.unwrap();
        assert_eq!(established, CONNECTION_ESTABLISHED);

        // ten bytes come out as three DATA packets, drain on the last
        client.write_all(b"abcdefghij").await.unwrap();

        let mut flushed = Vec::new();
        for expected_seq in 0u32..3 {
            let Packet::Data { ack: false, seq, data, drain } = recv_packet(&peer).await else {
                panic!("expected data");
            };
            assert_eq!(seq, expected_seq);
            assert_eq!(drain, Some(expected_seq == 2));
            flushed.extend_from_slice(&data.unwrap());

            send_packet(
                &peer,
                &Packet::Data {
                    ack: true,
                    seq,
                    data: None,
                    drain: None,
                },
            )
            .await;
        }
        assert_eq!(flushed, b"abcdefghij");

        // half-close: client EOF drains into CLOSE
        drop(client);
        let Packet::Close { ack: false } = recv_packet(&peer).await else {
            panic!("expected close");
        };
        send_packet(&peer, &Packet::Close { ack: true }).await;
        send_packet(&peer, &Packet::Close { ack: false }).await;

        serving.await.unwrap();
    }

    #[tokio::test]
    async fn unacked_data_is_retransmitted() {
        use tokio::io::AsyncWriteExt as _;

        let (session, peer, mut client, _telemetry) = harness(64).await;

        tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.serve().await }
        });

        let Packet::Open { ack: false, .. } = recv_packet(&peer).await else {
            panic!("expected open");
        };
        send_packet(&peer, &open_ack()).await;

        client.write_all(b"data").await.unwrap();

        // first copy and two retransmissions spaced by the timeout
        let started = Instant::now();
        for round in 0u32..3 {
            let Packet::Data { ack: false, seq: 0, .. } = recv_packet(&peer).await else {
                panic!("expected data");
            };

            let elapsed = started.elapsed();
            let expected = tuning(64).udp_timeout * round;
            assert!(elapsed >= expected, "round {round} arrived after {elapsed:?}");
        }

        send_packet(
            &peer,
            &Packet::Data {
                ack: true,
                seq: 0,
                data: None,
                drain: None,
            },
        )
        .await;
        session.close().await;
    }

    #[tokio::test]
    async fn blackholed_acks_shed_the_session() {
        use tokio::io::AsyncWriteExt as _;

        let (session, peer, mut client, telemetry) = harness(4).await;

        let serving = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.serve().await }
        });

        let Packet::Open { ack: false, .. } = recv_packet(&peer).await else {
            panic!("expected open");
        };
        send_packet(&peer, &open_ack()).await;

        // five chunks of payload with every acknowledgement blackholed
        client.write_all(b"aaaabbbbccccddddeeee").await.unwrap();

        serving.await.unwrap();
        assert_eq!(telemetry.send_overloads(), 1);
        assert_eq!(telemetry.closed(), 1);

        // the local stream is closed
        let mut buffer = Vec::new();
        let _ = tokio::io::AsyncReadExt::read_to_end(&mut client, &mut buffer).await;
    }

    #[tokio::test]
    async fn out_of_order_data_is_reordered() {
        use tokio::io::AsyncReadExt as _;

        let (session, peer, mut client, _telemetry) = harness(64).await;

        tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.serve().await }
        });

        let Packet::Open { ack: false, .. } = recv_packet(&peer).await else {
            panic!("expected open");
        };
        send_packet(&peer, &open_ack()).await;

        // skip the tunnel reply
        let mut established = vec![0u8; CONNECTION_ESTABLISHED.len()];
        client.read_exact(&mut established).await.unwrap();

        for (seq, data) in [(1u32, &b"world"[..]), (0u32, &b"hello "[..])] {
            send_packet(
                &peer,
                &Packet::Data {
                    ack: false,
                    seq,
                    data: Some(data.to_vec()),
                    drain: Some(true),
                },
            )
            .await;
        }

        let mut delivered = vec![0u8; 11];
        client.read_exact(&mut delivered).await.unwrap();
        assert_eq!(delivered, b"hello world");

        session.close().await;
    }

    #[tokio::test]
    async fn wrong_token_is_fatal_without_reply() {
        let (session, peer, _client, telemetry) = harness(64).await;

        tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.serve().await }
        });

        let Packet::Open { ack: false, .. } = recv_packet(&peer).await else {
            panic!("expected open");
        };

        send_packet(
            &peer,
            &Packet::Open {
                ack: true,
                token: String::from("other"),
                host: None,
                port: None,
            },
        )
        .await;

        // only OPEN retransmissions ever arrive, never a reply to the ack
        let Packet::Open { ack: false, .. } = recv_packet(&peer).await else {
            panic!("expected open retransmission");
        };

        // the mismatch is recorded once the packet is processed
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(telemetry.token_errors(), 1);
    }

    #[tokio::test]
    async fn duplicate_data_is_acked_but_dropped() {
        use tokio::io::AsyncReadExt as _;

        let (session, peer, mut client, _telemetry) = harness(64).await;

        tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.serve().await }
        });

        let Packet::Open { ack: false, .. } = recv_packet(&peer).await else {
            panic!("expected open");
        };
        send_packet(&peer, &open_ack()).await;

        let mut established = vec![0u8; CONNECTION_ESTABLISHED.len()];
        client.read_exact(&mut established).await.unwrap();

        let data = Packet::Data {
            ack: false,
            seq: 0,
            data: Some(b"once".to_vec()),
            drain: Some(true),
        };
        send_packet(&peer, &data).await;
        send_packet(&peer, &data).await;

        // both copies are acknowledged
        for _ in 0..2 {
            let Packet::Data { ack: true, seq: 0, .. } = recv_packet(&peer).await else {
                panic!("expected data ack");
            };
        }

        // but the payload is delivered once
        let mut delivered = vec![0u8; 4];
        client.read_exact(&mut delivered).await.unwrap();
        assert_eq!(delivered, b"once");

        let pending = client.try_read(&mut [0u8; 16]);
        assert!(!matches!(pending, Ok(n) if n > 0));

        session.close().await;
    }
}
