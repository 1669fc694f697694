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
    datagram::session::Session, registry::Registry, telemetry::Telemetry, tuning::DatagramTuning,
};

use tokio::net::UdpSocket;

use std::{sync::Arc, time::Duration};

/// Logging target for the file.
const LOG_TARGET: &str = "ouija::datagram::proxy";

/// Egress endpoint terminating the reliable datagram transport and opening
/// the real upstream connections.
///
/// One socket is shared by every link; inbound datagrams are demultiplexed
/// by peer address. A datagram from an unknown peer gets a fresh session
/// which registers itself only once a valid OPEN arrives, so probes never
/// occupy the dispatch table.
pub struct Proxy {
    /// Telemetry handle.
    telemetry: Arc<Telemetry>,

    /// Endpoint tuning.
    tuning: Arc<DatagramTuning>,

    /// Egress bind host.
    proxy_host: String,

    /// Egress bind port.
    proxy_port: u16,

    /// Live links, keyed by peer address.
    links: Arc<Registry<std::net::SocketAddr, Session>>,
}

impl Proxy {
    /// Create new [`Proxy`].
    pub fn new(
        telemetry: Arc<Telemetry>,
        tuning: DatagramTuning,
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

    /// Egress entry point: demultiplex datagrams until the socket fails.
    pub async fn serve(self: Arc<Self>) -> crate::Result<()> {
        let socket =
            Arc::new(UdpSocket::bind((self.proxy_host.as_str(), self.proxy_port)).await?);
        tracing::info!(
            target: LOG_TARGET,
            host = %self.proxy_host,
            port = self.proxy_port,
            "serve datagram egress",
        );

        let mut buffer = vec![0u8; 65536];
        loop {
            let (nread, address) = socket.recv_from(&mut buffer).await?;

            let session = match self.links.get(&address) {
                Some(session) => session,
                None => {
                    tracing::trace!(target: LOG_TARGET, %address, "new peer");
                    Session::link(
                        Arc::clone(&self.telemetry),
                        Arc::clone(&self.tuning),
                        Arc::clone(&socket),
                        Arc::clone(&self.links),
                        address,
                    )
                }
            };

            // sessions process independently so one stalled link never
            // holds up the demux loop
            let data = buffer[..nread].to_vec();
            tokio::spawn(async move { session.process(&data).await });
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
}
