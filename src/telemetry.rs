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

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// Monotonic counters describing endpoint activity.
///
/// Counters never influence behavior; `active` is a gauge refreshed by the
/// monitor from the session registry.
#[derive(Debug, Default)]
pub struct Telemetry {
    active: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    processing_errors: AtomicU64,
    token_errors: AtomicU64,
    type_errors: AtomicU64,
    timeout_errors: AtomicU64,
    connection_errors: AtomicU64,
    serving_errors: AtomicU64,
    resending_errors: AtomicU64,
    send_overloads: AtomicU64,
    recv_overloads: AtomicU64,
}

impl Telemetry {
    /// Record `bytes` sent in one packet.
    pub fn send(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record `bytes` received in one packet.
    pub fn recv(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record an opened session.
    pub fn open(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed session.
    pub fn close(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet that could not be processed.
    pub fn processing_error(&self) {
        self.processing_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a shared token mismatch.
    pub fn token_error(&self) {
        self.token_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet with an unknown phase.
    pub fn type_error(&self) {
        self.type_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session killed by timeout.
    pub fn timeout_error(&self) {
        self.timeout_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection error on a local stream.
    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed serving loop.
    pub fn serving_error(&self) {
        self.serving_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed retransmission loop.
    pub fn resending_error(&self) {
        self.resending_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send buffer reaching capacity.
    pub fn send_overload(&self) {
        self.send_overloads.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a receive buffer reaching capacity.
    pub fn recv_overload(&self) {
        self.recv_overloads.fetch_add(1, Ordering::Relaxed);
    }

    /// Refresh the active session gauge.
    pub fn collect(&self, active: usize) {
        self.active.store(active as u64, Ordering::Relaxed);
    }

    /// Opened sessions so far.
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Closed sessions so far.
    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    /// Send buffer overloads so far.
    pub fn send_overloads(&self) -> u64 {
        self.send_overloads.load(Ordering::Relaxed)
    }

    /// Receive buffer overloads so far.
    pub fn recv_overloads(&self) -> u64 {
        self.recv_overloads.load(Ordering::Relaxed)
    }

    /// Shared token mismatches so far.
    pub fn token_errors(&self) -> u64 {
        self.token_errors.load(Ordering::Relaxed)
    }
}

impl fmt::Display for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        write!(
            f,
            "\tactive: {}\n\
             \topened|closed: {}|{}\n\
             \tpackets sent|received: {}|{}\n\
             \tbytes sent|received: {}|{}\n\
             \tprocessing|token|type errors: {}|{}|{}\n\
             \ttimeout|connection|serving|resending errors: {}|{}|{}|{}\n\
             \tsend|recv overloads: {}|{}",
            load(&self.active),
            load(&self.opened),
            load(&self.closed),
            load(&self.packets_sent),
            load(&self.packets_received),
            load(&self.bytes_sent),
            load(&self.bytes_received),
            load(&self.processing_errors),
            load(&self.token_errors),
            load(&self.type_errors),
            load(&self.timeout_errors),
            load(&self.connection_errors),
            load(&self.serving_errors),
            load(&self.resending_errors),
            load(&self.send_overloads),
            load(&self.recv_overloads),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let telemetry = Telemetry::default();

        telemetry.send(100);
        telemetry.send(24);
        telemetry.recv(8);
        telemetry.open();
        telemetry.close();
        telemetry.collect(3);

        let rendered = telemetry.to_string();
        assert!(rendered.contains("active: 3"));
        assert!(rendered.contains("opened|closed: 1|1"));
        assert!(rendered.contains("packets sent|received: 2|1"));
        assert!(rendered.contains("bytes sent|received: 124|8"));
    }
}
