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
    codec::{Cipher, Codec, Entropy, Fernet, Plain, SimpleEntropy},
    config::Config,
    error::Error,
};

use std::{sync::Arc, time::Duration};

/// Stream engine tuning, shared by every session of an endpoint.
pub struct StreamTuning {
    /// Wire record transform.
    pub codec: Codec,

    /// Shared secret.
    pub token: String,

    /// Wall-clock bound on one session.
    pub serving_timeout: Duration,

    /// Local stream read size.
    pub tcp_buffer: usize,

    /// Local stream read deadline, not fatal on expiry.
    pub tcp_timeout: Duration,

    /// Handshake and frame read deadline.
    pub message_timeout: Duration,
}

impl StreamTuning {
    /// Build new [`StreamTuning`] from `config`.
    pub fn from_config(config: &Config) -> crate::Result<Self> {
        let message_timeout = config
            .message_timeout
            .ok_or_else(|| Error::Config(String::from("message_timeout is required over TCP")))?;

        Ok(Self {
            codec: build_codec(config)?,
            token: config.token.clone(),
            serving_timeout: Duration::from_secs_f64(config.serving_timeout),
            tcp_buffer: config.tcp_buffer,
            tcp_timeout: Duration::from_secs_f64(config.tcp_timeout),
            message_timeout: Duration::from_secs_f64(message_timeout),
        })
    }
}

/// Datagram engine tuning, shared by every session of an endpoint.
pub struct DatagramTuning {
    /// Wire record transform.
    pub codec: Codec,

    /// Shared secret.
    pub token: String,

    /// Wall-clock bound on one session.
    pub serving_timeout: Duration,

    /// Local stream read size.
    pub tcp_buffer: usize,

    /// Local stream read deadline, not fatal on expiry.
    pub tcp_timeout: Duration,

    /// Request head read deadline on the relay ingress.
    pub message_timeout: Duration,

    /// Smallest DATA chunk.
    pub udp_min_payload: usize,

    /// Largest DATA chunk. Equal to the minimum for a fixed chunk size.
    pub udp_max_payload: usize,

    /// Base unit for retransmission spacing and control-ack waits.
    pub udp_timeout: Duration,

    /// Retries before a control packet or buffered entry is given up on.
    pub udp_retries: u32,

    /// Buffered packet bound; reaching it sheds the session.
    pub udp_capacity: usize,

    /// Retransmission scan interval.
    pub udp_resend_sleep: Duration,
}

impl DatagramTuning {
    /// Build new [`DatagramTuning`] from `config`.
    pub fn from_config(config: &Config) -> crate::Result<Self> {
        let required = |value: Option<f64>, key: &str| {
            value.ok_or_else(|| Error::Config(format!("{key} is required over UDP")))
        };
        let udp_min_payload = config
            .udp_min_payload
            .ok_or_else(|| Error::Config(String::from("udp_min_payload is required over UDP")))?;
        let udp_max_payload = config
            .udp_max_payload
            .ok_or_else(|| Error::Config(String::from("udp_max_payload is required over UDP")))?;
        let udp_retries = config
            .udp_retries
            .ok_or_else(|| Error::Config(String::from("udp_retries is required over UDP")))?;
        let udp_capacity = config
            .udp_capacity
            .ok_or_else(|| Error::Config(String::from("udp_capacity is required over UDP")))?;

        if udp_min_payload == 0 || udp_min_payload > udp_max_payload {
            return Err(Error::Config(String::from(
                "udp payload bounds must satisfy 0 < min <= max",
            )));
        }

        if udp_retries == 0 || udp_capacity == 0 {
            return Err(Error::Config(String::from(
                "udp_retries and udp_capacity must be positive",
            )));
        }

        Ok(Self {
            codec: build_codec(config)?,
            token: config.token.clone(),
            serving_timeout: Duration::from_secs_f64(config.serving_timeout),
            tcp_buffer: config.tcp_buffer,
            tcp_timeout: Duration::from_secs_f64(config.tcp_timeout),
            message_timeout: Duration::from_secs_f64(
                config.message_timeout.unwrap_or(config.serving_timeout),
            ),
            udp_min_payload,
            udp_max_payload,
            udp_timeout: Duration::from_secs_f64(required(config.udp_timeout, "udp_timeout")?),
            udp_retries,
            udp_capacity,
            udp_resend_sleep: Duration::from_secs_f64(required(
                config.udp_resend_sleep,
                "udp_resend_sleep",
            )?),
        })
    }
}

/// Build the wire record transform described by `config`.
fn build_codec(config: &Config) -> crate::Result<Codec> {
    let cipher: Arc<dyn Cipher> = match &config.cipher_key {
        Some(key) => Arc::new(Fernet::new(key)?),
        None => Arc::new(Plain),
    };

    let entropy = match config.entropy_rate {
        Some(rate) => Some(Arc::new(SimpleEntropy::new(rate)?) as Arc<dyn Entropy>),
        None => None,
    };

    Ok(Codec::new(cipher, entropy))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> Config {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn datagram_tuning_requires_udp_keys() {
        let config = config(
            r#"{
                "protocol": "UDP",
                "mode": "PROXY",
                "proxy_host": "0.0.0.0",
                "proxy_port": 50000,
                "token": "secret",
                "serving_timeout": 20.0,
                "tcp_buffer": 1024,
                "tcp_timeout": 1.0
            }"#,
        );

        assert!(matches!(
            DatagramTuning::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn stream_tuning_requires_message_timeout() {
        let config = config(
            r#"{
                "protocol": "TCP",
                "mode": "PROXY",
                "proxy_host": "0.0.0.0",
                "proxy_port": 50000,
                "token": "secret",
                "serving_timeout": 20.0,
                "tcp_buffer": 1024,
                "tcp_timeout": 1.0
            }"#,
        );

        assert!(matches!(
            StreamTuning::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn payload_bounds_are_validated() {
        let config = config(
            r#"{
                "protocol": "UDP",
                "mode": "PROXY",
                "proxy_host": "0.0.0.0",
                "proxy_port": 50000,
                "token": "secret",
                "serving_timeout": 20.0,
                "tcp_buffer": 1024,
                "tcp_timeout": 1.0,
                "udp_min_payload": 1024,
                "udp_max_payload": 512,
                "udp_timeout": 2.0,
                "udp_retries": 5,
                "udp_capacity": 10000,
                "udp_resend_sleep": 0.1
            }"#,
        );

        assert!(matches!(
            DatagramTuning::from_config(&config),
            Err(Error::Config(_))
        ));
    }
}
