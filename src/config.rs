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

use crate::error::Error;

use serde::Deserialize;

use std::{fs::File, io::BufReader, path::Path};

/// Endpoint role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Mode {
    /// Client-facing HTTP CONNECT endpoint.
    #[serde(rename = "RELAY")]
    Relay,

    /// Egress endpoint opening the real upstream connections.
    #[serde(rename = "PROXY")]
    Proxy,
}

/// Relay-proxy transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Protocol {
    /// Message-delimited stream transport.
    #[serde(rename = "TCP")]
    Tcp,

    /// Reliable-ordered datagram transport.
    #[serde(rename = "UDP")]
    Udp,
}

/// Relay/proxy configuration, loaded from a JSON file.
///
/// Durations are seconds. `cipher_key` set to nil selects cleartext,
/// `entropy_rate` set to nil disables the entropy codec.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub protocol: Protocol,
    pub mode: Mode,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub monitor: bool,
    #[serde(default)]
    pub relay_host: Option<String>,
    #[serde(default)]
    pub relay_port: Option<u16>,
    pub proxy_host: String,
    pub proxy_port: u16,
    #[serde(default)]
    pub cipher_key: Option<String>,
    #[serde(default)]
    pub entropy_rate: Option<usize>,
    pub token: String,
    pub serving_timeout: f64,
    pub tcp_buffer: usize,
    pub tcp_timeout: f64,
    #[serde(default)]
    pub message_timeout: Option<f64>,
    #[serde(default)]
    pub udp_min_payload: Option<usize>,
    #[serde(default)]
    pub udp_max_payload: Option<usize>,
    #[serde(default)]
    pub udp_timeout: Option<f64>,
    #[serde(default)]
    pub udp_retries: Option<u32>,
    #[serde(default)]
    pub udp_capacity: Option<usize>,
    #[serde(default)]
    pub udp_resend_sleep: Option<f64>,
}

impl Config {
    /// Load new [`Config`] from the JSON file at `path`.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let file = File::open(path)?;

        serde_json::from_reader(BufReader::new(file)).map_err(|error| Error::Config(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_relay_config() {
        let config: Config = serde_json::from_str(
            r#"{
                "protocol": "UDP",
                "mode": "RELAY",
                "debug": true,
                "monitor": true,
                "relay_host": "127.0.0.1",
                "relay_port": 9000,
                "proxy_host": "185.1.2.3",
                "proxy_port": 50000,
                "cipher_key": "bdDmN4VexpDvTrs6gw8xTzaFvIBobFg1Cx2McFB1RmI=",
                "entropy_rate": 5,
                "token": "secret",
                "serving_timeout": 20.0,
                "tcp_buffer": 1024,
                "tcp_timeout": 1.0,
                "message_timeout": 5.0,
                "udp_min_payload": 512,
                "udp_max_payload": 1024,
                "udp_timeout": 2.0,
                "udp_retries": 5,
                "udp_capacity": 10000,
                "udp_resend_sleep": 0.1
            }"#,
        )
        .unwrap();

        assert_eq!(config.protocol, Protocol::Udp);
        assert_eq!(config.mode, Mode::Relay);
        assert_eq!(config.relay_port, Some(9000));
        assert_eq!(config.udp_retries, Some(5));
    }

    #[test]
    fn optional_keys_default_to_nil() {
        let config: Config = serde_json::from_str(
            r#"{
                "protocol": "TCP",
                "mode": "PROXY",
                "proxy_host": "0.0.0.0",
                "proxy_port": 50000,
                "token": "secret",
                "serving_timeout": 20.0,
                "tcp_buffer": 1024,
                "tcp_timeout": 1.0,
                "message_timeout": 5.0
            }"#,
        )
        .unwrap();

        assert!(!config.debug);
        assert!(!config.monitor);
        assert!(config.cipher_key.is_none());
        assert!(config.entropy_rate.is_none());
        assert!(config.udp_timeout.is_none());
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(serde_json::from_str::<Config>(r#"{"protocol": "TCP", "mode": "BOTH"}"#).is_err());
    }
}
