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
    codec::Codec,
    error::Error,
    proto::SEPARATOR,
};

use serde::{Deserialize, Serialize};

/// Stream transport handshake record.
///
/// The relay announces the tunnel target, the proxy echoes the token alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Shared secret.
    #[serde(rename = "tn")]
    pub token: String,

    /// Tunnel target host, relay to proxy only.
    #[serde(rename = "ht", skip_serializing_if = "Option::is_none", default)]
    pub host: Option<String>,

    /// Tunnel target port, relay to proxy only.
    #[serde(rename = "pt", skip_serializing_if = "Option::is_none", default)]
    pub port: Option<u16>,
}

impl Message {
    /// Encode into the sealed wire form, [`SEPARATOR`] included.
    pub fn encode(&self, codec: &Codec) -> crate::Result<Vec<u8>> {
        let record = serde_cbor::to_vec(self).map_err(|_| Error::Malformed)?;

        let mut data = codec.seal(&record);
        data.extend_from_slice(SEPARATOR);

        Ok(data)
    }

    /// Decode a [`SEPARATOR`]-terminated frame.
    pub fn decode(data: &[u8], codec: &Codec) -> crate::Result<Self> {
        let data = data.strip_suffix(SEPARATOR).unwrap_or(data);
        let record = codec.open(data)?;

        serde_cbor::from_slice(&record).map_err(|_| Error::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let codec = Codec::cleartext();
        let messages = [
            Message {
                token: String::from("secret"),
                host: Some(String::from("example.com")),
                port: Some(443),
            },
            Message {
                token: String::from("secret"),
                host: None,
                port: None,
            },
        ];

        for message in messages {
            let encoded = message.encode(&codec).unwrap();

            assert!(encoded.ends_with(SEPARATOR));
            assert_eq!(Message::decode(&encoded, &codec).unwrap(), message);
        }
    }

    #[test]
    fn nil_fields_are_absent_on_the_wire() {
        let codec = Codec::cleartext();
        let reply = Message {
            token: String::from("secret"),
            host: None,
            port: None,
        };

        let encoded = reply.encode(&codec).unwrap();
        let record: serde_cbor::Value =
            serde_cbor::from_slice(&encoded[..encoded.len() - SEPARATOR.len()]).unwrap();

        let serde_cbor::Value::Map(map) = record else {
            panic!("invalid record: {record:?}");
        };

        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&serde_cbor::Value::Text(String::from("tn"))));
    }

    #[test]
    fn garbage_is_rejected() {
        let codec = Codec::cleartext();

        assert!(matches!(
            Message::decode(b"not cbor\r\n\r\n", &codec),
            Err(Error::Malformed)
        ));
    }
}
