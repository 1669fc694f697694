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

use crate::{codec::Codec, error::Error};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// Phase tag of an OPEN packet.
const PHASE_OPEN: u8 = 1;

/// Phase tag of a DATA packet.
const PHASE_DATA: u8 = 2;

/// Phase tag of a CLOSE packet.
const PHASE_CLOSE: u8 = 3;

/// Single unit of the reliable datagram session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Session establishment. Only the non-ack form carries the target.
    Open {
        ack: bool,
        token: String,
        host: Option<String>,
        port: Option<u16>,
    },

    /// Sequenced payload, or its acknowledgement when `ack` is set.
    Data {
        ack: bool,
        seq: u32,
        data: Option<Vec<u8>>,
        drain: Option<bool>,
    },

    /// Half-close notification.
    Close { ack: bool },
}

/// Flat wire form of [`Packet`]; nil fields are absent from the record.
#[derive(Default, Serialize, Deserialize)]
struct Record {
    #[serde(rename = "pe")]
    phase: u8,

    #[serde(rename = "ak")]
    ack: bool,

    #[serde(rename = "tn", skip_serializing_if = "Option::is_none", default)]
    token: Option<String>,

    #[serde(rename = "ht", skip_serializing_if = "Option::is_none", default)]
    host: Option<String>,

    #[serde(rename = "pt", skip_serializing_if = "Option::is_none", default)]
    port: Option<u16>,

    #[serde(rename = "sq", skip_serializing_if = "Option::is_none", default)]
    seq: Option<u32>,

    #[serde(rename = "da", skip_serializing_if = "Option::is_none", default)]
    data: Option<ByteBuf>,

    #[serde(rename = "dn", skip_serializing_if = "Option::is_none", default)]
    drain: Option<bool>,
}

impl Packet {
    /// Encode into the sealed wire form. The datagram boundary is the frame,
    /// no suffix is appended.
    pub fn encode(&self, codec: &Codec) -> crate::Result<Vec<u8>> {
        let record = match self {
            Self::Open {
                ack,
                token,
                host,
                port,
            } => Record {
                phase: PHASE_OPEN,
                ack: *ack,
                token: Some(token.clone()),
                host: host.clone(),
                port: *port,
                ..Default::default()
            },
            Self::Data {
                ack,
                seq,
                data,
                drain,
            } => Record {
                phase: PHASE_DATA,
                ack: *ack,
                seq: Some(*seq),
                data: data.clone().map(ByteBuf::from),
                drain: *drain,
                ..Default::default()
            },
            Self::Close { ack } => Record {
                phase: PHASE_CLOSE,
                ack: *ack,
                ..Default::default()
            },
        };

        let record = serde_cbor::to_vec(&record).map_err(|_| Error::Malformed)?;

        Ok(codec.seal(&record))
    }

    /// Decode one datagram.
    pub fn decode(data: &[u8], codec: &Codec) -> crate::Result<Self> {
        let record = codec.open(data)?;
        let record: Record = serde_cbor::from_slice(&record).map_err(|_| Error::Malformed)?;

        match record.phase {
            PHASE_OPEN => Ok(Self::Open {
                ack: record.ack,
                token: record.token.unwrap_or_default(),
                host: record.host,
                port: record.port,
            }),
            PHASE_DATA => Ok(Self::Data {
                ack: record.ack,
                seq: record.seq.ok_or(Error::Malformed)?,
                data: record.data.map(ByteBuf::into_vec),
                drain: record.drain,
            }),
            PHASE_CLOSE => Ok(Self::Close { ack: record.ack }),
            phase => Err(Error::Phase(phase)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Fernet, SimpleEntropy};
    use std::sync::Arc;

    fn sealed_codec() -> Codec {
        Codec::new(
            Arc::new(Fernet::new("bdDmN4VexpDvTrs6gw8xTzaFvIBobFg1Cx2McFB1RmI=").unwrap()),
            Some(Arc::new(SimpleEntropy::new(5).unwrap())),
        )
    }

    #[test]
    fn encode_decode() {
        let packets = [
            Packet::Open {
                ack: false,
                token: String::from("secret"),
                host: Some(String::from("example.com")),
                port: Some(443),
            },
            Packet::Open {
                ack: true,
                token: String::from("secret"),
                host: None,
                port: None,
            },
            Packet::Data {
                ack: false,
                seq: 0,
                data: Some(b"test data 1".to_vec()),
                drain: Some(false),
            },
            Packet::Data {
                ack: false,
                seq: 1,
                data: Some(b"test data 2".to_vec()),
                drain: Some(true),
            },
            Packet::Data {
                ack: true,
                seq: 0,
                data: None,
                drain: None,
            },
            Packet::Data {
                ack: true,
                seq: 1,
                data: None,
                drain: None,
            },
            Packet::Close { ack: false },
            Packet::Close { ack: true },
        ];

        for codec in [Codec::cleartext(), sealed_codec()] {
            for packet in &packets {
                let encoded = packet.encode(&codec).unwrap();

                assert_eq!(&Packet::decode(&encoded, &codec).unwrap(), packet);
            }
        }
    }

    #[test]
    fn nil_fields_are_absent_on_the_wire() {
        let codec = Codec::cleartext();
        let encoded = Packet::Close { ack: true }.encode(&codec).unwrap();
        let record: serde_cbor::Value = serde_cbor::from_slice(&encoded).unwrap();

        let serde_cbor::Value::Map(map) = record else {
            panic!("invalid record: {record:?}");
        };

        assert_eq!(map.len(), 2);
        assert!(map.contains_key(&serde_cbor::Value::Text(String::from("pe"))));
        assert!(map.contains_key(&serde_cbor::Value::Text(String::from("ak"))));
    }

    #[test]
    fn unknown_phase_is_its_own_error() {
        let codec = Codec::cleartext();
        let record = Record {
            phase: 7,
            ack: false,
            ..Default::default()
        };
        let encoded = serde_cbor::to_vec(&record).unwrap();

        assert!(matches!(Packet::decode(&encoded, &codec), Err(Error::Phase(7))));
    }

    #[test]
    fn data_without_seq_is_malformed() {
        let codec = Codec::cleartext();
        let record = Record {
            phase: PHASE_DATA,
            ack: true,
            ..Default::default()
        };
        let encoded = serde_cbor::to_vec(&record).unwrap();

        assert!(matches!(Packet::decode(&encoded, &codec), Err(Error::Malformed)));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            Packet::decode(b"not cbor", &Codec::cleartext()),
            Err(Error::Malformed)
        ));
        assert!(matches!(
            Packet::decode(b"not a token", &sealed_codec()),
            Err(Error::Cipher)
        ));
    }
}
