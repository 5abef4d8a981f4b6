// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::convert::TryFrom;

use crate::{ByteArray, DecodeError, EncodeError};

/// Protocol name can only be "MQTT".
pub const PROTOCOL_NAME: &str = "MQTT";

/// Convert packet fields into a network byte stream.
pub trait EncodePacket {
    /// Encode packet into `buf`, returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns error if packet fields are invalid or `buf` rejects writes.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError>;
}

/// Parse packet fields from a network byte stream.
pub trait DecodePacket: Sized {
    /// Read packet fields from `ba`.
    ///
    /// # Errors
    ///
    /// Returns error if byte stream is malformed.
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError>;
}

/// `QoS` level of a publish message, a subscription or a will.
///
/// Serializes as the plain integer 0, 1 or 2, so it can sit in config files.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce = 0,

    /// At least once delivery.
    AtLeastOnce = 1,

    /// Exactly once delivery.
    ExactOnce = 2,
}

impl QoS {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactOnce),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

impl Serialize for QoS {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for QoS {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        Self::try_from(value).map_err(|_err| de::Error::custom("QoS value shall be 0, 1 or 2"))
    }
}

/// Packet identifier, identifies QoS 1/2 message flows and
/// subscribe/unsubscribe transactions.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PacketId(u16);

impl PacketId {
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        2
    }
}

impl DecodePacket for PacketId {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let value = ba.read_u16()?;
        Ok(Self(value))
    }
}

impl EncodePacket for PacketId {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.0)?;
        Ok(Self::bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_try_from() {
        assert_eq!(QoS::try_from(0), Ok(QoS::AtMostOnce));
        assert_eq!(QoS::try_from(2), Ok(QoS::ExactOnce));
        assert_eq!(QoS::try_from(3), Err(DecodeError::InvalidQoS));
    }

    #[test]
    fn test_packet_id_round_trip() {
        let mut buf = Vec::new();
        let packet_id = PacketId::new(0x1234);
        assert_eq!(packet_id.encode(&mut buf), Ok(2));
        assert_eq!(&buf, &[0x12, 0x34]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(PacketId::decode(&mut ba), Ok(packet_id));
    }
}
