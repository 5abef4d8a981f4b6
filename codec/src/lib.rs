// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Packet codec for MQTT protocol, supporting both v3.1.1 (protocol level 4)
//! and v5.0 (protocol level 5).

mod assembler;
mod base;
mod binary_data;
mod bool_data;
mod byte_array;
mod connect_flags;
mod error;
mod header;
mod protocol_level;
mod string_data;
mod string_pair_data;
pub mod topic;
mod u16_data;
mod u32_data;
pub mod utils;
pub mod v3;
pub mod v5;
mod var_int;

pub use assembler::Assembler;
pub use bytes::Bytes;
pub use base::{DecodePacket, EncodePacket, PacketId, QoS, PROTOCOL_NAME};
pub use binary_data::BinaryData;
pub use bool_data::BoolData;
pub use byte_array::{ByteArray, ByteArrayError};
pub use connect_flags::ConnectFlags;
pub use error::{DecodeError, EncodeError};
pub use header::{FixedHeader, Packet, PacketType};
pub use protocol_level::ProtocolLevel;
pub use string_data::StringData;
pub use string_pair_data::StringPairData;
pub use topic::{PubTopic, SubTopic, Topic};
pub use u16_data::U16Data;
pub use u32_data::U32Data;
pub use v5::{Properties, Property, PropertyType, ReasonCode};
pub use var_int::{VarInt, VarIntError, MAX_VAR_INT};

/// A decoded control packet of either protocol level.
///
/// The broker dispatches on this with exhaustive pattern matching; the
/// protocol level is fixed per connection once CONNECT has been read.
#[derive(Clone, Debug, PartialEq)]
pub enum FramePacket {
    V3(v3::Packet),
    V5(v5::Packet),
}

impl FramePacket {
    /// Decode one complete packet of the given `protocol_level` from `buf`.
    ///
    /// # Errors
    ///
    /// Returns error if the packet is malformed.
    pub fn decode(buf: &[u8], protocol_level: ProtocolLevel) -> Result<Self, DecodeError> {
        let mut ba = ByteArray::new(buf);
        match protocol_level {
            ProtocolLevel::V31 | ProtocolLevel::V311 => {
                v3::Packet::decode(&mut ba).map(Self::V3)
            }
            ProtocolLevel::V5 => v5::Packet::decode(&mut ba).map(Self::V5),
        }
    }

    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::V3(packet) => packet.packet_type(),
            Self::V5(packet) => packet.packet_type(),
        }
    }
}

impl EncodePacket for FramePacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        match self {
            Self::V3(packet) => packet.encode(buf),
            Self::V5(packet) => packet.encode(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_packet_decode_v3() {
        let buf = [0xc0, 0x00];
        let packet = FramePacket::decode(&buf, ProtocolLevel::V311).unwrap();
        assert_eq!(packet.packet_type(), PacketType::PingRequest);
    }

    #[test]
    fn test_frame_packet_decode_v5_auth() {
        let buf = [0xf0, 0x00];
        let packet = FramePacket::decode(&buf, ProtocolLevel::V5).unwrap();
        assert_eq!(packet.packet_type(), PacketType::Auth);

        // AUTH is not a valid packet at protocol level 4.
        assert_eq!(
            FramePacket::decode(&buf, ProtocolLevel::V311),
            Err(DecodeError::InvalidPacketType)
        );
    }
}
