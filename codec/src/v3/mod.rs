// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Control packets of MQTT 3.1.1, protocol level 4.

use std::convert::TryFrom;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, PacketType, VarIntError,
};

mod connect;
mod connect_ack;
mod disconnect;
mod ping_request;
mod ping_response;
mod publish;
mod publish_ack;
mod publish_complete;
mod publish_received;
mod publish_release;
mod subscribe;
mod subscribe_ack;
mod unsubscribe;
mod unsubscribe_ack;

pub use connect::ConnectPacket;
pub use connect_ack::{ConnectAckPacket, ConnectReturnCode};
pub use disconnect::DisconnectPacket;
pub use ping_request::PingRequestPacket;
pub use ping_response::PingResponsePacket;
pub use publish::PublishPacket;
pub use publish_ack::PublishAckPacket;
pub use publish_complete::PublishCompletePacket;
pub use publish_received::PublishReceivedPacket;
pub use publish_release::PublishReleasePacket;
pub use subscribe::{SubscribePacket, SubscribeTopic};
pub use subscribe_ack::{SubscribeAck, SubscribeAckPacket};
pub use unsubscribe::UnsubscribePacket;
pub use unsubscribe_ack::UnsubscribeAckPacket;

/// Tagged variant over all v3.1.1 control packets.
///
/// CONNECT is handled separately by the connection handshake, before the
/// protocol level is known; AUTH does not exist at this protocol level.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    Connect(ConnectPacket),
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    Subscribe(SubscribePacket),
    SubscribeAck(SubscribeAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingRequest(PingRequestPacket),
    PingResponse(PingResponsePacket),
    Disconnect(DisconnectPacket),
}

impl Packet {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        use crate::Packet as _;
        match self {
            Self::Connect(p) => p.packet_type(),
            Self::ConnectAck(p) => p.packet_type(),
            Self::Publish(p) => p.packet_type(),
            Self::PublishAck(p) => p.packet_type(),
            Self::PublishReceived(p) => p.packet_type(),
            Self::PublishRelease(p) => p.packet_type(),
            Self::PublishComplete(p) => p.packet_type(),
            Self::Subscribe(p) => p.packet_type(),
            Self::SubscribeAck(p) => p.packet_type(),
            Self::Unsubscribe(p) => p.packet_type(),
            Self::UnsubscribeAck(p) => p.packet_type(),
            Self::PingRequest(p) => p.packet_type(),
            Self::PingResponse(p) => p.packet_type(),
            Self::Disconnect(p) => p.packet_type(),
        }
    }

    /// Get byte length in packet.
    ///
    /// # Errors
    ///
    /// Returns error if packet size exceeds the variable byte integer range.
    pub fn bytes(&self) -> Result<usize, VarIntError> {
        use crate::Packet as _;
        match self {
            Self::Connect(p) => p.bytes(),
            Self::ConnectAck(p) => p.bytes(),
            Self::Publish(p) => p.bytes(),
            Self::PublishAck(p) => p.bytes(),
            Self::PublishReceived(p) => p.bytes(),
            Self::PublishRelease(p) => p.bytes(),
            Self::PublishComplete(p) => p.bytes(),
            Self::Subscribe(p) => p.bytes(),
            Self::SubscribeAck(p) => p.bytes(),
            Self::Unsubscribe(p) => p.bytes(),
            Self::UnsubscribeAck(p) => p.bytes(),
            Self::PingRequest(p) => p.bytes(),
            Self::PingResponse(p) => p.bytes(),
            Self::Disconnect(p) => p.bytes(),
        }
    }
}

impl DecodePacket for Packet {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let packet_type = PacketType::try_from(ba.peek_byte()?)?;
        match packet_type {
            PacketType::Connect => ConnectPacket::decode(ba).map(Self::Connect),
            PacketType::ConnectAck => ConnectAckPacket::decode(ba).map(Self::ConnectAck),
            PacketType::Publish { .. } => PublishPacket::decode(ba).map(Self::Publish),
            PacketType::PublishAck => PublishAckPacket::decode(ba).map(Self::PublishAck),
            PacketType::PublishReceived => {
                PublishReceivedPacket::decode(ba).map(Self::PublishReceived)
            }
            PacketType::PublishRelease => {
                PublishReleasePacket::decode(ba).map(Self::PublishRelease)
            }
            PacketType::PublishComplete => {
                PublishCompletePacket::decode(ba).map(Self::PublishComplete)
            }
            PacketType::Subscribe => SubscribePacket::decode(ba).map(Self::Subscribe),
            PacketType::SubscribeAck => SubscribeAckPacket::decode(ba).map(Self::SubscribeAck),
            PacketType::Unsubscribe => UnsubscribePacket::decode(ba).map(Self::Unsubscribe),
            PacketType::UnsubscribeAck => {
                UnsubscribeAckPacket::decode(ba).map(Self::UnsubscribeAck)
            }
            PacketType::PingRequest => PingRequestPacket::decode(ba).map(Self::PingRequest),
            PacketType::PingResponse => PingResponsePacket::decode(ba).map(Self::PingResponse),
            PacketType::Disconnect => DisconnectPacket::decode(ba).map(Self::Disconnect),
            PacketType::Auth => Err(DecodeError::InvalidPacketType),
        }
    }
}

impl EncodePacket for Packet {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        match self {
            Self::Connect(p) => p.encode(buf),
            Self::ConnectAck(p) => p.encode(buf),
            Self::Publish(p) => p.encode(buf),
            Self::PublishAck(p) => p.encode(buf),
            Self::PublishReceived(p) => p.encode(buf),
            Self::PublishRelease(p) => p.encode(buf),
            Self::PublishComplete(p) => p.encode(buf),
            Self::Subscribe(p) => p.encode(buf),
            Self::SubscribeAck(p) => p.encode(buf),
            Self::Unsubscribe(p) => p.encode(buf),
            Self::UnsubscribeAck(p) => p.encode(buf),
            Self::PingRequest(p) => p.encode(buf),
            Self::PingResponse(p) => p.encode(buf),
            Self::Disconnect(p) => p.encode(buf),
        }
    }
}
