// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Control packets of MQTT 5.0, protocol level 5.

use std::convert::TryFrom;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, PacketType, VarIntError,
};

mod auth;
mod connect;
mod connect_ack;
mod disconnect;
mod ping_request;
mod ping_response;
mod property;
mod publish;
mod publish_ack;
mod publish_complete;
mod publish_received;
mod publish_release;
mod reason_code;
mod subscribe;
mod subscribe_ack;
mod unsubscribe;
mod unsubscribe_ack;

pub use auth::{AuthPacket, AUTH_PROPERTIES, AUTH_REASONS};
pub use connect::{ConnectPacket, CONNECT_PROPERTIES, CONNECT_WILL_PROPERTIES};
pub use connect_ack::{ConnectAckPacket, CONNECT_ACK_PROPERTIES, CONNECT_REASONS};
pub use disconnect::{DisconnectPacket, DISCONNECT_PROPERTIES, DISCONNECT_REASONS};
pub use ping_request::PingRequestPacket;
pub use ping_response::PingResponsePacket;
pub use property::{
    check_multiple_subscription_identifiers, check_property_type_list, Properties, Property,
    PropertyType, MULTIPLE_PROPERTIES,
};
pub use publish::{PublishPacket, PUBLISH_PROPERTIES};
pub use publish_ack::{PublishAckPacket, PUBLISH_ACK_PROPERTIES, PUBLISH_ACK_REASONS};
pub use publish_complete::{
    PublishCompletePacket, PUBLISH_COMPLETE_PROPERTIES, PUBLISH_COMPLETE_REASONS,
};
pub use publish_received::{
    PublishReceivedPacket, PUBLISH_RECEIVED_PROPERTIES, PUBLISH_RECEIVED_REASONS,
};
pub use publish_release::{
    PublishReleasePacket, PUBLISH_RELEASE_PROPERTIES, PUBLISH_RELEASE_REASONS,
};
pub use reason_code::ReasonCode;
pub use subscribe::{RetainHandling, SubscribePacket, SubscribeTopic, SUBSCRIBE_PROPERTIES};
pub use subscribe_ack::{SubscribeAckPacket, SUBSCRIBE_ACK_PROPERTIES, SUBSCRIBE_REASONS};
pub use unsubscribe::{UnsubscribePacket, UNSUBSCRIBE_PROPERTIES};
pub use unsubscribe_ack::{UnsubscribeAckPacket, UNSUBSCRIBE_ACK_PROPERTIES, UNSUBSCRIBE_REASONS};

/// Tagged variant over all v5.0 control packets.
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
    Auth(AuthPacket),
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
            Self::Auth(p) => p.packet_type(),
        }
    }

    /// Remove all properties of `property_type`, returns true if any was
    /// removed.
    ///
    /// Used to shrink a packet that exceeds the peer's maximum packet size;
    /// optional properties are dropped before the packet is given up on.
    pub fn remove_property(&mut self, property_type: PropertyType) -> bool {
        match self {
            Self::Connect(p) => p.properties_mut().remove(property_type),
            Self::ConnectAck(p) => p.properties_mut().remove(property_type),
            Self::Publish(p) => p.properties_mut().remove(property_type),
            Self::PublishAck(p) => p.properties_mut().remove(property_type),
            Self::PublishReceived(p) => p.properties_mut().remove(property_type),
            Self::PublishRelease(p) => p.properties_mut().remove(property_type),
            Self::PublishComplete(p) => p.properties_mut().remove(property_type),
            Self::Subscribe(p) => p.properties_mut().remove(property_type),
            Self::SubscribeAck(p) => p.properties_mut().remove(property_type),
            Self::Unsubscribe(_) | Self::PingRequest(_) | Self::PingResponse(_) => false,
            Self::UnsubscribeAck(p) => p.properties_mut().remove(property_type),
            Self::Disconnect(p) => p.properties_mut().remove(property_type),
            Self::Auth(p) => p.properties_mut().remove(property_type),
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
            Self::Auth(p) => p.bytes(),
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
            PacketType::Auth => AuthPacket::decode(ba).map(Self::Auth),
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
            Self::Auth(p) => p.encode(buf),
        }
    }
}
