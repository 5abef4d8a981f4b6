// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;
use std::io::Write;

use super::property::{check_multiple_subscription_identifiers, check_property_type_list};
use super::{Properties, PropertyType};
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet, PacketId,
    PacketType, PubTopic, QoS, VarIntError,
};

/// Properties available in publish packets.
pub const PUBLISH_PROPERTIES: &[PropertyType] = &[
    PropertyType::PayloadFormatIndicator,
    PropertyType::MessageExpiryInterval,
    PropertyType::TopicAlias,
    PropertyType::ResponseTopic,
    PropertyType::CorrelationData,
    PropertyType::UserProperty,
    PropertyType::SubscriptionIdentifier,
    PropertyType::ContentType,
];

/// `PublishPacket` is used to transport application messages from the Client
/// to the Server, or from the Server to the Client.
///
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// |                       |
/// +-----------------------+
/// | Topic name            |
/// |                       |
/// +-----------------------+
/// | Packet id             |
/// |                       |
/// +-----------------------+
/// | Properties ...        |
/// +-----------------------+
/// | Msg payload ...       |
/// +-----------------------+
/// ```
///
/// Note that `packet_id` is only present in `QoS` 1 and `QoS` 2 packets.
/// The topic may be empty when a Topic Alias property is used; binding and
/// resolving aliases is the receiver's responsibility.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishPacket {
    /// The DUP flag MUST be set to 1 when re-delivering a packet
    /// [MQTT-3.3.1-1] and MUST be 0 for all QoS 0 messages [MQTT-3.3.1-2].
    dup: bool,

    qos: QoS,

    /// The retain flag as described in [MQTT-3.3.1-5] to [MQTT-3.3.1-13];
    /// on messages forwarded by the Server its value is controlled by the
    /// Retain As Published subscription option.
    retain: bool,

    /// May be empty when a Topic Alias property is present.
    topic: String,

    /// Only present where the `QoS` level is 1 or 2.
    packet_id: PacketId,

    properties: Properties,

    msg: Bytes,
}

impl PublishPacket {
    /// Create a new publish packet.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str, qos: QoS, msg: &[u8]) -> Result<Self, EncodeError> {
        let topic = PubTopic::new(topic)?;
        Ok(Self {
            qos,
            dup: false,
            retain: false,
            topic: topic.as_ref().to_string(),
            packet_id: PacketId::new(0),
            properties: Properties::new(),
            msg: Bytes::copy_from_slice(msg),
        })
    }

    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    /// Update `dup` flag.
    ///
    /// # Errors
    ///
    /// Returns error if `dup` flag is set on a `QoS` 0 packet.
    pub fn set_dup(&mut self, dup: bool) -> Result<&mut Self, EncodeError> {
        if dup && self.qos == QoS::AtMostOnce {
            return Err(EncodeError::InvalidPacketType);
        }
        self.dup = dup;
        Ok(self)
    }

    #[must_use]
    pub const fn dup(&self) -> bool {
        self.dup
    }

    pub fn set_qos(&mut self, qos: QoS) -> &mut Self {
        if qos == QoS::AtMostOnce {
            self.packet_id = PacketId::new(0);
        }
        self.qos = qos;
        self
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    pub fn set_packet_id(&mut self, packet_id: PacketId) -> &mut Self {
        self.packet_id = packet_id;
        self
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    /// Update topic value.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn set_topic(&mut self, topic: &str) -> Result<&mut Self, EncodeError> {
        let topic = PubTopic::new(topic)?;
        self.topic = topic.as_ref().to_string();
        Ok(self)
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    #[must_use]
    pub fn message(&self) -> &Bytes {
        &self.msg
    }

    /// Replace the payload without copying.
    pub fn set_message(&mut self, msg: Bytes) -> &mut Self {
        self.msg = msg;
        self
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let mut remaining_length =
            2 + self.topic.len() + self.properties.bytes() + self.msg.len();
        if self.qos != QoS::AtMostOnce {
            remaining_length += PacketId::bytes();
        }

        let packet_type = PacketType::Publish {
            dup: self.dup,
            retain: self.retain,
            qos: self.qos,
        };
        FixedHeader::new(packet_type, remaining_length)
    }
}

impl DecodePacket for PublishPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let start_offset = ba.offset();
        let fixed_header = FixedHeader::decode(ba)?;

        let PacketType::Publish { dup, qos, retain } = fixed_header.packet_type() else {
            return Err(DecodeError::InvalidPacketType);
        };

        // The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2].
        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::InvalidPacketFlags);
        }

        // An empty topic is allowed here; a Topic Alias property may carry
        // the binding. Wildcards and NUL are still rejected.
        let topic_len = ba.read_u16()? as usize;
        let topic = ba.read_string(topic_len)?;
        if !topic.is_empty() {
            crate::topic::validate_pub_topic(&topic)?;
        }

        let packet_id = if qos == QoS::AtMostOnce {
            PacketId::new(0)
        } else {
            let packet_id = PacketId::decode(ba)?;
            if packet_id.value() == 0 {
                return Err(DecodeError::InvalidPacketId);
            }
            packet_id
        };

        let properties = Properties::decode(ba)?;
        if let Err(property_type) =
            check_property_type_list(properties.props(), PUBLISH_PROPERTIES)
        {
            log::error!(
                "v5/PublishPacket: property type {property_type:?} cannot be used in properties!"
            );
            return Err(DecodeError::InvalidPropertyType);
        }
        if check_multiple_subscription_identifiers(properties.props()).is_err() {
            return Err(DecodeError::InvalidPropertyType);
        }
        if topic.is_empty() && properties.topic_alias().is_none() {
            return Err(DecodeError::InvalidTopic);
        }

        let header_bytes = ba.offset() - start_offset - fixed_header.bytes();
        if fixed_header.remaining_length() < header_bytes {
            return Err(DecodeError::InvalidRemainingLength);
        }
        let msg_len = fixed_header.remaining_length() - header_bytes;
        let msg = Bytes::copy_from_slice(ba.read_bytes(msg_len)?);

        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            properties,
            msg,
        })
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;

        #[allow(clippy::cast_possible_truncation)]
        let topic_len = self.topic.len() as u16;
        buf.extend_from_slice(&topic_len.to_be_bytes());
        buf.write_all(self.topic.as_bytes())?;

        if self.qos != QoS::AtMostOnce {
            self.packet_id.encode(buf)?;
        }

        self.properties.encode(buf)?;

        buf.write_all(&self.msg)?;

        Ok(buf.len() - old_len)
    }
}

impl Packet for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish {
            dup: self.dup,
            retain: self.retain,
            qos: self.qos,
        }
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let fixed_header = self.get_fixed_header()?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Property, U16Data, U32Data};

    #[test]
    fn test_round_trip() {
        let mut packet = PublishPacket::new("t/x", QoS::AtLeastOnce, b"hi").unwrap();
        packet.set_packet_id(PacketId::new(11));
        packet
            .properties_mut()
            .push(Property::MessageExpiryInterval(U32Data::new(30)));

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), packet.bytes().unwrap());

        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.properties().message_expiry_interval(), Some(30));
    }

    #[test]
    fn test_empty_topic_with_alias() {
        let mut packet = PublishPacket::new("long/topic", QoS::AtMostOnce, b"x").unwrap();
        packet.topic.clear();
        packet
            .properties_mut()
            .push(Property::TopicAlias(U16Data::new(1)));

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert!(decoded.topic().is_empty());
        assert_eq!(decoded.properties().topic_alias(), Some(1));
    }

    #[test]
    fn test_empty_topic_without_alias_rejected() {
        let mut packet = PublishPacket::new("t", QoS::AtMostOnce, b"x").unwrap();
        packet.topic.clear();

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PublishPacket::decode(&mut ba),
            Err(DecodeError::InvalidTopic)
        );
    }
}
