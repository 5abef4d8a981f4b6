// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Properties in the variable header of MQTT 5.0 packets.
//!
//! A property consists of an identifier byte followed by a typed value.
//! The set of valid identifiers depends on the packet type; each packet
//! module defines its permitted list as a `*_PROPERTIES` constant and
//! validates decoded properties with [`check_property_type_list`].

use std::convert::TryFrom;

use crate::{
    BinaryData, BoolData, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket,
    PubTopic, QoS, StringData, StringPairData, U16Data, U32Data, VarInt,
};

/// Properties which are allowed to appear more than once in a property list.
pub const MULTIPLE_PROPERTIES: &[PropertyType] = &[
    PropertyType::UserProperty,
    PropertyType::SubscriptionIdentifier,
];

/// Check that each property in `properties` is in the permitted list `types`
/// and that non-repeatable properties appear at most once.
///
/// # Errors
///
/// Returns the offending property type.
pub fn check_property_type_list(
    properties: &[Property],
    types: &[PropertyType],
) -> Result<(), PropertyType> {
    if properties.is_empty() {
        return Ok(());
    }

    for property in properties {
        if !types.contains(&property.property_type()) {
            return Err(property.property_type());
        }
    }

    for property_type in types {
        let count = properties
            .iter()
            .filter(|p| p.property_type() == *property_type)
            .count();
        if count > 1 && !MULTIPLE_PROPERTIES.contains(property_type) {
            return Err(*property_type);
        }
    }

    Ok(())
}

/// A PUBLISH packet sent by a Client MUST NOT contain more than one
/// Subscription Identifier [MQTT-3.3.4-6].
///
/// # Errors
///
/// Returns the offending property type.
pub fn check_multiple_subscription_identifiers(
    properties: &[Property],
) -> Result<(), PropertyType> {
    let count = properties
        .iter()
        .filter(|p| p.property_type() == PropertyType::SubscriptionIdentifier)
        .count();
    if count > 1 {
        return Err(PropertyType::SubscriptionIdentifier);
    }
    Ok(())
}

/// Identifier byte of a property.
#[allow(clippy::module_name_repetitions)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0b,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1a,
    ServerReference = 0x1c,
    ReasonString = 0x1f,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2a,
}

impl PropertyType {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for PropertyType {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(Self::PayloadFormatIndicator),
            0x02 => Ok(Self::MessageExpiryInterval),
            0x03 => Ok(Self::ContentType),
            0x08 => Ok(Self::ResponseTopic),
            0x09 => Ok(Self::CorrelationData),
            0x0b => Ok(Self::SubscriptionIdentifier),
            0x11 => Ok(Self::SessionExpiryInterval),
            0x12 => Ok(Self::AssignedClientIdentifier),
            0x13 => Ok(Self::ServerKeepAlive),
            0x15 => Ok(Self::AuthenticationMethod),
            0x16 => Ok(Self::AuthenticationData),
            0x17 => Ok(Self::RequestProblemInformation),
            0x18 => Ok(Self::WillDelayInterval),
            0x19 => Ok(Self::RequestResponseInformation),
            0x1a => Ok(Self::ResponseInformation),
            0x1c => Ok(Self::ServerReference),
            0x1f => Ok(Self::ReasonString),
            0x21 => Ok(Self::ReceiveMaximum),
            0x22 => Ok(Self::TopicAliasMaximum),
            0x23 => Ok(Self::TopicAlias),
            0x24 => Ok(Self::MaximumQoS),
            0x25 => Ok(Self::RetainAvailable),
            0x26 => Ok(Self::UserProperty),
            0x27 => Ok(Self::MaximumPacketSize),
            0x28 => Ok(Self::WildcardSubscriptionAvailable),
            0x29 => Ok(Self::SubscriptionIdentifierAvailable),
            0x2a => Ok(Self::SharedSubscriptionAvailable),
            _ => Err(DecodeError::InvalidPropertyType),
        }
    }
}

/// A property value together with its identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    /// Byte. Used in PUBLISH, Will Properties.
    ///
    /// 0 means unspecified bytes, 1 means UTF-8 encoded character data.
    PayloadFormatIndicator(BoolData),

    /// Four Byte Integer. Used in PUBLISH, Will Properties.
    ///
    /// Lifetime of the message in seconds. When forwarding, the Server
    /// sends the received value minus the time the message has been
    /// waiting in the Server [MQTT-3.3.2-6].
    MessageExpiryInterval(U32Data),

    /// UTF-8 Encoded String. Used in PUBLISH, Will Properties.
    ContentType(StringData),

    /// UTF-8 Encoded String. Used in PUBLISH, Will Properties.
    ///
    /// Topic Name for a response message.
    ResponseTopic(PubTopic),

    /// Binary Data. Used in PUBLISH, Will Properties.
    CorrelationData(BinaryData),

    /// Variable Byte Integer. Used in PUBLISH, SUBSCRIBE.
    ///
    /// Value range is 1 to 268,435,455; zero is a Protocol Error.
    /// May repeat in a PUBLISH sent by the Server.
    SubscriptionIdentifier(VarInt),

    /// Four Byte Integer. Used in CONNECT, CONNACK, DISCONNECT.
    ///
    /// Session Expiry Interval in seconds; 0xFFFFFFFF means the session
    /// does not expire.
    SessionExpiryInterval(U32Data),

    /// UTF-8 Encoded String. Used in CONNACK.
    ///
    /// The Client Identifier assigned by the Server because a zero length
    /// Client Identifier was found in the CONNECT packet [MQTT-3.2.2-16].
    AssignedClientIdentifier(StringData),

    /// Two Byte Integer. Used in CONNACK.
    ///
    /// If present, the Client MUST use this value instead of the Keep Alive
    /// it sent on CONNECT [MQTT-3.2.2-21].
    ServerKeepAlive(U16Data),

    /// UTF-8 Encoded String. Used in CONNECT, CONNACK, AUTH.
    AuthenticationMethod(StringData),

    /// Binary Data. Used in CONNECT, CONNACK, AUTH.
    ///
    /// Contents are defined by the authentication method.
    AuthenticationData(BinaryData),

    /// Byte. Used in CONNECT.
    ///
    /// If 0, the Server MAY return a Reason String or User Properties on
    /// CONNACK or DISCONNECT, but MUST NOT send them on any other packet
    /// [MQTT-3.1.2-29].
    RequestProblemInformation(BoolData),

    /// Four Byte Integer. Will Properties only.
    ///
    /// The Server delays publishing the Will Message until the Will Delay
    /// Interval has passed or the Session ends, whichever happens first.
    WillDelayInterval(U32Data),

    /// Byte. Used in CONNECT.
    ///
    /// A value of 1 requests the Server to return Response Information
    /// in the CONNACK.
    RequestResponseInformation(BoolData),

    /// UTF-8 Encoded String. Used in CONNACK.
    ///
    /// Basis for creating a Response Topic.
    ResponseInformation(StringData),

    /// UTF-8 Encoded String. Used in CONNACK, DISCONNECT.
    ///
    /// Identifies another Server to use, together with reason code 0x9C
    /// (Use another server) or 0x9D (Server moved).
    ServerReference(StringData),

    /// UTF-8 Encoded String. Used in all acknowledgement packets.
    ///
    /// Human readable diagnostic string, not to be parsed by the receiver.
    ReasonString(StringData),

    /// Two Byte Integer. Used in CONNECT, CONNACK.
    ///
    /// Limits the number of QoS 1 and QoS 2 publications the sender is
    /// willing to process concurrently. Zero is a Protocol Error; if
    /// absent, the value defaults to 65,535.
    ReceiveMaximum(U16Data),

    /// Two Byte Integer. Used in CONNECT, CONNACK.
    ///
    /// Highest value accepted as a Topic Alias. Zero or absent means no
    /// aliases are accepted on this connection [MQTT-3.1.2-27].
    TopicAliasMaximum(U16Data),

    /// Two Byte Integer. Used in PUBLISH.
    ///
    /// An integer used to identify the Topic instead of the Topic Name,
    /// scoped to one network connection. Zero is a Protocol Error
    /// [MQTT-3.3.2-8].
    TopicAlias(U16Data),

    /// Byte. Used in CONNACK. Value is 0 or 1.
    MaximumQoS(QoS),

    /// Byte. Used in CONNACK.
    ///
    /// Declares whether the Server supports retained messages.
    RetainAvailable(BoolData),

    /// UTF-8 String Pair. Allowed in all packets, may appear multiple times.
    ///
    /// The Server MUST maintain the order of User Properties when
    /// forwarding messages [MQTT-3.3.2-18].
    UserProperty(StringPairData),

    /// Four Byte Integer. Used in CONNECT, CONNACK.
    ///
    /// Maximum packet size the sender is willing to accept. Zero is a
    /// Protocol Error. The receiver MUST NOT send packets exceeding this
    /// limit [MQTT-3.1.2-24].
    MaximumPacketSize(U32Data),

    /// Byte. Used in CONNACK.
    WildcardSubscriptionAvailable(BoolData),

    /// Byte. Used in CONNACK.
    SubscriptionIdentifierAvailable(BoolData),

    /// Byte. Used in CONNACK.
    SharedSubscriptionAvailable(BoolData),
}

impl Property {
    /// Get type of the property.
    #[must_use]
    pub const fn property_type(&self) -> PropertyType {
        match self {
            Self::PayloadFormatIndicator(_) => PropertyType::PayloadFormatIndicator,
            Self::MessageExpiryInterval(_) => PropertyType::MessageExpiryInterval,
            Self::ContentType(_) => PropertyType::ContentType,
            Self::ResponseTopic(_) => PropertyType::ResponseTopic,
            Self::CorrelationData(_) => PropertyType::CorrelationData,
            Self::SubscriptionIdentifier(_) => PropertyType::SubscriptionIdentifier,
            Self::SessionExpiryInterval(_) => PropertyType::SessionExpiryInterval,
            Self::AssignedClientIdentifier(_) => PropertyType::AssignedClientIdentifier,
            Self::ServerKeepAlive(_) => PropertyType::ServerKeepAlive,
            Self::AuthenticationMethod(_) => PropertyType::AuthenticationMethod,
            Self::AuthenticationData(_) => PropertyType::AuthenticationData,
            Self::RequestProblemInformation(_) => PropertyType::RequestProblemInformation,
            Self::WillDelayInterval(_) => PropertyType::WillDelayInterval,
            Self::RequestResponseInformation(_) => PropertyType::RequestResponseInformation,
            Self::ResponseInformation(_) => PropertyType::ResponseInformation,
            Self::ServerReference(_) => PropertyType::ServerReference,
            Self::ReasonString(_) => PropertyType::ReasonString,
            Self::ReceiveMaximum(_) => PropertyType::ReceiveMaximum,
            Self::TopicAliasMaximum(_) => PropertyType::TopicAliasMaximum,
            Self::TopicAlias(_) => PropertyType::TopicAlias,
            Self::MaximumQoS(_) => PropertyType::MaximumQoS,
            Self::RetainAvailable(_) => PropertyType::RetainAvailable,
            Self::UserProperty(_) => PropertyType::UserProperty,
            Self::MaximumPacketSize(_) => PropertyType::MaximumPacketSize,
            Self::WildcardSubscriptionAvailable(_) => PropertyType::WildcardSubscriptionAvailable,
            Self::SubscriptionIdentifierAvailable(_) => {
                PropertyType::SubscriptionIdentifierAvailable
            }
            Self::SharedSubscriptionAvailable(_) => PropertyType::SharedSubscriptionAvailable,
        }
    }

    /// Get byte length used in packets.
    #[allow(clippy::match_same_arms)]
    #[must_use]
    pub fn bytes(&self) -> usize {
        let value_bytes = match self {
            Self::AssignedClientIdentifier(value) => value.bytes(),
            Self::AuthenticationData(value) => value.bytes(),
            Self::AuthenticationMethod(value) => value.bytes(),
            Self::ContentType(value) => value.bytes(),
            Self::CorrelationData(value) => value.bytes(),
            Self::MaximumPacketSize(..) => U32Data::bytes(),
            Self::MaximumQoS(..) => QoS::bytes(),
            Self::MessageExpiryInterval(..) => U32Data::bytes(),
            Self::PayloadFormatIndicator(..) => BoolData::bytes(),
            Self::ReasonString(value) => value.bytes(),
            Self::ReceiveMaximum(..) => U16Data::bytes(),
            Self::RequestProblemInformation(..) => BoolData::bytes(),
            Self::RequestResponseInformation(..) => BoolData::bytes(),
            Self::ResponseInformation(value) => value.bytes(),
            Self::ResponseTopic(value) => value.bytes(),
            Self::RetainAvailable(..) => BoolData::bytes(),
            Self::ServerKeepAlive(..) => U16Data::bytes(),
            Self::ServerReference(value) => value.bytes(),
            Self::SessionExpiryInterval(..) => U32Data::bytes(),
            Self::SharedSubscriptionAvailable(..) => BoolData::bytes(),
            Self::SubscriptionIdentifier(value) => value.bytes(),
            Self::SubscriptionIdentifierAvailable(..) => BoolData::bytes(),
            Self::TopicAlias(..) => U16Data::bytes(),
            Self::TopicAliasMaximum(..) => U16Data::bytes(),
            Self::UserProperty(value) => value.bytes(),
            Self::WildcardSubscriptionAvailable(..) => BoolData::bytes(),
            Self::WillDelayInterval(..) => U32Data::bytes(),
        };

        PropertyType::bytes() + value_bytes
    }
}

impl DecodePacket for Property {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let property_type = PropertyType::try_from(ba.read_byte()?)?;
        match property_type {
            PropertyType::PayloadFormatIndicator => {
                BoolData::decode(ba).map(Self::PayloadFormatIndicator)
            }
            PropertyType::MessageExpiryInterval => {
                U32Data::decode(ba).map(Self::MessageExpiryInterval)
            }
            PropertyType::ContentType => StringData::decode(ba).map(Self::ContentType),
            PropertyType::ResponseTopic => PubTopic::decode(ba).map(Self::ResponseTopic),
            PropertyType::CorrelationData => BinaryData::decode(ba).map(Self::CorrelationData),
            PropertyType::SubscriptionIdentifier => {
                let id = VarInt::decode(ba)?;
                // It is a Protocol Error if the Subscription Identifier
                // has a value of 0.
                if id.is_empty() {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::SubscriptionIdentifier(id))
            }
            PropertyType::SessionExpiryInterval => {
                U32Data::decode(ba).map(Self::SessionExpiryInterval)
            }
            PropertyType::AssignedClientIdentifier => {
                StringData::decode(ba).map(Self::AssignedClientIdentifier)
            }
            PropertyType::ServerKeepAlive => U16Data::decode(ba).map(Self::ServerKeepAlive),
            PropertyType::AuthenticationMethod => {
                StringData::decode(ba).map(Self::AuthenticationMethod)
            }
            PropertyType::AuthenticationData => {
                BinaryData::decode(ba).map(Self::AuthenticationData)
            }
            PropertyType::RequestProblemInformation => {
                BoolData::decode(ba).map(Self::RequestProblemInformation)
            }
            PropertyType::WillDelayInterval => U32Data::decode(ba).map(Self::WillDelayInterval),
            PropertyType::RequestResponseInformation => {
                BoolData::decode(ba).map(Self::RequestResponseInformation)
            }
            PropertyType::ResponseInformation => {
                StringData::decode(ba).map(Self::ResponseInformation)
            }
            PropertyType::ServerReference => StringData::decode(ba).map(Self::ServerReference),
            PropertyType::ReasonString => StringData::decode(ba).map(Self::ReasonString),
            PropertyType::ReceiveMaximum => {
                let max = U16Data::decode(ba)?;
                if max.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::ReceiveMaximum(max))
            }
            PropertyType::TopicAliasMaximum => U16Data::decode(ba).map(Self::TopicAliasMaximum),
            PropertyType::TopicAlias => U16Data::decode(ba).map(Self::TopicAlias),
            PropertyType::MaximumQoS => {
                // Value other than 0 or 1 is a Protocol Error.
                let qos = QoS::try_from(ba.read_byte()?)?;
                if qos == QoS::ExactOnce {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::MaximumQoS(qos))
            }
            PropertyType::RetainAvailable => BoolData::decode(ba).map(Self::RetainAvailable),
            PropertyType::UserProperty => StringPairData::decode(ba).map(Self::UserProperty),
            PropertyType::MaximumPacketSize => {
                let max = U32Data::decode(ba)?;
                if max.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::MaximumPacketSize(max))
            }
            PropertyType::WildcardSubscriptionAvailable => {
                BoolData::decode(ba).map(Self::WildcardSubscriptionAvailable)
            }
            PropertyType::SubscriptionIdentifierAvailable => {
                BoolData::decode(ba).map(Self::SubscriptionIdentifierAvailable)
            }
            PropertyType::SharedSubscriptionAvailable => {
                BoolData::decode(ba).map(Self::SharedSubscriptionAvailable)
            }
        }
    }
}

impl EncodePacket for Property {
    #[allow(clippy::match_same_arms)]
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(self.property_type() as u8);
        let value_bytes = match self {
            Self::PayloadFormatIndicator(value) => value.encode(buf)?,
            Self::MessageExpiryInterval(value) => value.encode(buf)?,
            Self::ContentType(value) => value.encode(buf)?,
            Self::ResponseTopic(value) => value.encode(buf)?,
            Self::CorrelationData(value) => value.encode(buf)?,
            Self::SubscriptionIdentifier(value) => value.encode(buf)?,
            Self::SessionExpiryInterval(value) => value.encode(buf)?,
            Self::AssignedClientIdentifier(value) => value.encode(buf)?,
            Self::ServerKeepAlive(value) => value.encode(buf)?,
            Self::AuthenticationMethod(value) => value.encode(buf)?,
            Self::AuthenticationData(value) => value.encode(buf)?,
            Self::RequestProblemInformation(value) => value.encode(buf)?,
            Self::WillDelayInterval(value) => value.encode(buf)?,
            Self::RequestResponseInformation(value) => value.encode(buf)?,
            Self::ResponseInformation(value) => value.encode(buf)?,
            Self::ServerReference(value) => value.encode(buf)?,
            Self::ReasonString(value) => value.encode(buf)?,
            Self::ReceiveMaximum(value) => value.encode(buf)?,
            Self::TopicAliasMaximum(value) => value.encode(buf)?,
            Self::TopicAlias(value) => value.encode(buf)?,
            Self::MaximumQoS(value) => {
                buf.push(*value as u8);
                QoS::bytes()
            }
            Self::RetainAvailable(value) => value.encode(buf)?,
            Self::UserProperty(value) => value.encode(buf)?,
            Self::MaximumPacketSize(value) => value.encode(buf)?,
            Self::WildcardSubscriptionAvailable(value) => value.encode(buf)?,
            Self::SubscriptionIdentifierAvailable(value) => value.encode(buf)?,
            Self::SharedSubscriptionAvailable(value) => value.encode(buf)?,
        };
        Ok(PropertyType::bytes() + value_bytes)
    }
}

/// Ordered list of properties, preceded on the wire by a variable byte
/// integer holding the total property length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(Vec<Property>);

impl Properties {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn props(&self) -> &[Property] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, property: Property) -> &mut Self {
        self.0.push(property);
        self
    }

    /// Remove all properties of `property_type`, returns true if any
    /// was removed.
    pub fn remove(&mut self, property_type: PropertyType) -> bool {
        let old_len = self.0.len();
        self.0.retain(|p| p.property_type() != property_type);
        self.0.len() != old_len
    }

    fn first(&self, property_type: PropertyType) -> Option<&Property> {
        self.0.iter().find(|p| p.property_type() == property_type)
    }

    /// Get byte length in packet, including the length prefix itself.
    #[must_use]
    pub fn bytes(&self) -> usize {
        let payload_bytes: usize = self.0.iter().map(Property::bytes).sum();
        // Length prefix is always encodable, payload is at most 27 * 64k.
        let prefix = VarInt::from(payload_bytes).map_or(1, |v| v.bytes());
        prefix + payload_bytes
    }

    #[must_use]
    pub fn session_expiry_interval(&self) -> Option<u32> {
        match self.first(PropertyType::SessionExpiryInterval) {
            Some(Property::SessionExpiryInterval(value)) => Some(value.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn receive_maximum(&self) -> Option<u16> {
        match self.first(PropertyType::ReceiveMaximum) {
            Some(Property::ReceiveMaximum(value)) => Some(value.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn maximum_packet_size(&self) -> Option<u32> {
        match self.first(PropertyType::MaximumPacketSize) {
            Some(Property::MaximumPacketSize(value)) => Some(value.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn topic_alias_maximum(&self) -> Option<u16> {
        match self.first(PropertyType::TopicAliasMaximum) {
            Some(Property::TopicAliasMaximum(value)) => Some(value.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn topic_alias(&self) -> Option<u16> {
        match self.first(PropertyType::TopicAlias) {
            Some(Property::TopicAlias(value)) => Some(value.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn authentication_method(&self) -> Option<&str> {
        match self.first(PropertyType::AuthenticationMethod) {
            Some(Property::AuthenticationMethod(value)) => Some(value.as_ref()),
            _ => None,
        }
    }

    #[must_use]
    pub fn authentication_data(&self) -> Option<&[u8]> {
        match self.first(PropertyType::AuthenticationData) {
            Some(Property::AuthenticationData(value)) => Some(value.as_ref()),
            _ => None,
        }
    }

    #[must_use]
    pub fn request_response_information(&self) -> bool {
        match self.first(PropertyType::RequestResponseInformation) {
            Some(Property::RequestResponseInformation(value)) => value.value(),
            _ => false,
        }
    }

    #[must_use]
    pub fn will_delay_interval(&self) -> u32 {
        match self.first(PropertyType::WillDelayInterval) {
            Some(Property::WillDelayInterval(value)) => value.value(),
            _ => 0,
        }
    }

    #[must_use]
    pub fn message_expiry_interval(&self) -> Option<u32> {
        match self.first(PropertyType::MessageExpiryInterval) {
            Some(Property::MessageExpiryInterval(value)) => Some(value.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn payload_format_indicator(&self) -> bool {
        match self.first(PropertyType::PayloadFormatIndicator) {
            Some(Property::PayloadFormatIndicator(value)) => value.value(),
            _ => false,
        }
    }

    #[must_use]
    pub fn subscription_identifier(&self) -> Option<usize> {
        match self.first(PropertyType::SubscriptionIdentifier) {
            Some(Property::SubscriptionIdentifier(value)) => Some(value.value()),
            _ => None,
        }
    }

    /// Replace the message expiry interval with `interval`.
    pub fn set_message_expiry_interval(&mut self, interval: u32) {
        self.remove(PropertyType::MessageExpiryInterval);
        self.push(Property::MessageExpiryInterval(U32Data::new(interval)));
    }
}

impl DecodePacket for Properties {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let property_length = VarInt::decode(ba)?;
        let end_offset = ba.offset() + property_length.value();
        let mut properties = Vec::new();
        while ba.offset() < end_offset {
            properties.push(Property::decode(ba)?);
        }
        if ba.offset() != end_offset {
            return Err(DecodeError::InvalidRemainingLength);
        }
        Ok(Self(properties))
    }
}

impl EncodePacket for Properties {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let payload_bytes: usize = self.0.iter().map(Property::bytes).sum();
        let property_length = VarInt::from(payload_bytes)?;
        let mut bytes_written = property_length.encode(buf)?;
        for property in &self.0 {
            bytes_written += property.encode(buf)?;
        }
        Ok(bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_round_trip() {
        let properties = Properties::new();
        let mut buf = Vec::new();
        assert_eq!(properties.encode(&mut buf), Ok(1));
        assert_eq!(&buf, &[0x00]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(Properties::decode(&mut ba), Ok(properties));
    }

    #[test]
    fn test_round_trip() {
        let mut properties = Properties::new();
        properties
            .push(Property::SessionExpiryInterval(U32Data::new(60)))
            .push(Property::ReceiveMaximum(U16Data::new(10)))
            .push(Property::UserProperty(
                StringPairData::from("k", "v").unwrap(),
            ))
            .push(Property::UserProperty(
                StringPairData::from("k", "v2").unwrap(),
            ));

        let mut buf = Vec::new();
        let bytes_written = properties.encode(&mut buf).unwrap();
        assert_eq!(bytes_written, properties.bytes());

        let mut ba = ByteArray::new(&buf);
        let decoded = Properties::decode(&mut ba).unwrap();
        assert_eq!(decoded, properties);
        assert_eq!(decoded.session_expiry_interval(), Some(60));
        assert_eq!(decoded.receive_maximum(), Some(10));
    }

    #[test]
    fn test_unknown_property_id() {
        let buf = [0x02, 0x7e, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            Properties::decode(&mut ba),
            Err(DecodeError::InvalidPropertyType)
        );
    }

    #[test]
    fn test_zero_receive_maximum() {
        let buf = [0x03, 0x21, 0x00, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            Properties::decode(&mut ba),
            Err(DecodeError::InvalidPropertyValue)
        );
    }

    #[test]
    fn test_check_property_type_list() {
        let mut properties = Properties::new();
        properties.push(Property::TopicAlias(U16Data::new(4)));
        assert!(check_property_type_list(
            properties.props(),
            &[PropertyType::TopicAlias, PropertyType::UserProperty]
        )
        .is_ok());
        assert_eq!(
            check_property_type_list(properties.props(), &[PropertyType::UserProperty]),
            Err(PropertyType::TopicAlias)
        );

        // Duplicate non-repeatable property.
        properties.push(Property::TopicAlias(U16Data::new(5)));
        assert_eq!(
            check_property_type_list(properties.props(), &[PropertyType::TopicAlias]),
            Err(PropertyType::TopicAlias)
        );
    }
}
