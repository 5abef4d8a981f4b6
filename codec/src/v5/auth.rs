// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use super::property::check_property_type_list;
use super::{Properties, PropertyType, ReasonCode};
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet,
    PacketType, VarIntError,
};

/// Properties available in the AUTH variable header.
pub const AUTH_PROPERTIES: &[PropertyType] = &[
    PropertyType::AuthenticationMethod,
    PropertyType::AuthenticationData,
    PropertyType::ReasonString,
    PropertyType::UserProperty,
];

/// Reason codes valid in an AUTH packet.
pub const AUTH_REASONS: &[ReasonCode] = &[
    ReasonCode::Success,
    ReasonCode::ContinueAuthentication,
    ReasonCode::ReAuthenticate,
];

/// `AuthPacket` is sent from Client to Server or Server to Client as part
/// of an extended authentication exchange. Only exists at protocol level 5.
///
/// The reason code and the property length can be omitted on the wire if
/// the reason is 0x00 (Success) and there are no properties.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuthPacket {
    reason_code: ReasonCode,

    properties: Properties,
}

impl AuthPacket {
    #[must_use]
    pub fn new(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub const fn reason_code(&self) -> ReasonCode {
        self.reason_code
    }

    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    fn is_short(&self) -> bool {
        self.reason_code == ReasonCode::Success && self.properties.is_empty()
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let remaining_length = if self.is_short() {
            0
        } else {
            ReasonCode::bytes() + self.properties.bytes()
        };
        FixedHeader::new(PacketType::Auth, remaining_length)
    }
}

impl DecodePacket for AuthPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Auth {
            return Err(DecodeError::InvalidPacketType);
        }

        if fixed_header.remaining_length() == 0 {
            return Ok(Self::new(ReasonCode::Success));
        }

        let reason_code = ReasonCode::decode(ba)?;
        if !AUTH_REASONS.contains(&reason_code) {
            return Err(DecodeError::InvalidReasonCode);
        }

        let properties = if fixed_header.remaining_length() > ReasonCode::bytes() {
            let properties = Properties::decode(ba)?;
            if let Err(property_type) =
                check_property_type_list(properties.props(), AUTH_PROPERTIES)
            {
                log::error!(
                    "v5/AuthPacket: property type {property_type:?} cannot be used in properties!"
                );
                return Err(DecodeError::InvalidPropertyType);
            }
            properties
        } else {
            Properties::new()
        };

        Ok(Self {
            reason_code,
            properties,
        })
    }
}

impl EncodePacket for AuthPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();
        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;
        if !self.is_short() {
            self.reason_code.encode(buf)?;
            self.properties.encode(buf)?;
        }
        Ok(buf.len() - old_len)
    }
}

impl Packet for AuthPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Auth
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let fixed_header = self.get_fixed_header()?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BinaryData, Property, StringData};

    #[test]
    fn test_continue_authentication() {
        let mut packet = AuthPacket::new(ReasonCode::ContinueAuthentication);
        packet
            .properties_mut()
            .push(Property::AuthenticationMethod(
                StringData::from("SCRAM-SHA-1").unwrap(),
            ))
            .push(Property::AuthenticationData(
                BinaryData::from_slice(b"challenge").unwrap(),
            ));

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), packet.bytes().unwrap());

        let mut ba = ByteArray::new(&buf);
        let decoded = AuthPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(
            decoded.properties().authentication_method(),
            Some("SCRAM-SHA-1")
        );
    }
}
