// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// A Reason Code is a one byte unsigned value that indicates the result
/// of an operation.
///
/// Reason Codes less than 0x80 indicate successful completion of an
/// operation. The normal Reason Code for success is 0. Reason Code values
/// of 0x80 or greater indicate failure.
///
/// The CONNACK, PUBACK, PUBREC, PUBREL, PUBCOMP, DISCONNECT and AUTH
/// packets have a single Reason Code as part of the variable header.
/// The SUBACK and UNSUBACK packets contain a list of one or more Reason
/// Codes in the payload.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReasonCode {
    /// Success / Normal disconnection / Granted QoS 0.
    #[default]
    Success = 0x00,

    /// The subscription is accepted and the maximum QoS sent will be QoS 1.
    GrantedQoS1 = 0x01,

    /// The subscription is accepted and any received QoS will be sent.
    GrantedQoS2 = 0x02,

    /// The Client wishes to disconnect but requires that the Server also
    /// publishes its Will Message.
    DisconnectWithWillMessage = 0x04,

    /// The message is accepted but there are no subscribers.
    NoMatchingSubscribers = 0x10,

    /// No matching Topic Filter is being used by the Client.
    NoSubscriptionExisted = 0x11,

    /// Continue the authentication with another step.
    ContinueAuthentication = 0x18,

    /// Initiate a re-authentication.
    ReAuthenticate = 0x19,

    /// The Server does not wish to reveal the reason for the failure,
    /// or none of the other Reason Codes apply.
    UnspecifiedError = 0x80,

    /// Data within the packet could not be correctly parsed.
    MalformedPacket = 0x81,

    /// Data in the packet does not conform to this specification.
    ProtocolError = 0x82,

    /// The packet is valid but is not accepted by this Server.
    ImplementationSpecificError = 0x83,

    /// The Server does not support the version of the MQTT protocol
    /// requested by the Client.
    UnsupportedProtocolVersion = 0x84,

    /// The Client Identifier is a valid string but is not allowed
    /// by the Server.
    ClientIdentifierNotValid = 0x85,

    /// The Server does not accept the User Name or Password specified
    /// by the Client.
    BadUserNameOrPassword = 0x86,

    /// The request is not authorized.
    NotAuthorized = 0x87,

    /// The MQTT Server is not available.
    ServerUnavailable = 0x88,

    /// The Server is busy. Try again later.
    ServerBusy = 0x89,

    /// This Client has been banned by administrative action.
    Banned = 0x8a,

    /// The Server is shutting down.
    ServerShuttingDown = 0x8b,

    /// The authentication method is not supported or does not match
    /// the authentication method currently in use.
    BadAuthenticationMethod = 0x8c,

    /// The Connection is closed because no packet has been received for
    /// 1.5 times the Keepalive time.
    KeepAliveTimeout = 0x8d,

    /// Another Connection using the same ClientID has connected causing
    /// this Connection to be closed.
    SessionTakenOver = 0x8e,

    /// The Topic Filter is correctly formed, but is not accepted.
    TopicFilterInvalid = 0x8f,

    /// The Topic Name is correctly formed, but is not accepted.
    TopicNameInvalid = 0x90,

    /// The Packet Identifier is already in use.
    PacketIdentifierInUse = 0x91,

    /// The Packet Identifier is not known.
    PacketIdentifierNotFound = 0x92,

    /// The Client or Server has received more than Receive Maximum
    /// publications for which it has not sent PUBACK or PUBCOMP.
    ReceiveMaximumExceeded = 0x93,

    /// The topic alias is zero or larger than the maximum advertised.
    TopicAliasInvalid = 0x94,

    /// The packet exceeded the maximum permissible size.
    PacketTooLarge = 0x95,

    /// The received data rate is too high.
    MessageRateTooHigh = 0x96,

    /// An implementation or administrative imposed limit has been exceeded.
    QuotaExceeded = 0x97,

    /// The Connection is closed due to an administrative action.
    AdministrativeAction = 0x98,

    /// The payload format does not match the specified Payload Format
    /// Indicator.
    PayloadFormatInvalid = 0x99,

    /// The Server does not support retained messages.
    RetainNotSupported = 0x9a,

    /// The Client specified a QoS greater than the maximum QoS
    /// advertised in the CONNACK.
    QoSNotSupported = 0x9b,

    /// The Client should temporarily use another server.
    UseAnotherServer = 0x9c,

    /// The Client should permanently use another server.
    ServerMoved = 0x9d,

    /// The Server does not support Shared Subscriptions.
    SharedSubscriptionNotSupported = 0x9e,

    /// The connection rate limit has been exceeded.
    ConnectionRateExceeded = 0x9f,

    /// The maximum connection time authorized for this connection
    /// has been exceeded.
    MaximumConnectTime = 0xa0,

    /// The Server does not support Subscription Identifiers.
    SubscriptionIdentifiersNotSupported = 0xa1,

    /// The Server does not support Wildcard Subscriptions.
    WildcardSubscriptionsNotSupported = 0xa2,
}

impl ReasonCode {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }

    /// Reason code values of 0x80 or greater indicate failure.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        (*self as u8) >= 0x80
    }
}

impl TryFrom<u8> for ReasonCode {
    type Error = DecodeError;

    #[allow(clippy::too_many_lines)]
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x00 => Ok(Self::Success),
            0x01 => Ok(Self::GrantedQoS1),
            0x02 => Ok(Self::GrantedQoS2),
            0x04 => Ok(Self::DisconnectWithWillMessage),
            0x10 => Ok(Self::NoMatchingSubscribers),
            0x11 => Ok(Self::NoSubscriptionExisted),
            0x18 => Ok(Self::ContinueAuthentication),
            0x19 => Ok(Self::ReAuthenticate),
            0x80 => Ok(Self::UnspecifiedError),
            0x81 => Ok(Self::MalformedPacket),
            0x82 => Ok(Self::ProtocolError),
            0x83 => Ok(Self::ImplementationSpecificError),
            0x84 => Ok(Self::UnsupportedProtocolVersion),
            0x85 => Ok(Self::ClientIdentifierNotValid),
            0x86 => Ok(Self::BadUserNameOrPassword),
            0x87 => Ok(Self::NotAuthorized),
            0x88 => Ok(Self::ServerUnavailable),
            0x89 => Ok(Self::ServerBusy),
            0x8a => Ok(Self::Banned),
            0x8b => Ok(Self::ServerShuttingDown),
            0x8c => Ok(Self::BadAuthenticationMethod),
            0x8d => Ok(Self::KeepAliveTimeout),
            0x8e => Ok(Self::SessionTakenOver),
            0x8f => Ok(Self::TopicFilterInvalid),
            0x90 => Ok(Self::TopicNameInvalid),
            0x91 => Ok(Self::PacketIdentifierInUse),
            0x92 => Ok(Self::PacketIdentifierNotFound),
            0x93 => Ok(Self::ReceiveMaximumExceeded),
            0x94 => Ok(Self::TopicAliasInvalid),
            0x95 => Ok(Self::PacketTooLarge),
            0x96 => Ok(Self::MessageRateTooHigh),
            0x97 => Ok(Self::QuotaExceeded),
            0x98 => Ok(Self::AdministrativeAction),
            0x99 => Ok(Self::PayloadFormatInvalid),
            0x9a => Ok(Self::RetainNotSupported),
            0x9b => Ok(Self::QoSNotSupported),
            0x9c => Ok(Self::UseAnotherServer),
            0x9d => Ok(Self::ServerMoved),
            0x9e => Ok(Self::SharedSubscriptionNotSupported),
            0x9f => Ok(Self::ConnectionRateExceeded),
            0xa0 => Ok(Self::MaximumConnectTime),
            0xa1 => Ok(Self::SubscriptionIdentifiersNotSupported),
            0xa2 => Ok(Self::WildcardSubscriptionsNotSupported),
            _ => Err(DecodeError::InvalidReasonCode),
        }
    }
}

impl DecodePacket for ReasonCode {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        Self::try_from(ba.read_byte()?)
    }
}

impl EncodePacket for ReasonCode {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(*self as u8);
        Ok(Self::bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_error() {
        assert!(!ReasonCode::Success.is_error());
        assert!(!ReasonCode::GrantedQoS2.is_error());
        assert!(!ReasonCode::ContinueAuthentication.is_error());
        assert!(ReasonCode::UnspecifiedError.is_error());
        assert!(ReasonCode::SessionTakenOver.is_error());
        assert!(ReasonCode::WildcardSubscriptionsNotSupported.is_error());
    }

    #[test]
    fn test_try_from() {
        assert_eq!(ReasonCode::try_from(0x8e), Ok(ReasonCode::SessionTakenOver));
        assert_eq!(ReasonCode::try_from(0xa2), Ok(ReasonCode::WildcardSubscriptionsNotSupported));
        assert_eq!(ReasonCode::try_from(0x03), Err(DecodeError::InvalidReasonCode));
    }
}
