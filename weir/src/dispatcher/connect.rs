// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! CONNECT handshake, enhanced authentication and DISCONNECT handling.

use codec::{
    BinaryData, FramePacket, Properties, Property, ProtocolLevel, QoS, ReasonCode, StringData,
    U16Data, U32Data,
};
use std::time::Instant;

use super::{Dispatcher, PendingConnect};
use crate::commands::DispatcherToConnectionCmd;
use crate::hooks::AuthDecision;
use crate::session::{Session, EXPIRY_NEVER};
use crate::types::{ConnectionId, Will};

/// CONNECT fields normalized across protocol levels.
pub(crate) struct ConnectData {
    protocol_level: ProtocolLevel,
    clean_start: bool,
    keep_alive: u16,
    client_id: String,
    username: Option<String>,
    password: Option<Vec<u8>>,
    will: Option<Will>,

    /// Requested session expiry in seconds; derived from the clean session
    /// flag at protocol level 4.
    session_expiry_interval: u32,

    /// The client's receive maximum, our send window towards it.
    receive_maximum: u16,

    request_response_information: bool,
}

impl ConnectData {
    fn from_v3(packet: &codec::v3::ConnectPacket) -> Self {
        let flags = packet.connect_flags();
        let will = packet.will_topic().map(|topic| Will {
            topic: topic.to_string(),
            payload: codec::Bytes::copy_from_slice(packet.will_message()),
            qos: flags.will_qos(),
            retain: flags.will_retain(),
            delay_interval: 0,
            properties: Properties::new(),
        });
        Self {
            protocol_level: packet.protocol_level(),
            clean_start: flags.clean_session(),
            keep_alive: packet.keep_alive(),
            client_id: packet.client_id().to_string(),
            username: flags
                .has_username()
                .then(|| packet.username().to_string()),
            password: flags.has_password().then(|| packet.password().to_vec()),
            will,
            // A v3.1.1 session either dies with the connection or is kept
            // until the client returns with clean session set.
            session_expiry_interval: if flags.clean_session() {
                0
            } else {
                EXPIRY_NEVER
            },
            receive_maximum: u16::MAX,
            request_response_information: false,
        }
    }

    fn from_v5(packet: &codec::v5::ConnectPacket) -> Self {
        let flags = packet.connect_flags();
        let will = packet.will_topic().map(|topic| {
            let mut properties = packet.will_properties().clone();
            let delay_interval = properties.will_delay_interval();
            // The delay is broker side state, not part of the published
            // message.
            properties.remove(codec::PropertyType::WillDelayInterval);
            Will {
                topic: topic.to_string(),
                payload: codec::Bytes::copy_from_slice(packet.will_message()),
                qos: flags.will_qos(),
                retain: flags.will_retain(),
                delay_interval,
                properties,
            }
        });
        Self {
            protocol_level: packet.protocol_level(),
            clean_start: packet.clean_start(),
            keep_alive: packet.keep_alive(),
            client_id: packet.client_id().to_string(),
            username: flags
                .has_username()
                .then(|| packet.username().to_string()),
            password: flags.has_password().then(|| packet.password().to_vec()),
            will,
            session_expiry_interval: packet
                .properties()
                .session_expiry_interval()
                .unwrap_or(0),
            receive_maximum: packet
                .properties()
                .receive_maximum()
                .unwrap_or(u16::MAX),
            request_response_information: packet.properties().request_response_information(),
        }
    }
}

impl Dispatcher {
    pub(crate) async fn on_connect(
        &mut self,
        connection_id: ConnectionId,
        packet: &FramePacket,
    ) -> bool {
        match packet {
            FramePacket::V3(codec::v3::Packet::Connect(connect)) => {
                if let Some(ctx) = self.connections.get_mut(&connection_id) {
                    ctx.protocol_level = connect.protocol_level();
                }
                let data = ConnectData::from_v3(connect);
                self.connect_with_data(connection_id, data, None).await
            }
            FramePacket::V5(codec::v5::Packet::Connect(connect)) => {
                if let Some(ctx) = self.connections.get_mut(&connection_id) {
                    ctx.protocol_level = ProtocolLevel::V5;
                }
                let auth_method = connect.properties().authentication_method();
                match auth_method {
                    None => {
                        let data = ConnectData::from_v5(connect);
                        self.connect_with_data(connection_id, data, None).await
                    }
                    Some(auth_method) => {
                        let auth_method = auth_method.to_string();
                        self.start_enhanced_auth(connection_id, connect.clone(), auth_method)
                            .await
                    }
                }
            }
            _ => false,
        }
    }

    /// First round of v5 enhanced authentication, driven by the
    /// authentication method named in CONNECT.
    async fn start_enhanced_auth(
        &mut self,
        connection_id: ConnectionId,
        connect: codec::v5::ConnectPacket,
        auth_method: String,
    ) -> bool {
        let decision = self
            .hooks
            .enhanced_authenticators
            .get(&auth_method)
            .map(|provider| {
                provider.auth_exchange(
                    connect.client_id(),
                    connect.properties().authentication_data(),
                )
            });
        let Some(decision) = decision else {
            log::warn!("dispatcher: No enhanced auth provider for method {auth_method}");
            return self
                .reject_connect(
                    connection_id,
                    ProtocolLevel::V5,
                    ReasonCode::BadAuthenticationMethod,
                )
                .await;
        };
        match decision {
            AuthDecision::NeedsMore(server_data) => {
                if let Some(ctx) = self.connections.get_mut(&connection_id) {
                    ctx.pending_connect = Some(PendingConnect {
                        packet: connect,
                        auth_method: auth_method.clone(),
                    });
                }
                let packet = build_auth_continue(&auth_method, server_data);
                self.send_to(connection_id, DispatcherToConnectionCmd::Send(packet))
                    .await;
                true
            }
            AuthDecision::Success(server_data) => {
                let data = ConnectData::from_v5(&connect);
                self.connect_with_data(
                    connection_id,
                    data,
                    Some((auth_method, server_data)),
                )
                .await
            }
            AuthDecision::Failed => {
                self.reject_connect(connection_id, ProtocolLevel::V5, ReasonCode::NotAuthorized)
                    .await
            }
        }
    }

    /// AUTH packet received, either during the handshake or as a
    /// re-authentication on a live connection.
    pub(crate) async fn on_auth(
        &mut self,
        connection_id: ConnectionId,
        auth: codec::v5::AuthPacket,
    ) -> bool {
        let Some(ctx) = self.connections.get_mut(&connection_id) else {
            return false;
        };

        // Handshake rounds carry the held back CONNECT.
        if let Some(pending) = ctx.pending_connect.take() {
            let PendingConnect {
                packet,
                auth_method,
            } = pending;
            let decision = self
                .hooks
                .enhanced_authenticators
                .get(&auth_method)
                .map(|provider| {
                    provider.auth_exchange(
                        packet.client_id(),
                        auth.properties().authentication_data(),
                    )
                });
            let Some(decision) = decision else {
                return self
                    .reject_connect(
                        connection_id,
                        ProtocolLevel::V5,
                        ReasonCode::BadAuthenticationMethod,
                    )
                    .await;
            };
            return match decision {
                AuthDecision::NeedsMore(server_data) => {
                    if let Some(ctx) = self.connections.get_mut(&connection_id) {
                        ctx.pending_connect = Some(PendingConnect {
                            packet,
                            auth_method: auth_method.clone(),
                        });
                    }
                    let reply = build_auth_continue(&auth_method, server_data);
                    self.send_to(connection_id, DispatcherToConnectionCmd::Send(reply))
                        .await;
                    true
                }
                AuthDecision::Success(server_data) => {
                    let data = ConnectData::from_v5(&packet);
                    self.connect_with_data(
                        connection_id,
                        data,
                        Some((auth_method, server_data)),
                    )
                    .await
                }
                AuthDecision::Failed => {
                    self.reject_connect(
                        connection_id,
                        ProtocolLevel::V5,
                        ReasonCode::NotAuthorized,
                    )
                    .await
                }
            };
        }

        // Re-authentication on a connected session.
        let Some(auth_method) = ctx.auth_method.clone() else {
            self.close_with_fault(connection_id, ReasonCode::ProtocolError)
                .await;
            return false;
        };
        let client_id = ctx.client_id.clone().unwrap_or_default();
        let decision = self
            .hooks
            .enhanced_authenticators
            .get(&auth_method)
            .map(|provider| {
                provider.auth_exchange(&client_id, auth.properties().authentication_data())
            });
        let Some(decision) = decision else {
            self.close_with_fault(connection_id, ReasonCode::BadAuthenticationMethod)
                .await;
            return false;
        };
        match decision {
            AuthDecision::NeedsMore(server_data) => {
                let reply = build_auth_continue(&auth_method, server_data);
                self.send_to(connection_id, DispatcherToConnectionCmd::Send(reply))
                    .await;
                true
            }
            AuthDecision::Success(server_data) => {
                let mut reply = codec::v5::AuthPacket::new(ReasonCode::Success);
                if let Ok(method) = StringData::from(&auth_method) {
                    reply
                        .properties_mut()
                        .push(Property::AuthenticationMethod(method));
                }
                if let Some(server_data) = server_data {
                    if let Ok(server_data) = BinaryData::from_slice(&server_data) {
                        reply
                            .properties_mut()
                            .push(Property::AuthenticationData(server_data));
                    }
                }
                self.send_to(
                    connection_id,
                    DispatcherToConnectionCmd::Send(FramePacket::V5(codec::v5::Packet::Auth(
                        reply,
                    ))),
                )
                .await;
                true
            }
            AuthDecision::Failed => {
                self.close_with_fault(connection_id, ReasonCode::NotAuthorized)
                    .await;
                false
            }
        }
    }

    /// The handshake after any enhanced authentication has succeeded.
    #[allow(clippy::too_many_lines)]
    async fn connect_with_data(
        &mut self,
        connection_id: ConnectionId,
        mut data: ConnectData,
        auth: Option<(String, Option<Vec<u8>>)>,
    ) -> bool {
        let now = Instant::now();
        let mqtt = self.config.mqtt().clone();

        // A will the broker cannot honor rejects the whole CONNECT.
        if let Some(will) = &data.will {
            if will.retain && !mqtt.retain_available() {
                return self
                    .reject_connect(
                        connection_id,
                        data.protocol_level,
                        ReasonCode::RetainNotSupported,
                    )
                    .await;
            }
            if will.qos > mqtt.maximum_qos() {
                return self
                    .reject_connect(
                        connection_id,
                        data.protocol_level,
                        ReasonCode::QoSNotSupported,
                    )
                    .await;
            }
        }

        // Simple authentication; enhanced authentication already ran.
        if auth.is_none() {
            let granted = self.hooks.authenticator.authenticate(
                data.username.as_deref(),
                data.password.as_deref(),
            );
            match granted {
                Ok(true) => {}
                Ok(false) => {
                    return self
                        .reject_connect(
                            connection_id,
                            data.protocol_level,
                            ReasonCode::NotAuthorized,
                        )
                        .await;
                }
                Err(err) => {
                    log::error!("dispatcher: Authenticator failed: {err}");
                    return self
                        .reject_connect(
                            connection_id,
                            data.protocol_level,
                            ReasonCode::ImplementationSpecificError,
                        )
                        .await;
                }
            }
        }

        // Server assigned client id for an empty one; only valid together
        // with a clean start at protocol level 4 [MQTT-3.1.3-8].
        let mut assigned_client_id = false;
        if data.client_id.is_empty() {
            if data.protocol_level != ProtocolLevel::V5 && !data.clean_start {
                return self
                    .reject_connect(
                        connection_id,
                        data.protocol_level,
                        ReasonCode::ClientIdentifierNotValid,
                    )
                    .await;
            }
            data.client_id = loop {
                let candidate = format!("weir-{}", codec::utils::random_string(16));
                if !self.sessions.contains_key(&candidate) {
                    break candidate;
                }
            };
            assigned_client_id = true;
        }
        let client_id = data.client_id.clone();

        // At most one active connection per client id; the newcomer wins
        // and the old connection learns it was taken over.
        let takeover = self
            .sessions
            .get(&client_id)
            .filter(|session| session.is_connected())
            .map(|session| (session.connection_id(), session.protocol_level()));
        if let Some((old_connection, old_level)) = takeover {
            log::info!("dispatcher: Session {client_id} taken over");
            if let Some(old_connection) = old_connection {
                if let Some(old_ctx) = self.connections.get_mut(&old_connection) {
                    // The successor owns the session now; the old socket's
                    // teardown must not detach it.
                    old_ctx.client_id = None;
                }
                let packet = (old_level == ProtocolLevel::V5).then(|| {
                    FramePacket::V5(codec::v5::Packet::Disconnect(
                        codec::v5::DisconnectPacket::new(ReasonCode::SessionTakenOver),
                    ))
                });
                self.send_to(old_connection, DispatcherToConnectionCmd::Close(packet))
                    .await;
            }
            let mut pending_will = None;
            if let Some(session) = self.sessions.get_mut(&client_id) {
                session.detach(now);
                let fire_will = data.clean_start
                    || session.will().is_some_and(|will| will.delay_interval == 0);
                if fire_will {
                    pending_will = session.take_will();
                }
            }
            if let Some(will) = pending_will {
                self.publish_will(&client_id, will).await;
            }
        }

        let session_present = if self.sessions.contains_key(&client_id) {
            if data.clean_start {
                self.drop_session_state(&client_id);
                false
            } else {
                true
            }
        } else {
            false
        };

        let granted_expiry = data
            .session_expiry_interval
            .min(mqtt.maximum_session_expiry_interval());

        let session = self
            .sessions
            .entry(client_id.clone())
            .or_insert_with(|| Session::new(&client_id, data.protocol_level));
        session.set_session_expiry_interval(granted_expiry);
        session.set_will(data.will.take());
        session.attach(connection_id, data.protocol_level, data.receive_maximum);

        // Keep alive override: clients asking for more than the configured
        // maximum (or for none at all) are told to use the maximum.
        let maximum_keep_alive = self.config.general().maximum_keep_alive();
        let (keep_alive, server_keep_alive) = if maximum_keep_alive > 0
            && (data.keep_alive == 0 || data.keep_alive > maximum_keep_alive)
        {
            (maximum_keep_alive, Some(maximum_keep_alive))
        } else {
            (data.keep_alive, None)
        };

        let packet = if data.protocol_level == ProtocolLevel::V5 {
            let mut connect_ack =
                codec::v5::ConnectAckPacket::new(session_present, ReasonCode::Success);
            let properties = connect_ack.properties_mut();
            if granted_expiry != data.session_expiry_interval {
                properties.push(Property::SessionExpiryInterval(U32Data::new(granted_expiry)));
            }
            if mqtt.receive_maximum() != u16::MAX {
                properties.push(Property::ReceiveMaximum(U16Data::new(
                    mqtt.receive_maximum(),
                )));
            }
            if mqtt.maximum_qos() != QoS::ExactOnce {
                properties.push(Property::MaximumQoS(mqtt.maximum_qos()));
            }
            if !mqtt.retain_available() {
                properties.push(Property::RetainAvailable(codec::BoolData::new(false)));
            }
            if mqtt.maximum_packet_size() > 0 {
                properties.push(Property::MaximumPacketSize(U32Data::new(
                    mqtt.maximum_packet_size(),
                )));
            }
            if assigned_client_id {
                if let Ok(client_id) = StringData::from(&client_id) {
                    properties.push(Property::AssignedClientIdentifier(client_id));
                }
            }
            if mqtt.topic_alias_maximum() > 0 {
                properties.push(Property::TopicAliasMaximum(U16Data::new(
                    mqtt.topic_alias_maximum(),
                )));
            }
            if !mqtt.wildcard_subscription_available() {
                properties.push(Property::WildcardSubscriptionAvailable(
                    codec::BoolData::new(false),
                ));
            }
            if !mqtt.subscription_identifier_available() {
                properties.push(Property::SubscriptionIdentifierAvailable(
                    codec::BoolData::new(false),
                ));
            }
            if !mqtt.shared_subscription_available() {
                properties.push(Property::SharedSubscriptionAvailable(
                    codec::BoolData::new(false),
                ));
            }
            if let Some(server_keep_alive) = server_keep_alive {
                properties.push(Property::ServerKeepAlive(U16Data::new(server_keep_alive)));
            }
            if data.request_response_information {
                if let Some(response_information) = mqtt.response_information() {
                    if let Ok(response_information) = StringData::from(response_information) {
                        properties
                            .push(Property::ResponseInformation(response_information));
                    }
                }
            }
            if let Some((auth_method, server_data)) = &auth {
                if let Ok(auth_method) = StringData::from(auth_method) {
                    properties.push(Property::AuthenticationMethod(auth_method));
                }
                if let Some(server_data) = server_data {
                    if let Ok(server_data) = BinaryData::from_slice(server_data) {
                        properties.push(Property::AuthenticationData(server_data));
                    }
                }
            }
            FramePacket::V5(codec::v5::Packet::ConnectAck(connect_ack))
        } else {
            FramePacket::V3(codec::v3::Packet::ConnectAck(
                codec::v3::ConnectAckPacket::new(
                    session_present,
                    codec::v3::ConnectReturnCode::Accepted,
                ),
            ))
        };

        if let Some(ctx) = self.connections.get_mut(&connection_id) {
            ctx.client_id = Some(client_id.clone());
            ctx.protocol_level = data.protocol_level;
            ctx.auth_method = auth.map(|(auth_method, _)| auth_method);
        }

        self.hooks
            .persistence
            .persist_session(&client_id, granted_expiry);

        log::info!(
            "dispatcher: Session {client_id} connected, level {:?}, present {session_present}",
            data.protocol_level
        );
        self.send_to(
            connection_id,
            DispatcherToConnectionCmd::ConnectAck {
                packet,
                keep_alive,
                accepted: true,
            },
        )
        .await;

        // Retransmit unacknowledged in-flight messages of the resumed
        // session, then drain the queue.
        let packets = self
            .sessions
            .get_mut(&client_id)
            .map(|session| session.resend_pending(now))
            .unwrap_or_default();
        self.send_all(connection_id, packets).await;
        true
    }

    async fn reject_connect(
        &mut self,
        connection_id: ConnectionId,
        protocol_level: ProtocolLevel,
        reason: ReasonCode,
    ) -> bool {
        let packet = if protocol_level == ProtocolLevel::V5 {
            FramePacket::V5(codec::v5::Packet::ConnectAck(
                codec::v5::ConnectAckPacket::new(false, reason),
            ))
        } else {
            let return_code = match reason {
                ReasonCode::NotAuthorized => codec::v3::ConnectReturnCode::Unauthorized,
                ReasonCode::BadUserNameOrPassword => {
                    codec::v3::ConnectReturnCode::MalformedUsernamePassword
                }
                ReasonCode::ClientIdentifierNotValid => {
                    codec::v3::ConnectReturnCode::IdentifierRejected
                }
                ReasonCode::UnsupportedProtocolVersion => {
                    codec::v3::ConnectReturnCode::UnacceptedProtocol
                }
                _ => codec::v3::ConnectReturnCode::ServerUnavailable,
            };
            FramePacket::V3(codec::v3::Packet::ConnectAck(
                codec::v3::ConnectAckPacket::new(false, return_code),
            ))
        };
        log::info!("dispatcher: Reject connect on {connection_id}: {reason:?}");
        self.send_to(
            connection_id,
            DispatcherToConnectionCmd::ConnectAck {
                packet,
                keep_alive: 0,
                accepted: false,
            },
        )
        .await;
        false
    }

    /// Forget everything about a client id: subscriptions, persistence,
    /// session.
    pub(crate) fn drop_session_state(&mut self, client_id: &str) {
        for filter in self.sub_trie.remove_client(client_id) {
            self.hooks.persistence.remove_subscription(client_id, &filter);
        }
        self.sessions.remove(client_id);
    }

    pub(crate) async fn on_disconnect_v3(&mut self, connection_id: ConnectionId) -> bool {
        if let Some(session) = self.session_of_connection_mut(connection_id) {
            // A graceful disconnect always discards the will [MQTT-3.14.4-3].
            session.take_will();
        }
        self.send_to(connection_id, DispatcherToConnectionCmd::Close(None))
            .await;
        true
    }

    pub(crate) async fn on_disconnect_v5(
        &mut self,
        connection_id: ConnectionId,
        disconnect: &codec::v5::DisconnectPacket,
    ) -> bool {
        let requested_expiry = disconnect.properties().session_expiry_interval();
        let mut expiry_fault = false;
        if let Some(session) = self.session_of_connection_mut(connection_id) {
            if let Some(requested_expiry) = requested_expiry {
                // A session that negotiated expiry 0 cannot turn persistence
                // back on at disconnect time [MQTT-3.1.2-23].
                if session.session_expiry_interval() == 0 && requested_expiry != 0 {
                    expiry_fault = true;
                } else {
                    session.set_session_expiry_interval(requested_expiry);
                }
            }
            // The will survives only a disconnect that asks for it.
            if !expiry_fault && disconnect.reason_code() == ReasonCode::Success {
                session.take_will();
            }
        }

        if expiry_fault {
            self.close_with_fault(connection_id, ReasonCode::ProtocolError)
                .await;
            return false;
        }
        self.send_to(connection_id, DispatcherToConnectionCmd::Close(None))
            .await;
        true
    }
}

fn build_auth_continue(auth_method: &str, server_data: Option<Vec<u8>>) -> FramePacket {
    let mut packet = codec::v5::AuthPacket::new(ReasonCode::ContinueAuthentication);
    if let Ok(auth_method) = StringData::from(auth_method) {
        packet
            .properties_mut()
            .push(Property::AuthenticationMethod(auth_method));
    }
    if let Some(server_data) = server_data {
        if let Ok(server_data) = BinaryData::from_slice(&server_data) {
            packet
                .properties_mut()
                .push(Property::AuthenticationData(server_data));
        }
    }
    FramePacket::V5(codec::v5::Packet::Auth(packet))
}
