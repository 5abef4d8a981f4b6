// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Inbound PUBLISH handling and the fan-out path.

use codec::{
    FramePacket, PacketId, Property, PropertyType, ProtocolLevel, QoS, ReasonCode, VarInt,
};
use std::collections::HashMap;
use std::time::Instant;

use super::Dispatcher;
use crate::commands::DispatcherToConnectionCmd;
use crate::sub_trie::Subscription;
use crate::types::{ConnectionId, Message, Will};

impl Dispatcher {
    pub(crate) async fn on_publish_v3(
        &mut self,
        connection_id: ConnectionId,
        publish: &codec::v3::PublishPacket,
    ) -> bool {
        let message = Message {
            topic: publish.topic().to_string(),
            qos: publish.qos(),
            retain: publish.retain(),
            payload: publish.message().clone(),
            properties: codec::Properties::new(),
            received_at: Instant::now(),
        };
        self.handle_publish(connection_id, message, publish.packet_id(), publish.dup())
            .await
    }

    pub(crate) async fn on_publish_v5(
        &mut self,
        connection_id: ConnectionId,
        publish: &codec::v5::PublishPacket,
    ) -> bool {
        // A PUBLISH packet sent from a Client to a Server MUST NOT contain
        // a Subscription Identifier [MQTT-3.3.4-6].
        if publish.properties().subscription_identifier().is_some() {
            self.close_with_fault(connection_id, ReasonCode::ProtocolError)
                .await;
            return false;
        }

        let mut properties = publish.properties().clone();
        // The alias was resolved by the connection and is scoped to it.
        properties.remove(PropertyType::TopicAlias);

        let message = Message {
            topic: publish.topic().to_string(),
            qos: publish.qos(),
            retain: publish.retain(),
            payload: publish.message().clone(),
            properties,
            received_at: Instant::now(),
        };
        self.handle_publish(connection_id, message, publish.packet_id(), publish.dup())
            .await
    }

    async fn handle_publish(
        &mut self,
        connection_id: ConnectionId,
        message: Message,
        packet_id: PacketId,
        dup: bool,
    ) -> bool {
        let Some((client_id, protocol_level)) = self
            .connections
            .get(&connection_id)
            .and_then(|ctx| ctx.client_id.clone().map(|id| (id, ctx.protocol_level)))
        else {
            self.close_with_fault(connection_id, ReasonCode::ProtocolError)
                .await;
            return false;
        };

        // Server wide caps; violating them is a connection level fault.
        if message.qos > self.config.mqtt().maximum_qos() {
            self.close_with_fault(connection_id, ReasonCode::QoSNotSupported)
                .await;
            return false;
        }
        if message.retain && !self.config.mqtt().retain_available() {
            self.close_with_fault(connection_id, ReasonCode::RetainNotSupported)
                .await;
            return false;
        }

        let authorized =
            self.hooks
                .authorizer
                .authorize(&client_id, &message.topic, false);
        let payload_valid = !message.properties.payload_format_indicator()
            || std::str::from_utf8(&message.payload).is_ok();

        match message.qos {
            QoS::AtMostOnce => {
                if authorized && payload_valid {
                    self.apply_retain_and_fan_out(&client_id, message).await;
                } else {
                    log::debug!("dispatcher: Drop QoS 0 publish from {client_id}");
                }
                true
            }
            QoS::AtLeastOnce => {
                // A packet id still tied to an open QoS 2 exchange cannot be
                // reused for a QoS 1 flow.
                let id_in_use = self
                    .sessions
                    .get(&client_id)
                    .is_some_and(|session| session.received_qos2_contains(packet_id));
                let reason = if !authorized {
                    ReasonCode::NotAuthorized
                } else if !payload_valid {
                    ReasonCode::PayloadFormatInvalid
                } else if id_in_use {
                    ReasonCode::PacketIdentifierInUse
                } else {
                    ReasonCode::Success
                };

                let ack = match protocol_level {
                    ProtocolLevel::V5 => FramePacket::V5(codec::v5::Packet::PublishAck(
                        codec::v5::PublishAckPacket::with_reason(packet_id, reason),
                    )),
                    _ => FramePacket::V3(codec::v3::Packet::PublishAck(
                        codec::v3::PublishAckPacket::new(packet_id),
                    )),
                };
                self.send_to(connection_id, DispatcherToConnectionCmd::Send(ack))
                    .await;

                if reason == ReasonCode::Success {
                    self.apply_retain_and_fan_out(&client_id, message).await;
                }
                true
            }
            QoS::ExactOnce => {
                let (already_received, in_flight) = self
                    .sessions
                    .get(&client_id)
                    .map_or((false, 0), |session| {
                        (
                            session.received_qos2_contains(packet_id),
                            session.received_qos2_len(),
                        )
                    });

                let reason = if !authorized {
                    ReasonCode::NotAuthorized
                } else if !payload_valid {
                    ReasonCode::PayloadFormatInvalid
                } else if already_received && !dup {
                    ReasonCode::PacketIdentifierInUse
                } else if !already_received
                    && in_flight + 1 > usize::from(self.config.mqtt().receive_maximum())
                {
                    ReasonCode::ReceiveMaximumExceeded
                } else {
                    ReasonCode::Success
                };

                if reason == ReasonCode::Success && !already_received {
                    if message.retain {
                        self.retain.set(&message, &client_id);
                    }
                    if let Some(session) = self.sessions.get_mut(&client_id) {
                        session.store_received_qos2(packet_id, message);
                    }
                }

                let ack = match protocol_level {
                    ProtocolLevel::V5 => FramePacket::V5(codec::v5::Packet::PublishReceived(
                        codec::v5::PublishReceivedPacket::with_reason(packet_id, reason),
                    )),
                    _ => FramePacket::V3(codec::v3::Packet::PublishReceived(
                        codec::v3::PublishReceivedPacket::new(packet_id),
                    )),
                };
                self.send_to(connection_id, DispatcherToConnectionCmd::Send(ack))
                    .await;
                true
            }
        }
    }

    /// PUBREL releases a stored QoS 2 publish: acknowledge with PUBCOMP,
    /// then fan the message out.
    pub(crate) async fn on_publish_release(
        &mut self,
        connection_id: ConnectionId,
        packet_id: PacketId,
    ) -> bool {
        let mut released = None;
        let mut protocol_level = ProtocolLevel::V311;
        let mut client_id = String::new();
        if let Some(session) = self.session_of_connection_mut(connection_id) {
            protocol_level = session.protocol_level();
            client_id = session.client_id().to_string();
            released = session.release_received_qos2(packet_id);
        }

        let ack = match (protocol_level, released.is_some()) {
            (ProtocolLevel::V5, true) => FramePacket::V5(codec::v5::Packet::PublishComplete(
                codec::v5::PublishCompletePacket::new(packet_id),
            )),
            (ProtocolLevel::V5, false) => FramePacket::V5(codec::v5::Packet::PublishComplete(
                codec::v5::PublishCompletePacket::with_reason(
                    packet_id,
                    ReasonCode::PacketIdentifierNotFound,
                ),
            )),
            (_, _) => FramePacket::V3(codec::v3::Packet::PublishComplete(
                codec::v3::PublishCompletePacket::new(packet_id),
            )),
        };
        self.send_to(connection_id, DispatcherToConnectionCmd::Send(ack))
            .await;

        if let Some(message) = released {
            // The retained store was already updated when the PUBLISH
            // arrived; only delivery was deferred to the release.
            self.publish_message(&client_id, message).await;
        }
        true
    }

    /// Update the retained store if asked to, then fan out.
    pub(crate) async fn apply_retain_and_fan_out(&mut self, origin: &str, message: Message) {
        if message.retain {
            self.retain.set(&message, origin);
        }
        self.publish_message(origin, message).await;
    }

    /// Deliver `message` to every matching subscription.
    ///
    /// Shared subscriptions deliver to exactly one group member: the one
    /// whose most recent delivery for that share name is oldest.
    pub(crate) async fn publish_message(&mut self, origin: &str, message: Message) {
        let now = Instant::now();
        let matches: Vec<Subscription> = self
            .sub_trie
            .matches(&message.topic)
            .into_iter()
            .cloned()
            .collect();

        let mut shared_groups: HashMap<String, Vec<Subscription>> = HashMap::new();
        for subscription in matches {
            if let Some(share_name) = subscription.share_name() {
                shared_groups
                    .entry(share_name.to_string())
                    .or_default()
                    .push(subscription);
                continue;
            }
            if subscription.no_local() && subscription.client_id() == origin {
                continue;
            }
            self.deliver_to_subscription(&subscription, &message, now)
                .await;
        }

        for (share_name, members) in shared_groups {
            let chosen = members
                .iter()
                .min_by_key(|subscription| {
                    self.sessions
                        .get(subscription.client_id())
                        .map_or(0, |session| session.share_tick(&share_name))
                })
                .cloned();
            if let Some(subscription) = chosen {
                let tick = self.next_delivery_tick();
                if let Some(session) = self.sessions.get_mut(subscription.client_id()) {
                    session.share_delivered(&share_name, tick);
                }
                self.deliver_to_subscription(&subscription, &message, now)
                    .await;
            }
        }
    }

    /// Hand one message copy to a subscriber session, applying the
    /// subscription options.
    async fn deliver_to_subscription(
        &mut self,
        subscription: &Subscription,
        message: &Message,
        now: Instant,
    ) {
        let mut outgoing = message.clone();
        outgoing.qos = outgoing.qos.min(subscription.qos());
        outgoing.retain = if subscription.retain_as_published() {
            message.retain
        } else {
            false
        };
        if let Some(subscription_id) = subscription.subscription_id() {
            if let Ok(subscription_id) = VarInt::from(subscription_id) {
                outgoing
                    .properties
                    .push(Property::SubscriptionIdentifier(subscription_id));
            }
        }

        let Some(session) = self.sessions.get_mut(subscription.client_id()) else {
            return;
        };
        let connection_id = session.connection_id();
        match session.publish(outgoing, now) {
            Ok(packets) => {
                if let Some(connection_id) = connection_id {
                    self.send_all(connection_id, packets).await;
                }
            }
            Err(err) => {
                log::warn!(
                    "dispatcher: Drop publish to {}: {err}",
                    subscription.client_id()
                );
            }
        }
    }

    /// Publish a will message on the owner's behalf.
    pub(crate) async fn publish_will(&mut self, client_id: &str, will: Will) {
        log::info!("dispatcher: Publish will of {client_id} to {}", will.topic);
        let message = Message {
            topic: will.topic,
            qos: will.qos.min(self.config.mqtt().maximum_qos()),
            retain: will.retain,
            payload: will.payload,
            properties: will.properties,
            received_at: Instant::now(),
        };
        self.apply_retain_and_fan_out(client_id, message).await;
    }
}
