// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! SUBSCRIBE and UNSUBSCRIBE handling, including retained message
//! delivery at subscribe time.

use codec::topic::split_share;
use codec::v5::RetainHandling;
use codec::{FramePacket, Property, QoS, ReasonCode, VarInt};
use std::time::Instant;

use super::Dispatcher;
use crate::commands::DispatcherToConnectionCmd;
use crate::retain::RetainedMessage;
use crate::sub_trie::Subscription;
use crate::types::ConnectionId;

/// Reason codes that mandate a DISCONNECT after the SUBACK went out.
const DISCONNECT_AFTER_SUBACK: &[ReasonCode] = &[
    ReasonCode::SharedSubscriptionNotSupported,
    ReasonCode::SubscriptionIdentifiersNotSupported,
    ReasonCode::WildcardSubscriptionsNotSupported,
];

impl Dispatcher {
    pub(crate) async fn on_subscribe_v3(
        &mut self,
        connection_id: ConnectionId,
        subscribe: &codec::v3::SubscribePacket,
    ) -> bool {
        let Some(client_id) = self.client_id_of(connection_id) else {
            self.close_with_fault(connection_id, ReasonCode::ProtocolError)
                .await;
            return false;
        };

        let packet_id_in_use = self
            .sessions
            .get(&client_id)
            .is_some_and(|session| session.is_packet_id_in_use(subscribe.packet_id()));

        let mut acks = Vec::with_capacity(subscribe.topics().len());
        let mut accepted = Vec::new();
        for topic in subscribe.topics() {
            if packet_id_in_use
                || !self
                    .hooks
                    .authorizer
                    .authorize(&client_id, topic.topic(), true)
            {
                acks.push(codec::v3::SubscribeAck::Failed);
                continue;
            }
            let granted_qos = topic.qos().min(self.config.mqtt().maximum_qos());
            match Subscription::parse(
                &client_id,
                topic.topic(),
                granted_qos,
                false,
                false,
                RetainHandling::Send,
                None,
            ) {
                Ok(subscription) => {
                    let replaced = self.sub_trie.insert(subscription.clone());
                    self.hooks
                        .persistence
                        .persist_subscription(&client_id, topic.topic());
                    accepted.push((subscription, replaced));
                    acks.push(codec::v3::SubscribeAck::QoS(granted_qos));
                }
                Err(err) => {
                    log::warn!("dispatcher: Invalid filter from {client_id}: {err}");
                    acks.push(codec::v3::SubscribeAck::Failed);
                }
            }
        }

        let ack_packet = FramePacket::V3(codec::v3::Packet::SubscribeAck(
            codec::v3::SubscribeAckPacket::with_vec(subscribe.packet_id(), acks),
        ));
        self.send_to(connection_id, DispatcherToConnectionCmd::Send(ack_packet))
            .await;

        for (subscription, replaced) in accepted {
            self.deliver_retained(&client_id, &subscription, replaced)
                .await;
        }
        true
    }

    #[allow(clippy::too_many_lines)]
    pub(crate) async fn on_subscribe_v5(
        &mut self,
        connection_id: ConnectionId,
        subscribe: &codec::v5::SubscribePacket,
    ) -> bool {
        let Some(client_id) = self.client_id_of(connection_id) else {
            self.close_with_fault(connection_id, ReasonCode::ProtocolError)
                .await;
            return false;
        };
        let mqtt = self.config.mqtt().clone();

        let packet_id_in_use = self
            .sessions
            .get(&client_id)
            .is_some_and(|session| session.is_packet_id_in_use(subscribe.packet_id()));
        let subscription_id = subscribe.properties().subscription_identifier();

        let mut reasons = Vec::with_capacity(subscribe.topics().len());
        let mut accepted = Vec::new();
        for topic in subscribe.topics() {
            let filter = topic.topic();
            let share = split_share(filter);
            let Ok((share_name, match_filter)) = share else {
                reasons.push(ReasonCode::TopicFilterInvalid);
                continue;
            };

            // It is a Protocol Error to set the No Local bit on a Shared
            // Subscription [MQTT-3.8.3-4].
            if share_name.is_some() && topic.no_local() {
                self.close_with_fault(connection_id, ReasonCode::ProtocolError)
                    .await;
                return false;
            }

            let reason = if !self.hooks.authorizer.authorize(&client_id, filter, true) {
                ReasonCode::NotAuthorized
            } else if packet_id_in_use {
                ReasonCode::PacketIdentifierInUse
            } else if share_name.is_some() && !mqtt.shared_subscription_available() {
                ReasonCode::SharedSubscriptionNotSupported
            } else if subscription_id.is_some() && !mqtt.subscription_identifier_available() {
                ReasonCode::SubscriptionIdentifiersNotSupported
            } else if match_filter.contains(['+', '#'])
                && !mqtt.wildcard_subscription_available()
            {
                ReasonCode::WildcardSubscriptionsNotSupported
            } else {
                ReasonCode::Success
            };
            if reason != ReasonCode::Success {
                reasons.push(reason);
                continue;
            }

            let granted_qos = topic.qos().min(mqtt.maximum_qos());
            match Subscription::parse(
                &client_id,
                filter,
                granted_qos,
                topic.no_local(),
                topic.retain_as_published(),
                topic.retain_handling(),
                subscription_id,
            ) {
                Ok(subscription) => {
                    let replaced = self.sub_trie.insert(subscription.clone());
                    self.hooks
                        .persistence
                        .persist_subscription(&client_id, filter);
                    accepted.push((subscription, replaced));
                    reasons.push(match granted_qos {
                        QoS::AtMostOnce => ReasonCode::Success,
                        QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
                        QoS::ExactOnce => ReasonCode::GrantedQoS2,
                    });
                }
                Err(err) => {
                    log::warn!("dispatcher: Invalid filter from {client_id}: {err}");
                    reasons.push(ReasonCode::TopicFilterInvalid);
                }
            }
        }

        let disconnect_reason = reasons
            .iter()
            .find(|reason| DISCONNECT_AFTER_SUBACK.contains(reason))
            .copied();

        let ack_packet = FramePacket::V5(codec::v5::Packet::SubscribeAck(
            codec::v5::SubscribeAckPacket::with_vec(subscribe.packet_id(), reasons),
        ));
        self.send_to(connection_id, DispatcherToConnectionCmd::Send(ack_packet))
            .await;

        // The three capability reasons require dropping the connection
        // once the SUBACK is out.
        if let Some(reason) = disconnect_reason {
            self.close_with_fault(connection_id, reason).await;
            return true;
        }

        for (subscription, replaced) in accepted {
            self.deliver_retained(&client_id, &subscription, replaced)
                .await;
        }
        true
    }

    /// Send matching retained messages after a subscription was accepted,
    /// as directed by its retain handling option.
    async fn deliver_retained(
        &mut self,
        client_id: &str,
        subscription: &Subscription,
        replaced: bool,
    ) {
        // Shared subscriptions never receive retained messages at
        // subscribe time.
        if subscription.is_shared() {
            return;
        }
        let send = match subscription.retain_handling() {
            RetainHandling::Send => true,
            RetainHandling::SendFirst => !replaced,
            RetainHandling::NoSend => false,
        };
        if !send {
            return;
        }

        let now = Instant::now();
        let retained: Vec<RetainedMessage> = self
            .retain
            .matching(subscription.topic(), now)
            .into_iter()
            .cloned()
            .collect();
        for entry in retained {
            if subscription.no_local() && entry.origin == client_id {
                continue;
            }
            let mut message = entry.message;
            message.qos = message.qos.min(subscription.qos());
            message.retain = true;
            if let Some(subscription_id) = subscription.subscription_id() {
                if let Ok(subscription_id) = VarInt::from(subscription_id) {
                    message
                        .properties
                        .push(Property::SubscriptionIdentifier(subscription_id));
                }
            }

            let Some(session) = self.sessions.get_mut(client_id) else {
                return;
            };
            let connection_id = session.connection_id();
            match session.publish(message, now) {
                Ok(packets) => {
                    if let Some(connection_id) = connection_id {
                        self.send_all(connection_id, packets).await;
                    }
                }
                Err(err) => {
                    log::warn!("dispatcher: Drop retained message to {client_id}: {err}");
                }
            }
        }
    }

    pub(crate) async fn on_unsubscribe_v3(
        &mut self,
        connection_id: ConnectionId,
        unsubscribe: &codec::v3::UnsubscribePacket,
    ) -> bool {
        let Some(client_id) = self.client_id_of(connection_id) else {
            self.close_with_fault(connection_id, ReasonCode::ProtocolError)
                .await;
            return false;
        };
        for topic in unsubscribe.topics() {
            if self.sub_trie.remove(&client_id, topic.as_ref()) {
                self.hooks
                    .persistence
                    .remove_subscription(&client_id, topic.as_ref());
            }
        }
        let ack = FramePacket::V3(codec::v3::Packet::UnsubscribeAck(
            codec::v3::UnsubscribeAckPacket::new(unsubscribe.packet_id()),
        ));
        self.send_to(connection_id, DispatcherToConnectionCmd::Send(ack))
            .await;
        true
    }

    pub(crate) async fn on_unsubscribe_v5(
        &mut self,
        connection_id: ConnectionId,
        unsubscribe: &codec::v5::UnsubscribePacket,
    ) -> bool {
        let Some(client_id) = self.client_id_of(connection_id) else {
            self.close_with_fault(connection_id, ReasonCode::ProtocolError)
                .await;
            return false;
        };
        let mut reasons = Vec::with_capacity(unsubscribe.topics().len());
        for topic in unsubscribe.topics() {
            if self.sub_trie.remove(&client_id, topic.as_ref()) {
                self.hooks
                    .persistence
                    .remove_subscription(&client_id, topic.as_ref());
                reasons.push(ReasonCode::Success);
            } else {
                reasons.push(ReasonCode::NoSubscriptionExisted);
            }
        }
        let ack = FramePacket::V5(codec::v5::Packet::UnsubscribeAck(
            codec::v5::UnsubscribeAckPacket::with_vec(unsubscribe.packet_id(), reasons),
        ));
        self.send_to(connection_id, DispatcherToConnectionCmd::Send(ack))
            .await;
        true
    }

    pub(crate) fn client_id_of(&self, connection_id: ConnectionId) -> Option<String> {
        self.connections.get(&connection_id)?.client_id.clone()
    }
}
