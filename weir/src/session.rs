// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Per-client session state.
//!
//! A `Session` is owned by the dispatcher's session table and outlives the
//! connection that created it. The attached connection is referenced only
//! by id; packets produced here are routed by the dispatcher.

use codec::{FramePacket, PacketId, ProtocolLevel, QoS};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind};
use crate::types::{ConnectionId, DeliveryTick, Message, Will};

/// Session does not expire when the interval holds this value.
pub const EXPIRY_NEVER: u32 = u32::MAX;

/// A QoS 1/2 message queued for, or awaiting acknowledgement from,
/// the client.
#[derive(Debug, Clone)]
struct InflightMessage {
    packet_id: PacketId,
    message: Message,

    /// Set once the message has been transmitted; retransmissions carry
    /// the DUP flag [MQTT-3.3.1-1].
    dup: bool,
}

/// State of one client id, kept across reconnects until it expires.
#[derive(Debug)]
pub struct Session {
    client_id: String,
    protocol_level: ProtocolLevel,

    /// Candidate for the next allocation; ids in flight are skipped.
    next_packet_id: u16,

    /// Outbound QoS 1/2 messages waiting for send quota, insertion order.
    pending_send: VecDeque<InflightMessage>,

    /// Messages sent, awaiting PUBACK or PUBREC, insertion order.
    pending_ack: VecDeque<InflightMessage>,

    /// PUBRELs sent, awaiting PUBCOMP, insertion order.
    pending_pubrel: VecDeque<PacketId>,

    /// QoS 2 PUBLISHes received, awaiting PUBREL.
    received_qos2: HashMap<u16, Message>,

    /// Remaining unacknowledged QoS 1/2 sends the client accepts.
    send_quota: u16,

    /// The client's receive maximum.
    max_send_quota: u16,

    will: Option<Will>,

    /// Seconds the session survives after disconnect; [`EXPIRY_NEVER`]
    /// keeps it indefinitely.
    session_expiry_interval: u32,

    connected: bool,
    disconnected_at: Option<Instant>,

    /// Non-owning handle to the attached connection, if any.
    connection_id: Option<ConnectionId>,

    /// Most recent delivery tick per shared subscription group.
    share_ticks: HashMap<String, DeliveryTick>,
}

impl Session {
    #[must_use]
    pub fn new(client_id: &str, protocol_level: ProtocolLevel) -> Self {
        Self {
            client_id: client_id.to_string(),
            protocol_level,
            next_packet_id: 1,
            pending_send: VecDeque::new(),
            pending_ack: VecDeque::new(),
            pending_pubrel: VecDeque::new(),
            received_qos2: HashMap::new(),
            send_quota: u16::MAX,
            max_send_quota: u16::MAX,
            will: None,
            session_expiry_interval: 0,
            connected: false,
            disconnected_at: None,
            connection_id: None,
            share_ticks: HashMap::new(),
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    #[must_use]
    pub const fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    #[must_use]
    pub const fn session_expiry_interval(&self) -> u32 {
        self.session_expiry_interval
    }

    pub fn set_session_expiry_interval(&mut self, interval: u32) {
        self.session_expiry_interval = interval;
    }

    #[must_use]
    pub const fn will(&self) -> Option<&Will> {
        self.will.as_ref()
    }

    pub fn set_will(&mut self, will: Option<Will>) {
        self.will = will;
    }

    /// Remove and return the will message.
    pub fn take_will(&mut self) -> Option<Will> {
        self.will.take()
    }

    /// Attach a new connection to this session.
    ///
    /// `receive_maximum` is the window the client advertised in CONNECT.
    /// Retransmissions already in `pending_ack` count against the fresh
    /// quota.
    pub fn attach(
        &mut self,
        connection_id: ConnectionId,
        protocol_level: ProtocolLevel,
        receive_maximum: u16,
    ) {
        self.connected = true;
        self.connection_id = Some(connection_id);
        self.protocol_level = protocol_level;
        self.disconnected_at = None;
        self.max_send_quota = receive_maximum;
        #[allow(clippy::cast_possible_truncation)]
        let in_flight = self.pending_ack.len().min(usize::from(u16::MAX)) as u16;
        self.send_quota = receive_maximum.saturating_sub(in_flight);
    }

    /// Mark the session disconnected, stamping the instant used for
    /// session expiry and will delay.
    pub fn detach(&mut self, now: Instant) {
        self.connected = false;
        self.connection_id = None;
        self.disconnected_at = Some(now);
    }

    /// When this session should be dropped, or `None` if it is connected
    /// or never expires.
    #[must_use]
    pub fn expiry_time(&self) -> Option<Instant> {
        if self.connected || self.session_expiry_interval == EXPIRY_NEVER {
            return None;
        }
        let disconnected_at = self.disconnected_at?;
        Some(disconnected_at + Duration::from_secs(u64::from(self.session_expiry_interval)))
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiry_time().is_some_and(|at| now >= at)
    }

    /// When the pending will message should be published, or `None` if
    /// there is no will or the session is connected.
    #[must_use]
    pub fn will_time(&self) -> Option<Instant> {
        if self.connected {
            return None;
        }
        let will = self.will.as_ref()?;
        let disconnected_at = self.disconnected_at?;
        Some(disconnected_at + Duration::from_secs(u64::from(will.delay_interval)))
    }

    #[must_use]
    pub fn is_packet_id_in_use(&self, packet_id: PacketId) -> bool {
        self.pending_send.iter().any(|m| m.packet_id == packet_id)
            || self.pending_ack.iter().any(|m| m.packet_id == packet_id)
            || self.pending_pubrel.contains(&packet_id)
    }

    /// Allocate the next unused packet id, wrapping 65535 to 1.
    ///
    /// # Errors
    ///
    /// Returns error if all 65535 ids are in flight.
    pub fn generate_packet_id(&mut self) -> Result<PacketId, Error> {
        let in_use =
            self.pending_send.len() + self.pending_ack.len() + self.pending_pubrel.len();
        if in_use >= usize::from(u16::MAX) {
            return Err(Error::new(
                ErrorKind::PacketIdExhausted,
                "session: All packet ids are in flight",
            ));
        }

        loop {
            let candidate = PacketId::new(self.next_packet_id);
            self.next_packet_id = if self.next_packet_id == u16::MAX {
                1
            } else {
                self.next_packet_id + 1
            };
            if !self.is_packet_id_in_use(candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Deliver an application message to this session.
    ///
    /// QoS 0 messages are sent right away or dropped when no connection is
    /// attached. QoS 1/2 messages are queued and sent as send quota allows.
    /// Returns the packets to write to the attached connection.
    ///
    /// # Errors
    ///
    /// Returns error if no packet id can be allocated.
    pub fn publish(&mut self, message: Message, now: Instant) -> Result<Vec<FramePacket>, Error> {
        if message.is_expired(now) {
            log::debug!("session: Drop expired message for {}", self.client_id);
            return Ok(Vec::new());
        }

        if message.qos == QoS::AtMostOnce {
            if self.connected {
                let packet = self.build_publish(&message, PacketId::new(0), false, now);
                return Ok(vec![packet]);
            }
            return Ok(Vec::new());
        }

        let packet_id = self.generate_packet_id()?;
        self.pending_send.push_back(InflightMessage {
            packet_id,
            message,
            dup: false,
        });
        Ok(self.send_pending(now))
    }

    /// Drain `pending_send` into `pending_ack` while send quota remains.
    pub fn send_pending(&mut self, now: Instant) -> Vec<FramePacket> {
        let mut packets = Vec::new();
        if !self.connected {
            return packets;
        }
        while self.send_quota > 0 {
            let Some(mut inflight) = self.pending_send.pop_front() else {
                break;
            };
            if inflight.message.is_expired(now) {
                continue;
            }
            let packet =
                self.build_publish(&inflight.message, inflight.packet_id, inflight.dup, now);
            packets.push(packet);
            self.send_quota -= 1;
            inflight.dup = true;
            self.pending_ack.push_back(inflight);
        }
        packets
    }

    /// Re-emit the in-flight state after a reconnect: every entry in
    /// `pending_ack` with the DUP flag set, then every pending PUBREL,
    /// then whatever `pending_send` holds.
    pub fn resend_pending(&mut self, now: Instant) -> Vec<FramePacket> {
        for inflight in &mut self.pending_ack {
            inflight.dup = true;
        }
        let mut packets: Vec<FramePacket> = self
            .pending_ack
            .iter()
            .map(|inflight| self.build_publish(&inflight.message, inflight.packet_id, true, now))
            .collect();
        for packet_id in &self.pending_pubrel {
            packets.push(build_pubrel(self.protocol_level, *packet_id));
        }
        packets.extend(self.send_pending(now));
        packets
    }

    /// PUBACK received, or a PUBREC carrying a failure reason.
    ///
    /// Returns true if the packet id was in `pending_ack`. Raises the send
    /// quota, saturating at the client's receive maximum.
    pub fn acknowledge_publish(&mut self, packet_id: PacketId) -> bool {
        let old_len = self.pending_ack.len();
        self.pending_ack.retain(|m| m.packet_id != packet_id);
        let found = self.pending_ack.len() != old_len;
        self.send_quota = self.send_quota.saturating_add(1).min(self.max_send_quota);
        found
    }

    /// PUBREC received with a success reason: move the flow from
    /// `pending_ack` to `pending_pubrel`.
    ///
    /// Returns true if the packet id was known. Send quota is not raised
    /// until PUBCOMP completes the exchange.
    pub fn publish_released(&mut self, packet_id: PacketId) -> bool {
        let old_len = self.pending_ack.len();
        self.pending_ack.retain(|m| m.packet_id != packet_id);
        let was_in_ack = self.pending_ack.len() != old_len;
        // A retransmitted PUBREC finds the id in pending_pubrel already.
        let in_pubrel = self.pending_pubrel.contains(&packet_id);
        // A spurious PUBREC must not mark its id as in-flight.
        if was_in_ack && !in_pubrel {
            self.pending_pubrel.push_back(packet_id);
        }
        was_in_ack || in_pubrel
    }

    /// PUBCOMP received.
    ///
    /// Returns true if the packet id was in `pending_pubrel`. Raises the
    /// send quota, saturating at the client's receive maximum.
    pub fn acknowledge_pubrel(&mut self, packet_id: PacketId) -> bool {
        let old_len = self.pending_pubrel.len();
        self.pending_pubrel.retain(|id| *id != packet_id);
        let found = self.pending_pubrel.len() != old_len;
        self.send_quota = self.send_quota.saturating_add(1).min(self.max_send_quota);
        found
    }

    #[must_use]
    pub fn received_qos2_contains(&self, packet_id: PacketId) -> bool {
        self.received_qos2.contains_key(&packet_id.value())
    }

    #[must_use]
    pub fn received_qos2_len(&self) -> usize {
        self.received_qos2.len()
    }

    pub fn store_received_qos2(&mut self, packet_id: PacketId, message: Message) {
        self.received_qos2.insert(packet_id.value(), message);
    }

    pub fn release_received_qos2(&mut self, packet_id: PacketId) -> Option<Message> {
        self.received_qos2.remove(&packet_id.value())
    }

    /// Most recent delivery tick for a shared subscription group.
    #[must_use]
    pub fn share_tick(&self, share_name: &str) -> DeliveryTick {
        self.share_ticks.get(share_name).copied().unwrap_or(0)
    }

    pub fn share_delivered(&mut self, share_name: &str, tick: DeliveryTick) {
        self.share_ticks.insert(share_name.to_string(), tick);
    }

    fn build_publish(
        &self,
        message: &Message,
        packet_id: PacketId,
        dup: bool,
        now: Instant,
    ) -> FramePacket {
        build_publish_packet(self.protocol_level, message, packet_id, dup, now)
    }
}

/// Render a [`Message`] as a wire packet of the session's protocol level.
///
/// The message expiry interval, if any, is rewritten to the remaining
/// lifetime [MQTT-3.3.2-6].
pub fn build_publish_packet(
    protocol_level: ProtocolLevel,
    message: &Message,
    packet_id: PacketId,
    dup: bool,
    now: Instant,
) -> FramePacket {
    match protocol_level {
        ProtocolLevel::V31 | ProtocolLevel::V311 => {
            let mut packet =
                codec::v3::PublishPacket::new(&message.topic, message.qos, &[]).unwrap_or_default();
            packet.set_message(message.payload.clone());
            packet.set_retain(message.retain);
            if message.qos != QoS::AtMostOnce {
                packet.set_packet_id(packet_id);
                if dup {
                    let _ = packet.set_dup(true);
                }
            }
            FramePacket::V3(codec::v3::Packet::Publish(packet))
        }
        ProtocolLevel::V5 => {
            let mut packet =
                codec::v5::PublishPacket::new(&message.topic, message.qos, &[]).unwrap_or_default();
            packet.set_message(message.payload.clone());
            packet.set_retain(message.retain);
            if message.qos != QoS::AtMostOnce {
                packet.set_packet_id(packet_id);
                if dup {
                    let _ = packet.set_dup(true);
                }
            }
            *packet.properties_mut() = message.properties.clone();
            // Topic aliases never cross connections.
            packet
                .properties_mut()
                .remove(codec::PropertyType::TopicAlias);
            if let Some(remaining) = message.remaining_expiry(now) {
                packet.properties_mut().set_message_expiry_interval(remaining);
            }
            FramePacket::V5(codec::v5::Packet::Publish(packet))
        }
    }
}

/// Render a PUBREL of the session's protocol level.
pub fn build_pubrel(protocol_level: ProtocolLevel, packet_id: PacketId) -> FramePacket {
    match protocol_level {
        ProtocolLevel::V31 | ProtocolLevel::V311 => FramePacket::V3(
            codec::v3::Packet::PublishRelease(codec::v3::PublishReleasePacket::new(packet_id)),
        ),
        ProtocolLevel::V5 => FramePacket::V5(codec::v5::Packet::PublishRelease(
            codec::v5::PublishReleasePacket::new(packet_id),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{Bytes, Properties};

    fn message(qos: QoS) -> Message {
        Message {
            topic: "t/x".to_string(),
            qos,
            retain: false,
            payload: Bytes::from_static(b"hi"),
            properties: Properties::new(),
            received_at: Instant::now(),
        }
    }

    #[test]
    fn test_packet_id_wraps_and_skips() {
        let mut session = Session::new("c1", ProtocolLevel::V5);
        session.next_packet_id = u16::MAX;

        let id = session.generate_packet_id().unwrap();
        assert_eq!(id.value(), u16::MAX);

        // 65535 wraps to 1, never 0.
        let id = session.generate_packet_id().unwrap();
        assert_eq!(id.value(), 1);

        // An id in flight is skipped.
        session.next_packet_id = 7;
        session.pending_send.push_back(InflightMessage {
            packet_id: PacketId::new(7),
            message: message(QoS::AtLeastOnce),
            dup: false,
        });
        let id = session.generate_packet_id().unwrap();
        assert_eq!(id.value(), 8);
    }

    #[test]
    fn test_qos0_dropped_when_detached() {
        let mut session = Session::new("c1", ProtocolLevel::V5);
        let packets = session.publish(message(QoS::AtMostOnce), Instant::now()).unwrap();
        assert!(packets.is_empty());

        session.attach(1, ProtocolLevel::V5, 10);
        let packets = session.publish(message(QoS::AtMostOnce), Instant::now()).unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn test_qos1_queued_until_attached() {
        let mut session = Session::new("c1", ProtocolLevel::V5);
        let packets = session.publish(message(QoS::AtLeastOnce), Instant::now()).unwrap();
        assert!(packets.is_empty());
        assert_eq!(session.pending_send.len(), 1);

        session.attach(1, ProtocolLevel::V5, 10);
        let packets = session.resend_pending(Instant::now());
        assert_eq!(packets.len(), 1);
        assert!(session.pending_send.is_empty());
        assert_eq!(session.pending_ack.len(), 1);
        assert_eq!(session.send_quota, 9);
    }

    #[test]
    fn test_send_quota_blocks_and_recovers() {
        let mut session = Session::new("c1", ProtocolLevel::V5);
        session.attach(1, ProtocolLevel::V5, 2);

        let now = Instant::now();
        let first = session.publish(message(QoS::AtLeastOnce), now).unwrap();
        let second = session.publish(message(QoS::AtLeastOnce), now).unwrap();
        let third = session.publish(message(QoS::AtLeastOnce), now).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        // Quota exhausted, third stays queued.
        assert!(third.is_empty());
        assert_eq!(session.send_quota, 0);
        assert_eq!(session.pending_send.len(), 1);

        let first_id = session.pending_ack[0].packet_id;
        assert!(session.acknowledge_publish(first_id));
        let packets = session.send_pending(now);
        assert_eq!(packets.len(), 1);
        assert_eq!(session.send_quota, 0);
    }

    #[test]
    fn test_quota_saturates_at_maximum() {
        let mut session = Session::new("c1", ProtocolLevel::V5);
        session.attach(1, ProtocolLevel::V5, 2);
        assert_eq!(session.send_quota, 2);

        // An unmatched ack must not push the quota past the maximum.
        session.acknowledge_publish(PacketId::new(42));
        assert_eq!(session.send_quota, 2);
    }

    #[test]
    fn test_inflight_maps_disjoint() {
        let mut session = Session::new("c1", ProtocolLevel::V5);
        session.attach(1, ProtocolLevel::V5, 10);
        let now = Instant::now();

        session.publish(message(QoS::ExactOnce), now).unwrap();
        let packet_id = session.pending_ack[0].packet_id;
        assert!(session.is_packet_id_in_use(packet_id));

        // PUBREC moves the flow to pending_pubrel, id stays in use.
        assert!(session.publish_released(packet_id));
        assert!(session.pending_ack.is_empty());
        assert!(session.is_packet_id_in_use(packet_id));

        // PUBCOMP releases the id.
        assert!(session.acknowledge_pubrel(packet_id));
        assert!(!session.is_packet_id_in_use(packet_id));
    }

    #[test]
    fn test_spurious_pubrec_leaves_no_state() {
        let mut session = Session::new("c1", ProtocolLevel::V5);
        session.attach(1, ProtocolLevel::V5, 10);

        // A PUBREC for an id with no matching flow is reported unknown
        // and must not occupy the id.
        let packet_id = PacketId::new(99);
        assert!(!session.publish_released(packet_id));
        assert!(!session.is_packet_id_in_use(packet_id));

        // A retransmitted PUBREC for a live flow is still acknowledged.
        let now = Instant::now();
        session.publish(message(QoS::ExactOnce), now).unwrap();
        let packet_id = session.pending_ack[0].packet_id;
        assert!(session.publish_released(packet_id));
        assert!(session.publish_released(packet_id));
        assert_eq!(session.pending_pubrel.len(), 1);
    }

    #[test]
    fn test_expiry_time() {
        let mut session = Session::new("c1", ProtocolLevel::V5);
        session.attach(1, ProtocolLevel::V5, 10);
        session.set_session_expiry_interval(60);
        assert!(session.expiry_time().is_none());

        let now = Instant::now();
        session.detach(now);
        assert_eq!(session.expiry_time(), Some(now + Duration::from_secs(60)));
        assert!(!session.is_expired(now));
        assert!(session.is_expired(now + Duration::from_secs(60)));

        session.set_session_expiry_interval(EXPIRY_NEVER);
        assert!(session.expiry_time().is_none());
    }

    #[test]
    fn test_resend_sets_dup() {
        let mut session = Session::new("c1", ProtocolLevel::V311);
        session.attach(1, ProtocolLevel::V311, 10);
        let now = Instant::now();
        session.publish(message(QoS::AtLeastOnce), now).unwrap();

        session.detach(now);
        session.attach(2, ProtocolLevel::V311, 10);
        let packets = session.resend_pending(now);
        assert_eq!(packets.len(), 1);
        let FramePacket::V3(codec::v3::Packet::Publish(publish)) = &packets[0] else {
            panic!("expected publish packet");
        };
        assert!(publish.dup());
    }
}
