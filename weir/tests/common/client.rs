// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A minimal codec-level MQTT client for driving the broker in tests.

use codec::{
    Assembler, ByteArray, ConnectFlags, DecodePacket, EncodePacket, PacketId, Property,
    ProtocolLevel, QoS, U16Data, U32Data,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestClient {
    stream: TcpStream,
    assembler: Assembler,
    protocol_level: ProtocolLevel,
}

impl TestClient {
    pub async fn dial(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("failed to connect");
        Self {
            stream,
            assembler: Assembler::new(0),
            protocol_level: ProtocolLevel::V5,
        }
    }

    pub async fn send<P: EncodePacket>(&mut self, packet: &P) {
        let mut buf = Vec::new();
        packet.encode(&mut buf).expect("failed to encode packet");
        self.stream
            .write_all(&buf)
            .await
            .expect("failed to write packet");
    }

    /// Read the next complete packet, bailing out after a timeout.
    pub async fn recv_v5(&mut self) -> codec::v5::Packet {
        let frame = self.recv_frame().await.expect("no packet within timeout");
        let mut ba = ByteArray::new(&frame);
        codec::v5::Packet::decode(&mut ba).expect("failed to decode packet")
    }

    pub async fn recv_v3(&mut self) -> codec::v3::Packet {
        let frame = self.recv_frame().await.expect("no packet within timeout");
        let mut ba = ByteArray::new(&frame);
        codec::v3::Packet::decode(&mut ba).expect("failed to decode packet")
    }

    /// Returns `None` if no packet arrives within `timeout`.
    pub async fn try_recv_v5(&mut self, timeout: Duration) -> Option<codec::v5::Packet> {
        let frame = tokio::time::timeout(timeout, self.next_frame())
            .await
            .ok()??;
        let mut ba = ByteArray::new(&frame);
        Some(codec::v5::Packet::decode(&mut ba).expect("failed to decode packet"))
    }

    async fn recv_frame(&mut self) -> Option<codec::Bytes> {
        tokio::time::timeout(RECV_TIMEOUT, self.next_frame())
            .await
            .ok()
            .flatten()
    }

    async fn next_frame(&mut self) -> Option<codec::Bytes> {
        loop {
            if let Some(frame) = self.assembler.next_packet().expect("malformed stream") {
                return Some(frame);
            }
            let mut buf = vec![0u8; 4096];
            let n_recv = self.stream.read(&mut buf).await.ok()?;
            if n_recv == 0 {
                return None;
            }
            self.assembler.extend(&buf[..n_recv]);
        }
    }

    /// CONNECT at protocol level 5 and wait for CONNACK.
    pub async fn connect_v5(
        &mut self,
        client_id: &str,
        clean_start: bool,
        session_expiry: Option<u32>,
    ) -> codec::v5::ConnectAckPacket {
        self.protocol_level = ProtocolLevel::V5;
        let mut connect = codec::v5::ConnectPacket::new(client_id).unwrap();
        let mut flags = ConnectFlags::default();
        flags.set_clean_session(clean_start);
        connect.set_connect_flags(flags);
        if let Some(session_expiry) = session_expiry {
            connect
                .properties_mut()
                .push(Property::SessionExpiryInterval(U32Data::new(session_expiry)));
        }
        self.send(&connect).await;
        match self.recv_v5().await {
            codec::v5::Packet::ConnectAck(ack) => ack,
            packet => panic!("expected CONNACK, got {packet:?}"),
        }
    }

    /// CONNECT at protocol level 5 carrying a will message.
    pub async fn connect_v5_with_will(
        &mut self,
        client_id: &str,
        will_topic: &str,
        will_payload: &[u8],
        will_delay: Option<u32>,
    ) -> codec::v5::ConnectAckPacket {
        self.protocol_level = ProtocolLevel::V5;
        let mut connect = codec::v5::ConnectPacket::new(client_id).unwrap();
        let mut flags = ConnectFlags::default();
        flags.set_clean_session(true);
        connect.set_connect_flags(flags);
        connect.set_will(will_topic, will_payload).unwrap();
        if let Some(will_delay) = will_delay {
            connect
                .will_properties_mut()
                .push(Property::WillDelayInterval(U32Data::new(will_delay)));
        }
        self.send(&connect).await;
        match self.recv_v5().await {
            codec::v5::Packet::ConnectAck(ack) => ack,
            packet => panic!("expected CONNACK, got {packet:?}"),
        }
    }

    /// CONNECT at protocol level 4 and wait for CONNACK.
    pub async fn connect_v3(
        &mut self,
        client_id: &str,
        clean_session: bool,
    ) -> codec::v3::ConnectAckPacket {
        self.protocol_level = ProtocolLevel::V311;
        let mut connect = codec::v3::ConnectPacket::new(client_id).unwrap();
        let mut flags = ConnectFlags::default();
        flags.set_clean_session(clean_session);
        connect.set_connect_flags(flags);
        self.send(&connect).await;
        match self.recv_v3().await {
            codec::v3::Packet::ConnectAck(ack) => ack,
            packet => panic!("expected CONNACK, got {packet:?}"),
        }
    }

    pub async fn subscribe_v5(
        &mut self,
        filter: &str,
        qos: QoS,
        packet_id: u16,
    ) -> codec::v5::SubscribeAckPacket {
        let subscribe =
            codec::v5::SubscribePacket::new(filter, qos, PacketId::new(packet_id)).unwrap();
        self.send(&subscribe).await;
        match self.recv_v5().await {
            codec::v5::Packet::SubscribeAck(ack) => ack,
            packet => panic!("expected SUBACK, got {packet:?}"),
        }
    }

    /// QoS 0 publish, optionally with a topic alias property.
    pub async fn publish_v5_qos0(&mut self, topic: &str, payload: &[u8], retain: bool) {
        let mut publish = codec::v5::PublishPacket::new(topic, QoS::AtMostOnce, payload).unwrap();
        publish.set_retain(retain);
        self.send(&publish).await;
    }

    pub async fn publish_v5_alias(&mut self, topic: &str, alias: u16, payload: &[u8]) {
        let mut publish = codec::v5::PublishPacket::default();
        if !topic.is_empty() {
            publish.set_topic(topic).unwrap();
        }
        publish
            .properties_mut()
            .push(Property::TopicAlias(U16Data::new(alias)));
        publish.set_message(codec::Bytes::copy_from_slice(payload));
        self.send(&publish).await;
    }

    /// QoS 1 publish, waits for PUBACK.
    pub async fn publish_v5_qos1(
        &mut self,
        topic: &str,
        payload: &[u8],
        packet_id: u16,
    ) -> codec::v5::PublishAckPacket {
        let mut publish = codec::v5::PublishPacket::new(topic, QoS::AtLeastOnce, payload).unwrap();
        publish.set_packet_id(PacketId::new(packet_id));
        self.send(&publish).await;
        match self.recv_v5().await {
            codec::v5::Packet::PublishAck(ack) => ack,
            packet => panic!("expected PUBACK, got {packet:?}"),
        }
    }

    /// QoS 2 publish, waits for PUBREC only.
    pub async fn publish_v5_qos2(
        &mut self,
        topic: &str,
        payload: &[u8],
        packet_id: u16,
    ) -> codec::v5::PublishReceivedPacket {
        let mut publish = codec::v5::PublishPacket::new(topic, QoS::ExactOnce, payload).unwrap();
        publish.set_packet_id(PacketId::new(packet_id));
        self.send(&publish).await;
        match self.recv_v5().await {
            codec::v5::Packet::PublishReceived(rec) => rec,
            packet => panic!("expected PUBREC, got {packet:?}"),
        }
    }

    pub async fn expect_publish_v5(&mut self) -> codec::v5::PublishPacket {
        match self.recv_v5().await {
            codec::v5::Packet::Publish(publish) => publish,
            packet => panic!("expected PUBLISH, got {packet:?}"),
        }
    }

    pub async fn puback(&mut self, packet_id: PacketId) {
        self.send(&codec::v5::PublishAckPacket::new(packet_id)).await;
    }

    pub async fn disconnect_v5(&mut self) {
        self.send(&codec::v5::DisconnectPacket::new(codec::ReasonCode::Success))
            .await;
    }
}
