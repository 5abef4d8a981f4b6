// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Per-socket connection task.
//!
//! Owns the socket, the packet assembly buffer and the connection half of
//! the protocol state machine: CONNECT-first enforcement, connect timeout,
//! keep alive, topic alias resolution and the outbound packet size cap.
//! Session state lives in the dispatcher.

use codec::{
    Assembler, ByteArray, Bytes, DecodeError, DecodePacket, EncodePacket, FixedHeader,
    FramePacket, PacketType, PropertyType, ProtocolLevel, ReasonCode, StringData,
};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{Sender, UnboundedReceiver, UnboundedSender};
use tokio::time::interval;

use crate::commands::{ConnectionToDispatcherCmd, DispatcherToConnectionCmd};
use crate::error::Error;
use crate::hooks::BytesMetrics;
use crate::stream::Stream;
use crate::types::ConnectionId;

/// Upper bound on packets buffered while the CONNECT handshake is still
/// in flight.
const HANDSHAKE_BUFFER_CAP: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// Nothing received yet; the first packet must be CONNECT.
    WaitingForConnect,

    /// CONNECT forwarded to the dispatcher, CONNACK decision pending.
    /// Covers the v5 enhanced authentication rounds.
    Connecting,

    Connected,

    Disconnected,
}

/// Limits handed down from broker config.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Seconds a client may take to complete the CONNECT handshake.
    /// 0 disables the check.
    pub connect_timeout: u64,

    /// Inbound packet size cap in bytes. 0 disables the check.
    pub maximum_packet_size: u32,

    /// Highest inbound topic alias accepted. 0 disables topic aliases.
    pub topic_alias_maximum: u16,
}

/// One client connection.
pub struct Connection {
    id: ConnectionId,
    stream: Stream,
    config: ConnectionConfig,

    status: Status,
    protocol_level: ProtocolLevel,
    client_id: String,

    /// Effective keep alive in seconds, set from the CONNACK decision.
    keep_alive: u16,
    last_packet_at: Instant,
    established_at: Instant,

    assembler: Assembler,

    /// Client to server topic alias bindings [MQTT-3.3.2-7].
    topic_aliases: HashMap<u16, String>,

    /// Maximum packet size the client advertised in CONNECT.
    peer_maximum_packet_size: Option<u32>,

    /// Packets that arrived while the handshake was in flight; replayed
    /// once CONNACK is out.
    handshake_buffer: Vec<FramePacket>,

    sender: Sender<ConnectionToDispatcherCmd>,
    receiver: UnboundedReceiver<DispatcherToConnectionCmd>,

    /// Sender half of `receiver`, handed to the dispatcher on startup so
    /// replies can find this task. Registration happens on this task's
    /// own command channel to keep packet ordering intact.
    register_sender: Option<UnboundedSender<DispatcherToConnectionCmd>>,

    metrics: Arc<dyn BytesMetrics>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        stream: Stream,
        config: ConnectionConfig,
        sender: Sender<ConnectionToDispatcherCmd>,
        receiver: UnboundedReceiver<DispatcherToConnectionCmd>,
        register_sender: UnboundedSender<DispatcherToConnectionCmd>,
        metrics: Arc<dyn BytesMetrics>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            stream,
            config,
            status: Status::WaitingForConnect,
            protocol_level: ProtocolLevel::V311,
            client_id: String::new(),
            keep_alive: 0,
            last_packet_at: now,
            established_at: now,
            assembler: Assembler::new(config.maximum_packet_size as usize),
            topic_aliases: HashMap::new(),
            peer_maximum_packet_size: None,
            handshake_buffer: Vec::new(),
            sender,
            receiver,
            register_sender: Some(register_sender),
            metrics,
        }
    }

    pub async fn run_loop(mut self) {
        if let Some(register_sender) = self.register_sender.take() {
            if let Err(err) = self
                .sender
                .send(ConnectionToDispatcherCmd::Connect(self.id, register_sender))
                .await
            {
                log::error!("connection: Failed to register, id: {}, err: {err}", self.id);
                return;
            }
        }

        let mut buf = Vec::with_capacity(1024);
        let mut timer = interval(Duration::from_secs(1));

        loop {
            if self.status == Status::Disconnected {
                break;
            }

            tokio::select! {
                ret = self.stream.read_buf(&mut buf) => {
                    match ret {
                        Ok(0) => {
                            log::info!("connection: Peer closed socket, {}", self.id);
                            break;
                        }
                        Ok(n_recv) => {
                            self.metrics.received(&self.client_id, n_recv);
                            self.assembler.extend(&buf);
                            buf.clear();
                            if let Err(err) = self.process_assembled().await {
                                log::warn!("connection: {}: {err}", self.id);
                                break;
                            }
                        }
                        Err(err) => {
                            log::info!("connection: Socket error, {}: {err}", self.id);
                            break;
                        }
                    }
                }
                Some(cmd) = self.receiver.recv() => {
                    if let Err(err) = self.handle_dispatcher_cmd(cmd).await {
                        log::warn!("connection: {}: {err}", self.id);
                        break;
                    }
                }
                _ = timer.tick() => {
                    if let Err(err) = self.check_timeout().await {
                        log::warn!("connection: {}: {err}", self.id);
                        break;
                    }
                }
            }
        }

        if let Err(err) = self
            .sender
            .send(ConnectionToDispatcherCmd::Disconnected(self.id))
            .await
        {
            log::error!(
                "connection: Failed to send disconnect cmd, id: {}, err: {err}",
                self.id
            );
        }
    }

    /// Pull complete packets out of the assembly buffer and dispatch them.
    ///
    /// Returns `Err` when the connection has been closed.
    async fn process_assembled(&mut self) -> Result<(), Error> {
        loop {
            match self.assembler.next_packet() {
                Ok(Some(frame)) => self.handle_frame(&frame).await?,
                Ok(None) => return Ok(()),
                Err(DecodeError::PacketTooLarge) => {
                    return self.protocol_fault(ReasonCode::PacketTooLarge).await;
                }
                Err(_) => {
                    return self.protocol_fault(ReasonCode::MalformedPacket).await;
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: &Bytes) -> Result<(), Error> {
        self.last_packet_at = Instant::now();

        match self.status {
            Status::WaitingForConnect => self.handle_connect_frame(frame).await,
            Status::Connecting | Status::Connected => {
                let packet = match FramePacket::decode(frame, self.protocol_level) {
                    Ok(packet) => packet,
                    Err(err) => {
                        log::warn!("connection: Malformed packet from {}: {err:?}", self.id);
                        let reason = match err {
                            DecodeError::InvalidTopic => ReasonCode::TopicNameInvalid,
                            DecodeError::PacketTooLarge => ReasonCode::PacketTooLarge,
                            _ => ReasonCode::MalformedPacket,
                        };
                        return self.protocol_fault(reason).await;
                    }
                };
                if self.status == Status::Connecting {
                    self.handle_handshake_packet(packet).await
                } else {
                    self.dispatch(packet).await
                }
            }
            Status::Disconnected => Ok(()),
        }
    }

    /// The first packet of the connection. Anything but CONNECT closes the
    /// connection.
    async fn handle_connect_frame(&mut self, frame: &Bytes) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let header = FixedHeader::decode(&mut ba);
        if !matches!(
            header.map(|h| h.packet_type()),
            Ok(PacketType::Connect)
        ) {
            log::warn!("connection: First packet is not CONNECT, {}", self.id);
            self.close().await;
            return Err(Error::new(
                crate::error::ErrorKind::SocketError,
                "connection: First packet is not CONNECT",
            ));
        }

        // The protocol level byte follows the protocol name; it picks the
        // packet set used for the rest of the connection.
        let Ok(protocol_level) = Self::peek_protocol_level(frame) else {
            self.close().await;
            return Err(Error::new(
                crate::error::ErrorKind::DecodeError,
                "connection: Invalid protocol name/level in CONNECT",
            ));
        };
        self.protocol_level = protocol_level;

        // Decode errors answer with CONNACK; status is already Connecting
        // so the fault reply picks the right packet.
        self.status = Status::Connecting;
        let packet = match FramePacket::decode(frame, self.protocol_level) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("connection: Malformed CONNECT from {}: {err:?}", self.id);
                let reason = match err {
                    // An empty client id together with a request to resume
                    // a session is rejected as identifier-not-valid
                    // [MQTT-3.1.3-8].
                    DecodeError::InvalidClientId => ReasonCode::ClientIdentifierNotValid,
                    _ => ReasonCode::MalformedPacket,
                };
                return self.protocol_fault(reason).await;
            }
        };

        match &packet {
            FramePacket::V3(codec::v3::Packet::Connect(connect)) => {
                self.client_id = connect.client_id().to_string();
                self.keep_alive = connect.keep_alive();
            }
            FramePacket::V5(codec::v5::Packet::Connect(connect)) => {
                self.client_id = connect.client_id().to_string();
                self.keep_alive = connect.keep_alive();
                self.peer_maximum_packet_size = connect.properties().maximum_packet_size();
            }
            _ => unreachable!("packet type checked above"),
        }

        self.sender
            .send(ConnectionToDispatcherCmd::Packet(self.id, packet))
            .await?;
        Ok(())
    }

    fn peek_protocol_level(frame: &Bytes) -> Result<ProtocolLevel, DecodeError> {
        let mut ba = ByteArray::new(frame);
        let _fixed_header = FixedHeader::decode(&mut ba)?;
        let protocol_name = StringData::decode(&mut ba)?;
        if protocol_name.as_ref() != codec::PROTOCOL_NAME {
            return Err(DecodeError::InvalidProtocolName);
        }
        ProtocolLevel::try_from(ba.read_byte()?)
    }

    /// Packets arriving between CONNECT and CONNACK.
    ///
    /// AUTH continues the enhanced authentication exchange and DISCONNECT
    /// aborts it; everything else is buffered until the handshake result
    /// is known [MQTT-3.1.2-30].
    async fn handle_handshake_packet(&mut self, packet: FramePacket) -> Result<(), Error> {
        match &packet {
            FramePacket::V5(codec::v5::Packet::Auth(_))
            | FramePacket::V5(codec::v5::Packet::Disconnect(_))
            | FramePacket::V3(codec::v3::Packet::Disconnect(_)) => self.dispatch(packet).await,
            _ => {
                if self.handshake_buffer.len() >= HANDSHAKE_BUFFER_CAP {
                    return self.protocol_fault(ReasonCode::ProtocolError).await;
                }
                self.handshake_buffer.push(packet);
                Ok(())
            }
        }
    }

    /// Validate and forward one packet received while connected.
    async fn dispatch(&mut self, mut packet: FramePacket) -> Result<(), Error> {
        // A Client can only send the CONNECT packet once over a network
        // connection [MQTT-3.1.0-2].
        if matches!(
            &packet,
            FramePacket::V3(codec::v3::Packet::Connect(_))
                | FramePacket::V5(codec::v5::Packet::Connect(_))
        ) {
            return self.protocol_fault(ReasonCode::ProtocolError).await;
        }

        if let FramePacket::V5(codec::v5::Packet::Publish(publish)) = &mut packet {
            if let Err(reason) = Self::resolve_topic_alias(
                &mut self.topic_aliases,
                self.config.topic_alias_maximum,
                publish,
            ) {
                return self.protocol_fault(reason).await;
            }
        }

        self.sender
            .send(ConnectionToDispatcherCmd::Packet(self.id, packet))
            .await?;
        Ok(())
    }

    /// Resolve the v5 topic alias of an inbound publish in place.
    ///
    /// A non-empty topic binds the alias; an empty topic with a known alias
    /// resolves to the bound topic.
    fn resolve_topic_alias(
        aliases: &mut HashMap<u16, String>,
        topic_alias_maximum: u16,
        publish: &mut codec::v5::PublishPacket,
    ) -> Result<(), ReasonCode> {
        let Some(alias) = publish.properties().topic_alias() else {
            return Ok(());
        };
        if alias == 0 || alias > topic_alias_maximum {
            return Err(ReasonCode::TopicAliasInvalid);
        }
        if publish.topic().is_empty() {
            let Some(topic) = aliases.get(&alias) else {
                return Err(ReasonCode::ProtocolError);
            };
            let topic = topic.clone();
            publish
                .set_topic(&topic)
                .map_err(|_err| ReasonCode::ProtocolError)?;
        } else {
            aliases.insert(alias, publish.topic().to_string());
        }
        Ok(())
    }

    async fn handle_dispatcher_cmd(&mut self, cmd: DispatcherToConnectionCmd) -> Result<(), Error> {
        match cmd {
            DispatcherToConnectionCmd::ConnectAck {
                packet,
                keep_alive,
                accepted,
            } => {
                self.send_packet(packet).await?;
                if accepted {
                    self.status = Status::Connected;
                    self.keep_alive = keep_alive;
                    let buffered = std::mem::take(&mut self.handshake_buffer);
                    for packet in buffered {
                        self.dispatch(packet).await?;
                    }
                } else {
                    self.close().await;
                }
                Ok(())
            }
            DispatcherToConnectionCmd::Send(packet) => self.send_packet(packet).await,
            DispatcherToConnectionCmd::Close(packet) => {
                if let Some(packet) = packet {
                    let _ = self.send_packet(packet).await;
                }
                self.close().await;
                Ok(())
            }
        }
    }

    /// Encode and write one packet, honoring the client's maximum packet
    /// size.
    ///
    /// Oversized v5 packets drop their optional properties first, reason
    /// string then user properties; if still too large the packet is
    /// discarded and the broker behaves as if it had been sent
    /// [MQTT-3.1.2-25].
    async fn send_packet(&mut self, mut packet: FramePacket) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;

        if let Some(max) = self.peer_maximum_packet_size {
            let max = max as usize;
            if buf.len() > max {
                if let FramePacket::V5(v5_packet) = &mut packet {
                    for property_type in [PropertyType::ReasonString, PropertyType::UserProperty] {
                        if v5_packet.remove_property(property_type) {
                            buf.clear();
                            v5_packet.encode(&mut buf)?;
                            if buf.len() <= max {
                                break;
                            }
                        }
                    }
                }
                if buf.len() > max {
                    log::warn!(
                        "connection: Omit packet exceeding client maximum packet size, \
                         {} > {max}, client: {}",
                        buf.len(),
                        self.client_id
                    );
                    return Ok(());
                }
            }
        }

        self.stream.write_all(&buf).await?;
        self.metrics.sent(&self.client_id, buf.len());
        Ok(())
    }

    /// Check connect timeout and keep alive.
    async fn check_timeout(&mut self) -> Result<(), Error> {
        let now = Instant::now();
        match self.status {
            Status::WaitingForConnect | Status::Connecting => {
                if self.config.connect_timeout > 0
                    && now.duration_since(self.established_at).as_secs()
                        > self.config.connect_timeout
                {
                    log::info!("connection: Connect timeout reached, {}", self.id);
                    if self.status == Status::Connecting {
                        return self.protocol_fault(ReasonCode::MaximumConnectTime).await;
                    }
                    self.close().await;
                }
            }
            Status::Connected => {
                // If the Keep Alive value is non-zero and the Server does not
                // receive a Control Packet from the Client within one and a
                // half times the Keep Alive time period, it MUST disconnect
                // [MQTT-3.1.2-24].
                if self.keep_alive > 0 {
                    let limit = u64::from(self.keep_alive) * 3 / 2;
                    if now.duration_since(self.last_packet_at).as_secs() > limit {
                        log::warn!(
                            "connection: Keep alive timeout, disconnect client {}",
                            self.client_id
                        );
                        return self.protocol_fault(ReasonCode::KeepAliveTimeout).await;
                    }
                }
            }
            Status::Disconnected => {}
        }
        Ok(())
    }

    /// Answer a protocol fault with the packet mandated for the current
    /// state, then close the connection.
    ///
    /// Before CONNACK the reply is a CONNACK carrying the reason; after
    /// CONNACK a v5 session gets a DISCONNECT, a v4 session just the
    /// close.
    async fn protocol_fault(&mut self, reason: ReasonCode) -> Result<(), Error> {
        let packet = match (self.status, self.protocol_level) {
            (Status::Connecting, ProtocolLevel::V5) => {
                // Reasons CONNACK cannot carry go out as DISCONNECT.
                if codec::v5::CONNECT_REASONS.contains(&reason) {
                    Some(FramePacket::V5(codec::v5::Packet::ConnectAck(
                        codec::v5::ConnectAckPacket::new(false, reason),
                    )))
                } else {
                    Some(FramePacket::V5(codec::v5::Packet::Disconnect(
                        codec::v5::DisconnectPacket::new(reason),
                    )))
                }
            }
            (Status::Connecting, _) => {
                let return_code = match reason {
                    ReasonCode::NotAuthorized => codec::v3::ConnectReturnCode::Unauthorized,
                    ReasonCode::ClientIdentifierNotValid => {
                        codec::v3::ConnectReturnCode::IdentifierRejected
                    }
                    _ => codec::v3::ConnectReturnCode::ServerUnavailable,
                };
                Some(FramePacket::V3(codec::v3::Packet::ConnectAck(
                    codec::v3::ConnectAckPacket::new(false, return_code),
                )))
            }
            (Status::Connected, ProtocolLevel::V5) => {
                Some(FramePacket::V5(codec::v5::Packet::Disconnect(
                    codec::v5::DisconnectPacket::new(reason),
                )))
            }
            _ => None,
        };

        if let Some(packet) = packet {
            let _ = self.send_packet(packet).await;
        }
        self.close().await;
        Err(Error::from_string(
            crate::error::ErrorKind::SocketError,
            format!("connection: Closed on protocol fault {reason:?}"),
        ))
    }

    async fn close(&mut self) {
        self.status = Status::Disconnected;
    }
}
