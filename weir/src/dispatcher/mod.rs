// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The dispatcher owns all broker wide state: the session table, the
//! subscription index and the retained message store.
//!
//! It is the single task that touches these tables; connections talk to it
//! over mpsc channels, so no locking is involved and packets of one
//! connection are processed in wire order.

use codec::{FramePacket, PacketId, ProtocolLevel, ReasonCode};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{Receiver, UnboundedSender};
use tokio::time::interval;

use crate::commands::{ConnectionToDispatcherCmd, DispatcherToConnectionCmd};
use crate::config::Config;
use crate::hooks::Hooks;
use crate::retain::RetainStore;
use crate::session::{build_pubrel, Session};
use crate::sub_trie::SubTrie;
use crate::types::{ConnectionId, DeliveryTick};

mod connect;
mod housekeeper;
mod publish;
mod subscribe;

/// Seconds between housekeeper runs.
const HOUSEKEEPER_INTERVAL: u64 = 1;

/// Dispatcher side state of one live connection.
#[derive(Debug)]
pub(crate) struct ConnectionContext {
    sender: UnboundedSender<DispatcherToConnectionCmd>,

    /// Set once the CONNECT handshake assigned a session.
    client_id: Option<String>,

    protocol_level: ProtocolLevel,

    /// CONNECT held back while a v5 enhanced authentication exchange runs.
    pending_connect: Option<PendingConnect>,

    /// Authentication method negotiated at CONNECT, used for
    /// re-authentication rounds.
    auth_method: Option<String>,
}

#[derive(Debug)]
pub(crate) struct PendingConnect {
    packet: codec::v5::ConnectPacket,
    auth_method: String,
}

/// The broker core.
pub struct Dispatcher {
    config: Config,
    hooks: Hooks,

    receiver: Receiver<ConnectionToDispatcherCmd>,
    shutdown_receiver: Receiver<()>,

    connections: HashMap<ConnectionId, ConnectionContext>,
    sessions: HashMap<String, Session>,
    sub_trie: SubTrie,
    retain: RetainStore,

    /// Source of shared-subscription delivery ticks.
    delivery_tick: DeliveryTick,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        config: Config,
        hooks: Hooks,
        receiver: Receiver<ConnectionToDispatcherCmd>,
        shutdown_receiver: Receiver<()>,
    ) -> Self {
        Self {
            config,
            hooks,
            receiver,
            shutdown_receiver,
            connections: HashMap::new(),
            sessions: HashMap::new(),
            sub_trie: SubTrie::new(),
            retain: RetainStore::new(),
            delivery_tick: 0,
        }
    }

    pub async fn run_loop(&mut self) {
        let mut timer = interval(Duration::from_secs(HOUSEKEEPER_INTERVAL));
        loop {
            tokio::select! {
                Some(cmd) = self.receiver.recv() => {
                    self.route_cmd(cmd).await;
                }
                _ = timer.tick() => {
                    self.housekeeper(Instant::now()).await;
                }
                _ = self.shutdown_receiver.recv() => {
                    log::info!("dispatcher: Shutting down");
                    self.shutdown().await;
                    break;
                }
            }
        }
    }

    async fn route_cmd(&mut self, cmd: ConnectionToDispatcherCmd) {
        match cmd {
            ConnectionToDispatcherCmd::Connect(connection_id, sender) => {
                self.connections.insert(
                    connection_id,
                    ConnectionContext {
                        sender,
                        client_id: None,
                        protocol_level: ProtocolLevel::V311,
                        pending_connect: None,
                        auth_method: None,
                    },
                );
            }
            ConnectionToDispatcherCmd::Packet(connection_id, packet) => {
                if self.handle_packet(connection_id, &packet).await {
                    let client_id = self
                        .connections
                        .get(&connection_id)
                        .and_then(|ctx| ctx.client_id.clone())
                        .unwrap_or_default();
                    self.hooks.interceptor.packet_received(&client_id, &packet);
                }
            }
            ConnectionToDispatcherCmd::Disconnected(connection_id) => {
                self.on_connection_gone(connection_id).await;
            }
        }
    }

    /// Dispatch one inbound packet; returns true on successful dispatch.
    async fn handle_packet(&mut self, connection_id: ConnectionId, packet: &FramePacket) -> bool {
        match packet {
            FramePacket::V3(codec::v3::Packet::Connect(_))
            | FramePacket::V5(codec::v5::Packet::Connect(_)) => {
                self.on_connect(connection_id, packet).await
            }
            FramePacket::V5(codec::v5::Packet::Auth(auth)) => {
                self.on_auth(connection_id, auth.clone()).await
            }
            FramePacket::V3(codec::v3::Packet::Publish(publish)) => {
                self.on_publish_v3(connection_id, publish).await
            }
            FramePacket::V5(codec::v5::Packet::Publish(publish)) => {
                self.on_publish_v5(connection_id, publish).await
            }
            FramePacket::V3(codec::v3::Packet::PublishAck(ack)) => {
                self.on_publish_ack(connection_id, ack.packet_id()).await
            }
            FramePacket::V5(codec::v5::Packet::PublishAck(ack)) => {
                self.on_publish_ack(connection_id, ack.packet_id()).await
            }
            FramePacket::V3(codec::v3::Packet::PublishReceived(rec)) => {
                self.on_publish_received(connection_id, rec.packet_id(), false)
                    .await
            }
            FramePacket::V5(codec::v5::Packet::PublishReceived(rec)) => {
                self.on_publish_received(
                    connection_id,
                    rec.packet_id(),
                    rec.reason_code().is_error(),
                )
                .await
            }
            FramePacket::V3(codec::v3::Packet::PublishRelease(rel)) => {
                self.on_publish_release(connection_id, rel.packet_id()).await
            }
            FramePacket::V5(codec::v5::Packet::PublishRelease(rel)) => {
                self.on_publish_release(connection_id, rel.packet_id()).await
            }
            FramePacket::V3(codec::v3::Packet::PublishComplete(comp)) => {
                self.on_publish_complete(connection_id, comp.packet_id())
                    .await
            }
            FramePacket::V5(codec::v5::Packet::PublishComplete(comp)) => {
                self.on_publish_complete(connection_id, comp.packet_id())
                    .await
            }
            FramePacket::V3(codec::v3::Packet::Subscribe(subscribe)) => {
                self.on_subscribe_v3(connection_id, subscribe).await
            }
            FramePacket::V5(codec::v5::Packet::Subscribe(subscribe)) => {
                self.on_subscribe_v5(connection_id, subscribe).await
            }
            FramePacket::V3(codec::v3::Packet::Unsubscribe(unsubscribe)) => {
                self.on_unsubscribe_v3(connection_id, unsubscribe).await
            }
            FramePacket::V5(codec::v5::Packet::Unsubscribe(unsubscribe)) => {
                self.on_unsubscribe_v5(connection_id, unsubscribe).await
            }
            FramePacket::V3(codec::v3::Packet::PingRequest(_)) => {
                self.send_to(
                    connection_id,
                    DispatcherToConnectionCmd::Send(FramePacket::V3(
                        codec::v3::Packet::PingResponse(codec::v3::PingResponsePacket::new()),
                    )),
                )
                .await
            }
            FramePacket::V5(codec::v5::Packet::PingRequest(_)) => {
                self.send_to(
                    connection_id,
                    DispatcherToConnectionCmd::Send(FramePacket::V5(
                        codec::v5::Packet::PingResponse(codec::v5::PingResponsePacket::new()),
                    )),
                )
                .await
            }
            FramePacket::V3(codec::v3::Packet::Disconnect(_)) => {
                self.on_disconnect_v3(connection_id).await
            }
            FramePacket::V5(codec::v5::Packet::Disconnect(disconnect)) => {
                self.on_disconnect_v5(connection_id, disconnect).await
            }
            packet => {
                // Server side packets a client must not send.
                log::warn!(
                    "dispatcher: Unexpected packet {:?} from connection {connection_id}",
                    packet.packet_type()
                );
                self.close_with_fault(connection_id, ReasonCode::ProtocolError)
                    .await;
                false
            }
        }
    }

    /// PUBACK from the subscriber finishes a QoS 1 delivery.
    async fn on_publish_ack(&mut self, connection_id: ConnectionId, packet_id: PacketId) -> bool {
        let Some(session) = self.session_of_connection_mut(connection_id) else {
            return false;
        };
        if !session.acknowledge_publish(packet_id) {
            log::warn!(
                "dispatcher: PUBACK for unknown packet id {} from {}",
                packet_id.value(),
                session.client_id()
            );
        }
        let packets = session.send_pending(Instant::now());
        self.send_all(connection_id, packets).await;
        true
    }

    /// PUBREC from the subscriber; a failure reason aborts the QoS 2 flow,
    /// otherwise a PUBREL answers it.
    async fn on_publish_received(
        &mut self,
        connection_id: ConnectionId,
        packet_id: PacketId,
        is_error: bool,
    ) -> bool {
        let Some(session) = self.session_of_connection_mut(connection_id) else {
            return false;
        };
        if is_error {
            session.acknowledge_publish(packet_id);
            let packets = session.send_pending(Instant::now());
            self.send_all(connection_id, packets).await;
            return true;
        }

        let known = session.publish_released(packet_id);
        let protocol_level = session.protocol_level();
        let pubrel = if known || protocol_level != ProtocolLevel::V5 {
            build_pubrel(protocol_level, packet_id)
        } else {
            FramePacket::V5(codec::v5::Packet::PublishRelease(
                codec::v5::PublishReleasePacket::with_reason(
                    packet_id,
                    ReasonCode::PacketIdentifierNotFound,
                ),
            ))
        };
        self.send_to(connection_id, DispatcherToConnectionCmd::Send(pubrel))
            .await;
        true
    }

    /// PUBCOMP from the subscriber finishes a QoS 2 delivery.
    async fn on_publish_complete(
        &mut self,
        connection_id: ConnectionId,
        packet_id: PacketId,
    ) -> bool {
        let Some(session) = self.session_of_connection_mut(connection_id) else {
            return false;
        };
        if !session.acknowledge_pubrel(packet_id) {
            log::warn!(
                "dispatcher: PUBCOMP for unknown packet id {} from {}",
                packet_id.value(),
                session.client_id()
            );
        }
        let packets = session.send_pending(Instant::now());
        self.send_all(connection_id, packets).await;
        true
    }

    /// Connection task reported its socket gone.
    async fn on_connection_gone(&mut self, connection_id: ConnectionId) {
        let Some(ctx) = self.connections.remove(&connection_id) else {
            return;
        };
        let Some(client_id) = ctx.client_id else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&client_id) else {
            return;
        };
        // A successor connection may have taken the session over already.
        if session.connection_id() != Some(connection_id) {
            return;
        }

        let now = Instant::now();
        session.detach(now);
        log::info!("dispatcher: Session {client_id} disconnected");

        // A will with no delay fires immediately; delayed wills and session
        // expiry are left to the housekeeper.
        if session.will().is_some_and(|will| will.delay_interval == 0) {
            if let Some(will) = session.take_will() {
                self.publish_will(&client_id, will).await;
            }
        }
        if self
            .sessions
            .get(&client_id)
            .is_some_and(|session| session.is_expired(now))
        {
            self.evict_session(&client_id).await;
        }
    }

    /// Send DISCONNECT to every connected session and stop.
    async fn shutdown(&mut self) {
        let reason = if self.config.general().server_reference().is_some() {
            ReasonCode::ServerMoved
        } else {
            ReasonCode::ServerShuttingDown
        };
        let connection_ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for connection_id in connection_ids {
            let protocol_level = self
                .connections
                .get(&connection_id)
                .map_or(ProtocolLevel::V311, |ctx| ctx.protocol_level);
            let packet = if protocol_level == ProtocolLevel::V5 {
                let mut disconnect = codec::v5::DisconnectPacket::new(reason);
                if let Some(server_reference) = self.config.general().server_reference() {
                    if let Ok(server_reference) = codec::StringData::from(server_reference) {
                        disconnect
                            .properties_mut()
                            .push(codec::Property::ServerReference(server_reference));
                    }
                }
                Some(FramePacket::V5(codec::v5::Packet::Disconnect(disconnect)))
            } else {
                None
            };
            self.send_to(connection_id, DispatcherToConnectionCmd::Close(packet))
                .await;
        }
    }

    /// Close a connection on a protocol fault raised in the dispatcher.
    pub(crate) async fn close_with_fault(
        &mut self,
        connection_id: ConnectionId,
        reason: ReasonCode,
    ) {
        let protocol_level = self
            .connections
            .get(&connection_id)
            .map_or(ProtocolLevel::V311, |ctx| ctx.protocol_level);
        let packet = if protocol_level == ProtocolLevel::V5 {
            Some(FramePacket::V5(codec::v5::Packet::Disconnect(
                codec::v5::DisconnectPacket::new(reason),
            )))
        } else {
            None
        };
        self.send_to(connection_id, DispatcherToConnectionCmd::Close(packet))
            .await;
    }

    /// Session attached to a connection, if the handshake completed.
    pub(crate) fn session_of_connection_mut(
        &mut self,
        connection_id: ConnectionId,
    ) -> Option<&mut Session> {
        let client_id = self
            .connections
            .get(&connection_id)?
            .client_id
            .as_ref()?
            .clone();
        self.sessions.get_mut(&client_id)
    }

    pub(crate) async fn send_to(
        &self,
        connection_id: ConnectionId,
        cmd: DispatcherToConnectionCmd,
    ) -> bool {
        let Some(ctx) = self.connections.get(&connection_id) else {
            log::warn!("dispatcher: No such connection: {connection_id}");
            return false;
        };
        if let Err(err) = ctx.sender.send(cmd) {
            log::error!("dispatcher: Failed to send to connection {connection_id}: {err}");
            return false;
        }
        true
    }

    pub(crate) async fn send_all(
        &self,
        connection_id: ConnectionId,
        packets: Vec<FramePacket>,
    ) {
        for packet in packets {
            self.send_to(connection_id, DispatcherToConnectionCmd::Send(packet))
                .await;
        }
    }

    pub(crate) fn next_delivery_tick(&mut self) -> DeliveryTick {
        self.delivery_tick += 1;
        self.delivery_tick
    }
}
