// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::FramePacket;
use tokio::sync::mpsc::UnboundedSender;

use crate::types::ConnectionId;

/// Commands from a connection task to the dispatcher.
#[derive(Debug)]
pub enum ConnectionToDispatcherCmd {
    /// New socket accepted; registers the reply channel.
    ///
    /// The reply direction is unbounded: the dispatcher must never block
    /// on a slow connection while holding the broker tables.
    Connect(ConnectionId, UnboundedSender<DispatcherToConnectionCmd>),

    /// A complete, decoded packet arrived on the connection.
    ///
    /// Topic aliases are already resolved by the connection.
    Packet(ConnectionId, FramePacket),

    /// The socket is gone, either by transport fault or after a
    /// server-initiated close completed.
    Disconnected(ConnectionId),
}

/// Commands from the dispatcher to a connection task.
#[derive(Debug)]
pub enum DispatcherToConnectionCmd {
    /// Result of the CONNECT handshake.
    ///
    /// `keep_alive` is the effective keep alive in seconds after applying
    /// the server override; the connection arms its timer with it.
    /// When `accepted` is false the connection closes after writing the
    /// packet.
    ConnectAck {
        packet: FramePacket,
        keep_alive: u16,
        accepted: bool,
    },

    /// Write one packet to the peer.
    Send(FramePacket),

    /// Write the optional final packet, then close the connection.
    Close(Option<FramePacket>),
}
