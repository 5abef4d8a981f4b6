// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{Bytes, Properties, QoS};
use std::time::Instant;

/// Identifies one accepted socket for the lifetime of the process.
pub type ConnectionId = u64;

/// Monotonic counter stamped on shared-subscription deliveries, used for
/// round-robin fairness. See `Session::share_delivered`.
pub type DeliveryTick = u64;

/// An application message, normalized across protocol levels.
///
/// Carries everything the broker needs to queue, retain and re-emit a
/// publish. `properties` is empty for messages received from a protocol
/// level 4 client.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
    pub properties: Properties,

    /// When the broker received the message. Message expiry is decremented
    /// by the residence time on delivery [MQTT-3.3.2-6].
    pub received_at: Instant,
}

impl Message {
    /// Remaining message expiry at `now`, or `None` if the message does not
    /// expire.
    #[must_use]
    pub fn remaining_expiry(&self, now: Instant) -> Option<u32> {
        let interval = self.properties.message_expiry_interval()?;
        let elapsed = now.duration_since(self.received_at).as_secs();
        #[allow(clippy::cast_possible_truncation)]
        let remaining = u64::from(interval).saturating_sub(elapsed) as u32;
        Some(remaining)
    }

    /// Returns true if a message expiry interval is set and has elapsed.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.remaining_expiry(now) == Some(0)
    }
}

/// Will message taken from a CONNECT packet, dispatched by the broker on
/// abnormal disconnect.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,

    /// Seconds to wait after disconnect before publishing the will.
    pub delay_interval: u32,

    /// Will properties, forwarded on the published message (minus the
    /// will delay interval).
    pub properties: Properties,
}
