// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::QoS;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// Protocol capabilities advertised in CONNACK and enforced on every
/// connection.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Mqtt {
    /// Upper bound on the session expiry interval a client may request,
    /// in seconds. Requests above the cap are clamped and the clamped
    /// value is returned in CONNACK.
    ///
    /// Default is 0xFFFFFFFF, sessions may be kept indefinitely.
    #[serde(default = "Mqtt::default_maximum_session_expiry_interval")]
    maximum_session_expiry_interval: u32,

    /// Number of concurrent unacknowledged QoS 1/QoS 2 publishes the broker
    /// accepts from one client, and the default window granted towards one
    /// client.
    ///
    /// Default is 65535.
    #[serde(default = "Mqtt::default_receive_maximum")]
    receive_maximum: u16,

    /// Set the maximum QoS supported.
    ///
    /// Clients publishing at a QoS higher than this are disconnected with
    /// reason `QoSNotSupported`. Available values are 0, 1 and 2.
    ///
    /// Default is 2.
    #[serde(default = "Mqtt::default_maximum_qos")]
    maximum_qos: QoS,

    /// Whether retained messages are supported.
    ///
    /// When false, a PUBLISH with the retain flag set is rejected with
    /// reason `RetainNotSupported`, and so is a CONNECT with a retained
    /// will.
    ///
    /// Default is true.
    #[serde(default = "Mqtt::default_retain_available")]
    retain_available: bool,

    /// Maximum size of a control packet in bytes, applied to the full
    /// packet, not just the payload. MQTT imposes a hard limit of
    /// 268435455 bytes.
    ///
    /// Default value is 0, which means that all valid MQTT packets are
    /// accepted.
    #[serde(default = "Mqtt::default_maximum_packet_size")]
    maximum_packet_size: u32,

    /// Highest topic alias value accepted from clients. 0 disables topic
    /// aliases.
    ///
    /// Default is 65535.
    #[serde(default = "Mqtt::default_topic_alias_maximum")]
    topic_alias_maximum: u16,

    /// Whether topic filters may contain `+` and `#` wildcards.
    ///
    /// Default is true.
    #[serde(default = "Mqtt::default_available")]
    wildcard_subscription_available: bool,

    /// Whether SUBSCRIBE packets may carry subscription identifiers.
    ///
    /// Default is true.
    #[serde(default = "Mqtt::default_available")]
    subscription_identifier_available: bool,

    /// Whether `$share/{group}/{filter}` subscriptions are supported.
    ///
    /// Default is true.
    #[serde(default = "Mqtt::default_available")]
    shared_subscription_available: bool,

    /// Response information string returned to v5 clients that request it
    /// in CONNECT.
    ///
    /// Default is empty, no response information is returned.
    #[serde(default = "Mqtt::default_response_information")]
    response_information: String,
}

impl Mqtt {
    #[must_use]
    pub const fn default_maximum_session_expiry_interval() -> u32 {
        u32::MAX
    }

    #[must_use]
    pub const fn default_receive_maximum() -> u16 {
        u16::MAX
    }

    #[must_use]
    pub const fn default_maximum_qos() -> QoS {
        QoS::ExactOnce
    }

    #[must_use]
    pub const fn default_retain_available() -> bool {
        true
    }

    #[must_use]
    pub const fn default_maximum_packet_size() -> u32 {
        0
    }

    #[must_use]
    pub const fn default_topic_alias_maximum() -> u16 {
        u16::MAX
    }

    #[must_use]
    pub const fn default_available() -> bool {
        true
    }

    #[must_use]
    pub fn default_response_information() -> String {
        String::new()
    }

    #[must_use]
    pub const fn maximum_session_expiry_interval(&self) -> u32 {
        self.maximum_session_expiry_interval
    }

    #[must_use]
    pub const fn receive_maximum(&self) -> u16 {
        self.receive_maximum
    }

    #[must_use]
    pub const fn maximum_qos(&self) -> QoS {
        self.maximum_qos
    }

    #[must_use]
    pub const fn retain_available(&self) -> bool {
        self.retain_available
    }

    #[must_use]
    pub const fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    #[must_use]
    pub const fn topic_alias_maximum(&self) -> u16 {
        self.topic_alias_maximum
    }

    #[must_use]
    pub const fn wildcard_subscription_available(&self) -> bool {
        self.wildcard_subscription_available
    }

    #[must_use]
    pub const fn subscription_identifier_available(&self) -> bool {
        self.subscription_identifier_available
    }

    #[must_use]
    pub const fn shared_subscription_available(&self) -> bool {
        self.shared_subscription_available
    }

    #[must_use]
    pub fn response_information(&self) -> Option<&str> {
        if self.response_information.is_empty() {
            None
        } else {
            Some(&self.response_information)
        }
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some options are out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.receive_maximum == 0 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "receive_maximum shall not be 0",
            ));
        }
        if self.maximum_packet_size != 0 && self.maximum_packet_size < 20 {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!(
                    "maximum_packet_size below 20 bytes interferes with ordinary \
                     client operation, got {}",
                    self.maximum_packet_size
                ),
            ));
        }
        Ok(())
    }
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            maximum_session_expiry_interval: Self::default_maximum_session_expiry_interval(),
            receive_maximum: Self::default_receive_maximum(),
            maximum_qos: Self::default_maximum_qos(),
            retain_available: Self::default_retain_available(),
            maximum_packet_size: Self::default_maximum_packet_size(),
            topic_alias_maximum: Self::default_topic_alias_maximum(),
            wildcard_subscription_available: Self::default_available(),
            subscription_identifier_available: Self::default_available(),
            shared_subscription_available: Self::default_available(),
            response_information: Self::default_response_information(),
        }
    }
}
