// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// General section in config.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct General {
    /// Seconds a fresh connection may take to deliver its CONNECT packet.
    ///
    /// If the Server does not receive a CONNECT within a reasonable amount
    /// of time after the network connection is established, it closes the
    /// connection. Set to 0 to disable.
    ///
    /// Default is 10s.
    #[serde(default = "General::default_connect_timeout")]
    connect_timeout: u64,

    /// For MQTT v5 clients, it is possible to have the server send a
    /// "server keep alive" value that overrides the keep alive set by
    /// the client.
    ///
    /// Clients asking for a larger keep alive are told to use this value
    /// instead. Set to 0 to accept any client keep alive.
    ///
    /// Default value is 0.
    #[serde(default = "General::default_maximum_keep_alive")]
    maximum_keep_alive: u16,

    /// Redirection target sent to connected clients when the broker shuts
    /// down, together with reason code `ServerMoved`.
    ///
    /// Empty string disables redirection and shutdown uses
    /// `ServerShuttingDown`.
    #[serde(default = "General::default_server_reference")]
    server_reference: String,
}

impl General {
    #[must_use]
    pub const fn default_connect_timeout() -> u64 {
        10
    }

    #[must_use]
    pub const fn default_maximum_keep_alive() -> u16 {
        0
    }

    #[must_use]
    pub fn default_server_reference() -> String {
        String::new()
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> u64 {
        self.connect_timeout
    }

    #[must_use]
    pub const fn maximum_keep_alive(&self) -> u16 {
        self.maximum_keep_alive
    }

    #[must_use]
    pub fn server_reference(&self) -> Option<&str> {
        if self.server_reference.is_empty() {
            None
        } else {
            Some(&self.server_reference)
        }
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some options are out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.connect_timeout > 3600 {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!(
                    "connect_timeout shall be less than an hour, got {}",
                    self.connect_timeout
                ),
            ));
        }
        Ok(())
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            connect_timeout: Self::default_connect_timeout(),
            maximum_keep_alive: Self::default_maximum_keep_alive(),
            server_reference: Self::default_server_reference(),
        }
    }
}
