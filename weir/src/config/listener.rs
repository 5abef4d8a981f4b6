// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind};

/// Transport protocol of one listener.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain MQTT over TCP.
    Mqtt,

    /// MQTT over TLS.
    Mqtts,
}

/// One `[[listeners]]` entry in config.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Listener {
    /// Binding protocol.
    ///
    /// Default is `mqtt`.
    #[serde(default = "Listener::default_protocol")]
    protocol: Protocol,

    /// Binding address, e.g. `0.0.0.0:1883`.
    #[serde(default = "Listener::default_address")]
    address: String,

    /// Maximum number of concurrent client connections accepted on this
    /// listener. 0 means unlimited.
    ///
    /// Default is 0.
    #[serde(default = "Listener::default_max_connections")]
    max_connections: usize,

    /// PEM file holding the server certificate chain followed by the
    /// private key. Required for `mqtts`.
    #[serde(default = "Listener::default_key_store")]
    key_store: PathBuf,
}

impl Listener {
    #[must_use]
    pub const fn default_protocol() -> Protocol {
        Protocol::Mqtt
    }

    #[must_use]
    pub fn default_address() -> String {
        "0.0.0.0:1883".to_string()
    }

    #[must_use]
    pub const fn default_max_connections() -> usize {
        0
    }

    #[must_use]
    pub fn default_key_store() -> PathBuf {
        PathBuf::new()
    }

    #[must_use]
    pub fn default_listeners() -> Vec<Self> {
        vec![Self {
            protocol: Self::default_protocol(),
            address: Self::default_address(),
            max_connections: Self::default_max_connections(),
            key_store: Self::default_key_store(),
        }]
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.protocol = protocol;
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_address(&mut self, address: &str) {
        self.address = address.to_string();
    }

    #[must_use]
    pub const fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn set_max_connections(&mut self, max_connections: usize) {
        self.max_connections = max_connections;
    }

    #[must_use]
    pub fn key_store(&self) -> &Path {
        &self.key_store
    }

    pub fn set_key_store(&mut self, key_store: &Path) {
        self.key_store = key_store.to_path_buf();
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if the address is malformed or the key store file
    /// is missing for a TLS listener.
    pub fn validate(&self) -> Result<(), Error> {
        if self.address.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("Invalid listener address: {}", self.address),
            ));
        }
        if self.protocol == Protocol::Mqtts && !self.key_store.exists() {
            return Err(Error::from_string(
                ErrorKind::CertError,
                format!("Key store file not found: {:?}", self.key_store),
            ));
        }
        Ok(())
    }
}
