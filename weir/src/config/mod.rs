// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;

use crate::error::Error;

mod general;
mod listener;
mod log;
mod mqtt;
mod security;

pub use self::log::{Log, LogLevel};
pub use general::General;
pub use listener::{Listener, Protocol};
pub use mqtt::Mqtt;
pub use security::Security;

/// Server main config.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    general: General,

    #[serde(default = "Listener::default_listeners")]
    listeners: Vec<Listener>,

    #[serde(default)]
    mqtt: Mqtt,

    #[serde(default)]
    security: Security,

    #[serde(default)]
    log: Log,
}

impl Config {
    #[must_use]
    pub const fn general(&self) -> &General {
        &self.general
    }

    #[must_use]
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn listeners_mut(&mut self) -> &mut Vec<Listener> {
        &mut self.listeners
    }

    #[must_use]
    pub const fn mqtt(&self) -> &Mqtt {
        &self.mqtt
    }

    #[must_use]
    pub const fn security(&self) -> &Security {
        &self.security
    }

    #[must_use]
    pub const fn log(&self) -> &Log {
        &self.log
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some options in config are invalid.
    pub fn validate(&self) -> Result<(), Error> {
        self.general.validate()?;

        for listener in &self.listeners {
            listener.validate()?;
        }

        self.mqtt.validate()?;
        self.security.validate()?;
        self.log.validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: General::default(),
            listeners: Listener::default_listeners(),
            mqtt: Mqtt::default(),
            security: Security::default(),
            log: Log::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let content = r#"
[general]
connect_timeout = 5

[[listeners]]
protocol = "mqtt"
address = "127.0.0.1:1883"

[mqtt]
maximum_qos = 1
receive_maximum = 16

[security]
allow_anonymous = true

[log]
log_level = "debug"
"#;
        let config: Config = toml::from_str(content).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.general().connect_timeout(), 5);
        assert_eq!(config.mqtt().receive_maximum(), 16);
        assert_eq!(config.mqtt().maximum_qos(), codec::QoS::AtLeastOnce);
        assert_eq!(config.log().log_level(), LogLevel::Debug);
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listeners().len(), 1);
        assert_eq!(config.listeners()[0].address(), "0.0.0.0:1883");
    }
}
