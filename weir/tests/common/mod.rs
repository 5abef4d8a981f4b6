// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

#![allow(dead_code)]

mod client;

pub use client::TestClient;

use std::net::SocketAddr;

use weir::config::Config;
use weir::hooks::Hooks;
use weir::server::{start, ServerHandle};

/// A broker bound to an ephemeral port on localhost.
pub struct Broker {
    pub addr: SocketAddr,
    handle: Option<ServerHandle>,
}

pub const DEFAULT_CONFIG: &str = r#"
[[listeners]]
protocol = "mqtt"
address = "127.0.0.1:0"

[security]
allow_anonymous = true

[log]
console_log = false
"#;

impl Broker {
    /// Start a broker from a TOML config snippet. The first listener
    /// should bind `127.0.0.1:0`.
    pub async fn start(config_content: &str) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let config: Config = toml::from_str(config_content).expect("invalid test config");
        config.validate().expect("invalid test config");
        let handle = start(config, Hooks::default())
            .await
            .expect("failed to start broker");
        let addr = handle.local_addr().expect("no listener address");
        Self {
            addr,
            handle: Some(handle),
        }
    }

    pub async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
    }
}
