// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Server entry point: CLI parsing, config loading, runtime wiring and
//! signal handling.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{Config, Protocol};
use crate::connection::ConnectionConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, ErrorKind};
use crate::hooks::Hooks;
use crate::listener::{Listener, CHANNEL_CAPACITY};
use crate::log::init_log;

/// Config file used when `-c` is not given and the file exists.
pub const DEFAULT_CONFIG: &str = "/etc/weir/weir.toml";

#[derive(Debug, Parser)]
#[command(
    name = "weir",
    version,
    about = "MQTT broker for protocol levels 4 and 5",
    disable_help_flag = true
)]
struct Cli {
    /// Print help.
    #[arg(long, action = clap::ArgAction::HelpLong)]
    help: Option<bool>,

    /// Specify config file path.
    #[arg(short = 'c', long, value_name = "config_file")]
    config: Option<PathBuf>,

    /// Test config file and exit.
    #[arg(short = 't', long)]
    test: bool,

    /// Binding address, overrides the first listener in config.
    #[arg(short = 'h', long, value_name = "addr")]
    host: Option<String>,

    /// Binding port, overrides the first listener in config.
    #[arg(short = 'p', long, value_name = "port")]
    port: Option<u16>,

    /// Connection limit of the first listener.
    #[arg(long, value_name = "n")]
    max_connections: Option<usize>,

    /// PEM file with certificate chain and private key; switches the
    /// first listener to TLS.
    #[arg(long, value_name = "path")]
    key_store: Option<PathBuf>,

    /// Key store password. PEM key stores are unencrypted, the value is
    /// accepted for CLI compatibility only.
    #[arg(long = "key-store-psw", value_name = "pw")]
    key_store_psw: Option<String>,
}

/// A running broker: bound listeners plus the dispatcher task.
pub struct ServerHandle {
    addrs: Vec<SocketAddr>,
    shutdown_sender: mpsc::Sender<()>,
    dispatcher_task: JoinHandle<()>,
    listener_tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Bound address of the first listener.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addrs.first().copied()
    }

    /// Disconnect all clients and stop the broker.
    pub async fn shutdown(self) {
        for task in &self.listener_tasks {
            task.abort();
        }
        if self.shutdown_sender.send(()).await.is_ok() {
            let _ = self.dispatcher_task.await;
        }
    }
}

/// Start the broker with `config` and `hooks`, returning once every
/// listener is bound.
///
/// # Errors
///
/// Returns error if a listener cannot be bound.
pub async fn start(config: Config, hooks: Hooks) -> Result<ServerHandle, Error> {
    let (dispatcher_sender, dispatcher_receiver) = mpsc::channel(CHANNEL_CAPACITY);
    let (shutdown_sender, shutdown_receiver) = mpsc::channel(1);

    let metrics = Arc::clone(&hooks.metrics);
    let mut dispatcher = Dispatcher::new(config.clone(), hooks, dispatcher_receiver, shutdown_receiver);
    let dispatcher_task = tokio::spawn(async move {
        dispatcher.run_loop().await;
    });

    let connection_config = ConnectionConfig {
        connect_timeout: config.general().connect_timeout(),
        maximum_packet_size: config.mqtt().maximum_packet_size(),
        topic_alias_maximum: config.mqtt().topic_alias_maximum(),
    };
    let next_connection_id = Arc::new(AtomicU64::new(0));

    let mut addrs = Vec::new();
    let mut listener_tasks = Vec::new();
    for listener_config in config.listeners() {
        let listener = Listener::bind(
            listener_config,
            connection_config,
            dispatcher_sender.clone(),
            Arc::clone(&metrics),
            Arc::clone(&next_connection_id),
        )
        .await?;
        addrs.push(listener.local_addr()?);
        listener_tasks.push(tokio::spawn(listener.run_loop()));
    }

    Ok(ServerHandle {
        addrs,
        shutdown_sender,
        dispatcher_task,
        listener_tasks,
    })
}

/// `ServerContext` runs the broker until a termination signal arrives.
#[allow(clippy::module_name_repetitions)]
pub struct ServerContext {
    config: Config,
}

impl ServerContext {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Block on the runtime until the server is asked to stop.
    ///
    /// # Errors
    ///
    /// Returns error if the server fails to start.
    pub fn run_loop(self, runtime: &Runtime) -> Result<(), Error> {
        runtime.block_on(async move {
            let hooks = Hooks::from_security_config(self.config.security())?;
            let handle = start(self.config, hooks).await?;
            wait_for_signal().await;
            log::info!("server: Termination signal received");
            handle.shutdown().await;
            Ok(())
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            log::error!("server: Failed to install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Entry point of server.
///
/// # Errors
///
/// Returns error if config is invalid or the server fails to start.
pub fn run_server() -> Result<(), Error> {
    let cli = Cli::parse();

    let mut config = if let Some(config_file) = cli
        .config
        .clone()
        .or_else(|| PathBuf::from(DEFAULT_CONFIG).exists().then(|| PathBuf::from(DEFAULT_CONFIG)))
    {
        let content = std::fs::read_to_string(&config_file)?;
        let config: Config = toml::from_str(&content).map_err(|err| {
            Error::from_string(
                ErrorKind::ConfigError,
                format!("Invalid config file {config_file:?}: {err}"),
            )
        })?;
        config
    } else {
        Config::default()
    };

    apply_cli_overrides(&mut config, &cli);
    config.validate()?;

    if cli.test {
        println!("The configuration file syntax is Ok");
        return Ok(());
    }

    init_log(config.log())?;

    let runtime = Runtime::new()?;
    ServerContext::new(config).run_loop(&runtime)
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    let Some(listener) = config.listeners_mut().first_mut() else {
        return;
    };
    if cli.host.is_some() || cli.port.is_some() {
        let host = cli.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
        let port = cli.port.unwrap_or(1883);
        listener.set_address(&format!("{host}:{port}"));
    }
    if let Some(max_connections) = cli.max_connections {
        listener.set_max_connections(max_connections);
    }
    if let Some(key_store) = &cli.key_store {
        listener.set_key_store(key_store);
        listener.set_protocol(Protocol::Mqtts);
    }
    if cli.key_store_psw.is_some() {
        log::warn!("server: --key-store-psw is ignored for PEM key stores");
    }
}
