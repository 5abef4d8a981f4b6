// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Binds one `[[listeners]]` entry and spawns a connection task per
//! accepted socket.

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, Sender};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::commands::ConnectionToDispatcherCmd;
use crate::config;
use crate::connection::{Connection, ConnectionConfig};
use crate::error::{Error, ErrorKind};
use crate::hooks::BytesMetrics;
use crate::stream::Stream;

/// Capacity of the per-connection command channels.
pub const CHANNEL_CAPACITY: usize = 16;

pub struct Listener {
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    max_connections: usize,
    active_connections: Arc<AtomicUsize>,

    connection_config: ConnectionConfig,
    dispatcher_sender: Sender<ConnectionToDispatcherCmd>,
    metrics: Arc<dyn BytesMetrics>,
    next_connection_id: Arc<AtomicU64>,
}

impl Listener {
    /// Bind the listener socket and prepare the TLS acceptor if the
    /// protocol asks for one.
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound or the key store
    /// cannot be loaded.
    pub async fn bind(
        listener_config: &config::Listener,
        connection_config: ConnectionConfig,
        dispatcher_sender: Sender<ConnectionToDispatcherCmd>,
        metrics: Arc<dyn BytesMetrics>,
        next_connection_id: Arc<AtomicU64>,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(listener_config.address()).await?;
        let tls_acceptor = match listener_config.protocol() {
            config::Protocol::Mqtt => None,
            config::Protocol::Mqtts => Some(load_tls_acceptor(listener_config.key_store())?),
        };
        log::info!("listener: Listening at {}", listener_config.address());
        Ok(Self {
            listener,
            tls_acceptor,
            max_connections: listener_config.max_connections(),
            active_connections: Arc::new(AtomicUsize::new(0)),
            connection_config,
            dispatcher_sender,
            metrics,
            next_connection_id,
        })
    }

    /// The actual bound address, useful when the config asked for port 0.
    ///
    /// # Errors
    ///
    /// Returns error if the socket is gone.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run_loop(self) {
        loop {
            let (socket, address) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::error!("listener: accept() failed: {err}");
                    continue;
                }
            };
            log::info!("listener: New connection from {address}");

            if self.max_connections > 0
                && self.active_connections.load(Ordering::Relaxed) >= self.max_connections
            {
                log::warn!("listener: Connection limit reached, drop {address}");
                continue;
            }

            let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
            let (reply_sender, reply_receiver) = mpsc::unbounded_channel();
            let connection_config = self.connection_config;
            let dispatcher_sender = self.dispatcher_sender.clone();
            let metrics = Arc::clone(&self.metrics);
            let tls_acceptor = self.tls_acceptor.clone();
            let active_connections = Arc::clone(&self.active_connections);

            active_connections.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                let stream = match tls_acceptor {
                    None => Some(Stream::Mqtt(socket)),
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(tls_stream) => Some(Stream::Mqtts(Box::new(tls_stream))),
                        Err(err) => {
                            log::warn!("listener: TLS handshake with {address} failed: {err}");
                            None
                        }
                    },
                };
                if let Some(stream) = stream {
                    let connection = Connection::new(
                        connection_id,
                        stream,
                        connection_config,
                        dispatcher_sender,
                        reply_receiver,
                        reply_sender,
                        metrics,
                    );
                    connection.run_loop().await;
                }
                active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

/// Load a PEM key store holding the certificate chain and the private key.
fn load_tls_acceptor(key_store: &std::path::Path) -> Result<TlsAcceptor, Error> {
    let file = File::open(key_store).map_err(|err| {
        Error::from_string(
            ErrorKind::CertError,
            format!("Failed to open key store {key_store:?}: {err}"),
        )
    })?;
    let mut reader = BufReader::new(file);

    let mut certs: Vec<CertificateDer> = Vec::new();
    let mut key: Option<PrivateKeyDer> = None;
    for item in rustls_pemfile::read_all(&mut reader) {
        match item.map_err(|err| {
            Error::from_string(
                ErrorKind::CertError,
                format!("Invalid key store {key_store:?}: {err}"),
            )
        })? {
            rustls_pemfile::Item::X509Certificate(cert) => certs.push(cert),
            rustls_pemfile::Item::Pkcs1Key(k) => key = Some(PrivateKeyDer::Pkcs1(k)),
            rustls_pemfile::Item::Pkcs8Key(k) => key = Some(PrivateKeyDer::Pkcs8(k)),
            rustls_pemfile::Item::Sec1Key(k) => key = Some(PrivateKeyDer::Sec1(k)),
            _ => {}
        }
    }
    let key = key.ok_or_else(|| {
        Error::from_string(
            ErrorKind::CertError,
            format!("No private key in key store {key_store:?}"),
        )
    })?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| {
            Error::from_string(ErrorKind::CertError, format!("Invalid certificate: {err}"))
        })?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
