// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use crate::error::Error;

/// Each Stream represents a duplex socket connection to a client.
#[derive(Debug)]
pub enum Stream {
    Mqtt(TcpStream),
    Mqtts(Box<TlsStream<TcpStream>>),
}

impl Stream {
    /// Read from stream into `buf`, returns number of bytes read.
    ///
    /// Returning 0 means the peer closed the connection.
    ///
    /// # Errors
    ///
    /// Returns error if stream/socket gets error.
    pub async fn read_buf(&mut self, buf: &mut Vec<u8>) -> Result<usize, Error> {
        match self {
            Self::Mqtt(tcp_stream) => Ok(tcp_stream.read_buf(buf).await?),
            Self::Mqtts(tls_stream) => Ok(tls_stream.read_buf(buf).await?),
        }
    }

    /// Write the whole buffer to stream.
    ///
    /// # Errors
    ///
    /// Returns error if socket/stream gets error.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self {
            Self::Mqtt(tcp_stream) => Ok(tcp_stream.write_all(buf).await?),
            Self::Mqtts(tls_stream) => Ok(tls_stream.write_all(buf).await?),
        }
    }
}
