// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Extension hooks supplied by the embedding host.
//!
//! Every hook is invoked inline from the dispatcher task and must not
//! block for long. Defaults allow anonymous access and do nothing.

use codec::FramePacket;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, ErrorKind};

/// Checks username/password pairs carried in CONNECT packets.
pub trait Authenticator: Send + Sync {
    /// Returns true if the credentials are acceptable.
    ///
    /// # Errors
    ///
    /// Returns error on internal failures; the connection is closed with
    /// reason `ImplementationSpecificError`.
    fn authenticate(&self, username: Option<&str>, password: Option<&[u8]>)
        -> Result<bool, Error>;
}

/// Outcome of one enhanced authentication round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// More AUTH rounds are required; optional challenge data is sent to
    /// the client with reason `ContinueAuthentication`.
    NeedsMore(Option<Vec<u8>>),

    /// Authentication succeeded; optional final data is attached to the
    /// CONNACK.
    Success(Option<Vec<u8>>),

    /// Authentication failed; the connection is closed with reason
    /// `NotAuthorized`.
    Failed,
}

/// Drives one v5 enhanced authentication method, e.g. `SCRAM-SHA-1`.
pub trait EnhancedAuthenticator: Send + Sync {
    /// Handle one round of client authentication data.
    fn auth_exchange(&self, client_id: &str, data: Option<&[u8]>) -> AuthDecision;
}

/// Per-operation access control.
pub trait Authorizer: Send + Sync {
    /// Called for every inbound PUBLISH and every SUBSCRIBE tuple.
    fn authorize(&self, client_id: &str, topic: &str, is_subscription: bool) -> bool;
}

/// Observes every successfully dispatched inbound packet.
pub trait PacketInterceptor: Send + Sync {
    fn packet_received(&self, client_id: &str, packet: &FramePacket);
}

/// Raw socket byte counters.
pub trait BytesMetrics: Send + Sync {
    fn received(&self, client_id: &str, n: usize);
    fn sent(&self, client_id: &str, n: usize);
}

/// Best-effort durable store, keyed by client id.
pub trait Persistence: Send + Sync {
    fn persist_session(&self, client_id: &str, session_expiry_interval: u32);
    fn persist_subscription(&self, client_id: &str, filter: &str);
    fn remove_subscription(&self, client_id: &str, filter: &str);
}

/// Accepts every connection attempt, subject to `allow_anonymous`.
pub struct AllowAuthenticator {
    allow_anonymous: bool,
}

impl AllowAuthenticator {
    #[must_use]
    pub const fn new(allow_anonymous: bool) -> Self {
        Self { allow_anonymous }
    }
}

impl Authenticator for AllowAuthenticator {
    fn authenticate(
        &self,
        username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> Result<bool, Error> {
        Ok(self.allow_anonymous || username.is_some())
    }
}

/// Checks credentials against a `username:password` file.
pub struct FileAuthenticator {
    allow_anonymous: bool,
    entries: HashMap<String, String>,
}

impl FileAuthenticator {
    /// Load a password file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read.
    pub fn load(path: &Path, allow_anonymous: bool) -> Result<Self, Error> {
        let file = File::open(path).map_err(|err| {
            Error::from_string(
                ErrorKind::ConfigError,
                format!("Failed to open password file {path:?}, {err}"),
            )
        })?;
        let mut entries = HashMap::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((username, password)) = line.split_once(':') {
                entries.insert(username.to_string(), password.to_string());
            }
        }
        Ok(Self {
            allow_anonymous,
            entries,
        })
    }
}

impl Authenticator for FileAuthenticator {
    fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<bool, Error> {
        match username {
            None => Ok(self.allow_anonymous),
            Some(username) => Ok(self
                .entries
                .get(username)
                .is_some_and(|expected| Some(expected.as_bytes()) == password)),
        }
    }
}

struct AllowAllAuthorizer;

impl Authorizer for AllowAllAuthorizer {
    fn authorize(&self, _client_id: &str, _topic: &str, _is_subscription: bool) -> bool {
        true
    }
}

struct NoopInterceptor;

impl PacketInterceptor for NoopInterceptor {
    fn packet_received(&self, _client_id: &str, _packet: &FramePacket) {}
}

struct NoopMetrics;

impl BytesMetrics for NoopMetrics {
    fn received(&self, _client_id: &str, _n: usize) {}
    fn sent(&self, _client_id: &str, _n: usize) {}
}

struct NoopPersistence;

impl Persistence for NoopPersistence {
    fn persist_session(&self, _client_id: &str, _session_expiry_interval: u32) {}
    fn persist_subscription(&self, _client_id: &str, _filter: &str) {}
    fn remove_subscription(&self, _client_id: &str, _filter: &str) {}
}

/// All host-supplied extension points in one bundle.
pub struct Hooks {
    pub authenticator: Box<dyn Authenticator>,

    /// Enhanced authentication providers, keyed by authentication method
    /// name from the CONNECT properties.
    pub enhanced_authenticators: HashMap<String, Box<dyn EnhancedAuthenticator>>,

    pub authorizer: Box<dyn Authorizer>,
    pub interceptor: Box<dyn PacketInterceptor>,
    pub metrics: Arc<dyn BytesMetrics>,
    pub persistence: Box<dyn Persistence>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            authenticator: Box::new(AllowAuthenticator::new(true)),
            enhanced_authenticators: HashMap::new(),
            authorizer: Box::new(AllowAllAuthorizer),
            interceptor: Box::new(NoopInterceptor),
            metrics: Arc::new(NoopMetrics),
            persistence: Box::new(NoopPersistence),
        }
    }
}

impl Hooks {
    /// Build hooks from the `[security]` config section.
    ///
    /// # Errors
    ///
    /// Returns error if the password file cannot be loaded.
    pub fn from_security_config(security: &crate::config::Security) -> Result<Self, Error> {
        let authenticator: Box<dyn Authenticator> = match security.password_file() {
            Some(path) => Box::new(FileAuthenticator::load(path, security.allow_anonymous())?),
            None => Box::new(AllowAuthenticator::new(security.allow_anonymous())),
        };
        Ok(Self {
            authenticator,
            ..Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_authenticator() {
        let auth = AllowAuthenticator::new(false);
        assert_eq!(auth.authenticate(None, None).unwrap(), false);
        assert_eq!(auth.authenticate(Some("u"), None).unwrap(), true);

        let auth = AllowAuthenticator::new(true);
        assert_eq!(auth.authenticate(None, None).unwrap(), true);
    }
}
