// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind};

/// Security section in config.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Security {
    /// Accept CONNECT packets that carry no username/password.
    ///
    /// Default is true.
    #[serde(default = "Security::default_allow_anonymous")]
    allow_anonymous: bool,

    /// Password file with one `username:password` pair per line.
    ///
    /// When set, CONNECT packets carrying credentials are checked against
    /// this file. Empty path disables file based authentication.
    #[serde(default = "Security::default_password_file")]
    password_file: PathBuf,
}

impl Security {
    #[must_use]
    pub const fn default_allow_anonymous() -> bool {
        true
    }

    #[must_use]
    pub fn default_password_file() -> PathBuf {
        PathBuf::new()
    }

    #[must_use]
    pub const fn allow_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    #[must_use]
    pub fn password_file(&self) -> Option<&Path> {
        if self.password_file.as_os_str().is_empty() {
            None
        } else {
            Some(&self.password_file)
        }
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if the password file is configured but missing.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(password_file) = self.password_file() {
            if !password_file.exists() {
                return Err(Error::from_string(
                    ErrorKind::ConfigError,
                    format!("Password file not found: {password_file:?}"),
                ));
            }
        }
        Ok(())
    }
}

impl Default for Security {
    fn default() -> Self {
        Self {
            allow_anonymous: Self::default_allow_anonymous(),
            password_file: Self::default_password_file(),
        }
    }
}
